//! X.691 PER length determinants as used by MCS Send-Data PDUs and GCC.

use crate::error::{RdpError, Result};
use crate::stream::WireBuffer;

/// Largest length the two-byte form can carry.
pub const MAX_LENGTH: usize = 0x3FFF;

/// Read a length determinant.
///
/// ```text
/// 0xxxxxxx             len < 128
/// 10xxxxxx xxxxxxxx    len < 16384
/// 11xxxxxx             fragmented (X.691 11.9.3.8), rejected
/// ```
pub fn read_length(s: &mut WireBuffer) -> Result<usize> {
    let first = s.read_u8()?;
    match first & 0xC0 {
        0xC0 => Err(RdpError::ProtocolViolation(
            "fragmented PER length determinant is not supported",
        )),
        0x80 => {
            let second = s.read_u8()?;
            Ok((usize::from(first & 0x3F) << 8) | usize::from(second))
        }
        _ => Ok(usize::from(first)),
    }
}

pub fn write_length(s: &mut WireBuffer, len: usize) -> Result<()> {
    if len < 0x80 {
        s.write_u8(len as u8);
    } else if len <= MAX_LENGTH {
        s.write_u16_be(0x8000 | len as u16);
    } else {
        return Err(RdpError::invalid("per length", len as u64));
    }
    Ok(())
}

pub fn length_size(len: usize) -> usize {
    if len < 0x80 { 1 } else { 2 }
}
