//! The subset of X.690 BER used by MCS Connect-Initial / Connect-Response.

use crate::error::{RdpError, Result};
use crate::stream::WireBuffer;

pub const TAG_BOOLEAN: u16 = 0x01;
pub const TAG_INTEGER: u16 = 0x02;
pub const TAG_OCTET_STRING: u16 = 0x04;
pub const TAG_ENUMERATED: u16 = 0x0A;
pub const TAG_DOMAIN_PARAMETERS: u16 = 0x30;
pub const TAG_CONNECT_INITIAL: u16 = 0x7F65;
pub const TAG_CONNECT_RESPONSE: u16 = 0x7F66;

/// Read identifier + length, returning the content length.
///
/// Tags above 0xFF are the two-byte application tags of T.125. Lengths
/// use the short form or the long form with one or two length bytes.
/// The content must fit in what remains of `s`.
pub fn read_header(s: &mut WireBuffer, tag: u16) -> Result<usize> {
    let found = if tag > 0xFF {
        s.read_u16_be()?
    } else {
        u16::from(s.read_u8()?)
    };
    if found != tag {
        return Err(RdpError::invalid("ber tag", found));
    }
    let first = s.read_u8()?;
    let len = if first & 0x80 != 0 {
        match first & 0x7F {
            1 => usize::from(s.read_u8()?),
            2 => usize::from(s.read_u16_be()?),
            n => return Err(RdpError::invalid("ber length size", n)),
        }
    } else {
        usize::from(first)
    };
    s.need(len, "ber content")?;
    Ok(len)
}

pub fn write_header(s: &mut WireBuffer, tag: u16, len: usize) -> Result<()> {
    if tag > 0xFF {
        s.write_u16_be(tag);
    } else {
        s.write_u8(tag as u8);
    }
    write_length(s, len)
}

pub fn write_length(s: &mut WireBuffer, len: usize) -> Result<()> {
    if len < 0x80 {
        s.write_u8(len as u8);
    } else {
        let len = u16::try_from(len).map_err(|_| RdpError::invalid("ber length", len as u64))?;
        s.write_u8(0x82);
        s.write_u16_be(len);
    }
    Ok(())
}

/// Encoded size of a length field.
pub fn length_size(len: usize) -> usize {
    if len < 0x80 { 1 } else { 3 }
}

/// Non-negative INTEGER of up to 32 bits. A fifth content byte is only
/// legal as the 0x00 sign guard.
pub fn read_integer(s: &mut WireBuffer) -> Result<u32> {
    let len = read_header(s, TAG_INTEGER)?;
    if len == 0 || len > 5 {
        return Err(RdpError::invalid("ber integer length", len as u64));
    }
    if len == 5 && s.read_u8()? != 0 {
        return Err(RdpError::ProtocolViolation("ber integer exceeds 32 bits"));
    }
    let mut v = 0u32;
    for _ in 0..len.min(4) {
        v = (v << 8) | u32::from(s.read_u8()?);
    }
    Ok(v)
}

/// Smallest two's-complement encoding of a non-negative value.
pub fn write_integer(s: &mut WireBuffer, v: u32) {
    let n = integer_size(v) - 2;
    s.write_u8(TAG_INTEGER as u8);
    s.write_u8(n as u8);
    if n == 5 {
        s.write_u8(0);
    }
    s.write_bytes(&v.to_be_bytes()[4 - n.min(4)..]);
}

/// Encoded size of an INTEGER, tag and length included.
pub fn integer_size(v: u32) -> usize {
    2 + match v {
        0..=0x7F => 1,
        0x80..=0x7FFF => 2,
        0x8000..=0x7F_FFFF => 3,
        0x80_0000..=0x7FFF_FFFF => 4,
        _ => 5,
    }
}

pub fn write_enumerated(s: &mut WireBuffer, v: u8) {
    s.write_u8(TAG_ENUMERATED as u8);
    s.write_u8(1);
    s.write_u8(v);
}
