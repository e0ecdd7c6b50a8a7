//! UTF-16LE helpers for logon fields, client names and channel names.

use crate::error::{RdpError, Result};
use crate::stream::WireBuffer;

/// Decode UTF-16LE up to the first NUL, replacing invalid sequences.
pub fn decode_utf16_lossy(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0);
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Read `cb` bytes of UTF-16LE followed by a mandatory NUL terminator.
///
/// `cb` excludes the terminator, as in `TS_INFO_PACKET`.
pub fn read_utf16_terminated(s: &mut WireBuffer, cb: usize, what: &'static str) -> Result<String> {
    if cb % 2 != 0 {
        return Err(RdpError::invalid("utf-16 field length", cb as u64));
    }
    s.need(cb + 2, what)?;
    let text = decode_utf16_lossy(s.read_bytes(cb, what)?);
    if s.read_u16_le()? != 0 {
        return Err(RdpError::ProtocolViolation("utf-16 field is not NUL terminated"));
    }
    Ok(text)
}

/// Encode as UTF-16LE with a trailing NUL.
pub fn encode_utf16_z(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    out.extend_from_slice(&[0, 0]);
    out
}

/// ASCII up to the first NUL, as used by channel names.
pub fn decode_ascii_z(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_field() {
        let mut bytes = encode_utf16_z("bob");
        bytes.push(0xAA);
        let mut s = WireBuffer::from_slice(&bytes);
        assert_eq!(read_utf16_terminated(&mut s, 6, "user").unwrap(), "bob");
        assert_eq!(s.rest(), &[0xAA]);
    }

    #[test]
    fn missing_terminator_and_odd_length() {
        let mut s = WireBuffer::from_slice(&[b'a', 0, b'b', 0]);
        assert!(read_utf16_terminated(&mut s, 2, "user").is_err());
        let mut s = WireBuffer::from_slice(&[b'a', 0, 0, 0]);
        assert!(read_utf16_terminated(&mut s, 1, "user").is_err());
    }

    #[test]
    fn lossy_and_ascii() {
        assert_eq!(decode_utf16_lossy(&[b'h', 0, b'i', 0, 0, 0, b'x', 0]), "hi");
        assert_eq!(decode_utf16_lossy(&[0x00, 0xD8, b'a', 0]), "\u{FFFD}a");
        assert_eq!(decode_ascii_z(b"rdpdr\0\0\0"), "rdpdr");
    }
}
