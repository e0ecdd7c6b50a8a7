//! Licensing stub: every client is told it holds a valid license.

use crate::stream::WireBuffer;

pub const ERROR_ALERT: u8 = 0xFF;
pub const PREAMBLE_VERSION_3_0: u8 = 0x03;
pub const STATUS_VALID_CLIENT: u32 = 0x0000_0007;
pub const ST_NO_TRANSITION: u32 = 0x0000_0002;
pub const BB_ERROR_BLOB: u16 = 0x0004;
pub const VALID_CLIENT_LEN: u16 = 16;

/// `LICENSE_ERROR_MESSAGE` with `STATUS_VALID_CLIENT`.
pub fn write_valid_client(s: &mut WireBuffer) {
    s.write_u8(ERROR_ALERT);
    s.write_u8(PREAMBLE_VERSION_3_0);
    s.write_u16_le(VALID_CLIENT_LEN);
    s.write_u32_le(STATUS_VALID_CLIENT);
    s.write_u32_le(ST_NO_TRANSITION);
    s.write_u16_le(BB_ERROR_BLOB);
    s.write_u16_le(0);
}
