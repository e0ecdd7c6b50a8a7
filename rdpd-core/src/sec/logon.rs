//! Client Info PDU (`TS_INFO_PACKET` and `TS_EXTENDED_INFO_PACKET`).

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::client_info::{CompressionType, LogonInfo};
use crate::config::ServerConfig;
use crate::error::{RdpError, Result};
use crate::stream::WireBuffer;
use crate::unicode::{decode_utf16_lossy, read_utf16_terminated};

// ── Flags ────────────────────────────────────────────────────────

pub const INFO_MOUSE: u32 = 0x0000_0001;
pub const INFO_DISABLECTRLALTDEL: u32 = 0x0000_0002;
pub const INFO_AUTOLOGON: u32 = 0x0000_0008;
pub const INFO_UNICODE: u32 = 0x0000_0010;
pub const INFO_MAXIMIZESHELL: u32 = 0x0000_0020;
pub const INFO_COMPRESSION: u32 = 0x0000_0080;
pub const INFO_ENABLEWINDOWSKEY: u32 = 0x0000_0100;
pub const INFO_RAIL: u32 = 0x0000_8000;
pub const INFO_COMPRESSION_TYPE_MASK: u32 = 0x0000_1E00;

/// The bits every genuine client sets; a mismatch usually means the
/// PDU was decrypted with the wrong key.
pub const LOGON_NORMAL: u32 = INFO_MOUSE | INFO_DISABLECTRLALTDEL | INFO_UNICODE | INFO_MAXIMIZESHELL;

/// Limit for each of the five logon strings, in bytes.
pub const INFO_CLIENT_MAX_CB_LEN: usize = 512;
const MAX_CLIENT_ADDRESS_LEN: usize = 80;
const MAX_CLIENT_DIR_LEN: usize = 512;
const TIME_ZONE_INFO_LEN: usize = 172;
const MAX_AUTO_RECONNECT_COOKIE_LEN: usize = 28;

// ── Parsing ──────────────────────────────────────────────────────

/// Parse the Client Info PDU that follows the security header.
pub fn parse_logon_info(s: &mut WireBuffer, config: &ServerConfig) -> Result<LogonInfo> {
    s.need(18, "client info")?;
    let mut logon = LogonInfo {
        code_page: s.read_u32_le()?,
        flags: s.read_u32_le()?,
        ..LogonInfo::default()
    };
    if logon.flags & LOGON_NORMAL != LOGON_NORMAL {
        return Err(RdpError::invalid("logon flags", logon.flags));
    }

    let mut lengths = [0usize; 5];
    for len in &mut lengths {
        *len = usize::from(s.read_u16_le()?);
        if *len >= INFO_CLIENT_MAX_CB_LEN {
            return Err(RdpError::ProtocolViolation("logon field exceeds INFO_CLIENT_MAX_CB_LEN"));
        }
        if *len % 2 != 0 {
            return Err(RdpError::invalid("logon field length", *len as u64));
        }
    }
    let [cb_domain, cb_user, cb_password, cb_shell, cb_dir] = lengths;

    logon.auto_logon = logon.flags & INFO_AUTOLOGON != 0;
    logon.domain = read_utf16_terminated(s, cb_domain, "domain")?;
    logon.username = read_utf16_terminated(s, cb_user, "username")?;
    if logon.auto_logon {
        logon.password = Zeroizing::new(read_utf16_terminated(s, cb_password, "password")?);
    } else {
        s.skip(cb_password + 2, "password")?;
    }
    logon.alternate_shell = read_utf16_terminated(s, cb_shell, "alternate shell")?;
    logon.working_dir = read_utf16_terminated(s, cb_dir, "working directory")?;

    if logon.flags & INFO_COMPRESSION != 0 {
        let level = (logon.flags & INFO_COMPRESSION_TYPE_MASK) >> 9;
        logon.compression = Some(CompressionType::from_level(level));
    }
    logon.rail = logon.flags & INFO_RAIL != 0 && config.allow_rail;
    if logon.flags & INFO_RAIL != 0 && !config.allow_rail {
        info!("client requested RAIL but it is disabled");
    }

    if logon.flags & INFO_ENABLEWINDOWSKEY != 0 && s.check_remaining(2) {
        parse_extended_info(s, &mut logon)?;
    }

    if config.require_credentials {
        if !logon.auto_logon {
            return Err(RdpError::CredentialsRequired("client did not request auto-logon"));
        }
        if logon.username.is_empty() || logon.password.is_empty() {
            return Err(RdpError::CredentialsRequired("empty username or password"));
        }
    }

    info!(
        domain = %logon.domain,
        username = %logon.username,
        auto_logon = logon.auto_logon,
        compression = ?logon.compression,
        "client logon info"
    );
    Ok(logon)
}

fn parse_extended_info(s: &mut WireBuffer, logon: &mut LogonInfo) -> Result<()> {
    s.need(4, "extended info")?;
    let _family = s.read_u16_le()?;
    let cb_address = usize::from(s.read_u16_le()?);
    if cb_address > MAX_CLIENT_ADDRESS_LEN || cb_address % 2 != 0 {
        return Err(RdpError::invalid("client address length", cb_address as u64));
    }
    logon.client_address = decode_utf16_lossy(s.read_bytes(cb_address, "client address")?);

    let cb_dir = usize::from(s.read_u16_le()?);
    if cb_dir > MAX_CLIENT_DIR_LEN || cb_dir % 2 != 0 {
        return Err(RdpError::invalid("client dir length", cb_dir as u64));
    }
    logon.client_dir = decode_utf16_lossy(s.read_bytes(cb_dir, "client dir")?);

    // The remaining fields are each optional.
    if !s.check_remaining(TIME_ZONE_INFO_LEN) {
        return Ok(());
    }
    s.skip(TIME_ZONE_INFO_LEN, "time zone")?;
    if !s.check_remaining(8) {
        return Ok(());
    }
    logon.session_id = s.read_u32_le()?;
    logon.performance_flags = s.read_u32_le()?;
    if !s.check_remaining(2) {
        return Ok(());
    }
    let cb_cookie = usize::from(s.read_u16_le()?);
    if cb_cookie > MAX_AUTO_RECONNECT_COOKIE_LEN {
        return Err(RdpError::invalid("auto-reconnect cookie length", cb_cookie as u64));
    }
    s.skip(cb_cookie, "auto-reconnect cookie")?;
    logon.has_auto_reconnect_cookie = cb_cookie > 0;
    debug!(
        address = %logon.client_address,
        performance_flags = logon.performance_flags,
        "client extended info"
    );
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::unicode::encode_utf16_z;

    pub(crate) fn info_packet(flags: u32, fields: [&str; 5], extended: bool) -> Vec<u8> {
        let encoded: Vec<Vec<u8>> = fields.iter().map(|f| encode_utf16_z(f)).collect();
        let mut v = 0x409u32.to_le_bytes().to_vec();
        v.extend_from_slice(&flags.to_le_bytes());
        for e in &encoded {
            v.extend_from_slice(&((e.len() - 2) as u16).to_le_bytes());
        }
        for e in &encoded {
            v.extend_from_slice(e);
        }
        if extended {
            let address = encode_utf16_z("10.0.0.2");
            let dir = encode_utf16_z("C:\\client");
            v.extend_from_slice(&2u16.to_le_bytes());
            v.extend_from_slice(&(address.len() as u16).to_le_bytes());
            v.extend_from_slice(&address);
            v.extend_from_slice(&(dir.len() as u16).to_le_bytes());
            v.extend_from_slice(&dir);
            v.extend_from_slice(&[0u8; TIME_ZONE_INFO_LEN]);
            v.extend_from_slice(&0u32.to_le_bytes());
            v.extend_from_slice(&0x0000_0007u32.to_le_bytes());
            v.extend_from_slice(&0u16.to_le_bytes());
        }
        v
    }

    const NORMAL: u32 = LOGON_NORMAL | INFO_ENABLEWINDOWSKEY;

    #[test]
    fn auto_logon_with_extended_info() {
        let flags = NORMAL | INFO_AUTOLOGON | INFO_COMPRESSION | (1 << 9);
        let bytes = info_packet(flags, ["CORP", "alice", "s3cret", "", ""], true);
        let logon = parse_logon_info(&mut WireBuffer::from_slice(&bytes), &ServerConfig::default()).unwrap();
        assert_eq!(logon.domain, "CORP");
        assert_eq!(logon.username, "alice");
        assert_eq!(logon.password.as_str(), "s3cret");
        assert_eq!(logon.compression, Some(CompressionType::Mppc64K));
        assert_eq!(logon.client_address, "10.0.0.2");
        assert_eq!(logon.client_dir, "C:\\client");
        assert_eq!(logon.performance_flags, 7);
    }

    #[test]
    fn password_is_not_decoded_without_auto_logon() {
        let bytes = info_packet(NORMAL, ["", "bob", "pw", "", ""], false);
        let logon = parse_logon_info(&mut WireBuffer::from_slice(&bytes), &ServerConfig::default()).unwrap();
        assert_eq!(logon.username, "bob");
        assert!(logon.password.is_empty());
        assert!(!logon.auto_logon);
    }

    #[test]
    fn oversized_username_is_a_protocol_violation() {
        let mut bytes = info_packet(NORMAL, ["", "", "", "", ""], false);
        bytes[10..12].copy_from_slice(&(INFO_CLIENT_MAX_CB_LEN as u16).to_le_bytes());
        let err = parse_logon_info(&mut WireBuffer::from_slice(&bytes), &ServerConfig::default()).unwrap_err();
        assert!(matches!(err, RdpError::ProtocolViolation(_)));
    }

    #[test]
    fn wrong_flags_mean_bad_decryption() {
        let bytes = info_packet(INFO_UNICODE, ["", "", "", "", ""], false);
        assert!(parse_logon_info(&mut WireBuffer::from_slice(&bytes), &ServerConfig::default()).is_err());
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let mut bytes = info_packet(NORMAL, ["", "eve", "", "", ""], false);
        // Terminator of the username field.
        let at = 18 + 2 + 6;
        bytes[at] = b'x';
        assert!(parse_logon_info(&mut WireBuffer::from_slice(&bytes), &ServerConfig::default()).is_err());
    }

    #[test]
    fn credentials_policy() {
        let config = ServerConfig {
            require_credentials: true,
            ..ServerConfig::default()
        };
        let bytes = info_packet(NORMAL, ["", "bob", "pw", "", ""], false);
        assert!(matches!(
            parse_logon_info(&mut WireBuffer::from_slice(&bytes), &config),
            Err(RdpError::CredentialsRequired(_))
        ));
        let bytes = info_packet(NORMAL | INFO_AUTOLOGON, ["", "bob", "", "", ""], false);
        assert!(parse_logon_info(&mut WireBuffer::from_slice(&bytes), &config).is_err());
        let bytes = info_packet(NORMAL | INFO_AUTOLOGON, ["", "bob", "pw", "", ""], false);
        assert!(parse_logon_info(&mut WireBuffer::from_slice(&bytes), &config).is_ok());
    }

    #[test]
    fn rail_needs_server_permission() {
        let bytes = info_packet(NORMAL | INFO_RAIL, ["", "", "", "", ""], false);
        let logon = parse_logon_info(&mut WireBuffer::from_slice(&bytes), &ServerConfig::default()).unwrap();
        assert!(!logon.rail);
        let config = ServerConfig {
            allow_rail: true,
            ..ServerConfig::default()
        };
        let logon = parse_logon_info(&mut WireBuffer::from_slice(&bytes), &config).unwrap();
        assert!(logon.rail);
    }
}
