//! T.124 GCC Conference Create Request / Response and the client and
//! server data blocks (`TS_UD_*`) they carry.
//!
//! ```text
//! request:  object id (7) | per len | ccr (8) | "Duca" | per len | CS_* blocks
//! response: object id (7) | per len | ccr (9) | "McDn" | per len | SC_* blocks
//! ```

use tracing::{debug, warn};

use crate::client_info::{ClientInfo, MonitorInfo};
use crate::config::{CryptLevel, ServerConfig, ServerKeys, RSA_KEY_LENS, RSA_SIGNATURE_LEN};
use crate::error::{RdpError, Result};
use crate::iso::Protocols;
use crate::mcs::{per, GLOBAL_CHANNEL_ID, MAX_STATIC_CHANNELS};
use crate::sec::crypto::EncryptionMethod;
use crate::stream::WireBuffer;
use crate::unicode::{decode_ascii_z, decode_utf16_lossy};

// ── Constants ────────────────────────────────────────────────────

const T124_OBJECT_ID: [u8; 7] = [0x00, 0x05, 0x00, 0x14, 0x7C, 0x00, 0x01];
const CCR_HEADER_LEN: usize = 8;
const CCR_RESPONSE_HEADER: [u8; 9] = [0x14, 0x76, 0x0A, 0x01, 0x01, 0x00, 0x01, 0xC0, 0x00];
const H221_CLIENT_KEY: &[u8; 4] = b"Duca";
const H221_SERVER_KEY: &[u8; 4] = b"McDn";

pub const CS_CORE: u16 = 0xC001;
pub const CS_SECURITY: u16 = 0xC002;
pub const CS_NET: u16 = 0xC003;
pub const CS_CLUSTER: u16 = 0xC004;
pub const CS_MONITOR: u16 = 0xC005;
pub const CS_MONITOR_EX: u16 = 0xC008;

pub const SC_CORE: u16 = 0x0C01;
pub const SC_SECURITY: u16 = 0x0C02;
pub const SC_NET: u16 = 0x0C03;

/// RDP 5.0+ server version advertised in `SC_CORE`.
pub const SERVER_RDP_VERSION: u32 = 0x0008_0004;

pub const MIN_DESKTOP_SIZE: u16 = 200;
pub const MAX_DESKTOP_SIZE: u16 = 32766;
pub const MAX_MONITORS: usize = 16;
const CORE_FIXED_LEN: usize = 124;
const MONITOR_DEF_LEN: usize = 20;
const MONITOR_ATTRIBUTES_LEN: u32 = 20;
const TS_MONITOR_PRIMARY: u32 = 0x0000_0001;
const REDIRECTED_SESSIONID_FIELD_VALID: u32 = 0x0000_0002;

const RNS_UD_COLOR_4BPP: u16 = 0xCA00;
const RNS_UD_COLOR_8BPP: u16 = 0xCA01;
const RNS_UD_COLOR_16BPP_555: u16 = 0xCA02;
const RNS_UD_COLOR_16BPP_565: u16 = 0xCA03;
const RNS_UD_COLOR_24BPP: u16 = 0xCA04;

/// `supportedColorDepths` bit for 32 bpp.
const RNS_UD_32BPP_SUPPORT: u16 = 0x0008;

/// `earlyCapabilityFlags` bits.
pub mod early {
    pub const SUPPORT_ERRINFO_PDU: u16 = 0x0001;
    pub const WANT_32BPP_SESSION: u16 = 0x0002;
    pub const SUPPORT_STATUSINFO_PDU: u16 = 0x0004;
    pub const STRONG_ASYMMETRIC_KEYS: u16 = 0x0008;
    pub const VALID_CONNECTION_TYPE: u16 = 0x0020;
    pub const SUPPORT_MONITOR_LAYOUT_PDU: u16 = 0x0040;
    pub const SUPPORT_DYNVC_GFX_PROTOCOL: u16 = 0x0100;
}

const SIGNATURE_BLOB_LEN: usize = RSA_SIGNATURE_LEN + 8;
const RSA_MAGIC: u32 = 0x3141_5352;
const BB_RSA_KEY_BLOB: u16 = 0x0006;
const BB_RSA_SIGNATURE_BLOB: u16 = 0x0008;

/// Static channel requested in `CS_NET`: name, options, admitted.
pub type RequestedChannel = (String, u32, bool);

// ── Client data ──────────────────────────────────────────────────

/// Parse the Conference Create Request and every client data block.
///
/// Fills `info` and returns the requested static channels in order.
pub fn parse_client_data(
    user_data: &[u8],
    info: &mut ClientInfo,
    config: &ServerConfig,
    selected: Protocols,
) -> Result<Vec<RequestedChannel>> {
    let mut s = WireBuffer::from_slice(user_data);
    read_conference_create_request(&mut s)?;

    let mut channels = Vec::new();
    let mut saw_core = false;
    let mut monitor_attributes = None;

    while s.check_remaining(4) {
        let block_type = s.read_u16_le()?;
        let len = usize::from(s.read_u16_le()?);
        if len < 4 {
            return Err(RdpError::invalid("gcc block length", len as u64));
        }
        let mut block = WireBuffer::from_slice(s.read_bytes(len - 4, "gcc block")?);
        debug!(block_type = format_args!("{block_type:#06x}"), len, "client data block");
        match block_type {
            CS_CORE => {
                parse_core(&mut block, info, config, selected)?;
                saw_core = true;
            }
            CS_SECURITY => parse_security(&mut block, info)?,
            CS_NET => channels = parse_network(&mut block, config)?,
            CS_CLUSTER => parse_cluster(&mut block, info)?,
            CS_MONITOR => parse_monitors(&mut block, info)?,
            CS_MONITOR_EX => monitor_attributes = Some(parse_monitor_attributes(&mut block)?),
            other => debug!(block_type = format_args!("{other:#06x}"), "skipping client data block"),
        }
    }

    if !saw_core {
        return Err(RdpError::ProtocolViolation("client core data missing"));
    }
    if let Some(attributes) = monitor_attributes {
        apply_monitor_attributes(info, attributes);
    }
    apply_monitor_layout(info, config)?;
    Ok(channels)
}

fn read_conference_create_request(s: &mut WireBuffer) -> Result<()> {
    if s.read_array::<7>()? != T124_OBJECT_ID {
        return Err(RdpError::ProtocolViolation("bad T.124 object identifier"));
    }
    let connect_len = per::read_length(s)?;
    s.limit(connect_len, "connect pdu")?;
    s.skip(CCR_HEADER_LEN, "conference create request")?;
    if &s.read_array::<4>()? != H221_CLIENT_KEY {
        return Err(RdpError::ProtocolViolation("bad H.221 client key"));
    }
    let len = per::read_length(s)?;
    s.limit(len, "client data blocks")
}

fn parse_core(
    s: &mut WireBuffer,
    info: &mut ClientInfo,
    config: &ServerConfig,
    selected: Protocols,
) -> Result<()> {
    s.need(CORE_FIXED_LEN, "client core data")?;
    info.rdp_version = s.read_u32_le()?;
    info.width = s.read_u16_le()?;
    info.height = s.read_u16_le()?;
    let color_depth = s.read_u16_le()?;
    s.skip(2, "sas sequence")?;
    info.keyboard_layout = s.read_u32_le()?;
    info.client_build = s.read_u32_le()?;
    info.client_name = decode_utf16_lossy(s.read_bytes(32, "client name")?);
    info.keyboard_type = s.read_u32_le()?;
    info.keyboard_subtype = s.read_u32_le()?;
    info.keyboard_function_keys = s.read_u32_le()?;
    s.skip(64, "ime file name")?;

    for (what, v) in [("desktop width", info.width), ("desktop height", info.height)] {
        if !(MIN_DESKTOP_SIZE..=MAX_DESKTOP_SIZE).contains(&v) {
            debug!(what, v, "desktop size out of range");
            return Err(RdpError::invalid(what, v));
        }
    }

    // Every field from here on is optional; stop at the first one missing.
    let mut depth = ColorDepthFields {
        color_depth,
        ..ColorDepthFields::default()
    };
    let mut read_optional = || -> Result<()> {
        if !s.check_remaining(2) {
            return Ok(());
        }
        depth.post_beta2 = Some(s.read_u16_le()?);
        if !s.check_remaining(2 + 4) {
            return Ok(());
        }
        s.skip(6, "product id and serial number")?;
        if !s.check_remaining(2) {
            return Ok(());
        }
        depth.high = Some(s.read_u16_le()?);
        if !s.check_remaining(2) {
            return Ok(());
        }
        depth.supported = Some(s.read_u16_le()?);
        if !s.check_remaining(2) {
            return Ok(());
        }
        info.early_capability_flags = s.read_u16_le()?;
        depth.early = info.early_capability_flags;
        if !s.check_remaining(64) {
            return Ok(());
        }
        s.skip(64, "dig product id")?;
        if !s.check_remaining(2) {
            return Ok(());
        }
        let connection_type = s.read_u8()?;
        s.skip(1, "pad")?;
        if info.early_capability_flags & early::VALID_CONNECTION_TYPE != 0 {
            info.connection_type = connection_type;
        }
        if !s.check_remaining(4) {
            return Ok(());
        }
        let server_selected = s.read_u32_le()?;
        if server_selected != selected.bits() {
            warn!(
                server_selected,
                negotiated = selected.bits(),
                "client core data disagrees with negotiated protocol"
            );
            return Err(RdpError::NegotiationMismatch(
                "serverSelectedProtocol differs from negotiated protocol",
            ));
        }
        Ok(())
    };
    read_optional()?;

    info.bpp = depth.resolve(config.max_bpp);
    debug!(
        width = info.width,
        height = info.height,
        bpp = info.bpp,
        build = info.client_build,
        name = %info.client_name,
        "client core data"
    );
    Ok(())
}

/// Inputs to colour depth selection, in the order they appear.
#[derive(Debug, Default, Clone, Copy)]
pub struct ColorDepthFields {
    pub color_depth: u16,
    pub post_beta2: Option<u16>,
    pub high: Option<u16>,
    pub supported: Option<u16>,
    pub early: u16,
}

impl ColorDepthFields {
    /// `highColorDepth` beats `postBeta2ColorDepth` beats `colorDepth`;
    /// 32 bpp needs both `WANT_32BPP_SESSION` and the 32 bpp bit in
    /// `supportedColorDepths`. The result never exceeds `max_bpp`.
    pub fn resolve(&self, max_bpp: u8) -> u8 {
        let mut bpp = match self.color_depth {
            RNS_UD_COLOR_4BPP => 4,
            _ => 8,
        };
        if let Some(v) = self.post_beta2 {
            bpp = match v {
                RNS_UD_COLOR_4BPP => 4,
                RNS_UD_COLOR_8BPP => 8,
                RNS_UD_COLOR_16BPP_555 => 15,
                RNS_UD_COLOR_16BPP_565 => 16,
                RNS_UD_COLOR_24BPP => 24,
                _ => bpp,
            };
        }
        if let Some(v @ (4 | 8 | 15 | 16 | 24)) = self.high {
            bpp = v as u8;
        }
        let supports_32 = self.supported.is_some_and(|s| s & RNS_UD_32BPP_SUPPORT != 0);
        if self.high.is_some() && supports_32 && self.early & early::WANT_32BPP_SESSION != 0 {
            bpp = 32;
        }
        clamp_bpp(bpp, max_bpp)
    }
}

/// Largest legal depth not above `max_bpp`.
fn clamp_bpp(bpp: u8, max_bpp: u8) -> u8 {
    if bpp <= max_bpp {
        return bpp;
    }
    [32u8, 24, 16, 15, 8]
        .into_iter()
        .find(|&d| d <= max_bpp)
        .unwrap_or(8)
}

fn parse_security(s: &mut WireBuffer, info: &mut ClientInfo) -> Result<()> {
    s.need(4, "client security data")?;
    let methods = s.read_u32_le()?;
    let ext = if s.check_remaining(4) { s.read_u32_le()? } else { 0 };
    // French-locale clients put everything in extEncryptionMethods.
    info.client_encryption_methods = if methods == 0 { ext } else { methods };
    debug!(methods = info.client_encryption_methods, "client security data");
    Ok(())
}

fn parse_network(s: &mut WireBuffer, config: &ServerConfig) -> Result<Vec<RequestedChannel>> {
    let count = s.read_u32_le()? as usize;
    if count > MAX_STATIC_CHANNELS {
        return Err(RdpError::invalid("static channel count", count as u64));
    }
    s.need(count * 12, "channel definitions")?;
    let mut channels = Vec::with_capacity(count);
    for _ in 0..count {
        let name = decode_ascii_z(s.read_bytes(8, "channel name")?);
        let options = s.read_u32_le()?;
        let allowed = config.channel_allowed(&name);
        if !allowed {
            debug!(%name, "channel not in allow-list");
        }
        channels.push((name, options, allowed));
    }
    Ok(channels)
}

fn parse_cluster(s: &mut WireBuffer, info: &mut ClientInfo) -> Result<()> {
    s.need(8, "client cluster data")?;
    info.cluster_flags = s.read_u32_le()?;
    let session = s.read_u32_le()?;
    if info.cluster_flags & REDIRECTED_SESSIONID_FIELD_VALID != 0 {
        info.redirected_session_id = Some(session);
    }
    Ok(())
}

fn parse_monitors(s: &mut WireBuffer, info: &mut ClientInfo) -> Result<()> {
    s.need(8, "client monitor data")?;
    s.skip(4, "monitor flags")?;
    let count = s.read_u32_le()? as usize;
    if count == 0 || count > MAX_MONITORS {
        return Err(RdpError::invalid("monitor count", count as u64));
    }
    s.need(count * MONITOR_DEF_LEN, "monitor definitions")?;
    let mut monitors = Vec::with_capacity(count);
    for _ in 0..count {
        let m = MonitorInfo {
            left: s.read_u32_le()? as i32,
            top: s.read_u32_le()? as i32,
            right: s.read_u32_le()? as i32,
            bottom: s.read_u32_le()? as i32,
            primary: s.read_u32_le()? & TS_MONITOR_PRIMARY != 0,
            ..MonitorInfo::default()
        };
        if m.right < m.left || m.bottom < m.top {
            return Err(RdpError::ProtocolViolation("monitor rectangle is inverted"));
        }
        monitors.push(m);
    }
    if !monitors.iter().any(|m| m.primary) {
        monitors[0].primary = true;
    }
    info.monitors = monitors;
    Ok(())
}

fn parse_monitor_attributes(s: &mut WireBuffer) -> Result<Vec<[u32; 5]>> {
    s.need(12, "client monitor extended data")?;
    s.skip(4, "monitor ex flags")?;
    let size = s.read_u32_le()?;
    if size != MONITOR_ATTRIBUTES_LEN {
        return Err(RdpError::invalid("monitor attribute size", size));
    }
    let count = s.read_u32_le()? as usize;
    if count == 0 || count > MAX_MONITORS {
        return Err(RdpError::invalid("monitor ex count", count as u64));
    }
    s.need(count * MONITOR_DEF_LEN, "monitor attributes")?;
    (0..count)
        .map(|_| {
            Ok([
                s.read_u32_le()?,
                s.read_u32_le()?,
                s.read_u32_le()?,
                s.read_u32_le()?,
                s.read_u32_le()?,
            ])
        })
        .collect()
}

fn apply_monitor_attributes(info: &mut ClientInfo, attributes: Vec<[u32; 5]>) {
    if attributes.len() != info.monitors.len() {
        warn!(
            monitors = info.monitors.len(),
            attributes = attributes.len(),
            "monitor attribute count mismatch; ignoring attributes"
        );
        return;
    }
    for (m, [pw, ph, orientation, desktop, device]) in info.monitors.iter_mut().zip(attributes) {
        m.physical_width = pw;
        m.physical_height = ph;
        m.orientation = orientation;
        m.desktop_scale_factor = desktop;
        m.device_scale_factor = device;
    }
}

/// With multimon allowed the monitor bounding box defines the desktop.
fn apply_monitor_layout(info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
    if info.monitors.is_empty() {
        return Ok(());
    }
    if !config.allow_multimon {
        debug!(count = info.monitors.len(), "multimon disabled; ignoring monitor layout");
        info.monitors.clear();
        return Ok(());
    }
    let Some((width, height)) = info.monitor_bounds() else {
        return Ok(());
    };
    let range = u32::from(MIN_DESKTOP_SIZE)..=u32::from(MAX_DESKTOP_SIZE);
    if !range.contains(&width) || !range.contains(&height) {
        return Err(RdpError::ProtocolViolation("monitor layout exceeds desktop limits"));
    }
    info.width = width as u16;
    info.height = height as u16;
    debug!(monitors = info.monitors.len(), width, height, "multimon layout");
    Ok(())
}

// ── Server data ──────────────────────────────────────────────────

/// Security parameters for `SC_SECURITY`.
pub struct ServerSecurity<'a> {
    pub method: EncryptionMethod,
    pub level: CryptLevel,
    /// Present whenever `method` is not none.
    pub random_and_keys: Option<(&'a [u8; 32], &'a ServerKeys)>,
}

/// Build the Conference Create Response around the `SC_*` blocks.
pub fn write_server_data(
    requested_protocols: u32,
    channel_ids: &[u16],
    security: &ServerSecurity<'_>,
) -> Result<Vec<u8>> {
    let mut blocks = WireBuffer::with_capacity(512);
    write_server_core(&mut blocks, requested_protocols);
    write_server_network(&mut blocks, channel_ids);
    write_server_security(&mut blocks, security)?;
    let blocks = blocks.as_slice();

    let connect_len = CCR_RESPONSE_HEADER.len() + 4 + per::length_size(blocks.len()) + blocks.len();
    let mut s = WireBuffer::with_capacity(connect_len + 16);
    s.write_bytes(&T124_OBJECT_ID);
    per::write_length(&mut s, connect_len)?;
    s.write_bytes(&CCR_RESPONSE_HEADER);
    s.write_bytes(H221_SERVER_KEY);
    per::write_length(&mut s, blocks.len())?;
    s.write_bytes(blocks);
    Ok(s.as_slice().to_vec())
}

fn write_server_core(s: &mut WireBuffer, requested_protocols: u32) {
    s.write_u16_le(SC_CORE);
    s.write_u16_le(12);
    s.write_u32_le(SERVER_RDP_VERSION);
    s.write_u32_le(requested_protocols);
}

fn write_server_network(s: &mut WireBuffer, channel_ids: &[u16]) {
    let pad = channel_ids.len() % 2 == 1;
    s.write_u16_le(SC_NET);
    s.write_u16_le((8 + 2 * channel_ids.len() + if pad { 2 } else { 0 }) as u16);
    s.write_u16_le(GLOBAL_CHANNEL_ID);
    s.write_u16_le(channel_ids.len() as u16);
    for id in channel_ids {
        s.write_u16_le(*id);
    }
    if pad {
        s.write_u16_le(0);
    }
}

fn write_server_security(s: &mut WireBuffer, sec: &ServerSecurity<'_>) -> Result<()> {
    s.write_u16_le(SC_SECURITY);
    let Some((random, keys)) = sec.random_and_keys.filter(|_| sec.method != EncryptionMethod::NONE)
    else {
        s.write_u16_le(12);
        s.write_u32_le(0);
        s.write_u32_le(0);
        return Ok(());
    };
    let cert_len = certificate_len(keys.key_len());
    s.write_u16_le((4 + 16 + 32 + cert_len) as u16);
    s.write_u32_le(sec.method.bits());
    s.write_u32_le(sec.level as u32);
    s.write_u32_le(32);
    s.write_u32_le(cert_len as u32);
    s.write_bytes(random);
    write_proprietary_certificate(s, keys)
}

/// `RSA_PUBLIC_KEY`: magic, keylen, bitlen, datalen, exponent, modulus
/// and 8 bytes of zero padding.
fn public_key_blob_len(key_len: usize) -> usize {
    20 + key_len + 8
}

/// `PROPRIETARYSERVERCERTIFICATE` for a modulus of `key_len` bytes.
fn certificate_len(key_len: usize) -> usize {
    12 + 4 + public_key_blob_len(key_len) + 4 + SIGNATURE_BLOB_LEN
}

fn write_proprietary_certificate(s: &mut WireBuffer, keys: &ServerKeys) -> Result<()> {
    let key_len = keys.key_len();
    if !RSA_KEY_LENS.contains(&key_len) || keys.public_exponent.len() != 4 {
        return Err(RdpError::CryptoFailure("server key has unexpected size"));
    }
    // dwVersion, dwSigAlgId, dwKeyAlgId
    s.write_u32_le(1);
    s.write_u32_le(1);
    s.write_u32_le(1);
    s.write_u16_le(BB_RSA_KEY_BLOB);
    s.write_u16_le(public_key_blob_len(key_len) as u16);
    s.write_u32_le(RSA_MAGIC);
    s.write_u32_le((key_len + 8) as u32);
    s.write_u32_le((key_len * 8) as u32);
    s.write_u32_le((key_len - 1) as u32);
    s.write_bytes(&keys.public_exponent);
    s.write_bytes(&keys.modulus);
    s.write_zeros(8);
    s.write_u16_le(BB_RSA_SIGNATURE_BLOB);
    s.write_u16_le(SIGNATURE_BLOB_LEN as u16);
    s.write_bytes(&keys.signature_or_zero());
    s.write_zeros(8);
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
