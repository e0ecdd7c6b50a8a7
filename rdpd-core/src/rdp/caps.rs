//! Capability sets: what the server advertises in Demand Active and
//! how the client's Confirm Active narrows `ClientInfo`.
//!
//! Client sets may arrive in any order. Each one is dispatched through
//! [`HANDLERS`]; a handler that rejects its set only logs, the rest of
//! the Confirm Active is still applied. Framing errors in the set
//! headers themselves are fatal.

use tracing::{debug, warn};

use crate::client_info::{BitmapCacheCell, BitmapCacheVersion, ClientCodec, ClientInfo, CodecKind};
use crate::config::{AdvertisedCodec, ServerConfig};
use crate::error::{RdpError, Result};
use crate::stream::WireBuffer;

// ── Capability set types ─────────────────────────────────────────

/// `CAPSTYPE_*` / `CAPSETTYPE_*` identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CapabilitySetType {
    General = 0x0001,
    Bitmap = 0x0002,
    Order = 0x0003,
    BitmapCache = 0x0004,
    Control = 0x0005,
    BitmapCacheV3CodecId = 0x0006,
    Activation = 0x0007,
    Pointer = 0x0008,
    Share = 0x0009,
    ColorCache = 0x000A,
    Sound = 0x000C,
    Input = 0x000D,
    Font = 0x000E,
    Brush = 0x000F,
    GlyphCache = 0x0010,
    OffscreenCache = 0x0011,
    BitmapCacheHostSupport = 0x0012,
    BitmapCacheRev2 = 0x0013,
    VirtualChannel = 0x0014,
    DrawNineGridCache = 0x0015,
    DrawGdiPlus = 0x0016,
    Rail = 0x0017,
    Window = 0x0018,
    CompDesk = 0x0019,
    MultifragmentUpdate = 0x001A,
    LargePointer = 0x001B,
    SurfaceCommands = 0x001C,
    BitmapCodecs = 0x001D,
    FrameAcknowledge = 0x001E,
}

impl TryFrom<u16> for CapabilitySetType {
    type Error = RdpError;

    fn try_from(v: u16) -> Result<Self> {
        use CapabilitySetType::*;
        Ok(match v {
            0x0001 => General,
            0x0002 => Bitmap,
            0x0003 => Order,
            0x0004 => BitmapCache,
            0x0005 => Control,
            0x0006 => BitmapCacheV3CodecId,
            0x0007 => Activation,
            0x0008 => Pointer,
            0x0009 => Share,
            0x000A => ColorCache,
            0x000C => Sound,
            0x000D => Input,
            0x000E => Font,
            0x000F => Brush,
            0x0010 => GlyphCache,
            0x0011 => OffscreenCache,
            0x0012 => BitmapCacheHostSupport,
            0x0013 => BitmapCacheRev2,
            0x0014 => VirtualChannel,
            0x0015 => DrawNineGridCache,
            0x0016 => DrawGdiPlus,
            0x0017 => Rail,
            0x0018 => Window,
            0x0019 => CompDesk,
            0x001A => MultifragmentUpdate,
            0x001B => LargePointer,
            0x001C => SurfaceCommands,
            0x001D => BitmapCodecs,
            0x001E => FrameAcknowledge,
            _ => {
                return Err(RdpError::UnknownVariant {
                    type_name: "CapabilitySetType",
                    value: u64::from(v),
                });
            }
        })
    }
}

// ── Flags and constants ──────────────────────────────────────────

pub const CAPSET_HEADER_LEN: usize = 4;

// General extraFlags.
pub const FASTPATH_OUTPUT_SUPPORTED: u16 = 0x0001;
pub const LONG_CREDENTIALS_SUPPORTED: u16 = 0x0004;
pub const AUTORECONNECT_SUPPORTED: u16 = 0x0008;
pub const ENC_SALTED_CHECKSUM: u16 = 0x0010;
pub const NO_BITMAP_COMPRESSION_HDR: u16 = 0x0400;

// Order flags.
const NEGOTIATEORDERSUPPORT: u16 = 0x0002;
const ZEROBOUNDSDELTASSUPPORT: u16 = 0x0008;
const COLORINDEXSUPPORT: u16 = 0x0020;
const ORDERFLAGS_EXTRA_FLAGS: u16 = 0x0080;

/// Order indices the server offers: dstblt, patblt, scrblt, memblt,
/// mem3blt, lineto, polyline, glyph index.
const SERVER_ORDERS: [usize; 8] = [0, 1, 2, 3, 4, 8, 22, 27];
/// Below this many supported orders the client gets bitmaps only.
const MIN_CLIENT_ORDERS: usize = 5;

// Input flags.
pub const INPUT_FLAG_SCANCODES: u16 = 0x0001;
pub const INPUT_FLAG_MOUSEX: u16 = 0x0004;
pub const INPUT_FLAG_FASTPATH_INPUT: u16 = 0x0008;
pub const INPUT_FLAG_UNICODE: u16 = 0x0010;
pub const INPUT_FLAG_FASTPATH_INPUT2: u16 = 0x0020;

// Bitmap cache rev2.
const PERSISTENT_KEYS_EXPECTED_FLAG: u16 = 0x0001;
const ALLOW_CACHE_WAITING_LIST_FLAG: u16 = 0x0002;

// Large pointer.
pub const LARGE_POINTER_FLAG_96X96: u32 = 0x0001;
pub const LARGE_POINTER_FLAG_384X384: u32 = 0x0002;
/// Smallest multifragment size that fits one pointer of each size.
const MULTIFRAG_FOR_96X96: u32 = 38_055;
const MULTIFRAG_FOR_384X384: u32 = 608_299;

// Surface commands.
const SURFCMDS_SET_SURFACE_BITS: u32 = 0x0002;
const SURFCMDS_FRAME_MARKER: u32 = 0x0010;
const SURFCMDS_STREAM_SURFACE_BITS: u32 = 0x0040;

const TS_RAIL_LEVEL_SUPPORTED: u32 = 0x0000_0001;
const TS_WINDOW_LEVEL_SUPPORTED: u32 = 0x0000_0001;

const SERVER_CHANNEL_ID: u16 = 0x03EA;

// ── Codec GUIDs ──────────────────────────────────────────────────

const fn guid(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> [u8; 16] {
    let a = d1.to_le_bytes();
    let b = d2.to_le_bytes();
    let c = d3.to_le_bytes();
    [
        a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4], d4[5], d4[6], d4[7],
    ]
}

pub const CODEC_GUID_NSCODEC: [u8; 16] = guid(0xCA8D_1BB9, 0x000F, 0x154F, [0x58, 0x9F, 0xAE, 0x2D, 0x1A, 0x87, 0xE2, 0xD6]);
pub const CODEC_GUID_REMOTEFX: [u8; 16] = guid(0x7677_2F12, 0xBD72, 0x4463, [0xAF, 0xB3, 0xB7, 0x3C, 0x9C, 0x6F, 0x78, 0x86]);
pub const CODEC_GUID_IMAGE_REMOTEFX: [u8; 16] = guid(0x2744_CCD4, 0x9D8A, 0x4E74, [0x80, 0x3C, 0x0E, 0xCB, 0xEE, 0xA1, 0x9C, 0x54]);
pub const CODEC_GUID_JPEG: [u8; 16] = guid(0x430C_9EED, 0x1BAF, 0x4CE6, [0x86, 0x9A, 0xCB, 0x8B, 0x37, 0xB6, 0x62, 0x37]);

fn codec_kind(guid: &[u8; 16]) -> Option<CodecKind> {
    match *guid {
        CODEC_GUID_NSCODEC => Some(CodecKind::NsCodec),
        CODEC_GUID_REMOTEFX => Some(CodecKind::RemoteFx),
        CODEC_GUID_IMAGE_REMOTEFX => Some(CodecKind::RemoteFxImage),
        CODEC_GUID_JPEG => Some(CodecKind::Jpeg),
        _ => None,
    }
}

// ── Server capability sets ───────────────────────────────────────

/// Write one capability set, back-patching its length.
fn capset(s: &mut WireBuffer, kind: CapabilitySetType, body: impl FnOnce(&mut WireBuffer)) -> Result<()> {
    let start = s.pos();
    s.write_u16_le(kind as u16);
    s.write_u16_le(0);
    body(s);
    let end = s.pos();
    let len = u16::try_from(end - start).map_err(|_| RdpError::ProtocolViolation("capability set too long"))?;
    s.seek(start + 2)?;
    s.write_u16_le(len);
    s.seek(end)
}

/// Write the Demand Active capability sets; returns how many.
///
/// The Share set goes first. The fastpath-only sets follow only when
/// fastpath output is enabled.
pub fn write_server_caps(s: &mut WireBuffer, config: &ServerConfig, info: &ClientInfo) -> Result<u16> {
    use CapabilitySetType as C;
    let fastpath_output = config.fastpath.output();
    let mut count = 0u16;

    capset(s, C::Share, |s| {
        s.write_u16_le(SERVER_CHANNEL_ID);
        s.write_u16_le(0);
    })?;
    count += 1;

    capset(s, C::General, |s| {
        s.write_u16_le(1); // OSMAJORTYPE_WINDOWS
        s.write_u16_le(3); // OSMINORTYPE_WINDOWS_NT
        s.write_u16_le(0x0200); // TS_CAPS_PROTOCOLVERSION
        s.write_u16_le(0);
        s.write_u16_le(0);
        let mut extra = LONG_CREDENTIALS_SUPPORTED | NO_BITMAP_COMPRESSION_HDR | AUTORECONNECT_SUPPORTED;
        if fastpath_output {
            extra |= FASTPATH_OUTPUT_SUPPORTED;
        }
        s.write_u16_le(extra);
        s.write_u16_le(0);
        s.write_u16_le(0);
        s.write_u16_le(0);
        s.write_u8(1); // refreshRectSupport
        s.write_u8(1); // suppressOutputSupport
    })?;
    count += 1;

    capset(s, C::Bitmap, |s| {
        s.write_u16_le(u16::from(info.bpp));
        s.write_u16_le(1);
        s.write_u16_le(1);
        s.write_u16_le(1);
        s.write_u16_le(info.width);
        s.write_u16_le(info.height);
        s.write_u16_le(0);
        s.write_u16_le(1); // desktopResizeFlag
        s.write_u16_le(1); // bitmapCompressionFlag
        s.write_u8(0);
        s.write_u8(0);
        s.write_u16_le(1); // multipleRectangleSupport
        s.write_u16_le(0);
    })?;
    count += 1;

    capset(s, C::Font, |s| {
        s.write_u16_le(0x0001); // FONTSUPPORT_FONTLIST
        s.write_u16_le(0);
    })?;
    count += 1;

    capset(s, C::Order, |s| {
        s.write_zeros(16);
        s.write_u32_le(0);
        s.write_u16_le(1);
        s.write_u16_le(20);
        s.write_u16_le(0);
        s.write_u16_le(1);
        s.write_u16_le(0);
        s.write_u16_le(NEGOTIATEORDERSUPPORT | ZEROBOUNDSDELTASSUPPORT | COLORINDEXSUPPORT | ORDERFLAGS_EXTRA_FLAGS);
        let mut support = [0u8; 32];
        for i in SERVER_ORDERS {
            support[i] = 1;
        }
        s.write_bytes(&support);
        s.write_u16_le(0x06A1);
        s.write_u16_le(0);
        s.write_u32_le(0);
        s.write_u32_le(480 * 480);
        s.write_u16_le(0);
        s.write_u16_le(0);
        s.write_u16_le(0x04E4);
        s.write_u16_le(0);
    })?;
    count += 1;

    let codecs = &config.advertised_codecs;
    let codec_count = u8::try_from(codecs.len()).map_err(|_| RdpError::invalid("bitmap codec count", codecs.len() as u64))?;
    capset(s, C::BitmapCodecs, |s| {
        s.write_u8(codec_count);
        for codec in codecs {
            match codec {
                AdvertisedCodec::NsCodec => {
                    s.write_bytes(&CODEC_GUID_NSCODEC);
                    s.write_u8(1);
                    s.write_u16_le(3);
                    // dynamic fidelity, subsampling, colour loss level
                    s.write_bytes(&[1, 1, 3]);
                }
                AdvertisedCodec::RemoteFx => {
                    s.write_bytes(&CODEC_GUID_REMOTEFX);
                    s.write_u8(0);
                    s.write_u16_le(4);
                    s.write_u32_le(0);
                }
                AdvertisedCodec::Jpeg => {
                    s.write_bytes(&CODEC_GUID_JPEG);
                    s.write_u8(0);
                    s.write_u16_le(1);
                    s.write_u8(75);
                }
            }
        }
    })?;
    count += 1;

    capset(s, C::ColorCache, |s| {
        s.write_u16_le(6);
        s.write_u16_le(0);
    })?;
    count += 1;

    capset(s, C::Pointer, |s| {
        s.write_u16_le(1);
        s.write_u16_le(25);
        s.write_u16_le(25);
    })?;
    count += 1;

    capset(s, C::Input, |s| {
        let mut flags = INPUT_FLAG_SCANCODES | INPUT_FLAG_MOUSEX | INPUT_FLAG_UNICODE;
        if config.fastpath.input() {
            flags |= INPUT_FLAG_FASTPATH_INPUT | INPUT_FLAG_FASTPATH_INPUT2;
        }
        s.write_u16_le(flags);
        s.write_u16_le(0);
        s.write_zeros(16);
        s.write_zeros(64);
    })?;
    count += 1;

    if info.logon.rail {
        capset(s, C::Rail, |s| s.write_u32_le(TS_RAIL_LEVEL_SUPPORTED))?;
        capset(s, C::Window, |s| {
            s.write_u32_le(TS_WINDOW_LEVEL_SUPPORTED);
            s.write_u8(3);
            s.write_u16_le(12);
        })?;
        count += 2;
    }

    // Known only once a client has confirmed RemoteFX, i.e. on reactivation.
    if let Some(codec) = info.codec(CodecKind::RemoteFx) {
        let id = codec.id;
        capset(s, C::BitmapCacheV3CodecId, |s| s.write_u8(id))?;
        count += 1;
    }

    if fastpath_output {
        capset(s, C::MultifragmentUpdate, |s| {
            s.write_u32_le(config.multifrag_max_request_size)
        })?;
        capset(s, C::LargePointer, |s| {
            s.write_u16_le((LARGE_POINTER_FLAG_96X96 | LARGE_POINTER_FLAG_384X384) as u16)
        })?;
        capset(s, C::FrameAcknowledge, |s| s.write_u32_le(2))?;
        capset(s, C::SurfaceCommands, |s| {
            s.write_u32_le(SURFCMDS_SET_SURFACE_BITS | SURFCMDS_FRAME_MARKER | SURFCMDS_STREAM_SURFACE_BITS);
            s.write_u32_le(0);
        })?;
        count += 4;
    }
    Ok(count)
}

// ── Client capability sets ───────────────────────────────────────

type Handler = fn(&mut WireBuffer, &mut ClientInfo, &ServerConfig) -> Result<()>;

/// Dispatch table for Confirm Active. Types without an entry are
/// skipped by length.
pub const HANDLERS: &[(CapabilitySetType, Handler)] = &[
    (CapabilitySetType::General, general),
    (CapabilitySetType::Bitmap, bitmap),
    (CapabilitySetType::Order, order),
    (CapabilitySetType::BitmapCache, bitmap_cache),
    (CapabilitySetType::BitmapCacheRev2, bitmap_cache_rev2),
    (CapabilitySetType::BitmapCacheV3CodecId, bitmap_cache_v3_codec_id),
    (CapabilitySetType::ColorCache, color_cache),
    (CapabilitySetType::Pointer, pointer),
    (CapabilitySetType::Input, input),
    (CapabilitySetType::Brush, brush),
    (CapabilitySetType::GlyphCache, glyph_cache),
    (CapabilitySetType::OffscreenCache, offscreen_cache),
    (CapabilitySetType::VirtualChannel, virtual_channel),
    (CapabilitySetType::Sound, sound),
    (CapabilitySetType::Rail, rail),
    (CapabilitySetType::Window, window),
    (CapabilitySetType::BitmapCodecs, bitmap_codecs),
    (CapabilitySetType::MultifragmentUpdate, multifragment_update),
    (CapabilitySetType::LargePointer, large_pointer),
    (CapabilitySetType::FrameAcknowledge, frame_acknowledge),
    (CapabilitySetType::SurfaceCommands, surface_commands),
];

/// Apply `count` client capability sets to `info`.
pub fn parse_client_caps(s: &mut WireBuffer, count: u16, info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
    // Fastpath stays off unless the client confirms it.
    info.fastpath_input = false;
    info.fastpath_output = false;

    for _ in 0..count {
        s.need(CAPSET_HEADER_LEN, "capability set header")?;
        let raw_type = s.read_u16_le()?;
        let len = usize::from(s.read_u16_le()?);
        if len < CAPSET_HEADER_LEN {
            return Err(RdpError::invalid("capability set length", len as u64));
        }
        if !s.check_remaining(len - CAPSET_HEADER_LEN) {
            return Err(RdpError::ProtocolViolation("capability set length exceeds PDU"));
        }
        let mut body = WireBuffer::from_slice(s.read_bytes(len - CAPSET_HEADER_LEN, "capability set")?);

        let Ok(kind) = CapabilitySetType::try_from(raw_type) else {
            debug!(raw_type, len, "skipping unknown capability set");
            continue;
        };
        let Some((_, handler)) = HANDLERS.iter().find(|(k, _)| *k == kind) else {
            debug!(?kind, len, "capability set not used by the server");
            continue;
        };
        if let Err(e) = handler(&mut body, info, config) {
            warn!(?kind, error = %e, "ignoring malformed capability set");
        }
    }

    settle_large_pointer(info);
    debug!(
        fastpath_input = info.fastpath_input,
        fastpath_output = info.fastpath_output,
        bitmap_cache = ?info.bitmap_cache_version,
        codecs = info.codecs.len(),
        "client capabilities applied"
    );
    Ok(())
}

/// Large pointers must fit in one multifragment update.
fn settle_large_pointer(info: &mut ClientInfo) {
    if info.large_pointer & LARGE_POINTER_FLAG_384X384 != 0 && info.multifrag_max_request_size < MULTIFRAG_FOR_384X384 {
        debug!(size = info.multifrag_max_request_size, "multifragment too small for 384x384 pointers");
        info.large_pointer &= !LARGE_POINTER_FLAG_384X384;
    }
    if info.large_pointer & LARGE_POINTER_FLAG_96X96 != 0 && info.multifrag_max_request_size < MULTIFRAG_FOR_96X96 {
        debug!(size = info.multifrag_max_request_size, "multifragment too small for 96x96 pointers");
        info.large_pointer &= !LARGE_POINTER_FLAG_96X96;
    }
}

fn general(s: &mut WireBuffer, info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
    s.need(12, "general capability")?;
    info.os_major = s.read_u16_le()?;
    info.os_minor = s.read_u16_le()?;
    s.skip(6, "general capability")?;
    let extra = s.read_u16_le()?;
    info.general_extra_flags = extra;
    info.long_credentials = extra & LONG_CREDENTIALS_SUPPORTED != 0;
    info.fastpath_output = config.fastpath.output() && extra & FASTPATH_OUTPUT_SUPPORTED != 0;
    Ok(())
}

fn bitmap(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    s.need(16, "bitmap capability")?;
    s.skip(14, "bitmap capability")?;
    info.desktop_resize = s.read_u16_le()? != 0;
    Ok(())
}

fn order(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    s.need(64, "order capability")?;
    s.skip(30, "order capability")?;
    info.order_flags = s.read_u16_le()?;
    info.order_support = s.read_array()?;
    let supported = info.order_support.iter().filter(|&&b| b != 0).count();
    if supported < MIN_CLIENT_ORDERS {
        warn!(supported, "client supports too few drawing orders, using bitmaps only");
        info.no_orders = true;
    }
    Ok(())
}

fn bitmap_cache(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    s.need(36, "bitmap cache capability")?;
    s.skip(24, "bitmap cache capability")?;
    for cell in info.bitmap_cache.iter_mut().take(3) {
        cell.entries = u32::from(s.read_u16_le()?);
        cell.cell_size = s.read_u16_le()?;
        cell.persistent = false;
    }
    info.bitmap_cache_version |= BitmapCacheVersion::V1;
    Ok(())
}

fn bitmap_cache_rev2(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    s.need(4, "bitmap cache rev2 capability")?;
    let flags = s.read_u16_le()?;
    s.skip(1, "bitmap cache rev2 padding")?;
    let cells = usize::from(s.read_u8()?);
    if cells > info.bitmap_cache.len() {
        return Err(RdpError::invalid("bitmap cache cell count", cells as u64));
    }
    s.need(cells * 4, "bitmap cache rev2 cells")?;
    info.bitmap_cache_persist = flags & PERSISTENT_KEYS_EXPECTED_FLAG != 0;
    info.bitmap_cache_waiting_list = flags & ALLOW_CACHE_WAITING_LIST_FLAG != 0;
    for cell in info.bitmap_cache.iter_mut().take(cells) {
        let raw = s.read_u32_le()?;
        *cell = BitmapCacheCell {
            entries: raw & 0x7FFF_FFFF,
            cell_size: cell.cell_size,
            persistent: raw & 0x8000_0000 != 0,
        };
    }
    info.bitmap_cache_version |= BitmapCacheVersion::REV2;
    Ok(())
}

fn bitmap_cache_v3_codec_id(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.cache_v3_codec_id = s.read_u8()?;
    info.bitmap_cache_version |= BitmapCacheVersion::REV3;
    Ok(())
}

fn color_cache(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.color_cache_entries = s.read_u16_le()?;
    Ok(())
}

fn pointer(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    s.need(4, "pointer capability")?;
    info.pointer_color = s.read_u16_le()? != 0;
    let color_entries = s.read_u16_le()?;
    info.pointer_cache_entries = if s.check_remaining(2) {
        s.read_u16_le()?
    } else {
        color_entries
    };
    Ok(())
}

fn input(s: &mut WireBuffer, info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
    let flags = s.read_u16_le()?;
    info.input_flags = flags;
    info.fastpath_input =
        config.fastpath.input() && flags & (INPUT_FLAG_FASTPATH_INPUT | INPUT_FLAG_FASTPATH_INPUT2) != 0;
    Ok(())
}

fn brush(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.brush_support_level = s.read_u32_le()?;
    Ok(())
}

fn glyph_cache(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    s.need(46, "glyph cache capability")?;
    s.skip(44, "glyph cache definitions")?;
    info.glyph_support_level = s.read_u16_le()?;
    Ok(())
}

fn offscreen_cache(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    s.need(8, "offscreen cache capability")?;
    info.offscreen_support = s.read_u32_le()? != 0;
    info.offscreen_cache_size = s.read_u16_le()?;
    info.offscreen_cache_entries = s.read_u16_le()?;
    Ok(())
}

fn virtual_channel(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.vc_flags = s.read_u32_le()?;
    if s.check_remaining(4) {
        info.vc_chunk_size = s.read_u32_le()?;
    }
    Ok(())
}

fn sound(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.sound_flags = s.read_u16_le()?;
    Ok(())
}

fn rail(s: &mut WireBuffer, info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
    let level = s.read_u32_le()?;
    if config.allow_rail {
        info.rail_support_level = level;
    }
    Ok(())
}

fn window(s: &mut WireBuffer, info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
    s.need(7, "window capability")?;
    let level = s.read_u32_le()?;
    let caches = s.read_u8()?;
    let entries = s.read_u16_le()?;
    if config.allow_rail {
        info.window_level = level;
        info.window_cache = caches;
        info.window_cache_entries = entries;
    }
    Ok(())
}

fn bitmap_codecs(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    let count = s.read_u8()?;
    let mut codecs = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        s.need(19, "bitmap codec")?;
        let guid: [u8; 16] = s.read_array()?;
        let id = s.read_u8()?;
        let len = usize::from(s.read_u16_le()?);
        let properties = s.read_vec(len, "bitmap codec properties")?;
        let kind = codec_kind(&guid);
        debug!(?kind, id, "client bitmap codec");
        codecs.push(ClientCodec {
            guid,
            id,
            kind,
            properties,
        });
    }
    info.codecs = codecs;
    Ok(())
}

fn multifragment_update(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.multifrag_max_request_size = s.read_u32_le()?;
    Ok(())
}

fn large_pointer(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.large_pointer = u32::from(s.read_u16_le()?);
    Ok(())
}

fn frame_acknowledge(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.max_unacknowledged_frames = s.read_u32_le()?;
    info.frame_acknowledge = true;
    Ok(())
}

fn surface_commands(s: &mut WireBuffer, info: &mut ClientInfo, _: &ServerConfig) -> Result<()> {
    info.surface_commands = s.read_u32_le()?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FastpathMode;

    pub(crate) fn capset_bytes(kind: CapabilitySetType, body: &[u8]) -> Vec<u8> {
        let mut v = (kind as u16).to_le_bytes().to_vec();
        v.extend_from_slice(&((body.len() + 4) as u16).to_le_bytes());
        v.extend_from_slice(body);
        v
    }

    pub(crate) fn general_body(extra: u16) -> Vec<u8> {
        let mut v = vec![0u8; 20];
        v[0] = 1;
        v[2] = 3;
        v[10..12].copy_from_slice(&extra.to_le_bytes());
        v
    }

    pub(crate) fn input_body(flags: u16) -> Vec<u8> {
        let mut v = vec![0u8; 84];
        v[..2].copy_from_slice(&flags.to_le_bytes());
        v
    }

    fn parse(sets: &[Vec<u8>], info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
        let bytes: Vec<u8> = sets.concat();
        parse_client_caps(&mut WireBuffer::from_slice(&bytes), sets.len() as u16, info, config)
    }

    fn server_sets(bytes: &[u8]) -> Vec<u16> {
        let mut s = WireBuffer::from_slice(bytes);
        let mut kinds = Vec::new();
        while s.remaining() > 0 {
            kinds.push(s.read_u16_le().unwrap());
            let len = usize::from(s.read_u16_le().unwrap());
            s.skip(len - 4, "set").unwrap();
        }
        kinds
    }

    #[test]
    fn server_sets_are_ordered_and_sized() {
        let info = ClientInfo {
            width: 1024,
            height: 768,
            bpp: 16,
            ..ClientInfo::default()
        };
        let mut s = WireBuffer::new();
        let count = write_server_caps(&mut s, &ServerConfig::default(), &info).unwrap();
        let kinds = server_sets(s.as_slice());
        assert_eq!(usize::from(count), kinds.len());
        use CapabilitySetType as C;
        assert_eq!(
            kinds,
            [
                C::Share,
                C::General,
                C::Bitmap,
                C::Font,
                C::Order,
                C::BitmapCodecs,
                C::ColorCache,
                C::Pointer,
                C::Input,
                C::MultifragmentUpdate,
                C::LargePointer,
                C::FrameAcknowledge,
                C::SurfaceCommands,
            ]
            .map(|c| c as u16)
        );
    }

    #[test]
    fn fixed_server_set_lengths() {
        let mut s = WireBuffer::new();
        let config = ServerConfig {
            fastpath: FastpathMode::None,
            advertised_codecs: vec![],
            ..ServerConfig::default()
        };
        write_server_caps(&mut s, &config, &ClientInfo::default()).unwrap();
        let bytes = s.as_slice();
        let mut lengths = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let len = usize::from(u16::from_le_bytes([bytes[at + 2], bytes[at + 3]]));
            lengths.push(len);
            at += len;
        }
        // share, general, bitmap, font, order, codecs, colour cache, pointer, input
        assert_eq!(lengths, vec![8, 24, 28, 8, 88, 5, 8, 10, 88]);
    }

    #[test]
    fn codec_count_must_fit_a_byte() {
        let config = ServerConfig {
            advertised_codecs: vec![AdvertisedCodec::RemoteFx; 256],
            ..ServerConfig::default()
        };
        let mut s = WireBuffer::new();
        let err = write_server_caps(&mut s, &config, &ClientInfo::default()).unwrap_err();
        assert!(matches!(
            err,
            RdpError::InvalidField {
                field: "bitmap codec count",
                value: 256
            }
        ));
    }

    #[test]
    fn rail_sets_follow_input_when_rail_is_on() {
        let mut info = ClientInfo::default();
        info.logon.rail = true;
        let config = ServerConfig {
            fastpath: FastpathMode::None,
            ..ServerConfig::default()
        };
        let mut s = WireBuffer::new();
        write_server_caps(&mut s, &config, &info).unwrap();
        let kinds = server_sets(s.as_slice());
        assert_eq!(
            &kinds[kinds.len() - 2..],
            &[CapabilitySetType::Rail as u16, CapabilitySetType::Window as u16]
        );
    }

    #[test]
    fn fastpath_needs_client_confirmation() {
        let config = ServerConfig::default();
        let mut info = ClientInfo::default();
        parse(
            &[
                capset_bytes(CapabilitySetType::General, &general_body(0)),
                capset_bytes(CapabilitySetType::Input, &input_body(INPUT_FLAG_SCANCODES)),
            ],
            &mut info,
            &config,
        )
        .unwrap();
        assert!(!info.fastpath_output);
        assert!(!info.fastpath_input);

        parse(
            &[
                capset_bytes(CapabilitySetType::Input, &input_body(INPUT_FLAG_FASTPATH_INPUT2)),
                capset_bytes(CapabilitySetType::General, &general_body(FASTPATH_OUTPUT_SUPPORTED)),
            ],
            &mut info,
            &config,
        )
        .unwrap();
        assert!(info.fastpath_output);
        assert!(info.fastpath_input);

        let off = ServerConfig {
            fastpath: FastpathMode::Input,
            ..ServerConfig::default()
        };
        parse(
            &[capset_bytes(CapabilitySetType::General, &general_body(FASTPATH_OUTPUT_SUPPORTED))],
            &mut info,
            &off,
        )
        .unwrap();
        assert!(!info.fastpath_output);
    }

    #[test]
    fn bitmap_cache_versions_accumulate() {
        let mut v1 = vec![0u8; 36];
        v1[24..28].copy_from_slice(&[0x58, 0x02, 0x00, 0x01]);
        let mut rev2 = vec![0x03, 0x00, 0x00, 0x02];
        rev2.extend_from_slice(&0x8000_0258u32.to_le_bytes());
        rev2.extend_from_slice(&0x0000_0100u32.to_le_bytes());
        rev2.extend_from_slice(&[0; 12]);
        let mut info = ClientInfo::default();
        parse(
            &[
                capset_bytes(CapabilitySetType::BitmapCache, &v1),
                capset_bytes(CapabilitySetType::BitmapCacheRev2, &rev2),
                capset_bytes(CapabilitySetType::BitmapCacheV3CodecId, &[3]),
            ],
            &mut info,
            &ServerConfig::default(),
        )
        .unwrap();
        assert_eq!(info.bitmap_cache_version, BitmapCacheVersion::all());
        assert!(info.bitmap_cache_persist);
        assert!(info.bitmap_cache_waiting_list);
        assert_eq!(info.bitmap_cache[0].entries, 600);
        assert!(info.bitmap_cache[0].persistent);
        assert_eq!(info.bitmap_cache[0].cell_size, 256);
        assert_eq!(info.bitmap_cache[1].entries, 256);
        assert_eq!(info.cache_v3_codec_id, 3);
    }

    #[test]
    fn bad_set_is_skipped_not_fatal() {
        let mut info = ClientInfo::default();
        parse(
            &[
                // too short for the glyph cache handler
                capset_bytes(CapabilitySetType::GlyphCache, &[0; 10]),
                // unknown type
                capset_bytes(CapabilitySetType::Control, &[0; 4]),
                vec![0x77, 0x00, 0x08, 0x00, 1, 2, 3, 4],
                capset_bytes(CapabilitySetType::Sound, &[1, 0, 0, 0]),
            ],
            &mut info,
            &ServerConfig::default(),
        )
        .unwrap();
        assert_eq!(info.sound_flags, 1);
        assert_eq!(info.glyph_support_level, 0);
    }

    #[test]
    fn oversized_set_length_is_fatal() {
        let mut bytes = capset_bytes(CapabilitySetType::Sound, &[1, 0, 0, 0]);
        bytes[2] = 0x40;
        let err = parse_client_caps(
            &mut WireBuffer::from_slice(&bytes),
            1,
            &mut ClientInfo::default(),
            &ServerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RdpError::ProtocolViolation(_)));
    }

    #[test]
    fn too_few_orders_degrades() {
        let mut body = vec![0u8; 84];
        body[32] = 1;
        body[33] = 1;
        let mut info = ClientInfo::default();
        parse(&[capset_bytes(CapabilitySetType::Order, &body)], &mut info, &ServerConfig::default()).unwrap();
        assert!(info.no_orders);
    }

    #[test]
    fn codecs_are_recognised_by_guid() {
        let mut body = vec![2u8];
        body.extend_from_slice(&CODEC_GUID_REMOTEFX);
        body.push(3);
        body.extend_from_slice(&4u16.to_le_bytes());
        body.extend_from_slice(&[0; 4]);
        body.extend_from_slice(&[0xAB; 16]);
        body.push(9);
        body.extend_from_slice(&0u16.to_le_bytes());
        let mut info = ClientInfo::default();
        parse(
            &[capset_bytes(CapabilitySetType::BitmapCodecs, &body)],
            &mut info,
            &ServerConfig::default(),
        )
        .unwrap();
        assert_eq!(info.codec(CodecKind::RemoteFx).map(|c| c.id), Some(3));
        assert_eq!(info.codecs[1].kind, None);
        assert_eq!(
            &CODEC_GUID_NSCODEC[..4],
            &[0xB9, 0x1B, 0x8D, 0xCA],
        );
    }

    #[test]
    fn large_pointer_needs_room() {
        let mut info = ClientInfo::default();
        parse(
            &[
                capset_bytes(CapabilitySetType::LargePointer, &3u16.to_le_bytes()),
                capset_bytes(CapabilitySetType::MultifragmentUpdate, &65_535u32.to_le_bytes()),
            ],
            &mut info,
            &ServerConfig::default(),
        )
        .unwrap();
        assert_eq!(info.large_pointer, LARGE_POINTER_FLAG_96X96);
    }
}
