//! Everything the server learns about the client during connection.
//!
//! `ClientInfo` is filled in three passes: GCC client data (MCS connect),
//! the logon info packet (SEC), and the capability sets of the
//! Confirm Active PDU (RDP). Later passes only narrow what the earlier
//! ones allowed.

use zeroize::Zeroizing;

// ── Monitors ─────────────────────────────────────────────────────

/// One entry of `TS_UD_CS_MONITOR`, extended by `TS_UD_CS_MONITOR_EX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorInfo {
    pub left: i32,
    pub top: i32,
    /// Inclusive.
    pub right: i32,
    /// Inclusive.
    pub bottom: i32,
    pub primary: bool,
    pub physical_width: u32,
    pub physical_height: u32,
    pub orientation: u32,
    pub desktop_scale_factor: u32,
    pub device_scale_factor: u32,
}

// ── Bulk compression ─────────────────────────────────────────────

/// `PACKET_COMPR_TYPE_*` advertised in the logon flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CompressionType {
    Mppc8K = 0,
    Mppc64K = 1,
    Rdp6 = 2,
    Rdp61 = 3,
}

impl CompressionType {
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => Self::Mppc8K,
            1 => Self::Mppc64K,
            2 => Self::Rdp6,
            _ => Self::Rdp61,
        }
    }
}

// ── Logon ────────────────────────────────────────────────────────

/// Decoded `TS_INFO_PACKET` plus the extended info that follows it.
#[derive(Clone, Default)]
pub struct LogonInfo {
    pub code_page: u32,
    pub flags: u32,
    pub domain: String,
    pub username: String,
    /// Only decoded under `INFO_AUTOLOGON`.
    pub password: Zeroizing<String>,
    pub alternate_shell: String,
    pub working_dir: String,
    pub auto_logon: bool,
    pub rail: bool,
    /// Highest bulk compressor the client offered, when it offered one.
    pub compression: Option<CompressionType>,
    pub client_address: String,
    pub client_dir: String,
    pub session_id: u32,
    pub performance_flags: u32,
    pub has_auto_reconnect_cookie: bool,
}

impl std::fmt::Debug for LogonInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogonInfo")
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("auto_logon", &self.auto_logon)
            .field("compression", &self.compression)
            .field("client_address", &self.client_address)
            .finish_non_exhaustive()
    }
}

// ── Codecs ───────────────────────────────────────────────────────

/// Bitmap codecs the engine recognises by GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    NsCodec,
    RemoteFx,
    RemoteFxImage,
    Jpeg,
}

/// One `TS_BITMAPCODEC` from the client's bitmap codecs capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCodec {
    pub guid: [u8; 16],
    pub id: u8,
    /// `None` for GUIDs this engine does not know.
    pub kind: Option<CodecKind>,
    pub properties: Vec<u8>,
}

// ── Bitmap cache ─────────────────────────────────────────────────

bitflags::bitflags! {
    /// Which bitmap cache capability revisions the client sent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BitmapCacheVersion: u8 {
        const V1 = 0x01;
        const REV2 = 0x02;
        const REV3 = 0x04;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitmapCacheCell {
    pub entries: u32,
    pub cell_size: u16,
    pub persistent: bool,
}

// ── ClientInfo ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    // core data
    pub rdp_version: u32,
    pub width: u16,
    pub height: u16,
    pub bpp: u8,
    pub keyboard_layout: u32,
    pub client_build: u32,
    pub client_name: String,
    pub keyboard_type: u32,
    pub keyboard_subtype: u32,
    pub keyboard_function_keys: u32,
    pub early_capability_flags: u16,
    pub connection_type: u8,
    pub client_requested_protocols: u32,
    pub monitors: Vec<MonitorInfo>,
    pub cluster_flags: u32,
    pub redirected_session_id: Option<u32>,
    /// `encryptionMethods` and `extEncryptionMethods` from `CS_SECURITY`.
    pub client_encryption_methods: u32,

    // logon
    pub logon: LogonInfo,

    // capabilities
    pub os_major: u16,
    pub os_minor: u16,
    pub general_extra_flags: u16,
    pub fastpath_input: bool,
    pub fastpath_output: bool,
    pub long_credentials: bool,
    pub desktop_resize: bool,
    pub order_flags: u16,
    pub order_support: [u8; 32],
    pub no_orders: bool,
    pub bitmap_cache_version: BitmapCacheVersion,
    pub bitmap_cache_persist: bool,
    pub bitmap_cache: [BitmapCacheCell; 5],
    pub bitmap_cache_waiting_list: bool,
    pub color_cache_entries: u16,
    pub pointer_color: bool,
    pub pointer_cache_entries: u16,
    pub large_pointer: u32,
    pub input_flags: u16,
    pub brush_support_level: u32,
    pub glyph_support_level: u16,
    pub offscreen_support: bool,
    pub offscreen_cache_size: u16,
    pub offscreen_cache_entries: u16,
    pub vc_flags: u32,
    pub vc_chunk_size: u32,
    pub sound_flags: u16,
    pub rail_support_level: u32,
    pub window_level: u32,
    pub window_cache: u8,
    pub window_cache_entries: u16,
    pub codecs: Vec<ClientCodec>,
    pub cache_v3_codec_id: u8,
    pub multifrag_max_request_size: u32,
    /// Frames the client lets the server keep unacknowledged; 0 when the
    /// frame acknowledge capability is absent.
    pub max_unacknowledged_frames: u32,
    pub frame_acknowledge: bool,
    pub surface_commands: u32,
}

impl ClientInfo {
    /// Bounding box of all monitors as `(width, height)`.
    pub fn monitor_bounds(&self) -> Option<(u32, u32)> {
        let left = self.monitors.iter().map(|m| m.left).min()?;
        let top = self.monitors.iter().map(|m| m.top).min()?;
        let right = self.monitors.iter().map(|m| m.right).max()?;
        let bottom = self.monitors.iter().map(|m| m.bottom).max()?;
        let width = i64::from(right) - i64::from(left) + 1;
        let height = i64::from(bottom) - i64::from(top) + 1;
        Some((
            u32::try_from(width).unwrap_or(0),
            u32::try_from(height).unwrap_or(0),
        ))
    }

    pub fn codec(&self, kind: CodecKind) -> Option<&ClientCodec> {
        self.codecs.iter().find(|c| c.kind == Some(kind))
    }
}
