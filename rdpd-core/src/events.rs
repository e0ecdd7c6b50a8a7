//! The upward interface: what the engine reports to the session logic.
//!
//! Input events arrive here already normalised to the slow-path
//! vocabulary, whichever framing the client used to send them.

use crate::client_info::ClientInfo;

// ── Input ────────────────────────────────────────────────────────

/// `KBDFLAGS_*` of the slow-path keyboard and unicode events.
pub mod kbd {
    pub const EXTENDED: u16 = 0x0100;
    pub const EXTENDED1: u16 = 0x0200;
    pub const DOWN: u16 = 0x4000;
    pub const RELEASE: u16 = 0x8000;
}

/// `PTRFLAGS_*` of the slow-path mouse event.
pub mod ptr {
    pub const HWHEEL: u16 = 0x0400;
    pub const WHEEL: u16 = 0x0200;
    pub const WHEEL_NEGATIVE: u16 = 0x0100;
    pub const MOVE: u16 = 0x0800;
    pub const DOWN: u16 = 0x8000;
    pub const BUTTON1: u16 = 0x1000;
    pub const BUTTON2: u16 = 0x2000;
    pub const BUTTON3: u16 = 0x4000;
}

/// One client input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Lock key state: `TS_SYNC_*` toggle flags.
    Sync { toggle_flags: u32 },
    Scancode { flags: u16, code: u16 },
    Unicode { flags: u16, code: u16 },
    Mouse { flags: u16, x: u16, y: u16 },
    /// Extended mouse buttons (`PTRXFLAGS_*`).
    MouseX { flags: u16, x: u16, y: u16 },
    /// Quality-of-experience timestamp, fastpath only.
    QoeTimestamp { timestamp: u32 },
}

// ── Screen updates ───────────────────────────────────────────────

/// Logical update type of an opaque payload handed down for sending.
///
/// The payload carries everything after the update type field; this
/// engine only frames it for slow path or fastpath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Orders,
    Bitmap,
    Palette,
    Synchronize,
    /// Fastpath only.
    SurfaceCommands,
    PointerHidden,
    PointerDefault,
    PointerPosition,
    ColorPointer,
    CachedPointer,
    NewPointer,
    /// Fastpath only.
    LargePointer,
}

/// Inclusive rectangle from Refresh Rect and Suppress Output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

// ── Disconnect ───────────────────────────────────────────────────

/// Why a session ended or is being ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Disconnect Provider Ultimatum, X.224 DR or EOF from the client.
    ClientRequested,
    /// X.224 negotiation failed; the failure PDU has been queued.
    NegotiationFailed,
    /// The session logic asked to end the session with this
    /// `ERRINFO_*` code.
    Server { error_info: u32 },
    /// A PDU failed to parse or violated the protocol.
    ProtocolError,
}

/// `ERRINFO_*` codes the engine sends in Set Error Info.
pub mod errinfo {
    pub const RPC_INITIATED_DISCONNECT: u32 = 0x0000_0001;
    pub const RPC_INITIATED_LOGOFF: u32 = 0x0000_0002;
    pub const IDLE_TIMEOUT: u32 = 0x0000_0003;
    pub const LOGON_TIMEOUT: u32 = 0x0000_0004;
    pub const DISCONNECTED_BY_OTHER_CONNECTION: u32 = 0x0000_0005;
    pub const OUT_OF_MEMORY: u32 = 0x0000_0006;
    pub const SERVER_DENIED_CONNECTION: u32 = 0x0000_0007;
}

// ── SessionEventSink ─────────────────────────────────────────────

/// Callbacks into the session logic.
///
/// Every method has an empty default so implementors only override what
/// they care about. Calls happen on the connection's task, strictly in
/// PDU order.
pub trait SessionEventSink: Send {
    /// The Client Info PDU was accepted.
    fn on_logon(&mut self, _info: &ClientInfo) {}

    /// A Demand Active PDU has been queued; activation (re)starts.
    fn on_demand_active_sent(&mut self) {}

    /// Activation finished: screen updates may flow.
    fn on_session_ready(&mut self, _info: &ClientInfo) {}

    fn on_input(&mut self, _event: InputEvent) {}

    /// A reassembled static channel message.
    fn on_channel_data(&mut self, _channel_id: u16, _flags: u32, _data: &[u8], _total_len: u32) {}

    /// The client answered the drdynvc capability request.
    fn on_drdynvc_ready(&mut self) {}

    fn on_dynamic_channel_open(&mut self, _name: &str, _chan_id: u32, _success: bool) {}

    fn on_dynamic_channel_data(&mut self, _chan_id: u32, _data: &[u8]) {}

    fn on_dynamic_channel_close(&mut self, _chan_id: u32) {}

    fn on_frame_ack(&mut self, _frame_id: u32) {}

    /// `rect` is `None` when output is suppressed.
    fn on_suppress_output(&mut self, _suppress: bool, _rect: Option<Rect>) {}

    fn on_refresh_rect(&mut self, _rects: &[Rect]) {}

    fn on_disconnect(&mut self, _reason: DisconnectReason) {}
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SessionEventSink for NullSink {}
