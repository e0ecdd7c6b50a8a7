//! RDP share-control layer: PDU dispatch and session activation.
//!
//! ```text
//!  SendDemandActive ──► AwaitConfirmActive ──► AwaitControlRequest
//!        ▲                                          │ grant + cooperate
//!        │ DeactivateAll                            ▼
//!   UpAndRunning ◄── AwaitFontList ◄────────── AwaitSynchronize
//! ```
//!
//! Clients send Synchronize, Control and Font List in slightly different
//! orders, so each is answered as it arrives and the state only records
//! what is still missing. The final Font List moves the session to
//! `UpAndRunning`; only then are screen updates forwarded.

pub mod caps;
pub mod mppc;

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::client_info::{ClientInfo, CompressionType, MonitorInfo};
use crate::config::ServerConfig;
use crate::error::{RdpError, Result};
use crate::events::{InputEvent, Rect, SessionEventSink, UpdateKind};
use crate::mcs::GLOBAL_CHANNEL_ID;
use crate::rdp::mppc::{MppcCompressor, PACKET_COMPRESSED};
use crate::sec::{Outbound, SEC_REDIRECTION_PKT};
use crate::stream::{Layer, WireBuffer};
use crate::unicode::encode_utf16_z;

// ── Constants ────────────────────────────────────────────────────

/// Channel id the server uses as `pduSource` and in finalization PDUs.
pub const SERVER_CHANNEL_ID: u16 = 0x03EA;
pub const SHARE_ID: u32 = 0x0001_0000 | SERVER_CHANNEL_ID as u32;

pub const SHARE_CONTROL_HEADER_LEN: usize = 6;
pub const SHARE_DATA_HEADER_LEN: usize = 12;
/// Share control plus share data header.
pub const RDP_HEADER_LEN: usize = SHARE_CONTROL_HEADER_LEN + SHARE_DATA_HEADER_LEN;

const TS_PROTOCOL_VERSION: u16 = 0x0010;
const FLOW_MARKER: u16 = 0x8000;
const FLOW_PDU_LEN: usize = 8;
const STREAM_LOW: u8 = 1;
const SOURCE_DESCRIPTOR: &[u8; 4] = b"RDP\0";

// Control actions.
const CTRLACTION_REQUEST_CONTROL: u16 = 0x0001;
const CTRLACTION_GRANTED_CONTROL: u16 = 0x0002;
const CTRLACTION_DETACH: u16 = 0x0003;
const CTRLACTION_COOPERATE: u16 = 0x0004;

const SYNCMSGTYPE_SYNC: u16 = 0x0001;
const FONTLIST_LAST: u16 = 0x0002;
const FONTMAP_FIRST_LAST: u16 = 0x0003;
const UPDATETYPE_SYNCHRONIZE: u16 = 0x0003;

// Slow-path input message types.
const INPUT_EVENT_SYNC: u16 = 0x0000;
const INPUT_EVENT_SCANCODE: u16 = 0x0004;
const INPUT_EVENT_UNICODE: u16 = 0x0005;
const INPUT_EVENT_MOUSE: u16 = 0x8001;
const INPUT_EVENT_MOUSEX: u16 = 0x8002;

// Pointer message types.
const TS_PTRMSGTYPE_SYSTEM: u16 = 0x0001;
const TS_PTRMSGTYPE_POSITION: u16 = 0x0003;
const TS_PTRMSGTYPE_COLOR: u16 = 0x0006;
const TS_PTRMSGTYPE_CACHED: u16 = 0x0007;
const TS_PTRMSGTYPE_POINTER: u16 = 0x0008;
const SYSPTR_NULL: u32 = 0x0000_0000;
const SYSPTR_DEFAULT: u32 = 0x0000_7F00;

const TS_MONITOR_PRIMARY: u32 = 0x0000_0001;

// ── PDU types ────────────────────────────────────────────────────

/// `PDUTYPE_*` of the share control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ShareControlType {
    DemandActive = 0x1,
    ConfirmActive = 0x3,
    DeactivateAll = 0x6,
    Data = 0x7,
    ServerRedirect = 0xA,
}

impl TryFrom<u16> for ShareControlType {
    type Error = RdpError;

    fn try_from(v: u16) -> Result<Self> {
        match v & 0x000F {
            0x1 => Ok(Self::DemandActive),
            0x3 => Ok(Self::ConfirmActive),
            0x6 => Ok(Self::DeactivateAll),
            0x7 => Ok(Self::Data),
            0xA => Ok(Self::ServerRedirect),
            other => Err(RdpError::UnknownVariant {
                type_name: "ShareControlType",
                value: u64::from(other),
            }),
        }
    }
}

/// `PDUTYPE2_*` of the share data header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataPduType {
    Update = 2,
    Control = 20,
    Pointer = 27,
    Input = 28,
    Synchronize = 31,
    RefreshRect = 33,
    PlaySound = 34,
    SuppressOutput = 35,
    ShutdownRequest = 36,
    ShutdownDenied = 37,
    SaveSessionInfo = 38,
    FontList = 39,
    FontMap = 40,
    SetKeyboardIndicators = 41,
    BitmapCachePersistentList = 43,
    BitmapCacheErrorPdu = 44,
    SetKeyboardImeStatus = 45,
    OffscreenCacheError = 46,
    SetErrorInfo = 47,
    DrawNineGridError = 48,
    DrawGdiPlusError = 49,
    ArcStatus = 50,
    StatusInfo = 54,
    MonitorLayout = 55,
    FrameAcknowledge = 56,
}

impl TryFrom<u8> for DataPduType {
    type Error = RdpError;

    fn try_from(v: u8) -> Result<Self> {
        use DataPduType::*;
        Ok(match v {
            2 => Update,
            20 => Control,
            27 => Pointer,
            28 => Input,
            31 => Synchronize,
            33 => RefreshRect,
            34 => PlaySound,
            35 => SuppressOutput,
            36 => ShutdownRequest,
            37 => ShutdownDenied,
            38 => SaveSessionInfo,
            39 => FontList,
            40 => FontMap,
            41 => SetKeyboardIndicators,
            43 => BitmapCachePersistentList,
            44 => BitmapCacheErrorPdu,
            45 => SetKeyboardImeStatus,
            46 => OffscreenCacheError,
            47 => SetErrorInfo,
            48 => DrawNineGridError,
            49 => DrawGdiPlusError,
            50 => ArcStatus,
            54 => StatusInfo,
            55 => MonitorLayout,
            56 => FrameAcknowledge,
            other => {
                return Err(RdpError::UnknownVariant {
                    type_name: "DataPduType",
                    value: u64::from(other),
                });
            }
        })
    }
}

// ── State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationState {
    #[default]
    SendDemandActive,
    AwaitConfirmActive,
    AwaitControlRequest,
    AwaitSynchronize,
    AwaitFontList,
    UpAndRunning,
}

impl ActivationState {
    fn name(self) -> &'static str {
        match self {
            Self::SendDemandActive => "SendDemandActive",
            Self::AwaitConfirmActive => "AwaitConfirmActive",
            Self::AwaitControlRequest => "AwaitControlRequest",
            Self::AwaitSynchronize => "AwaitSynchronize",
            Self::AwaitFontList => "AwaitFontList",
            Self::UpAndRunning => "UpAndRunning",
        }
    }

    fn finalizing(self) -> bool {
        matches!(
            self,
            Self::AwaitControlRequest | Self::AwaitSynchronize | Self::AwaitFontList
        )
    }
}

bitflags! {
    /// Why output is currently suppressed. Output resumes only when
    /// every reason has been withdrawn.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SuppressReasons: u8 {
        const CLIENT_REQUEST = 0x01;
        const DEACTIVATE_REACTIVATE = 0x02;
        const DYNAMIC_RESIZE = 0x04;
    }
}

/// What the caller must do after [`RdpLayer::recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdpSignal {
    Continue,
    /// Activation just finished.
    UpAndRunning,
    /// The client deactivated; a new Demand Active is due.
    DemandActiveDue,
}

/// Parameters of a Server Redirection PDU.
#[derive(Clone, Default)]
pub struct Redirection {
    pub session_id: u32,
    pub target_address: Option<String>,
    pub load_balance_info: Option<Vec<u8>>,
    pub username: Option<String>,
    pub domain: Option<String>,
    /// Opaque password cookie.
    pub password: Option<Zeroizing<Vec<u8>>>,
    pub target_fqdn: Option<String>,
    pub target_netbios_name: Option<String>,
}

impl std::fmt::Debug for Redirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redirection")
            .field("session_id", &self.session_id)
            .field("target_address", &self.target_address)
            .field("username", &self.username)
            .field("target_fqdn", &self.target_fqdn)
            .finish_non_exhaustive()
    }
}

// Redirection flags.
const LB_TARGET_NET_ADDRESS: u32 = 0x0000_0001;
const LB_LOAD_BALANCE_INFO: u32 = 0x0000_0002;
const LB_USERNAME: u32 = 0x0000_0004;
const LB_DOMAIN: u32 = 0x0000_0008;
const LB_PASSWORD: u32 = 0x0000_0010;
const LB_TARGET_FQDN: u32 = 0x0000_0100;
const LB_TARGET_NETBIOS_NAME: u32 = 0x0000_0200;

// ── RdpLayer ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RdpLayer {
    state: ActivationState,
    suppress: SuppressReasons,
    control_granted: bool,
    synchronized: bool,
    mppc: Option<MppcCompressor>,
}

impl RdpLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == ActivationState::UpAndRunning
    }

    pub fn suppressed(&self) -> SuppressReasons {
        self.suppress
    }

    /// Whether screen updates may be sent right now.
    pub fn can_send_updates(&self) -> bool {
        self.is_up() && self.suppress.is_empty()
    }

    pub fn suppress(&mut self, reason: SuppressReasons) {
        self.suppress |= reason;
    }

    pub fn resume(&mut self, reason: SuppressReasons) {
        self.suppress &= !reason;
    }

    /// Turn on bulk compression when policy and the client allow it.
    pub fn enable_compression(&mut self, offered: Option<CompressionType>, config: &ServerConfig) {
        if let Some(kind) = offered.filter(|_| config.bulk_compression) {
            debug!(?kind, "mppc bulk compression enabled");
            self.mppc = Some(MppcCompressor::new(kind));
        }
    }

    /// The compressor for fastpath output, once the session is up.
    pub fn compressor(&mut self) -> Option<&mut MppcCompressor> {
        if self.is_up() { self.mppc.as_mut() } else { None }
    }

    fn expect(&self, state: ActivationState, pdu: &'static str) -> Result<()> {
        if self.state != state {
            return Err(RdpError::UnexpectedPdu {
                pdu,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Process every share control PDU in one security payload.
    pub fn recv(
        &mut self,
        s: &mut WireBuffer,
        out: &mut Outbound<'_>,
        info: &mut ClientInfo,
        config: &ServerConfig,
        sink: &mut dyn SessionEventSink,
    ) -> Result<RdpSignal> {
        let mut signal = RdpSignal::Continue;
        while s.remaining() > 0 {
            s.need(2, "share control header")?;
            let total = s.read_u16_le()?;
            if total == FLOW_MARKER {
                trace!("skipping flow control pdu");
                s.skip(FLOW_PDU_LEN - 2, "flow pdu")?;
                continue;
            }
            let total = usize::from(total);
            if total < SHARE_CONTROL_HEADER_LEN {
                return Err(RdpError::invalid("share control length", total as u64));
            }
            s.need(total - 2, "share control pdu")?;
            let pdu_type = ShareControlType::try_from(s.read_u16_le()?)?;
            let _source = s.read_u16_le()?;
            let mut pdu = WireBuffer::from_slice(s.read_bytes(total - SHARE_CONTROL_HEADER_LEN, "share control body")?);

            let step = match pdu_type {
                ShareControlType::ConfirmActive => {
                    self.process_confirm_active(&mut pdu, info, config)?;
                    RdpSignal::Continue
                }
                ShareControlType::Data => self.process_data(&mut pdu, out, sink)?,
                ShareControlType::DeactivateAll => {
                    if !self.state.finalizing() && !self.is_up() {
                        return Err(RdpError::UnexpectedPdu {
                            pdu: "DeactivateAll",
                            state: self.state.name(),
                        });
                    }
                    info!("client deactivated, restarting activation");
                    self.state = ActivationState::SendDemandActive;
                    self.suppress |= SuppressReasons::DEACTIVATE_REACTIVATE;
                    RdpSignal::DemandActiveDue
                }
                ShareControlType::DemandActive | ShareControlType::ServerRedirect => {
                    return Err(RdpError::UnexpectedPdu {
                        pdu: "server-only share control pdu",
                        state: self.state.name(),
                    });
                }
            };
            if step != RdpSignal::Continue {
                signal = step;
            }
        }
        Ok(signal)
    }

    fn process_confirm_active(&mut self, s: &mut WireBuffer, info: &mut ClientInfo, config: &ServerConfig) -> Result<()> {
        self.expect(ActivationState::AwaitConfirmActive, "ConfirmActive")?;
        s.need(10, "confirm active")?;
        let share_id = s.read_u32_le()?;
        if share_id != SHARE_ID {
            return Err(RdpError::invalid("confirm active share id", share_id));
        }
        let _originator = s.read_u16_le()?;
        let source_len = usize::from(s.read_u16_le()?);
        let caps_len = usize::from(s.read_u16_le()?);
        s.skip(source_len, "source descriptor")?;
        if caps_len < 4 {
            return Err(RdpError::invalid("combined capabilities length", caps_len as u64));
        }
        s.limit(caps_len, "combined capabilities")?;
        let count = s.read_u16_le()?;
        s.skip(2, "capabilities padding")?;
        caps::parse_client_caps(s, count, info, config)?;

        self.control_granted = false;
        self.synchronized = false;
        self.state = ActivationState::AwaitControlRequest;
        info!(count, "confirm active accepted");
        Ok(())
    }

    fn process_data(
        &mut self,
        s: &mut WireBuffer,
        out: &mut Outbound<'_>,
        sink: &mut dyn SessionEventSink,
    ) -> Result<RdpSignal> {
        s.need(SHARE_DATA_HEADER_LEN, "share data header")?;
        let _share_id = s.read_u32_le()?;
        s.skip(2, "share data pad and stream")?;
        let _uncompressed_len = s.read_u16_le()?;
        let raw_type = s.read_u8()?;
        let compressed_type = s.read_u8()?;
        let _compressed_len = s.read_u16_le()?;
        if compressed_type & PACKET_COMPRESSED != 0 {
            return Err(RdpError::ProtocolViolation("compressed client data pdu"));
        }
        let Ok(pdu_type) = DataPduType::try_from(raw_type) else {
            debug!(raw_type, "skipping unknown data pdu");
            return Ok(RdpSignal::Continue);
        };
        trace!(?pdu_type, state = self.state.name(), "data pdu");

        match pdu_type {
            DataPduType::Synchronize => {
                self.require_activation("Synchronize")?;
                self.send_data(out, DataPduType::Synchronize, &sync_body())?;
                self.synchronized = true;
                self.advance_finalization();
            }
            DataPduType::Control => {
                self.require_activation("Control")?;
                self.process_control(s, out)?;
                self.advance_finalization();
            }
            DataPduType::FontList => {
                self.require_activation("FontList")?;
                s.need(8, "font list")?;
                s.skip(4, "font counts")?;
                let flags = s.read_u16_le()?;
                if flags & FONTLIST_LAST == 0 {
                    // Only synchronize and control move the state forward.
                    self.advance_finalization();
                    return Ok(RdpSignal::Continue);
                }
                return self.finish_activation(out);
            }
            DataPduType::Input => {
                for event in parse_input(s)? {
                    sink.on_input(event);
                }
            }
            DataPduType::RefreshRect => {
                let count = usize::from(s.read_u8()?);
                s.skip(3, "refresh rect padding")?;
                s.need(count * 8, "refresh rect areas")?;
                let rects = (0..count).map(|_| read_rect(s)).collect::<Result<Vec<_>>>()?;
                sink.on_refresh_rect(&rects);
            }
            DataPduType::SuppressOutput => {
                let allow = s.read_u8()? != 0;
                s.skip(3, "suppress output padding")?;
                if allow {
                    let rect = if s.check_remaining(8) { Some(read_rect(s)?) } else { None };
                    self.resume(SuppressReasons::CLIENT_REQUEST);
                    sink.on_suppress_output(false, rect);
                } else {
                    self.suppress(SuppressReasons::CLIENT_REQUEST);
                    sink.on_suppress_output(true, None);
                }
            }
            DataPduType::ShutdownRequest => {
                info!("client requested shutdown, denying");
                self.send_data(out, DataPduType::ShutdownDenied, &[])?;
            }
            DataPduType::FrameAcknowledge => {
                sink.on_frame_ack(s.read_u32_le()?);
            }
            other => debug!(?other, "data pdu ignored"),
        }
        Ok(RdpSignal::Continue)
    }

    fn require_activation(&self, pdu: &'static str) -> Result<()> {
        if self.state.finalizing() || self.is_up() {
            Ok(())
        } else {
            Err(RdpError::UnexpectedPdu {
                pdu,
                state: self.state.name(),
            })
        }
    }

    fn advance_finalization(&mut self) {
        if !self.state.finalizing() {
            return;
        }
        self.state = if !self.control_granted {
            ActivationState::AwaitControlRequest
        } else if !self.synchronized {
            ActivationState::AwaitSynchronize
        } else {
            ActivationState::AwaitFontList
        };
    }

    fn process_control(&mut self, s: &mut WireBuffer, out: &mut Outbound<'_>) -> Result<()> {
        s.need(8, "control pdu")?;
        let action = s.read_u16_le()?;
        match action {
            CTRLACTION_COOPERATE => {
                self.send_data(out, DataPduType::Control, &control_body(CTRLACTION_COOPERATE, 0, 0))?;
            }
            CTRLACTION_REQUEST_CONTROL => {
                let grant_id = out.mcs.user_channel();
                self.send_data(
                    out,
                    DataPduType::Control,
                    &control_body(CTRLACTION_GRANTED_CONTROL, grant_id, u32::from(SERVER_CHANNEL_ID)),
                )?;
                self.control_granted = true;
            }
            CTRLACTION_DETACH => debug!("client detached control"),
            other => return Err(RdpError::invalid("control action", other)),
        }
        Ok(())
    }

    fn finish_activation(&mut self, out: &mut Outbound<'_>) -> Result<RdpSignal> {
        if !self.control_granted || !self.synchronized {
            warn!(
                control = self.control_granted,
                synchronized = self.synchronized,
                "final font list before finalization completed"
            );
        }
        let mut font_map = WireBuffer::with_capacity(8);
        font_map.write_u16_le(0);
        font_map.write_u16_le(0);
        font_map.write_u16_le(FONTMAP_FIRST_LAST);
        font_map.write_u16_le(4);
        self.send_data(out, DataPduType::FontMap, font_map.as_slice())?;

        self.state = ActivationState::UpAndRunning;
        self.suppress &= !(SuppressReasons::DEACTIVATE_REACTIVATE | SuppressReasons::DYNAMIC_RESIZE);

        let mut update = WireBuffer::with_capacity(4);
        update.write_u16_le(UPDATETYPE_SYNCHRONIZE);
        update.write_u16_le(0);
        self.send_data(out, DataPduType::Update, update.as_slice())?;
        info!("session up and running");
        Ok(RdpSignal::UpAndRunning)
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Queue a share control PDU whose body `write` produces.
    fn send_control_pdu(
        out: &mut Outbound<'_>,
        pdu_type: ShareControlType,
        write: impl FnOnce(&mut WireBuffer) -> Result<()>,
    ) -> Result<()> {
        let mut s = out.init();
        let start = s.pos();
        s.push_layer(Layer::Rdp, SHARE_CONTROL_HEADER_LEN);
        write(&mut s)?;
        s.mark_end();
        let total = u16::try_from(s.end() - start).map_err(|_| RdpError::ProtocolViolation("share control pdu too long"))?;
        s.pop_layer(Layer::Rdp)?;
        s.write_u16_le(total);
        s.write_u16_le(pdu_type as u16 | TS_PROTOCOL_VERSION);
        s.write_u16_le(SERVER_CHANNEL_ID);
        s.seek(s.end())?;
        out.send(s, GLOBAL_CHANNEL_ID)
    }

    /// Queue a data PDU, compressed once the session is up.
    pub fn send_data(&mut self, out: &mut Outbound<'_>, pdu_type: DataPduType, body: &[u8]) -> Result<()> {
        let compressed = if self.is_up() {
            self.mppc.as_mut().map(|c| c.compress(body))
        } else {
            None
        };
        let (compressed_type, payload) = match &compressed {
            Some(c) => (c.flags, c.data.as_deref()),
            None => (0, None),
        };
        // Both lengths count from the share control header.
        let uncompressed_len =
            u16::try_from(body.len() + RDP_HEADER_LEN).map_err(|_| RdpError::invalid("data pdu length", body.len() as u64))?;
        let compressed_len = match payload {
            Some(p) => u16::try_from(p.len() + RDP_HEADER_LEN).map_err(|_| RdpError::invalid("compressed pdu length", p.len() as u64))?,
            None => 0,
        };

        let mut s = out.init();
        let start = s.pos();
        s.push_layer(Layer::Rdp, RDP_HEADER_LEN);
        s.write_bytes(payload.unwrap_or(body));
        s.mark_end();
        let total = u16::try_from(s.end() - start).map_err(|_| RdpError::ProtocolViolation("data pdu too long"))?;
        s.pop_layer(Layer::Rdp)?;
        s.write_u16_le(total);
        s.write_u16_le(ShareControlType::Data as u16 | TS_PROTOCOL_VERSION);
        s.write_u16_le(SERVER_CHANNEL_ID);
        s.write_u32_le(SHARE_ID);
        s.write_u8(0);
        s.write_u8(STREAM_LOW);
        s.write_u16_le(uncompressed_len);
        s.write_u8(pdu_type as u8);
        s.write_u8(compressed_type);
        s.write_u16_le(compressed_len);
        s.seek(s.end())?;
        out.send(s, GLOBAL_CHANNEL_ID)
    }

    /// Queue the Demand Active PDU and wait for Confirm Active.
    pub fn send_demand_active(&mut self, out: &mut Outbound<'_>, info: &ClientInfo, config: &ServerConfig) -> Result<()> {
        self.expect(ActivationState::SendDemandActive, "DemandActive")?;
        Self::send_control_pdu(out, ShareControlType::DemandActive, |s| {
            s.write_u32_le(SHARE_ID);
            s.write_u16_le(SOURCE_DESCRIPTOR.len() as u16);
            let caps_len_at = s.pos();
            s.write_u16_le(0);
            s.write_bytes(SOURCE_DESCRIPTOR);
            let caps_at = s.pos();
            s.write_u16_le(0);
            s.write_u16_le(0);
            let count = caps::write_server_caps(s, config, info)?;
            let caps_end = s.pos();
            s.seek(caps_len_at)?;
            s.write_u16_le((caps_end - caps_at) as u16);
            s.seek(caps_at)?;
            s.write_u16_le(count);
            s.seek(caps_end)?;
            s.write_u32_le(0); // sessionId
            Ok(())
        })?;
        self.state = ActivationState::AwaitConfirmActive;
        info!(width = info.width, height = info.height, bpp = info.bpp, "demand active sent");
        Ok(())
    }

    /// Server-initiated deactivation: the Deactivate All PDU followed by
    /// a fresh Demand Active. Security and channel state are untouched.
    pub fn reactivate(&mut self, out: &mut Outbound<'_>, info: &ClientInfo, config: &ServerConfig) -> Result<()> {
        Self::send_control_pdu(out, ShareControlType::DeactivateAll, |s| {
            s.write_u32_le(SHARE_ID);
            s.write_u16_le(1);
            s.write_u8(0);
            Ok(())
        })?;
        self.state = ActivationState::SendDemandActive;
        self.suppress |= SuppressReasons::DEACTIVATE_REACTIVATE;
        self.send_demand_active(out, info, config)
    }

    /// Set Error Info: tells the client why the server is about to
    /// disconnect it.
    pub fn send_error_info(&mut self, out: &mut Outbound<'_>, error_info: u32) -> Result<()> {
        self.send_data(out, DataPduType::SetErrorInfo, &error_info.to_le_bytes())
    }

    /// Monitor Layout PDU, sent ahead of Demand Active.
    pub fn send_monitor_layout(&mut self, out: &mut Outbound<'_>, monitors: &[MonitorInfo]) -> Result<()> {
        let mut body = WireBuffer::with_capacity(4 + monitors.len() * 20);
        body.write_u32_le(monitors.len() as u32);
        for m in monitors {
            body.write_u32_le(m.left as u32);
            body.write_u32_le(m.top as u32);
            body.write_u32_le(m.right as u32);
            body.write_u32_le(m.bottom as u32);
            body.write_u32_le(if m.primary { TS_MONITOR_PRIMARY } else { 0 });
        }
        self.send_data(out, DataPduType::MonitorLayout, body.as_slice())
    }

    /// Slow-path screen update. Callers check
    /// [`can_send_updates`](Self::can_send_updates) first.
    pub fn send_update(&mut self, out: &mut Outbound<'_>, kind: UpdateKind, payload: &[u8]) -> Result<()> {
        let (pdu_type, header): (DataPduType, Vec<u8>) = match kind {
            UpdateKind::Orders => (DataPduType::Update, 0u16.to_le_bytes().to_vec()),
            UpdateKind::Bitmap => (DataPduType::Update, 1u16.to_le_bytes().to_vec()),
            UpdateKind::Palette => (DataPduType::Update, 2u16.to_le_bytes().to_vec()),
            UpdateKind::Synchronize => (DataPduType::Update, UPDATETYPE_SYNCHRONIZE.to_le_bytes().to_vec()),
            UpdateKind::PointerHidden => (DataPduType::Pointer, system_pointer(SYSPTR_NULL)),
            UpdateKind::PointerDefault => (DataPduType::Pointer, system_pointer(SYSPTR_DEFAULT)),
            UpdateKind::PointerPosition => (DataPduType::Pointer, pointer_header(TS_PTRMSGTYPE_POSITION)),
            UpdateKind::ColorPointer => (DataPduType::Pointer, pointer_header(TS_PTRMSGTYPE_COLOR)),
            UpdateKind::CachedPointer => (DataPduType::Pointer, pointer_header(TS_PTRMSGTYPE_CACHED)),
            UpdateKind::NewPointer => (DataPduType::Pointer, pointer_header(TS_PTRMSGTYPE_POINTER)),
            UpdateKind::SurfaceCommands | UpdateKind::LargePointer => {
                return Err(RdpError::UnexpectedPdu {
                    pdu: "fastpath-only update",
                    state: "slow-path output",
                });
            }
        };
        let mut body = header;
        body.extend_from_slice(payload);
        self.send_data(out, pdu_type, &body)
    }

    /// Server Redirection PDU in its enhanced security form.
    pub fn send_redirection(&mut self, out: &mut Outbound<'_>, redirect: &Redirection) -> Result<()> {
        let mut fields = WireBuffer::with_capacity(256);
        let mut flags = 0u32;
        let mut put = |flag: u32, bytes: &[u8]| {
            flags |= flag;
            fields.write_u32_le(bytes.len() as u32);
            fields.write_bytes(bytes);
        };
        if let Some(address) = &redirect.target_address {
            put(LB_TARGET_NET_ADDRESS, &encode_utf16_z(address));
        }
        if let Some(lb) = &redirect.load_balance_info {
            put(LB_LOAD_BALANCE_INFO, lb);
        }
        if let Some(user) = &redirect.username {
            put(LB_USERNAME, &encode_utf16_z(user));
        }
        if let Some(domain) = &redirect.domain {
            put(LB_DOMAIN, &encode_utf16_z(domain));
        }
        if let Some(password) = &redirect.password {
            put(LB_PASSWORD, password);
        }
        if let Some(fqdn) = &redirect.target_fqdn {
            put(LB_TARGET_FQDN, &encode_utf16_z(fqdn));
        }
        if let Some(name) = &redirect.target_netbios_name {
            put(LB_TARGET_NETBIOS_NAME, &encode_utf16_z(name));
        }

        let packet_len = u16::try_from(12 + fields.end()).map_err(|_| RdpError::ProtocolViolation("redirection packet too long"))?;
        Self::send_control_pdu(out, ShareControlType::ServerRedirect, |s| {
            s.write_u16_le(0);
            s.write_u16_le(SEC_REDIRECTION_PKT);
            s.write_u16_le(packet_len);
            s.write_u32_le(redirect.session_id);
            s.write_u32_le(flags);
            s.write_bytes(fields.as_slice());
            Ok(())
        })?;
        info!(session_id = redirect.session_id, redir_flags = flags, "server redirection sent");
        Ok(())
    }
}

// ── Bodies ───────────────────────────────────────────────────────

fn sync_body() -> [u8; 4] {
    let mut b = [0u8; 4];
    b[..2].copy_from_slice(&SYNCMSGTYPE_SYNC.to_le_bytes());
    b[2..].copy_from_slice(&SERVER_CHANNEL_ID.to_le_bytes());
    b
}

fn control_body(action: u16, grant_id: u16, control_id: u32) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[..2].copy_from_slice(&action.to_le_bytes());
    b[2..4].copy_from_slice(&grant_id.to_le_bytes());
    b[4..].copy_from_slice(&control_id.to_le_bytes());
    b
}

fn pointer_header(message_type: u16) -> Vec<u8> {
    let mut v = message_type.to_le_bytes().to_vec();
    v.extend_from_slice(&[0, 0]);
    v
}

fn system_pointer(kind: u32) -> Vec<u8> {
    let mut v = pointer_header(TS_PTRMSGTYPE_SYSTEM);
    v.extend_from_slice(&kind.to_le_bytes());
    v
}

fn read_rect(s: &mut WireBuffer) -> Result<Rect> {
    s.need(8, "rectangle")?;
    Ok(Rect {
        left: s.read_u16_le()?,
        top: s.read_u16_le()?,
        right: s.read_u16_le()?,
        bottom: s.read_u16_le()?,
    })
}

/// Slow-path `TS_INPUT_PDU_DATA`.
fn parse_input(s: &mut WireBuffer) -> Result<Vec<InputEvent>> {
    s.need(4, "input pdu")?;
    let count = usize::from(s.read_u16_le()?);
    s.skip(2, "input pdu padding")?;
    s.need(count * 12, "input events")?;
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let _time = s.read_u32_le()?;
        let message_type = s.read_u16_le()?;
        let event = match message_type {
            INPUT_EVENT_SYNC => {
                s.skip(2, "sync padding")?;
                InputEvent::Sync {
                    toggle_flags: s.read_u32_le()?,
                }
            }
            INPUT_EVENT_SCANCODE | INPUT_EVENT_UNICODE => {
                let flags = s.read_u16_le()?;
                let code = s.read_u16_le()?;
                s.skip(2, "keyboard padding")?;
                if message_type == INPUT_EVENT_SCANCODE {
                    InputEvent::Scancode { flags, code }
                } else {
                    InputEvent::Unicode { flags, code }
                }
            }
            INPUT_EVENT_MOUSE | INPUT_EVENT_MOUSEX => {
                let flags = s.read_u16_le()?;
                let x = s.read_u16_le()?;
                let y = s.read_u16_le()?;
                if message_type == INPUT_EVENT_MOUSE {
                    InputEvent::Mouse { flags, x, y }
                } else {
                    InputEvent::MouseX { flags, x, y }
                }
            }
            other => {
                return Err(RdpError::UnknownVariant {
                    type_name: "slow-path input event",
                    value: u64::from(other),
                });
            }
        };
        events.push(event);
    }
    Ok(events)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;

    use super::*;
    use crate::events::kbd;
    use crate::mcs::McsLayer;
    use crate::sec::SecLayer;

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) inputs: Vec<InputEvent>,
        pub(crate) suppress: Vec<bool>,
        pub(crate) frame_acks: Vec<u32>,
        pub(crate) refreshes: usize,
    }

    impl SessionEventSink for Recorder {
        fn on_input(&mut self, event: InputEvent) {
            self.inputs.push(event);
        }
        fn on_suppress_output(&mut self, suppress: bool, _rect: Option<Rect>) {
            self.suppress.push(suppress);
        }
        fn on_frame_ack(&mut self, frame_id: u32) {
            self.frame_acks.push(frame_id);
        }
        fn on_refresh_rect(&mut self, rects: &[Rect]) {
            self.refreshes += rects.len();
        }
    }

    pub(crate) fn share_control(pdu_type: ShareControlType, body: &[u8]) -> Vec<u8> {
        let mut v = ((body.len() + 6) as u16).to_le_bytes().to_vec();
        v.extend_from_slice(&(pdu_type as u16 | TS_PROTOCOL_VERSION).to_le_bytes());
        v.extend_from_slice(&1007u16.to_le_bytes());
        v.extend_from_slice(body);
        v
    }

    pub(crate) fn data_pdu(pdu_type: DataPduType, body: &[u8]) -> Vec<u8> {
        let mut v = SHARE_ID.to_le_bytes().to_vec();
        v.extend_from_slice(&[0, STREAM_LOW]);
        v.extend_from_slice(&((body.len() + 4) as u16).to_le_bytes());
        v.extend_from_slice(&[pdu_type as u8, 0, 0, 0]);
        v.extend_from_slice(body);
        share_control(ShareControlType::Data, &v)
    }

    pub(crate) fn confirm_active(sets: &[Vec<u8>]) -> Vec<u8> {
        let caps: Vec<u8> = sets.concat();
        let mut v = SHARE_ID.to_le_bytes().to_vec();
        v.extend_from_slice(&SERVER_CHANNEL_ID.to_le_bytes());
        v.extend_from_slice(&6u16.to_le_bytes());
        v.extend_from_slice(&((caps.len() + 4) as u16).to_le_bytes());
        v.extend_from_slice(b"MSTSC\0");
        v.extend_from_slice(&(sets.len() as u16).to_le_bytes());
        v.extend_from_slice(&[0, 0]);
        v.extend_from_slice(&caps);
        share_control(ShareControlType::ConfirmActive, &v)
    }

    /// The finalization PDUs a client sends after Confirm Active.
    pub(crate) fn finalization() -> Vec<u8> {
        let mut v = data_pdu(DataPduType::Synchronize, &[1, 0, 0xEA, 0x03]);
        v.extend(data_pdu(DataPduType::Control, &control_body(CTRLACTION_COOPERATE, 0, 0)));
        v.extend(data_pdu(DataPduType::Control, &control_body(CTRLACTION_REQUEST_CONTROL, 0, 0)));
        v.extend(data_pdu(DataPduType::FontList, &[0, 0, 0, 0, 3, 0, 0x32, 0]));
        v
    }

    struct Harness {
        rdp: RdpLayer,
        sec: SecLayer,
        mcs: McsLayer,
        queue: VecDeque<Bytes>,
        info: ClientInfo,
        config: ServerConfig,
        sink: Recorder,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                rdp: RdpLayer::new(),
                sec: SecLayer::new(),
                mcs: McsLayer::new(false),
                queue: VecDeque::new(),
                info: ClientInfo {
                    width: 800,
                    height: 600,
                    bpp: 16,
                    ..ClientInfo::default()
                },
                config: ServerConfig::default(),
                sink: Recorder::default(),
            }
        }

        fn with_out<R>(&mut self, f: impl FnOnce(&mut RdpLayer, &mut Outbound<'_>, &ClientInfo, &ServerConfig) -> R) -> R {
            let mut out = Outbound {
                sec: &mut self.sec,
                mcs: &self.mcs,
                queue: &mut self.queue,
            };
            f(&mut self.rdp, &mut out, &self.info, &self.config)
        }

        fn feed(&mut self, bytes: &[u8]) -> Result<RdpSignal> {
            let mut out = Outbound {
                sec: &mut self.sec,
                mcs: &self.mcs,
                queue: &mut self.queue,
            };
            self.rdp.recv(
                &mut WireBuffer::from_slice(bytes),
                &mut out,
                &mut self.info,
                &self.config,
                &mut self.sink,
            )
        }

        fn demand_active(&mut self) {
            self.with_out(|rdp, out, info, config| rdp.send_demand_active(out, info, config))
                .unwrap();
        }

        fn activate(&mut self) {
            self.demand_active();
            self.feed(&confirm_active(&[])).unwrap();
            assert_eq!(self.feed(&finalization()).unwrap(), RdpSignal::UpAndRunning);
        }

        /// Data PDU types queued since the last call, by `pduType2`.
        fn sent_data_types(&mut self) -> Vec<u8> {
            // TPKT 4 + X.224 3 + SDIN 7 (short length) + share control 6 + share data 8.
            self.queue
                .drain(..)
                .filter(|f| f.len() > 28 && f[16] & 0x0F == ShareControlType::Data as u8)
                .map(|f| f[28])
                .collect()
        }
    }

    #[test]
    fn full_activation_sequence() {
        let mut h = Harness::new();
        h.demand_active();
        assert_eq!(h.rdp.state(), ActivationState::AwaitConfirmActive);
        h.queue.clear();

        h.feed(&confirm_active(&[])).unwrap();
        assert_eq!(h.rdp.state(), ActivationState::AwaitControlRequest);
        assert!(!h.rdp.can_send_updates());

        let signal = h.feed(&finalization()).unwrap();
        assert_eq!(signal, RdpSignal::UpAndRunning);
        assert!(h.rdp.can_send_updates());
        assert_eq!(
            h.sent_data_types(),
            vec![
                DataPduType::Synchronize as u8,
                DataPduType::Control as u8,
                DataPduType::Control as u8,
                DataPduType::FontMap as u8,
                DataPduType::Update as u8,
            ]
        );
    }

    #[test]
    fn finalization_states_track_what_is_missing() {
        let mut h = Harness::new();
        h.demand_active();
        h.feed(&confirm_active(&[])).unwrap();
        h.feed(&data_pdu(DataPduType::Control, &control_body(CTRLACTION_REQUEST_CONTROL, 0, 0)))
            .unwrap();
        assert_eq!(h.rdp.state(), ActivationState::AwaitSynchronize);
        h.feed(&data_pdu(DataPduType::Synchronize, &[1, 0, 0xEA, 0x03])).unwrap();
        assert_eq!(h.rdp.state(), ActivationState::AwaitFontList);
        h.feed(&data_pdu(DataPduType::FontList, &[0, 0, 0, 0, 1, 0, 0x32, 0]))
            .unwrap();
        assert_eq!(h.rdp.state(), ActivationState::AwaitFontList);
        h.feed(&data_pdu(DataPduType::FontList, &[0, 0, 0, 0, 2, 0, 0x32, 0]))
            .unwrap();
        assert!(h.rdp.is_up());
    }

    #[test]
    fn early_font_list_does_not_skip_finalization() {
        let mut h = Harness::new();
        h.demand_active();
        h.feed(&confirm_active(&[])).unwrap();
        h.feed(&data_pdu(DataPduType::FontList, &[0, 0, 0, 0, 1, 0, 0x32, 0]))
            .unwrap();
        assert_eq!(h.rdp.state(), ActivationState::AwaitControlRequest);
        h.feed(&data_pdu(DataPduType::Control, &control_body(CTRLACTION_REQUEST_CONTROL, 0, 0)))
            .unwrap();
        h.feed(&data_pdu(DataPduType::FontList, &[0, 0, 0, 0, 1, 0, 0x32, 0]))
            .unwrap();
        assert_eq!(h.rdp.state(), ActivationState::AwaitSynchronize);
    }

    #[test]
    fn deactivate_all_before_confirm_active_is_rejected() {
        let deactivate = share_control(ShareControlType::DeactivateAll, &[0xEA, 0x03, 0x01, 0x00, 0x01, 0x00, 0x00]);
        let mut h = Harness::new();
        assert!(matches!(
            h.feed(&deactivate),
            Err(RdpError::UnexpectedPdu { state: "SendDemandActive", .. })
        ));
        h.demand_active();
        assert!(matches!(
            h.feed(&deactivate),
            Err(RdpError::UnexpectedPdu { state: "AwaitConfirmActive", .. })
        ));
    }

    #[test]
    fn confirm_active_out_of_order_is_rejected() {
        let mut h = Harness::new();
        let err = h.feed(&confirm_active(&[])).unwrap_err();
        assert!(matches!(err, RdpError::UnexpectedPdu { .. }));
    }

    #[test]
    fn deactivate_all_restarts_activation() {
        let mut h = Harness::new();
        h.activate();
        let signal = h.feed(&share_control(ShareControlType::DeactivateAll, &[0xEA, 0x03, 0x01, 0x00, 0x01, 0x00, 0x00]))
            .unwrap();
        assert_eq!(signal, RdpSignal::DemandActiveDue);
        assert_eq!(h.rdp.state(), ActivationState::SendDemandActive);
        assert!(!h.rdp.can_send_updates());
        h.activate();
        assert!(h.rdp.can_send_updates());
    }

    #[test]
    fn client_suppression_survives_reactivation() {
        let mut h = Harness::new();
        h.activate();
        h.feed(&data_pdu(DataPduType::SuppressOutput, &[0, 0, 0, 0])).unwrap();
        assert!(!h.rdp.can_send_updates());

        h.with_out(|rdp, out, info, config| rdp.reactivate(out, info, config))
            .unwrap();
        h.feed(&confirm_active(&[])).unwrap();
        h.feed(&finalization()).unwrap();
        assert_eq!(h.rdp.suppressed(), SuppressReasons::CLIENT_REQUEST);

        let mut allow = vec![1, 0, 0, 0];
        allow.extend_from_slice(&[0, 0, 0, 0, 0x1F, 0x03, 0x57, 0x02]);
        h.feed(&data_pdu(DataPduType::SuppressOutput, &allow)).unwrap();
        assert!(h.rdp.can_send_updates());
        assert_eq!(h.sink.suppress, vec![true, false]);
    }

    #[test]
    fn slow_path_input_is_forwarded() {
        let mut h = Harness::new();
        h.activate();
        let mut body = vec![2, 0, 0, 0];
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(&INPUT_EVENT_SCANCODE.to_le_bytes());
        body.extend_from_slice(&kbd::RELEASE.to_le_bytes());
        body.extend_from_slice(&0x1Eu16.to_le_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(&INPUT_EVENT_SYNC.to_le_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&2u32.to_le_bytes());
        h.feed(&data_pdu(DataPduType::Input, &body)).unwrap();
        assert_eq!(
            h.sink.inputs,
            vec![
                InputEvent::Scancode {
                    flags: kbd::RELEASE,
                    code: 0x1E
                },
                InputEvent::Sync { toggle_flags: 2 },
            ]
        );
    }

    #[test]
    fn flow_pdus_and_multiple_pdus_in_one_payload() {
        let mut h = Harness::new();
        h.activate();
        let mut bytes = vec![0x00, 0x80, 0x00, 0x42, 0x01, 0x00, 0xEF, 0x03];
        bytes.extend(data_pdu(DataPduType::FrameAcknowledge, &7u32.to_le_bytes()));
        bytes.extend(data_pdu(DataPduType::FrameAcknowledge, &8u32.to_le_bytes()));
        h.feed(&bytes).unwrap();
        assert_eq!(h.sink.frame_acks, vec![7, 8]);
    }

    #[test]
    fn shutdown_is_denied() {
        let mut h = Harness::new();
        h.activate();
        h.queue.clear();
        h.feed(&data_pdu(DataPduType::ShutdownRequest, &[])).unwrap();
        assert_eq!(h.sent_data_types(), vec![DataPduType::ShutdownDenied as u8]);
    }

    #[test]
    fn uncompressed_length_covers_the_whole_pdu() {
        let mut h = Harness::new();
        h.activate();
        h.queue.clear();
        h.feed(&data_pdu(DataPduType::ShutdownRequest, &[])).unwrap();
        let frame = h.queue.pop_front().unwrap();
        let total = u16::from_le_bytes([frame[14], frame[15]]);
        assert_eq!(usize::from(total), RDP_HEADER_LEN);
        assert_eq!(u16::from_le_bytes([frame[26], frame[27]]), total);
    }

    #[test]
    fn truncated_share_control_fails() {
        let mut h = Harness::new();
        let mut bytes = data_pdu(DataPduType::FrameAcknowledge, &7u32.to_le_bytes());
        bytes.truncate(bytes.len() - 2);
        assert!(h.feed(&bytes).unwrap_err().is_parse_error());
    }

    #[test]
    fn compressed_data_once_up() {
        let mut h = Harness::new();
        h.rdp.enable_compression(Some(CompressionType::Mppc64K), &ServerConfig::default());
        h.activate();
        h.queue.clear();
        let payload = vec![0x41; 400];
        h.with_out(|rdp, out, _, _| rdp.send_update(out, UpdateKind::Bitmap, &payload))
            .unwrap();
        let frame = h.queue.pop_front().unwrap();
        // compressedType follows pduType2.
        assert_eq!(frame[29] & PACKET_COMPRESSED, PACKET_COMPRESSED);
        assert!(frame.len() < 100);
        let uncompressed = usize::from(u16::from_le_bytes([frame[26], frame[27]]));
        assert!(uncompressed >= payload.len() + RDP_HEADER_LEN);
    }

    #[test]
    fn surface_commands_need_fastpath() {
        let mut h = Harness::new();
        let sent = h.with_out(|rdp, out, _, _| rdp.send_update(out, UpdateKind::SurfaceCommands, &[]));
        assert!(sent.is_err());
    }

    #[test]
    fn redirection_pdu_layout() {
        let mut h = Harness::new();
        let redirect = Redirection {
            session_id: 5,
            target_address: Some("10.0.0.9".into()),
            load_balance_info: Some(b"Cookie: msts=1\r\n".to_vec()),
            ..Redirection::default()
        };
        h.with_out(|rdp, out, _, _| rdp.send_redirection(out, &redirect))
            .unwrap();
        let frame = h.queue.pop_front().unwrap();
        let body = &frame[14..];
        assert_eq!(body[2] & 0x0F, ShareControlType::ServerRedirect as u8);
        assert_eq!(u16::from_le_bytes([body[8], body[9]]), SEC_REDIRECTION_PKT);
        let packet_len = usize::from(u16::from_le_bytes([body[10], body[11]]));
        assert_eq!(packet_len, body.len() - 8);
        let flags = u32::from_le_bytes([body[16], body[17], body[18], body[19]]);
        assert_eq!(flags, LB_TARGET_NET_ADDRESS | LB_LOAD_BALANCE_INFO);
    }
}
