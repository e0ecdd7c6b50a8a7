//! Sans-IO server session: one client connection from X.224 negotiation
//! to disconnect.
//!
//! The driver hands every complete frame to
//! [`process_frame`](ServerSession::process_frame) and writes out whatever
//! [`take_outbound`](ServerSession::take_outbound) returns. Nothing in here
//! touches a socket, so the whole connection sequence can be exercised in
//! plain unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::channel::drdynvc::{DRDYNVC_NAME, DrdynvcLayer, DvcEvent};
use crate::channel::ChannelLayer;
use crate::client_info::ClientInfo;
use crate::config::ServerContext;
use crate::error::{RdpError, Result};
use crate::events::{DisconnectReason, SessionEventSink, UpdateKind};
use crate::fastpath;
use crate::iso::{IsoLayer, Negotiation, Protocols};
use crate::mcs::{ChannelItem, GLOBAL_CHANNEL_ID, McsEvent, McsLayer, McsState};
use crate::rdp::{RdpLayer, RdpSignal, Redirection, SuppressReasons};
use crate::sec::gcc::{early, MAX_DESKTOP_SIZE, MIN_DESKTOP_SIZE};
use crate::sec::{Outbound, SecEvent, SecLayer};
use crate::stream::WireBuffer;

// ── SessionPhase ─────────────────────────────────────────────────

/// Where the connection sequence stands.
///
/// ```text
///  Negotiating ──► [AwaitTransportUpgrade] ──► ConnectingMcs ──► Activating
///       │                                                         │  ▲
///       │                                                         ▼  │ reactivate
///       └──────────────────────► Closed ◄──────────────────────  Active
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Negotiating,
    /// TLS was selected; the driver must upgrade the transport.
    AwaitTransportUpgrade,
    /// MCS connect, security exchange and Client Info.
    ConnectingMcs,
    /// Licensing done, capability exchange and finalization running.
    Activating,
    Active {
        since: Instant,
    },
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Negotiating => write!(f, "Negotiating"),
            Self::AwaitTransportUpgrade => write!(f, "AwaitTransportUpgrade"),
            Self::ConnectingMcs => write!(f, "ConnectingMcs"),
            Self::Activating => write!(f, "Activating"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl SessionPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// How long the session has been active; `None` in any other phase.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// Client Info has been accepted.
    fn logged_on(&self) -> bool {
        matches!(self, Self::Activating | Self::Active { .. })
    }
}

/// What the driver must do after a frame was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Continue,
    /// Flush the outbound queue, then wrap the transport in TLS and call
    /// [`ServerSession::transport_upgraded`].
    UpgradeTransport,
    /// Flush the outbound queue and close the transport.
    Disconnect(DisconnectReason),
}

// ── ServerSession ────────────────────────────────────────────────

pub struct ServerSession {
    ctx: Arc<ServerContext>,
    phase: SessionPhase,
    iso: IsoLayer,
    mcs: McsLayer,
    sec: SecLayer,
    rdp: RdpLayer,
    channels: ChannelLayer,
    dvc: DrdynvcLayer,
    info: ClientInfo,
    outbound: VecDeque<Bytes>,
    sink: Box<dyn SessionEventSink>,
    closed: Option<DisconnectReason>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("phase", &self.phase)
            .field("iso", &self.iso.state())
            .field("mcs", &self.mcs.state())
            .field("sec", &self.sec)
            .field("rdp", &self.rdp.state())
            .field("outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

impl ServerSession {
    pub fn new(ctx: Arc<ServerContext>, sink: Box<dyn SessionEventSink>) -> Self {
        let strict_join = ctx.config.strict_channel_join;
        Self {
            ctx,
            phase: SessionPhase::Negotiating,
            iso: IsoLayer::new(),
            mcs: McsLayer::new(strict_join),
            sec: SecLayer::new(),
            rdp: RdpLayer::new(),
            channels: ChannelLayer::new(),
            dvc: DrdynvcLayer::new(),
            info: ClientInfo::default(),
            outbound: VecDeque::new(),
            sink,
            closed: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn client_info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn selected_protocol(&self) -> Protocols {
        self.iso.selected
    }

    pub fn static_channels(&self) -> &[ChannelItem] {
        self.mcs.channels()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Everything queued for the client, in send order.
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        self.outbound.drain(..).collect()
    }

    fn out(&mut self) -> Outbound<'_> {
        Outbound {
            sec: &mut self.sec,
            mcs: &self.mcs,
            queue: &mut self.outbound,
        }
    }

    /// Why the session closed; `None` while it is open.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.closed
    }

    fn close(&mut self, reason: DisconnectReason) {
        if !self.phase.is_closed() {
            self.phase = SessionPhase::Closed;
            self.closed = Some(reason);
            self.sink.on_disconnect(reason);
        }
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Process one complete TPKT or fastpath frame.
    ///
    /// Any error closes the session; the caller drops the transport.
    pub fn process_frame(&mut self, frame: &[u8]) -> Result<SessionOutcome> {
        if self.phase.is_closed() {
            return Err(RdpError::Disconnected);
        }
        match self.dispatch(frame) {
            Ok(outcome) => {
                if let SessionOutcome::Disconnect(reason) = outcome {
                    self.close(reason);
                }
                Ok(outcome)
            }
            Err(RdpError::Disconnected) => {
                self.close(DisconnectReason::ClientRequested);
                Ok(SessionOutcome::Disconnect(DisconnectReason::ClientRequested))
            }
            Err(e) => {
                error!(phase = %self.phase, error = %e, "closing session");
                self.close(DisconnectReason::ProtocolError);
                Err(e)
            }
        }
    }

    /// The transport ended without a disconnect PDU.
    pub fn transport_closed(&mut self) {
        self.close(DisconnectReason::ClientRequested);
    }

    /// The transport or frame codec failed.
    pub fn transport_failed(&mut self) {
        self.close(DisconnectReason::ProtocolError);
    }

    fn dispatch(&mut self, frame: &[u8]) -> Result<SessionOutcome> {
        let first = *frame.first().ok_or(RdpError::truncated("frame", 1, 0))?;
        let mut s = WireBuffer::from_slice(frame);

        match self.phase {
            SessionPhase::Negotiating => return self.negotiate(&mut s),
            SessionPhase::AwaitTransportUpgrade => {
                return Err(RdpError::UnexpectedPdu {
                    pdu: "frame before TLS upgrade",
                    state: "AwaitTransportUpgrade",
                });
            }
            _ => {}
        }

        if fastpath::is_fastpath(first) {
            if !self.phase.logged_on() {
                return Err(RdpError::UnexpectedPdu {
                    pdu: "fastpath input",
                    state: "not logged on",
                });
            }
            for event in fastpath::parse_input(&mut s, &mut self.sec)? {
                self.sink.on_input(event);
            }
            return Ok(SessionOutcome::Continue);
        }

        self.iso.recv(&mut s)?;
        if self.mcs.state() == McsState::AwaitConnectInitial {
            let user_data = self.mcs.recv_connect_initial(&mut s)?;
            let gcc = self.sec.process_connect_initial(
                &user_data,
                &self.ctx,
                self.iso.selected,
                self.iso.requested,
                &mut self.mcs,
                &mut self.info,
            )?;
            let reply = self.mcs.connect_response(&gcc)?;
            self.outbound.push_back(reply.into_bytes());
            return Ok(SessionOutcome::Continue);
        }

        match self.mcs.recv(&mut s)? {
            McsEvent::Handled => Ok(SessionOutcome::Continue),
            McsEvent::Reply(reply) => {
                self.outbound.push_back(reply.into_bytes());
                Ok(SessionOutcome::Continue)
            }
            McsEvent::AttachUser => {
                let confirm = self.mcs.attach_user_confirm()?;
                self.outbound.push_back(confirm.into_bytes());
                Ok(SessionOutcome::Continue)
            }
            McsEvent::Disconnect => Ok(SessionOutcome::Disconnect(DisconnectReason::ClientRequested)),
            McsEvent::Data { channel_id } => self.recv_data(&mut s, channel_id),
        }
    }

    fn negotiate(&mut self, s: &mut WireBuffer) -> Result<SessionOutcome> {
        self.iso.recv_connection_request(s)?;
        let (outcome, confirm) = self.iso.negotiate(&self.ctx)?;
        self.outbound.push_back(confirm.into_bytes());
        match outcome {
            Negotiation::Failed(code) => {
                info!(%code, "negotiation failure sent");
                Ok(SessionOutcome::Disconnect(DisconnectReason::NegotiationFailed))
            }
            Negotiation::Selected(protocol) if protocol.uses_tls() => {
                self.phase = SessionPhase::AwaitTransportUpgrade;
                Ok(SessionOutcome::UpgradeTransport)
            }
            Negotiation::Selected(_) => {
                self.iso.establish()?;
                self.phase = SessionPhase::ConnectingMcs;
                Ok(SessionOutcome::Continue)
            }
        }
    }

    /// The driver finished the TLS handshake.
    pub fn transport_upgraded(&mut self) -> Result<()> {
        if self.phase != SessionPhase::AwaitTransportUpgrade {
            return Err(RdpError::UnexpectedPdu {
                pdu: "transport upgrade",
                state: "no upgrade pending",
            });
        }
        self.iso.establish()?;
        self.phase = SessionPhase::ConnectingMcs;
        info!(protocol = ?self.iso.selected, "transport secured");
        Ok(())
    }

    fn recv_data(&mut self, s: &mut WireBuffer, channel_id: u16) -> Result<SessionOutcome> {
        let event = self.sec.recv(s, self.ctx.keys.as_ref(), &self.ctx.config, &mut self.info)?;
        match event {
            SecEvent::KeysEstablished | SecEvent::License => Ok(SessionOutcome::Continue),
            SecEvent::LoggedOn => {
                self.logged_on()?;
                Ok(SessionOutcome::Continue)
            }
            SecEvent::Data if !self.phase.logged_on() => Err(RdpError::UnexpectedPdu {
                pdu: "data before client info",
                state: "ConnectingMcs",
            }),
            SecEvent::Data if channel_id == GLOBAL_CHANNEL_ID => self.recv_share_control(s),
            SecEvent::Data => {
                self.recv_channel(s, channel_id)?;
                Ok(SessionOutcome::Continue)
            }
        }
    }

    /// Client Info accepted: license, then start activation.
    fn logged_on(&mut self) -> Result<()> {
        info!(
            user = %self.info.logon.username,
            domain = %self.info.logon.domain,
            width = self.info.width,
            height = self.info.height,
            bpp = self.info.bpp,
            "client logged on"
        );
        self.rdp.enable_compression(self.info.logon.compression, &self.ctx.config);
        self.sink.on_logon(&self.info);

        let license = self.sec.license_pdu(&self.mcs)?;
        self.outbound.push_back(license.into_bytes());
        self.phase = SessionPhase::Activating;

        if self.info.early_capability_flags & early::SUPPORT_MONITOR_LAYOUT_PDU != 0 && !self.info.monitors.is_empty() {
            let monitors = self.info.monitors.clone();
            let mut out = Outbound {
                sec: &mut self.sec,
                mcs: &self.mcs,
                queue: &mut self.outbound,
            };
            self.rdp.send_monitor_layout(&mut out, &monitors)?;
        }
        self.demand_active()
    }

    fn demand_active(&mut self) -> Result<()> {
        let mut out = Outbound {
            sec: &mut self.sec,
            mcs: &self.mcs,
            queue: &mut self.outbound,
        };
        self.rdp.send_demand_active(&mut out, &self.info, &self.ctx.config)?;
        self.sink.on_demand_active_sent();
        Ok(())
    }

    fn recv_share_control(&mut self, s: &mut WireBuffer) -> Result<SessionOutcome> {
        let mut out = Outbound {
            sec: &mut self.sec,
            mcs: &self.mcs,
            queue: &mut self.outbound,
        };
        let signal = self
            .rdp
            .recv(s, &mut out, &mut self.info, &self.ctx.config, self.sink.as_mut())?;
        match signal {
            RdpSignal::Continue => {}
            RdpSignal::UpAndRunning => {
                self.phase = SessionPhase::Active { since: Instant::now() };
                self.sink.on_session_ready(&self.info);
                self.start_drdynvc()?;
            }
            RdpSignal::DemandActiveDue => {
                self.phase = SessionPhase::Activating;
                self.demand_active()?;
            }
        }
        Ok(SessionOutcome::Continue)
    }

    fn start_drdynvc(&mut self) -> Result<()> {
        let Some(channel) = self.mcs.channel_by_name(DRDYNVC_NAME).filter(|c| c.allowed).cloned() else {
            return Ok(());
        };
        if let Some(caps) = self.dvc.caps_request() {
            debug!(chan_id = channel.chan_id, "drdynvc capability request");
            ChannelLayer::send(&mut self.out(), &channel, &caps)?;
        }
        Ok(())
    }

    fn recv_channel(&mut self, s: &mut WireBuffer, channel_id: u16) -> Result<()> {
        if channel_id == self.mcs.user_channel() {
            debug!(channel_id, "ignoring data on the user channel");
            return Ok(());
        }
        let channel = self
            .mcs
            .channel(channel_id)
            .cloned()
            .ok_or(RdpError::invalid("static channel id", channel_id))?;
        let Some(message) = self.channels.recv(s, &channel, &self.ctx.config)? else {
            return Ok(());
        };

        if !channel.name.eq_ignore_ascii_case(DRDYNVC_NAME) {
            self.sink
                .on_channel_data(message.channel_id, message.flags, &message.data, message.total_len);
            return Ok(());
        }
        let event = self
            .dvc
            .recv(&mut WireBuffer::from_slice(&message.data), &self.ctx.config)?;
        match event {
            None => {}
            Some(DvcEvent::Ready { .. }) => self.sink.on_drdynvc_ready(),
            Some(DvcEvent::Opened { chan_id, name, success }) => {
                self.sink.on_dynamic_channel_open(&name, chan_id, success)
            }
            Some(DvcEvent::Data { chan_id, data }) => self.sink.on_dynamic_channel_data(chan_id, &data),
            Some(DvcEvent::Closed { chan_id }) => self.sink.on_dynamic_channel_close(chan_id),
        }
        Ok(())
    }

    // ── Commands ─────────────────────────────────────────────────

    fn require_logged_on(&self, what: &'static str) -> Result<()> {
        if self.phase.logged_on() {
            Ok(())
        } else {
            Err(RdpError::UnexpectedPdu {
                pdu: what,
                state: "session not logged on",
            })
        }
    }

    /// Send a screen update. Returns `false` when output is currently
    /// suppressed and the update was dropped.
    pub fn send_update(&mut self, kind: UpdateKind, payload: &[u8]) -> Result<bool> {
        if !self.rdp.can_send_updates() {
            debug!(?kind, suppressed = ?self.rdp.suppressed(), "update dropped");
            return Ok(false);
        }
        let fastpath_output = self.info.fastpath_output && self.ctx.config.fastpath.output();
        let mut out = Outbound {
            sec: &mut self.sec,
            mcs: &self.mcs,
            queue: &mut self.outbound,
        };
        if fastpath_output {
            fastpath::send_update(&mut out, kind.into(), payload, self.rdp.compressor())?;
        } else {
            self.rdp.send_update(&mut out, kind, payload)?;
        }
        Ok(true)
    }

    /// Send a message on a static channel, chunked as needed.
    pub fn send_channel_data(&mut self, channel_id: u16, data: &[u8]) -> Result<()> {
        self.require_logged_on("channel data")?;
        let channel = self
            .mcs
            .channel(channel_id)
            .cloned()
            .ok_or(RdpError::invalid("static channel id", channel_id))?;
        ChannelLayer::send(&mut self.out(), &channel, data)
    }

    fn drdynvc_channel(&self) -> Result<ChannelItem> {
        self.mcs
            .channel_by_name(DRDYNVC_NAME)
            .filter(|c| c.allowed)
            .cloned()
            .ok_or(RdpError::UnexpectedPdu {
                pdu: "dynamic channel",
                state: "drdynvc not joined",
            })
    }

    /// Ask the client to open a dynamic channel. The outcome arrives as
    /// [`SessionEventSink::on_dynamic_channel_open`].
    pub fn open_dynamic_channel(&mut self, name: &str) -> Result<u32> {
        let channel = self.drdynvc_channel()?;
        let (chan_id, request) = self.dvc.open(name)?;
        ChannelLayer::send(&mut self.out(), &channel, &request)?;
        Ok(chan_id)
    }

    pub fn send_dynamic_channel_data(&mut self, chan_id: u32, data: &[u8]) -> Result<()> {
        let channel = self.drdynvc_channel()?;
        for message in self.dvc.data(chan_id, data)? {
            ChannelLayer::send(&mut self.out(), &channel, &message)?;
        }
        Ok(())
    }

    pub fn close_dynamic_channel(&mut self, chan_id: u32) -> Result<()> {
        let channel = self.drdynvc_channel()?;
        let request = self.dvc.close(chan_id)?;
        ChannelLayer::send(&mut self.out(), &channel, &request)?;
        self.sink.on_dynamic_channel_close(chan_id);
        Ok(())
    }

    /// Deactivate and reactivate the session at a new desktop size.
    /// Security and channel state are kept.
    pub fn reactivate(&mut self, width: u16, height: u16) -> Result<()> {
        if !self.phase.is_active() {
            return Err(RdpError::UnexpectedPdu {
                pdu: "reactivation",
                state: "session not active",
            });
        }
        if !(MIN_DESKTOP_SIZE..=MAX_DESKTOP_SIZE).contains(&width) {
            return Err(RdpError::invalid("desktop width", width));
        }
        if !(MIN_DESKTOP_SIZE..=MAX_DESKTOP_SIZE).contains(&height) {
            return Err(RdpError::invalid("desktop height", height));
        }
        if (width, height) != (self.info.width, self.info.height) {
            if !self.info.desktop_resize {
                return Err(RdpError::NegotiationMismatch("client does not support desktop resize"));
            }
            self.rdp.suppress(SuppressReasons::DYNAMIC_RESIZE);
            self.info.width = width;
            self.info.height = height;
        }
        info!(width, height, "reactivating session");
        let mut out = Outbound {
            sec: &mut self.sec,
            mcs: &self.mcs,
            queue: &mut self.outbound,
        };
        self.rdp.reactivate(&mut out, &self.info, &self.ctx.config)?;
        self.phase = SessionPhase::Activating;
        self.sink.on_demand_active_sent();
        Ok(())
    }

    /// End the session from the server side: Set Error Info when the
    /// client understands it, then the MCS disconnect ultimatum.
    pub fn disconnect(&mut self, error_info: u32) -> Result<()> {
        if self.phase.is_closed() {
            return Ok(());
        }
        let errinfo_supported = self.info.early_capability_flags & early::SUPPORT_ERRINFO_PDU != 0;
        if self.phase.logged_on() && errinfo_supported {
            let mut out = Outbound {
                sec: &mut self.sec,
                mcs: &self.mcs,
                queue: &mut self.outbound,
            };
            if let Err(e) = self.rdp.send_error_info(&mut out, error_info) {
                warn!(error = %e, "could not queue set error info");
            }
        }
        if self.mcs.state() == McsState::Established {
            let ultimatum = McsLayer::disconnect_ultimatum()?;
            self.outbound.push_back(ultimatum.into_bytes());
        }
        info!(error_info, "server disconnect");
        self.close(DisconnectReason::Server { error_info });
        Ok(())
    }

    /// Redirect the client to another server. The session stays open
    /// until the client disconnects.
    pub fn redirect(&mut self, redirection: &Redirection) -> Result<()> {
        self.require_logged_on("server redirection")?;
        let mut out = Outbound {
            sec: &mut self.sec,
            mcs: &self.mcs,
            queue: &mut self.outbound,
        };
        self.rdp.send_redirection(&mut out, redirection)
    }
}

// ── Tests ────────────────────────────────────────────────────────
