//! TPKT / X.224 framing and security protocol negotiation.
//!
//! ## Wire format
//!
//! ```text
//! TPKT:   version=3 (1) | reserved (1) | length u16be (2)
//! X.224:  LI (1) | code (1) | ...
//!         CR/CC: dst-ref u16 | src-ref u16 | class u8 | [cookie] [RDP_NEG_*]
//!         DT:    EOT (1)                                  (LI = 2)
//! ```

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::config::{SecurityLayer, ServerContext};
use crate::error::{RdpError, Result};
use crate::stream::{Layer, WireBuffer};

// ── Constants ────────────────────────────────────────────────────

pub const TPKT_VERSION: u8 = 3;
pub const TPKT_HEADER_SIZE: usize = 4;
/// TPKT plus the 3-byte X.224 data header.
pub const ISO_DATA_HEADER_SIZE: usize = 7;

const X224_CR: u8 = 0xE0;
const X224_CC: u8 = 0xD0;
const X224_DR: u8 = 0x80;
const X224_DT: u8 = 0xF0;
const X224_EOT: u8 = 0x80;

const RDP_NEG_REQ: u8 = 0x01;
const RDP_NEG_RSP: u8 = 0x02;
const RDP_NEG_FAILURE: u8 = 0x03;
const RDP_CORRELATION_INFO: u8 = 0x06;
const RDP_NEG_LENGTH: u16 = 8;
const RDP_CORRELATION_INFO_LENGTH: usize = 36;
const CORRELATION_INFO_PRESENT: u8 = 0x08;

/// Upper bound for the routing token / cookie line.
const MAX_COOKIE_LEN: usize = 1024;

bitflags! {
    /// `requestedProtocols` / `selectedProtocol` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Protocols: u32 {
        const SSL = 0x0000_0001;
        const HYBRID = 0x0000_0002;
        const RDSTLS = 0x0000_0004;
        const HYBRID_EX = 0x0000_0008;
    }
}

impl Protocols {
    /// `PROTOCOL_RDP` is the absence of every bit.
    pub const RDP: Protocols = Protocols::empty();

    /// Whether the selected protocol runs over a TLS-wrapped transport.
    pub fn uses_tls(self) -> bool {
        self.intersects(Protocols::SSL | Protocols::HYBRID | Protocols::HYBRID_EX)
    }
}

bitflags! {
    /// `RDP_NEG_RSP` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NegotiationFlags: u8 {
        const EXTENDED_CLIENT_DATA_SUPPORTED = 0x01;
        const DYNVC_GFX_PROTOCOL_SUPPORTED = 0x02;
        const RESTRICTED_ADMIN_MODE_SUPPORTED = 0x08;
        const REDIRECTED_AUTHENTICATION_MODE_SUPPORTED = 0x10;
    }
}

/// `RDP_NEG_FAILURE` codes (MS-RDPBCGR 2.2.1.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FailureCode {
    SslRequiredByServer = 0x01,
    SslNotAllowedByServer = 0x02,
    SslCertNotOnServer = 0x03,
    InconsistentFlags = 0x04,
    HybridRequiredByServer = 0x05,
    SslWithUserAuthRequiredByServer = 0x06,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SslRequiredByServer => "SSL_REQUIRED_BY_SERVER",
            Self::SslNotAllowedByServer => "SSL_NOT_ALLOWED_BY_SERVER",
            Self::SslCertNotOnServer => "SSL_CERT_NOT_ON_SERVER",
            Self::InconsistentFlags => "INCONSISTENT_FLAGS",
            Self::HybridRequiredByServer => "HYBRID_REQUIRED_BY_SERVER",
            Self::SslWithUserAuthRequiredByServer => "SSL_WITH_USER_AUTH_REQUIRED_BY_SERVER",
        };
        f.write_str(name)
    }
}

// ── TPKT ─────────────────────────────────────────────────────────

/// Read a TPKT header and narrow `s` to the declared packet length.
pub fn read_tpkt(s: &mut WireBuffer) -> Result<usize> {
    s.need(TPKT_HEADER_SIZE, "tpkt header")?;
    let version = s.read_u8()?;
    if version != TPKT_VERSION {
        return Err(RdpError::invalid("tpkt version", version));
    }
    s.skip(1, "tpkt reserved")?;
    let len = s.read_u16_be()? as usize;
    if len < TPKT_HEADER_SIZE + 3 {
        return Err(RdpError::invalid("tpkt length", len as u64));
    }
    let body = len - TPKT_HEADER_SIZE;
    s.limit(body, "tpkt payload")?;
    Ok(len)
}

fn write_tpkt(s: &mut WireBuffer, len: usize) -> Result<()> {
    let len = u16::try_from(len).map_err(|_| RdpError::invalid("tpkt length", len as u64))?;
    s.write_u8(TPKT_VERSION);
    s.write_u8(0);
    s.write_u16_be(len);
    Ok(())
}

// ── State ────────────────────────────────────────────────────────

/// Connection-negotiation progress.
///
/// ```text
///  Idle ──► ExpectConnectionRequest ──► NegotiatingProtocol
///                                              │
///           Established ◄── ConnectionConfirmSent
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsoState {
    #[default]
    Idle,
    ExpectConnectionRequest,
    NegotiatingProtocol,
    ConnectionConfirmSent,
    Established,
}

/// Parsed X.224 Connection Request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Routing token or `Cookie: mstshash=` line, without CRLF.
    pub cookie: Option<String>,
    /// `None` when the client sent no `RDP_NEG_REQ` (pre-RDP 5.2 clients).
    pub requested: Option<Protocols>,
    pub neg_flags: u8,
}

/// Result of protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Selected(Protocols),
    Failed(FailureCode),
}

// ── IsoLayer ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct IsoLayer {
    state: IsoState,
    pub requested: Protocols,
    pub selected: Protocols,
    neg_req_present: bool,
    pub cookie: Option<String>,
}

impl IsoLayer {
    pub fn new() -> Self {
        Self {
            state: IsoState::ExpectConnectionRequest,
            ..Self::default()
        }
    }

    pub fn state(&self) -> IsoState {
        self.state
    }

    /// Parse a Connection Request TPDU (TPKT included).
    pub fn recv_connection_request(&mut self, s: &mut WireBuffer) -> Result<ConnectionRequest> {
        if self.state != IsoState::ExpectConnectionRequest {
            return Err(RdpError::UnexpectedPdu {
                pdu: "X.224 connection request",
                state: "iso",
            });
        }
        read_tpkt(s)?;
        let req = parse_connection_request(s)?;
        self.requested = req.requested.unwrap_or_default();
        self.neg_req_present = req.requested.is_some();
        self.cookie = req.cookie.clone();
        self.state = IsoState::NegotiatingProtocol;
        debug!(requested = ?req.requested, cookie = ?req.cookie, "X.224 connection request");
        Ok(req)
    }

    /// Pick a protocol and build the Connection Confirm.
    ///
    /// A failure is returned as `Ok(Negotiation::Failed)` together with
    /// the `RDP_NEG_FAILURE` to send when the client negotiated; clients
    /// that sent no `RDP_NEG_REQ` cannot receive one, so that case is an
    /// error.
    pub fn negotiate(&mut self, ctx: &ServerContext) -> Result<(Negotiation, WireBuffer)> {
        if self.state != IsoState::NegotiatingProtocol {
            return Err(RdpError::UnexpectedPdu {
                pdu: "negotiation",
                state: "iso",
            });
        }
        let outcome = select_protocol(
            self.requested,
            ctx.config.security_layer,
            ctx.tls.is_some(),
            ctx.rdp_security_available(),
        );
        match outcome {
            Negotiation::Selected(protocol) => {
                self.selected = protocol;
                info!(?protocol, "security protocol selected");
            }
            Negotiation::Failed(code) => {
                warn!(%code, requested = ?self.requested, "protocol negotiation failed");
                if !self.neg_req_present {
                    return Err(RdpError::NegotiationMismatch(
                        "server requires enhanced security but client cannot negotiate",
                    ));
                }
            }
        }
        let pdu = self.write_connection_confirm(outcome)?;
        self.state = IsoState::ConnectionConfirmSent;
        Ok((outcome, pdu))
    }

    fn write_connection_confirm(&self, outcome: Negotiation) -> Result<WireBuffer> {
        let mut s = WireBuffer::with_capacity(19);
        let neg_len = if self.neg_req_present { 8 } else { 0 };
        write_tpkt(&mut s, TPKT_HEADER_SIZE + 7 + neg_len)?;
        s.write_u8((6 + neg_len) as u8);
        s.write_u8(X224_CC);
        s.write_u16_be(0);
        s.write_u16_be(0x1234);
        s.write_u8(0);
        if self.neg_req_present {
            match outcome {
                Negotiation::Selected(protocol) => {
                    s.write_u8(RDP_NEG_RSP);
                    s.write_u8(NegotiationFlags::EXTENDED_CLIENT_DATA_SUPPORTED.bits());
                    s.write_u16_le(RDP_NEG_LENGTH);
                    s.write_u32_le(protocol.bits());
                }
                Negotiation::Failed(code) => {
                    s.write_u8(RDP_NEG_FAILURE);
                    s.write_u8(0);
                    s.write_u16_le(RDP_NEG_LENGTH);
                    s.write_u32_le(code as u32);
                }
            }
        }
        s.mark_end();
        Ok(s)
    }

    /// Called once the transport carries MCS traffic.
    pub fn establish(&mut self) -> Result<()> {
        match self.state {
            IsoState::ConnectionConfirmSent => {
                self.state = IsoState::Established;
                Ok(())
            }
            _ => Err(RdpError::ProtocolViolation(
                "cannot establish: connection confirm not sent",
            )),
        }
    }

    // ── Data TPDUs ───────────────────────────────────────────────

    /// Strip TPKT and the X.224 DT header, leaving `s` at the MCS PDU.
    ///
    /// An X.224 Disconnect Request ends the session.
    pub fn recv(&mut self, s: &mut WireBuffer) -> Result<()> {
        read_tpkt(s)?;
        s.need(2, "x224 header")?;
        let li = s.read_u8()?;
        let code = s.read_u8()?;
        if code & 0xF0 == X224_DR {
            info!("X.224 disconnect request");
            return Err(RdpError::Disconnected);
        }
        if code != X224_DT || li != 2 {
            return Err(RdpError::ProtocolViolation("expected X.224 data TPDU"));
        }
        s.skip(1, "x224 eot")?;
        Ok(())
    }

    /// Reserve TPKT + DT header space at the front of an outbound buffer.
    pub fn init(s: &mut WireBuffer) {
        s.push_layer(Layer::Iso, ISO_DATA_HEADER_SIZE);
    }

    /// Fill in TPKT + DT once the payload is complete.
    pub fn send(s: &mut WireBuffer) -> Result<()> {
        s.pop_layer(Layer::Iso)?;
        let len = s.end() - s.pos();
        write_tpkt(s, len)?;
        s.write_u8(2);
        s.write_u8(X224_DT);
        s.write_u8(X224_EOT);
        s.seek(s.end())?;
        Ok(())
    }
}

// ── Parsing ──────────────────────────────────────────────────────

fn parse_connection_request(s: &mut WireBuffer) -> Result<ConnectionRequest> {
    s.need(7, "x224 connection request")?;
    let li = s.read_u8()? as usize;
    let code = s.read_u8()?;
    if code & 0xF0 != X224_CR {
        return Err(RdpError::invalid("x224 code", code));
    }
    if li + 1 != s.remaining() + 2 {
        return Err(RdpError::invalid("x224 length indicator", li as u64));
    }
    s.skip(5, "x224 refs and class")?;

    let mut req = ConnectionRequest::default();
    while s.remaining() > 0 {
        match s.peek_u8()? {
            RDP_NEG_REQ => {
                s.need(8, "rdp_neg_req")?;
                s.skip(1, "rdp_neg_req type")?;
                let flags = s.read_u8()?;
                let len = s.read_u16_le()?;
                if len != RDP_NEG_LENGTH {
                    return Err(RdpError::invalid("rdp_neg_req length", len));
                }
                let requested = s.read_u32_le()?;
                req.requested = Some(Protocols::from_bits_truncate(requested));
                req.neg_flags = flags;
                if flags & CORRELATION_INFO_PRESENT != 0 && s.remaining() > 0 {
                    skip_correlation_info(s)?;
                }
            }
            RDP_CORRELATION_INFO => skip_correlation_info(s)?,
            _ => {
                if req.cookie.is_some() || req.requested.is_some() {
                    return Err(RdpError::ProtocolViolation(
                        "unexpected data in x224 connection request",
                    ));
                }
                req.cookie = Some(read_cookie(s)?);
            }
        }
    }
    Ok(req)
}

fn skip_correlation_info(s: &mut WireBuffer) -> Result<()> {
    s.need(4, "correlation info")?;
    s.skip(2, "correlation info type")?;
    let len = s.read_u16_le()? as usize;
    if len != RDP_CORRELATION_INFO_LENGTH {
        return Err(RdpError::invalid("correlation info length", len as u64));
    }
    s.skip(len - 4, "correlation info")
}

/// Accumulate the cookie byte by byte until CRLF.
fn read_cookie(s: &mut WireBuffer) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let b = s.read_u8()?;
        if b == b'\r' && s.peek_u8()? == b'\n' {
            s.skip(1, "cookie terminator")?;
            break;
        }
        line.push(b);
        if line.len() > MAX_COOKIE_LEN {
            return Err(RdpError::ProtocolViolation("routing cookie too long"));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Protocol selection against the server's configured security layer.
pub fn select_protocol(
    requested: Protocols,
    layer: SecurityLayer,
    tls_available: bool,
    rdp_available: bool,
) -> Negotiation {
    use Negotiation::{Failed, Selected};

    let wants_ssl = requested.contains(Protocols::SSL);
    let wants_hybrid = requested.intersects(Protocols::HYBRID | Protocols::HYBRID_EX);

    match layer {
        SecurityLayer::Rdp => {
            if requested == Protocols::RDSTLS {
                Failed(FailureCode::SslNotAllowedByServer)
            } else if !rdp_available {
                Failed(FailureCode::InconsistentFlags)
            } else {
                Selected(Protocols::RDP)
            }
        }
        SecurityLayer::Tls => {
            if !wants_ssl {
                Failed(FailureCode::SslRequiredByServer)
            } else if !tls_available {
                Failed(FailureCode::SslCertNotOnServer)
            } else {
                Selected(Protocols::SSL)
            }
        }
        SecurityLayer::Hybrid => {
            if !wants_hybrid {
                Failed(FailureCode::HybridRequiredByServer)
            } else if !tls_available {
                Failed(FailureCode::InconsistentFlags)
            } else {
                Selected(Protocols::HYBRID)
            }
        }
        SecurityLayer::Negotiate => {
            if wants_ssl && tls_available {
                Selected(Protocols::SSL)
            } else if rdp_available {
                Selected(Protocols::RDP)
            } else if wants_ssl {
                Failed(FailureCode::SslCertNotOnServer)
            } else {
                Failed(FailureCode::InconsistentFlags)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
