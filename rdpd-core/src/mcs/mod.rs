//! T.125 MCS domain layer.
//!
//! Owns the connect handshake (BER Connect-Initial / Connect-Response),
//! the attach-user and channel-join exchange, and the PER framing of
//! Send-Data-Request / Send-Data-Indication that carries everything else.
//!
//! ```text
//!  AwaitConnectInitial ──► SendConnectResponse ──► AwaitErectDomainRequest
//!                                                          │
//!  AwaitChannelJoinRequests ◄── SendAttachUserConfirm ◄── AwaitAttachUserRequest
//!           │ (first Send-Data-Request)
//!           ▼
//!      Established
//! ```

pub mod ber;
pub mod per;

use tracing::{debug, info, warn};

use crate::error::{RdpError, Result};
use crate::iso::IsoLayer;
use crate::stream::{Layer, WireBuffer};

// ── Constants ────────────────────────────────────────────────────

/// The I/O channel every client joins.
pub const GLOBAL_CHANNEL_ID: u16 = 1003;
/// User ids are channel ids relative to this base.
pub const USER_CHANNEL_BASE: u16 = 1001;
pub const MAX_STATIC_CHANNELS: usize = 31;
/// Bound on the Connect-Initial `userData` octet string.
pub const MAX_USER_DATA_LEN: usize = 16384;
/// Worst-case Send-Data-Indication header: opcode, initiator, channel,
/// flags and a two-byte PER length.
pub const SDIN_HEADER_SIZE: usize = 8;

const SEND_DATA_FLAGS: u8 = 0x70;

/// `DomainMCSPDU` choice indices (T.125 annex A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DomainPdu {
    ErectDomainRequest = 1,
    DisconnectProviderUltimatum = 8,
    AttachUserRequest = 10,
    AttachUserConfirm = 11,
    ChannelJoinRequest = 14,
    ChannelJoinConfirm = 15,
    SendDataRequest = 25,
    SendDataIndication = 26,
}

impl TryFrom<u8> for DomainPdu {
    type Error = RdpError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::ErectDomainRequest),
            8 => Ok(Self::DisconnectProviderUltimatum),
            10 => Ok(Self::AttachUserRequest),
            11 => Ok(Self::AttachUserConfirm),
            14 => Ok(Self::ChannelJoinRequest),
            15 => Ok(Self::ChannelJoinConfirm),
            25 => Ok(Self::SendDataRequest),
            26 => Ok(Self::SendDataIndication),
            other => Err(RdpError::UnknownVariant {
                type_name: "DomainMCSPDU",
                value: u64::from(other),
            }),
        }
    }
}

// ── ChannelItem ──────────────────────────────────────────────────

/// A static virtual channel requested in `CS_NET`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelItem {
    /// Up to seven ASCII characters.
    pub name: String,
    /// `CHANNEL_OPTION_*` flags from the client.
    pub options: u32,
    pub chan_id: u16,
    /// Whether the server's allow-list admits the channel.
    pub allowed: bool,
}

// ── State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum McsState {
    #[default]
    AwaitConnectInitial,
    SendConnectResponse,
    AwaitErectDomainRequest,
    AwaitAttachUserRequest,
    SendAttachUserConfirm,
    AwaitChannelJoinRequests,
    Established,
}

impl McsState {
    fn name(self) -> &'static str {
        match self {
            Self::AwaitConnectInitial => "AwaitConnectInitial",
            Self::SendConnectResponse => "SendConnectResponse",
            Self::AwaitErectDomainRequest => "AwaitErectDomainRequest",
            Self::AwaitAttachUserRequest => "AwaitAttachUserRequest",
            Self::SendAttachUserConfirm => "SendAttachUserConfirm",
            Self::AwaitChannelJoinRequests => "AwaitChannelJoinRequests",
            Self::Established => "Established",
        }
    }
}

impl std::fmt::Display for McsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a domain PDU asks of the caller.
#[derive(Debug)]
pub enum McsEvent {
    /// Nothing to do.
    Handled,
    /// Send this buffer back (join confirm).
    Reply(WireBuffer),
    /// Attach-User received; call [`McsLayer::attach_user_confirm`].
    AttachUser,
    /// Payload for `channel_id`; the buffer is narrowed to it.
    Data { channel_id: u16 },
    /// Disconnect-Provider-Ultimatum.
    Disconnect,
}

// ── McsLayer ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct McsLayer {
    state: McsState,
    channels: Vec<ChannelItem>,
    user_channel: u16,
    joins: usize,
    strict_join: bool,
}

impl McsLayer {
    pub fn new(strict_join: bool) -> Self {
        Self {
            user_channel: GLOBAL_CHANNEL_ID + 1,
            strict_join,
            ..Self::default()
        }
    }

    pub fn state(&self) -> McsState {
        self.state
    }

    pub fn channels(&self) -> &[ChannelItem] {
        &self.channels
    }

    pub fn channel(&self, chan_id: u16) -> Option<&ChannelItem> {
        self.channels.iter().find(|c| c.chan_id == chan_id)
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&ChannelItem> {
        self.channels.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn user_channel(&self) -> u16 {
        self.user_channel
    }

    /// The PER-encoded initiator (user id) for this connection.
    pub fn initiator(&self) -> u16 {
        self.user_channel - USER_CHANNEL_BASE
    }

    /// Assign MCS ids to the channels requested in `CS_NET`.
    ///
    /// Static channels take `GLOBAL_CHANNEL_ID + 1 ..= GLOBAL_CHANNEL_ID + N`
    /// in request order; the user channel takes the next id.
    pub fn assign_channels(&mut self, requested: Vec<(String, u32, bool)>) -> Result<&[ChannelItem]> {
        if requested.len() > MAX_STATIC_CHANNELS {
            return Err(RdpError::invalid("channel count", requested.len() as u64));
        }
        self.channels = requested
            .into_iter()
            .zip(GLOBAL_CHANNEL_ID + 1..)
            .map(|((name, options, allowed), chan_id)| ChannelItem {
                name,
                options,
                chan_id,
                allowed,
            })
            .collect();
        self.user_channel = GLOBAL_CHANNEL_ID + self.channels.len() as u16 + 1;
        Ok(&self.channels)
    }

    // ── Connect ──────────────────────────────────────────────────

    /// Parse Connect-Initial and return the GCC `userData` blob.
    pub fn recv_connect_initial(&mut self, s: &mut WireBuffer) -> Result<Vec<u8>> {
        self.expect(McsState::AwaitConnectInitial, "Connect-Initial")?;
        let len = ber::read_header(s, ber::TAG_CONNECT_INITIAL)?;
        s.limit(len, "connect-initial")?;

        // callingDomainSelector, calledDomainSelector, upwardFlag
        let len = ber::read_header(s, ber::TAG_OCTET_STRING)?;
        s.skip(len, "calling domain selector")?;
        let len = ber::read_header(s, ber::TAG_OCTET_STRING)?;
        s.skip(len, "called domain selector")?;
        let len = ber::read_header(s, ber::TAG_BOOLEAN)?;
        s.skip(len, "upward flag")?;

        // target, minimum and maximum DomainParameters
        for what in ["target parameters", "minimum parameters", "maximum parameters"] {
            let len = ber::read_header(s, ber::TAG_DOMAIN_PARAMETERS)?;
            s.skip(len, what)?;
        }

        let len = ber::read_header(s, ber::TAG_OCTET_STRING)?;
        if len == 0 || len > MAX_USER_DATA_LEN {
            return Err(RdpError::invalid("connect-initial user data length", len as u64));
        }
        let user_data = s.read_vec(len, "connect-initial user data")?;
        self.state = McsState::SendConnectResponse;
        debug!(len, "MCS connect-initial");
        Ok(user_data)
    }

    /// Build Connect-Response around the server GCC data.
    pub fn connect_response(&mut self, gcc: &[u8]) -> Result<WireBuffer> {
        self.expect(McsState::SendConnectResponse, "Connect-Response")?;
        let params = domain_parameters();
        let body_len = 3
            + ber::integer_size(0)
            + params.as_slice().len()
            + 1
            + ber::length_size(gcc.len())
            + gcc.len();

        let mut s = WireBuffer::with_capacity(body_len + 16);
        IsoLayer::init(&mut s);
        ber::write_header(&mut s, ber::TAG_CONNECT_RESPONSE, body_len)?;
        ber::write_enumerated(&mut s, 0);
        ber::write_integer(&mut s, 0);
        s.write_bytes(params.as_slice());
        ber::write_header(&mut s, ber::TAG_OCTET_STRING, gcc.len())?;
        s.write_bytes(gcc);
        s.mark_end();
        IsoLayer::send(&mut s)?;

        self.state = McsState::AwaitErectDomainRequest;
        Ok(s)
    }

    // ── Domain PDUs ──────────────────────────────────────────────

    /// Dispatch one domain PDU (the X.224 header already stripped).
    pub fn recv(&mut self, s: &mut WireBuffer) -> Result<McsEvent> {
        let opcode = s.read_u8()?;
        let pdu = DomainPdu::try_from(opcode >> 2)?;

        if pdu == DomainPdu::DisconnectProviderUltimatum {
            info!("MCS disconnect provider ultimatum");
            return Ok(McsEvent::Disconnect);
        }

        match (self.state, pdu) {
            (McsState::AwaitErectDomainRequest, DomainPdu::ErectDomainRequest) => {
                // subHeight and subInterval, each a one-byte PER integer
                s.skip(4, "erect domain request")?;
                self.state = McsState::AwaitAttachUserRequest;
                Ok(McsEvent::Handled)
            }
            (McsState::AwaitAttachUserRequest, DomainPdu::AttachUserRequest) => {
                self.state = McsState::SendAttachUserConfirm;
                Ok(McsEvent::AttachUser)
            }
            (McsState::AwaitChannelJoinRequests, DomainPdu::ChannelJoinRequest) => {
                self.recv_channel_join(s).map(McsEvent::Reply)
            }
            (McsState::AwaitChannelJoinRequests, DomainPdu::SendDataRequest) => {
                self.finish_join()?;
                self.recv_send_data(s)
            }
            (McsState::Established, DomainPdu::SendDataRequest) => self.recv_send_data(s),
            (state, _) => Err(RdpError::UnexpectedPdu {
                pdu: "MCS domain PDU",
                state: state.name(),
            }),
        }
    }

    /// Attach-User-Confirm carrying the user id.
    pub fn attach_user_confirm(&mut self) -> Result<WireBuffer> {
        self.expect(McsState::SendAttachUserConfirm, "Attach-User-Confirm")?;
        let mut s = WireBuffer::with_capacity(11);
        IsoLayer::init(&mut s);
        s.write_u8(((DomainPdu::AttachUserConfirm as u8) << 2) | 2);
        s.write_u8(0);
        s.write_u16_be(self.initiator());
        s.mark_end();
        IsoLayer::send(&mut s)?;
        self.state = McsState::AwaitChannelJoinRequests;
        debug!(user_channel = self.user_channel, "MCS attach user confirm");
        Ok(s)
    }

    fn recv_channel_join(&mut self, s: &mut WireBuffer) -> Result<WireBuffer> {
        s.need(4, "channel join request")?;
        let initiator = s.read_u16_be()?;
        let chan_id = s.read_u16_be()?;
        if initiator != self.initiator() {
            debug!(initiator, expected = self.initiator(), "channel join with foreign initiator");
        }
        self.joins += 1;
        debug!(chan_id, joins = self.joins, "MCS channel join");

        let mut out = WireBuffer::with_capacity(15);
        IsoLayer::init(&mut out);
        out.write_u8(((DomainPdu::ChannelJoinConfirm as u8) << 2) | 2);
        out.write_u8(0);
        out.write_u16_be(initiator);
        out.write_u16_be(chan_id);
        out.write_u16_be(chan_id);
        out.mark_end();
        IsoLayer::send(&mut out)?;
        Ok(out)
    }

    /// Close the join phase at the first Send-Data-Request.
    ///
    /// Clients differ in whether they join every channel, so a count
    /// mismatch is only fatal under `strict_channel_join`.
    fn finish_join(&mut self) -> Result<()> {
        let expected = self.channels.len() + 2;
        if self.joins != expected {
            if self.strict_join {
                return Err(RdpError::ProtocolViolation("channel join count mismatch"));
            }
            warn!(
                expected,
                actual = self.joins,
                "channel join count mismatch; continuing"
            );
        }
        self.state = McsState::Established;
        info!(channels = self.channels.len(), "MCS domain established");
        Ok(())
    }

    fn recv_send_data(&mut self, s: &mut WireBuffer) -> Result<McsEvent> {
        s.need(5, "send data request")?;
        let _initiator = s.read_u16_be()?;
        let channel_id = s.read_u16_be()?;
        let _flags = s.read_u8()?;
        let len = per::read_length(s)?;
        s.limit(len, "send data request payload")?;
        Ok(McsEvent::Data { channel_id })
    }

    fn expect(&self, state: McsState, pdu: &'static str) -> Result<()> {
        if self.state != state {
            return Err(RdpError::UnexpectedPdu {
                pdu,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    // ── Outbound framing ─────────────────────────────────────────

    /// Reserve TPKT, X.224 and Send-Data-Indication headers.
    pub fn init(s: &mut WireBuffer) {
        IsoLayer::init(s);
        s.push_layer(Layer::Mcs, SDIN_HEADER_SIZE);
    }

    /// Fill in the Send-Data-Indication header and everything below it.
    pub fn send(&self, s: &mut WireBuffer, channel_id: u16) -> Result<()> {
        s.pop_layer(Layer::Mcs)?;
        let start = s.pos();
        let len = s.end() - start - SDIN_HEADER_SIZE;
        if len > per::MAX_LENGTH {
            return Err(RdpError::invalid("send data indication length", len as u64));
        }
        s.write_u8((DomainPdu::SendDataIndication as u8) << 2);
        s.write_u16_be(self.initiator());
        s.write_u16_be(channel_id);
        s.write_u8(SEND_DATA_FLAGS);
        per::write_length(s, len)?;
        if len < 0x80 {
            s.collapse(start + SDIN_HEADER_SIZE - 1, 1)?;
        }
        s.seek(s.end())?;
        IsoLayer::send(s)
    }

    /// Disconnect-Provider-Ultimatum, reason `rn-user-requested`.
    pub fn disconnect_ultimatum() -> Result<WireBuffer> {
        let mut s = WireBuffer::with_capacity(9);
        IsoLayer::init(&mut s);
        s.write_u8(((DomainPdu::DisconnectProviderUltimatum as u8) << 2) | 1);
        s.write_u8(0x80);
        s.mark_end();
        IsoLayer::send(&mut s)?;
        Ok(s)
    }
}

/// DomainParameters for the Connect-Response: 22 channels, 3 users,
/// 0 tokens, priority 1, throughput 0, height 1, 0xFFF8 PDU size, version 2.
fn domain_parameters() -> WireBuffer {
    let values = [22u32, 3, 0, 1, 0, 1, 0xFFF8, 2];
    let len: usize = values.iter().map(|v| ber::integer_size(*v)).sum();
    let mut s = WireBuffer::with_capacity(len + 2);
    s.write_u8(ber::TAG_DOMAIN_PARAMETERS as u8);
    s.write_u8(len as u8);
    for v in values {
        ber::write_integer(&mut s, v);
    }
    s
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn strip_iso(frame: &WireBuffer) -> WireBuffer {
        let mut s = WireBuffer::from_slice(frame.as_slice());
        let mut iso = IsoLayer::new();
        iso.recv(&mut s).unwrap();
        s
    }

    pub(crate) fn connect_initial(user_data: &[u8]) -> Vec<u8> {
        let params = [0x30u8, 0x06, 0x02, 0x01, 0x22, 0x02, 0x01, 0x02];
        let mut body = vec![0x04, 0x01, 0x01, 0x04, 0x01, 0x01, 0x01, 0x01, 0xFF];
        for _ in 0..3 {
            body.extend_from_slice(&params);
        }
        body.extend_from_slice(&[0x04, 0x82]);
        body.extend_from_slice(&(user_data.len() as u16).to_be_bytes());
        body.extend_from_slice(user_data);
        let mut v = vec![0x7F, 0x65, 0x82];
        v.extend_from_slice(&(body.len() as u16).to_be_bytes());
        v.extend(body);
        v
    }

    fn handshake(mcs: &mut McsLayer) {
        let mut s = WireBuffer::from_slice(&connect_initial(&[1, 2, 3]));
        assert_eq!(mcs.recv_connect_initial(&mut s).unwrap(), vec![1, 2, 3]);
        mcs.connect_response(&[0xAB; 4]).unwrap();
        let mut s = WireBuffer::from_slice(&[0x04, 0x01, 0x00, 0x01, 0x00]);
        assert!(matches!(mcs.recv(&mut s).unwrap(), McsEvent::Handled));
        let mut s = WireBuffer::from_slice(&[0x28]);
        assert!(matches!(mcs.recv(&mut s).unwrap(), McsEvent::AttachUser));
        mcs.attach_user_confirm().unwrap();
    }

    fn join(mcs: &mut McsLayer, chan_id: u16) -> WireBuffer {
        let mut pdu = vec![0x38];
        pdu.extend_from_slice(&mcs.initiator().to_be_bytes());
        pdu.extend_from_slice(&chan_id.to_be_bytes());
        let mut s = WireBuffer::from_slice(&pdu);
        match mcs.recv(&mut s).unwrap() {
            McsEvent::Reply(out) => out,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn send_data_request(mcs: &McsLayer, chan_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0x64];
        v.extend_from_slice(&mcs.initiator().to_be_bytes());
        v.extend_from_slice(&chan_id.to_be_bytes());
        v.push(0x70);
        v.push(payload.len() as u8);
        v.extend_from_slice(payload);
        v
    }

    fn channels(n: usize) -> Vec<(String, u32, bool)> {
        (0..n).map(|i| (format!("chan{i}"), 0x8000_0000, true)).collect()
    }

    #[test]
    fn channel_ids_are_sequential_for_every_count() {
        for n in 0..=MAX_STATIC_CHANNELS {
            let mut mcs = McsLayer::new(false);
            let ids: Vec<u16> = mcs
                .assign_channels(channels(n))
                .unwrap()
                .iter()
                .map(|c| c.chan_id)
                .collect();
            let expected: Vec<u16> = (1..=n as u16).map(|i| GLOBAL_CHANNEL_ID + i).collect();
            assert_eq!(ids, expected);
            assert_eq!(mcs.user_channel(), GLOBAL_CHANNEL_ID + n as u16 + 1);
        }
    }

    #[test]
    fn too_many_channels_rejected() {
        let mut mcs = McsLayer::new(false);
        assert!(mcs.assign_channels(channels(MAX_STATIC_CHANNELS + 1)).is_err());
    }

    #[test]
    fn connect_initial_rejects_empty_user_data() {
        let mut mcs = McsLayer::new(false);
        let mut s = WireBuffer::from_slice(&connect_initial(&[]));
        assert!(mcs.recv_connect_initial(&mut s).is_err());
    }

    #[test]
    fn connect_initial_rejects_truncation() {
        let frame = connect_initial(&[9; 32]);
        for cut in [1, 5, 20, frame.len() - 1] {
            let mut mcs = McsLayer::new(false);
            let mut s = WireBuffer::from_slice(&frame[..cut]);
            assert!(mcs.recv_connect_initial(&mut s).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn connect_response_layout() {
        let mut mcs = McsLayer::new(false);
        let mut s = WireBuffer::from_slice(&connect_initial(&[1]));
        mcs.recv_connect_initial(&mut s).unwrap();
        let out = mcs.connect_response(&[0xEE; 3]).unwrap();
        let mut s = strip_iso(&out);
        let len = ber::read_header(&mut s, ber::TAG_CONNECT_RESPONSE).unwrap();
        assert_eq!(len, s.remaining());
        assert_eq!(s.read_array::<3>().unwrap(), [0x0A, 0x01, 0x00]);
        assert_eq!(ber::read_integer(&mut s).unwrap(), 0);
        let plen = ber::read_header(&mut s, ber::TAG_DOMAIN_PARAMETERS).unwrap();
        assert_eq!(plen, 26);
        s.skip(plen, "params").unwrap();
        assert_eq!(ber::read_header(&mut s, ber::TAG_OCTET_STRING).unwrap(), 3);
        assert_eq!(s.rest(), &[0xEE; 3]);
    }

    #[test]
    fn join_mismatch_is_tolerated() {
        let mut mcs = McsLayer::new(false);
        mcs.assign_channels(channels(5)).unwrap();
        handshake(&mut mcs);
        for id in [mcs.user_channel(), GLOBAL_CHANNEL_ID, 1004, 1005] {
            let confirm = join(&mut mcs, id);
            let mut s = strip_iso(&confirm);
            assert_eq!(s.read_u8().unwrap(), 0x3E);
            assert_eq!(s.read_u8().unwrap(), 0);
            s.skip(2, "initiator").unwrap();
            assert_eq!(s.read_u16_be().unwrap(), id);
        }
        let pdu = send_data_request(&mcs, GLOBAL_CHANNEL_ID, &[7, 7]);
        let mut s = WireBuffer::from_slice(&pdu);
        let ev = mcs.recv(&mut s).unwrap();
        assert!(matches!(ev, McsEvent::Data { channel_id: GLOBAL_CHANNEL_ID }));
        assert_eq!(s.rest(), &[7, 7]);
        assert_eq!(mcs.state(), McsState::Established);
    }

    #[test]
    fn join_after_the_join_phase_is_rejected() {
        let mut mcs = McsLayer::new(false);
        mcs.assign_channels(channels(0)).unwrap();
        handshake(&mut mcs);
        let user = mcs.user_channel();
        join(&mut mcs, user);
        join(&mut mcs, GLOBAL_CHANNEL_ID);
        let pdu = send_data_request(&mcs, GLOBAL_CHANNEL_ID, &[1]);
        mcs.recv(&mut WireBuffer::from_slice(&pdu)).unwrap();
        assert_eq!(mcs.state(), McsState::Established);

        let mut pdu = vec![0x38];
        pdu.extend_from_slice(&mcs.initiator().to_be_bytes());
        pdu.extend_from_slice(&GLOBAL_CHANNEL_ID.to_be_bytes());
        assert!(matches!(
            mcs.recv(&mut WireBuffer::from_slice(&pdu)),
            Err(RdpError::UnexpectedPdu { state: "Established", .. })
        ));
    }

    #[test]
    fn join_mismatch_fails_when_strict() {
        let mut mcs = McsLayer::new(true);
        mcs.assign_channels(channels(1)).unwrap();
        handshake(&mut mcs);
        join(&mut mcs, GLOBAL_CHANNEL_ID);
        let pdu = send_data_request(&mcs, GLOBAL_CHANNEL_ID, &[0]);
        let mut s = WireBuffer::from_slice(&pdu);
        assert!(mcs.recv(&mut s).is_err());
    }

    #[test]
    fn out_of_order_pdu_is_rejected() {
        let mut mcs = McsLayer::new(false);
        let mut s = WireBuffer::from_slice(&connect_initial(&[1]));
        mcs.recv_connect_initial(&mut s).unwrap();
        mcs.connect_response(&[0]).unwrap();
        let mut s = WireBuffer::from_slice(&[0x28]);
        assert!(matches!(
            mcs.recv(&mut s),
            Err(RdpError::UnexpectedPdu { .. })
        ));
    }

    #[test]
    fn disconnect_ultimatum_at_any_state() {
        let mut mcs = McsLayer::new(false);
        let mut s = WireBuffer::from_slice(&[0x21, 0x80]);
        assert!(matches!(mcs.recv(&mut s).unwrap(), McsEvent::Disconnect));
    }

    #[test]
    fn send_data_indication_short_and_long() {
        let mcs = McsLayer::new(false);
        for len in [10usize, 300] {
            let mut s = WireBuffer::new();
            McsLayer::init(&mut s);
            s.write_bytes(&vec![0x5A; len]);
            s.mark_end();
            mcs.send(&mut s, GLOBAL_CHANNEL_ID).unwrap();

            let mut r = strip_iso(&s);
            assert_eq!(r.read_u8().unwrap(), 0x68);
            assert_eq!(r.read_u16_be().unwrap(), mcs.initiator());
            assert_eq!(r.read_u16_be().unwrap(), GLOBAL_CHANNEL_ID);
            assert_eq!(r.read_u8().unwrap(), 0x70);
            assert_eq!(per::read_length(&mut r).unwrap(), len);
            assert_eq!(r.remaining(), len);
        }
    }
}
