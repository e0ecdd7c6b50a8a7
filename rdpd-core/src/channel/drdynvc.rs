//! Dynamic virtual channels multiplexed over the `drdynvc` static channel.
//!
//! ```text
//!   CLOSED ──open()──► OPENING ──create response ok──► OPEN
//!     ▲                   │ failure                      │
//!     └───────────────────┴────────── close ─────────────┘
//! ```
//!
//! Channel ids index a fixed table of [`MAX_DYNAMIC_CHANNELS`] slots, so a
//! client can never make the server track more than that many channels.

use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::{RdpError, Result};
use crate::stream::WireBuffer;

use super::CHUNK_SIZE;

pub const DRDYNVC_NAME: &str = "drdynvc";
pub const MAX_DYNAMIC_CHANNELS: usize = 256;

// Commands, in the high nibble of the header byte.
const CMD_CREATE: u8 = 0x01;
const CMD_DATA_FIRST: u8 = 0x02;
const CMD_DATA: u8 = 0x03;
const CMD_CLOSE: u8 = 0x04;
const CMD_CAPABILITY: u8 = 0x05;
const CMD_DATA_FIRST_COMPRESSED: u8 = 0x06;
const CMD_DATA_COMPRESSED: u8 = 0x07;
const CMD_SOFT_SYNC_REQUEST: u8 = 0x08;

const CAPS_VERSION: u16 = 2;
const PRIORITY_CHARGES: [u16; 4] = [936, 3562, 7799, 17126];

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DvcStatus {
    #[default]
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Default)]
struct DvcSlot {
    status: DvcStatus,
    name: String,
    /// Expected total and bytes so far of a DataFirst/Data sequence.
    reassembly: Option<(usize, Vec<u8>)>,
}

/// What an inbound drdynvc message produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DvcEvent {
    /// The client answered the capability request.
    Ready { version: u16 },
    Opened { chan_id: u32, name: String, success: bool },
    Data { chan_id: u32, data: Vec<u8> },
    Closed { chan_id: u32 },
}

// ── DrdynvcLayer ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct DrdynvcLayer {
    slots: [DvcSlot; MAX_DYNAMIC_CHANNELS],
    caps_sent: bool,
    ready: bool,
}

impl Default for DrdynvcLayer {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| DvcSlot::default()),
            caps_sent: false,
            ready: false,
        }
    }
}

impl DrdynvcLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn status(&self, chan_id: u32) -> DvcStatus {
        self.slot(chan_id).map_or(DvcStatus::Closed, |s| s.status)
    }

    fn slot(&self, chan_id: u32) -> Option<&DvcSlot> {
        self.slots.get(chan_id as usize)
    }

    fn slot_mut(&mut self, chan_id: u32) -> Result<&mut DvcSlot> {
        self.slots
            .get_mut(chan_id as usize)
            .ok_or(RdpError::InvalidField {
                field: "dynamic channel id",
                value: u64::from(chan_id),
            })
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// The capability request that starts drdynvc. Only produced once.
    pub fn caps_request(&mut self) -> Option<Vec<u8>> {
        if self.caps_sent {
            return None;
        }
        self.caps_sent = true;
        let mut s = WireBuffer::with_capacity(12);
        s.write_u8(CMD_CAPABILITY << 4);
        s.write_u8(0);
        s.write_u16_le(CAPS_VERSION);
        for charge in PRIORITY_CHARGES {
            s.write_u16_le(charge);
        }
        Some(s.as_slice().to_vec())
    }

    /// Allocate a slot and build the create request for `name`.
    pub fn open(&mut self, name: &str) -> Result<(u32, Vec<u8>)> {
        if !self.ready {
            return Err(RdpError::UnexpectedPdu {
                pdu: "dynamic channel create",
                state: "drdynvc not ready",
            });
        }
        if name.is_empty() || !name.is_ascii() || name.contains('\0') {
            return Err(RdpError::Config(format!("invalid dynamic channel name {name:?}")));
        }
        let chan_id = (1..MAX_DYNAMIC_CHANNELS)
            .find(|&i| self.slots[i].status == DvcStatus::Closed)
            .ok_or(RdpError::ProtocolViolation("no free dynamic channel slot"))? as u32;

        let slot = &mut self.slots[chan_id as usize];
        slot.status = DvcStatus::Opening;
        slot.name = name.to_owned();
        slot.reassembly = None;

        let mut s = WireBuffer::with_capacity(name.len() + 3);
        s.write_u8(CMD_CREATE << 4);
        s.write_u8(chan_id as u8);
        s.write_bytes(name.as_bytes());
        s.write_u8(0);
        debug!(chan_id, name, "dynamic channel create request");
        Ok((chan_id, s.as_slice().to_vec()))
    }

    /// Build the messages carrying `data` on an open channel, each no
    /// larger than one static channel chunk.
    pub fn data(&self, chan_id: u32, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if self.status(chan_id) != DvcStatus::Open {
            return Err(RdpError::UnexpectedPdu {
                pdu: "dynamic channel data",
                state: "channel not open",
            });
        }
        let id = chan_id as u8;
        // Header and one byte channel id.
        if data.len() + 2 <= CHUNK_SIZE {
            let mut msg = Vec::with_capacity(data.len() + 2);
            msg.push(CMD_DATA << 4);
            msg.push(id);
            msg.extend_from_slice(data);
            return Ok(vec![msg]);
        }

        let total = u32::try_from(data.len()).map_err(|_| RdpError::invalid("dynamic channel data length", data.len() as u64))?;
        let (sp, len_bytes): (u8, Vec<u8>) = match total {
            0..=0xFFFF => (1, (total as u16).to_le_bytes().to_vec()),
            _ => (2, total.to_le_bytes().to_vec()),
        };
        let mut first = Vec::with_capacity(CHUNK_SIZE);
        first.push((CMD_DATA_FIRST << 4) | (sp << 2));
        first.push(id);
        first.extend_from_slice(&len_bytes);
        let take = CHUNK_SIZE - first.len();
        first.extend_from_slice(&data[..take]);

        let mut messages = vec![first];
        for part in data[take..].chunks(CHUNK_SIZE - 2) {
            let mut msg = Vec::with_capacity(part.len() + 2);
            msg.push(CMD_DATA << 4);
            msg.push(id);
            msg.extend_from_slice(part);
            messages.push(msg);
        }
        trace!(chan_id, total, pieces = messages.len(), "dynamic channel data fragmented");
        Ok(messages)
    }

    /// Close request for `chan_id`. The slot is freed immediately.
    pub fn close(&mut self, chan_id: u32) -> Result<Vec<u8>> {
        let slot = self.slot_mut(chan_id)?;
        if slot.status == DvcStatus::Closed {
            return Err(RdpError::UnexpectedPdu {
                pdu: "dynamic channel close",
                state: "channel closed",
            });
        }
        *slot = DvcSlot::default();
        debug!(chan_id, "dynamic channel close request");
        Ok(vec![CMD_CLOSE << 4, chan_id as u8])
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Process one complete message from the drdynvc static channel.
    pub fn recv(&mut self, s: &mut WireBuffer, config: &ServerConfig) -> Result<Option<DvcEvent>> {
        let header = s.read_u8()?;
        let cmd = header >> 4;
        let sp = (header >> 2) & 0x03;
        let cb_id = header & 0x03;

        match cmd {
            CMD_CAPABILITY => {
                s.skip(1, "drdynvc caps padding")?;
                let version = s.read_u16_le()?;
                if !self.caps_sent {
                    return Err(RdpError::UnexpectedPdu {
                        pdu: "drdynvc caps response",
                        state: "no caps request sent",
                    });
                }
                self.ready = true;
                info!(version, "drdynvc ready");
                Ok(Some(DvcEvent::Ready { version }))
            }
            CMD_CREATE => {
                let chan_id = read_var(s, cb_id)?;
                let creation_status = s.read_u32_le()? as i32;
                let slot = self.slot_mut(chan_id)?;
                if slot.status != DvcStatus::Opening {
                    warn!(chan_id, "create response for a channel that is not opening");
                    return Ok(None);
                }
                let success = creation_status >= 0;
                slot.status = if success { DvcStatus::Open } else { DvcStatus::Closed };
                let name = std::mem::take(&mut slot.name);
                if success {
                    slot.name = name.clone();
                }
                info!(chan_id, name = %name, success, creation_status, "dynamic channel create response");
                Ok(Some(DvcEvent::Opened { chan_id, name, success }))
            }
            CMD_DATA_FIRST => {
                let chan_id = read_var(s, cb_id)?;
                let total = read_var(s, sp)? as usize;
                if total > config.max_channel_reassembly {
                    return Err(RdpError::FrameTooLarge {
                        size: total,
                        max: config.max_channel_reassembly,
                    });
                }
                let chunk = s.rest().to_vec();
                if chunk.len() > total {
                    return Err(RdpError::ProtocolViolation("dynamic channel data exceeds declared length"));
                }
                let slot = self.slot_mut(chan_id)?;
                if slot.status != DvcStatus::Open {
                    debug!(chan_id, "data first on a channel that is not open");
                    return Ok(None);
                }
                if chunk.len() == total {
                    slot.reassembly = None;
                    return Ok(Some(DvcEvent::Data { chan_id, data: chunk }));
                }
                let mut buf = Vec::with_capacity(total);
                buf.extend_from_slice(&chunk);
                slot.reassembly = Some((total, buf));
                Ok(None)
            }
            CMD_DATA => {
                let chan_id = read_var(s, cb_id)?;
                let chunk = s.rest();
                let slot = self.slot_mut(chan_id)?;
                if slot.status != DvcStatus::Open {
                    debug!(chan_id, "data on a channel that is not open");
                    return Ok(None);
                }
                let Some((total, buf)) = slot.reassembly.as_mut() else {
                    return Ok(Some(DvcEvent::Data {
                        chan_id,
                        data: chunk.to_vec(),
                    }));
                };
                if buf.len() + chunk.len() > *total {
                    return Err(RdpError::ProtocolViolation("dynamic channel data exceeds declared length"));
                }
                buf.extend_from_slice(chunk);
                if buf.len() < *total {
                    return Ok(None);
                }
                let data = slot.reassembly.take().map(|(_, buf)| buf).unwrap_or_default();
                Ok(Some(DvcEvent::Data { chan_id, data }))
            }
            CMD_CLOSE => {
                let chan_id = read_var(s, cb_id)?;
                let slot = self.slot_mut(chan_id)?;
                if slot.status == DvcStatus::Closed {
                    debug!(chan_id, "close for a channel already closed");
                    return Ok(None);
                }
                *slot = DvcSlot::default();
                info!(chan_id, "dynamic channel closed by client");
                Ok(Some(DvcEvent::Closed { chan_id }))
            }
            CMD_DATA_FIRST_COMPRESSED | CMD_DATA_COMPRESSED => {
                Err(RdpError::ProtocolViolation("compressed dynamic channel data"))
            }
            CMD_SOFT_SYNC_REQUEST => {
                debug!("ignoring drdynvc soft-sync request");
                Ok(None)
            }
            other => Err(RdpError::UnknownVariant {
                type_name: "drdynvc command",
                value: u64::from(other),
            }),
        }
    }
}

/// A channel id or length whose width is given by a two bit size code.
fn read_var(s: &mut WireBuffer, size: u8) -> Result<u32> {
    match size {
        0 => Ok(u32::from(s.read_u8()?)),
        1 => Ok(u32::from(s.read_u16_le()?)),
        2 => s.read_u32_le(),
        other => Err(RdpError::invalid("drdynvc field size", other)),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CAPS_RESPONSE: [u8; 4] = [0x50, 0x00, 0x02, 0x00];

    pub(crate) fn create_response(chan_id: u8, status: i32) -> Vec<u8> {
        let mut v = vec![CMD_CREATE << 4, chan_id];
        v.extend_from_slice(&status.to_le_bytes());
        v
    }

    fn feed(layer: &mut DrdynvcLayer, bytes: &[u8]) -> Result<Option<DvcEvent>> {
        layer.recv(&mut WireBuffer::from_slice(bytes), &ServerConfig::default())
    }

    fn ready() -> DrdynvcLayer {
        let mut layer = DrdynvcLayer::new();
        layer.caps_request().unwrap();
        feed(&mut layer, &CAPS_RESPONSE).unwrap();
        layer
    }

    fn opened(name: &str) -> (DrdynvcLayer, u32) {
        let mut layer = ready();
        let (id, _) = layer.open(name).unwrap();
        feed(&mut layer, &create_response(id as u8, 0)).unwrap();
        (layer, id)
    }

    #[test]
    fn caps_request_layout() {
        let mut layer = DrdynvcLayer::new();
        let caps = layer.caps_request().unwrap();
        assert_eq!(caps, vec![0x50, 0x00, 0x02, 0x00, 0xA8, 0x03, 0xEA, 0x0D, 0x77, 0x1E, 0xE6, 0x42]);
        assert!(layer.caps_request().is_none());
    }

    #[test]
    fn open_requires_ready() {
        let mut layer = DrdynvcLayer::new();
        assert!(layer.open("Microsoft::Windows::RDS::Graphics").is_err());
        let mut layer = ready();
        let (id, msg) = layer.open("Microsoft::Windows::RDS::Graphics").unwrap();
        assert_eq!(id, 1);
        assert_eq!(msg[0], 0x10);
        assert_eq!(msg[1], 1);
        assert_eq!(&msg[2..msg.len() - 1], b"Microsoft::Windows::RDS::Graphics");
        assert_eq!(msg.last(), Some(&0));
        assert_eq!(layer.status(id), DvcStatus::Opening);
    }

    #[test]
    fn create_response_opens_or_fails() {
        let mut layer = ready();
        let (a, _) = layer.open("ECHO").unwrap();
        let (b, _) = layer.open("AUDIO_INPUT").unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(
            feed(&mut layer, &create_response(1, 0)).unwrap(),
            Some(DvcEvent::Opened {
                chan_id: 1,
                name: "ECHO".into(),
                success: true
            })
        );
        assert_eq!(
            feed(&mut layer, &create_response(2, -1)).unwrap(),
            Some(DvcEvent::Opened {
                chan_id: 2,
                name: "AUDIO_INPUT".into(),
                success: false
            })
        );
        assert_eq!(layer.status(1), DvcStatus::Open);
        assert_eq!(layer.status(2), DvcStatus::Closed);
        // The failed slot is reused.
        assert_eq!(layer.open("AUDIO_INPUT").unwrap().0, 2);
    }

    #[test]
    fn data_first_reassembles() {
        let (mut layer, id) = opened("ECHO");
        let mut first = vec![0x24, id as u8, 6, 0];
        first.extend_from_slice(b"ab");
        assert_eq!(feed(&mut layer, &first).unwrap(), None);
        assert_eq!(feed(&mut layer, &[0x30, id as u8, b'c', b'd']).unwrap(), None);
        assert_eq!(
            feed(&mut layer, &[0x30, id as u8, b'e', b'f']).unwrap(),
            Some(DvcEvent::Data {
                chan_id: id,
                data: b"abcdef".to_vec()
            })
        );
        // Plain data after the sequence completes is delivered as is.
        assert_eq!(
            feed(&mut layer, &[0x30, id as u8, b'z']).unwrap(),
            Some(DvcEvent::Data {
                chan_id: id,
                data: b"z".to_vec()
            })
        );
    }

    #[test]
    fn overflowing_reassembly_is_rejected() {
        let (mut layer, id) = opened("ECHO");
        feed(&mut layer, &[0x20, id as u8, 3, b'a']).unwrap();
        assert!(feed(&mut layer, &[0x30, id as u8, b'b', b'c', b'd']).is_err());
    }

    #[test]
    fn close_resets_slot_mid_reassembly() {
        let (mut layer, id) = opened("ECHO");
        feed(&mut layer, &[0x20, id as u8, 10, b'a']).unwrap();
        assert_eq!(
            feed(&mut layer, &[0x40, id as u8]).unwrap(),
            Some(DvcEvent::Closed { chan_id: id })
        );
        assert_eq!(layer.status(id), DvcStatus::Closed);
        assert_eq!(feed(&mut layer, &[0x30, id as u8, b'x']).unwrap(), None);
    }

    #[test]
    fn out_of_table_id_is_rejected() {
        let mut layer = ready();
        let err = feed(&mut layer, &[0x41, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, RdpError::InvalidField { .. }));
    }

    #[test]
    fn compressed_commands_are_rejected() {
        let (mut layer, id) = opened("ECHO");
        assert!(feed(&mut layer, &[0x70, id as u8, 0xE0]).is_err());
    }

    #[test]
    fn outbound_fragmentation_respects_chunk_size() {
        let (layer, id) = opened("ECHO");
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let messages = layer.data(id, &data).unwrap();
        assert!(messages.iter().all(|m| m.len() <= CHUNK_SIZE));
        assert_eq!(messages[0][0], 0x24);
        assert_eq!(u16::from_le_bytes([messages[0][2], messages[0][3]]), 5000);

        let mut rebuilt = messages[0][4..].to_vec();
        for m in &messages[1..] {
            assert_eq!(m[0], 0x30);
            rebuilt.extend_from_slice(&m[2..]);
        }
        assert_eq!(rebuilt, data);

        assert_eq!(layer.data(id, b"hi").unwrap(), vec![vec![0x30, id as u8, b'h', b'i']]);
        assert!(layer.data(9, b"hi").is_err());
    }

    #[test]
    fn server_close_frees_slot() {
        let (mut layer, id) = opened("ECHO");
        assert_eq!(layer.close(id).unwrap(), vec![0x40, id as u8]);
        assert_eq!(layer.status(id), DvcStatus::Closed);
        // The client's echoed close is ignored.
        assert_eq!(feed(&mut layer, &[0x40, id as u8]).unwrap(), None);
    }
}
