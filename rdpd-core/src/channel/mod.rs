//! Static virtual channels.
//!
//! Every channel PDU carries an 8 byte header: the total length of the
//! message it belongs to and `CHANNEL_FLAG_*` bits. Messages larger than
//! [`CHUNK_SIZE`] travel as a FIRST chunk, any number of middle chunks and
//! a LAST chunk; inbound chunks are concatenated per channel until LAST.

pub mod drdynvc;

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::ServerConfig;
use crate::error::{RdpError, Result};
use crate::mcs::ChannelItem;
use crate::sec::Outbound;
use crate::stream::{Layer, WireBuffer};

// ── Constants ────────────────────────────────────────────────────

pub const CHUNK_SIZE: usize = 1600;
pub const CHANNEL_PDU_HEADER_LEN: usize = 8;

pub const CHANNEL_FLAG_FIRST: u32 = 0x0000_0001;
pub const CHANNEL_FLAG_LAST: u32 = 0x0000_0002;
pub const CHANNEL_FLAG_SHOW_PROTOCOL: u32 = 0x0000_0010;
pub const CHANNEL_FLAG_SUSPEND: u32 = 0x0000_0020;
pub const CHANNEL_FLAG_RESUME: u32 = 0x0000_0040;
pub const CHANNEL_PACKET_COMPRESSED: u32 = 0x0020_0000;

pub const CHANNEL_OPTION_SHOW_PROTOCOL: u32 = 0x0020_0000;

// ── ChannelMessage ───────────────────────────────────────────────

/// A complete inbound static channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel_id: u16,
    /// Flags of the last chunk, with FIRST and LAST both set.
    pub flags: u32,
    pub total_len: u32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Reassembly {
    total: usize,
    data: Vec<u8>,
}

// ── ChannelLayer ─────────────────────────────────────────────────

/// Per-connection reassembly state, keyed by MCS channel id.
#[derive(Debug, Default)]
pub struct ChannelLayer {
    pending: HashMap<u16, Reassembly>,
}

impl ChannelLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one channel PDU for `channel`. Returns the message once
    /// its LAST chunk has arrived.
    pub fn recv(&mut self, s: &mut WireBuffer, channel: &ChannelItem, config: &ServerConfig) -> Result<Option<ChannelMessage>> {
        s.need(CHANNEL_PDU_HEADER_LEN, "channel pdu header")?;
        let total = s.read_u32_le()? as usize;
        let flags = s.read_u32_le()?;
        let chunk = s.read_bytes(s.remaining(), "channel chunk")?;

        if !channel.allowed {
            debug!(channel = %channel.name, "dropping data on disallowed channel");
            return Ok(None);
        }
        if flags & CHANNEL_PACKET_COMPRESSED != 0 {
            return Err(RdpError::ProtocolViolation("compressed virtual channel data"));
        }
        if total > config.max_channel_reassembly {
            return Err(RdpError::FrameTooLarge {
                size: total,
                max: config.max_channel_reassembly,
            });
        }
        trace!(channel = %channel.name, total, flags, len = chunk.len(), "channel chunk");

        if flags & CHANNEL_FLAG_FIRST != 0 {
            self.pending.insert(
                channel.chan_id,
                Reassembly {
                    total,
                    data: Vec::with_capacity(total),
                },
            );
        }
        let pending = self
            .pending
            .get_mut(&channel.chan_id)
            .ok_or(RdpError::ProtocolViolation("channel chunk without FIRST"))?;
        if pending.data.len() + chunk.len() > pending.total {
            return Err(RdpError::ProtocolViolation("channel chunks exceed declared length"));
        }
        pending.data.extend_from_slice(chunk);

        if flags & CHANNEL_FLAG_LAST == 0 {
            return Ok(None);
        }
        let Some(done) = self.pending.remove(&channel.chan_id) else {
            return Ok(None);
        };
        if done.data.len() != done.total {
            debug!(
                channel = %channel.name,
                declared = done.total,
                received = done.data.len(),
                "channel message shorter than declared"
            );
        }
        Ok(Some(ChannelMessage {
            channel_id: channel.chan_id,
            flags: flags | CHANNEL_FLAG_FIRST | CHANNEL_FLAG_LAST,
            total_len: done.total as u32,
            data: done.data,
        }))
    }

    /// Split `data` into chunks and queue them on `channel`.
    pub fn send(out: &mut Outbound<'_>, channel: &ChannelItem, data: &[u8]) -> Result<()> {
        if !channel.allowed {
            return Err(RdpError::UnexpectedPdu {
                pdu: "channel data",
                state: "channel not allowed",
            });
        }
        let total = u32::try_from(data.len()).map_err(|_| RdpError::invalid("channel message length", data.len() as u64))?;
        let extra = if channel.options & CHANNEL_OPTION_SHOW_PROTOCOL != 0 {
            CHANNEL_FLAG_SHOW_PROTOCOL
        } else {
            0
        };

        let mut chunks = data.chunks(CHUNK_SIZE).peekable();
        if chunks.peek().is_none() {
            return Self::send_chunk(out, channel.chan_id, total, CHANNEL_FLAG_FIRST | CHANNEL_FLAG_LAST | extra, &[]);
        }
        let mut flags = CHANNEL_FLAG_FIRST;
        while let Some(chunk) = chunks.next() {
            if chunks.peek().is_none() {
                flags |= CHANNEL_FLAG_LAST;
            }
            Self::send_chunk(out, channel.chan_id, total, flags | extra, chunk)?;
            flags = 0;
        }
        debug!(channel = %channel.name, len = data.len(), "channel message queued");
        Ok(())
    }

    fn send_chunk(out: &mut Outbound<'_>, chan_id: u16, total: u32, flags: u32, chunk: &[u8]) -> Result<()> {
        let mut s = out.init();
        s.push_layer(Layer::Channel, CHANNEL_PDU_HEADER_LEN);
        s.write_bytes(chunk);
        s.mark_end();
        s.pop_layer(Layer::Channel)?;
        s.write_u32_le(total);
        s.write_u32_le(flags);
        s.seek(s.end())?;
        out.send(s, chan_id)
    }
}

// ── Tests ────────────────────────────────────────────────────────
