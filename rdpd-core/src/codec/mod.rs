//! Frame splitting for the RDP byte stream.
//!
//! The first byte of every PDU tells the two framings apart:
//!
//! ```text
//!  0x03 / 0x3c  slow path: TPKT, 16-bit big-endian length at offset 2
//!  otherwise    fast path: 1 or 2 byte PER-style length at offset 1
//! ```
//!
//! The codec only delimits frames. Parsing happens in
//! [`ServerSession`](crate::session::ServerSession).

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{RdpError, Result};
use crate::fastpath;
use crate::iso::TPKT_HEADER_SIZE;

/// Largest frame either framing can express.
pub const MAX_FRAME_SIZE: usize = 0xFFFF;
/// Fastpath lengths carry 15 bits.
pub const MAX_FASTPATH_FRAME_SIZE: usize = 0x7FFF;

/// Splits the inbound stream into complete TPKT or fastpath frames and
/// writes pre-framed outbound PDUs untouched.
#[derive(Debug, Clone)]
pub struct RdpFrameCodec {
    max_frame: usize,
}

impl Default for RdpFrameCodec {
    fn default() -> Self {
        Self {
            max_frame: MAX_FRAME_SIZE,
        }
    }
}

impl RdpFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower the frame limit below what the framings allow.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.min(MAX_FRAME_SIZE),
        }
    }

    /// Declared length of the frame at the front of `src`, once enough
    /// header bytes are buffered.
    fn frame_length(src: &[u8]) -> Result<Option<usize>> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        if !fastpath::is_fastpath(first) {
            if src.len() < TPKT_HEADER_SIZE {
                return Ok(None);
            }
            let len = usize::from(u16::from_be_bytes([src[2], src[3]]));
            if len < TPKT_HEADER_SIZE {
                return Err(RdpError::invalid("tpkt length", len as u64));
            }
            return Ok(Some(len));
        }
        match fastpath::pdu_length(src) {
            None => Ok(None),
            Some(len) if len < 2 || len > MAX_FASTPATH_FRAME_SIZE => {
                Err(RdpError::invalid("fastpath length", len as u64))
            }
            Some(len) => Ok(Some(len)),
        }
    }
}

impl Decoder for RdpFrameCodec {
    type Item = Bytes;
    type Error = RdpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(len) = Self::frame_length(src)? else {
            return Ok(None);
        };
        if len > self.max_frame {
            return Err(RdpError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for RdpFrameCodec {
    type Error = RdpError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(RdpError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
