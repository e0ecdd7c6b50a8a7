//! Cursor-based wire buffer with deferred layer headers.
//!
//! `WireBuffer` serves both directions:
//!
//! - **Inbound**: a read cursor walks towards `end`. Every primitive
//!   checks the remaining bytes first and fails with
//!   [`RdpError::TruncatedPdu`] instead of reading past `end`.
//! - **Outbound**: each protocol layer reserves room for its header with
//!   [`push_layer`](WireBuffer::push_layer) before the payload is known,
//!   the payload is written, [`mark_end`](WireBuffer::mark_end) fixes the
//!   length and the layers then [`pop_layer`](WireBuffer::pop_layer) from
//!   the top down to fill their headers in.
//!
//! ```text
//!  0        iso      mcs      sec      rdp      payload ... end
//!  |--------|--------|--------|--------|---------------------|
//!  ^ pop_layer(Iso) rewinds the cursor here to write TPKT/X.224
//! ```

use bytes::Bytes;

use crate::error::{RdpError, Result};

// ── Layer ────────────────────────────────────────────────────────

/// Named header slots a buffer can reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Iso = 0,
    Mcs = 1,
    Sec = 2,
    Rdp = 3,
    Channel = 4,
}

const LAYER_COUNT: usize = 5;

// ── WireBuffer ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WireBuffer {
    data: Vec<u8>,
    pos: usize,
    end: usize,
    layers: [Option<usize>; LAYER_COUNT],
}

impl WireBuffer {
    /// Empty outbound buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty outbound buffer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Inbound buffer over a copy of `bytes`; `end` is the slice length.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            pos: 0,
            end: bytes.len(),
            layers: [None; LAYER_COUNT],
        }
    }

    // ── Cursor ───────────────────────────────────────────────────

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Bytes left between the cursor and `end`.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub fn check_remaining(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    /// Fail with `TruncatedPdu` unless `n` bytes remain.
    pub fn need(&self, n: usize, what: &'static str) -> Result<()> {
        if self.check_remaining(n) {
            Ok(())
        } else {
            Err(RdpError::truncated(what, n, self.remaining()))
        }
    }

    /// Move the cursor to an absolute offset no further than `end`.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.end {
            return Err(RdpError::truncated("seek", pos, self.end));
        }
        self.pos = pos;
        Ok(())
    }

    /// Narrow the readable window to `len` bytes from the cursor.
    ///
    /// Used when an outer header declares the length of an inner PDU;
    /// the inner parser can then never consume trailing bytes.
    pub fn limit(&mut self, len: usize, what: &'static str) -> Result<()> {
        self.need(len, what)?;
        self.end = self.pos + len;
        Ok(())
    }

    /// Record the current cursor as the end of valid data.
    pub fn mark_end(&mut self) {
        self.end = self.pos;
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn peek_u8(&self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.data[self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let v = self.peek_u8()?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N, "fixed field")?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn read_bytes(&mut self, n: usize, what: &'static str) -> Result<&[u8]> {
        self.need(n, what)?;
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }

    pub fn read_vec(&mut self, n: usize, what: &'static str) -> Result<Vec<u8>> {
        self.read_bytes(n, what).map(<[u8]>::to_vec)
    }

    pub fn skip(&mut self, n: usize, what: &'static str) -> Result<()> {
        self.need(n, what)?;
        self.pos += n;
        Ok(())
    }

    /// Everything from the cursor to `end`, without advancing.
    pub fn rest(&self) -> &[u8] {
        &self.data[self.pos.min(self.end)..self.end]
    }

    /// Mutable view of `start..end`, used for in-place decryption.
    pub fn rest_mut(&mut self) -> &mut [u8] {
        let start = self.pos.min(self.end);
        &mut self.data[start..self.end]
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Make room for `n` more bytes at the cursor without moving it.
    pub fn reserve(&mut self, n: usize) {
        self.ensure(n);
    }

    fn ensure(&mut self, n: usize) {
        let needed = self.pos + n;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32_be(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// Write at the cursor, overwriting reserved bytes or growing the buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        if self.pos > self.end {
            self.end = self.pos;
        }
    }

    pub fn write_zeros(&mut self, n: usize) {
        self.ensure(n);
        self.data[self.pos..self.pos + n].fill(0);
        self.pos += n;
        if self.pos > self.end {
            self.end = self.pos;
        }
    }

    // ── Layers ───────────────────────────────────────────────────

    /// Remember the cursor for `layer` and skip `n` bytes for its header.
    pub fn push_layer(&mut self, layer: Layer, n: usize) {
        self.layers[layer as usize] = Some(self.pos);
        self.write_zeros(n);
    }

    /// Rewind the cursor to the header reserved for `layer`.
    pub fn pop_layer(&mut self, layer: Layer) -> Result<()> {
        let offset = self
            .layer_offset(layer)
            .ok_or(RdpError::ProtocolViolation("header layer was never reserved"))?;
        self.pos = offset;
        Ok(())
    }

    pub fn layer_offset(&self, layer: Layer) -> Option<usize> {
        self.layers[layer as usize]
    }

    /// Record `offset` as the start of `layer` without writing anything.
    pub fn set_layer(&mut self, layer: Layer, offset: usize) {
        self.layers[layer as usize] = Some(offset);
    }

    /// Remove `n` reserved bytes at `at`, shifting the tail down.
    ///
    /// Lets a layer reserve room for the longest form of a variable
    /// header and drop the slack once the short form is chosen. Layer
    /// offsets above `at` move with the data.
    pub fn collapse(&mut self, at: usize, n: usize) -> Result<()> {
        if at + n > self.end {
            return Err(RdpError::truncated("collapse", at + n, self.end));
        }
        self.data.drain(at..at + n);
        self.end -= n;
        if self.pos > at {
            self.pos = self.pos.saturating_sub(n).max(at);
        }
        for offset in self.layers.iter_mut().flatten() {
            if *offset > at {
                *offset = offset.saturating_sub(n).max(at);
            }
        }
        Ok(())
    }

    // ── Views ────────────────────────────────────────────────────

    /// All valid bytes, `0..end`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.end]
    }

    /// Mutable view of `start..end`.
    pub fn slice_mut(&mut self, start: usize) -> Result<&mut [u8]> {
        if start > self.end {
            return Err(RdpError::truncated("slice", start, self.end));
        }
        Ok(&mut self.data[start..self.end])
    }

    pub fn into_bytes(mut self) -> Bytes {
        self.data.truncate(self.end);
        Bytes::from(self.data)
    }
}

// ── Tests ────────────────────────────────────────────────────────
