//! MPPC bulk compressor (RDP 4.0 8K history and RDP 5.0 64K history).
//!
//! The compressor mirrors the client's decompressor state: a history
//! buffer that both sides append every compressed packet to. Tokens
//! are bit-packed most significant bit first:
//!
//! ```text
//! literal < 0x80     0xxxxxxx
//! literal >= 0x80    10 + low 7 bits
//! copy               offset prefix + offset bits, then length code
//! ```

use tracing::trace;

use crate::client_info::CompressionType;

// ── Flags ────────────────────────────────────────────────────────

pub const PACKET_COMPR_TYPE_8K: u8 = 0x00;
pub const PACKET_COMPR_TYPE_64K: u8 = 0x01;
pub const PACKET_COMPRESSED: u8 = 0x20;
pub const PACKET_AT_FRONT: u8 = 0x40;
pub const PACKET_FLUSHED: u8 = 0x80;

const HASH_BITS: u32 = 12;
const MIN_MATCH: usize = 3;

/// Result of compressing one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    /// `compressedType` / `compressionFlags` value to send.
    pub flags: u8,
    /// Compressed bytes, or `None` to send the input unchanged.
    pub data: Option<Vec<u8>>,
}

// ── BitWriter ────────────────────────────────────────────────────

#[derive(Default)]
struct BitWriter {
    out: Vec<u8>,
    acc: u64,
    bits: u32,
}

impl BitWriter {
    fn put(&mut self, value: u32, n: u32) {
        self.acc = (self.acc << n) | u64::from(value & ((1u32 << n) - 1));
        self.bits += n;
        while self.bits >= 8 {
            self.bits -= 8;
            self.out.push((self.acc >> self.bits) as u8);
        }
        self.acc &= (1u64 << self.bits) - 1;
    }

    fn len(&self) -> usize {
        self.out.len()
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bits > 0 {
            self.out.push((self.acc << (8 - self.bits)) as u8);
        }
        self.out
    }
}

// ── MppcCompressor ───────────────────────────────────────────────

pub struct MppcCompressor {
    large: bool,
    history: Vec<u8>,
    offset: usize,
    /// Last history position + 1 of each 3-byte hash; 0 is empty.
    table: Vec<u32>,
}

impl std::fmt::Debug for MppcCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MppcCompressor")
            .field("history", &self.history.len())
            .field("offset", &self.offset)
            .finish()
    }
}

impl MppcCompressor {
    /// RDP 6 compressors fall back to the 64K MPPC history.
    pub fn new(kind: CompressionType) -> Self {
        let large = kind >= CompressionType::Mppc64K;
        let size = if large { 65536 } else { 8192 };
        Self {
            large,
            history: vec![0; size],
            offset: 0,
            table: vec![0; 1 << HASH_BITS],
        }
    }

    fn type_flag(&self) -> u8 {
        if self.large {
            PACKET_COMPR_TYPE_64K
        } else {
            PACKET_COMPR_TYPE_8K
        }
    }

    fn max_match(&self) -> usize {
        if self.large { 65535 } else { 8191 }
    }

    /// Clear the history; the next packet must carry `PACKET_FLUSHED`.
    fn reset(&mut self) {
        self.history.fill(0);
        self.offset = 0;
        self.table.fill(0);
    }

    /// Compress one packet.
    ///
    /// When the output would not be smaller the history is flushed and
    /// the input goes out unchanged.
    pub fn compress(&mut self, src: &[u8]) -> Compressed {
        let mut flags = self.type_flag();
        if src.is_empty() || src.len() >= self.history.len() - MIN_MATCH {
            self.reset();
            return Compressed {
                flags: flags | PACKET_FLUSHED,
                data: None,
            };
        }
        if self.offset + src.len() >= self.history.len() - MIN_MATCH {
            self.offset = 0;
            flags |= PACKET_AT_FRONT;
        }

        let start = self.offset;
        let end = start + src.len();
        self.history[start..end].copy_from_slice(src);

        let mut bits = BitWriter::default();
        let mut i = start;
        while i < end {
            if bits.len() >= src.len() {
                break;
            }
            if let Some((distance, len)) = self.find_match(i, end) {
                self.encode_offset(&mut bits, distance);
                encode_length(&mut bits, len);
                i += len;
            } else {
                encode_literal(&mut bits, self.history[i]);
                i += 1;
            }
        }

        let out = bits.finish();
        if i < end || out.len() >= src.len() {
            trace!(len = src.len(), "mppc: incompressible, flushing history");
            self.reset();
            return Compressed {
                flags: self.type_flag() | PACKET_FLUSHED,
                data: None,
            };
        }
        self.offset = end;
        Compressed {
            flags: flags | PACKET_COMPRESSED,
            data: Some(out),
        }
    }

    /// Longest usable match for position `i`, as `(distance, length)`.
    ///
    /// Copies may overlap the bytes they produce: the decompressor
    /// copies one byte at a time.
    fn find_match(&mut self, i: usize, end: usize) -> Option<(usize, usize)> {
        if i + MIN_MATCH > end {
            return None;
        }
        let h = hash3(&self.history[i..i + MIN_MATCH]);
        let previous = self.table[h];
        self.table[h] = (i + 1) as u32;
        let cand = (previous as usize).checked_sub(1)?;
        if cand >= i || self.history[cand..cand + MIN_MATCH] != self.history[i..i + MIN_MATCH] {
            return None;
        }
        let max = (end - i).min(self.max_match());
        let mut len = MIN_MATCH;
        while len < max && self.history[cand + len] == self.history[i + len] {
            len += 1;
        }
        Some((i - cand, len))
    }

    fn encode_offset(&self, bits: &mut BitWriter, distance: usize) {
        let d = distance as u32;
        if self.large {
            match d {
                0..=63 => {
                    bits.put(0x1F, 5);
                    bits.put(d, 6);
                }
                64..=319 => {
                    bits.put(0x1E, 5);
                    bits.put(d - 64, 8);
                }
                320..=2367 => {
                    bits.put(0xE, 4);
                    bits.put(d - 320, 11);
                }
                _ => {
                    bits.put(0x6, 3);
                    bits.put(d - 2368, 16);
                }
            }
        } else {
            match d {
                0..=63 => {
                    bits.put(0xF, 4);
                    bits.put(d, 6);
                }
                64..=319 => {
                    bits.put(0xE, 4);
                    bits.put(d - 64, 8);
                }
                _ => {
                    bits.put(0x6, 3);
                    bits.put(d - 320, 13);
                }
            }
        }
    }
}

fn hash3(bytes: &[u8]) -> usize {
    let v = (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
    (v.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

fn encode_literal(bits: &mut BitWriter, byte: u8) {
    if byte < 0x80 {
        bits.put(u32::from(byte), 8);
    } else {
        bits.put(0x100 | u32::from(byte & 0x7F), 9);
    }
}

/// Length 3 is a single zero bit; a length in `[2^k, 2^(k+1))` is
/// `k - 1` one bits, a zero, then its low `k` bits.
fn encode_length(bits: &mut BitWriter, len: usize) {
    let len = len as u32;
    if len == 3 {
        bits.put(0, 1);
        return;
    }
    let k = 31 - len.leading_zeros();
    bits.put(((1u32 << (k - 1)) - 1) << 1, k);
    bits.put(len & ((1u32 << k) - 1), k);
}

// ── Tests ────────────────────────────────────────────────────────
