//! Fastpath framing: compact input PDUs from the client and update PDUs
//! to it.
//!
//! A fastpath PDU skips TPKT, X.224 and MCS entirely:
//!
//! ```text
//! +--------+-----------+--------------------+---------------------+
//! | header | length    | fips info / MAC    | events or updates   |
//! | 1 byte | 1-2 bytes | 0, 8 or 12 bytes   |                     |
//! +--------+-----------+--------------------+---------------------+
//! ```
//!
//! Security reuses the session's slow-path cipher state.

use tracing::{debug, trace};

use crate::error::{RdpError, Result};
use crate::events::{InputEvent, UpdateKind, kbd};
use crate::rdp::mppc::MppcCompressor;
use crate::sec::Outbound;
use crate::stream::WireBuffer;

// ── Constants ────────────────────────────────────────────────────

pub const FASTPATH_ACTION: u8 = 0x0;
/// Slow-path PDUs begin with the TPKT version.
pub const X224_ACTION: u8 = 0x3;

pub const FASTPATH_INPUT_SECURE_CHECKSUM: u8 = 0x1;
pub const FASTPATH_INPUT_ENCRYPTED: u8 = 0x2;
pub const FASTPATH_OUTPUT_SECURE_CHECKSUM: u8 = 0x1;
pub const FASTPATH_OUTPUT_ENCRYPTED: u8 = 0x2;

/// Largest update payload carried by one fragment.
pub const FASTPATH_FRAG_SIZE: usize = 16 * 1024 - 128;
/// Largest value the two-byte length form can express.
pub const FASTPATH_MAX_PDU_LEN: usize = 0x7FFF;

const FASTPATH_OUTPUT_COMPRESSION_USED: u8 = 0x2;

// Input event codes.
const EVENT_SCANCODE: u8 = 0x0;
const EVENT_MOUSE: u8 = 0x1;
const EVENT_MOUSEX: u8 = 0x2;
const EVENT_SYNC: u8 = 0x3;
const EVENT_UNICODE: u8 = 0x4;
const EVENT_QOE_TIMESTAMP: u8 = 0x6;

// Keyboard event flags.
const KBDFLAGS_RELEASE: u8 = 0x01;
const KBDFLAGS_EXTENDED: u8 = 0x02;
const KBDFLAGS_EXTENDED1: u8 = 0x04;

/// Whether the first byte of a PDU selects fastpath framing.
///
/// `0x03` is TPKT; `0x3c` is a legacy slow-path marker still accepted.
pub fn is_fastpath(first: u8) -> bool {
    first != 0x03 && first != 0x3c
}

/// Total PDU length from the first bytes of a fastpath PDU, or `None`
/// until enough bytes are buffered to tell.
pub fn pdu_length(prefix: &[u8]) -> Option<usize> {
    let first = *prefix.get(1)?;
    if first & 0x80 == 0 {
        return Some(usize::from(first));
    }
    let second = *prefix.get(2)?;
    Some((usize::from(first & 0x7F) << 8) | usize::from(second))
}

fn read_length(s: &mut WireBuffer) -> Result<usize> {
    let first = s.read_u8()?;
    if first & 0x80 == 0 {
        return Ok(usize::from(first));
    }
    let second = s.read_u8()?;
    Ok((usize::from(first & 0x7F) << 8) | usize::from(second))
}

// ── Input ────────────────────────────────────────────────────────

/// Parse one fastpath input PDU, decrypting it through the security
/// layer when flagged.
pub fn parse_input(s: &mut WireBuffer, sec: &mut crate::sec::SecLayer) -> Result<Vec<InputEvent>> {
    let header = s.read_u8()?;
    if header & 0x3 != FASTPATH_ACTION {
        return Err(RdpError::invalid("fastpath action", header & 0x3));
    }
    let mut num_events = usize::from((header >> 2) & 0xF);
    let sec_flags = header >> 6;

    let len = read_length(s)?;
    if len < s.pos() {
        return Err(RdpError::invalid("fastpath length", len as u64));
    }
    s.limit(len - s.pos(), "fastpath input")?;

    if sec_flags & FASTPATH_INPUT_ENCRYPTED != 0 {
        sec.fastpath_decrypt(s)?;
    }
    if num_events == 0 {
        num_events = usize::from(s.read_u8()?);
    }

    let mut events = Vec::with_capacity(num_events);
    for _ in 0..num_events {
        events.push(parse_event(s)?);
    }
    trace!(count = events.len(), "fastpath input");
    Ok(events)
}

fn parse_event(s: &mut WireBuffer) -> Result<InputEvent> {
    let header = s.read_u8()?;
    let flags = header & 0x1F;
    let code = header >> 5;
    match code {
        EVENT_SCANCODE => Ok(InputEvent::Scancode {
            flags: keyboard_flags(flags),
            code: u16::from(s.read_u8()?),
        }),
        EVENT_MOUSE | EVENT_MOUSEX => {
            s.need(6, "fastpath mouse event")?;
            let flags = s.read_u16_le()?;
            let x = s.read_u16_le()?;
            let y = s.read_u16_le()?;
            Ok(if code == EVENT_MOUSE {
                InputEvent::Mouse { flags, x, y }
            } else {
                InputEvent::MouseX { flags, x, y }
            })
        }
        EVENT_SYNC => Ok(InputEvent::Sync {
            toggle_flags: u32::from(flags),
        }),
        EVENT_UNICODE => Ok(InputEvent::Unicode {
            flags: keyboard_flags(flags),
            code: s.read_u16_le()?,
        }),
        EVENT_QOE_TIMESTAMP => Ok(InputEvent::QoeTimestamp {
            timestamp: s.read_u32_le()?,
        }),
        other => Err(RdpError::UnknownVariant {
            type_name: "fastpath input event",
            value: u64::from(other),
        }),
    }
}

/// Map fastpath keyboard flags onto `KBDFLAGS_*`.
fn keyboard_flags(fast: u8) -> u16 {
    let mut flags = 0;
    if fast & KBDFLAGS_RELEASE != 0 {
        flags |= kbd::RELEASE;
    }
    if fast & KBDFLAGS_EXTENDED != 0 {
        flags |= kbd::EXTENDED;
    }
    if fast & KBDFLAGS_EXTENDED1 != 0 {
        flags |= kbd::EXTENDED1;
    }
    flags
}

// ── Output ───────────────────────────────────────────────────────

/// `FASTPATH_UPDATETYPE_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateCode {
    Orders = 0x0,
    Bitmap = 0x1,
    Palette = 0x2,
    Synchronize = 0x3,
    SurfaceCommands = 0x4,
    PointerHidden = 0x5,
    PointerDefault = 0x6,
    PointerPosition = 0x8,
    ColorPointer = 0x9,
    CachedPointer = 0xA,
    NewPointer = 0xB,
    LargePointer = 0xC,
}

impl From<UpdateKind> for UpdateCode {
    fn from(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::Orders => Self::Orders,
            UpdateKind::Bitmap => Self::Bitmap,
            UpdateKind::Palette => Self::Palette,
            UpdateKind::Synchronize => Self::Synchronize,
            UpdateKind::SurfaceCommands => Self::SurfaceCommands,
            UpdateKind::PointerHidden => Self::PointerHidden,
            UpdateKind::PointerDefault => Self::PointerDefault,
            UpdateKind::PointerPosition => Self::PointerPosition,
            UpdateKind::ColorPointer => Self::ColorPointer,
            UpdateKind::CachedPointer => Self::CachedPointer,
            UpdateKind::NewPointer => Self::NewPointer,
            UpdateKind::LargePointer => Self::LargePointer,
        }
    }
}

/// `FASTPATH_FRAGMENT_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fragmentation {
    Single = 0x0,
    Last = 0x1,
    First = 0x2,
    Next = 0x3,
}

impl Fragmentation {
    fn of(index: usize, count: usize) -> Self {
        match (index, count) {
            (_, 1) => Self::Single,
            (0, _) => Self::First,
            (i, n) if i + 1 == n => Self::Last,
            _ => Self::Next,
        }
    }
}

/// Queue one update, split into as many fastpath PDUs as it needs.
///
/// Each fragment is compressed on its own when a compressor is given.
/// Returns the number of PDUs queued.
pub fn send_update(
    out: &mut Outbound<'_>,
    code: UpdateCode,
    payload: &[u8],
    mut mppc: Option<&mut MppcCompressor>,
) -> Result<usize> {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(FASTPATH_FRAG_SIZE).collect()
    };
    let count = chunks.len();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let compressed = mppc.as_deref_mut().map(|c| c.compress(chunk));
        let (compression_flags, data) = match &compressed {
            Some(c) => (Some(c.flags), c.data.as_deref().unwrap_or(chunk)),
            None => (None, chunk),
        };
        let s = write_update_pdu(out, code, Fragmentation::of(index, count), compression_flags, data)?;
        out.push(s);
    }
    debug!(?code, bytes = payload.len(), fragments = count, "fastpath update");
    Ok(count)
}

fn write_update_pdu(
    out: &mut Outbound<'_>,
    code: UpdateCode,
    fragmentation: Fragmentation,
    compression_flags: Option<u8>,
    data: &[u8],
) -> Result<WireBuffer> {
    let mut s = WireBuffer::with_capacity(data.len() + 24);
    let sec_flags = if out.sec.fastpath_encrypted() {
        FASTPATH_OUTPUT_ENCRYPTED
    } else {
        0
    };
    s.write_u8(FASTPATH_ACTION | (sec_flags << 6));
    s.write_u16_be(0);
    let header_at = s.pos();
    s.write_zeros(out.sec.fastpath_header_len());

    let compression = if compression_flags.is_some() {
        FASTPATH_OUTPUT_COMPRESSION_USED
    } else {
        0
    };
    s.write_u8(code as u8 | ((fragmentation as u8) << 4) | (compression << 6));
    if let Some(flags) = compression_flags {
        s.write_u8(flags);
    }
    let size = u16::try_from(data.len()).map_err(|_| RdpError::invalid("fastpath update size", data.len() as u64))?;
    s.write_u16_le(size);
    s.write_bytes(data);
    s.mark_end();

    out.sec.fastpath_encrypt(&mut s, header_at)?;

    let len = s.end();
    if len > FASTPATH_MAX_PDU_LEN {
        return Err(RdpError::invalid("fastpath pdu length", len as u64));
    }
    s.seek(1)?;
    s.write_u16_be(0x8000 | len as u16);
    s.seek(len)?;
    Ok(s)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;

    use super::*;
    use crate::client_info::CompressionType;
    use crate::config::CryptLevel;
    use crate::events::ptr;
    use crate::mcs::McsLayer;
    use crate::sec::SecLayer;
    use crate::sec::crypto::EncryptionMethod;
    use crate::sec::tests::{client_cipher, keyed_layer};

    fn input_pdu(sec_flags: u8, num_events: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len() + 2;
        let mut v = vec![(num_events << 2) | (sec_flags << 6), len as u8];
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn discriminates_first_byte() {
        assert!(!is_fastpath(0x03));
        assert!(!is_fastpath(0x3c));
        assert!(is_fastpath(0x44));
        assert_eq!(pdu_length(&[0x04, 0x09]), Some(9));
        assert_eq!(pdu_length(&[0x04, 0x81, 0x2C]), Some(0x12C));
        assert_eq!(pdu_length(&[0x04, 0x81]), None);
    }

    #[test]
    fn parses_every_event_kind() {
        let mut body = vec![
            // scancode 0x1E, released + extended
            (EVENT_SCANCODE << 5) | KBDFLAGS_RELEASE | KBDFLAGS_EXTENDED,
            0x1E,
            // mouse move to (100, 200)
            EVENT_MOUSE << 5,
        ];
        body.extend_from_slice(&ptr::MOVE.to_le_bytes());
        body.extend_from_slice(&100u16.to_le_bytes());
        body.extend_from_slice(&200u16.to_le_bytes());
        // sync with caps lock
        body.push((EVENT_SYNC << 5) | 0x04);
        // unicode 'é'
        body.push(EVENT_UNICODE << 5);
        body.extend_from_slice(&0x00E9u16.to_le_bytes());
        // qoe
        body.push(EVENT_QOE_TIMESTAMP << 5);
        body.extend_from_slice(&1234u32.to_le_bytes());

        let pdu = input_pdu(0, 5, &body);
        let events = parse_input(&mut WireBuffer::from_slice(&pdu), &mut SecLayer::new()).unwrap();
        assert_eq!(
            events,
            vec![
                InputEvent::Scancode {
                    flags: kbd::RELEASE | kbd::EXTENDED,
                    code: 0x1E
                },
                InputEvent::Mouse {
                    flags: ptr::MOVE,
                    x: 100,
                    y: 200
                },
                InputEvent::Sync { toggle_flags: 4 },
                InputEvent::Unicode { flags: 0, code: 0xE9 },
                InputEvent::QoeTimestamp { timestamp: 1234 },
            ]
        );
    }

    #[test]
    fn event_count_byte_follows_when_header_count_is_zero() {
        let body = [1, EVENT_SCANCODE << 5, 0x2A];
        let pdu = input_pdu(0, 0, &body);
        let events = parse_input(&mut WireBuffer::from_slice(&pdu), &mut SecLayer::new()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn truncated_mouse_event_fails() {
        let body = [EVENT_MOUSE << 5, 0x00, 0x08];
        let pdu = input_pdu(0, 1, &body);
        let err = parse_input(&mut WireBuffer::from_slice(&pdu), &mut SecLayer::new()).unwrap_err();
        assert!(err.is_parse_error());
    }

    #[test]
    fn declared_length_bounds_the_events() {
        // Two events declared but the length only covers one.
        let mut pdu = input_pdu(0, 2, &[EVENT_SCANCODE << 5, 0x10]);
        pdu.extend_from_slice(&[EVENT_SCANCODE << 5, 0x11]);
        assert!(parse_input(&mut WireBuffer::from_slice(&pdu), &mut SecLayer::new()).is_err());
    }

    #[test]
    fn unknown_event_code_is_rejected() {
        let pdu = input_pdu(0, 1, &[7 << 5]);
        let err = parse_input(&mut WireBuffer::from_slice(&pdu), &mut SecLayer::new()).unwrap_err();
        assert!(matches!(err, RdpError::UnknownVariant { .. }));
    }

    #[test]
    fn encrypted_input_is_decrypted() {
        let (mut sec, cr) = keyed_layer(CryptLevel::High, EncryptionMethod::BIT_128);
        let mut client = client_cipher(&cr, EncryptionMethod::BIT_128);
        let mut events = vec![EVENT_SCANCODE << 5, 0x1C];
        let sig = client.encrypt(&mut events);
        let mut body = sig.to_vec();
        body.extend_from_slice(&events);
        let pdu = input_pdu(FASTPATH_INPUT_ENCRYPTED, 1, &body);

        let parsed = parse_input(&mut WireBuffer::from_slice(&pdu), &mut sec).unwrap();
        assert_eq!(parsed, vec![InputEvent::Scancode { flags: 0, code: 0x1C }]);
    }

    #[test]
    fn encrypted_input_without_keys_is_rejected() {
        let pdu = input_pdu(FASTPATH_INPUT_ENCRYPTED, 1, &[0; 10]);
        assert!(parse_input(&mut WireBuffer::from_slice(&pdu), &mut SecLayer::new()).is_err());
    }

    fn send(sec: &mut SecLayer, code: UpdateCode, payload: &[u8], mppc: Option<&mut MppcCompressor>) -> Vec<Bytes> {
        let mcs = McsLayer::new(false);
        let mut queue = VecDeque::new();
        let mut out = Outbound {
            sec,
            mcs: &mcs,
            queue: &mut queue,
        };
        send_update(&mut out, code, payload, mppc).unwrap();
        queue.into_iter().collect()
    }

    #[test]
    fn small_update_is_a_single_plain_fragment() {
        let pdus = send(&mut SecLayer::new(), UpdateCode::PointerPosition, &[1, 0, 2, 0], None);
        assert_eq!(pdus.len(), 1);
        let pdu = &pdus[0];
        assert_eq!(pdu[0], 0x00);
        assert_eq!(pdu_length(pdu), Some(pdu.len()));
        assert_eq!(pdu[3], UpdateCode::PointerPosition as u8);
        assert_eq!(&pdu[4..6], &4u16.to_le_bytes());
        assert_eq!(&pdu[6..], &[1, 0, 2, 0]);
    }

    #[test]
    fn large_update_is_fragmented() {
        let payload = vec![0x5A; FASTPATH_FRAG_SIZE * 2 + 10];
        let pdus = send(&mut SecLayer::new(), UpdateCode::Bitmap, &payload, None);
        let frags: Vec<u8> = pdus.iter().map(|p| (p[3] >> 4) & 0x3).collect();
        assert_eq!(
            frags,
            vec![
                Fragmentation::First as u8,
                Fragmentation::Next as u8,
                Fragmentation::Last as u8
            ]
        );
        let total: usize = pdus
            .iter()
            .map(|p| usize::from(u16::from_le_bytes([p[4], p[5]])))
            .sum();
        assert_eq!(total, payload.len());
        assert!(pdus.iter().all(|p| p.len() <= FASTPATH_MAX_PDU_LEN));
    }

    #[test]
    fn encrypted_update_decrypts_on_the_client() {
        let (mut sec, cr) = keyed_layer(CryptLevel::High, EncryptionMethod::BIT_128);
        let mut client = client_cipher(&cr, EncryptionMethod::BIT_128);
        let pdus = send(&mut sec, UpdateCode::Orders, &[9, 8, 7], None);
        let pdu = pdus[0].to_vec();
        assert_eq!(pdu[0] >> 6, FASTPATH_OUTPUT_ENCRYPTED);
        let mut body = pdu[11..].to_vec();
        client.decrypt(&mut body);
        assert_eq!(body, vec![UpdateCode::Orders as u8, 3, 0, 9, 8, 7]);
    }

    #[test]
    fn compressed_update_carries_flags_byte() {
        let mut mppc = MppcCompressor::new(CompressionType::Mppc64K);
        let payload = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabc".to_vec();
        let pdus = send(&mut SecLayer::new(), UpdateCode::Orders, &payload, Some(&mut mppc));
        let pdu = &pdus[0];
        assert_eq!(pdu[3] >> 6, FASTPATH_OUTPUT_COMPRESSION_USED);
        let size = usize::from(u16::from_le_bytes([pdu[5], pdu[6]]));
        assert!(size < payload.len());
        assert_eq!(pdu.len(), 7 + size);
    }
}
