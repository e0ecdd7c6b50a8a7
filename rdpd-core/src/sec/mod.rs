//! Security layer: security headers, key exchange, encryption, the
//! Client Info PDU and the licensing stub.
//!
//! Header presence is connection state. Every inbound PDU carries a
//! security header until logon; with no encryption (TLS, or
//! `CryptLevel::None`) the header disappears for good afterwards.
//!
//! ```text
//! basic:   flags u16 | flagsHi u16
//! header1: basic | MAC signature (8)
//! header2: basic | length=0x10 u16 | version u8 | pad u8 | signature (8)   (FIPS)
//! ```

pub mod crypto;
pub mod fips;
pub mod gcc;
pub mod license;
pub mod logon;

use std::collections::VecDeque;

use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::client_info::ClientInfo;
use crate::config::{CryptLevel, ServerConfig, ServerContext, ServerKeys};
use crate::error::{RdpError, Result};
use crate::iso::Protocols;
use crate::mcs::{McsLayer, GLOBAL_CHANNEL_ID};
use crate::stream::{Layer, WireBuffer};

use self::crypto::{decrypt_client_random, EncryptionMethod, RdpCipher, SessionKeys};
use self::fips::{FipsCipher, FIPS_HEADER_LEN, FIPS_VERSION};

// ── Header flags ─────────────────────────────────────────────────

pub const SEC_EXCHANGE_PKT: u16 = 0x0001;
pub const SEC_TRANSPORT_REQ: u16 = 0x0002;
pub const SEC_ENCRYPT: u16 = 0x0008;
pub const SEC_RESET_SEQNO: u16 = 0x0010;
pub const SEC_IGNORE_SEQNO: u16 = 0x0020;
pub const SEC_INFO_PKT: u16 = 0x0040;
pub const SEC_LICENSE_PKT: u16 = 0x0080;
pub const SEC_REDIRECTION_PKT: u16 = 0x0400;
pub const SEC_SECURE_CHECKSUM: u16 = 0x0800;

const SIGNATURE_LEN: usize = 8;
/// Exchange PDU length field: ciphertext plus 8 bytes of padding.
/// Zero padding after the encrypted client random.
const EXCHANGE_PADDING: usize = 8;

// ── Method selection ─────────────────────────────────────────────

/// Pick the encryption method for the configured level.
///
/// A client lacking the wanted method gets its own strongest one; the
/// mismatch is logged, not fatal. TLS carries no RDP encryption.
pub fn select_encryption(level: CryptLevel, client_methods: u32, tls: bool) -> (EncryptionMethod, CryptLevel) {
    if tls || level == CryptLevel::None {
        return (EncryptionMethod::NONE, CryptLevel::None);
    }
    let client = EncryptionMethod::from_bits_truncate(client_methods);
    let strongest = [
        EncryptionMethod::BIT_128,
        EncryptionMethod::BIT_56,
        EncryptionMethod::BIT_40,
    ]
    .into_iter()
    .find(|m| client.contains(*m));

    let wanted = match level {
        CryptLevel::Low => Some(EncryptionMethod::BIT_40),
        CryptLevel::ClientCompatible => strongest,
        CryptLevel::High => Some(EncryptionMethod::BIT_128),
        CryptLevel::Fips => Some(EncryptionMethod::FIPS),
        CryptLevel::None => None,
    };
    let method = match wanted {
        Some(m) if client.contains(m) => m,
        _ => {
            let fallback = strongest.unwrap_or(EncryptionMethod::BIT_128);
            warn!(
                ?level,
                client_methods,
                ?fallback,
                "client does not offer the configured encryption method"
            );
            fallback
        }
    };
    (method, level)
}

// ── Cipher ───────────────────────────────────────────────────────

enum SecCipher {
    Rc4(RdpCipher),
    Fips(FipsCipher),
}

/// What an inbound security PDU turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecEvent {
    /// Client random received and session keys derived.
    KeysEstablished,
    /// Client Info processed; the license PDU is due.
    LoggedOn,
    /// A licensing PDU from the client.
    License,
    /// Upper-layer payload; the buffer is positioned on it.
    Data,
}

// ── SecLayer ─────────────────────────────────────────────────────

pub struct SecLayer {
    method: EncryptionMethod,
    level: CryptLevel,
    header_present: bool,
    server_random: [u8; 32],
    cipher: Option<SecCipher>,
    logged_on: bool,
}

impl std::fmt::Debug for SecLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecLayer")
            .field("method", &self.method)
            .field("level", &self.level)
            .field("header_present", &self.header_present)
            .field("keyed", &self.cipher.is_some())
            .field("logged_on", &self.logged_on)
            .finish()
    }
}

impl Default for SecLayer {
    fn default() -> Self {
        Self {
            method: EncryptionMethod::NONE,
            level: CryptLevel::None,
            header_present: true,
            server_random: [0; 32],
            cipher: None,
            logged_on: false,
        }
    }
}

impl SecLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    pub fn level(&self) -> CryptLevel {
        self.level
    }

    pub fn header_present(&self) -> bool {
        self.header_present
    }

    pub fn logged_on(&self) -> bool {
        self.logged_on
    }

    /// Whether the server encrypts what it sends.
    fn encrypts_output(&self) -> bool {
        self.level > CryptLevel::Low && self.cipher.is_some()
    }

    // ── Connect ──────────────────────────────────────────────────

    /// Parse the GCC client data, settle the encryption method and
    /// build the server data for the MCS Connect-Response.
    pub fn process_connect_initial(
        &mut self,
        user_data: &[u8],
        ctx: &ServerContext,
        selected: Protocols,
        requested: Protocols,
        mcs: &mut McsLayer,
        info: &mut ClientInfo,
    ) -> Result<Vec<u8>> {
        let channels = gcc::parse_client_data(user_data, info, &ctx.config, selected)?;
        info.client_requested_protocols = requested.bits();
        let ids: Vec<u16> = mcs.assign_channels(channels)?.iter().map(|c| c.chan_id).collect();

        let (method, level) = select_encryption(
            ctx.config.crypt_level,
            info.client_encryption_methods,
            selected.uses_tls(),
        );
        self.method = method;
        self.level = level;

        let keys = if method == EncryptionMethod::NONE {
            None
        } else {
            let keys = ctx
                .keys
                .as_ref()
                .ok_or(RdpError::CryptoFailure("RDP security selected without server keys"))?;
            rand::thread_rng().fill_bytes(&mut self.server_random);
            Some((&self.server_random, keys))
        };
        info!(?method, ?level, channels = ids.len(), "security parameters");

        gcc::write_server_data(
            requested.bits(),
            &ids,
            &gcc::ServerSecurity {
                method,
                level,
                random_and_keys: keys,
            },
        )
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Strip the security header (if present) and decrypt.
    pub fn recv(
        &mut self,
        s: &mut WireBuffer,
        keys: Option<&ServerKeys>,
        config: &ServerConfig,
        info: &mut ClientInfo,
    ) -> Result<SecEvent> {
        if !self.header_present {
            return Ok(SecEvent::Data);
        }
        s.need(4, "security header")?;
        let flags = s.read_u16_le()?;
        let _flags_hi = s.read_u16_le()?;

        if flags & SEC_ENCRYPT != 0 {
            self.decrypt(s)?;
        }

        if flags & SEC_EXCHANGE_PKT != 0 {
            self.recv_exchange(s, keys)?;
            return Ok(SecEvent::KeysEstablished);
        }
        if flags & SEC_INFO_PKT != 0 {
            if self.logged_on {
                return Err(RdpError::UnexpectedPdu {
                    pdu: "client info",
                    state: "logged on",
                });
            }
            info.logon = logon::parse_logon_info(s, config)?;
            self.logged_on = true;
            if self.level == CryptLevel::None {
                self.header_present = false;
                debug!("security header disabled");
            }
            return Ok(SecEvent::LoggedOn);
        }
        if flags & SEC_LICENSE_PKT != 0 {
            debug!("client licensing PDU ignored");
            return Ok(SecEvent::License);
        }
        Ok(SecEvent::Data)
    }

    fn decrypt(&mut self, s: &mut WireBuffer) -> Result<()> {
        match self.cipher.as_mut() {
            None => Err(RdpError::UnexpectedPdu {
                pdu: "encrypted PDU",
                state: "no session keys",
            }),
            Some(SecCipher::Rc4(cipher)) => {
                s.skip(SIGNATURE_LEN, "data signature")?;
                cipher.decrypt(s.rest_mut());
                Ok(())
            }
            Some(SecCipher::Fips(cipher)) => {
                s.need(4 + SIGNATURE_LEN, "fips security header")?;
                let _len = s.read_u16_le()?;
                let _version = s.read_u8()?;
                let pad = usize::from(s.read_u8()?);
                s.skip(SIGNATURE_LEN, "data signature")?;
                cipher.decrypt(s.rest_mut())?;
                if pad > s.remaining() {
                    return Err(RdpError::invalid("fips padding", pad as u64));
                }
                s.limit(s.remaining() - pad, "fips payload")
            }
        }
    }

    /// `TS_SECURITY_PACKET`: decrypt the client random and key the session.
    fn recv_exchange(&mut self, s: &mut WireBuffer, keys: Option<&ServerKeys>) -> Result<()> {
        if self.method == EncryptionMethod::NONE || self.cipher.is_some() {
            return Err(RdpError::UnexpectedPdu {
                pdu: "security exchange",
                state: "sec",
            });
        }
        let keys = keys.ok_or(RdpError::CryptoFailure("no server key for security exchange"))?;
        let len = s.read_u32_le()?;
        if len as usize != keys.key_len() + EXCHANGE_PADDING {
            return Err(RdpError::invalid("security exchange length", len));
        }
        let ciphertext = s.read_bytes(keys.key_len(), "encrypted client random")?;
        let mut client_random = decrypt_client_random(keys, ciphertext)?;

        self.cipher = Some(if self.method == EncryptionMethod::FIPS {
            SecCipher::Fips(FipsCipher::derive(&client_random, &self.server_random)?)
        } else {
            let session = SessionKeys::derive(&client_random, &self.server_random, self.method);
            SecCipher::Rc4(RdpCipher::new(&session, self.method))
        });
        client_random.zeroize();
        info!(method = ?self.method, "session keys established");
        Ok(())
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Security header length for outbound slow-path PDUs.
    pub fn header_len(&self) -> usize {
        match self.level {
            CryptLevel::None => 0,
            CryptLevel::Low => 4,
            _ if self.method == EncryptionMethod::FIPS => 4 + 4 + SIGNATURE_LEN,
            _ => 4 + SIGNATURE_LEN,
        }
    }

    /// Reserve ISO, MCS and security headers.
    pub fn init(&self, s: &mut WireBuffer) {
        McsLayer::init(s);
        s.push_layer(Layer::Sec, self.header_len());
    }

    /// Write the security header, sign and encrypt, then frame for MCS.
    pub fn send(&mut self, s: &mut WireBuffer, mcs: &McsLayer, channel_id: u16) -> Result<()> {
        s.pop_layer(Layer::Sec)?;
        let header_at = s.pos();
        match self.level {
            CryptLevel::None => {}
            // Low protects client to server only.
            CryptLevel::Low => s.write_zeros(4),
            _ => self.seal(s, header_at)?,
        }
        s.seek(s.end())?;
        mcs.send(s, channel_id)
    }

    /// Sign and encrypt everything after the header reserved at `header_at`.
    fn seal(&mut self, s: &mut WireBuffer, header_at: usize) -> Result<()> {
        let data_at = header_at + self.header_len();
        match self.cipher.as_mut() {
            None => Err(RdpError::CryptoFailure("encryption requested before key exchange")),
            Some(SecCipher::Rc4(cipher)) => {
                let sig = cipher.encrypt(s.slice_mut(data_at)?);
                s.seek(header_at)?;
                s.write_u16_le(SEC_ENCRYPT);
                s.write_u16_le(0);
                s.write_bytes(&sig);
                Ok(())
            }
            Some(SecCipher::Fips(cipher)) => {
                let len = s.end() - data_at;
                let pad = fips::pad_len(len);
                let sig = cipher.sign(&s.slice_mut(data_at)?[..len])?;
                s.seek(s.end())?;
                s.write_zeros(pad);
                s.mark_end();
                cipher.encrypt(s.slice_mut(data_at)?)?;
                s.seek(header_at)?;
                s.write_u16_le(SEC_ENCRYPT);
                s.write_u16_le(0);
                s.write_u16_le(FIPS_HEADER_LEN);
                s.write_u8(FIPS_VERSION);
                s.write_u8(pad as u8);
                s.write_bytes(&sig);
                Ok(())
            }
        }
    }

    /// The licensing PDU: always a plain basic security header.
    pub fn license_pdu(&self, mcs: &McsLayer) -> Result<WireBuffer> {
        let mut s = WireBuffer::with_capacity(48);
        McsLayer::init(&mut s);
        s.write_u16_le(SEC_LICENSE_PKT);
        s.write_u16_le(0);
        license::write_valid_client(&mut s);
        s.mark_end();
        mcs.send(&mut s, GLOBAL_CHANNEL_ID)?;
        Ok(s)
    }

    // ── Fastpath ─────────────────────────────────────────────────

    /// Bytes between the fastpath length and the payload.
    pub fn fastpath_header_len(&self) -> usize {
        if !self.encrypts_output() {
            0
        } else if self.method == EncryptionMethod::FIPS {
            4 + SIGNATURE_LEN
        } else {
            SIGNATURE_LEN
        }
    }

    /// Whether outbound fastpath PDUs carry the encrypted flag.
    pub fn fastpath_encrypted(&self) -> bool {
        self.encrypts_output()
    }

    /// Decrypt an inbound fastpath payload flagged as encrypted.
    pub fn fastpath_decrypt(&mut self, s: &mut WireBuffer) -> Result<()> {
        match self.cipher.as_mut() {
            None => Err(RdpError::UnexpectedPdu {
                pdu: "encrypted fastpath input",
                state: "no session keys",
            }),
            Some(SecCipher::Rc4(cipher)) => {
                s.skip(SIGNATURE_LEN, "fastpath signature")?;
                cipher.decrypt(s.rest_mut());
                Ok(())
            }
            Some(SecCipher::Fips(cipher)) => {
                s.need(4 + SIGNATURE_LEN, "fastpath fips information")?;
                let _len = s.read_u16_le()?;
                let _version = s.read_u8()?;
                let pad = usize::from(s.read_u8()?);
                s.skip(SIGNATURE_LEN, "fastpath signature")?;
                cipher.decrypt(s.rest_mut())?;
                if pad > s.remaining() {
                    return Err(RdpError::invalid("fips padding", pad as u64));
                }
                s.limit(s.remaining() - pad, "fastpath payload")
            }
        }
    }

    /// Seal a fastpath payload in place.
    ///
    /// `header_at` is where [`fastpath_header_len`](Self::fastpath_header_len)
    /// bytes were reserved; the payload runs from there to `end`.
    pub fn fastpath_encrypt(&mut self, s: &mut WireBuffer, header_at: usize) -> Result<()> {
        let data_at = header_at + self.fastpath_header_len();
        match self.cipher.as_mut() {
            Some(SecCipher::Rc4(cipher)) if self.level > CryptLevel::Low => {
                let sig = cipher.encrypt(s.slice_mut(data_at)?);
                s.seek(header_at)?;
                s.write_bytes(&sig);
            }
            Some(SecCipher::Fips(cipher)) if self.level > CryptLevel::Low => {
                let len = s.end() - data_at;
                let pad = fips::pad_len(len);
                let sig = cipher.sign(&s.slice_mut(data_at)?[..len])?;
                s.seek(s.end())?;
                s.write_zeros(pad);
                s.mark_end();
                cipher.encrypt(s.slice_mut(data_at)?)?;
                s.seek(header_at)?;
                s.write_u16_le(FIPS_HEADER_LEN);
                s.write_u8(FIPS_VERSION);
                s.write_u8(pad as u8);
                s.write_bytes(&sig);
            }
            _ => {}
        }
        s.seek(s.end())
    }
}

// ── Outbound ─────────────────────────────────────────────────────

/// Borrowed lower layers plus the frame queue: what an upper layer
/// needs to put a PDU on the wire.
pub struct Outbound<'a> {
    pub sec: &'a mut SecLayer,
    pub mcs: &'a McsLayer,
    pub queue: &'a mut VecDeque<Bytes>,
}

impl Outbound<'_> {
    /// Fresh buffer with ISO, MCS and security headers reserved.
    pub fn init(&self) -> WireBuffer {
        let mut s = WireBuffer::with_capacity(256);
        self.sec.init(&mut s);
        s
    }

    /// Secure, frame and queue a slow-path PDU.
    pub fn send(&mut self, mut s: WireBuffer, channel_id: u16) -> Result<()> {
        self.sec.send(&mut s, self.mcs, channel_id)?;
        self.queue.push_back(s.into_bytes());
        Ok(())
    }

    /// Queue an already framed PDU.
    pub fn push(&mut self, s: WireBuffer) {
        self.queue.push_back(s.into_bytes());
    }
}

// ── Tests ────────────────────────────────────────────────────────
