//! Process-wide server policy and key material.
//!
//! Everything here is loaded once at startup and shared read-only by all
//! connections through an `Arc<ServerContext>`.

use std::path::Path;
use std::sync::Arc;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{RdpError, Result};
use crate::network::TlsUpgrade;

// ── Policy enums ─────────────────────────────────────────────────

/// Which security protocol the listener insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLayer {
    /// Standard RDP security (RC4 / FIPS) only.
    Rdp,
    /// TLS only.
    Tls,
    /// CredSSP over TLS.
    Hybrid,
    /// TLS when the client offers it, RDP security otherwise.
    #[default]
    Negotiate,
}

/// Encryption level for standard RDP security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptLevel {
    None,
    Low,
    #[default]
    ClientCompatible,
    High,
    Fips,
}

/// Which direction may use fastpath framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastpathMode {
    None,
    Input,
    Output,
    #[default]
    Both,
}

impl FastpathMode {
    pub fn input(self) -> bool {
        matches!(self, Self::Input | Self::Both)
    }

    pub fn output(self) -> bool {
        matches!(self, Self::Output | Self::Both)
    }
}

/// Bitmap codecs the server advertises in the bitmap codecs capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertisedCodec {
    NsCodec,
    RemoteFx,
    Jpeg,
}

// ── ServerConfig ─────────────────────────────────────────────────

/// Per-listener protocol policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub security_layer: SecurityLayer,
    pub crypt_level: CryptLevel,
    /// Upper bound for the negotiated colour depth.
    pub max_bpp: u8,
    pub fastpath: FastpathMode,
    /// Static channel names clients may join; `None` allows all.
    pub allowed_channels: Option<Vec<String>>,
    pub allow_multimon: bool,
    /// Reject logons without auto-logon credentials.
    pub require_credentials: bool,
    /// Treat a channel-join count mismatch as fatal instead of a warning.
    pub strict_channel_join: bool,
    /// Offer MPPC bulk compression when the client asks for it.
    pub bulk_compression: bool,
    pub allow_rail: bool,
    pub advertised_codecs: Vec<AdvertisedCodec>,
    /// Largest reassembled static or dynamic channel message.
    pub max_channel_reassembly: usize,
    /// Maximum request size advertised in the multifragment capability.
    pub multifrag_max_request_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            security_layer: SecurityLayer::default(),
            crypt_level: CryptLevel::default(),
            max_bpp: 32,
            fastpath: FastpathMode::default(),
            allowed_channels: None,
            allow_multimon: true,
            require_credentials: false,
            strict_channel_join: false,
            bulk_compression: true,
            allow_rail: false,
            advertised_codecs: vec![AdvertisedCodec::RemoteFx],
            max_channel_reassembly: 4 * 1024 * 1024,
            multifrag_max_request_size: 3 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Whether a client-requested static channel may be joined.
    pub fn channel_allowed(&self, name: &str) -> bool {
        match &self.allowed_channels {
            None => true,
            Some(list) => list.iter().any(|c| c.eq_ignore_ascii_case(name)),
        }
    }
}

// ── ServerKeys ───────────────────────────────────────────────────

/// RSA key pair and proprietary-certificate signature for standard RDP
/// security. All integers are little-endian, as they travel on the wire.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ServerKeys {
    pub modulus: Vec<u8>,
    pub public_exponent: Vec<u8>,
    pub private_exponent: Vec<u8>,
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl std::fmt::Debug for ServerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeys")
            .field("modulus_len", &self.modulus.len())
            .finish_non_exhaustive()
    }
}

/// Modulus size of the 512-bit development key.
pub const RSA_KEY_LEN: usize = 64;
/// Modulus sizes a proprietary certificate can carry: 512 and 2048 bit.
pub const RSA_KEY_LENS: [usize; 2] = [64, 256];
/// Size of the certificate signature blob.
pub const RSA_SIGNATURE_LEN: usize = 64;

impl ServerKeys {
    /// Load a key file (TOML with byte arrays).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let keys: ServerKeys = toml::from_str(&text)?;
        keys.validate()?;
        Ok(keys)
    }

    /// Check sizes so the certificate builder can rely on them.
    pub fn validate(&self) -> Result<()> {
        let key_len = self.modulus.len();
        if !RSA_KEY_LENS.contains(&key_len) {
            return Err(RdpError::Config(format!(
                "modulus must be 64 or 256 bytes, got {key_len}"
            )));
        }
        if self.private_exponent.is_empty() || self.private_exponent.len() > key_len {
            return Err(RdpError::Config("private exponent has invalid size".into()));
        }
        if self.public_exponent.len() != 4 {
            return Err(RdpError::Config("public exponent must be 4 bytes".into()));
        }
        if !self.signature.is_empty() && self.signature.len() != RSA_SIGNATURE_LEN {
            return Err(RdpError::Config(format!(
                "signature must be {RSA_SIGNATURE_LEN} bytes"
            )));
        }
        Ok(())
    }

    /// Modulus length in bytes; also the size of the encrypted client
    /// random.
    pub fn key_len(&self) -> usize {
        self.modulus.len()
    }

    /// A 512-bit key pair built from two well-known primes.
    ///
    /// Anyone can factor it: use only for development and tests.
    pub fn insecure_development_key() -> Self {
        let one = BigUint::from(1u32);
        let p1 = (BigUint::from(1u32) << 255) - BigUint::from(19u32);
        let p2 = (BigUint::from(1u32) << 256) - (BigUint::from(1u32) << 224)
            + (BigUint::from(1u32) << 192)
            + (BigUint::from(1u32) << 96)
            - &one;
        // gcd(7, phi) == 1 for this pair.
        Self::from_primes(&[p1, p2], 7, RSA_KEY_LEN)
    }

    /// A 2048-bit multi-prime key over the Mersenne primes 2^k - 1 for
    /// k in {31, 89, 127, 521, 1279}. As public as the 512-bit one.
    pub fn insecure_development_key_2048() -> Self {
        let primes: Vec<BigUint> = [31u32, 89, 127, 521, 1279]
            .into_iter()
            .map(|k| (BigUint::from(1u32) << k) - 1u32)
            .collect();
        // 65537 divides 2^m - 1 only when 32 | m, so it is coprime to
        // every p - 1 here.
        Self::from_primes(&primes, 65537, RSA_KEY_LENS[1])
    }

    fn from_primes(primes: &[BigUint], e: u32, key_len: usize) -> Self {
        let one = BigUint::from(1u32);
        let n = primes.iter().fold(BigUint::from(1u32), |acc, p| acc * p);
        let phi = primes.iter().fold(BigUint::from(1u32), |acc, p| acc * (p - &one));
        let d = BigUint::from(e).modinv(&phi).unwrap_or_default();

        let mut modulus = n.to_bytes_le();
        modulus.resize(key_len, 0);
        let mut private_exponent = d.to_bytes_le();
        private_exponent.resize(key_len, 0);

        Self {
            modulus,
            public_exponent: e.to_le_bytes().to_vec(),
            private_exponent,
            signature: vec![0; RSA_SIGNATURE_LEN],
        }
    }

    pub fn signature_or_zero(&self) -> [u8; RSA_SIGNATURE_LEN] {
        let mut out = [0u8; RSA_SIGNATURE_LEN];
        if self.signature.len() == RSA_SIGNATURE_LEN {
            out.copy_from_slice(&self.signature);
        }
        out
    }
}

// ── ServerContext ────────────────────────────────────────────────

/// Immutable state shared by every connection of a listener.
#[derive(Clone)]
pub struct ServerContext {
    pub config: ServerConfig,
    pub keys: Option<ServerKeys>,
    pub tls: Option<Arc<dyn TlsUpgrade>>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            keys: None,
            tls: None,
        }
    }

    pub fn with_keys(mut self, keys: ServerKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Whether standard RDP security can be offered at all.
    pub fn rdp_security_available(&self) -> bool {
        if self.keys.is_none() && self.config.crypt_level != CryptLevel::None {
            warn!("standard RDP security requested but no server keys are loaded");
            return false;
        }
        true
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

// ── Tests ────────────────────────────────────────────────────────
