//! Standard RDP security: session key derivation, RC4 with periodic key
//! update, MAC signatures and the RSA client-random exchange
//! (MS-RDPBCGR 5.3.4 - 5.3.7).

use bitflags::bitflags;
use md5::{Digest, Md5};
use num_bigint::BigUint;
use rc4::consts::{U8, U16};
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::ServerKeys;
use crate::error::{RdpError, Result};

bitflags! {
    /// `ENCRYPTION_METHOD_*` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EncryptionMethod: u32 {
        const BIT_40 = 0x0000_0001;
        const BIT_128 = 0x0000_0002;
        const BIT_56 = 0x0000_0008;
        const FIPS = 0x0000_0010;
    }
}

impl EncryptionMethod {
    pub const NONE: EncryptionMethod = EncryptionMethod::empty();

    /// RC4 key length in bytes.
    pub fn rc4_key_len(self) -> usize {
        if self == EncryptionMethod::BIT_128 { 16 } else { 8 }
    }
}

/// Operations between two key updates.
pub const KEY_UPDATE_INTERVAL: u32 = 4096;

pub const CLIENT_RANDOM_LEN: usize = 32;
pub const SERVER_RANDOM_LEN: usize = 32;

const PAD_54: [u8; 40] = [0x36; 40];
const PAD_92: [u8; 48] = [0x5C; 48];

// ── Key derivation ───────────────────────────────────────────────

/// `SaltedHash` applied three times with salts `s`, `ss`, `sss`.
///
/// ```text
/// out[16*i..16*i+16] = MD5(input ‖ SHA1((salt+i) × (i+1) ‖ input ‖ cr ‖ sr))
/// ```
pub fn hash48(input: &[u8; 48], client_random: &[u8], server_random: &[u8], salt: u8) -> [u8; 48] {
    let mut out = [0u8; 48];
    for i in 0..3u8 {
        let pad = vec![salt + i; usize::from(i) + 1];
        let sha = Sha1::new()
            .chain_update(&pad)
            .chain_update(input)
            .chain_update(client_random)
            .chain_update(server_random)
            .finalize();
        let md5 = Md5::new().chain_update(input).chain_update(sha).finalize();
        let at = usize::from(i) * 16;
        out[at..at + 16].copy_from_slice(&md5);
    }
    out
}

/// `FinalHash(K) = MD5(K ‖ cr ‖ sr)`.
pub fn final_hash(key: &[u8], client_random: &[u8], server_random: &[u8]) -> [u8; 16] {
    Md5::new()
        .chain_update(key)
        .chain_update(client_random)
        .chain_update(server_random)
        .finalize()
        .into()
}

/// Overwrite the leading bytes so only 40 or 56 bits stay effective.
pub fn reduce_key(key: &mut [u8], method: EncryptionMethod) {
    if method == EncryptionMethod::BIT_40 {
        key[0] = 0xD1;
        key[1] = 0x26;
        key[2] = 0x9E;
    } else if method == EncryptionMethod::BIT_56 {
        key[0] = 0xD1;
    }
}

/// The sign / encrypt / decrypt triple of a session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub sign: [u8; 16],
    pub encrypt: [u8; 16],
    pub decrypt: [u8; 16],
}

impl SessionKeys {
    /// Derive server-side keys from the two randoms.
    ///
    /// The server encrypts with the client's decrypt key and vice versa.
    pub fn derive(client_random: &[u8; 32], server_random: &[u8; 32], method: EncryptionMethod) -> Self {
        let mut pre_master = [0u8; 48];
        pre_master[..24].copy_from_slice(&client_random[..24]);
        pre_master[24..].copy_from_slice(&server_random[..24]);
        let mut master = hash48(&pre_master, client_random, server_random, b'A');
        let mut blob = hash48(&master, client_random, server_random, b'X');

        let mut keys = SessionKeys {
            sign: [0; 16],
            encrypt: final_hash(&blob[16..32], client_random, server_random),
            decrypt: final_hash(&blob[32..48], client_random, server_random),
        };
        keys.sign.copy_from_slice(&blob[..16]);

        reduce_key(&mut keys.sign, method);
        reduce_key(&mut keys.encrypt, method);
        reduce_key(&mut keys.decrypt, method);

        pre_master.zeroize();
        master.zeroize();
        blob.zeroize();
        keys
    }
}

// ── RC4 with key update ──────────────────────────────────────────

enum Rc4State {
    Short(Rc4<U8>),
    Long(Rc4<U16>),
}

impl Rc4State {
    fn new(key: &[u8]) -> Self {
        if key.len() == 16 {
            Rc4State::Long(Rc4::new(Key::<U16>::from_slice(key)))
        } else {
            Rc4State::Short(Rc4::new(Key::<U8>::from_slice(&key[..8])))
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Rc4State::Short(c) => c.apply_keystream(data),
            Rc4State::Long(c) => c.apply_keystream(data),
        }
    }
}

/// One direction of an RC4 session.
///
/// Every [`apply`](Rc4Stream::apply) counts as one operation; when the
/// count reaches [`KEY_UPDATE_INTERVAL`] the key is updated before the
/// operation proceeds.
pub struct Rc4Stream {
    initial: [u8; 16],
    current: [u8; 16],
    key_len: usize,
    method: EncryptionMethod,
    cipher: Rc4State,
    use_count: u32,
}

impl Rc4Stream {
    pub fn new(key: &[u8; 16], method: EncryptionMethod) -> Self {
        let key_len = method.rc4_key_len();
        Self {
            initial: *key,
            current: *key,
            key_len,
            method,
            cipher: Rc4State::new(&key[..key_len]),
            use_count: 0,
        }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        if self.use_count == KEY_UPDATE_INTERVAL {
            self.update();
            self.use_count = 0;
        }
        self.cipher.apply(data);
        self.use_count += 1;
    }

    /// Key currently feeding the cipher.
    pub fn current_key(&self) -> &[u8] {
        &self.current[..self.key_len]
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// MS-RDPBCGR 5.3.7.1: one-way update seeded by the initial key.
    fn update(&mut self) {
        let len = self.key_len;
        let sha = Sha1::new()
            .chain_update(&self.initial[..len])
            .chain_update(PAD_54)
            .chain_update(&self.current[..len])
            .finalize();
        let mut temp: [u8; 16] = Md5::new()
            .chain_update(&self.initial[..len])
            .chain_update(PAD_92)
            .chain_update(sha)
            .finalize()
            .into();

        let mut scrambler = Rc4State::new(&temp[..len]);
        scrambler.apply(&mut temp[..len]);
        reduce_key(&mut temp[..len], self.method);

        self.current[..len].copy_from_slice(&temp[..len]);
        temp.zeroize();
        self.cipher = Rc4State::new(&self.current[..len]);
    }
}

impl Drop for Rc4Stream {
    fn drop(&mut self) {
        self.initial.zeroize();
        self.current.zeroize();
    }
}

// ── Signatures ───────────────────────────────────────────────────

/// MS-RDPBCGR 5.3.6.1 MAC over `data`, truncated to 8 bytes.
pub fn mac_signature(sign_key: &[u8], data: &[u8]) -> [u8; 8] {
    let sha = Sha1::new()
        .chain_update(sign_key)
        .chain_update(PAD_54)
        .chain_update((data.len() as u32).to_le_bytes())
        .chain_update(data)
        .finalize();
    let md5 = Md5::new()
        .chain_update(sign_key)
        .chain_update(PAD_92)
        .chain_update(sha)
        .finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&md5[..8]);
    out
}

// ── RdpCipher ────────────────────────────────────────────────────

/// RC4 state for both directions plus the MAC key.
pub struct RdpCipher {
    method: EncryptionMethod,
    sign_key: [u8; 16],
    encrypt: Rc4Stream,
    decrypt: Rc4Stream,
}

impl RdpCipher {
    pub fn new(keys: &SessionKeys, method: EncryptionMethod) -> Self {
        Self {
            method,
            sign_key: keys.sign,
            encrypt: Rc4Stream::new(&keys.encrypt, method),
            decrypt: Rc4Stream::new(&keys.decrypt, method),
        }
    }

    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    /// Sign then encrypt in place, returning the signature.
    pub fn encrypt(&mut self, data: &mut [u8]) -> [u8; 8] {
        let sig = mac_signature(&self.sign_key[..self.method.rc4_key_len()], data);
        self.encrypt.apply(data);
        sig
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.decrypt.apply(data);
    }

    pub fn encrypt_stream(&self) -> &Rc4Stream {
        &self.encrypt
    }
}

impl Drop for RdpCipher {
    fn drop(&mut self) {
        self.sign_key.zeroize();
    }
}

// ── RSA ──────────────────────────────────────────────────────────

/// Recover the 32-byte client random from `SEC_EXCHANGE_PKT` ciphertext.
///
/// Integers are little-endian on the wire.
pub fn decrypt_client_random(keys: &ServerKeys, ciphertext: &[u8]) -> Result<[u8; 32]> {
    if ciphertext.len() != keys.modulus.len() {
        return Err(RdpError::CryptoFailure("client random size does not match server key"));
    }
    let n = BigUint::from_bytes_le(&keys.modulus);
    let d = BigUint::from_bytes_le(&keys.private_exponent);
    let c = BigUint::from_bytes_le(ciphertext);
    if c >= n {
        return Err(RdpError::CryptoFailure("client random exceeds modulus"));
    }
    let mut plain = c.modpow(&d, &n).to_bytes_le();
    if plain.len() > CLIENT_RANDOM_LEN {
        plain.zeroize();
        return Err(RdpError::CryptoFailure("decrypted client random too long"));
    }
    let mut out = [0u8; 32];
    out[..plain.len()].copy_from_slice(&plain);
    plain.zeroize();
    Ok(out)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn randoms() -> ([u8; 32], [u8; 32]) {
        let mut cr = [0u8; 32];
        let mut sr = [0u8; 32];
        for i in 0..32 {
            cr[i] = i as u8;
            sr[i] = 0xFF - i as u8;
        }
        (cr, sr)
    }

    #[test]
    fn forty_bit_keys_are_salted_not_truncated() {
        let (cr, sr) = randoms();
        let k40 = SessionKeys::derive(&cr, &sr, EncryptionMethod::BIT_40);
        let k128 = SessionKeys::derive(&cr, &sr, EncryptionMethod::BIT_128);
        assert_eq!(&k40.encrypt[..3], &[0xD1, 0x26, 0x9E]);
        assert_eq!(&k40.encrypt[3..8], &k128.encrypt[3..8]);
        assert_eq!(&k40.sign[..3], &[0xD1, 0x26, 0x9E]);

        let k56 = SessionKeys::derive(&cr, &sr, EncryptionMethod::BIT_56);
        assert_eq!(k56.decrypt[0], 0xD1);
        assert_eq!(&k56.decrypt[1..8], &k128.decrypt[1..8]);
    }

    // Known answers for the randoms above, computed independently from
    // the MS-RDPBCGR 5.3.5.1 / 5.3.6.1 / 5.3.7.1 formulas.
    const SIGN_128: [u8; 16] = [
        0x98, 0x74, 0x3C, 0x51, 0x8D, 0xE6, 0x89, 0xF3, 0x32, 0x04, 0x35, 0x73, 0x32, 0xAF, 0x6C, 0x45,
    ];
    const ENCRYPT_128: [u8; 16] = [
        0xDF, 0x0D, 0xF1, 0x37, 0xE9, 0x22, 0xFD, 0x12, 0x5A, 0xF4, 0xFB, 0x99, 0x8F, 0xB3, 0xC7, 0xAA,
    ];
    const DECRYPT_128: [u8; 16] = [
        0xDC, 0x02, 0xA7, 0x32, 0xB9, 0x01, 0xD8, 0x57, 0x76, 0x82, 0x66, 0xDC, 0x1C, 0xD3, 0x44, 0x92,
    ];

    #[test]
    fn session_keys_known_answer() {
        let (cr, sr) = randoms();
        let k = SessionKeys::derive(&cr, &sr, EncryptionMethod::BIT_128);
        assert_eq!(k.sign, SIGN_128);
        assert_eq!(k.encrypt, ENCRYPT_128);
        assert_eq!(k.decrypt, DECRYPT_128);

        let k40 = SessionKeys::derive(&cr, &sr, EncryptionMethod::BIT_40);
        assert_eq!(&k40.encrypt[..8], &[0xD1, 0x26, 0x9E, 0x37, 0xE9, 0x22, 0xFD, 0x12]);
        assert_eq!(&k40.sign[..8], &[0xD1, 0x26, 0x9E, 0x51, 0x8D, 0xE6, 0x89, 0xF3]);
    }

    #[test]
    fn mac_and_keystream_known_answer() {
        assert_eq!(
            mac_signature(&SIGN_128, b"share data pdu"),
            [0x95, 0x1D, 0x31, 0x99, 0x8C, 0x62, 0x0D, 0xA2]
        );
        let mut stream = Rc4Stream::new(&ENCRYPT_128, EncryptionMethod::BIT_128);
        let mut zeros = [0u8; 8];
        stream.apply(&mut zeros);
        assert_eq!(zeros, [0xFE, 0x34, 0x85, 0xFB, 0xC5, 0x8D, 0xB7, 0x0D]);
    }

    #[test]
    fn key_update_known_answer() {
        let mut stream = Rc4Stream::new(&[0x42; 16], EncryptionMethod::BIT_128);
        let mut buf = [0u8; 1];
        for _ in 0..=KEY_UPDATE_INTERVAL {
            stream.apply(&mut buf);
        }
        assert_eq!(
            stream.current_key(),
            &[
                0xEB, 0x6F, 0xC9, 0x12, 0xF4, 0x25, 0x09, 0xF6, 0x8E, 0x65, 0xE2, 0xED, 0x89, 0x0C, 0xFF, 0x4C
            ]
        );

        let mut key = [0x17u8; 16];
        reduce_key(&mut key, EncryptionMethod::BIT_40);
        let mut stream = Rc4Stream::new(&key, EncryptionMethod::BIT_40);
        for _ in 0..=KEY_UPDATE_INTERVAL {
            stream.apply(&mut buf);
        }
        assert_eq!(stream.current_key(), &[0xD1, 0x26, 0x9E, 0x82, 0x16, 0x1D, 0x10, 0xD4]);
    }

    #[test]
    fn directions_use_distinct_keys() {
        let (cr, sr) = randoms();
        let k = SessionKeys::derive(&cr, &sr, EncryptionMethod::BIT_128);
        assert_ne!(k.encrypt, k.decrypt);
        assert_ne!(k.sign, k.encrypt);
    }

    #[test]
    fn key_updates_after_4096_operations() {
        let key = [0x42u8; 16];
        let mut stream = Rc4Stream::new(&key, EncryptionMethod::BIT_128);
        let mut buf = [0u8; 4];
        for _ in 0..KEY_UPDATE_INTERVAL {
            stream.apply(&mut buf);
            assert_eq!(stream.current_key(), &key[..]);
        }
        // Operation 4096 (zero-based 4095) ran with the original key.
        assert_eq!(stream.use_count(), KEY_UPDATE_INTERVAL);
        stream.apply(&mut buf);
        assert_ne!(stream.current_key(), &key[..]);
        assert_eq!(stream.use_count(), 1);
    }

    #[test]
    fn updated_forty_bit_key_stays_salted() {
        let mut key = [0x17u8; 16];
        reduce_key(&mut key, EncryptionMethod::BIT_40);
        let mut stream = Rc4Stream::new(&key, EncryptionMethod::BIT_40);
        let mut buf = [0u8; 1];
        for _ in 0..=KEY_UPDATE_INTERVAL {
            stream.apply(&mut buf);
        }
        assert_eq!(stream.current_key().len(), 8);
        assert_eq!(&stream.current_key()[..3], &[0xD1, 0x26, 0x9E]);
    }

    #[test]
    fn encrypt_then_decrypt_with_mirrored_keys() {
        let (cr, sr) = randoms();
        let server = SessionKeys::derive(&cr, &sr, EncryptionMethod::BIT_128);
        let mirrored = SessionKeys {
            sign: server.sign,
            encrypt: server.decrypt,
            decrypt: server.encrypt,
        };
        let mut tx = RdpCipher::new(&server, EncryptionMethod::BIT_128);
        let mut rx = RdpCipher::new(&mirrored, EncryptionMethod::BIT_128);
        let mut data = b"share data pdu".to_vec();
        let sig = tx.encrypt(&mut data);
        assert_ne!(&data[..], b"share data pdu");
        rx.decrypt(&mut data);
        assert_eq!(&data[..], b"share data pdu");
        assert_eq!(sig, mac_signature(&server.sign, b"share data pdu"));
    }

    #[test]
    fn rsa_client_random_roundtrip() {
        let keys = ServerKeys::insecure_development_key();
        let (cr, _) = randoms();
        let n = BigUint::from_bytes_le(&keys.modulus);
        let e = BigUint::from_bytes_le(&keys.public_exponent);
        let mut ct = BigUint::from_bytes_le(&cr).modpow(&e, &n).to_bytes_le();
        ct.resize(64, 0);
        assert_eq!(decrypt_client_random(&keys, &ct).unwrap(), cr);
    }

    #[test]
    fn rsa_rejects_wrong_size_and_oversized_values() {
        let keys = ServerKeys::insecure_development_key();
        assert!(decrypt_client_random(&keys, &[0u8; 32]).is_err());
        assert!(decrypt_client_random(&keys, &[0xFFu8; 64]).is_err());
    }
}
