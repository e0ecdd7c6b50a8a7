//! FIPS 140-1 mode: 3DES-CBC encryption and HMAC-SHA1 signatures
//! (MS-RDPBCGR 5.3.5.2, 5.3.6.2).

use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use zeroize::Zeroize;

use crate::error::{RdpError, Result};

pub const FIPS_IV: [u8; 8] = [0x12, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF];
pub const FIPS_BLOCK: usize = 8;
/// `TS_SECURITY_HEADER2` length field.
pub const FIPS_HEADER_LEN: u16 = 0x10;
pub const FIPS_VERSION: u8 = 1;

/// Padding to a whole number of DES blocks.
pub fn pad_len(len: usize) -> usize {
    (FIPS_BLOCK - len % FIPS_BLOCK) % FIPS_BLOCK
}

/// Turn 21 bytes of SHA1 output into a 24-byte 3DES key.
///
/// Bits are taken least-significant first, a zero bit is inserted after
/// every seven, and each byte is then given odd parity in its low bit.
pub fn expand_key_bits(input: &[u8; 21]) -> [u8; 24] {
    let mut buf = [0u8; 21];
    for (b, i) in buf.iter_mut().zip(input) {
        *b = i.reverse_bits();
    }

    let mut out = [0u8; 24];
    for (i, o) in out.iter_mut().enumerate() {
        let bit = i * 7;
        let (p, r) = (bit / 8, bit % 8);
        let c = if r <= 1 {
            buf[p] << r
        } else {
            (buf[p] << r) | (buf[p + 1] >> (8 - r))
        };
        *o = odd_parity((c & 0xFE).reverse_bits());
    }
    buf.zeroize();
    out
}

fn odd_parity(c: u8) -> u8 {
    let c = c & 0xFE;
    if c.count_ones() % 2 == 0 { c | 1 } else { c }
}

type HmacSha1 = Hmac<Sha1>;

/// 3DES state for both directions plus the HMAC key.
///
/// CBC chaining continues across PDUs, so each direction keeps one
/// cipher instance for the lifetime of the connection.
pub struct FipsCipher {
    encrypt: cbc::Encryptor<TdesEde3>,
    decrypt: cbc::Decryptor<TdesEde3>,
    sign_key: [u8; 20],
    encrypt_count: u32,
}

impl FipsCipher {
    /// Derive server-side keys from the client and server randoms.
    pub fn derive(client_random: &[u8; 32], server_random: &[u8; 32]) -> Result<Self> {
        let mut decrypt_t = [0u8; 21];
        let mut encrypt_t = [0u8; 21];
        decrypt_t[..20].copy_from_slice(
            &Sha1::new()
                .chain_update(&client_random[16..])
                .chain_update(&server_random[16..])
                .finalize(),
        );
        encrypt_t[..20].copy_from_slice(
            &Sha1::new()
                .chain_update(&client_random[..16])
                .chain_update(&server_random[..16])
                .finalize(),
        );
        let mut sign_key = [0u8; 20];
        sign_key.copy_from_slice(
            &Sha1::new()
                .chain_update(&encrypt_t[..20])
                .chain_update(&decrypt_t[..20])
                .finalize(),
        );
        decrypt_t[20] = decrypt_t[0];
        encrypt_t[20] = encrypt_t[0];

        let mut decrypt_key = expand_key_bits(&decrypt_t);
        let mut encrypt_key = expand_key_bits(&encrypt_t);
        decrypt_t.zeroize();
        encrypt_t.zeroize();

        let encrypt = cbc::Encryptor::<TdesEde3>::new_from_slices(&encrypt_key, &FIPS_IV)
            .map_err(|_| RdpError::CryptoFailure("3DES encrypt key setup"))?;
        let decrypt = cbc::Decryptor::<TdesEde3>::new_from_slices(&decrypt_key, &FIPS_IV)
            .map_err(|_| RdpError::CryptoFailure("3DES decrypt key setup"))?;
        decrypt_key.zeroize();
        encrypt_key.zeroize();

        Ok(Self {
            encrypt,
            decrypt,
            sign_key,
            encrypt_count: 0,
        })
    }

    /// HMAC-SHA1 over the plaintext and the encryption count.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; 8]> {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RdpError::CryptoFailure("HMAC key setup"))?;
        mac.update(data);
        mac.update(&self.encrypt_count.to_le_bytes());
        let full = mac.finalize().into_bytes();
        let mut out = [0u8; 8];
        out.copy_from_slice(&full[..8]);
        Ok(out)
    }

    /// Encrypt a block-aligned buffer in place.
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() % FIPS_BLOCK != 0 {
            return Err(RdpError::CryptoFailure("FIPS plaintext is not block aligned"));
        }
        for block in data.chunks_exact_mut(FIPS_BLOCK) {
            self.encrypt
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.encrypt_count = self.encrypt_count.wrapping_add(1);
        Ok(())
    }

    /// Decrypt a block-aligned buffer in place.
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() % FIPS_BLOCK != 0 {
            return Err(RdpError::invalid("FIPS ciphertext length", data.len() as u64));
        }
        for block in data.chunks_exact_mut(FIPS_BLOCK) {
            self.decrypt
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

impl Drop for FipsCipher {
    fn drop(&mut self) {
        self.sign_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expanded_key_has_odd_parity() {
        let mut input = [0u8; 21];
        for (i, b) in input.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        let key = expand_key_bits(&input);
        assert!(key.iter().all(|b| b.count_ones() % 2 == 1));
    }

    #[test]
    fn zero_input_expands_to_parity_bits_only() {
        assert_eq!(expand_key_bits(&[0u8; 21]), [0x01u8; 24]);
    }

    #[test]
    fn first_group_is_the_low_seven_bits_reversed_into_place() {
        // The set bit comes back to bit 1 of out[0]; one set bit is
        // already odd parity, so the low bit stays clear.
        let mut input = [0u8; 21];
        input[0] = 0b0000_0010;
        let key = expand_key_bits(&input);
        assert_eq!(key[0], 0b0000_0010);
        assert_eq!(&key[1..], &[0x01u8; 23]);
    }

    #[test]
    fn padding() {
        assert_eq!(pad_len(0), 0);
        assert_eq!(pad_len(1), 7);
        assert_eq!(pad_len(8), 0);
        assert_eq!(pad_len(13), 3);
    }

    #[test]
    fn chained_encrypt_decrypt_across_pdus() {
        let cr = [0x11u8; 32];
        let sr = [0x22u8; 32];
        let mut server = FipsCipher::derive(&cr, &sr).unwrap();

        // A peer with the directions swapped decrypts what the server sends.
        let mut peer_decrypt_t = [0u8; 21];
        peer_decrypt_t[..20].copy_from_slice(
            &Sha1::new()
                .chain_update(&cr[..16])
                .chain_update(&sr[..16])
                .finalize(),
        );
        peer_decrypt_t[20] = peer_decrypt_t[0];
        let key = expand_key_bits(&peer_decrypt_t);
        let mut peer = cbc::Decryptor::<TdesEde3>::new_from_slices(&key, &FIPS_IV).unwrap();

        for msg in [[7u8; 16], [9u8; 16]] {
            let mut data = msg;
            server.encrypt(&mut data).unwrap();
            assert_ne!(data, msg);
            for block in data.chunks_exact_mut(8) {
                peer.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            assert_eq!(data, msg);
        }
    }

    #[test]
    fn unaligned_data_is_rejected() {
        let mut c = FipsCipher::derive(&[0; 32], &[1; 32]).unwrap();
        assert!(c.encrypt(&mut [0u8; 5]).is_err());
        assert!(c.decrypt(&mut [0u8; 9]).is_err());
    }

    #[test]
    fn signature_depends_on_count() {
        let mut c = FipsCipher::derive(&[3; 32], &[4; 32]).unwrap();
        let first = c.sign(b"payload").unwrap();
        c.encrypt(&mut [0u8; 8]).unwrap();
        let second = c.sign(b"payload").unwrap();
        assert_ne!(first, second);
    }
}
