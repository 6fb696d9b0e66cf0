//! Standard RDP security primitives built on the RustCrypto crates.
//!
//! Key derivation, MAC signing, RC4 stream state with periodic key
//! rotation, and RSA encryption of the client random.

use md5::{Digest, Md5};
use num_bigint::BigUint;
use rc4::consts::{U8, U16};
use rc4::{KeyInit, Rc4, StreamCipher};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use sha1::Sha1;
use x509_cert::Certificate;
use x509_cert::der::Decode;

use crate::error::{RdpError, Result};

pub const RANDOM_SIZE: usize = 32;
pub const SIGNATURE_LEN: usize = 8;
pub const PADDING_SIZE: usize = 8;

/// Cipher operations between key rotations.
pub const KEY_ROTATION_INTERVAL: u32 = 4096;

const PAD_54: [u8; 40] = [0x36; 40];
const PAD_92: [u8; 48] = [0x5C; 48];

// ── Hash helpers ─────────────────────────────────────────────────

/// Three salted SHA1-then-MD5 rounds, salts `salt`, `salt+1`, `salt+2`
/// repeated once, twice and three times.
pub fn hash48(input: &[u8; 48], salt1: &[u8], salt2: &[u8], salt: u8) -> [u8; 48] {
    let mut out = [0u8; 48];
    for i in 0..3 {
        let pad = vec![salt + i as u8; i + 1];
        let sha = Sha1::new()
            .chain_update(&pad)
            .chain_update(input)
            .chain_update(salt1)
            .chain_update(salt2)
            .finalize();
        let md5 = Md5::new().chain_update(input).chain_update(sha).finalize();
        out[i * 16..(i + 1) * 16].copy_from_slice(&md5);
    }
    out
}

pub fn hash16(input: &[u8], salt1: &[u8], salt2: &[u8]) -> [u8; 16] {
    let digest = Md5::new()
        .chain_update(&input[..16])
        .chain_update(salt1)
        .chain_update(salt2)
        .finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// Weaken a key to 40 bits of entropy.
pub fn make_40bit(key: &mut [u8]) {
    key[0] = 0xD1;
    key[1] = 0x26;
    key[2] = 0x9E;
}

/// MAC over `data`, truncated to `out_len` bytes.
pub fn sign(key: &[u8], data: &[u8], out_len: usize) -> Vec<u8> {
    let sha = Sha1::new()
        .chain_update(key)
        .chain_update(PAD_54)
        .chain_update((data.len() as u32).to_le_bytes())
        .chain_update(data)
        .finalize();
    let md5 = Md5::new()
        .chain_update(key)
        .chain_update(PAD_92)
        .chain_update(sha)
        .finalize();
    md5[..out_len.min(16)].to_vec()
}

// ── RC4 ──────────────────────────────────────────────────────────

/// RC4 keyed with either a 40-bit (8 byte) or 128-bit (16 byte) key.
pub enum Rc4Stream {
    Short(Rc4<U8>),
    Long(Rc4<U16>),
}

impl Rc4Stream {
    pub fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| RdpError::crypto(format!("invalid RC4 key length {}", key.len()));
        match key.len() {
            8 => Ok(Rc4Stream::Short(Rc4::new_from_slice(key).map_err(invalid)?)),
            16 => Ok(Rc4Stream::Long(Rc4::new_from_slice(key).map_err(invalid)?)),
            n => Err(RdpError::crypto(format!("invalid RC4 key length {n}"))),
        }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Rc4Stream::Short(c) => c.apply_keystream(data),
            Rc4Stream::Long(c) => c.apply_keystream(data),
        }
    }
}

/// One-shot RC4 over `data`.
pub fn rc4_once(key: &[u8], data: &mut [u8]) -> Result<()> {
    Rc4Stream::new(key)?.apply(data);
    Ok(())
}

// ── Per-direction key state ──────────────────────────────────────

/// RC4 state for one direction, rotating its key every 4096 uses.
pub struct CipherState {
    key: Vec<u8>,
    update_key: Vec<u8>,
    rc4: Rc4Stream,
    use_count: u32,
}

impl CipherState {
    pub fn new(key: Vec<u8>) -> Result<Self> {
        let rc4 = Rc4Stream::new(&key)?;
        Ok(Self {
            update_key: key.clone(),
            key,
            rc4,
            use_count: 0,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Encrypt or decrypt in place, rotating first when due.
    pub fn apply(&mut self, data: &mut [u8]) -> Result<()> {
        if self.use_count == KEY_ROTATION_INTERVAL {
            self.key = update_key(&self.key, &self.update_key)?;
            self.rc4 = Rc4Stream::new(&self.key)?;
            self.use_count = 0;
            tracing::debug!("session key rotated");
        }
        self.rc4.apply(data);
        self.use_count += 1;
        Ok(())
    }
}

/// Next key in the rotation chain from the current and original keys.
pub fn update_key(key: &[u8], original: &[u8]) -> Result<Vec<u8>> {
    let len = key.len();
    let sha = Sha1::new()
        .chain_update(&original[..len])
        .chain_update(PAD_54)
        .chain_update(key)
        .finalize();
    let md5 = Md5::new()
        .chain_update(&original[..len])
        .chain_update(PAD_92)
        .chain_update(sha)
        .finalize();
    let mut next = md5[..len].to_vec();
    let stream_key = next.clone();
    rc4_once(&stream_key, &mut next)?;
    if len == 8 {
        make_40bit(&mut next);
    }
    Ok(next)
}

/// Keys for one direction of traffic.
pub struct DirectionKeys {
    pub sign_key: Vec<u8>,
    pub cipher: CipherState,
}

impl DirectionKeys {
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        sign(&self.sign_key, data, SIGNATURE_LEN)
    }
}

/// All session keys, split into an encrypting and a decrypting half.
pub struct SessionKeys {
    pub encrypt: DirectionKeys,
    pub decrypt: DirectionKeys,
}

impl SessionKeys {
    /// Derive keys from both randoms. `rc4_key_size` 1 selects 40-bit keys.
    pub fn generate(client_random: &[u8], server_random: &[u8], rc4_key_size: u32) -> Result<Self> {
        let mut pre_master = [0u8; 48];
        pre_master[..24].copy_from_slice(&client_random[..24]);
        pre_master[24..].copy_from_slice(&server_random[..24]);

        let master = hash48(&pre_master, client_random, server_random, b'A');
        let key_block = hash48(&master, client_random, server_random, b'X');

        let mut sign_key = key_block[..16].to_vec();
        let mut decrypt_key = hash16(&key_block[16..32], client_random, server_random).to_vec();
        let mut encrypt_key = hash16(&key_block[32..48], client_random, server_random).to_vec();

        if rc4_key_size == 1 {
            for key in [&mut sign_key, &mut decrypt_key, &mut encrypt_key] {
                make_40bit(key);
                key.truncate(8);
            }
        }

        Ok(Self {
            encrypt: DirectionKeys {
                sign_key: sign_key.clone(),
                cipher: CipherState::new(encrypt_key)?,
            },
            decrypt: DirectionKeys {
                sign_key,
                cipher: CipherState::new(decrypt_key)?,
            },
        })
    }
}

// ── RSA ──────────────────────────────────────────────────────────

/// Server RSA public key, both parts little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPublicKey {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

impl ServerPublicKey {
    /// Public key from an X.509 server certificate.
    pub fn from_x509(der: &[u8]) -> Result<Self> {
        let cert = Certificate::from_der(der)
            .map_err(|e| RdpError::crypto(format!("bad server certificate: {e}")))?;
        let spki = &cert.tbs_certificate.subject_public_key_info;
        let key = rsa::RsaPublicKey::from_pkcs1_der(spki.subject_public_key.raw_bytes())
            .map_err(|e| RdpError::crypto(format!("bad certificate public key: {e}")))?;
        Ok(Self {
            modulus: key.n().to_bytes_le(),
            exponent: key.e().to_bytes_le(),
        })
    }

    /// `data` (little-endian) raised to the exponent, padded to the modulus size.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let n = BigUint::from_bytes_le(&self.modulus);
        let e = BigUint::from_bytes_le(&self.exponent);
        let m = BigUint::from_bytes_le(data);
        let mut out = m.modpow(&e, &n).to_bytes_le();
        out.resize(self.modulus.len(), 0);
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(size: u32) -> SessionKeys {
        SessionKeys::generate(&[1u8; 32], &[2u8; 32], size).unwrap()
    }

    #[test]
    fn forty_bit_keys_are_salted_and_short() {
        let k = keys(1);
        assert_eq!(k.encrypt.cipher.key().len(), 8);
        assert_eq!(&k.encrypt.cipher.key()[..3], &[0xD1, 0x26, 0x9E]);
        assert_eq!(k.encrypt.sign_key.len(), 8);
    }

    #[test]
    fn directions_use_different_keys() {
        let k = keys(2);
        assert_eq!(k.encrypt.cipher.key().len(), 16);
        assert_ne!(k.encrypt.cipher.key(), k.decrypt.cipher.key());
        assert_eq!(k.encrypt.sign_key, k.decrypt.sign_key);
    }

    #[test]
    fn rc4_round_trip_across_states() {
        let k1 = keys(2);
        let k2 = keys(2);
        let mut enc = k1.encrypt.cipher;
        let mut dec = CipherState::new(k2.encrypt.cipher.key().to_vec()).unwrap();
        let mut data = *b"hello world";
        enc.apply(&mut data).unwrap();
        assert_ne!(&data, b"hello world");
        dec.apply(&mut data).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn key_rotates_before_the_4097th_use() {
        let initial = keys(2).encrypt.cipher.key().to_vec();
        let mut state = CipherState::new(initial.clone()).unwrap();
        let mut oracle = Rc4Stream::new(&initial).unwrap();

        for _ in 0..KEY_ROTATION_INTERVAL {
            let mut a = [0u8; 4];
            let mut b = [0u8; 4];
            state.apply(&mut a).unwrap();
            oracle.apply(&mut b);
            assert_eq!(a, b);
        }
        assert_eq!(state.key(), &initial[..]);
        assert_eq!(state.use_count(), KEY_ROTATION_INTERVAL);

        let rotated = update_key(&initial, &initial).unwrap();
        let mut expected = [0u8; 4];
        Rc4Stream::new(&rotated).unwrap().apply(&mut expected);

        let mut actual = [0u8; 4];
        state.apply(&mut actual).unwrap();
        assert_eq!(actual, expected);
        assert_eq!(state.key(), &rotated[..]);
        assert_eq!(state.use_count(), 1);
    }

    #[test]
    fn forty_bit_rotation_keeps_salt() {
        let k = keys(1);
        let next = update_key(k.encrypt.cipher.key(), k.encrypt.cipher.key()).unwrap();
        assert_eq!(next.len(), 8);
        assert_eq!(&next[..3], &[0xD1, 0x26, 0x9E]);
    }

    #[test]
    fn signature_depends_on_length_and_data() {
        let a = sign(&[7u8; 16], b"abc", 8);
        let b = sign(&[7u8; 16], b"abd", 8);
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert_eq!(sign(&[7u8; 16], b"abc", 16)[..8], a[..]);
    }

    #[test]
    fn rsa_textbook_encrypt() {
        // n = 3233 (61 * 53), e = 17: 65^17 mod 3233 = 2790.
        let key = ServerPublicKey {
            modulus: 3233u32.to_le_bytes()[..2].to_vec(),
            exponent: vec![17],
        };
        let out = key.encrypt(&[65]);
        assert_eq!(out, 2790u16.to_le_bytes().to_vec());
    }
}
