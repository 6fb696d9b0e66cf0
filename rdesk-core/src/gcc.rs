//! T.124 conference-create user data carried inside MCS connect PDUs.
//!
//! The client sends its core, cluster, security and network blocks; the
//! server answers with its RDP version, security parameters and the MCS
//! ids it gave each requested channel.

use tracing::{debug, warn};

use crate::channel::ChannelDef;
use crate::config::SessionConfig;
use crate::error::{RdpError, Result};
use crate::secure::crypto::{PADDING_SIZE, RANDOM_SIZE, ServerPublicKey};
use crate::stream::PacketBuffer;

// ── Block tags ───────────────────────────────────────────────────

pub const CS_CORE: u16 = 0xC001;
pub const CS_SECURITY: u16 = 0xC002;
pub const CS_NET: u16 = 0xC003;
pub const CS_CLUSTER: u16 = 0xC004;

pub const SC_CORE: u16 = 0x0C01;
pub const SC_SECURITY: u16 = 0x0C02;
pub const SC_NET: u16 = 0x0C03;

const CORE_BLOCK_LEN: usize = 212;
const RSA_MAGIC: u32 = 0x3141_5352; // "RSA1"
const PROPRIETARY_PUBKEY: u16 = 0x0006;
const PROPRIETARY_KEYSIG: u16 = 0x0008;
const EXPONENT_SIZE: usize = 4;
const MAX_MODULUS_SIZE: usize = 256;

/// Client build number reported in the core block.
const CLIENT_BUILD: u32 = 2600;
const KEYBOARD_TYPE: u32 = 4;
const KEYBOARD_FUNCTION_KEYS: u32 = 12;

// ── Client data ──────────────────────────────────────────────────

/// Build the conference-create request for the MCS connect-initial.
pub fn client_data(config: &SessionConfig, width: u16, channels: &[ChannelDef]) -> Result<Vec<u8>> {
    let mut length = 158 + 76 + 12 + 4;
    if !channels.is_empty() {
        length += channels.len() * 12 + 8;
    }
    let mut s = PacketBuffer::with_capacity(length + 9);

    // ConferenceCreateRequest header.
    s.write_u16_be(5)?;
    s.write_u16_be(0x14)?;
    s.write_u8(0x7C)?;
    s.write_u16_be(1)?;
    s.write_u16_be(length as u16 | 0x8000)?;

    s.write_u16_be(8)?;
    s.write_u16_be(16)?;
    s.write_u8(0)?;
    s.write_u16_le(0xC001)?;
    s.write_u8(0)?;
    s.write_bytes(b"Duca")?;
    s.write_u16_be((length - 14) as u16 | 0x8000)?;

    // Core data.
    s.write_u16_le(CS_CORE)?;
    s.write_u16_le(CORE_BLOCK_LEN as u16)?;
    s.write_u16_le(if config.features.rdp5 { 4 } else { 1 })?;
    s.write_u16_le(8)?;
    s.write_u16_le(width)?;
    s.write_u16_le(config.display.height)?;
    s.write_u16_le(0xCA01)?;
    s.write_u16_le(0xAA03)?;
    s.write_u32_le(config.security.keyboard_layout)?;
    s.write_u32_le(CLIENT_BUILD)?;
    s.write_unicode(&config.login.client_hostname, 30)?;
    s.write_u32_le(KEYBOARD_TYPE)?;
    s.write_u32_le(0)?; // subtype
    s.write_u32_le(KEYBOARD_FUNCTION_KEYS)?;
    s.write_zeros(64)?; // IME file name
    s.write_u16_le(0xCA01)?;
    s.write_u16_le(1)?;
    s.write_u32_le(0)?;
    s.write_u8(config.display.depth.bits() as u8)?;
    s.write_u16_le(0x0700)?;
    s.write_u8(0)?;
    s.write_u32_le(1)?;
    s.write_zeros(64)?;

    // Cluster data.
    s.write_u16_le(CS_CLUSTER)?;
    s.write_u16_le(12)?;
    s.write_u32_le(if config.security.console { 0x0B } else { 0x09 })?;
    s.write_u32_le(0)?;

    // Security data: 40 and 128 bit methods.
    s.write_u16_le(CS_SECURITY)?;
    s.write_u16_le(12)?;
    s.write_u32_le(if config.security.encryption { 0x03 } else { 0 })?;
    s.write_u32_le(0)?;

    if !channels.is_empty() {
        s.write_u16_le(CS_NET)?;
        s.write_u16_le((channels.len() * 12 + 8) as u16)?;
        s.write_u32_le(channels.len() as u32)?;
        for ch in channels {
            let mut name = [0u8; 8];
            let bytes = ch.name.as_bytes();
            let n = bytes.len().min(7);
            name[..n].copy_from_slice(&bytes[..n]);
            s.write_bytes(&name)?;
            s.write_u32_be(ch.options)?;
        }
    }
    s.mark_end();
    Ok(s.into_vec())
}

// ── Server data ──────────────────────────────────────────────────

/// Security parameters the server chose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSecurity {
    /// 1 for 40-bit keys, 2 for 128-bit keys.
    pub rc4_key_size: u32,
    pub crypt_level: u32,
    pub server_random: Vec<u8>,
    pub public_key: ServerPublicKey,
}

/// Everything the client needs from the connect-response user data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerData {
    pub rdp_version: u32,
    /// `None` when the server runs without encryption.
    pub security: Option<ServerSecurity>,
    pub channel_ids: Vec<u16>,
}

/// Parse the conference-create response.
pub fn parse_server_data(s: &mut PacketBuffer) -> Result<ServerData> {
    let mut data = ServerData {
        rdp_version: 4,
        ..ServerData::default()
    };

    s.skip(21)?; // ConferenceCreateResponse header
    let len = s.read_u8()?;
    if len & 0x80 != 0 {
        s.skip(1)?;
    }

    while s.has_remaining() {
        let tag = s.read_u16_le()?;
        let length = s.read_u16_le()? as usize;
        if length <= 4 {
            break;
        }
        let next = s.position() + length - 4;
        let block_end = next.min(s.end());
        let mut block = PacketBuffer::from_vec(s.read_bytes(block_end - s.position())?.to_vec());

        match tag {
            SC_CORE => {
                let version = block.read_u16_le()?;
                data.rdp_version = if version == 1 { 4 } else { 5 };
                debug!(version, "server core data");
            }
            SC_SECURITY => data.security = parse_security(&mut block)?,
            SC_NET => {
                block.skip(2)?; // MCS id of the I/O channel
                let count = block.read_u16_le()?;
                for _ in 0..count {
                    data.channel_ids.push(block.read_u16_le()?);
                }
            }
            other => warn!(tag = other, "unknown server data block"),
        }
        s.set_position(next.min(s.end()))?;
    }
    Ok(data)
}

fn parse_security(s: &mut PacketBuffer) -> Result<Option<ServerSecurity>> {
    let rc4_key_size = s.read_u32_le()?;
    let crypt_level = s.read_u32_le()?;
    if crypt_level == 0 {
        return Ok(None);
    }
    let random_len = s.read_u32_le()? as usize;
    let rsa_info_len = s.read_u32_le()? as usize;
    if random_len != RANDOM_SIZE {
        return Err(RdpError::crypto(format!("server random of {random_len} bytes")));
    }
    let server_random = s.read_vec(random_len)?;
    if rsa_info_len > s.remaining() {
        return Err(RdpError::crypto("server certificate overruns security data"));
    }
    let mut cert = PacketBuffer::from_vec(s.read_vec(rsa_info_len)?);

    let version = cert.read_u32_le()?;
    let public_key = if version & 1 != 0 {
        parse_proprietary_certificate(&mut cert)?
    } else {
        parse_x509_chain(&mut cert)?
    };
    Ok(Some(ServerSecurity {
        rc4_key_size,
        crypt_level,
        server_random,
        public_key,
    }))
}

fn parse_proprietary_certificate(s: &mut PacketBuffer) -> Result<ServerPublicKey> {
    s.skip(8)?; // signature and key algorithm ids
    let mut key = None;
    while s.has_remaining() {
        let tag = s.read_u16_le()?;
        let length = s.read_u16_le()? as usize;
        let next = s.position() + length;
        match tag {
            PROPRIETARY_PUBKEY => key = Some(parse_public_key(s)?),
            // The signature is made with a well-known key; nothing to check.
            PROPRIETARY_KEYSIG => {}
            other => warn!(tag = other, "unknown certificate blob"),
        }
        s.set_position(next.min(s.end()))?;
    }
    key.ok_or_else(|| RdpError::crypto("certificate without a public key"))
}

fn parse_public_key(s: &mut PacketBuffer) -> Result<ServerPublicKey> {
    let magic = s.read_u32_le()?;
    if magic != RSA_MAGIC {
        return Err(RdpError::crypto(format!("bad RSA magic {magic:#010x}")));
    }
    let modulus_len = (s.read_u32_le()? as usize).saturating_sub(PADDING_SIZE);
    if !(64..=MAX_MODULUS_SIZE).contains(&modulus_len) {
        return Err(RdpError::crypto(format!("bad modulus length {modulus_len}")));
    }
    s.skip(8)?; // bit length, data length
    let exponent = s.read_vec(EXPONENT_SIZE)?;
    let modulus = s.read_vec(modulus_len)?;
    s.skip(PADDING_SIZE)?;
    Ok(ServerPublicKey { modulus, exponent })
}

fn parse_x509_chain(s: &mut PacketBuffer) -> Result<ServerPublicKey> {
    let count = s.read_u32_le()?;
    if count < 2 {
        return Err(RdpError::crypto(format!("certificate chain of {count}")));
    }
    // Only the leaf certificate matters.
    for _ in 0..count - 1 {
        let len = s.read_u32_le()? as usize;
        s.skip(len)?;
    }
    let len = s.read_u32_le()? as usize;
    let der = s.read_bytes(len)?;
    ServerPublicKey::from_x509(der)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_data_lengths() {
        let cfg = SessionConfig::default();
        let data = client_data(&cfg, 1024, &[]).unwrap();
        assert_eq!(data.len(), 250 + 9);
        assert_eq!(u16::from_be_bytes([data[7], data[8]]), 250 | 0x8000);
        assert_eq!(u16::from_le_bytes([data[23], data[24]]), CS_CORE);

        let channels = vec![ChannelDef {
            name: "cliprdr".into(),
            options: 0xC0A0_0000,
            id: 1004,
        }];
        let data = client_data(&cfg, 1024, &channels).unwrap();
        assert_eq!(data.len(), 250 + 9 + 20);
        assert_eq!(&data[data.len() - 12..data.len() - 4], b"cliprdr\0");
        assert_eq!(&data[data.len() - 4..], &[0xC0, 0xA0, 0, 0]);
    }

    fn block(tag: u16, body: &[u8]) -> Vec<u8> {
        let mut v = tag.to_le_bytes().to_vec();
        v.extend_from_slice(&((body.len() + 4) as u16).to_le_bytes());
        v.extend_from_slice(body);
        v
    }

    fn response(blocks: &[Vec<u8>]) -> PacketBuffer {
        let mut v = vec![0u8; 21];
        let body: Vec<u8> = blocks.concat();
        v.push(0x81);
        v.push(body.len() as u8);
        v.extend_from_slice(&body);
        PacketBuffer::from_vec(v)
    }

    fn proprietary_security() -> Vec<u8> {
        let mut key = RSA_MAGIC.to_le_bytes().to_vec();
        key.extend_from_slice(&72u32.to_le_bytes());
        key.extend_from_slice(&[0; 8]);
        key.extend_from_slice(&[1, 0, 1, 0]);
        key.extend_from_slice(&[0xAB; 64]);
        key.extend_from_slice(&[0; 8]);

        let mut cert = 1u32.to_le_bytes().to_vec();
        cert.extend_from_slice(&[0; 8]);
        cert.extend_from_slice(&block(PROPRIETARY_PUBKEY, &key)[..2]);
        cert.extend_from_slice(&(key.len() as u16).to_le_bytes());
        cert.extend_from_slice(&key);
        cert.extend_from_slice(&PROPRIETARY_KEYSIG.to_le_bytes());
        cert.extend_from_slice(&4u16.to_le_bytes());
        cert.extend_from_slice(&[0; 4]);

        let mut sec = 2u32.to_le_bytes().to_vec();
        sec.extend_from_slice(&2u32.to_le_bytes());
        sec.extend_from_slice(&32u32.to_le_bytes());
        sec.extend_from_slice(&(cert.len() as u32).to_le_bytes());
        sec.extend_from_slice(&[0x5A; 32]);
        sec.extend_from_slice(&cert);
        sec
    }

    #[test]
    fn parses_core_security_and_network_blocks() {
        let mut s = response(&[
            block(SC_CORE, &[4, 0, 8, 0]),
            block(SC_SECURITY, &proprietary_security()),
            block(SC_NET, &[0xEB, 0x03, 2, 0, 0xEC, 0x03, 0xED, 0x03]),
        ]);
        let data = parse_server_data(&mut s).unwrap();
        assert_eq!(data.rdp_version, 5);
        assert_eq!(data.channel_ids, vec![1004, 1005]);
        let sec = data.security.unwrap();
        assert_eq!(sec.rc4_key_size, 2);
        assert_eq!(sec.server_random, vec![0x5A; 32]);
        assert_eq!(sec.public_key.exponent, vec![1, 0, 1, 0]);
        assert_eq!(sec.public_key.modulus.len(), 64);
    }

    #[test]
    fn unencrypted_server_has_no_security() {
        let mut s = response(&[
            block(SC_CORE, &[1, 0, 8, 0]),
            block(SC_SECURITY, &[0, 0, 0, 0, 0, 0, 0, 0]),
        ]);
        let data = parse_server_data(&mut s).unwrap();
        assert_eq!(data.rdp_version, 4);
        assert!(data.security.is_none());
    }

    #[test]
    fn bad_rsa_magic_is_a_crypto_error() {
        let mut sec = proprietary_security();
        // Corrupt the first magic byte: 16 byte header + 32 random + 4 version + 8 ids + 4 blob header.
        sec[16 + 32 + 4 + 8 + 4] ^= 0xFF;
        let mut s = response(&[block(SC_SECURITY, &sec)]);
        assert!(matches!(parse_server_data(&mut s), Err(RdpError::Crypto(_))));
    }
}
