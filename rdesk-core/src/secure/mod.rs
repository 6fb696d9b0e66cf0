//! Standard RDP security layer.
//!
//! Adds the security header to outbound traffic (flags, MAC and RC4),
//! strips and verifies it on inbound traffic, and routes licensing and
//! virtual channel data away from the share PDUs on the global channel.

pub mod crypto;
pub mod licence;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use crate::channel::{self, ChannelDef, ChannelRegistry};
use crate::config::SessionConfig;
use crate::error::{RdpError, Result};
use crate::gcc::{self, ServerData};
use crate::mcs::{self, GLOBAL_CHANNEL, McsReader, McsWriter};
use crate::stream::{Layer, PacketBuffer};
use crate::transport::{self, FastPathHandler};

use crypto::{DirectionKeys, PADDING_SIZE, SIGNATURE_LEN, SessionKeys};

// ── Security header flags ────────────────────────────────────────

pub const SEC_CLIENT_RANDOM: u32 = 0x0001;
pub const SEC_ENCRYPT: u32 = 0x0008;
pub const SEC_LOGON_INFO: u32 = 0x0040;
pub const SEC_LICENCE_NEG: u32 = 0x0080;
pub const SEC_SECURE_CHECKSUM: u32 = 0x0800;

/// Fast-path output header bit for salted MACs.
const FASTPATH_SECURE_CHECKSUM: u8 = 0x40;

// ── Inbound ──────────────────────────────────────────────────────

/// A received slow-path payload with its security header removed.
#[derive(Debug)]
pub enum Inbound {
    /// Share PDUs on the global channel.
    Global(PacketBuffer),
    /// A licensing message.
    Licence(PacketBuffer),
    /// A chunk on a static virtual channel.
    Channel(u16, PacketBuffer),
}

/// Decrypt `s` in place after its 8-byte MAC and check the MAC.
///
/// Salted checksums mix in a counter this client does not track, so
/// those are decrypted without verification.
fn decrypt(keys: Option<&mut DirectionKeys>, s: &mut PacketBuffer, salted: bool) -> Result<()> {
    let keys = keys.ok_or_else(|| RdpError::crypto("encrypted packet before key exchange"))?;
    let mut mac = [0u8; SIGNATURE_LEN];
    mac.copy_from_slice(s.read_bytes(SIGNATURE_LEN)?);
    keys.cipher.apply(s.remaining_mut())?;
    if !salted && keys.sign(s.remaining_slice()) != mac {
        return Err(RdpError::crypto("MAC mismatch on received packet"));
    }
    Ok(())
}

/// Decrypts fast-path frames before handing them on.
struct Decrypting<'a> {
    keys: Option<&'a mut DirectionKeys>,
    inner: &'a mut dyn FastPathHandler,
}

impl FastPathHandler for Decrypting<'_> {
    fn fast_path(&mut self, header: u8, encrypted: bool, mut payload: PacketBuffer) -> Result<()> {
        if encrypted {
            let salted = header & FASTPATH_SECURE_CHECKSUM != 0;
            decrypt(self.keys.as_deref_mut(), &mut payload, salted)?;
        }
        self.inner.fast_path(header, false, payload)
    }
}

// ── Reader ───────────────────────────────────────────────────────

pub struct SecureReader<R> {
    mcs: McsReader<R>,
    keys: Option<DirectionKeys>,
    encryption: bool,
    licence_issued: Arc<AtomicBool>,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    pub fn new(
        mcs: McsReader<R>,
        keys: Option<DirectionKeys>,
        licence_issued: Arc<AtomicBool>,
    ) -> Self {
        Self {
            encryption: keys.is_some(),
            mcs,
            keys,
            licence_issued,
        }
    }

    /// Next slow-path payload; `None` once the server disconnects.
    pub async fn receive(&mut self, fast_path: &mut dyn FastPathHandler) -> Result<Option<Inbound>> {
        let mut handler = Decrypting {
            keys: self.keys.as_mut(),
            inner: fast_path,
        };
        let Some((mut s, channel)) = self.mcs.receive(&mut handler).await? else {
            return Ok(None);
        };

        if self.encryption || !self.licence_issued.load(Ordering::Acquire) {
            let flags = s.read_u32_le()?;
            if flags & SEC_ENCRYPT != 0 {
                decrypt(self.keys.as_mut(), &mut s, flags & SEC_SECURE_CHECKSUM != 0)?;
            }
            if flags & SEC_LICENCE_NEG != 0 {
                return Ok(Some(Inbound::Licence(s)));
            }
        }

        if channel != GLOBAL_CHANNEL {
            return Ok(Some(Inbound::Channel(channel, s)));
        }
        Ok(Some(Inbound::Global(s)))
    }
}

// ── Writer ───────────────────────────────────────────────────────

/// Outbound half of the security layer.
///
/// A packet must be sent with the same flags it was initialised with,
/// and both calls must happen while holding the session's send lock so
/// the licence state cannot change in between.
pub struct SecureWriter<W> {
    mcs: McsWriter<W>,
    keys: Option<DirectionKeys>,
    licence_issued: Arc<AtomicBool>,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    pub fn new(mcs: McsWriter<W>, keys: Option<DirectionKeys>, licence_issued: Arc<AtomicBool>) -> Self {
        Self {
            mcs,
            keys,
            licence_issued,
        }
    }

    pub fn user_id(&self) -> u16 {
        self.mcs.user_id()
    }

    pub fn encryption(&self) -> bool {
        self.keys.is_some()
    }

    /// Flags for ordinary traffic: encrypted whenever keys exist.
    pub fn default_flags(&self) -> u32 {
        if self.encryption() { SEC_ENCRYPT } else { 0 }
    }

    fn header_len(&self, flags: u32) -> usize {
        if flags & SEC_ENCRYPT != 0 {
            4 + SIGNATURE_LEN
        } else if !self.licence_issued.load(Ordering::Acquire) {
            4
        } else {
            0
        }
    }

    pub fn init(&self, flags: u32, len: usize) -> Result<PacketBuffer> {
        let header = self.header_len(flags);
        let mut s = self.mcs.init(len + header)?;
        s.push_layer(Layer::Secure, header)?;
        Ok(s)
    }

    /// Fill the security header, sign and encrypt, and send to `channel`.
    pub async fn send_to(&mut self, mut s: PacketBuffer, flags: u32, channel: u16) -> Result<()> {
        s.pop_layer(Layer::Secure)?;
        if flags & SEC_ENCRYPT != 0 || !self.licence_issued.load(Ordering::Acquire) {
            s.write_u32_le(flags)?;
        }
        if flags & SEC_ENCRYPT != 0 {
            let keys = self
                .keys
                .as_mut()
                .ok_or_else(|| RdpError::crypto("encrypting without session keys"))?;
            let data_start = s.position() + SIGNATURE_LEN;
            let mac = keys.sign(&s.as_slice()[data_start..]);
            s.write_bytes(&mac)?;
            keys.cipher.apply(s.remaining_mut())?;
        }
        self.mcs.send_to(s, channel).await
    }

    pub async fn send(&mut self, s: PacketBuffer, flags: u32) -> Result<()> {
        self.send_to(s, flags, GLOBAL_CHANNEL).await
    }

    /// Send one virtual channel message, split into chunks.
    pub async fn send_channel(&mut self, def: &ChannelDef, data: &[u8]) -> Result<()> {
        let flags = self.default_flags();
        for (chunk_flags, chunk) in channel::chunks(def, data) {
            let mut s = self.init(flags, channel::CHUNK_HEADER_LEN + chunk.len())?;
            s.write_u32_le(data.len() as u32)?;
            s.write_u32_le(chunk_flags)?;
            s.write_bytes(chunk)?;
            s.mark_end();
            self.send_to(s, flags, def.id).await?;
        }
        debug!(channel = %def.name, len = data.len(), "channel message sent");
        Ok(())
    }

    /// Send the RSA-encrypted client random.
    async fn send_client_random(&mut self, encrypted: &[u8]) -> Result<()> {
        let length = encrypted.len() + PADDING_SIZE;
        let mut s = self.init(SEC_CLIENT_RANDOM, length + 4)?;
        s.write_u32_le(length as u32)?;
        s.write_bytes(encrypted)?;
        s.write_zeros(PADDING_SIZE)?;
        s.mark_end();
        self.send(s, SEC_CLIENT_RANDOM).await
    }
}

// ── Connect ──────────────────────────────────────────────────────

/// Run the transport, MCS and security connection phases over `stream`.
///
/// Channel ids the server assigns are written back into `registry`.
pub async fn connect<S>(
    stream: S,
    config: &SessionConfig,
    registry: &mut ChannelRegistry,
    licence_issued: Arc<AtomicBool>,
) -> Result<(SecureReader<ReadHalf<S>>, SecureWriter<WriteHalf<S>>, ServerData)>
where
    S: AsyncRead + AsyncWrite,
{
    let (transport_reader, transport_writer) =
        transport::connect(stream, &config.login.username).await?;
    let client_data = gcc::client_data(config, config.aligned_width(), &registry.defs())?;

    let mut server = None;
    let (mcs_reader, mcs_writer) =
        mcs::connect(transport_reader, transport_writer, &client_data, |s| {
            let data = gcc::parse_server_data(s)?;
            registry.assign_ids(&data.channel_ids);
            let ids = registry.ids();
            server = Some(data);
            Ok(ids)
        })
        .await?;
    let server = server.ok_or_else(|| RdpError::protocol("connect response without server data"))?;

    let security = match (&server.security, config.security.encryption) {
        (Some(sec), true) => Some(sec.clone()),
        (Some(_), false) => {
            return Err(RdpError::protocol("server requires encryption but it is disabled"));
        }
        (None, true) => {
            warn!("server does not offer encryption; continuing in the clear");
            None
        }
        (None, false) => None,
    };

    let mut writer = SecureWriter::new(mcs_writer, None, licence_issued.clone());
    let Some(sec) = security else {
        let reader = SecureReader::new(mcs_reader, None, licence_issued);
        return Ok((reader, writer, server));
    };

    let client_random: [u8; crypto::RANDOM_SIZE] = rand::random();
    let encrypted = sec.public_key.encrypt(&client_random);
    writer.send_client_random(&encrypted).await?;

    let keys = SessionKeys::generate(&client_random, &sec.server_random, sec.rc4_key_size)?;
    info!(
        key_bits = if sec.rc4_key_size == 1 { 40 } else { 128 },
        "session keys established"
    );
    writer.keys = Some(keys.encrypt);
    let reader = SecureReader::new(mcs_reader, Some(keys.decrypt), licence_issued);
    Ok((reader, writer, server))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RejectFastPath, TransportReader, TransportWriter};
    use crypto::CipherState;
    use tokio_test::io::Builder;

    fn tpkt(payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() + 7) as u16;
        let mut v = vec![3, 0];
        v.extend_from_slice(&len.to_be_bytes());
        v.extend_from_slice(&[2, 0xF0, 0x80]);
        v.extend_from_slice(payload);
        v
    }

    fn send_data(channel: u16, payload: &[u8]) -> Vec<u8> {
        let [c0, c1] = channel.to_be_bytes();
        let mut v = vec![mcs::SDRQ << 2, 0, 7, c0, c1, 0x70];
        v.extend_from_slice(&(payload.len() as u16 | 0x8000).to_be_bytes());
        v.extend_from_slice(payload);
        tpkt(&v)
    }

    fn indication(channel: u16, payload: &[u8]) -> Vec<u8> {
        let [c0, c1] = channel.to_be_bytes();
        let mut v = vec![mcs::SDIN << 2, 0, 7, c0, c1, 0x70, 0x80, payload.len() as u8];
        v.extend_from_slice(payload);
        tpkt(&v)
    }

    fn keys() -> SessionKeys {
        SessionKeys::generate(&[3u8; 32], &[4u8; 32], 2).unwrap()
    }

    #[tokio::test]
    async fn clear_header_is_dropped_once_licensed() {
        let issued = Arc::new(AtomicBool::new(false));
        let mock = Builder::new()
            .write(&send_data(GLOBAL_CHANNEL, &[0, 0, 0, 0, 0xAA]))
            .write(&send_data(GLOBAL_CHANNEL, &[0xBB]))
            .build();
        let mut writer = SecureWriter::new(
            McsWriter::new(TransportWriter::new(mock), 7),
            None,
            issued.clone(),
        );

        let mut s = writer.init(0, 1).unwrap();
        s.write_u8(0xAA).unwrap();
        s.mark_end();
        writer.send(s, 0).await.unwrap();

        issued.store(true, Ordering::Release);
        let mut s = writer.init(0, 1).unwrap();
        s.write_u8(0xBB).unwrap();
        s.mark_end();
        writer.send(s, 0).await.unwrap();
    }

    #[tokio::test]
    async fn encrypted_packet_carries_flags_mac_and_ciphertext() {
        let plain = b"payload".to_vec();
        let reference = keys().encrypt;
        let mut expected = SEC_ENCRYPT.to_le_bytes().to_vec();
        expected.extend_from_slice(&reference.sign(&plain));
        let mut cipher = plain.clone();
        CipherState::new(reference.cipher.key().to_vec())
            .unwrap()
            .apply(&mut cipher)
            .unwrap();
        expected.extend_from_slice(&cipher);

        let mock = Builder::new().write(&send_data(GLOBAL_CHANNEL, &expected)).build();
        let mut writer = SecureWriter::new(
            McsWriter::new(TransportWriter::new(mock), 7),
            Some(keys().encrypt),
            Arc::new(AtomicBool::new(false)),
        );
        let mut s = writer.init(SEC_ENCRYPT, plain.len()).unwrap();
        s.write_bytes(&plain).unwrap();
        s.mark_end();
        writer.send(s, SEC_ENCRYPT).await.unwrap();
    }

    fn encrypted_frame(flags: u32, plain: &[u8], tamper: bool) -> Vec<u8> {
        let reference = keys().decrypt;
        let mut body = flags.to_le_bytes().to_vec();
        let mut mac = reference.sign(plain);
        if tamper {
            mac[0] ^= 0xFF;
        }
        body.extend_from_slice(&mac);
        let mut cipher = plain.to_vec();
        CipherState::new(reference.cipher.key().to_vec())
            .unwrap()
            .apply(&mut cipher)
            .unwrap();
        body.extend_from_slice(&cipher);
        indication(GLOBAL_CHANNEL, &body)
    }

    fn reader(frame: &[u8]) -> SecureReader<tokio_test::io::Mock> {
        let mock = Builder::new().read(frame).build();
        SecureReader::new(
            McsReader::new(TransportReader::new(mock)),
            Some(keys().decrypt),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn reader_decrypts_and_verifies() {
        let mut r = reader(&encrypted_frame(SEC_ENCRYPT, b"share pdu", false));
        match r.receive(&mut RejectFastPath).await.unwrap() {
            Some(Inbound::Global(s)) => assert_eq!(s.remaining_slice(), b"share pdu"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reader_rejects_bad_mac() {
        let mut r = reader(&encrypted_frame(SEC_ENCRYPT, b"share pdu", true));
        let err = r.receive(&mut RejectFastPath).await.unwrap_err();
        assert!(matches!(err, RdpError::Crypto(_)));
    }

    #[tokio::test]
    async fn salted_checksum_skips_verification() {
        let flags = SEC_ENCRYPT | SEC_SECURE_CHECKSUM;
        let mut r = reader(&encrypted_frame(flags, b"x", true));
        assert!(matches!(
            r.receive(&mut RejectFastPath).await.unwrap(),
            Some(Inbound::Global(_))
        ));
    }

    #[tokio::test]
    async fn licence_and_channel_traffic_are_routed() {
        let mut licence = SEC_LICENCE_NEG.to_le_bytes().to_vec();
        licence.push(0x01);
        let channel = [0u8, 0, 0, 0, 0x42];
        let mock = Builder::new()
            .read(&indication(GLOBAL_CHANNEL, &licence))
            .read(&indication(1004, &channel))
            .build();
        let mut r = SecureReader::new(
            McsReader::new(TransportReader::new(mock)),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(
            r.receive(&mut RejectFastPath).await.unwrap(),
            Some(Inbound::Licence(_))
        ));
        match r.receive(&mut RejectFastPath).await.unwrap() {
            Some(Inbound::Channel(1004, s)) => assert_eq!(s.remaining_slice(), &[0x42]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
