//! Licensing exchange run inline on the global channel.
//!
//! The client uses null randoms, so the licence keys depend only on the
//! server random. A stored licence is presented when the store has one
//! for this server; otherwise a new one is requested, the platform
//! challenge is answered, and an issued licence goes back to the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::error::{RdpError, Result};
use crate::secure::crypto::{self, PADDING_SIZE, RANDOM_SIZE};
use crate::stream::PacketBuffer;

// ── Message tags ─────────────────────────────────────────────────

pub const TAG_DEMAND: u8 = 0x01;
pub const TAG_AUTHREQ: u8 = 0x02;
pub const TAG_ISSUE: u8 = 0x03;
pub const TAG_REISSUE: u8 = 0x04;
pub const TAG_PRESENT: u8 = 0x12;
pub const TAG_REQUEST: u8 = 0x13;
pub const TAG_AUTHRESP: u8 = 0x15;
pub const TAG_RESULT: u8 = 0xFF;

const TAG_USER: u16 = 0x000F;
const TAG_HOST: u16 = 0x0010;

const TOKEN_SIZE: usize = 10;
const HWID_SIZE: usize = 20;
const SIGNATURE_SIZE: usize = 16;
const MODULUS_SIZE: usize = 64;
const PREAMBLE_VERSION: u8 = 2;
const STATUS_VALID_CLIENT: u32 = 7;

// ── LicenceStore ─────────────────────────────────────────────────

/// Opaque licence blobs keyed by server host name.
pub trait LicenceStore: Send {
    fn load(&self, server: &str) -> Option<Vec<u8>>;
    fn save(&mut self, server: &str, licence: &[u8]);
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLicenceStore {
    licences: HashMap<String, Vec<u8>>,
}

impl MemoryLicenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LicenceStore for MemoryLicenceStore {
    fn load(&self, server: &str) -> Option<Vec<u8>> {
        self.licences.get(server).cloned()
    }

    fn save(&mut self, server: &str, licence: &[u8]) {
        self.licences.insert(server.to_string(), licence.to_vec());
    }
}

// ── Licensing state ──────────────────────────────────────────────

pub struct Licensing {
    server: String,
    username: String,
    client_hostname: String,
    store: Box<dyn LicenceStore>,
    issued: Arc<AtomicBool>,
    sign_key: [u8; 16],
    licence_key: [u8; 16],
}

impl Licensing {
    pub fn new(
        server: &str,
        username: &str,
        client_hostname: &str,
        store: Box<dyn LicenceStore>,
        issued: Arc<AtomicBool>,
    ) -> Self {
        Self {
            server: server.to_string(),
            username: username.to_string(),
            client_hostname: client_hostname.to_string(),
            store,
            issued,
            sign_key: [0; 16],
            licence_key: [0; 16],
        }
    }

    pub fn is_issued(&self) -> bool {
        self.issued.load(Ordering::Acquire)
    }

    /// Handle one licensing message and return the reply body, if any.
    ///
    /// Malformed messages are logged and dropped.
    pub fn process(&mut self, s: &mut PacketBuffer) -> Option<Vec<u8>> {
        match self.process_inner(s) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("skipping malformed licence message: {e}");
                None
            }
        }
    }

    fn process_inner(&mut self, s: &mut PacketBuffer) -> Result<Option<Vec<u8>>> {
        let tag = s.read_u8()?;
        s.skip(3)?; // version, length
        match tag {
            TAG_DEMAND => self.process_demand(s).map(Some),
            TAG_AUTHREQ => self.process_authreq(s).map(Some),
            TAG_ISSUE => {
                self.process_issue(s)?;
                Ok(None)
            }
            TAG_REISSUE => Ok(None),
            TAG_RESULT => {
                let code = s.read_u32_le()?;
                if code == STATUS_VALID_CLIENT {
                    info!("licence accepted");
                    self.issued.store(true, Ordering::Release);
                } else {
                    warn!(code, "licensing error alert");
                }
                Ok(None)
            }
            other => Err(RdpError::unsupported(format!("licence tag {other:#04x}"))),
        }
    }

    fn generate_keys(&mut self, server_random: &[u8]) {
        let null = [0u8; 48];
        let client_random = [0u8; RANDOM_SIZE];
        let master = crypto::hash48(&null, &client_random, server_random, b'A');
        let key_block = crypto::hash48(&master, server_random, &client_random, b'A');
        self.sign_key.copy_from_slice(&key_block[..16]);
        self.licence_key = crypto::hash16(&key_block[16..32], &client_random, server_random);
    }

    fn hwid(&self) -> [u8; HWID_SIZE] {
        let mut hwid = [0u8; HWID_SIZE];
        hwid[..4].copy_from_slice(&2u32.to_le_bytes());
        let host = self.client_hostname.as_bytes();
        let n = host.len().min(HWID_SIZE - 4);
        hwid[4..4 + n].copy_from_slice(&host[..n]);
        hwid
    }

    fn process_demand(&mut self, s: &mut PacketBuffer) -> Result<Vec<u8>> {
        let server_random = s.read_vec(RANDOM_SIZE)?;
        self.generate_keys(&server_random);

        match self.store.load(&self.server) {
            Some(licence) if !licence.is_empty() => {
                debug!(len = licence.len(), "presenting stored licence");
                let mut hwid = self.hwid();
                let signature = crypto::sign(&self.sign_key, &hwid, SIGNATURE_SIZE);
                crypto::rc4_once(&self.licence_key, &mut hwid)?;
                present(&licence, &hwid, &signature)
            }
            _ => {
                debug!("requesting new licence");
                request(&self.username, &self.client_hostname)
            }
        }
    }

    fn process_authreq(&mut self, s: &mut PacketBuffer) -> Result<Vec<u8>> {
        s.skip(6)?;
        let token_len = s.read_u16_le()? as usize;
        if token_len != TOKEN_SIZE {
            return Err(RdpError::protocol(format!("licence token of {token_len} bytes")));
        }
        let token = s.read_vec(TOKEN_SIZE)?;
        s.skip(SIGNATURE_SIZE)?;

        let mut decrypted = token.clone();
        crypto::rc4_once(&self.licence_key, &mut decrypted)?;

        let mut hwid = self.hwid();
        let mut sealed = decrypted;
        sealed.extend_from_slice(&hwid);
        let signature = crypto::sign(&self.sign_key, &sealed, SIGNATURE_SIZE);
        crypto::rc4_once(&self.licence_key, &mut hwid)?;

        let length = 58;
        let mut out = PacketBuffer::with_capacity(length);
        out.write_u8(TAG_AUTHRESP)?;
        out.write_u8(PREAMBLE_VERSION)?;
        out.write_u16_le(length as u16)?;
        out.write_u16_le(1)?;
        out.write_u16_le(TOKEN_SIZE as u16)?;
        out.write_bytes(&token)?;
        out.write_u16_le(1)?;
        out.write_u16_le(HWID_SIZE as u16)?;
        out.write_bytes(&hwid)?;
        out.write_bytes(&signature)?;
        out.mark_end();
        Ok(out.into_vec())
    }

    fn process_issue(&mut self, s: &mut PacketBuffer) -> Result<()> {
        s.skip(2)?;
        let length = s.read_u16_le()? as usize;
        if s.remaining() < length {
            return Err(RdpError::Overrun {
                needed: length,
                available: s.remaining(),
            });
        }
        let mut body = s.read_vec(length)?;
        crypto::rc4_once(&self.licence_key, &mut body)?;
        let mut body = PacketBuffer::from_vec(body);
        if body.read_u16_le()? != 0 {
            return Err(RdpError::protocol("licence failed to decrypt"));
        }
        body.skip(2)?;

        // The licence is the fourth length-prefixed string.
        let mut len = 0usize;
        for _ in 0..4 {
            body.skip(len)?;
            len = body.read_u32_le()? as usize;
            if body.remaining() < len {
                return Err(RdpError::Overrun {
                    needed: len,
                    available: body.remaining(),
                });
            }
        }
        let licence = body.read_bytes(len)?;
        self.issued.store(true, Ordering::Release);
        self.store.save(&self.server, licence);
        info!(len, "licence issued");
        Ok(())
    }
}

/// Null client random and RSA block shared by present and request.
fn write_key_exchange(out: &mut PacketBuffer, platform: u16) -> Result<()> {
    out.write_u32_le(1)?;
    out.write_u16_le(0)?;
    out.write_u16_le(platform)?;
    out.write_zeros(RANDOM_SIZE)?;
    out.write_u16_le(0)?;
    out.write_u16_le((MODULUS_SIZE + PADDING_SIZE) as u16)?;
    out.write_zeros(MODULUS_SIZE + PADDING_SIZE)
}

fn present(licence: &[u8], hwid: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
    let length = 4 + 8 + RANDOM_SIZE + 4 + MODULUS_SIZE + PADDING_SIZE
        + 4 + licence.len() + 4 + HWID_SIZE + SIGNATURE_SIZE;
    let mut out = PacketBuffer::with_capacity(length);
    out.write_u8(TAG_PRESENT)?;
    out.write_u8(PREAMBLE_VERSION)?;
    out.write_u16_le(length as u16)?;
    write_key_exchange(&mut out, 0x0201)?;
    out.write_u16_le(1)?;
    out.write_u16_le(licence.len() as u16)?;
    out.write_bytes(licence)?;
    out.write_u16_le(1)?;
    out.write_u16_le(HWID_SIZE as u16)?;
    out.write_bytes(hwid)?;
    out.write_bytes(signature)?;
    out.mark_end();
    Ok(out.into_vec())
}

fn request(username: &str, hostname: &str) -> Result<Vec<u8>> {
    let user_len = username.len() + 1;
    let host_len = hostname.len() + 1;
    let length = 128 + user_len + host_len;
    let mut out = PacketBuffer::with_capacity(length);
    out.write_u8(TAG_REQUEST)?;
    out.write_u8(PREAMBLE_VERSION)?;
    out.write_u16_le(length as u16)?;
    write_key_exchange(&mut out, 0xFF01)?;
    out.write_u16_le(TAG_USER)?;
    out.write_u16_le(user_len as u16)?;
    out.write_bytes(username.as_bytes())?;
    out.write_u8(0)?;
    out.write_u16_le(TAG_HOST)?;
    out.write_u16_le(host_len as u16)?;
    out.write_bytes(hostname.as_bytes())?;
    out.write_u8(0)?;
    out.mark_end();
    Ok(out.into_vec())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn licensing(store: MemoryLicenceStore) -> Licensing {
        Licensing::new("server", "alice", "box", Box::new(store), Arc::new(AtomicBool::new(false)))
    }

    fn message(tag: u8, body: &[u8]) -> PacketBuffer {
        let mut v = vec![tag, 2];
        v.extend_from_slice(&((body.len() + 4) as u16).to_le_bytes());
        v.extend_from_slice(body);
        PacketBuffer::from_vec(v)
    }

    #[test]
    fn demand_without_stored_licence_requests_one() {
        let mut lic = licensing(MemoryLicenceStore::new());
        let reply = lic.process(&mut message(TAG_DEMAND, &[9u8; 32])).unwrap();
        assert_eq!(reply[0], TAG_REQUEST);
        assert_eq!(reply.len(), 128 + 6 + 4);
        assert_eq!(u16::from_le_bytes([reply[2], reply[3]]) as usize, reply.len());
        assert!(reply.ends_with(b"box\0"));
    }

    #[test]
    fn demand_with_stored_licence_presents_it() {
        let mut store = MemoryLicenceStore::new();
        store.save("server", b"LICENCE");
        let mut lic = licensing(store);
        let reply = lic.process(&mut message(TAG_DEMAND, &[9u8; 32])).unwrap();
        assert_eq!(reply[0], TAG_PRESENT);
        assert_eq!(u16::from_le_bytes([reply[2], reply[3]]) as usize, reply.len());
    }

    #[test]
    fn authreq_reply_is_58_bytes() {
        let mut lic = licensing(MemoryLicenceStore::new());
        lic.process(&mut message(TAG_DEMAND, &[9u8; 32]));
        let mut body = vec![0u8; 6];
        body.extend_from_slice(&(TOKEN_SIZE as u16).to_le_bytes());
        body.extend_from_slice(&[0x55; TOKEN_SIZE]);
        body.extend_from_slice(&[0; SIGNATURE_SIZE]);
        let reply = lic.process(&mut message(TAG_AUTHREQ, &body)).unwrap();
        assert_eq!(reply.len(), 58);
        assert_eq!(reply[0], TAG_AUTHRESP);
        assert_eq!(&reply[8..18], &[0x55; TOKEN_SIZE]);
    }

    #[test]
    fn issue_stores_the_fourth_string() {
        let mut lic = licensing(MemoryLicenceStore::new());
        lic.process(&mut message(TAG_DEMAND, &[9u8; 32]));

        let mut plain = vec![0u8, 0, 0, 0];
        for s in [&b"a"[..], b"bb", b"ccc", b"LICENCE"] {
            plain.extend_from_slice(&(s.len() as u32).to_le_bytes());
            plain.extend_from_slice(s);
        }
        crypto::rc4_once(&lic.licence_key, &mut plain).unwrap();
        let mut body = vec![0u8, 0];
        body.extend_from_slice(&(plain.len() as u16).to_le_bytes());
        body.extend_from_slice(&plain);

        assert!(lic.process(&mut message(TAG_ISSUE, &body)).is_none());
        assert!(lic.is_issued());
        assert_eq!(lic.store.load("server").unwrap(), b"LICENCE");
    }

    #[test]
    fn malformed_message_is_skipped() {
        let mut lic = licensing(MemoryLicenceStore::new());
        assert!(lic.process(&mut message(TAG_AUTHREQ, &[0; 3])).is_none());
        assert!(!lic.is_issued());
    }

    #[test]
    fn valid_client_result_completes_licensing() {
        let mut lic = licensing(MemoryLicenceStore::new());
        let body = [7u8, 0, 0, 0, 2, 0, 0, 0];
        assert!(lic.process(&mut message(TAG_RESULT, &body)).is_none());
        assert!(lic.is_issued());
    }
}
