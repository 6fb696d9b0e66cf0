//! Static virtual channels.
//!
//! Channels are requested in the client network data, given MCS ids by
//! the server, and carry messages split into chunks of at most 1600
//! bytes. Each chunk starts with the total message length and a flags
//! word marking the first and last chunk.

use tracing::{debug, warn};

use crate::config::{CHANNEL_OPTION_SHOW_PROTOCOL, MAX_CHANNEL_NAME, MAX_CHANNELS, SessionConfig};
use crate::error::{RdpError, Result};
use crate::mcs::GLOBAL_CHANNEL;
use crate::stream::PacketBuffer;

pub const CHUNK_LENGTH: usize = 1600;

pub const FLAG_FIRST: u32 = 0x01;
pub const FLAG_LAST: u32 = 0x02;
pub const FLAG_SHOW_PROTOCOL: u32 = 0x10;

/// Chunk header: total length and flags.
pub const CHUNK_HEADER_LEN: usize = 8;

// ── VirtualChannel ───────────────────────────────────────────────

/// A handler for one static virtual channel.
pub trait VirtualChannel: Send {
    fn name(&self) -> &str;

    /// `CHANNEL_OPTION_*` flags sent in the client network data.
    fn options(&self) -> u32;

    /// Handle one reassembled message, returning messages to send back.
    fn process(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>>;
}

// ── ChannelDef ───────────────────────────────────────────────────

/// A requested channel and the MCS id it ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDef {
    pub name: String,
    pub options: u32,
    pub id: u16,
}

impl ChannelDef {
    /// Flags for the first chunk of an outbound message.
    pub fn chunk_flags(&self) -> u32 {
        let show = if self.options & CHANNEL_OPTION_SHOW_PROTOCOL != 0 {
            FLAG_SHOW_PROTOCOL
        } else {
            0
        };
        show | FLAG_FIRST
    }
}

// ── Registry ─────────────────────────────────────────────────────

struct Entry {
    def: ChannelDef,
    handler: Option<Box<dyn VirtualChannel>>,
    pending: Vec<u8>,
}

/// Every channel requested for a session, in request order.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: Vec<Entry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels named in the configuration, without handlers.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let mut reg = Self::new();
        for ch in &config.channels {
            reg.add(ch.name.clone(), ch.flags, None)?;
        }
        Ok(reg)
    }

    fn add(&mut self, name: String, options: u32, handler: Option<Box<dyn VirtualChannel>>) -> Result<()> {
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME || !name.is_ascii() {
            return Err(RdpError::Config(format!("invalid channel name {name:?}")));
        }
        if let Some(existing) = self.entries.iter_mut().find(|e| e.def.name == name) {
            existing.def.options = options;
            if handler.is_some() {
                existing.handler = handler;
            }
            return Ok(());
        }
        if self.entries.len() >= MAX_CHANNELS {
            return Err(RdpError::Config(format!("more than {MAX_CHANNELS} channels")));
        }
        let id = GLOBAL_CHANNEL + 1 + self.entries.len() as u16;
        self.entries.push(Entry {
            def: ChannelDef { name, options, id },
            handler,
            pending: Vec::new(),
        });
        Ok(())
    }

    /// Attach a handler, replacing a configured channel of the same name.
    pub fn register(&mut self, handler: Box<dyn VirtualChannel>) -> Result<()> {
        let name = handler.name().to_string();
        let options = handler.options();
        self.add(name, options, Some(handler))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn defs(&self) -> Vec<ChannelDef> {
        self.entries.iter().map(|e| e.def.clone()).collect()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.entries.iter().map(|e| e.def.id).collect()
    }

    /// Apply ids from the server network data. Missing ids keep their
    /// default of one past the global channel plus the request index.
    pub fn assign_ids(&mut self, ids: &[u16]) {
        for (entry, &id) in self.entries.iter_mut().zip(ids) {
            entry.def.id = id;
        }
    }

    /// Reassemble one chunk arriving on `channel_id`.
    ///
    /// Returns the handler's replies once a message is complete.
    pub fn process(&mut self, channel_id: u16, s: &mut PacketBuffer) -> Result<Vec<Vec<u8>>> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.def.id == channel_id) else {
            warn!(channel_id, "data for unknown channel");
            return Ok(Vec::new());
        };
        let total = s.read_u32_le()? as usize;
        let flags = s.read_u32_le()?;
        let chunk = s.remaining_slice();

        if flags & FLAG_FIRST != 0 {
            entry.pending.clear();
            entry.pending.reserve(total);
        }
        if flags & (FLAG_FIRST | FLAG_LAST) == (FLAG_FIRST | FLAG_LAST) {
            return dispatch(entry, chunk.to_vec());
        }
        entry.pending.extend_from_slice(chunk);
        if flags & FLAG_LAST == 0 {
            return Ok(Vec::new());
        }
        if entry.pending.len() != total {
            debug!(
                channel = %entry.def.name,
                expected = total,
                got = entry.pending.len(),
                "channel message length mismatch"
            );
        }
        let message = std::mem::take(&mut entry.pending);
        dispatch(entry, message)
    }
}

fn dispatch(entry: &mut Entry, message: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    match entry.handler.as_mut() {
        Some(h) => h.process(&message),
        None => {
            debug!(channel = %entry.def.name, len = message.len(), "no handler for channel message");
            Ok(Vec::new())
        }
    }
}

// ── Outbound chunking ────────────────────────────────────────────

/// Split `data` into `(flags, chunk)` pairs for `def`.
pub fn chunks<'a>(def: &ChannelDef, data: &'a [u8]) -> Vec<(u32, &'a [u8])> {
    let mut flags = def.chunk_flags();
    let mut out = Vec::with_capacity(data.len() / CHUNK_LENGTH + 1);
    let mut rest = data;
    loop {
        let take = rest.len().min(CHUNK_LENGTH);
        let (chunk, tail) = rest.split_at(take);
        if tail.is_empty() {
            flags |= FLAG_LAST;
        }
        out.push((flags, chunk));
        flags &= !FLAG_FIRST;
        rest = tail;
        if rest.is_empty() {
            return out;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Echo {
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl VirtualChannel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn options(&self) -> u32 {
            CHANNEL_OPTION_SHOW_PROTOCOL
        }

        fn process(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>> {
            self.seen.lock().unwrap().push(message.to_vec());
            Ok(vec![message.to_vec()])
        }
    }

    fn chunk(total: u32, flags: u32, data: &[u8]) -> PacketBuffer {
        let mut v = total.to_le_bytes().to_vec();
        v.extend_from_slice(&flags.to_le_bytes());
        v.extend_from_slice(data);
        PacketBuffer::from_vec(v)
    }

    #[test]
    fn reassembles_first_middle_last() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ChannelRegistry::new();
        reg.register(Box::new(Echo { seen: seen.clone() })).unwrap();
        assert_eq!(reg.ids(), vec![1004]);

        assert!(reg.process(1004, &mut chunk(5, FLAG_FIRST, b"ab")).unwrap().is_empty());
        assert!(reg.process(1004, &mut chunk(5, 0, b"c")).unwrap().is_empty());
        let replies = reg.process(1004, &mut chunk(5, FLAG_LAST, b"de")).unwrap();
        assert_eq!(replies, vec![b"abcde".to_vec()]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn single_chunk_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ChannelRegistry::new();
        reg.register(Box::new(Echo { seen })).unwrap();
        reg.assign_ids(&[1010]);
        let replies = reg
            .process(1010, &mut chunk(2, FLAG_FIRST | FLAG_LAST, b"hi"))
            .unwrap();
        assert_eq!(replies, vec![b"hi".to_vec()]);
        assert!(reg.process(1004, &mut chunk(2, 3, b"hi")).unwrap().is_empty());
    }

    #[test]
    fn outbound_chunks_carry_first_and_last() {
        let def = ChannelDef {
            name: "echo".into(),
            options: CHANNEL_OPTION_SHOW_PROTOCOL,
            id: 1004,
        };
        let data = vec![0u8; CHUNK_LENGTH * 2 + 10];
        let parts = chunks(&def, &data);
        let flags: Vec<u32> = parts.iter().map(|(f, _)| *f).collect();
        assert_eq!(
            flags,
            vec![
                FLAG_SHOW_PROTOCOL | FLAG_FIRST,
                FLAG_SHOW_PROTOCOL,
                FLAG_SHOW_PROTOCOL | FLAG_LAST
            ]
        );
        assert_eq!(parts[2].1.len(), 10);

        let one = chunks(&def, b"x");
        assert_eq!(one, vec![(FLAG_SHOW_PROTOCOL | FLAG_FIRST | FLAG_LAST, &b"x"[..])]);
    }

    #[test]
    fn rejects_bad_names() {
        let mut cfg = SessionConfig::default();
        cfg.channels.push(crate::config::ChannelConfig {
            name: "much_too_long".into(),
            flags: 0,
        });
        assert!(ChannelRegistry::from_config(&cfg).is_err());
    }
}
