//! Fixed-capacity packet buffer with per-layer header checkpoints.
//!
//! Outbound PDUs are built top-down: every layer reserves its header
//! with [`PacketBuffer::push_layer`] on the way in, the payload is
//! written, and on the way out each layer jumps back with
//! [`PacketBuffer::pop_layer`] to fill in lengths and flags once the
//! final size is known.
//!
//! Inbound frames use the same type as a read cursor. Multi-byte
//! accessors are explicit about byte order because the protocol mixes
//! both within a single PDU.

use crate::error::{RdpError, Result};

// ── Layer ────────────────────────────────────────────────────────

/// Protocol layers that own a header checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Transport,
    Mcs,
    Secure,
    Rdp,
}

impl Layer {
    const COUNT: usize = 4;

    const fn index(self) -> usize {
        match self {
            Layer::Transport => 0,
            Layer::Mcs => 1,
            Layer::Secure => 2,
            Layer::Rdp => 3,
        }
    }
}

// ── PacketBuffer ─────────────────────────────────────────────────

/// Byte buffer with a cursor, an end-of-data marker and layer headers.
///
/// Invariants: `pos <= capacity`, `end <= capacity`, and a header
/// checkpoint cannot be moved once recorded.
#[derive(Clone, PartialEq, Eq)]
pub struct PacketBuffer {
    data: Vec<u8>,
    pos: usize,
    end: usize,
    headers: [Option<usize>; Layer::COUNT],
}

impl PacketBuffer {
    /// Zero-filled buffer ready for writing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            pos: 0,
            end: 0,
            headers: [None; Layer::COUNT],
        }
    }

    /// Buffer wrapping received bytes; the end marker is the data length.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let end = data.len();
        Self {
            data,
            pos: 0,
            end,
            headers: [None; Layer::COUNT],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the cursor. Fails if the target lies beyond the capacity.
    pub fn set_position(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(RdpError::Overrun {
                needed: pos,
                available: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Record the current cursor as the end of valid data.
    pub fn mark_end(&mut self) {
        self.end = self.pos;
    }

    /// Shrink the readable window, e.g. to the end of a sub-PDU.
    pub fn set_end(&mut self, end: usize) -> Result<()> {
        if end > self.data.len() {
            return Err(RdpError::Overrun {
                needed: end,
                available: self.data.len(),
            });
        }
        self.end = end;
        Ok(())
    }

    /// Bytes left between the cursor and the end marker.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.end
    }

    /// Valid bytes `[0, end)`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.end]
    }

    /// Bytes from the cursor to the end marker.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.pos.min(self.end)..self.end]
    }

    /// Mutable view of the bytes from the cursor to the end marker.
    pub fn remaining_mut(&mut self) -> &mut [u8] {
        let start = self.pos.min(self.end);
        &mut self.data[start..self.end]
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.end);
        self.data
    }

    // ── Header checkpoints ───────────────────────────────────────

    /// Reserve `len` bytes for `layer`'s header at the cursor.
    pub fn push_layer(&mut self, layer: Layer, len: usize) -> Result<()> {
        self.set_header(layer)?;
        self.advance(len)
    }

    /// Rewind the cursor to `layer`'s header.
    pub fn pop_layer(&mut self, layer: Layer) -> Result<()> {
        let at = self.header(layer).ok_or_else(|| {
            RdpError::protocol(format!("no {layer:?} header recorded in packet"))
        })?;
        self.pos = at;
        Ok(())
    }

    /// Record the cursor as `layer`'s header offset.
    pub fn set_header(&mut self, layer: Layer) -> Result<()> {
        let slot = &mut self.headers[layer.index()];
        if slot.is_some() {
            return Err(RdpError::protocol(format!(
                "{layer:?} header already recorded"
            )));
        }
        *slot = Some(self.pos);
        Ok(())
    }

    pub fn header(&self, layer: Layer) -> Option<usize> {
        self.headers[layer.index()]
    }

    // ── Reading ──────────────────────────────────────────────────

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(RdpError::Overrun {
                needed: n,
                available: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }

    /// Skip `n` readable bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Little-endian value of `n` (1..=4) bytes.
    pub fn read_uint_le(&mut self, n: usize) -> Result<u32> {
        let b = self.take(n)?;
        Ok(b.iter()
            .enumerate()
            .fold(0u32, |acc, (i, &v)| acc | (v as u32) << (8 * i)))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        self.take(n)
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        self.take(n).map(<[u8]>::to_vec)
    }

    // ── Writing ──────────────────────────────────────────────────

    fn advance(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(RdpError::Overrun {
                needed: self.pos + n,
                available: self.data.len(),
            });
        }
        self.pos += n;
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let start = self.pos;
        self.advance(bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    pub fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u16_be(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u32_be(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.put(v)
    }

    /// Write `n` zero bytes.
    pub fn write_zeros(&mut self, n: usize) -> Result<()> {
        let start = self.pos;
        self.advance(n)?;
        self.data[start..start + n].fill(0);
        Ok(())
    }

    /// UTF-16LE string of `byte_len` bytes followed by a two-byte terminator.
    pub fn write_unicode(&mut self, s: &str, byte_len: usize) -> Result<()> {
        let mut written = 0;
        for unit in s.encode_utf16() {
            if written + 2 > byte_len {
                break;
            }
            self.write_u16_le(unit)?;
            written += 2;
        }
        self.write_zeros(byte_len - written + 2)
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("capacity", &self.data.len())
            .field("pos", &self.pos)
            .field("end", &self.end)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Byte length of a string once written as UTF-16LE, without terminator.
pub fn unicode_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_endian_reads() {
        let mut s = PacketBuffer::from_vec(vec![0x01, 0x02, 0x01, 0x02, 0xAA, 0xBB, 0xCC]);
        assert_eq!(s.read_u16_le().unwrap(), 0x0201);
        assert_eq!(s.read_u16_be().unwrap(), 0x0102);
        assert_eq!(s.read_uint_le(3).unwrap(), 0xCCBBAA);
        assert!(!s.has_remaining());
    }

    #[test]
    fn read_past_end_is_overrun() {
        let mut s = PacketBuffer::from_vec(vec![1, 2, 3]);
        s.skip(2).unwrap();
        let err = s.read_u16_le().unwrap_err();
        assert!(matches!(
            err,
            RdpError::Overrun {
                needed: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn write_past_capacity_is_rejected() {
        let mut s = PacketBuffer::with_capacity(3);
        s.write_u16_le(1).unwrap();
        assert!(s.write_u16_le(2).is_err());
        assert_eq!(s.position(), 2);
    }

    #[test]
    fn layers_patch_headers_after_payload() {
        let mut s = PacketBuffer::with_capacity(16);
        s.push_layer(Layer::Transport, 2).unwrap();
        s.push_layer(Layer::Mcs, 1).unwrap();
        s.write_bytes(b"abc").unwrap();
        s.mark_end();

        s.pop_layer(Layer::Mcs).unwrap();
        s.write_u8(0x7f).unwrap();
        s.pop_layer(Layer::Transport).unwrap();
        let total = s.end() as u16;
        s.write_u16_be(total).unwrap();

        assert_eq!(s.as_slice(), &[0, 6, 0x7f, b'a', b'b', b'c']);
    }

    #[test]
    fn header_checkpoint_is_immutable() {
        let mut s = PacketBuffer::with_capacity(8);
        s.push_layer(Layer::Secure, 4).unwrap();
        assert!(s.push_layer(Layer::Secure, 4).is_err());
        assert_eq!(s.header(Layer::Secure), Some(0));
    }

    #[test]
    fn unicode_is_padded_with_terminator() {
        let mut s = PacketBuffer::with_capacity(16);
        s.write_unicode("ab", 4).unwrap();
        s.mark_end();
        assert_eq!(s.as_slice(), &[b'a', 0, b'b', 0, 0, 0]);
        assert_eq!(unicode_len("ab"), 4);
    }
}
