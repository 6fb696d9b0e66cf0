//! `tokio_util` codec for TPKT-framed X.224 and fast-path frames.
//!
//! ```text
//! slow path:  ┌─────────┬──────────┬───────────────┬─────────┬─────────┐
//!             │ ver = 3 │ reserved │ length (BE16) │ X.224   │ payload │
//!             └─────────┴──────────┴───────────────┴─────────┴─────────┘
//! fast path:  ┌──────────────────┬──────────────────────┬─────────┐
//!             │ hdr (low 2 = 0)  │ length (1 or 2 byte) │ payload │
//!             └──────────────────┴──────────────────────┴─────────┘
//! ```
//!
//! Total lengths include the header. A fast-path length byte with the
//! top bit set is the high half of a 15-bit length.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{RdpError, Result};
use crate::stream::{Layer, PacketBuffer};

pub const TPKT_VERSION: u8 = 3;
pub const TPKT_HEADER_LEN: usize = 4;

/// Fast-path header flag: the payload is encrypted.
pub const FASTPATH_ENCRYPTED: u8 = 0x80;

// ── Frame ────────────────────────────────────────────────────────

/// One complete frame off the wire.
#[derive(Debug)]
pub enum Frame {
    /// A TPKT frame. `payload` is positioned just past the X.224 header.
    X224 { code: u8, payload: PacketBuffer },
    /// A fast-path frame. `payload` is positioned past the length field.
    FastPath {
        header: u8,
        encrypted: bool,
        payload: PacketBuffer,
    },
}

// ── TpktCodec ────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct TpktCodec;

impl TpktCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TpktCodec {
    type Item = Frame;
    type Error = RdpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let version = src[0];
        let (total, header_len) = if version == TPKT_VERSION {
            if src.len() < TPKT_HEADER_LEN {
                return Ok(None);
            }
            (u16::from_be_bytes([src[2], src[3]]) as usize, TPKT_HEADER_LEN)
        } else if version & 3 == 0 {
            let b1 = src[1];
            if b1 & 0x80 != 0 {
                if src.len() < 3 {
                    return Ok(None);
                }
                ((((b1 & 0x7F) as usize) << 8) | src[2] as usize, 3)
            } else {
                (b1 as usize, 2)
            }
        } else {
            return Err(RdpError::protocol(format!(
                "unknown frame version byte {version:#04x}"
            )));
        };

        if total < header_len {
            return Err(RdpError::protocol(format!("frame length {total} too short")));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(header_len);

        if version == TPKT_VERSION {
            if frame.len() < 2 {
                return Err(RdpError::protocol("truncated X.224 header"));
            }
            let li = frame[0] as usize;
            let code = frame[1] & 0xF0;
            if li + 1 > frame.len() {
                return Err(RdpError::protocol("X.224 length indicator past frame end"));
            }
            frame.advance(li + 1);
            Ok(Some(Frame::X224 {
                code,
                payload: PacketBuffer::from_vec(frame.to_vec()),
            }))
        } else {
            Ok(Some(Frame::FastPath {
                header: version,
                encrypted: version & FASTPATH_ENCRYPTED != 0,
                payload: PacketBuffer::from_vec(frame.to_vec()),
            }))
        }
    }
}

/// Outbound packets carry a reserved 4-byte TPKT header at their
/// [`Layer::Transport`] checkpoint; the codec fills it in.
impl Encoder<PacketBuffer> for TpktCodec {
    type Error = RdpError;

    fn encode(&mut self, mut item: PacketBuffer, dst: &mut BytesMut) -> Result<()> {
        let total = item.end();
        let length = u16::try_from(total)
            .map_err(|_| RdpError::protocol(format!("packet of {total} bytes too large")))?;
        item.pop_layer(Layer::Transport)?;
        item.write_u8(TPKT_VERSION)?;
        item.write_u8(0)?;
        item.write_u16_be(length)?;

        dst.reserve(total);
        dst.put_slice(item.as_slice());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
