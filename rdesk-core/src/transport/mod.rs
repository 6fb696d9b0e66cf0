//! ISO transport layer: TCP connect, X.224 connection handshake and the
//! framed receive loop.
//!
//! The byte stream is split into a reader and a writer half right after
//! the handshake so the receive loop and input senders never contend
//! for the socket itself.

pub mod codec;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info};

use crate::error::{RdpError, Result};
use crate::stream::{Layer, PacketBuffer};

pub use codec::{Frame, TpktCodec};

// ── X.224 PDU codes ──────────────────────────────────────────────

pub const X224_CONNECTION_REQUEST: u8 = 0xE0;
pub const X224_CONNECTION_CONFIRM: u8 = 0xD0;
pub const X224_DATA: u8 = 0xF0;

/// TPKT header plus the three-byte X.224 data header.
pub const DATA_HEADER_LEN: usize = 7;

const COOKIE_PREFIX: &[u8] = b"Cookie: mstshash=";

// ── FastPathHandler ──────────────────────────────────────────────

/// Receives fast-path frames met while waiting for a slow-path frame.
pub trait FastPathHandler: Send {
    fn fast_path(&mut self, header: u8, encrypted: bool, payload: PacketBuffer) -> Result<()>;
}

/// Handler for phases where the server must not send fast-path frames.
pub struct RejectFastPath;

impl FastPathHandler for RejectFastPath {
    fn fast_path(&mut self, _header: u8, _encrypted: bool, _payload: PacketBuffer) -> Result<()> {
        Err(RdpError::protocol("fast-path frame before the session is active"))
    }
}

// ── Reader ───────────────────────────────────────────────────────

pub struct TransportReader<R> {
    frames: FramedRead<R, TpktCodec>,
}

impl<R: AsyncRead + Unpin> TransportReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            frames: FramedRead::new(inner, TpktCodec::new()),
        }
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        match self.frames.next().await {
            Some(frame) => frame,
            None => Err(RdpError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))),
        }
    }

    /// Next X.224 data payload.
    ///
    /// Fast-path frames in between go to `fast_path` and the loop keeps
    /// reading until a slow-path frame arrives.
    pub async fn receive(&mut self, fast_path: &mut dyn FastPathHandler) -> Result<PacketBuffer> {
        loop {
            match self.next_frame().await? {
                Frame::X224 {
                    code: X224_DATA,
                    payload,
                } => return Ok(payload),
                Frame::X224 { code, .. } => {
                    return Err(RdpError::protocol(format!(
                        "expected X.224 data, got code {code:#04x}"
                    )));
                }
                Frame::FastPath {
                    header,
                    encrypted,
                    payload,
                } => fast_path.fast_path(header, encrypted, payload)?,
            }
        }
    }

    /// Next X.224 frame of any type, for the connection handshake.
    pub async fn receive_x224(&mut self) -> Result<(u8, PacketBuffer)> {
        match self.next_frame().await? {
            Frame::X224 { code, payload } => Ok((code, payload)),
            Frame::FastPath { .. } => Err(RdpError::protocol("fast-path frame during handshake")),
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────

pub struct TransportWriter<W> {
    frames: FramedWrite<W, TpktCodec>,
}

impl<W: AsyncWrite + Unpin> TransportWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            frames: FramedWrite::new(inner, TpktCodec::new()),
        }
    }

    /// A data packet with room for `len` payload bytes after the headers.
    pub fn init(&self, len: usize) -> Result<PacketBuffer> {
        let mut s = PacketBuffer::with_capacity(len + DATA_HEADER_LEN);
        s.push_layer(Layer::Transport, codec::TPKT_HEADER_LEN)?;
        s.write_u8(2)?;
        s.write_u8(X224_DATA)?;
        s.write_u8(0x80)?;
        Ok(s)
    }

    pub async fn send(&mut self, packet: PacketBuffer) -> Result<()> {
        self.frames.send(packet).await
    }
}

// ── Connection ───────────────────────────────────────────────────

/// Open a TCP connection, bounded by `timeout`.
pub async fn open(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    info!(host, port, "connecting");
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| RdpError::ConnectTimeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn connection_request(username: &str) -> Result<PacketBuffer> {
    let cookie_len = COOKIE_PREFIX.len() + username.len() + 2;
    let mut s = PacketBuffer::with_capacity(codec::TPKT_HEADER_LEN + 7 + cookie_len);
    s.push_layer(Layer::Transport, codec::TPKT_HEADER_LEN)?;
    // Length indicator excludes itself.
    s.write_u8((6 + cookie_len) as u8)?;
    s.write_u8(X224_CONNECTION_REQUEST)?;
    s.write_u16_le(0)?; // dst ref
    s.write_u16_le(0)?; // src ref
    s.write_u8(0)?; // class
    s.write_bytes(COOKIE_PREFIX)?;
    s.write_bytes(username.as_bytes())?;
    s.write_bytes(b"\r\n")?;
    s.mark_end();
    Ok(s)
}

/// Split `stream` and run the X.224 connection request/confirm exchange.
pub async fn connect<S>(
    stream: S,
    username: &str,
) -> Result<(TransportReader<ReadHalf<S>>, TransportWriter<WriteHalf<S>>)>
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    let mut reader = TransportReader::new(read);
    let mut writer = TransportWriter::new(write);

    writer.send(connection_request(username)?).await?;
    let (code, _) = reader.receive_x224().await?;
    if code != X224_CONNECTION_CONFIRM {
        return Err(RdpError::protocol(format!(
            "expected connection confirm, got code {code:#04x}"
        )));
    }
    debug!("X.224 connection confirmed");
    Ok((reader, writer))
}

// ── Tests ────────────────────────────────────────────────────────
