//! T.125 multipoint communication layer.
//!
//! Connects the MCS domain, attaches the user and joins every channel,
//! then carries send-data requests and indications for the layers above.

pub mod ber;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::{RdpError, Result};
use crate::stream::{Layer, PacketBuffer};
use crate::transport::{FastPathHandler, RejectFastPath, TransportReader, TransportWriter};

// ── Constants ────────────────────────────────────────────────────

pub const CONNECT_INITIAL: u16 = 0x7F65;
pub const CONNECT_RESPONSE: u16 = 0x7F66;

pub const EDRQ: u8 = 1;
pub const DPUM: u8 = 8;
pub const AURQ: u8 = 10;
pub const AUCF: u8 = 11;
pub const CJRQ: u8 = 14;
pub const CJCF: u8 = 15;
pub const SDRQ: u8 = 25;
pub const SDIN: u8 = 26;

/// User channel ids are the MCS user id plus this base.
pub const USER_CHANNEL_BASE: u16 = 1001;
pub const GLOBAL_CHANNEL: u16 = 1003;

/// Send-data header: opcode, user, channel, flags, two-byte length.
pub const SEND_HEADER_LEN: usize = 8;

/// `(max_channels, max_users, max_tokens, max_pdu_size)` per domain block.
const TARGET_PARAMS: (u16, u16, u16, u16) = (34, 2, 0, 0xFFFF);
const MIN_PARAMS: (u16, u16, u16, u16) = (1, 1, 1, 0x420);
const MAX_PARAMS: (u16, u16, u16, u16) = (0xFFFF, 0xFC17, 0xFFFF, 0xFFFF);

const DOMAIN_PARAMS_LEN: usize = 32;

fn write_domain_params(s: &mut PacketBuffer, p: (u16, u16, u16, u16)) -> Result<()> {
    ber::write_header(s, ber::TAG_DOMAIN_PARAMS, DOMAIN_PARAMS_LEN)?;
    ber::write_integer(s, p.0)?;
    ber::write_integer(s, p.1)?;
    ber::write_integer(s, p.2)?;
    ber::write_integer(s, 1)?; // num priorities
    ber::write_integer(s, 0)?; // min throughput
    ber::write_integer(s, 1)?; // max height
    ber::write_integer(s, p.3)?;
    ber::write_integer(s, 2) // protocol version
}

// ── Reader ───────────────────────────────────────────────────────

pub struct McsReader<R> {
    transport: TransportReader<R>,
}

impl<R: AsyncRead + Unpin> McsReader<R> {
    pub fn new(transport: TransportReader<R>) -> Self {
        Self { transport }
    }

    /// Next send-data indication as `(payload, channel id)`.
    ///
    /// `None` means the server sent a disconnect-provider ultimatum.
    pub async fn receive(
        &mut self,
        fast_path: &mut dyn FastPathHandler,
    ) -> Result<Option<(PacketBuffer, u16)>> {
        let mut s = self.transport.receive(fast_path).await?;
        let opcode = s.read_u8()?;
        match opcode >> 2 {
            SDIN => {}
            DPUM => {
                info!("server sent disconnect provider ultimatum");
                return Ok(None);
            }
            other => {
                return Err(RdpError::protocol(format!("expected MCS data, got opcode {other}")));
            }
        }
        s.skip(2)?; // initiator
        let channel = s.read_u16_be()?;
        s.skip(1)?; // flags
        let len = s.read_u8()?;
        if len & 0x80 != 0 {
            s.skip(1)?;
        }
        Ok(Some((s, channel)))
    }

    async fn receive_control(&mut self, expected: u8) -> Result<(u8, PacketBuffer)> {
        let mut s = self.transport.receive(&mut RejectFastPath).await?;
        let opcode = s.read_u8()?;
        if opcode >> 2 != expected {
            return Err(RdpError::protocol(format!(
                "expected MCS opcode {expected}, got {}",
                opcode >> 2
            )));
        }
        let result = s.read_u8()?;
        if result != 0 {
            return Err(RdpError::protocol(format!(
                "MCS opcode {expected} failed with result {result}"
            )));
        }
        Ok((opcode, s))
    }

    async fn receive_attach_confirm(&mut self) -> Result<u16> {
        let (opcode, mut s) = self.receive_control(AUCF).await?;
        if opcode & 2 == 0 {
            return Err(RdpError::protocol("attach user confirm without a user id"));
        }
        s.read_u16_be()
    }

    async fn receive_join_confirm(&mut self) -> Result<()> {
        let (opcode, mut s) = self.receive_control(CJCF).await?;
        s.skip(4)?; // user id, requested channel
        if opcode & 2 != 0 {
            s.skip(2)?; // joined channel
        }
        Ok(())
    }

    /// Parse a connect-response up to the server's GCC user data.
    async fn receive_connect_response(&mut self) -> Result<PacketBuffer> {
        let mut s = self.transport.receive(&mut RejectFastPath).await?;
        ber::parse_header(&mut s, CONNECT_RESPONSE)?;
        ber::parse_header(&mut s, ber::TAG_RESULT)?;
        let result = s.read_u8()?;
        if result != 0 {
            return Err(RdpError::protocol(format!("MCS connect failed with result {result}")));
        }
        let len = ber::parse_header(&mut s, ber::TAG_INTEGER)?;
        s.skip(len)?; // connect id
        let len = ber::parse_header(&mut s, ber::TAG_DOMAIN_PARAMS)?;
        s.skip(len)?;
        ber::parse_header(&mut s, ber::TAG_OCTET_STRING)?;
        Ok(s)
    }
}

// ── Writer ───────────────────────────────────────────────────────

pub struct McsWriter<W> {
    transport: TransportWriter<W>,
    user_id: u16,
}

impl<W: AsyncWrite + Unpin> McsWriter<W> {
    /// Writer for an already attached user.
    pub fn new(transport: TransportWriter<W>, user_id: u16) -> Self {
        Self { transport, user_id }
    }

    pub fn user_id(&self) -> u16 {
        self.user_id
    }

    /// A packet with room for `len` bytes after the send-data header.
    pub fn init(&self, len: usize) -> Result<PacketBuffer> {
        let mut s = self.transport.init(len + SEND_HEADER_LEN)?;
        s.push_layer(Layer::Mcs, SEND_HEADER_LEN)?;
        Ok(s)
    }

    /// Fill the send-data header and send to `channel`.
    ///
    /// The length always carries its top bit, as every client does.
    pub async fn send_to(&mut self, mut s: PacketBuffer, channel: u16) -> Result<()> {
        s.pop_layer(Layer::Mcs)?;
        let len = s.end() - s.position() - SEND_HEADER_LEN;
        s.write_u8(SDRQ << 2)?;
        s.write_u16_be(self.user_id)?;
        s.write_u16_be(channel)?;
        s.write_u8(0x70)?;
        s.write_u16_be(len as u16 | 0x8000)?;
        self.transport.send(s).await
    }

    async fn send_control(&mut self, body: &[u8]) -> Result<()> {
        let mut s = self.transport.init(body.len())?;
        s.write_bytes(body)?;
        s.mark_end();
        self.transport.send(s).await
    }

    async fn send_connect_initial(&mut self, client_data: &[u8]) -> Result<()> {
        let data_len = client_data.len();
        let length = 9 + 3 * (DOMAIN_PARAMS_LEN + 2) + ber::header_len(ber::TAG_OCTET_STRING, data_len) + data_len;
        let mut s = self.transport.init(length + ber::header_len(CONNECT_INITIAL, length))?;
        ber::write_header(&mut s, CONNECT_INITIAL, length)?;
        ber::write_header(&mut s, ber::TAG_OCTET_STRING, 1)?; // calling domain
        s.write_u8(1)?;
        ber::write_header(&mut s, ber::TAG_OCTET_STRING, 1)?; // called domain
        s.write_u8(1)?;
        ber::write_header(&mut s, ber::TAG_BOOLEAN, 1)?; // upward
        s.write_u8(0xFF)?;
        write_domain_params(&mut s, TARGET_PARAMS)?;
        write_domain_params(&mut s, MIN_PARAMS)?;
        write_domain_params(&mut s, MAX_PARAMS)?;
        ber::write_header(&mut s, ber::TAG_OCTET_STRING, data_len)?;
        s.write_bytes(client_data)?;
        s.mark_end();
        self.transport.send(s).await
    }

    async fn send_join_request(&mut self, channel: u16) -> Result<()> {
        let [u0, u1] = self.user_id.to_be_bytes();
        let [c0, c1] = channel.to_be_bytes();
        self.send_control(&[CJRQ << 2, u0, u1, c0, c1]).await
    }
}

// ── Connect ──────────────────────────────────────────────────────

/// Run the whole MCS connection sequence.
///
/// `on_server_data` receives the connect-response positioned at the
/// server's GCC data and returns the side channel ids to join, in order.
pub async fn connect<R, W, F>(
    transport_reader: TransportReader<R>,
    transport_writer: TransportWriter<W>,
    client_data: &[u8],
    on_server_data: F,
) -> Result<(McsReader<R>, McsWriter<W>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(&mut PacketBuffer) -> Result<Vec<u16>>,
{
    let mut reader = McsReader {
        transport: transport_reader,
    };
    let mut writer = McsWriter {
        transport: transport_writer,
        user_id: 0,
    };

    writer.send_connect_initial(client_data).await?;
    let mut server_data = reader.receive_connect_response().await?;
    let side_channels = on_server_data(&mut server_data)?;

    writer.send_control(&[EDRQ << 2, 0, 1, 0, 1]).await?;
    writer.send_control(&[AURQ << 2]).await?;
    writer.user_id = reader.receive_attach_confirm().await?;
    debug!(user_id = writer.user_id, "MCS user attached");

    let user_channel = writer.user_id + USER_CHANNEL_BASE;
    for channel in [user_channel, GLOBAL_CHANNEL].into_iter().chain(side_channels) {
        writer.send_join_request(channel).await?;
        reader.receive_join_confirm().await?;
        debug!(channel, "MCS channel joined");
    }
    info!("MCS domain connected");
    Ok((reader, writer))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{ReadHalf, WriteHalf};
    use tokio_test::io::{Builder, Mock};

    fn tpkt(payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() + 7) as u16;
        let mut v = vec![3, 0];
        v.extend_from_slice(&len.to_be_bytes());
        v.extend_from_slice(&[2, 0xF0, 0x80]);
        v.extend_from_slice(payload);
        v
    }

    fn connect_response() -> Vec<u8> {
        let mut body = vec![0x0A, 1, 0, 0x02, 1, 0, 0x30, 0, 0x04, 2, 0xAB, 0xCD];
        let mut v = vec![0x7F, 0x66, body.len() as u8];
        v.append(&mut body);
        tpkt(&v)
    }

    fn connect_initial(client_data: &[u8]) -> Vec<u8> {
        let mut s = PacketBuffer::with_capacity(512);
        s.push_layer(Layer::Transport, 4).unwrap();
        s.write_bytes(&[2, 0xF0, 0x80]).unwrap();
        let length = 9 + 3 * 34 + ber::header_len(4, client_data.len()) + client_data.len();
        ber::write_header(&mut s, CONNECT_INITIAL, length).unwrap();
        s.write_bytes(&[4, 1, 1, 4, 1, 1, 1, 1, 0xFF]).unwrap();
        for p in [TARGET_PARAMS, MIN_PARAMS, MAX_PARAMS] {
            write_domain_params(&mut s, p).unwrap();
        }
        ber::write_header(&mut s, 4, client_data.len()).unwrap();
        s.write_bytes(client_data).unwrap();
        s.mark_end();
        let mut v = s.as_slice().to_vec();
        let len = v.len() as u16;
        v[0] = 3;
        v[2..4].copy_from_slice(&len.to_be_bytes());
        v
    }

    fn script(channels: &[u16], fail_at: Option<u16>) -> Mock {
        let client_data = [0x11u8; 4];
        let mut b = Builder::new();
        b.write(&connect_initial(&client_data))
            .read(&connect_response())
            .write(&tpkt(&[EDRQ << 2, 0, 1, 0, 1]))
            .write(&tpkt(&[AURQ << 2]))
            .read(&tpkt(&[(AUCF << 2) | 2, 0, 0, 7]));
        for &ch in [1008u16, GLOBAL_CHANNEL].iter().chain(channels) {
            let [c0, c1] = ch.to_be_bytes();
            b.write(&tpkt(&[CJRQ << 2, 0, 7, c0, c1]));
            let result = if fail_at == Some(ch) { 1 } else { 0 };
            b.read(&tpkt(&[(CJCF << 2) | 2, result, 0, 7, c0, c1, c0, c1]));
            if fail_at == Some(ch) {
                break;
            }
        }
        b.build()
    }

    async fn run(
        mock: Mock,
        channels: Vec<u16>,
    ) -> Result<(McsReader<ReadHalf<Mock>>, McsWriter<WriteHalf<Mock>>)> {
        let (read, write) = tokio::io::split(mock);
        connect(
            TransportReader::new(read),
            TransportWriter::new(write),
            &[0x11; 4],
            |s| {
                assert_eq!(s.read_u16_be().unwrap(), 0xABCD);
                Ok(channels)
            },
        )
        .await
    }

    #[tokio::test]
    async fn joins_user_global_then_side_channels_in_order() {
        let mock = script(&[1004, 1005], None);
        let (_, writer) = run(mock, vec![1004, 1005]).await.unwrap();
        assert_eq!(writer.user_id(), 7);
    }

    #[tokio::test]
    async fn fails_fast_on_non_zero_join_result() {
        let mock = script(&[1004, 1005], Some(GLOBAL_CHANNEL));
        let err = run(mock, vec![1004, 1005]).await.err().unwrap();
        assert!(matches!(err, RdpError::Protocol(_)));
    }

    #[tokio::test]
    async fn send_to_sets_length_top_bit() {
        let payload = [0xAAu8, 0xBB];
        let mut expected = vec![SDRQ << 2, 0, 7, 0x03, 0xEB, 0x70, 0x80, 0x02];
        expected.extend_from_slice(&payload);
        let mock = Builder::new().write(&tpkt(&expected)).build();
        let mut writer = McsWriter {
            transport: TransportWriter::new(mock),
            user_id: 7,
        };
        let mut s = writer.init(2).unwrap();
        s.write_bytes(&payload).unwrap();
        s.mark_end();
        writer.send_to(s, GLOBAL_CHANNEL).await.unwrap();
    }

    #[tokio::test]
    async fn receive_strips_send_data_header() {
        let mock = Builder::new()
            .read(&tpkt(&[SDIN << 2, 0, 7, 0x03, 0xEB, 0x70, 0x80, 0x01, 0x5A]))
            .build();
        let mut reader = McsReader {
            transport: TransportReader::new(mock),
        };
        let (s, channel) = reader.receive(&mut RejectFastPath).await.unwrap().unwrap();
        assert_eq!(channel, GLOBAL_CHANNEL);
        assert_eq!(s.remaining_slice(), &[0x5A]);
    }
}
