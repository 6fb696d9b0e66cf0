//! Share control and share data PDUs.
//!
//! Every slow-path PDU on the global channel starts with a share control
//! header; data PDUs add a share data header naming the data PDU type.
//!
//! ```text
//! control: ┌──────────────┬──────────────┬───────────┐
//!          │ total (LE16) │ type | 0x10  │ source id │
//!          └──────────────┴──────────────┴───────────┘
//! data:    ┌──────────┬─────┬────────┬────────────┬──────┬───────┬──────┐
//!          │ share id │ pad │ stream │ len (LE16) │ type │ ctype │ clen │
//!          └──────────┴─────┴────────┴────────────┴──────┴───────┴──────┘
//! ```

use tokio::io::AsyncWrite;
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{RdpError, Result};
use crate::mcs::USER_CHANNEL_BASE;
use crate::secure::{SEC_LOGON_INFO, SecureWriter};
use crate::stream::{Layer, PacketBuffer, unicode_len};

// ── PDU types ────────────────────────────────────────────────────

pub const PDU_DEMAND_ACTIVE: u16 = 1;
pub const PDU_CONFIRM_ACTIVE: u16 = 3;
pub const PDU_DEACTIVATE_ALL: u16 = 6;
pub const PDU_DATA: u16 = 7;

pub const DATA_UPDATE: u8 = 2;
pub const DATA_CONTROL: u8 = 20;
pub const DATA_POINTER: u8 = 27;
pub const DATA_INPUT: u8 = 28;
pub const DATA_SYNCHRONISE: u8 = 31;
pub const DATA_BELL: u8 = 34;
pub const DATA_LOGON: u8 = 38;
pub const DATA_FONT2: u8 = 39;
pub const DATA_FONTMAP: u8 = 40;
pub const DATA_SET_ERROR_INFO: u8 = 47;

pub const CTRL_REQUEST_CONTROL: u16 = 1;
pub const CTRL_GRANT_CONTROL: u16 = 2;
pub const CTRL_DETACH: u16 = 3;
pub const CTRL_COOPERATE: u16 = 4;

pub const SHARE_CONTROL_HEADER_LEN: usize = 6;
pub const SHARE_DATA_HEADER_LEN: usize = 18;

/// A share control length with this value is a keep-alive of 8 bytes.
const KEEPALIVE_LENGTH: u16 = 0x8000;
const PDU_VERSION: u16 = 0x10;
/// The share data header's compressed flag.
const PACKET_COMPRESSED: u8 = 0x20;

// ── Logon flags ──────────────────────────────────────────────────

pub const LOGON_NORMAL: u32 = 0x0033;
pub const LOGON_AUTO: u32 = 0x0008;
pub const LOGON_BLOB: u32 = 0x0100;

const CLIENT_DLL: &str = "C:\\WINNT\\System32\\mstscax.dll";
/// Bias, two names, two transition dates and two biases.
const TIME_ZONE_LEN: usize = 172;

// ── Inbound headers ──────────────────────────────────────────────

/// A share control header and where the PDU it starts ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareControl {
    /// Low four bits of the PDU type; `None` for a keep-alive.
    pub pdu_type: Option<u16>,
    pub next: usize,
}

/// Read the share control header at the cursor.
///
/// Several PDUs can share one packet, so `next` is clamped to the end
/// of the data rather than rejected.
pub fn read_share_control(s: &mut PacketBuffer) -> Result<ShareControl> {
    let start = s.position();
    let length = s.read_u16_le()?;
    if length == KEEPALIVE_LENGTH {
        return Ok(ShareControl {
            pdu_type: None,
            next: (start + 8).min(s.end()),
        });
    }
    if (length as usize) < SHARE_CONTROL_HEADER_LEN - 2 {
        return Err(RdpError::protocol(format!("share control length {length}")));
    }
    let pdu_type = s.read_u16_le()? & 0x0F;
    s.skip(2)?; // source id
    Ok(ShareControl {
        pdu_type: Some(pdu_type),
        next: (start + length as usize).min(s.end()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareData {
    pub share_id: u32,
    pub kind: u8,
    pub compressed: bool,
}

pub fn read_share_data(s: &mut PacketBuffer) -> Result<ShareData> {
    let share_id = s.read_u32_le()?;
    s.skip(2)?; // pad, stream id
    s.skip(2)?; // uncompressed length
    let kind = s.read_u8()?;
    let ctype = s.read_u8()?;
    s.skip(2)?; // compressed length
    Ok(ShareData {
        share_id,
        kind,
        compressed: ctype & PACKET_COMPRESSED != 0,
    })
}

// ── Outbound bodies ──────────────────────────────────────────────

/// Run `f` against a fresh buffer of `capacity` bytes and return what
/// it wrote.
pub(crate) fn build(capacity: usize, f: impl FnOnce(&mut PacketBuffer) -> Result<()>) -> Result<Vec<u8>> {
    let mut s = PacketBuffer::with_capacity(capacity);
    f(&mut s)?;
    s.mark_end();
    Ok(s.into_vec())
}

pub fn synchronise() -> Result<Vec<u8>> {
    build(4, |s| {
        s.write_u16_le(1)?; // message type
        s.write_u16_le(USER_CHANNEL_BASE + 1)?; // target user
        Ok(())
    })
}

pub fn control(action: u16) -> Result<Vec<u8>> {
    build(8, |s| {
        s.write_u16_le(action)?;
        s.write_u16_le(0)?; // grant id
        s.write_u32_le(0)?; // control id
        Ok(())
    })
}

/// An empty font list; `seq` is 1 for the first PDU and 2 for the last.
pub fn font_list(seq: u16) -> Result<Vec<u8>> {
    build(8, |s| {
        s.write_u16_le(0)?; // number of fonts
        s.write_u16_le(0)?;
        s.write_u16_le(seq)?;
        s.write_u16_le(0x32)?; // entry size
        Ok(())
    })
}

/// Flags and strings of a logon info packet.
///
/// The extended form adds the client address, the client library path,
/// a zeroed time zone block and the experience flags.
pub fn logon_info(config: &SessionConfig, rdp5: bool, client_addr: &str) -> Result<Vec<u8>> {
    let login = &config.login;
    let mut flags = LOGON_NORMAL;
    if login.autologon && !login.password.is_empty() {
        flags |= LOGON_AUTO;
    }
    let len_domain = unicode_len(&login.domain);
    let len_user = unicode_len(&login.username);
    let len_password = unicode_len(&login.password);
    let len_program = unicode_len(&login.shell);
    let len_directory = unicode_len(&login.directory);
    let strings = len_domain + len_user + len_password + len_program + len_directory + 10;

    if !rdp5 {
        return build(18 + strings, |s| {
            s.write_u32_le(0)?; // code page
            s.write_u32_le(flags)?;
            s.write_u16_le(len_domain as u16)?;
            s.write_u16_le(len_user as u16)?;
            s.write_u16_le(len_password as u16)?;
            s.write_u16_le(len_program as u16)?;
            s.write_u16_le(len_directory as u16)?;
            s.write_unicode(&login.domain, len_domain)?;
            s.write_unicode(&login.username, len_user)?;
            s.write_unicode(&login.password, len_password)?;
            s.write_unicode(&login.shell, len_program)?;
            s.write_unicode(&login.directory, len_directory)
        });
    }

    flags |= LOGON_BLOB;
    let len_password = if flags & LOGON_AUTO != 0 { len_password } else { 0 };
    let len_ip = unicode_len(client_addr);
    let len_dll = unicode_len(CLIENT_DLL);
    let capacity = 18 + strings + 6 + len_ip + 2 + len_dll + 2 + TIME_ZONE_LEN + 10;
    build(capacity, |s| {
        s.write_u32_le(0)?;
        s.write_u32_le(flags)?;
        s.write_u16_le(len_domain as u16)?;
        s.write_u16_le(len_user as u16)?;
        s.write_u16_le(len_password as u16)?;
        s.write_u16_le(len_program as u16)?;
        s.write_u16_le(len_directory as u16)?;
        s.write_unicode(&login.domain, len_domain)?;
        s.write_unicode(&login.username, len_user)?;
        let password = if len_password > 0 { login.password.as_str() } else { "" };
        s.write_unicode(password, len_password)?;
        s.write_unicode(&login.shell, len_program)?;
        s.write_unicode(&login.directory, len_directory)?;

        s.write_u16_le(2)?; // address family
        s.write_u16_le((len_ip + 2) as u16)?;
        s.write_unicode(client_addr, len_ip)?;
        s.write_u16_le((len_dll + 2) as u16)?;
        s.write_unicode(CLIENT_DLL, len_dll)?;
        s.write_zeros(TIME_ZONE_LEN)?;
        s.write_u32_le(0)?; // session id
        s.write_u32_le(config.features.performance_flags)?;
        s.write_u16_le(0) // auto-reconnect cookie length
    })
}

// ── Sending ──────────────────────────────────────────────────────

fn source_id(user_id: u16) -> u16 {
    user_id.wrapping_add(USER_CHANNEL_BASE)
}

/// Wrap `body` in share control and share data headers and send it.
pub async fn send_data<W: AsyncWrite + Unpin>(
    writer: &mut SecureWriter<W>,
    share_id: u32,
    kind: u8,
    body: &[u8],
) -> Result<()> {
    let flags = writer.default_flags();
    let mut s = writer.init(flags, SHARE_DATA_HEADER_LEN + body.len())?;
    s.push_layer(Layer::Rdp, SHARE_DATA_HEADER_LEN)?;
    s.write_bytes(body)?;
    s.mark_end();

    s.pop_layer(Layer::Rdp)?;
    let length = SHARE_DATA_HEADER_LEN + body.len();
    s.write_u16_le(length as u16)?;
    s.write_u16_le(PDU_DATA | PDU_VERSION)?;
    s.write_u16_le(source_id(writer.user_id()))?;
    s.write_u32_le(share_id)?;
    s.write_u8(0)?; // pad
    s.write_u8(1)?; // stream id
    s.write_u16_le((length - 14) as u16)?;
    s.write_u8(kind)?;
    s.write_u8(0)?; // compression type
    s.write_u16_le(0)?; // compressed length
    debug!(kind, len = body.len(), "data PDU sent");
    writer.send(s, flags).await
}

/// Send a confirm active PDU carrying `count` capability sets.
pub async fn send_confirm_active<W: AsyncWrite + Unpin>(
    writer: &mut SecureWriter<W>,
    share_id: u32,
    source: &[u8],
    count: u16,
    caps: &[u8],
) -> Result<()> {
    let flags = writer.default_flags();
    let caplen = caps.len() + 4;
    let length = SHARE_CONTROL_HEADER_LEN + 10 + source.len() + caplen;
    let mut s = writer.init(flags, length)?;
    s.write_u16_le(length as u16)?;
    s.write_u16_le(PDU_CONFIRM_ACTIVE | PDU_VERSION)?;
    s.write_u16_le(source_id(writer.user_id()))?;
    s.write_u32_le(share_id)?;
    s.write_u16_le(USER_CHANNEL_BASE + 1)?; // originator
    s.write_u16_le(source.len() as u16)?;
    s.write_u16_le(caplen as u16)?;
    s.write_bytes(source)?;
    s.write_u16_le(count)?;
    s.write_u16_le(0)?; // pad
    s.write_bytes(caps)?;
    s.mark_end();
    writer.send(s, flags).await
}

/// Send a logon info packet built by [`logon_info`].
pub async fn send_logon_info<W: AsyncWrite + Unpin>(writer: &mut SecureWriter<W>, body: &[u8]) -> Result<()> {
    let flags = SEC_LOGON_INFO | writer.default_flags();
    let mut s = writer.init(flags, body.len())?;
    s.write_bytes(body)?;
    s.mark_end();
    writer.send(s, flags).await
}

// ── Tests ────────────────────────────────────────────────────────
