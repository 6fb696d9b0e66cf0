//! Capability sets exchanged during activation.

use tracing::debug;

use crate::color::ColorDepth;
use crate::error::Result;
use crate::orders::OrderType;
use crate::stream::PacketBuffer;

use super::pdu::build;

// ── Capability set types ─────────────────────────────────────────

pub const CAPSET_GENERAL: u16 = 1;
pub const CAPSET_BITMAP: u16 = 2;
pub const CAPSET_ORDER: u16 = 3;
pub const CAPSET_BMPCACHE: u16 = 4;
pub const CAPSET_CONTROL: u16 = 5;
pub const CAPSET_ACTIVATE: u16 = 7;
pub const CAPSET_POINTER: u16 = 8;
pub const CAPSET_SHARE: u16 = 9;
pub const CAPSET_COLCACHE: u16 = 10;

const LEN_GENERAL: u16 = 0x18;
const LEN_BITMAP: u16 = 0x1C;
const LEN_ORDER: u16 = 0x58;
const LEN_BMPCACHE: u16 = 0x28;
const LEN_CONTROL: u16 = 0x0C;
const LEN_ACTIVATE: u16 = 0x0C;
const LEN_POINTER: u16 = 0x08;
const LEN_SHARE: u16 = 0x08;
const LEN_COLCACHE: u16 = 0x08;

/// Source descriptor sent with the confirm active PDU.
pub const SOURCE: &[u8] = b"MSTSC\0";

/// General capability extra flags announcing RDP5 features.
const GENERAL_RDP5_FLAGS: u16 = 0x040D;

// Opaque capability sets servers expect from this client family.
const CAPS_0X0D: [u8; 0x54] = {
    let mut caps = [0u8; 0x54];
    caps[0] = 0x01;
    caps[4] = 0x09;
    caps[5] = 0x04;
    caps[8] = 0x04;
    caps[16] = 0x0C;
    caps
};
const CAPS_0X0C: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
const CAPS_0X0E: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
const CAPS_0X10: [u8; 0x30] = [
    0xFE, 0x00, 0x04, 0x00, 0xFE, 0x00, 0x04, 0x00, 0xFE, 0x00, 0x08, 0x00, 0xFE, 0x00, 0x08, 0x00,
    0xFE, 0x00, 0x10, 0x00, 0xFE, 0x00, 0x20, 0x00, 0xFE, 0x00, 0x40, 0x00, 0xFE, 0x00, 0x80, 0x00,
    0xFE, 0x00, 0x00, 0x01, 0x40, 0x00, 0x00, 0x08, 0x00, 0x01, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00,
];

// ── ClientCaps ───────────────────────────────────────────────────

/// What this client advertises in its confirm active PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCaps {
    pub width: u16,
    pub height: u16,
    pub depth: ColorDepth,
    pub rdp5: bool,
    pub bitmap_compression: bool,
    pub bitmap_cache: bool,
    pub desktop_save: bool,
}

impl ClientCaps {
    /// Number of capability sets written by [`Self::encode`].
    pub const COUNT: u16 = 13;

    /// Every capability set, back to back.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = (LEN_GENERAL
            + LEN_BITMAP
            + LEN_ORDER
            + LEN_BMPCACHE
            + LEN_COLCACHE
            + LEN_ACTIVATE
            + LEN_CONTROL
            + LEN_POINTER
            + LEN_SHARE) as usize
            + 4 * 4
            + CAPS_0X0D.len()
            + CAPS_0X0C.len()
            + CAPS_0X0E.len()
            + CAPS_0X10.len();
        build(total, |s| {
            self.general(s)?;
            self.bitmap(s)?;
            self.order(s)?;
            self.bmpcache(s)?;
            colcache(s)?;
            activate(s)?;
            control(s)?;
            pointer(s)?;
            share(s)?;
            opaque(s, 0x0D, &CAPS_0X0D)?;
            opaque(s, 0x0C, &CAPS_0X0C)?;
            opaque(s, 0x0E, &CAPS_0X0E)?;
            opaque(s, 0x10, &CAPS_0X10)
        })
    }

    fn general(&self, s: &mut PacketBuffer) -> Result<()> {
        s.write_u16_le(CAPSET_GENERAL)?;
        s.write_u16_le(LEN_GENERAL)?;
        s.write_u16_le(1)?; // OS major
        s.write_u16_le(3)?; // OS minor
        s.write_u16_le(0x200)?; // protocol version
        s.write_u16_le(0)?;
        s.write_u16_le(0)?; // compression types
        s.write_u16_le(if self.rdp5 { GENERAL_RDP5_FLAGS } else { 0 })?;
        s.write_u16_le(0)?; // update capability
        s.write_u16_le(0)?; // remote unshare
        s.write_u16_le(0)?; // compression level
        s.write_u16_le(0)
    }

    fn bitmap(&self, s: &mut PacketBuffer) -> Result<()> {
        s.write_u16_le(CAPSET_BITMAP)?;
        s.write_u16_le(LEN_BITMAP)?;
        s.write_u16_le(self.depth.bits())?;
        s.write_u16_le(1)?; // receive 1 bpp
        s.write_u16_le(1)?; // receive 4 bpp
        s.write_u16_le(1)?; // receive 8 bpp
        s.write_u16_le(self.width)?;
        s.write_u16_le(self.height)?;
        s.write_u16_le(0)?;
        s.write_u16_le(1)?; // allow resize
        s.write_u16_le(self.bitmap_compression as u16)?;
        s.write_u16_le(0)?;
        s.write_u16_le(1)?;
        s.write_u16_le(0)
    }

    /// Only the primary orders this client can draw are announced.
    fn order(&self, s: &mut PacketBuffer) -> Result<()> {
        let mut support = [0u8; 32];
        support[OrderType::DestBlt as usize] = 1;
        support[OrderType::PatBlt as usize] = 1;
        support[OrderType::ScreenBlt as usize] = 1;
        support[3] = self.bitmap_cache as u8;
        support[8] = 1; // line, legacy slot
        support[OrderType::Line as usize] = 1;
        support[OrderType::Rect as usize] = 1;
        support[OrderType::DeskSave as usize] = self.desktop_save as u8;
        support[OrderType::MemBlt as usize] = self.bitmap_cache as u8;
        support[OrderType::TriBlt as usize] = self.bitmap_cache as u8;
        support[OrderType::Polyline as usize] = 1;
        support[OrderType::Text2 as usize] = 1;

        s.write_u16_le(CAPSET_ORDER)?;
        s.write_u16_le(LEN_ORDER)?;
        s.write_zeros(20)?; // terminal descriptor, pad
        s.write_u16_le(1)?; // cache x granularity
        s.write_u16_le(20)?; // cache y granularity
        s.write_u16_le(0)?;
        s.write_u16_le(1)?; // max order level
        s.write_u16_le(0x147)?; // number of fonts
        s.write_u16_le(0x2A)?; // capability flags
        s.write_bytes(&support)?;
        s.write_u16_le(0x6A1)?; // text capability flags
        s.write_zeros(6)?;
        s.write_u32_le(if self.desktop_save { 0x38400 } else { 0 })?;
        s.write_u32_le(0)?;
        s.write_u32_le(0x4E4)
    }

    fn bmpcache(&self, s: &mut PacketBuffer) -> Result<()> {
        let bpp = self.depth.bytes_per_pixel() as u16;
        s.write_u16_le(CAPSET_BMPCACHE)?;
        s.write_u16_le(LEN_BMPCACHE)?;
        s.write_zeros(24)?;
        s.write_u16_le(0x258)?; // entries
        s.write_u16_le(0x100 * bpp)?; // max cell size
        s.write_u16_le(0x12C)?;
        s.write_u16_le(0x400 * bpp)?;
        s.write_u16_le(0x106)?;
        s.write_u16_le(0x1000 * bpp)
    }
}

fn colcache(s: &mut PacketBuffer) -> Result<()> {
    s.write_u16_le(CAPSET_COLCACHE)?;
    s.write_u16_le(LEN_COLCACHE)?;
    s.write_u16_le(6)?; // cache size
    s.write_u16_le(0)
}

fn activate(s: &mut PacketBuffer) -> Result<()> {
    s.write_u16_le(CAPSET_ACTIVATE)?;
    s.write_u16_le(LEN_ACTIVATE)?;
    s.write_u16_le(0)?; // help key
    s.write_u16_le(0)?; // help index key
    s.write_u16_le(0)?; // extended help key
    s.write_u16_le(0) // window activate
}

fn control(s: &mut PacketBuffer) -> Result<()> {
    s.write_u16_le(CAPSET_CONTROL)?;
    s.write_u16_le(LEN_CONTROL)?;
    s.write_u16_le(0)?; // control capabilities
    s.write_u16_le(0)?; // remote detach
    s.write_u16_le(2)?; // control interest
    s.write_u16_le(2) // detach interest
}

fn pointer(s: &mut PacketBuffer) -> Result<()> {
    s.write_u16_le(CAPSET_POINTER)?;
    s.write_u16_le(LEN_POINTER)?;
    s.write_u16_le(1)?; // colour pointers
    s.write_u16_le(20) // cache size
}

fn share(s: &mut PacketBuffer) -> Result<()> {
    s.write_u16_le(CAPSET_SHARE)?;
    s.write_u16_le(LEN_SHARE)?;
    s.write_u16_le(0)?; // user id
    s.write_u16_le(0)
}

fn opaque(s: &mut PacketBuffer, kind: u16, data: &[u8]) -> Result<()> {
    s.write_u16_le(kind)?;
    s.write_u16_le((data.len() + 4) as u16)?;
    s.write_bytes(data)
}

// ── ServerCaps ───────────────────────────────────────────────────

/// The parts of the server's demand active PDU this client acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCaps {
    /// `Some(false)` when the general set turns RDP5 features off.
    pub rdp5: Option<bool>,
    /// Depth bits, width and height from the bitmap set.
    pub bitmap: Option<(u16, u16, u16)>,
}

/// Walk `len` bytes of capability sets starting at the cursor.
pub fn parse_server_caps(s: &mut PacketBuffer, len: usize) -> Result<ServerCaps> {
    let end = (s.position() + len).min(s.end());
    let mut caps = ServerCaps::default();
    let count = s.read_u16_le()?;
    s.skip(2)?; // pad

    for _ in 0..count {
        if s.position() + 4 > end {
            break;
        }
        let start = s.position();
        let kind = s.read_u16_le()?;
        let length = s.read_u16_le()? as usize;
        if length < 4 {
            break;
        }
        match kind {
            CAPSET_GENERAL => {
                s.skip(10)?;
                let extra_flags = s.read_u16_le()?;
                caps.rdp5 = Some(extra_flags != 0);
            }
            CAPSET_BITMAP => {
                let bpp = s.read_u16_le()?;
                s.skip(6)?; // receive 1/4/8 bpp
                let width = s.read_u16_le()?;
                let height = s.read_u16_le()?;
                caps.bitmap = Some((bpp, width, height));
            }
            other => debug!(kind = other, length, "server capability set ignored"),
        }
        s.set_position((start + length).min(end))?;
    }
    Ok(caps)
}

// ── Tests ────────────────────────────────────────────────────────
