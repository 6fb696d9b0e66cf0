//! Secondary orders: cache population sent inline with drawing orders.

use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::cache::{GraphicsCache, Glyph};
use crate::color::{ColorDepth, Palette};
use crate::error::Result;
use crate::stream::PacketBuffer;

pub const RAW_BMPCACHE: u8 = 0;
pub const COLCACHE: u8 = 1;
pub const BMPCACHE: u8 = 2;
pub const FONTCACHE: u8 = 3;
pub const RAW_BMPCACHE2: u8 = 4;
pub const BMPCACHE2: u8 = 5;

/// The compressed bitmap omits its 8-byte compression header.
const NO_BITMAP_COMPRESSION_HDR: u16 = 0x0400;

const BMPCACHE2_ID_MASK: u16 = 0x0007;
const BMPCACHE2_MODE_MASK: u16 = 0x0038;
const BMPCACHE2_MODE_SHIFT: u16 = 3;
const BMPCACHE2_SQUARE: u16 = 0x0080;
const BMPCACHE2_PERSIST: u16 = 0x0100;
const BMPCACHE2_LONG_FORMAT: u8 = 0x80;
const BMPCACHE2_BUFSIZE_MASK: u16 = 0x3FFF;

/// Process one secondary order. The cursor always ends on the next order,
/// whatever the handler consumed.
pub fn process(s: &mut PacketBuffer, cache: &mut dyn GraphicsCache, depth: ColorDepth) -> Result<()> {
    let length = s.read_u16_le()? as i16;
    let flags = s.read_u16_le()?;
    let kind = s.read_u8()?;
    let next = (s.position() as i64 + length as i64 + 7) as usize;

    match kind {
        RAW_BMPCACHE => raw_bmpcache(s, cache, depth)?,
        COLCACHE => colcache(s, cache)?,
        BMPCACHE => bmpcache(s, cache, depth, flags)?,
        FONTCACHE => fontcache(s, cache)?,
        RAW_BMPCACHE2 => bmpcache2(s, cache, depth, flags, false)?,
        BMPCACHE2 => bmpcache2(s, cache, depth, flags, true)?,
        other => warn!(kind = other, "unimplemented secondary order"),
    }
    s.set_position(next)
}

fn raw_bmpcache(s: &mut PacketBuffer, cache: &mut dyn GraphicsCache, depth: ColorDepth) -> Result<()> {
    let cache_id = s.read_u8()?;
    s.skip(1)?;
    let width = s.read_u8()? as u16;
    let height = s.read_u8()? as u16;
    s.skip(1)?; // bpp
    let size = s.read_u16_le()? as usize;
    let index = s.read_u16_le()?;
    let data = s.read_bytes(size)?;
    let bitmap = Bitmap::from_raw(data, width, height, depth)?;
    debug!(cache_id, index, width, height, "raw bitmap cached");
    cache.put_bitmap(cache_id, index, bitmap);
    Ok(())
}

fn bmpcache(s: &mut PacketBuffer, cache: &mut dyn GraphicsCache, depth: ColorDepth, flags: u16) -> Result<()> {
    let cache_id = s.read_u8()?;
    s.skip(1)?;
    let width = s.read_u8()? as u16;
    let height = s.read_u8()? as u16;
    s.skip(1)?; // bpp
    let mut size = s.read_u16_le()? as usize;
    let index = s.read_u16_le()?;
    if flags & NO_BITMAP_COMPRESSION_HDR == 0 {
        s.skip(2)?;
        size = s.read_u16_le()? as usize;
        s.skip(4)?; // row size, final size
    }
    let data = s.read_bytes(size)?;
    let bitmap = Bitmap::decompress(data, width, height, depth)?;
    debug!(cache_id, index, width, height, "compressed bitmap cached");
    cache.put_bitmap(cache_id, index, bitmap);
    Ok(())
}

fn bmpcache2(
    s: &mut PacketBuffer,
    cache: &mut dyn GraphicsCache,
    depth: ColorDepth,
    flags: u16,
    compressed: bool,
) -> Result<()> {
    let cache_id = (flags & BMPCACHE2_ID_MASK) as u8;
    let mode_bpp = ((flags & BMPCACHE2_MODE_MASK) >> BMPCACHE2_MODE_SHIFT) as i32 - 2;
    if mode_bpp != depth.bytes_per_pixel() as i32 {
        debug!(mode_bpp, "bitmap cache v2 depth differs from the session");
    }
    if flags & BMPCACHE2_PERSIST != 0 {
        s.skip(8)?; // persistent key
    }
    let width = s.read_u8()? as u16;
    let height = if flags & BMPCACHE2_SQUARE != 0 {
        width
    } else {
        s.read_u8()? as u16
    };
    let size = (s.read_u16_be()? & BMPCACHE2_BUFSIZE_MASK) as usize;
    let mut index = s.read_u8()? as u16;
    if index as u8 & BMPCACHE2_LONG_FORMAT != 0 {
        let low = s.read_u8()? as u16;
        index = ((index ^ BMPCACHE2_LONG_FORMAT as u16) << 8) | low;
    }
    let data = s.read_bytes(size)?;
    let bitmap = if compressed {
        Bitmap::decompress(data, width, height, depth)?
    } else {
        Bitmap::from_raw(data, width, height, depth)?
    };
    debug!(cache_id, index, width, height, compressed, "bitmap cache v2 entry");
    cache.put_bitmap(cache_id, index, bitmap);
    Ok(())
}

/// Colour table: blue, green, red and a pad byte per entry.
fn colcache(s: &mut PacketBuffer, cache: &mut dyn GraphicsCache) -> Result<()> {
    let id = s.read_u8()?;
    let count = s.read_u16_le()? as usize;
    let quads = s.read_bytes(count * 4)?;
    let rgb: Vec<u8> = quads
        .chunks_exact(4)
        .flat_map(|q| [q[2], q[1], q[0]])
        .collect();
    cache.put_color_table(id, Palette::from_rgb_triples(&rgb));
    Ok(())
}

fn fontcache(s: &mut PacketBuffer, cache: &mut dyn GraphicsCache) -> Result<()> {
    let font = s.read_u8()?;
    let count = s.read_u8()?;
    for _ in 0..count {
        let character = s.read_u16_le()?;
        let offset = s.read_u16_le()? as i16;
        let baseline = s.read_u16_le()? as i16;
        let width = s.read_u16_le()?;
        let height = s.read_u16_le()?;
        let size = (height as usize * (width as usize).div_ceil(8) + 3) & !3;
        let data = s.read_vec(size)?;
        cache.put_glyph(
            font,
            character,
            Glyph {
                offset,
                baseline,
                width,
                height,
                data,
            },
        );
    }
    debug!(font, count, "glyphs cached");
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn secondary(kind: u8, flags: u16, body: &[u8]) -> PacketBuffer {
        let mut v = ((body.len() as i16 - 7) as u16).to_le_bytes().to_vec();
        v.extend_from_slice(&flags.to_le_bytes());
        v.push(kind);
        v.extend_from_slice(body);
        v.push(0xEE); // next order
        PacketBuffer::from_vec(v)
    }

    #[test]
    fn raw_bitmap_cache_lands_top_down() {
        let mut cache = MemoryCache::new();
        let body = [1, 0, 2, 2, 8, 4, 0, 9, 0, 1, 2, 3, 4];
        let mut s = secondary(RAW_BMPCACHE, 0, &body);
        process(&mut s, &mut cache, ColorDepth::Bpp8).unwrap();
        assert_eq!(cache.bitmap(1, 9).unwrap().pixels, vec![3, 4, 1, 2]);
        assert_eq!(s.read_u8().unwrap(), 0xEE);
    }

    #[test]
    fn compressed_cache_without_header() {
        let mut cache = MemoryCache::new();
        // 2x1 of colour 6: COLOR opcode 3 with count 2
        let body = [0, 0, 2, 1, 8, 2, 0, 4, 0, 0x62, 6];
        let mut s = secondary(BMPCACHE, NO_BITMAP_COMPRESSION_HDR, &body);
        process(&mut s, &mut cache, ColorDepth::Bpp8).unwrap();
        assert_eq!(cache.bitmap(0, 4).unwrap().pixels, vec![6, 6]);
    }

    #[test]
    fn compressed_cache_with_header() {
        let mut cache = MemoryCache::new();
        let body = [0, 0, 2, 1, 8, 10, 0, 4, 0, 0, 0, 2, 0, 2, 0, 2, 0, 0x62, 6];
        let mut s = secondary(BMPCACHE, 0, &body);
        process(&mut s, &mut cache, ColorDepth::Bpp8).unwrap();
        assert_eq!(cache.bitmap(0, 4).unwrap().pixels, vec![6, 6]);
    }

    #[test]
    fn bitmap_cache_v2_long_index_and_square() {
        let mut cache = MemoryCache::new();
        let flags = 2 | (3 << BMPCACHE2_MODE_SHIFT) | BMPCACHE2_SQUARE;
        let body = [2, 0x00, 0x04, 0x81, 0x02, 1, 2, 3, 4];
        let mut s = secondary(RAW_BMPCACHE2, flags, &body);
        process(&mut s, &mut cache, ColorDepth::Bpp8).unwrap();
        assert_eq!(cache.bitmap(2, 0x102).unwrap().pixels, vec![3, 4, 1, 2]);
    }

    #[test]
    fn colour_table_is_bgr() {
        let mut cache = MemoryCache::new();
        let body = [3, 1, 0, 0x11, 0x22, 0x33, 0];
        let mut s = secondary(COLCACHE, 0, &body);
        process(&mut s, &mut cache, ColorDepth::Bpp8).unwrap();
        assert_eq!(cache.color_table(3).unwrap().lookup(0), 0x332211);
    }

    #[test]
    fn font_cache_pads_glyph_data() {
        let mut cache = MemoryCache::new();
        let mut body = vec![4, 1, 0x41, 0, 0, 0, 0xFE, 0xFF, 3, 0, 2, 0];
        body.extend_from_slice(&[0xE0, 0xA0, 0, 0]);
        let mut s = secondary(FONTCACHE, 0, &body);
        process(&mut s, &mut cache, ColorDepth::Bpp8).unwrap();
        let g = cache.glyph(4, 0x41).unwrap();
        assert_eq!(g.baseline, -2);
        assert!(g.is_set(2, 1));
        assert!(!g.is_set(1, 1));
    }

    #[test]
    fn unknown_kind_is_skipped() {
        let mut cache = MemoryCache::new();
        let mut s = secondary(7, 0, &[1, 2, 3]);
        process(&mut s, &mut cache, ColorDepth::Bpp8).unwrap();
        assert_eq!(s.read_u8().unwrap(), 0xEE);
    }
}
