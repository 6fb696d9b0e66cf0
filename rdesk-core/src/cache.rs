//! Server-populated graphics caches.
//!
//! The order layer fills these through secondary orders and reads them
//! back when a primary order refers to an entry by index. Eviction is the
//! server's business: it always overwrites slots explicitly.

use std::collections::HashMap;

use tracing::warn;

use crate::bitmap::Bitmap;
use crate::color::Palette;

/// Pixels held by the desktop save/restore cache.
pub const DESKTOP_CACHE_PIXELS: usize = 0x38400;

// ── Cached objects ───────────────────────────────────────────────

/// A 1 bpp glyph; rows are padded to whole bytes, MSB first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glyph {
    pub offset: i16,
    pub baseline: i16,
    pub width: u16,
    pub height: u16,
    pub data: Vec<u8>,
}

impl Glyph {
    /// Whether the pixel at `(x, y)` is set.
    pub fn is_set(&self, x: usize, y: usize) -> bool {
        let row_bytes = (self.width as usize).div_ceil(8);
        self.data
            .get(y * row_bytes + x / 8)
            .is_some_and(|b| b & (0x80 >> (x % 8)) != 0)
    }
}

/// A pointer shape with its hotspot, ready for the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub hotspot_x: u16,
    pub hotspot_y: u16,
    pub width: u16,
    pub height: u16,
    /// Top-down `0xAARRGGBB` pixels.
    pub argb: Vec<u32>,
}

// ── GraphicsCache ────────────────────────────────────────────────

/// Keyed storage for everything the server asks the client to remember.
pub trait GraphicsCache: Send {
    fn bitmap(&self, cache_id: u8, index: u16) -> Option<&Bitmap>;
    fn put_bitmap(&mut self, cache_id: u8, index: u16, bitmap: Bitmap);

    fn glyph(&self, font: u8, character: u16) -> Option<&Glyph>;
    fn put_glyph(&mut self, font: u8, character: u16, glyph: Glyph);

    /// Raw glyph-run bytes of a cached text fragment.
    fn text(&self, index: u8) -> Option<&[u8]>;
    fn put_text(&mut self, index: u8, run: Vec<u8>);

    fn cursor(&self, index: u16) -> Option<&Cursor>;
    fn put_cursor(&mut self, index: u16, cursor: Cursor);

    fn color_table(&self, id: u8) -> Option<&Palette>;
    fn put_color_table(&mut self, id: u8, palette: Palette);

    /// `cx * cy` pixels starting at pixel `offset` of the desktop cache.
    fn desktop(&self, offset: usize, cx: usize, cy: usize) -> Option<&[u32]>;
    fn put_desktop(&mut self, offset: usize, cx: usize, cy: usize, pixels: &[u32]);
}

// ── MemoryCache ──────────────────────────────────────────────────

/// In-memory [`GraphicsCache`] with no eviction of its own.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    bitmaps: HashMap<(u8, u16), Bitmap>,
    glyphs: HashMap<(u8, u16), Glyph>,
    texts: HashMap<u8, Vec<u8>>,
    cursors: HashMap<u16, Cursor>,
    color_tables: HashMap<u8, Palette>,
    desktop: Vec<u32>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            bitmaps: HashMap::new(),
            glyphs: HashMap::new(),
            texts: HashMap::new(),
            cursors: HashMap::new(),
            color_tables: HashMap::new(),
            desktop: vec![0; DESKTOP_CACHE_PIXELS],
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Pixels of the desktop save area covered by a `cx` by `cy` block at `offset`.
pub fn desktop_range(offset: usize, cx: usize, cy: usize) -> Option<std::ops::Range<usize>> {
    let end = offset.checked_add(cx.checked_mul(cy)?)?;
    (end <= DESKTOP_CACHE_PIXELS).then_some(offset..end)
}

impl GraphicsCache for MemoryCache {
    fn bitmap(&self, cache_id: u8, index: u16) -> Option<&Bitmap> {
        self.bitmaps.get(&(cache_id, index))
    }

    fn put_bitmap(&mut self, cache_id: u8, index: u16, bitmap: Bitmap) {
        self.bitmaps.insert((cache_id, index), bitmap);
    }

    fn glyph(&self, font: u8, character: u16) -> Option<&Glyph> {
        self.glyphs.get(&(font, character))
    }

    fn put_glyph(&mut self, font: u8, character: u16, glyph: Glyph) {
        self.glyphs.insert((font, character), glyph);
    }

    fn text(&self, index: u8) -> Option<&[u8]> {
        self.texts.get(&index).map(Vec::as_slice)
    }

    fn put_text(&mut self, index: u8, run: Vec<u8>) {
        self.texts.insert(index, run);
    }

    fn cursor(&self, index: u16) -> Option<&Cursor> {
        self.cursors.get(&index)
    }

    fn put_cursor(&mut self, index: u16, cursor: Cursor) {
        self.cursors.insert(index, cursor);
    }

    fn color_table(&self, id: u8) -> Option<&Palette> {
        self.color_tables.get(&id)
    }

    fn put_color_table(&mut self, id: u8, palette: Palette) {
        self.color_tables.insert(id, palette);
    }

    fn desktop(&self, offset: usize, cx: usize, cy: usize) -> Option<&[u32]> {
        match desktop_range(offset, cx, cy) {
            Some(r) => Some(&self.desktop[r]),
            None => {
                warn!(offset, cx, cy, "desktop cache read out of range");
                None
            }
        }
    }

    fn put_desktop(&mut self, offset: usize, cx: usize, cy: usize, pixels: &[u32]) {
        match desktop_range(offset, cx, cy) {
            Some(r) if pixels.len() >= r.len() => {
                let n = r.len();
                self.desktop[r].copy_from_slice(&pixels[..n]);
            }
            _ => warn!(offset, cx, cy, "desktop cache write out of range"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
