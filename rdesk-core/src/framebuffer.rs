//! The pixel surface every decoder and order handler writes into.
//!
//! The session task is the only mutator. The shell gets copies through
//! [`Framebuffer::snapshot`] and learns what changed from the dirty
//! region collected since the last [`Framebuffer::take_dirty`].

use crate::color::{ColorDepth, Palette};

// ── Rect ─────────────────────────────────────────────────────────

/// Axis-aligned rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }
}

// ── Clip ─────────────────────────────────────────────────────────

/// Clip bounds with inclusive right and bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Result of clipping a destination rectangle.
///
/// `src_dx`/`src_dy` are how far the top-left corner moved, so a source
/// rectangle can be offset by the same amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clipped {
    pub x: i32,
    pub y: i32,
    pub cx: i32,
    pub cy: i32,
    pub src_dx: i32,
    pub src_dy: i32,
}

// ── RegionSnapshot ───────────────────────────────────────────────

/// A copied block of `0x00RRGGBB` pixels for the shell to paint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSnapshot {
    pub rect: Rect,
    pub pixels: Vec<u32>,
}

// ── Framebuffer ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Framebuffer {
    width: i32,
    height: i32,
    depth: ColorDepth,
    pixels: Vec<u32>,
    clip: Bounds,
    palette: Palette,
    dirty: Option<Rect>,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16, depth: ColorDepth) -> Self {
        let (w, h) = (width as i32, height as i32);
        Self {
            width: w,
            height: h,
            depth,
            pixels: vec![0; (w * h) as usize],
            clip: Self::full_bounds(w, h),
            palette: Palette::default(),
            dirty: None,
        }
    }

    fn full_bounds(width: i32, height: i32) -> Bounds {
        Bounds {
            left: 0,
            top: 0,
            right: width - 1,
            bottom: height - 1,
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn depth(&self) -> ColorDepth {
        self.depth
    }

    pub fn mask(&self) -> u32 {
        self.depth.mask()
    }

    /// Reallocate for new geometry or depth; contents are cleared.
    pub fn resize(&mut self, width: u16, height: u16, depth: ColorDepth) {
        *self = Framebuffer {
            palette: std::mem::take(&mut self.palette),
            ..Framebuffer::new(width, height, depth)
        };
        self.mark_dirty(Rect::new(0, 0, self.width, self.height));
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = palette;
        if self.depth == ColorDepth::Bpp8 {
            self.mark_dirty(Rect::new(0, 0, self.width, self.height));
        }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    // ── Clipping ─────────────────────────────────────────────────

    pub fn clip(&self) -> Bounds {
        self.clip
    }

    /// Set the clip rectangle, intersected with the surface.
    pub fn set_clip(&mut self, left: i32, top: i32, right: i32, bottom: i32) {
        self.clip = Bounds {
            left: left.max(0),
            top: top.max(0),
            right: right.min(self.width - 1),
            bottom: bottom.min(self.height - 1),
        };
    }

    pub fn reset_clip(&mut self) {
        self.clip = Self::full_bounds(self.width, self.height);
    }

    /// Clip `(x, y, cx, cy)` against the current bounds.
    pub fn clip_rect(&self, x: i32, y: i32, cx: i32, cy: i32) -> Option<Clipped> {
        let Bounds {
            left,
            top,
            right,
            bottom,
        } = self.clip;
        let nx = x.max(left);
        let ny = y.max(top);
        let ncx = (x + cx).min(right + 1) - nx;
        let ncy = (y + cy).min(bottom + 1) - ny;
        if ncx <= 0 || ncy <= 0 {
            return None;
        }
        Some(Clipped {
            x: nx,
            y: ny,
            cx: ncx,
            cy: ncy,
            src_dx: nx - x,
            src_dy: ny - y,
        })
    }

    fn in_clip(&self, x: i32, y: i32) -> bool {
        x >= self.clip.left && x <= self.clip.right && y >= self.clip.top && y <= self.clip.bottom
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        (x >= 0 && y >= 0 && x < self.width && y < self.height)
            .then(|| (y * self.width + x) as usize)
    }

    // ── Pixel access ─────────────────────────────────────────────

    /// Pixel at `(x, y)`; zero outside the surface.
    pub fn get_pixel(&self, x: i32, y: i32) -> u32 {
        self.index(x, y).map_or(0, |i| self.pixels[i])
    }

    /// Write one pixel if it lies inside the clip rectangle.
    pub fn set_pixel(&mut self, x: i32, y: i32, color: u32) {
        if !self.in_clip(x, y) {
            return;
        }
        if let Some(i) = self.index(x, y) {
            self.pixels[i] = color & self.mask();
            self.mark_dirty(Rect::new(x, y, 1, 1));
        }
    }

    /// Copy out a block. Pixels outside the surface read as zero.
    ///
    /// Callers bound the block size; a size that overflows `usize`
    /// yields an empty vector.
    pub fn get_block(&self, x: i32, y: i32, cx: i32, cy: i32) -> Vec<u32> {
        let (w, h) = (cx.max(0) as usize, cy.max(0) as usize);
        let Some(len) = w.checked_mul(h) else {
            return Vec::new();
        };
        let mut out = vec![0u32; len];
        // Only the part inside the surface is read.
        let (x, y) = (x as i64, y as i64);
        let cols = x.max(0)..(x + w as i64).min(self.width as i64);
        let rows = y.max(0)..(y + h as i64).min(self.height as i64);
        for row in rows {
            let src = (row * self.width as i64) as usize;
            let dst = (row - y) as usize * w;
            for col in cols.clone() {
                out[dst + (col - x) as usize] = self.pixels[src + col as usize];
            }
        }
        out
    }

    /// Write a block of `src_width`-wide pixels, clipped.
    ///
    /// `(src_x, src_y)` selects the top-left of the block within `src`.
    #[allow(clippy::too_many_arguments)]
    pub fn put_block(
        &mut self,
        x: i32,
        y: i32,
        cx: i32,
        cy: i32,
        src: &[u32],
        src_width: i32,
        src_x: i32,
        src_y: i32,
    ) {
        let Some(c) = self.clip_rect(x, y, cx, cy) else {
            return;
        };
        let mask = self.mask();
        for row in 0..c.cy {
            let sy = src_y + c.src_dy + row;
            for col in 0..c.cx {
                let sx = src_x + c.src_dx + col;
                if sx < 0 || sx >= src_width {
                    continue;
                }
                let Some(&v) = usize::try_from(sy * src_width + sx)
                    .ok()
                    .and_then(|i| src.get(i))
                else {
                    continue;
                };
                let di = ((c.y + row) * self.width + c.x + col) as usize;
                self.pixels[di] = v & mask;
            }
        }
        self.mark_dirty(Rect::new(c.x, c.y, c.cx, c.cy));
    }

    /// Solid fill, clipped.
    pub fn fill_rect(&mut self, x: i32, y: i32, cx: i32, cy: i32, color: u32) {
        let Some(c) = self.clip_rect(x, y, cx, cy) else {
            return;
        };
        let color = color & self.mask();
        for row in c.y..c.y + c.cy {
            let start = (row * self.width + c.x) as usize;
            self.pixels[start..start + c.cx as usize].fill(color);
        }
        self.mark_dirty(Rect::new(c.x, c.y, c.cx, c.cy));
    }

    /// Overlap-safe copy within the surface. Only the destination is clipped.
    pub fn copy_area(&mut self, src_x: i32, src_y: i32, cx: i32, cy: i32, x: i32, y: i32) {
        let Some(c) = self.clip_rect(x, y, cx, cy) else {
            return;
        };
        let block = self.get_block(src_x + c.src_dx, src_y + c.src_dy, c.cx, c.cy);
        self.put_block(c.x, c.y, c.cx, c.cy, &block, c.cx, 0, 0);
    }

    /// Row-major view of the backing store, `width` pixels per row.
    pub fn raw(&self) -> &[u32] {
        &self.pixels
    }

    /// Mutable backing store for decoders writing a fully visible block.
    ///
    /// Callers must report the touched area through [`Self::mark_dirty`].
    pub fn raw_mut(&mut self) -> &mut [u32] {
        &mut self.pixels
    }

    // ── Dirty tracking ───────────────────────────────────────────

    pub fn mark_dirty(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.dirty = Some(match self.dirty {
            Some(d) => d.union(&rect),
            None => rect,
        });
    }

    /// Take the union of everything written since the last call.
    pub fn take_dirty(&mut self) -> Option<Rect> {
        self.dirty.take()
    }

    /// RGB copy of `rect`, resolved through the palette at 8 bpp.
    pub fn snapshot(&self, rect: Rect) -> RegionSnapshot {
        let raw = self.get_block(rect.x, rect.y, rect.width, rect.height);
        let pixels = if self.depth == ColorDepth::Bpp8 {
            raw.into_iter().map(|i| self.palette.lookup(i)).collect()
        } else {
            raw
        };
        RegionSnapshot { rect, pixels }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_right_and_bottom_are_inclusive() {
        let mut fb = Framebuffer::new(10, 10, ColorDepth::Bpp24);
        fb.set_clip(2, 2, 4, 4);
        fb.fill_rect(0, 0, 10, 10, 0xABCDEF);
        assert_eq!(fb.get_pixel(4, 4), 0xABCDEF);
        assert_eq!(fb.get_pixel(5, 4), 0);
        assert_eq!(fb.get_pixel(1, 2), 0);
        assert_eq!(fb.take_dirty(), Some(Rect::new(2, 2, 3, 3)));
    }

    #[test]
    fn clip_rect_reports_source_offset() {
        let mut fb = Framebuffer::new(10, 10, ColorDepth::Bpp8);
        fb.set_clip(3, 1, 9, 9);
        let c = fb.clip_rect(0, 0, 5, 5).unwrap();
        assert_eq!((c.x, c.y, c.cx, c.cy), (3, 1, 2, 4));
        assert_eq!((c.src_dx, c.src_dy), (3, 1));
        assert!(fb.clip_rect(20, 20, 2, 2).is_none());
    }

    #[test]
    fn writes_outside_surface_are_dropped() {
        let mut fb = Framebuffer::new(4, 4, ColorDepth::Bpp8);
        fb.set_pixel(-1, 0, 1);
        fb.set_pixel(4, 0, 1);
        fb.fill_rect(-2, -2, 3, 3, 7);
        assert_eq!(fb.get_pixel(0, 0), 7);
        assert_eq!(fb.get_pixel(1, 1), 0);
    }

    #[test]
    fn put_block_skips_columns_past_source_width() {
        let mut fb = Framebuffer::new(4, 2, ColorDepth::Bpp8);
        fb.fill_rect(0, 0, 4, 2, 5);
        fb.put_block(0, 0, 3, 2, &[1, 2, 3, 4], 2, 0, 0);
        assert_eq!(fb.get_pixel(1, 0), 2);
        assert_eq!(fb.get_pixel(2, 0), 5);
        assert_eq!(fb.get_pixel(0, 1), 3);
        assert_eq!(fb.get_pixel(2, 1), 5);
    }

    #[test]
    fn get_block_reads_only_inside_surface() {
        let mut fb = Framebuffer::new(4, 4, ColorDepth::Bpp8);
        fb.set_pixel(0, 0, 3);
        assert_eq!(fb.get_block(-1, -1, 2, 2), vec![0, 0, 0, 3]);
        // Coordinates near the edge of i32 must not overflow.
        assert_eq!(fb.get_block(i32::MAX - 1, i32::MIN, 4, 1), vec![0; 4]);
    }

    #[test]
    fn values_are_masked_to_depth() {
        let mut fb = Framebuffer::new(2, 2, ColorDepth::Bpp8);
        fb.set_pixel(0, 0, 0x1234);
        assert_eq!(fb.get_pixel(0, 0), 0x34);
    }

    #[test]
    fn copy_area_handles_overlap() {
        let mut fb = Framebuffer::new(4, 1, ColorDepth::Bpp24);
        for x in 0..4 {
            fb.set_pixel(x, 0, x as u32 + 1);
        }
        fb.copy_area(0, 0, 3, 1, 1, 0);
        assert_eq!(fb.get_block(0, 0, 4, 1), vec![1, 1, 2, 3]);
    }

    #[test]
    fn snapshot_resolves_palette() {
        let mut fb = Framebuffer::new(2, 1, ColorDepth::Bpp8);
        fb.set_palette(Palette::from_rgb_triples(&[0, 0, 0, 0x10, 0x20, 0x30]));
        fb.set_pixel(1, 0, 1);
        let snap = fb.snapshot(Rect::new(0, 0, 2, 1));
        assert_eq!(snap.pixels, vec![0, 0x102030]);
    }

    #[test]
    fn dirty_region_is_a_union() {
        let mut fb = Framebuffer::new(10, 10, ColorDepth::Bpp24);
        fb.fill_rect(0, 0, 1, 1, 1);
        fb.fill_rect(5, 5, 2, 2, 1);
        assert_eq!(fb.take_dirty(), Some(Rect::new(0, 0, 7, 7)));
        assert_eq!(fb.take_dirty(), None);
    }
}
