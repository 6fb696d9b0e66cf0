//! Glyph index (text) order rendering.
//!
//! The text field is a run of glyph indices, each optionally followed by
//! a pen advance, interleaved with two escape bytes: `0xFF` stores the
//! run so far as a text fragment and `0xFE` replays a stored fragment.

use tracing::warn;

use crate::cache::GraphicsCache;
use crate::error::Result;
use crate::framebuffer::Framebuffer;

use super::state::Text2;

pub const TEXT2_VERTICAL: u8 = 0x04;
pub const TEXT2_IMPLICIT_X: u8 = 0x20;

pub const MIX_TRANSPARENT: u8 = 0;
pub const MIX_OPAQUE: u8 = 1;

const ADD_FRAGMENT: u8 = 0xFF;
const USE_FRAGMENT: u8 = 0xFE;

/// Running pen position and everything needed to stamp glyphs.
struct Pen<'a> {
    fb: &'a mut Framebuffer,
    cache: &'a dyn GraphicsCache,
    font: u8,
    flags: u8,
    color: u32,
    x: i32,
    y: i32,
}

impl Pen<'_> {
    fn advance(&mut self, by: i32) {
        if self.flags & TEXT2_VERTICAL != 0 {
            self.y += by;
        } else {
            self.x += by;
        }
    }

    /// Draw the glyph at `run[i]`, returning the index after it and its
    /// pen advance bytes.
    fn glyph(&mut self, run: &[u8], i: usize) -> usize {
        let mut i = i;
        let character = run[i] as u16;
        if self.flags & TEXT2_IMPLICIT_X == 0 {
            i += 1;
            let offset = run.get(i).copied().unwrap_or(0);
            if offset & 0x80 != 0 {
                let lo = run.get(i + 1).copied().unwrap_or(0) as i32;
                let hi = run.get(i + 2).copied().unwrap_or(0) as i32;
                self.advance(lo | (hi << 8));
                i += 2;
            } else {
                self.advance(offset as i32);
            }
        }

        let Some(glyph) = self.cache.glyph(self.font, character) else {
            return i + 1;
        };
        let x1 = self.x + glyph.offset as i32;
        let y1 = self.y + glyph.baseline as i32;
        for gy in 0..glyph.height as usize {
            for gx in 0..glyph.width as usize {
                if glyph.is_set(gx, gy) {
                    self.fb.set_pixel(x1 + gx as i32, y1 + gy as i32, self.color);
                }
            }
        }
        if self.flags & TEXT2_IMPLICIT_X != 0 {
            self.x += glyph.width as i32;
        }
        i + 1
    }
}

/// Draw a glyph index order.
///
/// Text fragments are stored in `cache` while the run is walked, so the
/// cache is borrowed mutably only between glyph stamps.
pub fn draw_text(fb: &mut Framebuffer, cache: &mut dyn GraphicsCache, os: &Text2) -> Result<()> {
    let depth = fb.depth();
    let fg = depth.order_color(os.fg_color);
    let bg = depth.order_color(os.bg_color);

    let (box_x, box_y) = (os.box_left as i32, os.box_top as i32);
    let mut box_cx = os.box_right as i32 - box_x;
    let box_cy = os.box_bottom as i32 - box_y;
    if box_x + box_cx > fb.width() {
        box_cx = fb.width() - box_x;
    }
    if box_cx > 1 {
        fb.fill_rect(box_x, box_y, box_cx, box_cy, bg);
    } else if os.mix_mode == MIX_OPAQUE {
        let (clip_x, clip_y) = (os.clip_left as i32, os.clip_top as i32);
        fb.fill_rect(
            clip_x,
            clip_y,
            os.clip_right as i32 - clip_x,
            os.clip_bottom as i32 - clip_y,
            bg,
        );
    }

    let (mut x, mut y) = (os.x as i32, os.y as i32);
    let mut run: &[u8] = &os.text;
    let mut i = 0usize;
    while i < run.len() {
        match run[i] {
            ADD_FRAGMENT => {
                if i + 3 > run.len() {
                    warn!("truncated text fragment definition");
                    break;
                }
                let len = (run[i + 2] as usize).min(run.len());
                cache.put_text(run[i + 1], run[..len].to_vec());
                run = &run[i + 3..];
                i = 0;
            }
            USE_FRAGMENT => {
                if i + 2 > run.len() {
                    warn!("truncated text fragment reference");
                    break;
                }
                let fragment = cache.text(run[i + 1]).map(<[u8]>::to_vec);
                let has_advance = i + 2 < run.len();
                if let Some(fragment) = fragment {
                    let mut pen = Pen {
                        fb: &mut *fb,
                        cache: &*cache,
                        font: os.font,
                        flags: os.flags,
                        color: fg,
                        x,
                        y,
                    };
                    if fragment.get(1) == Some(&0) && os.flags & TEXT2_IMPLICIT_X == 0 && has_advance {
                        pen.advance(run[i + 2] as i32);
                    }
                    let mut j = 0;
                    while j < fragment.len() {
                        j = pen.glyph(&fragment, j);
                    }
                    (x, y) = (pen.x, pen.y);
                }
                run = &run[if has_advance { i + 3 } else { i + 2 }..];
                i = 0;
            }
            _ => {
                let mut pen = Pen {
                    fb: &mut *fb,
                    cache: &*cache,
                    font: os.font,
                    flags: os.flags,
                    color: fg,
                    x,
                    y,
                };
                i = pen.glyph(run, i);
                (x, y) = (pen.x, pen.y);
            }
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Glyph, MemoryCache};
    use crate::color::ColorDepth;

    fn dot() -> Glyph {
        Glyph {
            offset: 0,
            baseline: 0,
            width: 1,
            height: 1,
            data: vec![0x80],
        }
    }

    fn setup() -> (Framebuffer, MemoryCache) {
        let mut cache = MemoryCache::new();
        cache.put_glyph(0, b'a' as u16, dot());
        (Framebuffer::new(32, 8, ColorDepth::Bpp8), cache)
    }

    fn order(text: &[u8], flags: u8) -> Text2 {
        Text2 {
            flags,
            fg_color: 5,
            x: 1,
            y: 2,
            text: text.to_vec(),
            ..Text2::default()
        }
    }

    #[test]
    fn explicit_advances_move_the_pen() {
        let (mut fb, mut cache) = setup();
        draw_text(&mut fb, &mut cache, &order(&[b'a', 0, b'a', 3], 0)).unwrap();
        assert_eq!(fb.get_pixel(1, 2), 5);
        assert_eq!(fb.get_pixel(4, 2), 5);
        assert_eq!(fb.get_pixel(2, 2), 0);
    }

    #[test]
    fn implicit_advance_uses_glyph_width() {
        let (mut fb, mut cache) = setup();
        draw_text(&mut fb, &mut cache, &order(&[b'a', b'a'], TEXT2_IMPLICIT_X)).unwrap();
        assert_eq!(fb.get_pixel(1, 2), 5);
        assert_eq!(fb.get_pixel(2, 2), 5);
    }

    #[test]
    fn fragments_are_stored_and_replayed() {
        let (mut fb, mut cache) = setup();
        // "a a" stored as fragment 7, then replayed 10 pixels further on
        let text = [b'a', 0, b'a', 2, 0xFF, 7, 4, 0xFE, 7, 10];
        draw_text(&mut fb, &mut cache, &order(&text, 0)).unwrap();
        assert_eq!(cache.text(7).unwrap(), &[b'a', 0, b'a', 2]);
        assert_eq!(fb.get_pixel(1, 2), 5);
        assert_eq!(fb.get_pixel(3, 2), 5);
        assert_eq!(fb.get_pixel(13, 2), 5);
        assert_eq!(fb.get_pixel(15, 2), 5);
    }

    #[test]
    fn opaque_background_box() {
        let (mut fb, mut cache) = setup();
        let mut os = order(&[], 0);
        os.bg_color = 9;
        os.box_left = 0;
        os.box_right = 4;
        os.box_bottom = 2;
        draw_text(&mut fb, &mut cache, &os).unwrap();
        assert_eq!(fb.get_pixel(3, 1), 9);
        assert_eq!(fb.get_pixel(4, 1), 0);
    }
}
