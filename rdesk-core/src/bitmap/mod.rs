//! Bitmaps and the pixel sinks the RLE decoder writes into.

pub mod rle;

use crate::color::ColorDepth;
use crate::error::{RdpError, Result};
use crate::framebuffer::{Framebuffer, Rect};

// ── PixelSink ────────────────────────────────────────────────────

/// A `width`-addressed pixel target the decoder reads back and writes.
///
/// `y` is a top-down row index inside the bitmap being decoded.
pub trait PixelSink {
    fn get(&self, x: usize, y: usize) -> u32;
    fn put(&mut self, x: usize, y: usize, value: u32);
}

/// Row-major `u32` array.
pub struct FlatSink<'a> {
    data: &'a mut [u32],
    width: usize,
}

impl<'a> FlatSink<'a> {
    pub fn new(data: &'a mut [u32], width: usize) -> Self {
        Self { data, width }
    }
}

impl PixelSink for FlatSink<'_> {
    fn get(&self, x: usize, y: usize) -> u32 {
        self.data.get(y * self.width + x).copied().unwrap_or(0)
    }

    fn put(&mut self, x: usize, y: usize, value: u32) {
        if let Some(p) = self.data.get_mut(y * self.width + x) {
            *p = value;
        }
    }
}

/// Direct writes into a framebuffer block at `(left, top)`.
///
/// Only valid when the whole block is visible and the wire depth needs
/// no conversion, because the decoder reads back what it wrote.
pub struct FramebufferSink<'a> {
    pixels: &'a mut [u32],
    stride: usize,
    left: usize,
    top: usize,
}

impl<'a> FramebufferSink<'a> {
    /// `None` if the block does not fit entirely inside the surface
    /// or the depth would need per-pixel conversion.
    pub fn new(fb: &'a mut Framebuffer, rect: Rect) -> Option<Self> {
        let fits = rect.x >= 0
            && rect.y >= 0
            && rect.right() <= fb.width()
            && rect.bottom() <= fb.height()
            && !rect.is_empty();
        let direct = matches!(fb.depth(), ColorDepth::Bpp8 | ColorDepth::Bpp24);
        if !(fits && direct) {
            return None;
        }
        let stride = fb.width() as usize;
        Some(Self {
            pixels: fb.raw_mut(),
            stride,
            left: rect.x as usize,
            top: rect.y as usize,
        })
    }
}

impl PixelSink for FramebufferSink<'_> {
    fn get(&self, x: usize, y: usize) -> u32 {
        let i = (self.top + y) * self.stride + self.left + x;
        self.pixels.get(i).copied().unwrap_or(0)
    }

    fn put(&mut self, x: usize, y: usize, value: u32) {
        let i = (self.top + y) * self.stride + self.left + x;
        if let Some(p) = self.pixels.get_mut(i) {
            *p = value;
        }
    }
}

// ── Bitmap ───────────────────────────────────────────────────────

/// A decoded rectangle of framebuffer-ready pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u32>,
}

impl Bitmap {
    pub fn new(width: u16, height: u16, pixels: Vec<u32>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Uncompressed wire data: bottom-up rows of little-endian pixels.
    pub fn from_raw(data: &[u8], width: u16, height: u16, depth: ColorDepth) -> Result<Self> {
        let bpp = depth.bytes_per_pixel();
        let (w, h) = (width as usize, height as usize);
        let row_len = w * bpp;
        if data.len() < row_len * h {
            return Err(RdpError::Overrun {
                needed: row_len * h,
                available: data.len(),
            });
        }
        let mut pixels = vec![0u32; w * h];
        for y in 0..h {
            let src = &data[(h - 1 - y) * row_len..(h - y) * row_len];
            for (x, px) in src.chunks_exact(bpp).enumerate() {
                let native = px
                    .iter()
                    .enumerate()
                    .fold(0u32, |acc, (i, &b)| acc | (b as u32) << (8 * i));
                pixels[y * w + x] = depth.to_framebuffer(native);
            }
        }
        Ok(Self::new(width, height, pixels))
    }

    /// RLE-compressed wire data, converted to framebuffer values.
    pub fn decompress(data: &[u8], width: u16, height: u16, depth: ColorDepth) -> Result<Self> {
        let mut pixels = rle::decompress_to_vec(
            width as usize,
            height as usize,
            data,
            depth.bytes_per_pixel(),
        )?;
        if matches!(depth, ColorDepth::Bpp15 | ColorDepth::Bpp16) {
            for p in &mut pixels {
                *p = depth.to_framebuffer(*p);
            }
        }
        Ok(Self::new(width, height, pixels))
    }

    pub fn get(&self, x: usize, y: usize) -> u32 {
        self.pixels
            .get(y * self.width as usize + x)
            .copied()
            .unwrap_or(0)
    }
}

// ── Tests ────────────────────────────────────────────────────────
