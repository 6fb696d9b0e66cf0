//! Colour depths and pixel value conversion.
//!
//! The framebuffer holds one `u32` per pixel. At 8 bpp the value is a
//! palette index; at every other depth it is packed `0x00RRGGBB`.
//! Values read off the wire at 15 or 16 bpp are widened here before
//! they reach the framebuffer.

use serde::{Deserialize, Serialize};

use crate::error::{RdpError, Result};

// ── ColorDepth ───────────────────────────────────────────────────

/// Negotiated server colour depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ColorDepth {
    /// 8 bpp, palette indexed.
    Bpp8,
    /// 15 bpp, 5-5-5.
    Bpp15,
    /// 16 bpp, 5-6-5.
    #[default]
    Bpp16,
    /// 24 bpp, B-G-R on the wire.
    Bpp24,
}

impl ColorDepth {
    pub fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            8 => Ok(ColorDepth::Bpp8),
            15 => Ok(ColorDepth::Bpp15),
            16 => Ok(ColorDepth::Bpp16),
            24 => Ok(ColorDepth::Bpp24),
            other => Err(RdpError::unsupported(format!("colour depth {other}"))),
        }
    }

    pub const fn bits(self) -> u16 {
        match self {
            ColorDepth::Bpp8 => 8,
            ColorDepth::Bpp15 => 15,
            ColorDepth::Bpp16 => 16,
            ColorDepth::Bpp24 => 24,
        }
    }

    /// Bytes per pixel ("Bpp") of a wire pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            ColorDepth::Bpp8 => 1,
            ColorDepth::Bpp15 | ColorDepth::Bpp16 => 2,
            ColorDepth::Bpp24 => 3,
        }
    }

    /// Mask applied to raster-op results in the framebuffer.
    pub const fn mask(self) -> u32 {
        match self {
            ColorDepth::Bpp8 => 0xFF,
            _ => 0xFF_FFFF,
        }
    }

    /// Largest value a native wire pixel can take (the RLE "white").
    pub const fn native_white(self) -> u32 {
        match self {
            ColorDepth::Bpp8 => 0xFF,
            ColorDepth::Bpp15 | ColorDepth::Bpp16 => 0xFFFF,
            ColorDepth::Bpp24 => 0xFF_FFFF,
        }
    }

    /// Convert a native wire pixel into a framebuffer value.
    pub fn to_framebuffer(self, native: u32) -> u32 {
        match self {
            ColorDepth::Bpp8 => native & 0xFF,
            ColorDepth::Bpp15 => convert15to24(native),
            ColorDepth::Bpp16 => convert16to24(native),
            ColorDepth::Bpp24 => native & 0xFF_FFFF,
        }
    }

    /// Convert a colour field carried inside a drawing order.
    ///
    /// Order colours are sent red first, so at 24 bpp a little-endian
    /// read yields `0xBBGGRR`. The channels are swapped back here so the
    /// framebuffer only ever sees one layout.
    pub fn order_color(self, raw: u32) -> u32 {
        match self {
            ColorDepth::Bpp24 => swap_red_blue(raw),
            other => other.to_framebuffer(raw),
        }
    }
}

impl TryFrom<u16> for ColorDepth {
    type Error = RdpError;

    fn try_from(bits: u16) -> Result<Self> {
        ColorDepth::from_bits(bits)
    }
}

impl From<ColorDepth> for u16 {
    fn from(d: ColorDepth) -> u16 {
        d.bits()
    }
}

// ── Conversion helpers ───────────────────────────────────────────

/// Expand a 5-5-5 pixel to `0x00RRGGBB`, replicating the high bits.
pub fn convert15to24(c: u32) -> u32 {
    let mut r = (c >> 7) & 0xF8;
    let mut g = (c >> 2) & 0xF8;
    let mut b = (c << 3) & 0xFF;
    r |= r >> 5;
    g |= g >> 5;
    b |= b >> 5;
    (r << 16) | (g << 8) | b
}

/// Expand a 5-6-5 pixel to `0x00RRGGBB`. Green has six bits.
pub fn convert16to24(c: u32) -> u32 {
    let mut r = (c >> 8) & 0xF8;
    let mut g = (c >> 3) & 0xFC;
    let mut b = (c << 3) & 0xFF;
    r |= r >> 5;
    g |= g >> 6;
    b |= b >> 5;
    (r << 16) | (g << 8) | b
}

pub fn swap_red_blue(c: u32) -> u32 {
    ((c & 0xFF) << 16) | (c & 0xFF00) | ((c >> 16) & 0xFF)
}

/// `0x00RRGGBB` with an opaque alpha byte.
pub fn to_argb(rgb: u32) -> u32 {
    0xFF00_0000 | (rgb & 0xFF_FFFF)
}

// ── Palette ──────────────────────────────────────────────────────

/// 256-entry palette for 8 bpp sessions, entries in `0x00RRGGBB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    entries: Vec<u32>,
}

impl Palette {
    /// Greyscale ramp used until the server sends a palette update.
    pub fn greyscale() -> Self {
        let entries = (0..256u32).map(|i| (i << 16) | (i << 8) | i).collect();
        Self { entries }
    }

    /// Build from `r, g, b` byte triples.
    pub fn from_rgb_triples(data: &[u8]) -> Self {
        let mut entries: Vec<u32> = data
            .chunks_exact(3)
            .take(256)
            .map(|c| ((c[0] as u32) << 16) | ((c[1] as u32) << 8) | c[2] as u32)
            .collect();
        entries.resize(256, 0);
        Self { entries }
    }

    pub fn lookup(&self, index: u32) -> u32 {
        self.entries.get(index as usize & 0xFF).copied().unwrap_or(0)
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::greyscale()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert15_primaries() {
        assert_eq!(convert15to24(0x7C00), 0xFF0000);
        assert_eq!(convert15to24(0x03E0), 0x00FF00);
        assert_eq!(convert15to24(0x001F), 0x0000FF);
        assert_eq!(convert15to24(0x7FFF), 0xFFFFFF);
        assert_eq!(convert15to24(0), 0);
    }

    #[test]
    fn convert16_primaries() {
        assert_eq!(convert16to24(0xF800), 0xFF0000);
        assert_eq!(convert16to24(0x07E0), 0x00FF00);
        assert_eq!(convert16to24(0x001F), 0x0000FF);
        assert_eq!(convert16to24(0xFFFF), 0xFFFFFF);
        assert_eq!(convert16to24(0), 0);
    }

    #[test]
    fn green_rounding_differs_between_15_and_16() {
        // Lowest green step: five bits vs six bits of precision.
        assert_eq!(convert15to24(0x0020), 0x000800);
        assert_eq!(convert16to24(0x0020), 0x000400);
    }

    #[test]
    fn converted_output_is_stable_under_24bit_passthrough() {
        for c in [0u32, 0x7C00, 0x03E0, 0x001F, 0x7FFF, 0x1234, 0x5A5A] {
            let once = convert15to24(c);
            assert_eq!(ColorDepth::Bpp24.to_framebuffer(once), once);
        }
        for c in [0u32, 0xF800, 0x07E0, 0x001F, 0xFFFF, 0x1234, 0xA5A5] {
            let once = convert16to24(c);
            assert_eq!(ColorDepth::Bpp24.to_framebuffer(once), once);
        }
    }

    #[test]
    fn order_colour_swap_only_at_24bpp() {
        assert_eq!(ColorDepth::Bpp24.order_color(0x0000FF), 0xFF0000);
        assert_eq!(ColorDepth::Bpp8.order_color(0x12), 0x12);
        assert_eq!(ColorDepth::Bpp16.order_color(0xF800), 0xFF0000);
    }

    #[test]
    fn depth_round_trips_bits() {
        for bits in [8u16, 15, 16, 24] {
            assert_eq!(ColorDepth::from_bits(bits).unwrap().bits(), bits);
        }
        assert!(ColorDepth::from_bits(32).is_err());
        assert_eq!(ColorDepth::Bpp8.mask(), 0xFF);
        assert_eq!(ColorDepth::Bpp16.mask(), 0xFFFFFF);
    }

    #[test]
    fn palette_from_triples_pads_to_256() {
        let p = Palette::from_rgb_triples(&[0xFF, 0, 0, 0, 0xFF, 0]);
        assert_eq!(p.lookup(0), 0xFF0000);
        assert_eq!(p.lookup(1), 0x00FF00);
        assert_eq!(p.lookup(200), 0);
    }
}
