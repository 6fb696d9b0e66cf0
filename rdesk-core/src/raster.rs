//! The sixteen binary raster operations.
//!
//! Opcodes follow the two-operand ROP2 numbering: 0 is `clear`, 12 is
//! `copy`, 15 is `set`. Every result is masked to the framebuffer depth.

use crate::framebuffer::Framebuffer;

// ── Rop2 ─────────────────────────────────────────────────────────

/// Binary raster operation combining a source and a destination pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Rop2 {
    Clear = 0,
    Nor = 1,
    AndInverted = 2,
    CopyInverted = 3,
    AndReverse = 4,
    Invert = 5,
    Xor = 6,
    Nand = 7,
    And = 8,
    Equiv = 9,
    Noop = 10,
    OrInverted = 11,
    Copy = 12,
    OrReverse = 13,
    Or = 14,
    Set = 15,
}

impl Rop2 {
    /// Decode the low nibble of an opcode.
    pub fn from_u8(op: u8) -> Self {
        match op & 0x0F {
            0 => Rop2::Clear,
            1 => Rop2::Nor,
            2 => Rop2::AndInverted,
            3 => Rop2::CopyInverted,
            4 => Rop2::AndReverse,
            5 => Rop2::Invert,
            6 => Rop2::Xor,
            7 => Rop2::Nand,
            8 => Rop2::And,
            9 => Rop2::Equiv,
            10 => Rop2::Noop,
            11 => Rop2::OrInverted,
            12 => Rop2::Copy,
            13 => Rop2::OrReverse,
            14 => Rop2::Or,
            _ => Rop2::Set,
        }
    }

    /// ROP2 for a ternary opcode whose pattern operand is unused.
    pub fn from_rop3_source(rop3: u8) -> Self {
        Rop2::from_u8(rop3 & 0x0F)
    }

    /// ROP2 for a ternary opcode whose source operand is unused.
    pub fn from_rop3_pattern(rop3: u8) -> Self {
        Rop2::from_u8((rop3 & 3) | ((rop3 & 0x30) >> 2))
    }

    /// Combine `src` with `dst`, masked to `mask`.
    pub fn apply(self, dst: u32, src: u32, mask: u32) -> u32 {
        let v = match self {
            Rop2::Clear => 0,
            Rop2::Nor => !(dst | src),
            Rop2::AndInverted => dst & !src,
            Rop2::CopyInverted => !src,
            Rop2::AndReverse => src & !dst,
            Rop2::Invert => !dst,
            Rop2::Xor => dst ^ src,
            Rop2::Nand => !(dst & src),
            Rop2::And => dst & src,
            Rop2::Equiv => !(dst ^ src),
            Rop2::Noop => dst,
            Rop2::OrInverted => dst | !src,
            Rop2::Copy => src,
            Rop2::OrReverse => src | !dst,
            Rop2::Or => dst | src,
            Rop2::Set => mask,
        };
        v & mask
    }
}

// ── Source ───────────────────────────────────────────────────────

/// Where a region operation reads its source pixels from.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// A row-major pixel array `width` pixels wide, read at `(x, y)`.
    Pixels {
        data: &'a [u32],
        width: i32,
        x: i32,
        y: i32,
    },
    /// The framebuffer itself at `(x, y)`, read before any write.
    Screen { x: i32, y: i32 },
    /// One colour for every pixel.
    Solid(u32),
}

// ── Engine ───────────────────────────────────────────────────────

/// Apply `op` to one clipped framebuffer pixel.
pub fn apply_pixel(op: Rop2, fb: &mut Framebuffer, x: i32, y: i32, color: u32) {
    match op {
        Rop2::Copy => fb.set_pixel(x, y, color),
        Rop2::Noop => {}
        _ => {
            let dst = fb.get_pixel(x, y);
            fb.set_pixel(x, y, op.apply(dst, color, fb.mask()));
        }
    }
}

/// Apply `op` over a destination rectangle, clipped to the framebuffer.
///
/// With no source the destination is combined with itself, which only
/// matters for the operations that ignore the source anyway.
pub fn apply_region(
    op: Rop2,
    fb: &mut Framebuffer,
    x: i32,
    y: i32,
    cx: i32,
    cy: i32,
    src: Option<Source<'_>>,
) {
    let Some(c) = fb.clip_rect(x, y, cx, cy) else {
        return;
    };
    let mask = fb.mask();

    let source: Vec<u32> = match src {
        None => fb.get_block(c.x, c.y, c.cx, c.cy),
        Some(Source::Screen { x: sx, y: sy }) => {
            fb.get_block(sx + c.src_dx, sy + c.src_dy, c.cx, c.cy)
        }
        Some(Source::Pixels {
            data,
            width,
            x: sx,
            y: sy,
        }) => {
            let mut out = Vec::with_capacity((c.cx * c.cy) as usize);
            for row in 0..c.cy {
                for col in 0..c.cx {
                    // Columns past the source width read as zero, not as the next row.
                    let px = sx + c.src_dx + col;
                    if px < 0 || px >= width {
                        out.push(0);
                        continue;
                    }
                    let i = (sy + c.src_dy + row) * width + px;
                    out.push(
                        usize::try_from(i)
                            .ok()
                            .and_then(|i| data.get(i))
                            .copied()
                            .unwrap_or(0),
                    );
                }
            }
            out
        }
        Some(Source::Solid(color)) => vec![color; (c.cx * c.cy) as usize],
    };

    let result: Vec<u32> = if op == Rop2::Copy {
        source
    } else {
        let dst = fb.get_block(c.x, c.y, c.cx, c.cy);
        dst.iter()
            .zip(&source)
            .map(|(&d, &s)| op.apply(d, s, mask))
            .collect()
    };
    fb.put_block(c.x, c.y, c.cx, c.cy, &result, c.cx, 0, 0);
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorDepth;
    use crate::framebuffer::Rect;

    fn reference(op: u8, d: u32, s: u32, mask: u32) -> u32 {
        // Bit `(src << 1) | dst` of the opcode is the result bit.
        let mut out = 0;
        for bit in 0..32 {
            let db = (d >> bit) & 1;
            let sb = (s >> bit) & 1;
            let idx = (sb << 1) | db;
            out |= ((op as u32 >> idx) & 1) << bit;
        }
        out & mask
    }

    #[test]
    fn every_opcode_matches_truth_table() {
        for depth in [ColorDepth::Bpp8, ColorDepth::Bpp24] {
            let mask = depth.mask();
            let values = [0, mask, 0x5A3C96 & mask];
            for op in 0u8..16 {
                for &d in &values {
                    for &s in &values {
                        let mut fb = Framebuffer::new(2, 2, depth);
                        fb.set_pixel(1, 1, d);
                        apply_pixel(Rop2::from_u8(op), &mut fb, 1, 1, s);
                        assert_eq!(
                            fb.get_pixel(1, 1),
                            reference(op, d, s, mask),
                            "op {op} dst {d:#x} src {s:#x}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn rop3_reductions() {
        assert_eq!(Rop2::from_rop3_source(0xCC), Rop2::Copy);
        assert_eq!(Rop2::from_rop3_source(0x66), Rop2::Xor);
        assert_eq!(Rop2::from_rop3_pattern(0xF0), Rop2::Copy);
        assert_eq!(Rop2::from_rop3_pattern(0x5A), Rop2::Xor);
        assert_eq!(Rop2::from_rop3_pattern(0x55), Rop2::Invert);
    }

    #[test]
    fn region_with_pixel_source_is_clipped_and_offset() {
        let mut fb = Framebuffer::new(4, 4, ColorDepth::Bpp24);
        fb.set_clip(1, 1, 3, 3);
        let src: Vec<u32> = (1..=16).collect();
        apply_region(
            Rop2::Copy,
            &mut fb,
            0,
            0,
            4,
            4,
            Some(Source::Pixels {
                data: &src,
                width: 4,
                x: 0,
                y: 0,
            }),
        );
        assert_eq!(fb.get_pixel(0, 0), 0);
        assert_eq!(fb.get_pixel(1, 1), 6);
        assert_eq!(fb.get_pixel(3, 3), 16);
        assert_eq!(fb.take_dirty(), Some(Rect::new(1, 1, 3, 3)));
    }

    #[test]
    fn source_columns_past_width_read_zero() {
        let mut fb = Framebuffer::new(4, 2, ColorDepth::Bpp8);
        // A 2x2 source drawn 3 wide.
        let src = [1, 2, 3, 4];
        apply_region(
            Rop2::Copy,
            &mut fb,
            0,
            0,
            3,
            2,
            Some(Source::Pixels {
                data: &src,
                width: 2,
                x: 0,
                y: 0,
            }),
        );
        assert_eq!(fb.get_pixel(1, 0), 2);
        assert_eq!(fb.get_pixel(2, 0), 0);
        assert_eq!(fb.get_pixel(0, 1), 3);
        assert_eq!(fb.get_pixel(2, 1), 0);
    }

    #[test]
    fn region_without_source_uses_destination() {
        let mut fb = Framebuffer::new(2, 1, ColorDepth::Bpp8);
        fb.fill_rect(0, 0, 2, 1, 0x0F);
        apply_region(Rop2::Invert, &mut fb, 0, 0, 2, 1, None);
        assert_eq!(fb.get_block(0, 0, 2, 1), vec![0xF0, 0xF0]);
        apply_region(Rop2::Xor, &mut fb, 0, 0, 2, 1, None);
        assert_eq!(fb.get_block(0, 0, 2, 1), vec![0, 0]);
    }

    #[test]
    fn screen_source_reads_before_writing() {
        let mut fb = Framebuffer::new(3, 1, ColorDepth::Bpp24);
        fb.set_pixel(0, 0, 1);
        fb.set_pixel(1, 0, 2);
        apply_region(
            Rop2::Or,
            &mut fb,
            1,
            0,
            2,
            1,
            Some(Source::Screen { x: 0, y: 0 }),
        );
        assert_eq!(fb.get_block(0, 0, 3, 1), vec![1, 3, 2]);
    }
}
