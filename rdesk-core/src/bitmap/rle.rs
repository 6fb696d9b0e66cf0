//! Interleaved run-length bitmap decoder.
//!
//! Rows are decoded bottom-up into any [`PixelSink`]. Pixel values stay
//! in the server's native depth so the XOR rules of the mix opcodes see
//! the same bits the encoder did; conversion happens at placement.

use crate::bitmap::PixelSink;
use crate::error::{RdpError, Result};

// ── Opcodes ──────────────────────────────────────────────────────

const FILL: u8 = 0;
const MIX: u8 = 1;
const FILL_OR_MIX: u8 = 2;
const COLOR: u8 = 3;
const COPY: u8 = 4;
const SET_MIX_MIX: u8 = 6;
const SET_MIX_FILL_OR_MIX: u8 = 7;
const BICOLOR: u8 = 8;
const FILL_OR_MIX_1: u8 = 9;
const FILL_OR_MIX_2: u8 = 0x0A;
const WHITE: u8 = 0x0D;
const BLACK: u8 = 0x0E;

// ── Input cursor ─────────────────────────────────────────────────

struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or(RdpError::Overrun {
            needed: 1,
            available: 0,
        })?;
        self.pos += 1;
        Ok(b)
    }

    /// Little-endian colour of `bpp` bytes.
    fn color(&mut self, bpp: usize) -> Result<u32> {
        let mut v = 0u32;
        for i in 0..bpp {
            v |= (self.byte()? as u32) << (8 * i);
        }
        Ok(v)
    }
}

// ── Decoder ──────────────────────────────────────────────────────

/// Decode `input` into a `width` x `height` sink at `bpp` bytes per pixel.
///
/// Fails with a protocol error if the stream needs more rows than the
/// bitmap has, uses an undefined opcode, or ends inside a run header.
pub fn decompress<S: PixelSink + ?Sized>(
    sink: &mut S,
    width: usize,
    height: usize,
    input: &[u8],
    bpp: usize,
) -> Result<()> {
    if !(1..=4).contains(&bpp) {
        return Err(RdpError::protocol(format!("bitmap with {bpp} bytes per pixel")));
    }
    let white = if bpp >= 3 { 0xFF_FFFF } else { (1u32 << (8 * bpp)) - 1 };

    let mut input = Input {
        data: input,
        pos: 0,
    };
    let mut rows_left = height;
    // Output row currently being written and the one decoded before it.
    let mut line: usize = 0;
    let mut prevline: Option<usize> = None;
    let mut started = false;
    let mut x = width;

    let mut last_opcode: Option<u8> = None;
    let mut insert_mix = false;
    let mut bicolor = false;
    let mut color1 = 0u32;
    let mut color2 = 0u32;
    let mut mix = white;
    let mut mask = 0u8;

    while input.has_remaining() {
        let code = input.byte()?;
        let mut fom_mask = 0u8;
        let mut opcode = code >> 4;
        let (mut count, offset): (usize, usize) = match opcode {
            0x0C..=0x0E => {
                opcode -= 6;
                ((code & 0x0F) as usize, 16)
            }
            0x0F => {
                opcode = code & 0x0F;
                let count = if opcode < 9 {
                    let lo = input.byte()? as usize;
                    let hi = input.byte()? as usize;
                    lo | (hi << 8)
                } else if opcode < 0x0B {
                    8
                } else {
                    1
                };
                (count, 0)
            }
            _ => {
                opcode >>= 1;
                ((code & 0x1F) as usize, 32)
            }
        };

        if offset != 0 {
            let is_fill_or_mix = opcode == FILL_OR_MIX || opcode == SET_MIX_FILL_OR_MIX;
            if count == 0 {
                let extra = input.byte()? as usize;
                count = if is_fill_or_mix { extra + 1 } else { extra + offset };
            } else if is_fill_or_mix {
                count <<= 3;
            }
        }

        match opcode {
            FILL => {
                if last_opcode == Some(FILL) && !(x == width && prevline.is_none()) {
                    insert_mix = true;
                }
            }
            BICOLOR => {
                color1 = input.color(bpp)?;
                color2 = input.color(bpp)?;
            }
            COLOR => color2 = input.color(bpp)?,
            SET_MIX_MIX | SET_MIX_FILL_OR_MIX => {
                mix = input.color(bpp)?;
                opcode -= 5;
            }
            FILL_OR_MIX_1 => {
                mask = 0x03;
                opcode = FILL_OR_MIX;
                fom_mask = 3;
            }
            FILL_OR_MIX_2 => {
                mask = 0x05;
                opcode = FILL_OR_MIX;
                fom_mask = 5;
            }
            _ => {}
        }
        last_opcode = Some(opcode);
        let mut mix_mask = 0u8;

        while count > 0 {
            if x >= width {
                if rows_left == 0 {
                    return Err(RdpError::protocol("bitmap data overruns the last row"));
                }
                x = 0;
                rows_left -= 1;
                if started {
                    prevline = Some(line);
                }
                started = true;
                line = rows_left;
            }
            let above = |sink: &S, x: usize| prevline.map(|p| sink.get(x, p));

            match opcode {
                FILL => {
                    if insert_mix {
                        let v = above(sink, x).map_or(mix, |p| p ^ mix);
                        sink.put(x, line, v);
                        insert_mix = false;
                        count -= 1;
                        x += 1;
                        continue;
                    }
                    let v = above(sink, x).unwrap_or(0);
                    sink.put(x, line, v);
                }
                MIX => {
                    let v = above(sink, x).map_or(mix, |p| p ^ mix);
                    sink.put(x, line, v);
                }
                FILL_OR_MIX => {
                    mix_mask <<= 1;
                    if mix_mask == 0 {
                        mask = if fom_mask != 0 { fom_mask } else { input.byte()? };
                        mix_mask = 1;
                    }
                    let p = above(sink, x);
                    let v = if mask & mix_mask != 0 {
                        p.map_or(mix, |p| p ^ mix)
                    } else {
                        p.unwrap_or(0)
                    };
                    sink.put(x, line, v);
                }
                COLOR => sink.put(x, line, color2),
                COPY => {
                    let v = input.color(bpp)?;
                    sink.put(x, line, v);
                }
                BICOLOR => {
                    if bicolor {
                        sink.put(x, line, color2);
                        bicolor = false;
                    } else {
                        sink.put(x, line, color1);
                        bicolor = true;
                        count += 1;
                    }
                }
                WHITE => sink.put(x, line, white),
                BLACK => sink.put(x, line, 0),
                other => {
                    return Err(RdpError::protocol(format!("bitmap opcode {other:#x}")));
                }
            }
            count -= 1;
            x += 1;
        }
    }
    Ok(())
}

/// Decode into a fresh row-major array of `width * height` native pixels.
pub fn decompress_to_vec(width: usize, height: usize, input: &[u8], bpp: usize) -> Result<Vec<u32>> {
    let mut pixels = vec![0u32; width * height];
    let mut sink = crate::bitmap::FlatSink::new(&mut pixels, width);
    decompress(&mut sink, width, height, input, bpp)?;
    Ok(pixels)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pixels: &[u32], width: usize, y: usize) -> &[u32] {
        &pixels[y * width..(y + 1) * width]
    }

    #[test]
    fn solid_colour_run() {
        // COLOR, count 16, colour 0x42.
        let px = decompress_to_vec(4, 4, &[0x70, 0x42], 1).unwrap();
        assert!(px.iter().all(|&p| p == 0x42));
    }

    #[test]
    fn first_row_is_bottom_row() {
        // COPY 4 literal pixels then BLACK for the rest.
        let data = [0x84, 1, 2, 3, 4, 0xFE, 0xFE, 0xFE, 0xFE];
        let px = decompress_to_vec(4, 2, &data, 1).unwrap();
        assert_eq!(row(&px, 4, 1), &[1, 2, 3, 4]);
        assert_eq!(row(&px, 4, 0), &[0, 0, 0, 0]);
    }

    #[test]
    fn fill_copies_row_below_and_mix_xors_it() {
        // Row 0 (bottom): COPY 2. Row 1: MIX 2 with default mix 0xFF.
        let data = [0x82, 0x0F, 0xF0, 0x22];
        let px = decompress_to_vec(2, 2, &data, 1).unwrap();
        assert_eq!(row(&px, 2, 1), &[0x0F, 0xF0]);
        assert_eq!(row(&px, 2, 0), &[0xF0, 0x0F]);
    }

    #[test]
    fn fill_after_fill_inserts_one_mix_pixel() {
        // Bottom row: COPY 4. Then FILL 2, FILL 2 on the next row.
        let data = [0x84, 1, 2, 3, 4, 0x02, 0x02];
        let px = decompress_to_vec(4, 2, &data, 1).unwrap();
        assert_eq!(row(&px, 4, 1), &[1, 2, 3, 4]);
        // The second FILL's first pixel is (above ^ mix).
        assert_eq!(row(&px, 4, 0), &[1, 2, 3 ^ 0xFF, 4]);
    }

    #[test]
    fn fill_after_fill_exempt_only_after_first_row() {
        // Three FILLs of one row each. The second starts right after the
        // first row with no row below yet, so it inserts nothing. The third
        // starts a row that has one, so it opens with a mix pixel.
        let data = [0x04, 0x04, 0x04];
        let px = decompress_to_vec(4, 3, &data, 1).unwrap();
        assert_eq!(row(&px, 4, 2), &[0, 0, 0, 0]);
        assert_eq!(row(&px, 4, 1), &[0, 0, 0, 0]);
        assert_eq!(row(&px, 4, 0), &[0xFF, 0, 0, 0]);
    }

    #[test]
    fn bicolour_alternates_and_doubles_the_run() {
        // BICOLOR short form, count 3, colours 7 and 9.
        let data = [0xE3, 7, 9];
        let px = decompress_to_vec(6, 1, &data, 1).unwrap();
        assert_eq!(px, vec![7, 9, 7, 9, 7, 9]);
    }

    #[test]
    fn fill_or_mix_uses_mask_bits() {
        // FILL_OR_MIX_1 fixed mask 0x03 over 8 pixels on the first row.
        let data = [0xF9];
        let px = decompress_to_vec(8, 1, &data, 1).unwrap();
        assert_eq!(px, vec![0xFF, 0xFF, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn sixteen_bit_white_and_copy() {
        let data = [0xFD, 0x81, 0x34, 0x12];
        let px = decompress_to_vec(2, 1, &data, 2).unwrap();
        assert_eq!(px, vec![0xFFFF, 0x1234]);
    }

    #[test]
    fn running_out_of_rows_is_a_protocol_error() {
        let err = decompress_to_vec(2, 1, &[0x70, 0x42], 1).unwrap_err();
        assert!(matches!(err, RdpError::Protocol(_)));
    }

    #[test]
    fn truncated_run_header_is_an_overrun() {
        let err = decompress_to_vec(2, 1, &[0xF3, 0x01], 1).unwrap_err();
        assert!(matches!(err, RdpError::Overrun { .. }));
    }
}
