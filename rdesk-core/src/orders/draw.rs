//! Rendering of decoded primary orders into the framebuffer.

use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::cache::{GraphicsCache, desktop_range};
use crate::error::{RdpError, Result};
use crate::framebuffer::Framebuffer;
use crate::raster::{self, Rop2, Source};

use super::state::{
    Brush, DeskSave, DestBlt, Line, MemBlt, PatBlt, Polyline, RectOrder, ScreenBlt, TriBlt,
};

const BRUSH_SOLID: u8 = 0;
const BRUSH_HATCH: u8 = 2;
const BRUSH_PATTERN: u8 = 3;

/// Rows of the six standard hatch brushes, top row first.
const HATCH_PATTERNS: [[u8; 8]; 6] = [
    [0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00], // horizontal
    [0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08], // vertical
    [0x80, 0x40, 0x20, 0x10, 0x08, 0x04, 0x02, 0x01], // forward diagonal
    [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80], // backward diagonal
    [0x08, 0x08, 0x08, 0xFF, 0x08, 0x08, 0x08, 0x08], // cross
    [0x81, 0x42, 0x24, 0x18, 0x18, 0x24, 0x42, 0x81], // diagonal cross
];

// ── Brushes ──────────────────────────────────────────────────────

/// Brush pixels covering `(x, y, cx, cy)`, row-major.
///
/// `fg` and `bg` are framebuffer colours. The pattern phase follows the
/// absolute position, so a clipped block matches the same part of the
/// unclipped one. Pass the clipped size; the block is allocated whole.
pub fn brush_pixels(brush: &Brush, x: i32, y: i32, cx: i32, cy: i32, fg: u32, bg: u32) -> Result<Vec<u32>> {
    let (cx, cy) = (cx.max(0), cy.max(0));
    let len = (cx as usize)
        .checked_mul(cy as usize)
        .ok_or_else(|| RdpError::unsupported(format!("brush block {cx}x{cy}")))?;
    let rows: [u8; 8];
    let (set, clear) = match brush.style {
        BRUSH_SOLID => return Ok(vec![fg; len]),
        BRUSH_HATCH => {
            rows = *HATCH_PATTERNS
                .get(brush.pattern[0] as usize)
                .ok_or_else(|| RdpError::unsupported(format!("hatch {}", brush.pattern[0])))?;
            (fg, bg)
        }
        BRUSH_PATTERN => {
            let mut r = brush.pattern;
            r.reverse();
            rows = r;
            (bg, fg)
        }
        other => return Err(RdpError::unsupported(format!("brush style {other}"))),
    };

    let mut out = Vec::with_capacity(len);
    for row in 0..cy {
        let bits = rows[(y as i64 + row as i64 - brush.y_origin as i64).rem_euclid(8) as usize];
        for col in 0..cx {
            let bit = (x as i64 + col as i64 - brush.x_origin as i64).rem_euclid(8);
            out.push(if bits & (0x80 >> bit) != 0 { set } else { clear });
        }
    }
    Ok(out)
}

fn patblt_region(
    fb: &mut Framebuffer,
    op: Rop2,
    (x, y, cx, cy): (i32, i32, i32, i32),
    brush: &Brush,
    fg: u32,
    bg: u32,
) -> Result<()> {
    // The brush is only built for the visible part of the block.
    let Some(c) = fb.clip_rect(x, y, cx, cy) else {
        return Ok(());
    };
    let pixels = brush_pixels(brush, c.x, c.y, c.cx, c.cy, fg, bg)?;
    raster::apply_region(
        op,
        fb,
        c.x,
        c.y,
        c.cx,
        c.cy,
        Some(Source::Pixels {
            data: &pixels,
            width: c.cx,
            x: 0,
            y: 0,
        }),
    );
    Ok(())
}

fn memblt_region(fb: &mut Framebuffer, op: Rop2, (x, y, cx, cy): (i32, i32, i32, i32), bitmap: &Bitmap, src_x: i32, src_y: i32) {
    raster::apply_region(
        op,
        fb,
        x,
        y,
        cx,
        cy,
        Some(Source::Pixels {
            data: &bitmap.pixels,
            width: bitmap.width as i32,
            x: src_x,
            y: src_y,
        }),
    );
}

// ── Blits ────────────────────────────────────────────────────────

pub fn destblt(fb: &mut Framebuffer, os: &DestBlt) {
    let b = &os.blit;
    raster::apply_region(
        Rop2::from_rop3_source(b.opcode),
        fb,
        b.x as i32,
        b.y as i32,
        b.cx as i32,
        b.cy as i32,
        None,
    );
}

pub fn patblt(fb: &mut Framebuffer, os: &PatBlt) -> Result<()> {
    let b = &os.blit;
    let depth = fb.depth();
    patblt_region(
        fb,
        Rop2::from_rop3_pattern(b.opcode),
        (b.x as i32, b.y as i32, b.cx as i32, b.cy as i32),
        &os.brush,
        depth.order_color(os.fg_color),
        depth.order_color(os.bg_color),
    )
}

pub fn screenblt(fb: &mut Framebuffer, os: &ScreenBlt) {
    let b = &os.blit;
    let op = Rop2::from_rop3_source(b.opcode);
    if op == Rop2::Copy {
        if let Some(c) = fb.clip_rect(b.x as i32, b.y as i32, b.cx as i32, b.cy as i32) {
            fb.copy_area(
                os.src_x as i32 + c.src_dx,
                os.src_y as i32 + c.src_dy,
                c.cx,
                c.cy,
                c.x,
                c.y,
            );
        }
        return;
    }
    raster::apply_region(
        op,
        fb,
        b.x as i32,
        b.y as i32,
        b.cx as i32,
        b.cy as i32,
        Some(Source::Screen {
            x: os.src_x as i32,
            y: os.src_y as i32,
        }),
    );
}

pub fn memblt(fb: &mut Framebuffer, cache: &dyn GraphicsCache, os: &MemBlt) {
    let Some(bitmap) = cache.bitmap(os.cache_id, os.cache_index) else {
        warn!(cache_id = os.cache_id, index = os.cache_index, "memblt from empty cache slot");
        return;
    };
    let b = &os.blit;
    memblt_region(
        fb,
        Rop2::from_rop3_source(b.opcode),
        (b.x as i32, b.y as i32, b.cx as i32, b.cy as i32),
        bitmap,
        os.src_x as i32,
        os.src_y as i32,
    );
}

/// Three-way blit. Only the opcodes Windows actually sends are composed;
/// anything else falls back to a plain copy of the source.
pub fn triblt(fb: &mut Framebuffer, cache: &dyn GraphicsCache, os: &TriBlt) -> Result<()> {
    let m = &os.mem;
    let Some(bitmap) = cache.bitmap(m.cache_id, m.cache_index) else {
        warn!(cache_id = m.cache_id, index = m.cache_index, "triblt from empty cache slot");
        return Ok(());
    };
    let rect = (m.blit.x as i32, m.blit.y as i32, m.blit.cx as i32, m.blit.cy as i32);
    let (sx, sy) = (m.src_x as i32, m.src_y as i32);
    let depth = fb.depth();
    let fg = depth.order_color(os.fg_color);
    let bg = depth.order_color(os.bg_color);

    match m.blit.opcode {
        0x69 => {
            memblt_region(fb, Rop2::Xor, rect, bitmap, sx, sy);
            patblt_region(fb, Rop2::Equiv, rect, &os.brush, fg, bg)?;
        }
        0xB8 => {
            patblt_region(fb, Rop2::Xor, rect, &os.brush, fg, bg)?;
            memblt_region(fb, Rop2::And, rect, bitmap, sx, sy);
            patblt_region(fb, Rop2::Xor, rect, &os.brush, fg, bg)?;
        }
        0xC0 => {
            memblt_region(fb, Rop2::Copy, rect, bitmap, sx, sy);
            patblt_region(fb, Rop2::And, rect, &os.brush, fg, bg)?;
        }
        other => {
            debug!(opcode = other, "triblt opcode drawn as copy");
            memblt_region(fb, Rop2::Copy, rect, bitmap, sx, sy);
        }
    }
    Ok(())
}

// ── Lines ────────────────────────────────────────────────────────

/// ROP2 of a line order; the wire value is one-based.
fn line_rop(opcode: u8) -> Result<Rop2> {
    if !(0x01..=0x10).contains(&opcode) {
        return Err(RdpError::unsupported(format!("line opcode {opcode:#x}")));
    }
    Ok(Rop2::from_u8(opcode - 1))
}

/// Bresenham line including both end points.
pub fn draw_line(fb: &mut Framebuffer, op: Rop2, x1: i32, y1: i32, x2: i32, y2: i32, color: u32) {
    let dx = (x2 - x1).abs();
    let dy = -(y2 - y1).abs();
    let sx = if x1 < x2 { 1 } else { -1 };
    let sy = if y1 < y2 { 1 } else { -1 };
    let (mut x, mut y) = (x1, y1);
    let mut err = dx + dy;
    loop {
        raster::apply_pixel(op, fb, x, y, color);
        if x == x2 && y == y2 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

pub fn line(fb: &mut Framebuffer, os: &Line) -> Result<()> {
    let op = line_rop(os.opcode)?;
    let color = fb.depth().order_color(os.pen.color);
    draw_line(
        fb,
        op,
        os.start_x as i32,
        os.start_y as i32,
        os.end_x as i32,
        os.end_y as i32,
        color,
    );
    Ok(())
}

/// One- or two-byte signed delta from a polyline's packed point list.
fn parse_delta(data: &[u8], offset: &mut usize) -> i32 {
    let mut next = || {
        let v = data.get(*offset).copied().unwrap_or(0);
        *offset += 1;
        v as i32
    };
    let first = next();
    let mut value = if first & 0x40 != 0 { first | !0x3F } else { first & 0x3F };
    if first & 0x80 != 0 {
        value = (value << 8) | next();
    }
    value
}

/// Connected segments from packed deltas; every four points share a
/// flag byte saying which coordinates change.
pub fn polyline(fb: &mut Framebuffer, os: &Polyline) -> Result<()> {
    let op = line_rop(os.opcode)?;
    let color = fb.depth().order_color(os.fg_color);
    let lines = os.lines as usize;
    if lines == 0 {
        return Ok(());
    }

    let (mut x, mut y) = (os.x as i32, os.y as i32);
    let mut flag_index = 0usize;
    let mut offset = (lines - 1) / 4 + 1;
    let mut flags = 0u8;
    for n in 0..lines {
        if offset >= os.data.len() {
            break;
        }
        let (from_x, from_y) = (x, y);
        if n % 4 == 0 {
            flags = os.data.get(flag_index).copied().unwrap_or(0);
            flag_index += 1;
        }
        if flags & 0xC0 == 0 {
            flags |= 0xC0;
        }
        if flags & 0x40 != 0 {
            x += parse_delta(&os.data, &mut offset);
        }
        if flags & 0x80 != 0 {
            y += parse_delta(&os.data, &mut offset);
        }
        draw_line(fb, op, from_x, from_y, x, y, color);
        flags <<= 2;
    }
    Ok(())
}

// ── Rectangles and desktop save ──────────────────────────────────

pub fn rect(fb: &mut Framebuffer, os: &RectOrder) {
    let color = fb.depth().order_color(os.color);
    fb.fill_rect(os.x as i32, os.y as i32, os.cx as i32, os.cy as i32, color);
}

pub fn desksave(fb: &mut Framebuffer, cache: &mut dyn GraphicsCache, os: &DeskSave) {
    let (x, y) = (os.left as i32, os.top as i32);
    let cx = os.right as i32 - x + 1;
    let cy = os.bottom as i32 - y + 1;
    if cx <= 0 || cy <= 0 {
        return;
    }
    let offset = os.offset as usize;
    if desktop_range(offset, cx as usize, cy as usize).is_none() {
        warn!(offset, cx, cy, "desktop save block outside the save cache");
        return;
    }
    if os.action == 0 {
        let pixels = fb.get_block(x, y, cx, cy);
        cache.put_desktop(offset, cx as usize, cy as usize, &pixels);
    } else if let Some(pixels) = cache.desktop(offset, cx as usize, cy as usize) {
        fb.put_block(x, y, cx, cy, pixels, cx, 0, 0);
    } else {
        warn!(offset, cx, cy, "desktop restore outside the save cache");
    }
}

// ── Tests ────────────────────────────────────────────────────────
