//! Field decoding for primary orders.
//!
//! Every parser updates the persistent state in place, reading only the
//! fields whose bit is set in `present`.

use crate::error::Result;
use crate::framebuffer::Bounds;
use crate::stream::PacketBuffer;

use super::state::{
    BlitParams, Brush, DeskSave, DestBlt, Line, MemBlt, PatBlt, Pen, Polyline, RectOrder,
    ScreenBlt, Text2, TriBlt,
};
use super::{ORDER_SMALL, ORDER_TINY};

// ── Field primitives ─────────────────────────────────────────────

/// Read the present-field mask, shortened by the SMALL and TINY flags.
pub fn read_present(s: &mut PacketBuffer, flags: u8, size: usize) -> Result<u32> {
    let mut size = size;
    if flags & ORDER_SMALL != 0 {
        size = size.saturating_sub(1);
    }
    if flags & ORDER_TINY != 0 {
        size = size.saturating_sub(2);
    }
    let mut present = 0u32;
    for i in 0..size {
        present |= (s.read_u8()? as u32) << (i * 8);
    }
    Ok(present)
}

/// Absolute 16-bit coordinate, or a signed byte added to the old value.
pub fn read_coord(s: &mut PacketBuffer, coord: &mut i16, delta: bool) -> Result<()> {
    if delta {
        let change = s.read_u8()? as i8;
        *coord = coord.wrapping_add(change as i16);
    } else {
        *coord = s.read_u16_le()? as i16;
    }
    Ok(())
}

/// Three colour bytes, first byte lowest.
pub fn read_color(s: &mut PacketBuffer) -> Result<u32> {
    s.read_uint_le(3)
}

pub fn parse_bounds(s: &mut PacketBuffer, bounds: &mut Bounds) -> Result<()> {
    let present = s.read_u8()?;
    let fields = [
        &mut bounds.left,
        &mut bounds.top,
        &mut bounds.right,
        &mut bounds.bottom,
    ];
    for (i, field) in fields.into_iter().enumerate() {
        let mut v = *field as i16;
        if present & (1 << i) != 0 {
            read_coord(s, &mut v, false)?;
        } else if present & (0x10 << i) != 0 {
            read_coord(s, &mut v, true)?;
        }
        *field = v as i32;
    }
    Ok(())
}

pub fn parse_pen(s: &mut PacketBuffer, pen: &mut Pen, present: u32) -> Result<()> {
    if present & 0x01 != 0 {
        pen.style = s.read_u8()?;
    }
    if present & 0x02 != 0 {
        pen.width = s.read_u8()?;
    }
    if present & 0x04 != 0 {
        pen.color = read_color(s)?;
    }
    Ok(())
}

pub fn parse_brush(s: &mut PacketBuffer, brush: &mut Brush, present: u32) -> Result<()> {
    if present & 0x01 != 0 {
        brush.x_origin = s.read_u8()?;
    }
    if present & 0x02 != 0 {
        brush.y_origin = s.read_u8()?;
    }
    if present & 0x04 != 0 {
        brush.style = s.read_u8()?;
    }
    if present & 0x08 != 0 {
        brush.pattern[0] = s.read_u8()?;
    }
    if present & 0x10 != 0 {
        let rest = s.read_bytes(7)?;
        brush.pattern[1..].copy_from_slice(rest);
    }
    Ok(())
}

/// x, y, cx, cy at consecutive bits starting from `first`, then the opcode.
fn parse_blit(s: &mut PacketBuffer, blit: &mut BlitParams, present: u32, first: u32, delta: bool) -> Result<()> {
    if present & first != 0 {
        read_coord(s, &mut blit.x, delta)?;
    }
    if present & (first << 1) != 0 {
        read_coord(s, &mut blit.y, delta)?;
    }
    if present & (first << 2) != 0 {
        read_coord(s, &mut blit.cx, delta)?;
    }
    if present & (first << 3) != 0 {
        read_coord(s, &mut blit.cy, delta)?;
    }
    if present & (first << 4) != 0 {
        blit.opcode = s.read_u8()?;
    }
    Ok(())
}

// ── Order kinds ──────────────────────────────────────────────────

pub fn parse_destblt(s: &mut PacketBuffer, os: &mut DestBlt, present: u32, delta: bool) -> Result<()> {
    parse_blit(s, &mut os.blit, present, 0x01, delta)
}

pub fn parse_patblt(s: &mut PacketBuffer, os: &mut PatBlt, present: u32, delta: bool) -> Result<()> {
    parse_blit(s, &mut os.blit, present, 0x01, delta)?;
    if present & 0x20 != 0 {
        os.bg_color = read_color(s)?;
    }
    if present & 0x40 != 0 {
        os.fg_color = read_color(s)?;
    }
    parse_brush(s, &mut os.brush, present >> 7)
}

pub fn parse_screenblt(s: &mut PacketBuffer, os: &mut ScreenBlt, present: u32, delta: bool) -> Result<()> {
    parse_blit(s, &mut os.blit, present, 0x01, delta)?;
    if present & 0x20 != 0 {
        read_coord(s, &mut os.src_x, delta)?;
    }
    if present & 0x40 != 0 {
        read_coord(s, &mut os.src_y, delta)?;
    }
    Ok(())
}

pub fn parse_line(s: &mut PacketBuffer, os: &mut Line, present: u32, delta: bool) -> Result<()> {
    if present & 0x01 != 0 {
        os.mix_mode = s.read_u16_le()?;
    }
    if present & 0x02 != 0 {
        read_coord(s, &mut os.start_x, delta)?;
    }
    if present & 0x04 != 0 {
        read_coord(s, &mut os.start_y, delta)?;
    }
    if present & 0x08 != 0 {
        read_coord(s, &mut os.end_x, delta)?;
    }
    if present & 0x10 != 0 {
        read_coord(s, &mut os.end_y, delta)?;
    }
    if present & 0x20 != 0 {
        os.bg_color = read_color(s)?;
    }
    if present & 0x40 != 0 {
        os.opcode = s.read_u8()?;
    }
    parse_pen(s, &mut os.pen, present >> 7)
}

/// Each colour byte of an opaque rectangle is sent on its own.
pub fn parse_rect(s: &mut PacketBuffer, os: &mut RectOrder, present: u32, delta: bool) -> Result<()> {
    if present & 0x01 != 0 {
        read_coord(s, &mut os.x, delta)?;
    }
    if present & 0x02 != 0 {
        read_coord(s, &mut os.y, delta)?;
    }
    if present & 0x04 != 0 {
        read_coord(s, &mut os.cx, delta)?;
    }
    if present & 0x08 != 0 {
        read_coord(s, &mut os.cy, delta)?;
    }
    for (i, shift) in [0u32, 8, 16].into_iter().enumerate() {
        if present & (0x10 << i) != 0 {
            let byte = s.read_u8()? as u32;
            os.color = (os.color & !(0xFF << shift)) | (byte << shift);
        }
    }
    Ok(())
}

pub fn parse_desksave(s: &mut PacketBuffer, os: &mut DeskSave, present: u32, delta: bool) -> Result<()> {
    if present & 0x01 != 0 {
        os.offset = s.read_u32_le()?;
    }
    if present & 0x02 != 0 {
        read_coord(s, &mut os.left, delta)?;
    }
    if present & 0x04 != 0 {
        read_coord(s, &mut os.top, delta)?;
    }
    if present & 0x08 != 0 {
        read_coord(s, &mut os.right, delta)?;
    }
    if present & 0x10 != 0 {
        read_coord(s, &mut os.bottom, delta)?;
    }
    if present & 0x20 != 0 {
        os.action = s.read_u8()?;
    }
    Ok(())
}

fn parse_mem_fields(s: &mut PacketBuffer, os: &mut MemBlt, present: u32, delta: bool) -> Result<()> {
    if present & 0x01 != 0 {
        os.cache_id = s.read_u8()?;
        os.color_table = s.read_u8()?;
    }
    parse_blit(s, &mut os.blit, present, 0x02, delta)?;
    if present & 0x40 != 0 {
        read_coord(s, &mut os.src_x, delta)?;
    }
    if present & 0x80 != 0 {
        read_coord(s, &mut os.src_y, delta)?;
    }
    Ok(())
}

pub fn parse_memblt(s: &mut PacketBuffer, os: &mut MemBlt, present: u32, delta: bool) -> Result<()> {
    parse_mem_fields(s, os, present, delta)?;
    if present & 0x100 != 0 {
        os.cache_index = s.read_u16_le()?;
    }
    Ok(())
}

pub fn parse_triblt(s: &mut PacketBuffer, os: &mut TriBlt, present: u32, delta: bool) -> Result<()> {
    parse_mem_fields(s, &mut os.mem, present, delta)?;
    if present & 0x100 != 0 {
        os.bg_color = read_color(s)?;
    }
    if present & 0x200 != 0 {
        os.fg_color = read_color(s)?;
    }
    parse_brush(s, &mut os.brush, present >> 10)?;
    if present & 0x8000 != 0 {
        os.mem.cache_index = s.read_u16_le()?;
    }
    if present & 0x10000 != 0 {
        os.unknown = s.read_u16_le()?;
    }
    Ok(())
}

pub fn parse_polyline(s: &mut PacketBuffer, os: &mut Polyline, present: u32, delta: bool) -> Result<()> {
    if present & 0x01 != 0 {
        read_coord(s, &mut os.x, delta)?;
    }
    if present & 0x02 != 0 {
        read_coord(s, &mut os.y, delta)?;
    }
    if present & 0x04 != 0 {
        os.opcode = s.read_u8()?;
    }
    if present & 0x10 != 0 {
        os.fg_color = read_color(s)?;
    }
    if present & 0x20 != 0 {
        os.lines = s.read_u8()?;
    }
    if present & 0x40 != 0 {
        let size = s.read_u8()? as usize;
        os.data = s.read_vec(size)?;
    }
    Ok(())
}

/// Glyph index fields. Coordinates here are always absolute.
pub fn parse_text2(s: &mut PacketBuffer, os: &mut Text2, present: u32) -> Result<()> {
    if present & 0x01 != 0 {
        os.font = s.read_u8()?;
    }
    if present & 0x02 != 0 {
        os.flags = s.read_u8()?;
    }
    if present & 0x04 != 0 {
        os.opcode = s.read_u8()?;
    }
    if present & 0x08 != 0 {
        os.mix_mode = s.read_u8()?;
    }
    if present & 0x10 != 0 {
        os.fg_color = read_color(s)?;
    }
    if present & 0x20 != 0 {
        os.bg_color = read_color(s)?;
    }
    let boxes = [
        &mut os.clip_left,
        &mut os.clip_top,
        &mut os.clip_right,
        &mut os.clip_bottom,
        &mut os.box_left,
        &mut os.box_top,
        &mut os.box_right,
        &mut os.box_bottom,
    ];
    for (i, field) in boxes.into_iter().enumerate() {
        if present & (0x40 << i) != 0 {
            *field = s.read_u16_le()? as i16;
        }
    }
    parse_brush(s, &mut os.brush, present >> 14)?;
    if present & 0x80000 != 0 {
        os.x = s.read_u16_le()? as i16;
    }
    if present & 0x100000 != 0 {
        os.y = s.read_u16_le()? as i16;
    }
    if present & 0x200000 != 0 {
        let len = s.read_u8()? as usize;
        os.text = s.read_vec(len)?;
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
