//! Persistent field state for every primary order kind.
//!
//! Each kind keeps the values of its last invocation. Fields missing
//! from a new order keep those values and delta coordinates are added
//! to them.

use crate::framebuffer::Bounds;

// ── OrderType ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OrderType {
    DestBlt = 0,
    PatBlt = 1,
    ScreenBlt = 2,
    Line = 9,
    Rect = 10,
    DeskSave = 11,
    MemBlt = 13,
    TriBlt = 14,
    Polyline = 22,
    Text2 = 27,
}

impl OrderType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => OrderType::DestBlt,
            1 => OrderType::PatBlt,
            2 => OrderType::ScreenBlt,
            9 => OrderType::Line,
            10 => OrderType::Rect,
            11 => OrderType::DeskSave,
            13 => OrderType::MemBlt,
            14 => OrderType::TriBlt,
            22 => OrderType::Polyline,
            27 => OrderType::Text2,
            _ => return None,
        })
    }

    /// Bytes in the present-field mask before SMALL/TINY reductions.
    ///
    /// Polygon and ellipse variants share the two-byte size even though
    /// they are not drawn.
    pub fn present_size(raw: u8) -> usize {
        match raw {
            14 | 27 => 3,
            1 | 9 | 13 | 21 | 26 => 2,
            _ => 1,
        }
    }
}

// ── Shared parameter blocks ──────────────────────────────────────

/// Destination rectangle and raster opcode shared by the blit orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlitParams {
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    pub opcode: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Brush {
    pub x_origin: u8,
    pub y_origin: u8,
    pub style: u8,
    /// Bottom row first, as sent.
    pub pattern: [u8; 8],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pen {
    pub style: u8,
    pub width: u8,
    pub color: u32,
}

// ── Per-kind state ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestBlt {
    pub blit: BlitParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatBlt {
    pub blit: BlitParams,
    pub bg_color: u32,
    pub fg_color: u32,
    pub brush: Brush,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenBlt {
    pub blit: BlitParams,
    pub src_x: i16,
    pub src_y: i16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Line {
    pub mix_mode: u16,
    pub start_x: i16,
    pub start_y: i16,
    pub end_x: i16,
    pub end_y: i16,
    pub bg_color: u32,
    pub opcode: u8,
    pub pen: Pen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RectOrder {
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    /// Raw colour assembled byte by byte from the wire.
    pub color: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeskSave {
    pub offset: u32,
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
    /// 0 saves, anything else restores.
    pub action: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemBlt {
    pub cache_id: u8,
    pub color_table: u8,
    pub blit: BlitParams,
    pub src_x: i16,
    pub src_y: i16,
    pub cache_index: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriBlt {
    pub mem: MemBlt,
    pub bg_color: u32,
    pub fg_color: u32,
    pub brush: Brush,
    pub unknown: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Polyline {
    pub x: i16,
    pub y: i16,
    pub opcode: u8,
    pub fg_color: u32,
    pub lines: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Text2 {
    pub font: u8,
    pub flags: u8,
    pub opcode: u8,
    pub mix_mode: u8,
    pub fg_color: u32,
    pub bg_color: u32,
    pub clip_left: i16,
    pub clip_top: i16,
    pub clip_right: i16,
    pub clip_bottom: i16,
    pub box_left: i16,
    pub box_top: i16,
    pub box_right: i16,
    pub box_bottom: i16,
    pub brush: Brush,
    pub x: i16,
    pub y: i16,
    pub text: Vec<u8>,
}

// ── OrderState ───────────────────────────────────────────────────

/// Last-seen values for every order kind plus the shared bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderState {
    /// Raw type byte of the last primary order.
    pub order_type: u8,
    pub bounds: Bounds,
    pub destblt: DestBlt,
    pub patblt: PatBlt,
    pub screenblt: ScreenBlt,
    pub line: Line,
    pub rect: RectOrder,
    pub desksave: DeskSave,
    pub memblt: MemBlt,
    pub triblt: TriBlt,
    pub polyline: Polyline,
    pub text2: Text2,
}

impl Default for OrderState {
    fn default() -> Self {
        Self {
            order_type: OrderType::PatBlt as u8,
            bounds: Bounds {
                left: 0,
                top: 0,
                right: 0,
                bottom: 0,
            },
            destblt: DestBlt::default(),
            patblt: PatBlt::default(),
            screenblt: ScreenBlt::default(),
            line: Line::default(),
            rect: RectOrder::default(),
            desksave: DeskSave::default(),
            memblt: MemBlt::default(),
            triblt: TriBlt::default(),
            polyline: Polyline::default(),
            text2: Text2::default(),
        }
    }
}

impl OrderState {
    /// Zero every field; the implicit order type becomes pattern blit.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restores_patblt_default() {
        let mut st = OrderState::default();
        st.order_type = OrderType::Rect as u8;
        st.rect.x = 40;
        st.reset();
        assert_eq!(st.order_type, 1);
        assert_eq!(st.rect.x, 0);
    }

    #[test]
    fn present_sizes() {
        assert_eq!(OrderType::present_size(27), 3);
        assert_eq!(OrderType::present_size(13), 2);
        assert_eq!(OrderType::present_size(10), 1);
        assert_eq!(OrderType::from_u8(20), None);
    }
}
