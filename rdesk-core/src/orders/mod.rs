//! Drawing order batches.
//!
//! A batch is a sequence of primary and secondary orders sharing one
//! [`OrderState`]. Each primary order may carry bounds that clip it;
//! the clip is reset after that order alone.

pub mod draw;
pub mod primary;
pub mod secondary;
pub mod state;
pub mod text;

use tracing::{debug, warn};

use crate::cache::GraphicsCache;
use crate::error::{RdpError, Result};
use crate::framebuffer::Framebuffer;
use crate::stream::PacketBuffer;

pub use state::{OrderState, OrderType};

// ── Control flags ────────────────────────────────────────────────

pub const ORDER_STANDARD: u8 = 0x01;
pub const ORDER_SECONDARY: u8 = 0x02;
pub const ORDER_BOUNDS: u8 = 0x04;
pub const ORDER_CHANGE: u8 = 0x08;
pub const ORDER_DELTA: u8 = 0x10;
pub const ORDER_LASTBOUNDS: u8 = 0x20;
pub const ORDER_SMALL: u8 = 0x40;
pub const ORDER_TINY: u8 = 0x80;

// ── OrderProcessor ───────────────────────────────────────────────

/// Owns the order state of one session.
#[derive(Debug, Default)]
pub struct OrderProcessor {
    state: OrderState,
}

impl OrderProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Process `count` orders from `s`.
    ///
    /// An unsupported order abandons the rest of the batch and returns
    /// `Ok`, since the next batch does not depend on it. Any other
    /// error is returned.
    pub fn process_batch(
        &mut self,
        s: &mut PacketBuffer,
        count: usize,
        fb: &mut Framebuffer,
        cache: &mut dyn GraphicsCache,
    ) -> Result<()> {
        for processed in 0..count {
            match self.process_order(s, fb, cache) {
                Ok(()) => {}
                Err(e) if e.is_batch_local() => {
                    fb.reset_clip();
                    warn!(processed, count, "abandoning order batch: {e}");
                    return Ok(());
                }
                Err(e) => {
                    fb.reset_clip();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn process_order(
        &mut self,
        s: &mut PacketBuffer,
        fb: &mut Framebuffer,
        cache: &mut dyn GraphicsCache,
    ) -> Result<()> {
        let flags = s.read_u8()?;
        if flags & ORDER_STANDARD == 0 {
            return Err(RdpError::unsupported(format!("order control flags {flags:#04x}")));
        }
        if flags & ORDER_SECONDARY != 0 {
            return secondary::process(s, cache, fb.depth());
        }

        if flags & ORDER_CHANGE != 0 {
            self.state.order_type = s.read_u8()?;
        }
        let raw_type = self.state.order_type;
        let present = primary::read_present(s, flags, OrderType::present_size(raw_type))?;

        if flags & ORDER_BOUNDS != 0 {
            if flags & ORDER_LASTBOUNDS == 0 {
                primary::parse_bounds(s, &mut self.state.bounds)?;
            }
            let b = self.state.bounds;
            fb.set_clip(b.left, b.top, b.right, b.bottom);
        }

        let result = self.dispatch(s, raw_type, present, flags & ORDER_DELTA != 0, fb, cache);
        if flags & ORDER_BOUNDS != 0 {
            fb.reset_clip();
        }
        result
    }

    fn dispatch(
        &mut self,
        s: &mut PacketBuffer,
        raw_type: u8,
        present: u32,
        delta: bool,
        fb: &mut Framebuffer,
        cache: &mut dyn GraphicsCache,
    ) -> Result<()> {
        let Some(kind) = OrderType::from_u8(raw_type) else {
            return Err(RdpError::unsupported(format!("primary order {raw_type}")));
        };
        let os = &mut self.state;
        debug!(?kind, present, delta, "primary order");
        match kind {
            OrderType::DestBlt => {
                primary::parse_destblt(s, &mut os.destblt, present, delta)?;
                draw::destblt(fb, &os.destblt);
            }
            OrderType::PatBlt => {
                primary::parse_patblt(s, &mut os.patblt, present, delta)?;
                draw::patblt(fb, &os.patblt)?;
            }
            OrderType::ScreenBlt => {
                primary::parse_screenblt(s, &mut os.screenblt, present, delta)?;
                draw::screenblt(fb, &os.screenblt);
            }
            OrderType::Line => {
                primary::parse_line(s, &mut os.line, present, delta)?;
                draw::line(fb, &os.line)?;
            }
            OrderType::Rect => {
                primary::parse_rect(s, &mut os.rect, present, delta)?;
                draw::rect(fb, &os.rect);
            }
            OrderType::DeskSave => {
                primary::parse_desksave(s, &mut os.desksave, present, delta)?;
                draw::desksave(fb, cache, &os.desksave);
            }
            OrderType::MemBlt => {
                primary::parse_memblt(s, &mut os.memblt, present, delta)?;
                draw::memblt(fb, cache, &os.memblt);
            }
            OrderType::TriBlt => {
                primary::parse_triblt(s, &mut os.triblt, present, delta)?;
                draw::triblt(fb, cache, &os.triblt)?;
            }
            OrderType::Polyline => {
                primary::parse_polyline(s, &mut os.polyline, present, delta)?;
                draw::polyline(fb, &os.polyline)?;
            }
            OrderType::Text2 => {
                primary::parse_text2(s, &mut os.text2, present)?;
                text::draw_text(fb, cache, &os.text2)?;
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
