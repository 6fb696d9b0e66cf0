//! Screen updates: bitmaps, palettes, pointers and order batches.
//!
//! [`Screen`] owns everything the receive loop draws into. It handles
//! both slow-path update PDUs and fast-path update frames, and after
//! each PDU publishes the union of touched pixels as one repaint event.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bitmap::{Bitmap, FramebufferSink, rle};
use crate::cache::{Cursor, GraphicsCache};
use crate::color::{ColorDepth, Palette, to_argb};
use crate::error::{RdpError, Result};
use crate::framebuffer::{Framebuffer, Rect};
use crate::orders::OrderProcessor;
use crate::stream::PacketBuffer;
use crate::transport::FastPathHandler;

use super::SessionEvent;

// ── Update types ─────────────────────────────────────────────────

pub const UPDATE_ORDERS: u16 = 0;
pub const UPDATE_BITMAP: u16 = 1;
pub const UPDATE_PALETTE: u16 = 2;
pub const UPDATE_SYNCHRONIZE: u16 = 3;

pub const POINTER_SYSTEM: u16 = 1;
pub const POINTER_MOVE: u16 = 3;
pub const POINTER_COLOR: u16 = 6;
pub const POINTER_CACHED: u16 = 7;

const SYSPTR_NULL: u32 = 0;
const SYSPTR_DEFAULT: u32 = 0x7F00;

// Fast-path update codes, in the low nibble of the update header.
const FP_ORDERS: u8 = 0;
const FP_BITMAP: u8 = 1;
const FP_PALETTE: u8 = 2;
const FP_SYNCHRONIZE: u8 = 3;
const FP_POINTER_HIDDEN: u8 = 5;
const FP_POINTER_DEFAULT: u8 = 6;
const FP_POINTER_POSITION: u8 = 8;
const FP_POINTER_COLOR: u8 = 9;
const FP_POINTER_CACHED: u8 = 10;
const FP_COMPRESSED: u8 = 0x80;

/// The compressed bitmap omits its 8-byte compression header.
const NO_BITMAP_COMPRESSION_HDR: u16 = 0x0400;

// ── Screen ───────────────────────────────────────────────────────

pub struct Screen {
    fb: Framebuffer,
    cache: Box<dyn GraphicsCache>,
    orders: OrderProcessor,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Screen {
    pub fn new(
        fb: Framebuffer,
        cache: Box<dyn GraphicsCache>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            fb,
            cache,
            orders: OrderProcessor::new(),
            events,
        }
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.fb
    }

    pub fn orders(&self) -> &OrderProcessor {
        &self.orders
    }

    pub fn reset_orders(&mut self) {
        self.orders.reset();
    }

    /// Reallocate the surface when the server changes geometry or depth.
    pub fn resize(&mut self, width: u16, height: u16, depth: ColorDepth) {
        if (self.fb.width(), self.fb.height(), self.fb.depth())
            == (width as i32, height as i32, depth)
        {
            return;
        }
        debug!(width, height, bits = depth.bits(), "resizing framebuffer");
        self.fb.resize(width, height, depth);
        self.emit(SessionEvent::Resize {
            width,
            height,
            depth,
        });
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.events.send(event);
    }

    /// Publish everything drawn since the last flush.
    pub fn flush(&mut self) {
        if let Some(rect) = self.fb.take_dirty() {
            let snapshot = self.fb.snapshot(rect);
            self.emit(SessionEvent::Repaint(snapshot));
        }
    }

    // ── Slow path ────────────────────────────────────────────────

    pub fn process_update(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let kind = s.read_u16_le()?;
        match kind {
            UPDATE_ORDERS => {
                s.skip(2)?;
                let count = s.read_u16_le()? as usize;
                s.skip(2)?;
                self.process_orders(s, count)
            }
            UPDATE_BITMAP => self.process_bitmap_updates(s),
            UPDATE_PALETTE => self.process_palette(s),
            UPDATE_SYNCHRONIZE => Ok(()),
            other => {
                warn!(kind = other, "unimplemented update type");
                Ok(())
            }
        }
    }

    pub fn process_pointer(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let kind = s.read_u16_le()?;
        s.skip(2)?;
        match kind {
            POINTER_MOVE => self.pointer_position(s),
            POINTER_COLOR => self.colour_pointer(s),
            POINTER_CACHED => self.cached_pointer(s),
            POINTER_SYSTEM => {
                match s.read_u32_le()? {
                    SYSPTR_NULL => self.emit(SessionEvent::PointerHidden),
                    SYSPTR_DEFAULT => self.emit(SessionEvent::PointerDefault),
                    other => warn!(kind = other, "unknown system pointer"),
                }
                Ok(())
            }
            other => {
                warn!(kind = other, "unimplemented pointer message");
                Ok(())
            }
        }
    }

    fn process_orders(&mut self, s: &mut PacketBuffer, count: usize) -> Result<()> {
        self.orders
            .process_batch(s, count, &mut self.fb, self.cache.as_mut())
    }

    fn process_bitmap_updates(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let count = s.read_u16_le()?;
        for _ in 0..count {
            self.bitmap_update(s)?;
        }
        Ok(())
    }

    /// One bitmap rectangle. Only the visible `cx` by `cy` part of the
    /// `width` by `height` bitmap is painted.
    fn bitmap_update(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let left = s.read_u16_le()? as i32;
        let top = s.read_u16_le()? as i32;
        let right = s.read_u16_le()? as i32;
        let bottom = s.read_u16_le()? as i32;
        let width = s.read_u16_le()?;
        let height = s.read_u16_le()?;
        let bpp = s.read_u16_le()?;
        let compress = s.read_u16_le()?;
        let bufsize = s.read_u16_le()? as usize;
        let (cx, cy) = (right - left + 1, bottom - top + 1);
        let depth = ColorDepth::from_bits(bpp)?;

        if compress == 0 {
            let len = width as usize * height as usize * depth.bytes_per_pixel();
            let bitmap = Bitmap::from_raw(s.read_bytes(len)?, width, height, depth)?;
            self.fb
                .put_block(left, top, cx, cy, &bitmap.pixels, width as i32, 0, 0);
            return Ok(());
        }

        let size = if compress & NO_BITMAP_COMPRESSION_HDR != 0 {
            bufsize
        } else {
            s.skip(2)?; // pad
            let size = s.read_u16_le()? as usize;
            s.skip(4)?; // row size, final size
            size
        };
        let data = s.read_bytes(size)?;

        let rect = Rect::new(left, top, cx, cy);
        let mut direct = None;
        if (width as i32, height as i32) == (cx, cy) && depth == self.fb.depth() {
            if let Some(mut sink) = FramebufferSink::new(&mut self.fb, rect) {
                let bpp = depth.bytes_per_pixel();
                direct = Some(rle::decompress(&mut sink, width as usize, height as usize, data, bpp));
            }
        }
        let result = match direct {
            Some(r) => {
                self.fb.mark_dirty(rect);
                r
            }
            None => Bitmap::decompress(data, width, height, depth).map(|bitmap| {
                self.fb
                    .put_block(left, top, cx, cy, &bitmap.pixels, width as i32, 0, 0);
            }),
        };
        // A corrupt bitmap only loses its own rectangle.
        if let Err(e) = result {
            warn!(left, top, width, height, "bitmap update dropped: {e}");
        }
        Ok(())
    }

    fn process_palette(&mut self, s: &mut PacketBuffer) -> Result<()> {
        s.skip(2)?;
        let count = s.read_u16_le()? as usize;
        s.skip(2)?;
        let data = s.read_bytes(count.min(256) * 3)?;
        debug!(count, "palette update");
        self.fb.set_palette(Palette::from_rgb_triples(data));
        Ok(())
    }

    fn pointer_position(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let x = s.read_u16_le()?;
        let y = s.read_u16_le()?;
        self.emit(SessionEvent::PointerMove { x, y });
        Ok(())
    }

    fn colour_pointer(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let index = s.read_u16_le()?;
        let hotspot_x = s.read_u16_le()?;
        let hotspot_y = s.read_u16_le()?;
        let width = s.read_u16_le()?;
        let height = s.read_u16_le()?;
        let mask_len = s.read_u16_le()? as usize;
        let data_len = s.read_u16_le()? as usize;
        let xor = s.read_vec(data_len)?;
        let and = s.read_bytes(mask_len)?;
        let cursor = decode_colour_pointer(hotspot_x, hotspot_y, width, height, and, &xor)?;
        self.cache.put_cursor(index, cursor.clone());
        self.emit(SessionEvent::PointerShape(cursor));
        Ok(())
    }

    fn cached_pointer(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let index = s.read_u16_le()?;
        match self.cache.cursor(index) {
            Some(cursor) => self.emit(SessionEvent::PointerShape(cursor.clone())),
            None => warn!(index, "cached pointer missing"),
        }
        Ok(())
    }

    // ── Fast path ────────────────────────────────────────────────

    /// Every update carried by one fast-path frame.
    pub fn process_fast_path(&mut self, s: &mut PacketBuffer) -> Result<()> {
        while s.has_remaining() {
            let header = s.read_u8()?;
            if header & FP_COMPRESSED != 0 {
                s.skip(1)?; // compression flags
            }
            let length = s.read_u16_le()? as usize;
            let next = s.position() + length;
            if next > s.end() {
                return Err(RdpError::Overrun {
                    needed: length,
                    available: s.remaining(),
                });
            }
            if header & FP_COMPRESSED != 0 {
                warn!(kind = header & 0x0F, "compressed fast-path update skipped");
                s.set_position(next)?;
                continue;
            }

            // Each update is bounded by its own length.
            let outer_end = s.end();
            s.set_end(next)?;
            let result = self.fast_path_update(header & 0x0F, s);
            s.set_end(outer_end)?;
            result?;
            s.set_position(next)?;
        }
        Ok(())
    }

    fn fast_path_update(&mut self, kind: u8, s: &mut PacketBuffer) -> Result<()> {
        match kind {
            FP_ORDERS => {
                let count = s.read_u16_le()? as usize;
                self.process_orders(s, count)
            }
            FP_BITMAP => {
                s.skip(2)?; // update type
                self.process_bitmap_updates(s)
            }
            FP_PALETTE => {
                s.skip(2)?; // update type
                self.process_palette(s)
            }
            FP_SYNCHRONIZE => Ok(()),
            FP_POINTER_HIDDEN => {
                self.emit(SessionEvent::PointerHidden);
                Ok(())
            }
            FP_POINTER_DEFAULT => {
                self.emit(SessionEvent::PointerDefault);
                Ok(())
            }
            FP_POINTER_POSITION => self.pointer_position(s),
            FP_POINTER_COLOR => self.colour_pointer(s),
            FP_POINTER_CACHED => self.cached_pointer(s),
            other => {
                warn!(kind = other, "unimplemented fast-path update");
                Ok(())
            }
        }
    }
}

impl FastPathHandler for Screen {
    fn fast_path(&mut self, _header: u8, _encrypted: bool, mut payload: PacketBuffer) -> Result<()> {
        self.process_fast_path(&mut payload)?;
        self.flush();
        Ok(())
    }
}

// ── Pointer decoding ─────────────────────────────────────────────

/// Build a cursor from a 24 bpp XOR bitmap and a 1 bpp AND mask.
///
/// Both are bottom-up with rows padded to two bytes. A set AND bit over
/// black is transparent; over any other colour it would invert the
/// screen, which an ARGB cursor cannot express, so it is drawn black.
pub fn decode_colour_pointer(
    hotspot_x: u16,
    hotspot_y: u16,
    width: u16,
    height: u16,
    and: &[u8],
    xor: &[u8],
) -> Result<Cursor> {
    let (w, h) = (width as usize, height as usize);
    let and_stride = w.div_ceil(16) * 2;
    let xor_stride = (w * 3).div_ceil(2) * 2;
    if and.len() < and_stride * h || xor.len() < xor_stride * h {
        return Err(RdpError::protocol(format!(
            "pointer data too short for {width}x{height}"
        )));
    }

    let mut argb = Vec::with_capacity(w * h);
    for y in 0..h {
        let row = h - 1 - y;
        for x in 0..w {
            let masked = and[row * and_stride + x / 8] & (0x80 >> (x % 8)) != 0;
            let p = row * xor_stride + x * 3;
            let rgb = (xor[p] as u32) | (xor[p + 1] as u32) << 8 | (xor[p + 2] as u32) << 16;
            argb.push(match (masked, rgb) {
                (false, rgb) => to_argb(rgb),
                (true, 0) => 0,
                (true, _) => to_argb(0),
            });
        }
    }
    Ok(Cursor {
        hotspot_x,
        hotspot_y,
        width,
        height,
        argb,
    })
}

// ── Tests ────────────────────────────────────────────────────────
