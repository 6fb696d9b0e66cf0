//! Input event encoding.
//!
//! The shell hands the session `(time, device, flags, param1, param2)`
//! tuples; this module builds them from keyboard and pointer actions and
//! encodes batches into input PDU bodies.

use bitflags::bitflags;

use crate::error::Result;

use super::pdu::build;

// ── Message types ────────────────────────────────────────────────

/// The `device` field of an input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum InputDevice {
    Synchronize = 0x0000,
    Codepoint = 0x0001,
    VirtualKey = 0x0002,
    Scancode = 0x0004,
    Mouse = 0x8001,
}

bitflags! {
    /// Device flags of a scancode event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyboardFlags: u16 {
        const EXTENDED = 0x0100;
        const DOWN = 0x4000;
        const RELEASE = 0x8000;
    }
}

bitflags! {
    /// Device flags of a mouse event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PointerFlags: u16 {
        const WHEEL_NEGATIVE = 0x0100;
        const WHEEL = 0x0200;
        const MOVE = 0x0800;
        const BUTTON1 = 0x1000;
        const BUTTON2 = 0x2000;
        const BUTTON3 = 0x4000;
        const DOWN = 0x8000;
    }
}

bitflags! {
    /// Toggle key state carried by a synchronize event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ToggleKeys: u16 {
        const SCROLL_LOCK = 0x01;
        const NUM_LOCK = 0x02;
        const CAPS_LOCK = 0x04;
        const KANA_LOCK = 0x08;
    }
}

/// Button of a mouse press or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    fn flag(self) -> PointerFlags {
        match self {
            MouseButton::Left => PointerFlags::BUTTON1,
            MouseButton::Right => PointerFlags::BUTTON2,
            MouseButton::Middle => PointerFlags::BUTTON3,
        }
    }
}

// ── InputEvent ───────────────────────────────────────────────────

/// One input event as it goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// Seconds timestamp; servers ignore it.
    pub time: u32,
    pub device: u16,
    pub flags: u16,
    pub param1: u16,
    pub param2: u16,
}

impl InputEvent {
    pub fn new(time: u32, device: u16, flags: u16, param1: u16, param2: u16) -> Self {
        Self {
            time,
            device,
            flags,
            param1,
            param2,
        }
    }

    /// Lock key state, sent once the session is active.
    pub fn synchronize(toggles: ToggleKeys) -> Self {
        Self::new(0, InputDevice::Synchronize as u16, 0, toggles.bits(), 0)
    }

    /// A key press or release by scancode.
    ///
    /// Scancodes above `0xFF` carry the `0xE0` prefix and are sent with
    /// the extended flag.
    pub fn scancode(code: u16, pressed: bool) -> Self {
        let mut flags = if pressed {
            KeyboardFlags::DOWN
        } else {
            KeyboardFlags::RELEASE
        };
        if code > 0xFF {
            flags |= KeyboardFlags::EXTENDED;
        }
        Self::new(0, InputDevice::Scancode as u16, flags.bits(), code & 0xFF, 0)
    }

    /// A UTF-16 code unit typed without a key mapping.
    pub fn unicode(unit: u16, pressed: bool) -> Self {
        let flags = if pressed { 0 } else { KeyboardFlags::RELEASE.bits() };
        Self::new(0, InputDevice::Codepoint as u16, flags, unit, 0)
    }

    pub fn mouse_move(x: u16, y: u16) -> Self {
        Self::new(0, InputDevice::Mouse as u16, PointerFlags::MOVE.bits(), x, y)
    }

    pub fn mouse_button(button: MouseButton, pressed: bool, x: u16, y: u16) -> Self {
        let mut flags = button.flag();
        if pressed {
            flags |= PointerFlags::DOWN;
        }
        Self::new(0, InputDevice::Mouse as u16, flags.bits(), x, y)
    }

    /// A wheel rotation; positive `delta` scrolls away from the user.
    pub fn wheel(delta: i16, x: u16, y: u16) -> Self {
        let clamped = delta.clamp(-0xFF, 0xFF);
        let magnitude = clamped.unsigned_abs();
        // Nine-bit two's complement: the sign lives in WHEEL_NEGATIVE.
        let flags = if clamped < 0 {
            (PointerFlags::WHEEL | PointerFlags::WHEEL_NEGATIVE).bits() | ((0x100 - magnitude) & 0xFF)
        } else {
            PointerFlags::WHEEL.bits() | magnitude
        };
        Self::new(0, InputDevice::Mouse as u16, flags, x, y)
    }
}

/// Body of an input PDU carrying `events`.
pub fn encode(events: &[InputEvent]) -> Result<Vec<u8>> {
    build(4 + events.len() * 12, |s| {
        s.write_u16_le(events.len() as u16)?;
        s.write_u16_le(0)?; // pad
        for e in events {
            s.write_u32_le(e.time)?;
            s.write_u16_le(e.device)?;
            s.write_u16_le(e.flags)?;
            s.write_u16_le(e.param1)?;
            s.write_u16_le(e.param2)?;
        }
        Ok(())
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_scancode_release() {
        let e = InputEvent::scancode(0xE04B, false);
        assert_eq!(e.device, 0x0004);
        assert_eq!(e.flags, 0x8100);
        assert_eq!(e.param1, 0x4B);
    }

    #[test]
    fn button_press_carries_position() {
        let e = InputEvent::mouse_button(MouseButton::Right, true, 10, 20);
        assert_eq!(e.flags, 0xA000);
        assert_eq!((e.param1, e.param2), (10, 20));
    }

    #[test]
    fn wheel_direction() {
        assert_eq!(InputEvent::wheel(120, 0, 0).flags, 0x0278);
        assert_eq!(InputEvent::wheel(-120, 0, 0).flags, 0x0388);
    }

    #[test]
    fn batch_encoding() {
        let body = encode(&[InputEvent::synchronize(ToggleKeys::NUM_LOCK), InputEvent::mouse_move(1, 2)]).unwrap();
        assert_eq!(
            body,
            vec![
                2, 0, 0, 0, //
                0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, //
                0, 0, 0, 0, 0x01, 0x80, 0x00, 0x08, 1, 0, 2, 0,
            ]
        );
    }
}
