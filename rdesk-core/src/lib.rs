//! # rdesk-core
//!
//! Client core for the Remote Desktop Protocol, versions 4 and 5.
//!
//! This crate contains:
//! - **Wire layers**: TPKT/X.224 transport, MCS with BER/PER framing,
//!   standard RDP security with RC4 and MAC, licensing
//! - **Session**: capability exchange, activation and data PDU dispatch
//! - **Graphics**: interleaved RLE bitmaps, drawing orders, raster
//!   operations and the framebuffer they draw into
//! - **Caches**: bitmaps, fonts, cursors, colour tables, desktop save
//! - **Channels**: static virtual channel chunking and reassembly
//! - **Config**: `SessionConfig` loaded from TOML via serde
//! - **Error**: `RdpError`, a `thiserror`-based error hierarchy
//!
//! Logging goes through `tracing`; the embedding shell installs the
//! subscriber.

pub mod bitmap;
pub mod cache;
pub mod channel;
pub mod color;
pub mod config;
pub mod error;
pub mod framebuffer;
pub mod gcc;
pub mod mcs;
pub mod orders;
pub mod raster;
pub mod rdp;
pub mod secure;
pub mod stream;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bitmap::Bitmap;
pub use cache::{Cursor, GraphicsCache, MemoryCache};
pub use channel::{ChannelDef, ChannelRegistry, VirtualChannel};
pub use color::{ColorDepth, Palette};
pub use config::{SessionConfig, SessionState};
pub use error::{RdpError, Result};
pub use framebuffer::{Framebuffer, Rect, RegionSnapshot};
pub use orders::OrderProcessor;
pub use rdp::input::{InputDevice, KeyboardFlags, PointerFlags};
pub use rdp::{Client, InputEvent, MouseButton, Session, SessionEvent, SessionSender, ToggleKeys};
pub use secure::licence::{LicenceStore, MemoryLicenceStore};
pub use stream::PacketBuffer;
