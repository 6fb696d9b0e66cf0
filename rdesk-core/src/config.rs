//! Session configuration and runtime session state.
//!
//! [`SessionConfig`] is built once before connecting and never changes.
//! Everything negotiated on the wire lives in [`SessionState`], owned by
//! the session and passed down to the layers that need it.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::color::ColorDepth;
use crate::error::{RdpError, Result};

/// Most static virtual channels a client may request.
pub const MAX_CHANNELS: usize = 31;

/// Longest channel name, excluding the terminator.
pub const MAX_CHANNEL_NAME: usize = 7;

// ── Channel option flags ─────────────────────────────────────────

pub const CHANNEL_OPTION_INITIALIZED: u32 = 0x8000_0000;
pub const CHANNEL_OPTION_ENCRYPT_RDP: u32 = 0x4000_0000;
pub const CHANNEL_OPTION_COMPRESS_RDP: u32 = 0x0080_0000;
pub const CHANNEL_OPTION_SHOW_PROTOCOL: u32 = 0x0020_0000;

/// Top-level configuration for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub server: ServerConfig,
    pub display: DisplayConfig,
    pub login: LoginConfig,
    pub security: SecurityConfig,
    pub features: FeatureConfig,
    pub logging: LoggingConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelConfig>,
}

/// Where to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

/// Requested desktop geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u16,
    pub height: u16,
    pub depth: ColorDepth,
}

/// Credentials and the shell to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub shell: String,
    pub directory: String,
    /// Name this client reports to the server.
    pub client_hostname: String,
    /// Log on without prompting when a password is set.
    pub autologon: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Negotiate standard RDP encryption.
    pub encryption: bool,
    pub keyboard_layout: u32,
    /// Attach to the console session.
    pub console: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub bitmap_compression: bool,
    pub bitmap_cache: bool,
    pub desktop_save: bool,
    /// Use the extended logon packet and fast-path updates.
    pub rdp5: bool,
    /// Experience flags sent with the extended logon packet.
    pub performance_flags: u32,
}

/// A static virtual channel to request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub flags: u32,
}

/// Carried for the embedding shell, which owns the subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3389,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            depth: ColorDepth::default(),
        }
    }
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            shell: String::new(),
            directory: String::new(),
            client_hostname: "rdesk".into(),
            autologon: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption: true,
            keyboard_layout: 0x409,
            console: false,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            bitmap_compression: true,
            bitmap_cache: true,
            desktop_save: true,
            rdp5: true,
            performance_flags: 0x07,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SessionConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RdpError::Config(format!("{}: {e}", path.display())))?;
        let cfg: Self = toml::from_str(&contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML file, falling back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("unusable config {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RdpError::Config(e.to_string()))
    }

    /// Reject values no server would accept.
    pub fn validate(&self) -> Result<()> {
        let d = &self.display;
        if d.width == 0 || d.height == 0 || d.width > 4096 || d.height > 2048 {
            return Err(RdpError::Config(format!(
                "unsupported geometry {}x{}",
                d.width, d.height
            )));
        }
        if self.channels.len() > MAX_CHANNELS {
            return Err(RdpError::Config(format!(
                "{} channels requested, at most {MAX_CHANNELS} allowed",
                self.channels.len()
            )));
        }
        for ch in &self.channels {
            if ch.name.is_empty() || ch.name.len() > MAX_CHANNEL_NAME || !ch.name.is_ascii() {
                return Err(RdpError::Config(format!("invalid channel name {:?}", ch.name)));
            }
        }
        Ok(())
    }

    /// Desktop width rounded up to a multiple of four, as servers expect.
    pub fn aligned_width(&self) -> u16 {
        (self.display.width.saturating_add(3)) & !3
    }
}

// ── SessionState ─────────────────────────────────────────────────

/// Runtime values negotiated with the server.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Standard RDP encryption is active on this connection.
    pub encryption: bool,
    /// Shared with the send path, which drops the security header once set.
    pub licence_issued: Arc<AtomicBool>,
    /// 4 or 5, from the server core data.
    pub server_rdp_version: u32,
    pub width: u16,
    pub height: u16,
    pub depth: ColorDepth,
    pub share_id: u32,
    pub user_id: u16,
    /// Extended logon and fast-path in use.
    pub rdp5: bool,
}

impl SessionState {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            encryption: config.security.encryption,
            licence_issued: Arc::new(AtomicBool::new(false)),
            server_rdp_version: 4,
            width: config.aligned_width(),
            height: config.display.height,
            depth: config.display.depth,
            share_id: 0,
            user_id: 0,
            rdp5: config.features.rdp5,
        }
    }

    pub fn is_licence_issued(&self) -> bool {
        self.licence_issued.load(Ordering::Acquire)
    }
}

// ── Tests ────────────────────────────────────────────────────────
