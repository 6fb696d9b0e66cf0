//! RDP session: activation, data PDU dispatch and the client API.
//!
//! [`Client`] collects the configuration and collaborators, then
//! [`Client::connect`] runs every connection phase and returns a
//! [`Session`]. The session's receive loop owns the framebuffer; the
//! shell watches [`SessionEvent`]s and sends input through a cloneable
//! [`SessionSender`].
//!
//! # Send lock
//!
//! All outbound packets go through one `tokio::sync::Mutex` around the
//! security layer writer. A packet is initialised, signed, encrypted and
//! written while holding it, so input from the shell never interleaves
//! with the receive loop's own replies or races a key update.

pub mod caps;
pub mod input;
pub mod pdu;
pub mod update;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::cache::{Cursor, GraphicsCache, MemoryCache};
use crate::channel::{ChannelRegistry, VirtualChannel};
use crate::color::ColorDepth;
use crate::config::{SessionConfig, SessionState};
use crate::error::{RdpError, Result};
use crate::framebuffer::{Framebuffer, RegionSnapshot};
use crate::secure::licence::{LicenceStore, Licensing, MemoryLicenceStore};
use crate::secure::{self, Inbound, SEC_LICENCE_NEG, SecureReader, SecureWriter};
use crate::stream::PacketBuffer;
use crate::transport;

use caps::ClientCaps;
use pdu::{
    CTRL_COOPERATE, CTRL_REQUEST_CONTROL, DATA_BELL, DATA_CONTROL, DATA_FONT2, DATA_FONTMAP,
    DATA_INPUT, DATA_LOGON, DATA_POINTER, DATA_SET_ERROR_INFO, DATA_SYNCHRONISE, DATA_UPDATE,
    PDU_DATA, PDU_DEACTIVATE_ALL, PDU_DEMAND_ACTIVE,
};

pub use input::{InputEvent, MouseButton, ToggleKeys};
pub use update::Screen;

// ── SessionEvent ─────────────────────────────────────────────────

/// Notifications for the shell.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Pixels changed; the snapshot holds `0x00RRGGBB` values.
    Repaint(RegionSnapshot),
    PointerMove { x: u16, y: u16 },
    PointerShape(Cursor),
    PointerHidden,
    PointerDefault,
    Bell,
    /// The server changed the desktop geometry or depth.
    Resize {
        width: u16,
        height: u16,
        depth: ColorDepth,
    },
    /// The user finished logging on.
    Logon,
    /// The session ended; `0` when the server gave no reason.
    Disconnected(u32),
}

// ── Client ───────────────────────────────────────────────────────

/// Builder for a session.
pub struct Client {
    config: SessionConfig,
    cache: Box<dyn GraphicsCache>,
    licence_store: Box<dyn LicenceStore>,
    channels: ChannelRegistry,
}

impl Client {
    /// Validate `config` and prepare its channels.
    ///
    /// Caches and licences default to in-memory stores.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let channels = ChannelRegistry::from_config(&config)?;
        Ok(Self {
            config,
            cache: Box::new(MemoryCache::new()),
            licence_store: Box::new(MemoryLicenceStore::new()),
            channels,
        })
    }

    pub fn with_cache(mut self, cache: Box<dyn GraphicsCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_licence_store(mut self, store: Box<dyn LicenceStore>) -> Self {
        self.licence_store = store;
        self
    }

    /// Attach a handler for a static virtual channel.
    pub fn register_channel(&mut self, handler: Box<dyn VirtualChannel>) -> Result<()> {
        self.channels.register(handler)
    }

    /// Connect over TCP to the configured server.
    pub async fn connect(self) -> Result<Session<TcpStream>> {
        let server = &self.config.server;
        let timeout = Duration::from_millis(server.connect_timeout_ms);
        let stream = transport::open(&server.host, server.port, timeout).await?;
        let client_addr = stream
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| "0.0.0.0".into());
        self.connect_stream(stream, &client_addr).await
    }

    /// Run the connection phases over an already open byte stream.
    ///
    /// `client_addr` is reported in the extended logon packet.
    pub async fn connect_stream<S>(self, stream: S, client_addr: &str) -> Result<Session<S>>
    where
        S: AsyncRead + AsyncWrite,
    {
        let Client {
            config,
            cache,
            licence_store,
            mut channels,
        } = self;
        let mut state = SessionState::new(&config);

        let (reader, mut writer, server) =
            secure::connect(stream, &config, &mut channels, state.licence_issued.clone()).await?;
        state.encryption = writer.encryption();
        state.server_rdp_version = server.rdp_version;
        state.user_id = writer.user_id();
        state.rdp5 = config.features.rdp5 && server.rdp_version >= 5;

        let logon = pdu::logon_info(&config, state.rdp5, client_addr)?;
        pdu::send_logon_info(&mut writer, &logon).await?;
        info!(
            user = %config.login.username,
            encryption = state.encryption,
            rdp5 = state.rdp5,
            "logon info sent"
        );

        let licensing = Licensing::new(
            &config.server.host,
            &config.login.username,
            &config.login.client_hostname,
            licence_store,
            state.licence_issued.clone(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fb = Framebuffer::new(state.width, state.height, state.depth);

        Ok(Session {
            config,
            state,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            share_id: Arc::new(AtomicU32::new(0)),
            screen: Screen::new(fb, cache, events_tx),
            licensing,
            channels,
            events: Some(events_rx),
        })
    }
}

// ── Session ──────────────────────────────────────────────────────

pub struct Session<S> {
    config: SessionConfig,
    state: SessionState,
    reader: SecureReader<ReadHalf<S>>,
    writer: Arc<Mutex<SecureWriter<WriteHalf<S>>>>,
    share_id: Arc<AtomicU32>,
    screen: Screen,
    licensing: Licensing,
    channels: ChannelRegistry,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl<S: AsyncRead + AsyncWrite> Session<S> {
    /// Take the event receiver. Only the first call returns it.
    pub fn subscribe(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// A handle for sending input from other tasks.
    pub fn sender(&self) -> SessionSender<S> {
        SessionSender {
            writer: Arc::clone(&self.writer),
            share_id: Arc::clone(&self.share_id),
        }
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        self.screen.framebuffer()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Receive and process PDUs until the server ends the session.
    ///
    /// Returns `Ok` after a disconnect ultimatum and
    /// [`RdpError::Disconnected`] when the server gave an error reason.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let Some(inbound) = self.reader.receive(&mut self.screen).await? else {
                info!("server closed the session");
                self.screen.emit(SessionEvent::Disconnected(0));
                return Ok(());
            };
            match inbound {
                Inbound::Global(mut s) => self.process_global(&mut s).await?,
                Inbound::Licence(mut s) => self.process_licence(&mut s).await?,
                Inbound::Channel(id, mut s) => self.process_channel(id, &mut s).await?,
            }
            self.screen.flush();
        }
    }

    /// Every share PDU in one packet on the global channel.
    async fn process_global(&mut self, s: &mut PacketBuffer) -> Result<()> {
        while s.has_remaining() {
            let header = pdu::read_share_control(s)?;
            match header.pdu_type {
                Some(PDU_DEMAND_ACTIVE) => self.process_demand_active(s).await?,
                Some(PDU_DATA) => self.process_data(s)?,
                Some(PDU_DEACTIVATE_ALL) => {
                    debug!("deactivate all");
                    self.screen.reset_orders();
                }
                Some(other) => warn!(pdu_type = other, "unimplemented PDU type"),
                None => debug!("keep-alive"),
            }
            s.set_position(header.next)?;
        }
        Ok(())
    }

    /// Answer a demand active PDU and run the activation sequence.
    async fn process_demand_active(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let share_id = s.read_u32_le()?;
        let source_len = s.read_u16_le()? as usize;
        let caps_len = s.read_u16_le()? as usize;
        s.skip(source_len)?;
        let server_caps = caps::parse_server_caps(s, caps_len)?;

        if server_caps.rdp5 == Some(false) && self.state.rdp5 {
            debug!("server turned off RDP5 features");
            self.state.rdp5 = false;
        }
        if let Some((bits, width, height)) = server_caps.bitmap {
            match ColorDepth::from_bits(bits) {
                Ok(depth) => {
                    self.state.width = width;
                    self.state.height = height;
                    self.state.depth = depth;
                    self.screen.resize(width, height, depth);
                }
                Err(e) => warn!("keeping the requested depth: {e}"),
            }
        }
        self.state.share_id = share_id;
        self.share_id.store(share_id, Ordering::Release);

        let features = &self.config.features;
        let client_caps = ClientCaps {
            width: self.state.width,
            height: self.state.height,
            depth: self.state.depth,
            rdp5: self.state.rdp5,
            bitmap_compression: features.bitmap_compression,
            bitmap_cache: features.bitmap_cache,
            desktop_save: features.desktop_save,
        };
        let caps = client_caps.encode()?;
        let sync = input::encode(&[InputEvent::synchronize(ToggleKeys::empty())])?;

        let mut guard = self.writer.lock().await;
        let writer = &mut *guard;
        pdu::send_confirm_active(writer, share_id, caps::SOURCE, ClientCaps::COUNT, &caps).await?;
        pdu::send_data(writer, share_id, DATA_SYNCHRONISE, &pdu::synchronise()?).await?;
        pdu::send_data(writer, share_id, DATA_CONTROL, &pdu::control(CTRL_COOPERATE)?).await?;
        pdu::send_data(writer, share_id, DATA_CONTROL, &pdu::control(CTRL_REQUEST_CONTROL)?).await?;
        pdu::send_data(writer, share_id, DATA_INPUT, &sync).await?;
        pdu::send_data(writer, share_id, DATA_FONT2, &pdu::font_list(1)?).await?;
        pdu::send_data(writer, share_id, DATA_FONT2, &pdu::font_list(2)?).await?;
        drop(guard);

        self.screen.reset_orders();
        info!(
            share_id,
            width = self.state.width,
            height = self.state.height,
            bits = self.state.depth.bits(),
            "session activated"
        );
        Ok(())
    }

    /// One data PDU. Unsupported content drops the rest of the PDU only.
    fn process_data(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let header = pdu::read_share_data(s)?;
        if header.compressed {
            warn!(kind = header.kind, "compressed data PDU skipped");
            return Ok(());
        }
        let result = match header.kind {
            DATA_UPDATE => self.screen.process_update(s),
            DATA_POINTER => self.screen.process_pointer(s),
            DATA_BELL => {
                self.screen.emit(SessionEvent::Bell);
                Ok(())
            }
            DATA_LOGON => {
                let info_type = s.read_u32_le()?;
                info!(info_type, "logon completed");
                self.screen.emit(SessionEvent::Logon);
                Ok(())
            }
            DATA_SET_ERROR_INFO => self.set_error_info(s),
            DATA_SYNCHRONISE | DATA_CONTROL | DATA_FONTMAP => {
                debug!(kind = header.kind, "activation reply");
                Ok(())
            }
            other => {
                warn!(kind = other, "unimplemented data PDU");
                Ok(())
            }
        };
        match result {
            Err(e) if e.is_batch_local() => {
                warn!(kind = header.kind, "data PDU abandoned: {e}");
                Ok(())
            }
            other => other,
        }
    }

    fn set_error_info(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let reason = s.read_u32_le()?;
        if reason == 0 {
            debug!("error info cleared");
            return Ok(());
        }
        warn!(reason, "server reported a disconnect reason");
        self.screen.emit(SessionEvent::Disconnected(reason));
        Err(RdpError::Disconnected(reason))
    }

    async fn process_licence(&mut self, s: &mut PacketBuffer) -> Result<()> {
        let Some(reply) = self.licensing.process(s) else {
            return Ok(());
        };
        let mut writer = self.writer.lock().await;
        let mut out = writer.init(SEC_LICENCE_NEG, reply.len())?;
        out.write_bytes(&reply)?;
        out.mark_end();
        writer.send(out, SEC_LICENCE_NEG).await
    }

    async fn process_channel(&mut self, id: u16, s: &mut PacketBuffer) -> Result<()> {
        let replies = self.channels.process(id, s)?;
        if replies.is_empty() {
            return Ok(());
        }
        let Some(def) = self.channels.defs().into_iter().find(|d| d.id == id) else {
            return Ok(());
        };
        let mut writer = self.writer.lock().await;
        for reply in replies {
            writer.send_channel(&def, &reply).await?;
        }
        Ok(())
    }
}

// ── SessionSender ────────────────────────────────────────────────

/// Cloneable handle for sending input while the session runs.
pub struct SessionSender<S> {
    writer: Arc<Mutex<SecureWriter<WriteHalf<S>>>>,
    share_id: Arc<AtomicU32>,
}

impl<S> Clone for SessionSender<S> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            share_id: Arc::clone(&self.share_id),
        }
    }
}

impl<S: AsyncWrite> SessionSender<S> {
    /// Send a batch of input events as one input PDU.
    pub async fn send_input(&self, events: &[InputEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let body = input::encode(events)?;
        let share_id = self.share_id.load(Ordering::Acquire);
        let mut writer = self.writer.lock().await;
        pdu::send_data(&mut *writer, share_id, DATA_INPUT, &body).await
    }
}

// ── Tests ────────────────────────────────────────────────────────
