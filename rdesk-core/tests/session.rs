//! Integration tests: a full session against a scripted server over a
//! real TCP connection on localhost.

use std::time::Duration;

use rdesk_core::{
    Client, ColorDepth, InputEvent, Rect, RdpError, SessionConfig, SessionEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

const USER_ID: u16 = 7;
const GLOBAL: u16 = 1003;
const SHARE_ID: u32 = 0x0001_03EA;

// ── Helpers ──────────────────────────────────────────────────────

async fn ephemeral_listener() -> (TcpListener, SessionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = SessionConfig::default();
    config.server.host = addr.ip().to_string();
    config.server.port = addr.port();
    config.security.encryption = false;
    config.login.username = "alice".into();
    (listener, config)
}

fn tpkt(payload: &[u8]) -> Vec<u8> {
    let mut v = vec![3, 0];
    v.extend_from_slice(&((payload.len() + 7) as u16).to_be_bytes());
    v.extend_from_slice(&[2, 0xF0, 0x80]);
    v.extend_from_slice(payload);
    v
}

/// Send-data indication on `channel`.
fn indication(channel: u16, payload: &[u8]) -> Vec<u8> {
    let [c0, c1] = channel.to_be_bytes();
    let len = payload.len() as u16 | 0x8000;
    let mut v = vec![26 << 2, 0, USER_ID as u8, c0, c1, 0x70];
    v.extend_from_slice(&len.to_be_bytes());
    v.extend_from_slice(payload);
    tpkt(&v)
}

/// Read one client frame and return it without its TPKT header.
async fn read_frame(io: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    io.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 3, "client sent a non-TPKT frame");
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut rest = vec![0u8; len - 4];
    io.read_exact(&mut rest).await.unwrap();
    rest
}

/// Share control type of a client frame sent without a security header.
fn pdu_type(frame: &[u8]) -> u16 {
    // X.224 data header, then the eight-byte MCS send-data request.
    let at = 3 + 8 + 2;
    u16::from_le_bytes([frame[at], frame[at + 1]])
}

/// Data PDU type of a client data PDU sent without a security header.
fn data_type(frame: &[u8]) -> u8 {
    frame[3 + 8 + 14]
}

fn share_data(kind: u8, body: &[u8]) -> Vec<u8> {
    let length = 18 + body.len();
    let mut v = Vec::new();
    v.extend_from_slice(&(length as u16).to_le_bytes());
    v.extend_from_slice(&0x17u16.to_le_bytes());
    v.extend_from_slice(&1002u16.to_le_bytes());
    v.extend_from_slice(&SHARE_ID.to_le_bytes());
    v.extend_from_slice(&[0, 1]);
    v.extend_from_slice(&((length - 14) as u16).to_le_bytes());
    v.extend_from_slice(&[kind, 0, 0, 0]);
    v.extend_from_slice(body);
    v
}

fn demand_active() -> Vec<u8> {
    // Bitmap capability set: 8 bpp, 64x48.
    let mut bitmap = vec![2, 0, 28, 0, 8, 0, 1, 0, 1, 0, 1, 0, 64, 0, 48, 0];
    bitmap.resize(28, 0);
    let mut caps = vec![1, 0, 0, 0];
    caps.extend_from_slice(&bitmap);

    let source = b"RDP\0";
    let mut body = SHARE_ID.to_le_bytes().to_vec();
    body.extend_from_slice(&(source.len() as u16).to_le_bytes());
    body.extend_from_slice(&(caps.len() as u16).to_le_bytes());
    body.extend_from_slice(source);
    body.extend_from_slice(&caps);

    let mut v = ((6 + body.len()) as u16).to_le_bytes().to_vec();
    v.extend_from_slice(&0x11u16.to_le_bytes());
    v.extend_from_slice(&1002u16.to_le_bytes());
    v.extend_from_slice(&body);
    v
}

/// A 4x4 bitmap of palette index 9 at the origin, RLE without header.
fn bitmap_update() -> Vec<u8> {
    let mut v = vec![1, 0, 1, 0];
    for f in [0u16, 0, 3, 3, 4, 4, 8, 0x0401, 2] {
        v.extend_from_slice(&f.to_le_bytes());
    }
    v.extend_from_slice(&[0x70, 9]);
    v
}

/// Drive the client through connection and activation.
async fn handshake(io: &mut TcpStream) {
    read_frame(io).await; // X.224 connection request
    io.write_all(&[3, 0, 0, 11, 6, 0xD0, 0, 0, 0x12, 0x34, 0]).await.unwrap();

    read_frame(io).await; // MCS connect initial
    let mut gcc = vec![0u8; 21];
    let core = [0x01, 0x0C, 8, 0, 4, 0, 8, 0];
    gcc.push(core.len() as u8);
    gcc.extend_from_slice(&core);
    let mut body = vec![0x0A, 1, 0, 0x02, 1, 0, 0x30, 0, 0x04, gcc.len() as u8];
    body.extend_from_slice(&gcc);
    let mut response = vec![0x7F, 0x66, body.len() as u8];
    response.extend_from_slice(&body);
    io.write_all(&tpkt(&response)).await.unwrap();

    read_frame(io).await; // erect domain
    read_frame(io).await; // attach user
    io.write_all(&tpkt(&[(11 << 2) | 2, 0, 0, USER_ID as u8])).await.unwrap();
    for channel in [1001 + USER_ID, GLOBAL] {
        let frame = read_frame(io).await;
        assert_eq!(&frame[6..8], &channel.to_be_bytes());
        let [c0, c1] = channel.to_be_bytes();
        io.write_all(&tpkt(&[(15 << 2) | 2, 0, 0, USER_ID as u8, c0, c1, c0, c1]))
            .await
            .unwrap();
    }

    let logon = read_frame(io).await;
    assert_eq!(logon[3 + 8], 0x40, "logon info flag");

    // Licence result: valid client.
    let licence = [0x80, 0, 0, 0, 0xFF, 2, 8, 0, 7, 0, 0, 0];
    io.write_all(&indication(GLOBAL, &licence)).await.unwrap();

    io.write_all(&indication(GLOBAL, &demand_active())).await.unwrap();
    let confirm = read_frame(io).await;
    assert_eq!(pdu_type(&confirm), 0x13);
    let mut kinds = Vec::new();
    for _ in 0..6 {
        kinds.push(data_type(&read_frame(io).await));
    }
    assert_eq!(kinds, vec![31, 20, 20, 28, 39, 39]);
}

async fn collect(mut rx: UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }
    events
}

// ── Session lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_activation_and_bitmap_update() {
    let (listener, config) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut io, _) = listener.accept().await.unwrap();
        handshake(&mut io).await;

        // Bitmap update and bell packed into one packet.
        let mut packet = share_data(2, &bitmap_update());
        packet.extend_from_slice(&share_data(34, &[]));
        io.write_all(&indication(GLOBAL, &packet)).await.unwrap();
        io.write_all(&tpkt(&[8 << 2, 0x80])).await.unwrap(); // ultimatum
        io
    });

    let mut session = Client::new(config).unwrap().connect().await.unwrap();
    let rx = session.subscribe().unwrap();
    assert!(session.subscribe().is_none());

    tokio::time::timeout(Duration::from_secs(5), session.run())
        .await
        .expect("timeout")
        .unwrap();

    let state = session.state();
    assert_eq!(state.share_id, SHARE_ID);
    assert_eq!(state.user_id, USER_ID);
    assert_eq!(state.server_rdp_version, 5);
    assert!(state.is_licence_issued());

    let fb = session.framebuffer();
    assert_eq!((fb.width(), fb.height(), fb.depth()), (64, 48, ColorDepth::Bpp8));
    assert_eq!(fb.get_pixel(0, 0), 9);
    assert_eq!(fb.get_pixel(3, 3), 9);
    assert_eq!(fb.get_pixel(4, 4), 0);

    drop(session);
    let events = collect(rx).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Resize { width: 64, height: 48, depth: ColorDepth::Bpp8 }
    )));
    assert!(events.iter().any(
        |e| matches!(e, SessionEvent::Repaint(snap) if snap.rect == Rect::new(0, 0, 4, 4))
    ));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Bell)));
    assert!(matches!(events.last(), Some(SessionEvent::Disconnected(0))));

    server.await.unwrap();
}

#[tokio::test]
async fn test_error_info_ends_session() {
    let (listener, config) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut io, _) = listener.accept().await.unwrap();
        handshake(&mut io).await;
        // Error info zero is only a status report.
        io.write_all(&indication(GLOBAL, &share_data(47, &[0, 0, 0, 0])))
            .await
            .unwrap();
        io.write_all(&indication(GLOBAL, &share_data(47, &[0x0C, 0, 0, 0])))
            .await
            .unwrap();
        io
    });

    let mut session = Client::new(config).unwrap().connect().await.unwrap();
    let mut rx = session.subscribe().unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), session.run())
        .await
        .expect("timeout")
        .err()
        .unwrap();
    assert!(matches!(err, RdpError::Disconnected(0x0C)));

    let mut last = None;
    while let Ok(e) = rx.try_recv() {
        last = Some(e);
    }
    assert!(matches!(last, Some(SessionEvent::Disconnected(0x0C))));

    server.await.unwrap();
}

#[tokio::test]
async fn test_input_is_sent_after_activation() {
    let (listener, config) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut io, _) = listener.accept().await.unwrap();
        handshake(&mut io).await;

        let input = read_frame(&mut io).await;
        assert_eq!(data_type(&input), 28);
        let at = 3 + 8 + 6;
        assert_eq!(&input[at..at + 4], &SHARE_ID.to_le_bytes());
        let body = &input[3 + 8 + 18..];
        assert_eq!(u16::from_le_bytes([body[0], body[1]]), 2);

        io.write_all(&tpkt(&[8 << 2, 0x80])).await.unwrap();
        io
    });

    let mut session = Client::new(config).unwrap().connect().await.unwrap();
    let mut rx = session.subscribe().unwrap();
    let sender = session.sender();
    let run = tokio::spawn(async move { session.run().await });

    // The framebuffer resize is flushed once activation replies are out.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(SessionEvent::Repaint(_))) => break,
            Ok(Some(_)) => continue,
            other => panic!("no repaint after activation: {other:?}"),
        }
    }
    sender
        .send_input(&[InputEvent::scancode(0x1E, true), InputEvent::scancode(0x1E, false)])
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("timeout")
        .unwrap()
        .unwrap();
    server.await.unwrap();
}
