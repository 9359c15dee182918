//! End-to-end framed-protocol tests over loopback sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use protocol_framed::{FrameMode, FrameServer, PONG_TYPE, encode_json, encode_opaque};
use reactor::{EventLoopThread, listen_addr};

/// Read one `u32 LE length || payload` frame off a blocking socket.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

#[test]
fn structured_handler_dispatches_exactly_once() {
    let main = EventLoopThread::start("framed-main").unwrap();
    let server = FrameServer::new(
        main.handle(),
        listen_addr(0, true, false),
        FrameMode::Structured,
    )
    .unwrap();
    server.set_io_loop_num(1);

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    server.register_structured_handler(1, move |conn, value| {
        c.fetch_add(1, Ordering::SeqCst);
        assert_eq!(value.get("data").and_then(|d| d.as_str()), Some("x"));
        FrameServer::send_json(
            conn,
            &serde_json::json!({ "type": 2, "echo": value.get("data") }),
        );
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let frame = encode_json(&serde_json::json!({ "type": 1, "data": "x" }));
    stream.write_all(frame.peek()).unwrap();

    let reply = read_frame(&mut stream).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(value.get("type").and_then(|t| t.as_u64()), Some(2));
    assert_eq!(value.get("echo").and_then(|e| e.as_str()), Some("x"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn structured_frame_split_across_writes_still_dispatches() {
    let main = EventLoopThread::start("split-main").unwrap();
    let server = FrameServer::new(
        main.handle(),
        listen_addr(0, true, false),
        FrameMode::Structured,
    )
    .unwrap();
    server.set_io_loop_num(1);
    server.register_structured_handler(7, |conn, _value| {
        FrameServer::send_json(conn, &serde_json::json!({ "type": 8 }));
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let frame = encode_json(&serde_json::json!({ "type": 7 }));
    let bytes = frame.peek();
    // Dribble the frame out byte pairs at a time.
    for chunk in bytes.chunks(2) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let reply = read_frame(&mut stream).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(value.get("type").and_then(|t| t.as_u64()), Some(8));
}

#[test]
fn opaque_handler_gets_body_after_type() {
    let main = EventLoopThread::start("opaque-main").unwrap();
    let server = FrameServer::new(
        main.handle(),
        listen_addr(0, true, false),
        FrameMode::Opaque,
    )
    .unwrap();
    server.set_io_loop_num(1);
    server.register_opaque_handler(42, |conn, body| {
        assert_eq!(body, b"raw bytes");
        FrameServer::send_opaque(conn, 43, b"ack");
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(encode_opaque(42, b"raw bytes").peek())
        .unwrap();

    let reply = read_frame(&mut stream).unwrap();
    assert_eq!(&reply[..4], &43u32.to_le_bytes());
    assert_eq!(&reply[4..], b"ack");
}

#[test]
fn silent_peer_is_closed_within_liveness_window() {
    let main = EventLoopThread::start("liveness-main").unwrap();
    let server = FrameServer::new(
        main.handle(),
        listen_addr(0, true, false),
        FrameMode::Structured,
    )
    .unwrap();
    server.set_io_loop_num(1);
    server.set_ping_pong(2, 1);
    server.start().unwrap();

    let start = Instant::now();
    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(8)))
        .unwrap();

    // Accept pings, never reply; the server must close us no later than
    // interval + timeout + 1s.
    let mut eof_at = None;
    loop {
        match read_frame(&mut stream) {
            Ok(payload) => {
                let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                assert_eq!(value.get("type").and_then(|t| t.as_u64()), Some(100));
            }
            Err(_) => {
                eof_at = Some(start.elapsed());
                break;
            }
        }
    }
    let elapsed = eof_at.expect("connection should be closed");
    assert!(
        elapsed >= Duration::from_millis(2900) && elapsed <= Duration::from_millis(4500),
        "closed after {elapsed:?}, expected between 3.0s and 4.0s"
    );
}

#[test]
fn pong_keeps_the_connection_alive() {
    let main = EventLoopThread::start("pong-main").unwrap();
    let server = FrameServer::new(
        main.handle(),
        listen_addr(0, true, false),
        FrameMode::Structured,
    )
    .unwrap();
    server.set_io_loop_num(1);
    server.set_ping_pong(1, 1);
    server.register_structured_handler(1, |conn, _| {
        FrameServer::send_json(conn, &serde_json::json!({ "type": 2 }));
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // Answer every ping for well past interval + timeout + 1s.
    let deadline = Instant::now() + Duration::from_millis(4500);
    while Instant::now() < deadline {
        let payload = read_frame(&mut stream).expect("closed despite pongs");
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        if value.get("type").and_then(|t| t.as_u64()) == Some(100) {
            stream
                .write_all(encode_json(&serde_json::json!({ "type": PONG_TYPE })).peek())
                .unwrap();
        }
    }

    // Still alive: a request must round-trip.
    stream
        .write_all(encode_json(&serde_json::json!({ "type": 1 })).peek())
        .unwrap();
    loop {
        let payload = read_frame(&mut stream).expect("echo after pongs");
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        match value.get("type").and_then(|t| t.as_u64()) {
            Some(2) => break,
            Some(100) => {
                stream
                    .write_all(encode_json(&serde_json::json!({ "type": PONG_TYPE })).peek())
                    .unwrap();
            }
            other => panic!("unexpected frame type {other:?}"),
        }
    }
}

#[test]
fn garbage_frame_closes_without_reply() {
    let main = EventLoopThread::start("garbage-main").unwrap();
    let server = FrameServer::new(
        main.handle(),
        listen_addr(0, true, false),
        FrameMode::Structured,
    )
    .unwrap();
    server.set_io_loop_num(1);
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // Valid length prefix, invalid JSON payload.
    let mut bad = (7u32.to_le_bytes()).to_vec();
    bad.extend_from_slice(b"not{json");
    bad.truncate(4 + 7);
    stream.write_all(&bad).unwrap();

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("peer close");
    assert!(rest.is_empty(), "no reply expected, got {rest:?}");
}
