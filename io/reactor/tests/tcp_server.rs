//! End-to-end tests driving a real TcpServer over loopback sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use reactor::{Buffer, EventLoopThread, TcpServer, TlsFilter, TlsState, listen_addr};

fn read_exact_with_timeout(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut out = vec![0u8; n];
    stream.read_exact(&mut out).expect("read_exact");
    out
}

fn read_to_end_with_timeout(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).expect("read_to_end");
    out
}

#[test]
fn echoes_bytes_across_io_loops() {
    let main = EventLoopThread::start("echo-main").unwrap();
    let server = TcpServer::new(main.handle(), listen_addr(0, true, false), "echo").unwrap();
    server.set_io_loop_num(2);
    server.set_recv_message_callback(|conn, buf: &mut Buffer| {
        let n = buf.readable_bytes();
        let data = buf.read(n);
        conn.send(&data);
    });
    server.start().unwrap();
    let addr = server.addr();

    let mut handles = Vec::new();
    for i in 0..4 {
        handles.push(std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let payload = format!("hello from client {i}").into_bytes();
            stream.write_all(&payload).unwrap();
            let echoed = read_exact_with_timeout(&mut stream, payload.len());
            assert_eq!(echoed, payload);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn wire_order_matches_send_call_order() {
    let main = EventLoopThread::start("order-main").unwrap();
    let server = TcpServer::new(main.handle(), listen_addr(0, true, false), "order").unwrap();
    server.set_io_loop_num(1);
    // On the trigger byte, interleave same-loop sends with sends issued
    // from a foreign thread through the same connection handle.
    server.set_recv_message_callback(|conn, buf: &mut Buffer| {
        buf.retrieve_all();
        conn.send(b"a");
        conn.send(b"b");
        let remote = conn.clone();
        let t = std::thread::spawn(move || {
            remote.send(b"c");
            remote.send(b"d");
        });
        t.join().unwrap();
        conn.send(b"e");
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream.write_all(b"!").unwrap();
    let got = read_exact_with_timeout(&mut stream, 5);
    assert_eq!(&got, b"abcde");
}

#[test]
fn high_water_mark_fires_once_per_crossing() {
    let main = EventLoopThread::start("hwm-main").unwrap();
    let server = TcpServer::new(main.handle(), listen_addr(0, true, false), "hwm").unwrap();
    server.set_io_loop_num(1);

    let crossings = Arc::new(AtomicUsize::new(0));
    let burst: usize = 32 * 1024;
    let burst_count = 64; // 2 MiB per trigger, far above the mark

    let c = crossings.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            let c = c.clone();
            conn.set_high_water_mark_callback(64 * 1024, move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    server.set_recv_message_callback(move |conn, buf: &mut Buffer| {
        buf.retrieve_all();
        let chunk = vec![0x5au8; burst];
        for _ in 0..burst_count {
            conn.send(&chunk);
        }
    });
    server.start().unwrap();

    // A tiny, pinned receive buffer keeps the kernel from absorbing the
    // burst, so the server's queue really backs up.
    let client = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    client.set_recv_buffer_size(8192).unwrap();
    client.connect(&server.addr().into()).unwrap();
    let mut stream: TcpStream = client.into();
    stream.write_all(b"go").unwrap();

    // Do not read yet: the queue must pile up well past the mark.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(crossings.load(Ordering::SeqCst), 1, "first burst crossings");

    // Drain the first burst, which lets the queue fall below the mark.
    let _ = read_exact_with_timeout(&mut stream, burst * burst_count);

    // A second burst must cross again, exactly once more.
    stream.write_all(b"go").unwrap();
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(crossings.load(Ordering::SeqCst), 2, "second burst crossings");

    let _ = read_exact_with_timeout(&mut stream, burst * burst_count);
}

#[test]
fn idle_connections_are_kicked_off() {
    let main = EventLoopThread::start("idle-main").unwrap();
    let server = TcpServer::new(main.handle(), listen_addr(0, true, false), "idle").unwrap();
    server.set_io_loop_num(1);
    server.kickoff_idle_connections(1);
    server.set_recv_message_callback(|_conn, buf: &mut Buffer| buf.retrieve_all());
    server.start().unwrap();

    let start = Instant::now();
    let mut stream = TcpStream::connect(server.addr()).unwrap();
    // Stay silent; the wheel must close us within timeout + one tick of
    // slack.
    let eof = read_to_end_with_timeout(&mut stream);
    assert!(eof.is_empty());
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(900) && elapsed <= Duration::from_secs(4),
        "kicked after {elapsed:?}"
    );
}

#[test]
fn send_file_streams_the_file_contents() {
    let dir = std::env::temp_dir().join(format!("reactor-sendfile-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("payload.bin");
    let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &contents).unwrap();

    let main = EventLoopThread::start("file-main").unwrap();
    let server = TcpServer::new(main.handle(), listen_addr(0, true, false), "file").unwrap();
    server.set_io_loop_num(1);
    let send_path = path.clone();
    server.set_recv_message_callback(move |conn, buf: &mut Buffer| {
        buf.retrieve_all();
        conn.send(b"head:");
        conn.send_file_path(&send_path, 0, 0).unwrap();
        conn.shutdown();
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream.write_all(b"file").unwrap();
    let got = read_to_end_with_timeout(&mut stream);
    assert_eq!(&got[..5], b"head:");
    assert_eq!(&got[5..], &contents[..]);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn send_stream_pulls_until_producer_ends() {
    let main = EventLoopThread::start("stream-main").unwrap();
    let server = TcpServer::new(main.handle(), listen_addr(0, true, false), "stream").unwrap();
    server.set_io_loop_num(1);

    let total: usize = 300_000;
    server.set_recv_message_callback(move |conn, buf: &mut Buffer| {
        buf.retrieve_all();
        let mut produced = 0usize;
        conn.send_stream(move |scratch| {
            if produced >= total {
                return 0;
            }
            let n = scratch.len().min(total - produced);
            for (i, byte) in scratch[..n].iter_mut().enumerate() {
                *byte = ((produced + i) % 253) as u8;
            }
            produced += n;
            n
        });
        conn.shutdown();
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream.write_all(b"pull").unwrap();
    let got = read_to_end_with_timeout(&mut stream);
    assert_eq!(got.len(), total);
    for (i, byte) in got.iter().enumerate() {
        assert_eq!(*byte, (i % 253) as u8, "mismatch at offset {i}");
    }
}

/// Toy filter exercising the TLS plumbing: the "handshake" is the client
/// greeting `HELLO`, answered with `OLLEH`; application bytes then pass
/// through unchanged.
struct GreetingFilter {
    established: bool,
    held: Vec<u8>,
}

impl TlsFilter for GreetingFilter {
    fn read_ciphertext(
        &mut self,
        input: &[u8],
        plaintext: &mut Buffer,
        outbound: &mut Buffer,
    ) -> std::io::Result<TlsState> {
        self.held.extend_from_slice(input);
        if !self.established {
            if self.held.len() < 5 {
                return Ok(TlsState::Handshaking);
            }
            if &self.held[..5] != b"HELLO" {
                return Err(std::io::Error::other("bad greeting"));
            }
            outbound.append(b"OLLEH");
            self.established = true;
            self.held.drain(..5);
        }
        plaintext.append(&self.held);
        self.held.clear();
        Ok(TlsState::Established)
    }

    fn write_plaintext(&mut self, input: &[u8], outbound: &mut Buffer) -> std::io::Result<()> {
        outbound.append(input);
        Ok(())
    }

    fn close(&mut self, outbound: &mut Buffer) {
        outbound.append(b"BYE!!");
    }

    fn is_established(&self) -> bool {
        self.established
    }
}

#[test]
fn tls_filter_handshake_and_echo() {
    use reactor::TcpConnection;

    let main = EventLoopThread::start("tls-main").unwrap();
    let handle = main.handle().clone();

    // Hand-roll the accept so the connection carries a filter.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let fd = std::os::fd::OwnedFd::from(stream);
        let conn = TcpConnection::new(
            &handle,
            fd,
            peer,
            Some(Box::new(GreetingFilter {
                established: false,
                held: Vec::new(),
            })),
        );
        conn.set_recv_message_callback(|conn, buf: &mut Buffer| {
            let n = buf.readable_bytes();
            let data = buf.read(n);
            conn.send(&data);
        });
        conn.connect_established();
        // Keep the connection alive while the client talks to it.
        std::thread::sleep(Duration::from_secs(2));
        drop(conn);
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"HELLO").unwrap();
    let greeting = read_exact_with_timeout(&mut stream, 5);
    assert_eq!(&greeting, b"OLLEH");

    stream.write_all(b"application bytes").unwrap();
    let echoed = read_exact_with_timeout(&mut stream, b"application bytes".len());
    assert_eq!(&echoed, b"application bytes");

    server_thread.join().unwrap();
}
