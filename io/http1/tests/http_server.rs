//! End-to-end HTTP tests over loopback sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use http1::{HttpServer, Status};
use reactor::{EventLoopThread, listen_addr};

/// Read one response (head + Content-Length-bounded body) off a blocking
/// socket. Returns (status-line, raw-head, body).
fn read_response(stream: &mut TcpStream) -> (String, String, Vec<u8>) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("head byte");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let status_line = head.lines().next().unwrap().to_string();

    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("body");
    (status_line, head, body)
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

#[test]
fn missing_route_is_404_and_closes() {
    let main = EventLoopThread::start("http-404").unwrap();
    let server = HttpServer::new(main.handle(), listen_addr(0, true, false)).unwrap();
    server.set_io_loop_num(1);
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let (status_line, head, _body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 404"), "{status_line}");
    let server_header = header_value(&head, "Server").expect("Server header");
    assert!(
        server_header.starts_with("riptide/"),
        "Server: {server_header}"
    );

    // Non-2xx closes even though HTTP/1.1 negotiated keep-alive.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("server close");
    assert!(rest.is_empty());
}

#[test]
fn keep_alive_budget_is_enforced() {
    let main = EventLoopThread::start("http-ka").unwrap();
    let server = HttpServer::new(main.handle(), listen_addr(0, true, false)).unwrap();
    server.set_io_loop_num(1);
    server.set_max_keep_alive_requests(2);
    server.set_keep_alive_timeout(30);
    server.add_endpoint("GET", "/hello", |_request, response| {
        response.set_body("hi");
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status_line, head, body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 200"), "{status_line}");
    assert_eq!(body, b"hi");
    assert_eq!(header_value(&head, "Keep-Alive"), Some("timeout=30, max=1"));

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status_line, head, body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 200"), "{status_line}");
    assert_eq!(body, b"hi");
    assert_eq!(header_value(&head, "Keep-Alive"), Some("timeout=30, max=0"));

    // Budget exhausted: the server closes and serves nothing further.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("server close");
    assert!(rest.is_empty());
}

#[test]
fn post_route_and_method_mismatch() {
    let main = EventLoopThread::start("http-post").unwrap();
    let server = HttpServer::new(main.handle(), listen_addr(0, true, false)).unwrap();
    server.set_io_loop_num(1);
    server.add_endpoint("POST", "/submit", |request, response| {
        response.set_status(Status(201));
        response.set_body(request.body.clone());
    });
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .write_all(b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 7\r\n\r\npayload")
        .unwrap();
    let (status_line, _head, body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 201"), "{status_line}");
    assert_eq!(body, b"payload");

    // PUT is parsed but has no route table: 405.
    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .write_all(b"PUT /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let (status_line, _head, _body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 405"), "{status_line}");
}

#[test]
fn malformed_request_gets_400_then_close() {
    let main = EventLoopThread::start("http-400").unwrap();
    let server = HttpServer::new(main.handle(), listen_addr(0, true, false)).unwrap();
    server.set_io_loop_num(1);
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .write_all(b"BOGUS /x HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status_line, _head, _body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 400"), "{status_line}");

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("server close");
    assert!(rest.is_empty());
}

#[test]
fn multipart_upload_yields_the_file_part() {
    let main = EventLoopThread::start("http-upload").unwrap();
    let server = HttpServer::new(main.handle(), listen_addr(0, true, false)).unwrap();
    server.set_io_loop_num(1);
    server.add_endpoint("POST", "/upload", |request, response| {
        assert_eq!(request.files.len(), 1);
        let file = request.file("f").expect("part named f");
        assert_eq!(file.filename, "a.txt");
        assert_eq!(file.content_type, "");
        response.set_body(file.content.clone());
    });
    server.start().unwrap();

    let body = "--abc\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nHELLO\r\n--abc--";
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=abc\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    // Dribble it so the multipart machine crosses buffer refills.
    for chunk in request.as_bytes().chunks(13) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let (status_line, _head, body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 200"), "{status_line}");
    assert_eq!(body, b"HELLO");
}

#[test]
fn static_mount_serves_files_with_content_type() {
    let dir = std::env::temp_dir().join(format!("http1-static-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("index.html"), b"<h1>home</h1>").unwrap();
    std::fs::write(dir.join("app.js"), b"console.log(1)").unwrap();

    let main = EventLoopThread::start("http-static").unwrap();
    let server = HttpServer::new(main.handle(), listen_addr(0, true, false)).unwrap();
    server.set_io_loop_num(1);
    assert!(server.add_mount_point(
        "/",
        &dir,
        vec![("Cache-Control".to_string(), "no-store".to_string())],
    ));
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status_line, head, body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 200"), "{status_line}");
    assert_eq!(header_value(&head, "Content-Type"), Some("text/html"));
    assert_eq!(header_value(&head, "Cache-Control"), Some("no-store"));
    assert_eq!(body, b"<h1>home</h1>");

    stream
        .write_all(b"GET /app.js HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status_line, head, body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 200"), "{status_line}");
    assert_eq!(header_value(&head, "Content-Type"), Some("text/javascript"));
    assert_eq!(body, b"console.log(1)");

    // Traversal out of the mount is rejected, not resolved.
    stream
        .write_all(b"GET /../secret.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status_line, _head, _body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 404"), "{status_line}");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn file_auth_denial_is_403() {
    let dir = std::env::temp_dir().join(format!("http1-auth-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("private.txt"), b"secret").unwrap();

    let main = EventLoopThread::start("http-auth").unwrap();
    let server = HttpServer::new(main.handle(), listen_addr(0, true, false)).unwrap();
    server.set_io_loop_num(1);
    assert!(server.add_mount_point("/files", &dir, Vec::new()));
    server.set_file_auth_callback(|path| !path.to_string_lossy().contains("private"));
    server.start().unwrap();

    let mut stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .write_all(b"GET /files/private.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status_line, _head, _body) = read_response(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 403"), "{status_line}");

    std::fs::remove_dir_all(&dir).ok();
}
