//! HTTP/1.1 server: routing, static mounts, keep-alive budgets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use reactor::{Buffer, Error, LoopHandle, TcpConnection, TcpServer};

use crate::mime::content_type_for;
use crate::request::{HttpRequest, RequestParser, is_valid_method};
use crate::response::{HttpResponse, Status};

const SERVER_TOKEN: &str = concat!("riptide/", env!("CARGO_PKG_VERSION"));

const DEFAULT_KEEP_ALIVE_TIMEOUT: u64 = 60;
const DEFAULT_MAX_KEEP_ALIVE_REQUESTS: u32 = 10;

pub type HttpHandler = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;
pub type FileAuthCallback = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// A URL prefix served from a filesystem directory.
#[derive(Debug, Clone)]
pub struct MountPoint {
    pub prefix: String,
    pub dir: PathBuf,
    pub extra_headers: Vec<(String, String)>,
}

/// Per-connection parse state and keep-alive budget.
struct ConnContext {
    parser: RequestParser,
    served: u32,
    /// None until the first request decides keep-alive or not.
    limit: Option<u32>,
}

impl Default for ConnContext {
    fn default() -> Self {
        ConnContext {
            parser: RequestParser::new(),
            served: 0,
            limit: None,
        }
    }
}

pub struct HttpServer {
    inner: Arc<Inner>,
}

struct Inner {
    server: TcpServer,
    get_routes: Mutex<HashMap<String, HttpHandler>>,
    post_routes: Mutex<HashMap<String, HttpHandler>>,
    mounts: Mutex<Vec<MountPoint>>,
    file_auth: Mutex<Option<FileAuthCallback>>,
    keep_alive_timeout: AtomicU64,
    max_keep_alive_requests: AtomicU32,
    contexts: Mutex<HashMap<u64, ConnContext>>,
}

impl HttpServer {
    pub fn new(main_loop: &LoopHandle, addr: SocketAddr) -> Result<HttpServer, Error> {
        let server = TcpServer::new(main_loop, addr, "http-server")?;
        Ok(HttpServer {
            inner: Arc::new(Inner {
                server,
                get_routes: Mutex::new(HashMap::new()),
                post_routes: Mutex::new(HashMap::new()),
                mounts: Mutex::new(Vec::new()),
                file_auth: Mutex::new(None),
                keep_alive_timeout: AtomicU64::new(DEFAULT_KEEP_ALIVE_TIMEOUT),
                max_keep_alive_requests: AtomicU32::new(DEFAULT_MAX_KEEP_ALIVE_REQUESTS),
                contexts: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.server.addr()
    }

    pub fn set_io_loop_num(&self, num: usize) {
        self.inner.server.set_io_loop_num(num);
    }

    /// Idle seconds before a keep-alive connection is kicked off.
    pub fn set_keep_alive_timeout(&self, seconds: u64) {
        self.inner
            .keep_alive_timeout
            .store(seconds, Ordering::Release);
    }

    /// Requests served on one connection before it is closed.
    pub fn set_max_keep_alive_requests(&self, max: u32) {
        self.inner
            .max_keep_alive_requests
            .store(max, Ordering::Release);
    }

    /// Register an exact-path handler. Only GET and POST routes exist;
    /// other valid methods answer 405.
    pub fn add_endpoint(
        &self,
        method: &str,
        path: &str,
        handler: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) {
        if !is_valid_method(method) {
            tracing::error!(method, "invalid method for endpoint");
            return;
        }
        if path.is_empty() {
            tracing::error!("empty endpoint path");
            return;
        }
        if self.inner.get_routes.lock().contains_key(path)
            || self.inner.post_routes.lock().contains_key(path)
        {
            tracing::error!(path, "endpoint already exists");
            return;
        }
        let handler: HttpHandler = Arc::new(handler);
        match method {
            "GET" => {
                self.inner.get_routes.lock().insert(path.to_string(), handler);
            }
            "POST" => {
                self.inner.post_routes.lock().insert(path.to_string(), handler);
            }
            other => {
                tracing::error!(method = other, "only GET and POST endpoints are routable");
            }
        }
    }

    /// Serve files under `dir` for paths beginning with `prefix`.
    /// The prefix must start with `/` and `dir` must exist.
    pub fn add_mount_point(
        &self,
        prefix: &str,
        dir: impl Into<PathBuf>,
        extra_headers: Vec<(String, String)>,
    ) -> bool {
        let dir = dir.into();
        if !dir.is_dir() {
            return false;
        }
        let prefix = if prefix.is_empty() { "/" } else { prefix };
        if !prefix.starts_with('/') {
            return false;
        }
        self.inner.mounts.lock().push(MountPoint {
            prefix: prefix.to_string(),
            dir,
            extra_headers,
        });
        true
    }

    pub fn remove_mount_point(&self, prefix: &str) -> bool {
        let mut mounts = self.inner.mounts.lock();
        let before = mounts.len();
        mounts.retain(|m| m.prefix != prefix);
        mounts.len() != before
    }

    /// Predicate deciding whether a resolved file may be served; denial
    /// answers 403.
    pub fn set_file_auth_callback(&self, cb: impl Fn(&Path) -> bool + Send + Sync + 'static) {
        *self.inner.file_auth.lock() = Some(Arc::new(cb));
    }

    pub fn start(&self) -> Result<(), Error> {
        self.inner
            .server
            .kickoff_idle_connections(self.inner.keep_alive_timeout.load(Ordering::Acquire));

        let weak = Arc::downgrade(&self.inner);
        self.inner.server.set_recv_message_callback(move |conn, buf| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(conn, buf);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        self.inner.server.set_connection_callback(move |conn| {
            if let Some(inner) = weak.upgrade()
                && conn.disconnected()
            {
                inner.contexts.lock().remove(&conn.id());
            }
        });

        self.inner.server.start()
    }

    pub fn stop(&self) {
        self.inner.server.stop();
    }
}

impl Inner {
    fn on_message(self: &Arc<Self>, conn: &Arc<TcpConnection>, buf: &mut Buffer) {
        loop {
            let parsed = {
                let mut contexts = self.contexts.lock();
                let ctx = contexts.entry(conn.id()).or_default();
                ctx.parser.feed(buf)
            };
            match parsed {
                Err(e) => {
                    tracing::warn!(conn = %conn.name(), "request parse error: {e}");
                    let mut response = HttpResponse::new();
                    response.set_status(Status::BAD_REQUEST);
                    self.send_response(conn, &mut response, 0, 0);
                    self.contexts.lock().remove(&conn.id());
                    conn.force_close();
                    return;
                }
                Ok(None) => return,
                Ok(Some(request)) => {
                    if !self.handle_one(conn, request) {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the connection was scheduled to close.
    fn handle_one(self: &Arc<Self>, conn: &Arc<TcpConnection>, request: HttpRequest) -> bool {
        let (served, limit) = {
            let mut contexts = self.contexts.lock();
            let ctx = contexts.entry(conn.id()).or_default();
            let limit = *ctx.limit.get_or_insert_with(|| {
                if keep_alive_requested(&request) {
                    self.max_keep_alive_requests.load(Ordering::Acquire)
                } else {
                    0
                }
            });
            ctx.served += 1;
            (ctx.served, limit)
        };

        tracing::trace!(method = %request.method, path = %request.path, "request");

        let mut response = HttpResponse::new();
        if !self.handle_file_request(&request, &mut response) {
            self.handle_request(&request, &mut response);
        }

        let remaining = limit.saturating_sub(served);
        self.send_response(conn, &mut response, limit, remaining);

        if !response.status.is_success() || served >= limit {
            self.contexts.lock().remove(&conn.id());
            // Graceful: queued response bytes (including file payloads)
            // drain before the FIN.
            conn.shutdown();
            return false;
        }
        true
    }

    fn handle_request(&self, request: &HttpRequest, response: &mut HttpResponse) {
        let handler = match request.method.as_str() {
            "GET" => self.get_routes.lock().get(&request.path).cloned(),
            "POST" => self.post_routes.lock().get(&request.path).cloned(),
            _ => {
                response.set_status(Status::METHOD_NOT_ALLOWED);
                return;
            }
        };
        match handler {
            Some(handler) => handler(request, response),
            None => {
                response.set_status(Status::NOT_FOUND);
            }
        }
    }

    /// Try the static mounts. Returns true when the request was resolved
    /// (served, or denied with 403).
    fn handle_file_request(&self, request: &HttpRequest, response: &mut HttpResponse) -> bool {
        if request.method != "GET" {
            return false;
        }
        let mounts = self.mounts.lock();
        for mount in mounts.iter() {
            let Some(rest) = request.path.strip_prefix(&mount.prefix) else {
                continue;
            };
            let sub_path = format!("/{rest}");
            if !is_valid_path(&sub_path) {
                continue;
            }
            let mut full = format!("{}{}", mount.dir.display(), sub_path);
            if full.ends_with('/') {
                full.push_str("index.html");
            }
            let path = PathBuf::from(&full);
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            if let Some(auth) = self.file_auth.lock().clone()
                && !auth(&path)
            {
                response.set_status(Status::FORBIDDEN);
                return true;
            }
            for (name, value) in &mount.extra_headers {
                response.set_header(name, value.clone());
            }
            let content_type = content_type_for(&full).to_string();
            response.set_file(path, metadata.len(), content_type);
            return true;
        }
        false
    }

    fn send_response(
        &self,
        conn: &Arc<TcpConnection>,
        response: &mut HttpResponse,
        limit: u32,
        remaining: u32,
    ) {
        response.set_header("Server", SERVER_TOKEN);
        if limit > 0 {
            response.set_header("Connection", "keep-alive");
            response.set_header(
                "Keep-Alive",
                format!(
                    "timeout={}, max={}",
                    self.keep_alive_timeout.load(Ordering::Acquire),
                    remaining
                ),
            );
        } else {
            response.set_header("Connection", "close");
        }

        let file_meta = response
            .file
            .as_ref()
            .map(|f| (f.size, f.content_type.clone()));
        match file_meta {
            Some((size, content_type)) => {
                response.set_header("Content-Length", size.to_string());
                response.set_header("Content-Type", content_type);
            }
            None => {
                let len = response.body.len();
                response.set_header("Content-Length", len.to_string());
            }
        }

        conn.send(&response.serialize_head());
        if let Some(file) = &response.file {
            if let Err(e) = conn.send_file_path(&file.path, 0, file.size) {
                tracing::error!(path = %file.path.display(), "send_file: {e}");
            }
        } else if !response.body.is_empty() {
            conn.send(&response.body);
        }
    }
}

fn keep_alive_requested(request: &HttpRequest) -> bool {
    let connection = request.header("Connection").unwrap_or("");
    match request.version.as_str() {
        "HTTP/1.1" => !connection.eq_ignore_ascii_case("close"),
        "HTTP/1.0" => connection.eq_ignore_ascii_case("keep-alive"),
        _ => false,
    }
}

/// Reject paths whose `..` components would escape the mount root.
fn is_valid_path(path: &str) -> bool {
    let mut level = 0i32;
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                level -= 1;
                if level < 0 {
                    return false;
                }
            }
            _ => level += 1,
        }
    }
    true
}
