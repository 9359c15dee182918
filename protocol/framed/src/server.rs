//! Two-mode framed-message server with ping/pong liveness enforcement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use reactor::{Buffer, EntryHandle, Error, LoopHandle, TcpConnection, TcpServer, TimerId};

use crate::codec::{self, PING_TYPE, PONG_TYPE};

/// Payload interpretation, fixed at construction. Mixing modes on one
/// server (or one connection) is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// JSON object payloads dispatched by their numeric `"type"` field.
    Structured,
    /// `u32` LE type followed by raw bytes.
    Opaque,
}

pub type StructuredHandler = Arc<dyn Fn(&Arc<TcpConnection>, &serde_json::Value) + Send + Sync>;
pub type OpaqueHandler = Arc<dyn Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

struct PingPong {
    interval_secs: u64,
    timeout_secs: u64,
}

pub struct FrameServer {
    inner: Arc<Inner>,
}

struct Inner {
    server: TcpServer,
    mode: FrameMode,
    structured_handlers: Mutex<HashMap<u32, StructuredHandler>>,
    opaque_handlers: Mutex<HashMap<u32, OpaqueHandler>>,
    ping_pong: Mutex<Option<PingPong>>,
    /// Latest outstanding kickoff entry per connection; a PONG cancels it.
    pong_entries: Mutex<HashMap<u64, EntryHandle>>,
    ping_timers: Mutex<HashMap<u64, TimerId>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
}

impl FrameServer {
    pub fn new(
        main_loop: &LoopHandle,
        addr: SocketAddr,
        mode: FrameMode,
    ) -> Result<FrameServer, Error> {
        let server = TcpServer::new(main_loop, addr, "frame-server")?;
        Ok(FrameServer {
            inner: Arc::new(Inner {
                server,
                mode,
                structured_handlers: Mutex::new(HashMap::new()),
                opaque_handlers: Mutex::new(HashMap::new()),
                ping_pong: Mutex::new(None),
                pong_entries: Mutex::new(HashMap::new()),
                ping_timers: Mutex::new(HashMap::new()),
                connection_cb: Mutex::new(None),
            }),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.server.addr()
    }

    pub fn set_io_loop_num(&self, num: usize) {
        self.inner.server.set_io_loop_num(num);
    }

    /// Enable liveness enforcement: every `interval_secs` a PING frame is
    /// sent and a kickoff entry armed for `timeout_secs`; a PONG cancels
    /// the entry, expiry force-closes the connection. `interval >=
    /// timeout` is permitted but weakens liveness.
    pub fn set_ping_pong(&self, interval_secs: u64, timeout_secs: u64) {
        *self.inner.ping_pong.lock() = Some(PingPong {
            interval_secs,
            timeout_secs,
        });
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.inner.connection_cb.lock() = Some(Arc::new(cb));
    }

    pub fn register_structured_handler(
        &self,
        msg_type: u32,
        handler: impl Fn(&Arc<TcpConnection>, &serde_json::Value) + Send + Sync + 'static,
    ) {
        assert_eq!(self.inner.mode, FrameMode::Structured, "server is in opaque mode");
        self.inner
            .structured_handlers
            .lock()
            .insert(msg_type, Arc::new(handler));
    }

    pub fn register_opaque_handler(
        &self,
        msg_type: u32,
        handler: impl Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync + 'static,
    ) {
        assert_eq!(self.inner.mode, FrameMode::Opaque, "server is in structured mode");
        self.inner
            .opaque_handlers
            .lock()
            .insert(msg_type, Arc::new(handler));
    }

    pub fn start(&self) -> Result<(), Error> {
        if let Some(pp) = &*self.inner.ping_pong.lock() {
            self.inner.server.enable_timing_wheel(pp.timeout_secs + 1);
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.server.set_recv_message_callback(move |conn, buf| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(conn, buf);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        self.inner.server.set_connection_callback(move |conn| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_change(conn);
            }
        });

        self.inner.server.start()
    }

    pub fn stop(&self) {
        self.inner.server.stop();
    }

    /// Frame and send a structured message.
    pub fn send_json(conn: &Arc<TcpConnection>, value: &serde_json::Value) {
        conn.send(codec::encode_json(value).peek());
    }

    /// Frame and send an opaque message.
    pub fn send_opaque(conn: &Arc<TcpConnection>, msg_type: u32, body: &[u8]) {
        conn.send(codec::encode_opaque(msg_type, body).peek());
    }
}

impl Inner {
    fn on_connection_change(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        if conn.connected() {
            tracing::debug!(conn = %conn.name(), "frame connection up");
            if self.ping_pong.lock().is_some() {
                self.start_ping_cycle(conn);
            }
        } else if conn.disconnected() {
            tracing::debug!(conn = %conn.name(), "frame connection down");
            if let Some(timer) = self.ping_timers.lock().remove(&conn.id()) {
                conn.owner_loop().invalidate_timer(timer);
            }
            self.pong_entries.lock().remove(&conn.id());
        }
        let cb = self.connection_cb.lock().clone();
        if let Some(cb) = cb {
            cb(conn);
        }
    }

    /// Repeating ping on the connection's loop. Each tick sends a PING
    /// and arms a fresh kickoff entry in the loop's timing wheel; only a
    /// PONG cancels it before it force-closes the connection.
    fn start_ping_cycle(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let (interval_secs, timeout_secs) = {
            let pp = self.ping_pong.lock();
            let pp = pp.as_ref().expect("checked by caller");
            (pp.interval_secs, pp.timeout_secs)
        };
        let wheel = self.server.timing_wheel(conn.owner_loop());
        let mode = self.mode;
        let weak_conn = Arc::downgrade(conn);
        let weak_inner = Arc::downgrade(self);

        let timer = conn.owner_loop().run_every(
            Duration::from_secs(interval_secs),
            move || {
                let Some(conn) = weak_conn.upgrade() else {
                    return;
                };
                let Some(inner) = weak_inner.upgrade() else {
                    return;
                };
                send_ping(&conn, mode);
                if let Some(wheel) = &wheel {
                    let weak = Arc::downgrade(&conn);
                    let entry = wheel.insert(timeout_secs, move || {
                        if let Some(conn) = weak.upgrade() {
                            tracing::debug!(conn = %conn.name(), "no PONG within timeout, closing");
                            conn.force_close();
                        }
                    });
                    inner.pong_entries.lock().insert(conn.id(), entry);
                }
            },
        );
        self.ping_timers.lock().insert(conn.id(), timer);
    }

    fn on_message(self: &Arc<Self>, conn: &Arc<TcpConnection>, buf: &mut Buffer) {
        while let Some(payload) = codec::decode_frame(buf) {
            match self.mode {
                FrameMode::Structured => {
                    if !self.dispatch_structured(conn, &payload) {
                        conn.force_close();
                        return;
                    }
                }
                FrameMode::Opaque => {
                    if !self.dispatch_opaque(conn, &payload) {
                        conn.force_close();
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_structured(&self, conn: &Arc<TcpConnection>, payload: &[u8]) -> bool {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(conn = %conn.name(), "bad JSON frame: {e}");
                return false;
            }
        };
        let Some(msg_type) = value.get("type").and_then(|t| t.as_u64()).map(|t| t as u32) else {
            tracing::error!(conn = %conn.name(), "frame without numeric \"type\"");
            return false;
        };
        if msg_type == PONG_TYPE {
            self.reset_pong_entry(conn);
        }
        let handler = self.structured_handlers.lock().get(&msg_type).cloned();
        match handler {
            Some(handler) => handler(conn, &value),
            None if msg_type != PING_TYPE && msg_type != PONG_TYPE => {
                tracing::warn!(msg_type, "no handler for message type");
            }
            None => {}
        }
        true
    }

    fn dispatch_opaque(&self, conn: &Arc<TcpConnection>, payload: &[u8]) -> bool {
        if payload.len() < 4 {
            tracing::error!(conn = %conn.name(), "opaque frame shorter than its type word");
            return false;
        }
        let msg_type = u32::from_le_bytes(payload[..4].try_into().expect("checked"));
        let body = &payload[4..];
        if msg_type == PONG_TYPE {
            self.reset_pong_entry(conn);
        }
        let handler = self.opaque_handlers.lock().get(&msg_type).cloned();
        match handler {
            Some(handler) => handler(conn, body),
            None if msg_type != PING_TYPE && msg_type != PONG_TYPE => {
                tracing::warn!(msg_type, "no handler for message type");
            }
            None => {}
        }
        true
    }

    /// A PONG arrived in time: the outstanding kickoff entry must never
    /// fire.
    fn reset_pong_entry(&self, conn: &Arc<TcpConnection>) {
        if let Some(entry) = self.pong_entries.lock().remove(&conn.id()) {
            entry.cancel();
        }
    }
}

fn send_ping(conn: &Arc<TcpConnection>, mode: FrameMode) {
    match mode {
        FrameMode::Structured => {
            FrameServer::send_json(conn, &serde_json::json!({ "type": PING_TYPE }));
        }
        FrameMode::Opaque => {
            FrameServer::send_opaque(conn, PING_TYPE, b"");
        }
    }
}
