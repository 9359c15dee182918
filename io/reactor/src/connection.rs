//! TCP connection: non-blocking read path, ordered heterogeneous write
//! queue, lifecycle, and the TLS filter hook.
//!
//! A connection is owned by exactly one loop. The public `send*` surface
//! is callable from any thread; ordering across threads is preserved by
//! the send gate (see `send`). Everything else that touches the socket or
//! the channel runs on the owning loop.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::socket::Socket;
use crate::tls::{TlsFilter, TlsState};
use crate::wheel::{EntryHandle, TimingWheel};

/// Scratch chunk size for stream producers and TLS file sends.
const STREAM_CHUNK_SIZE: usize = 16 * 1024;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub type RecvMessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type StreamProducer = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnStatus {
    fn from_u8(v: u8) -> ConnStatus {
        match v {
            0 => ConnStatus::Connecting,
            1 => ConnStatus::Connected,
            2 => ConnStatus::Disconnecting,
            _ => ConnStatus::Disconnected,
        }
    }
}

enum WriteNode {
    Bytes(BytesMut),
    File {
        fd: OwnedFd,
        offset: i64,
        remaining: u64,
    },
    Stream {
        producer: StreamProducer,
        done: bool,
    },
}

enum Advance {
    NodeDone,
    WouldBlock,
    PeerGone,
}

struct TlsChannel {
    filter: Box<dyn TlsFilter>,
    plaintext: Buffer,
    outbound: Buffer,
    established_reported: bool,
}

struct IdleState {
    wheel: Weak<TimingWheel>,
    timeout: u64,
    entry: EntryHandle,
    last_extend: Instant,
}

struct ConnIo {
    read_buffer: Buffer,
    write_queue: VecDeque<WriteNode>,
    close_on_empty: bool,
    above_water: bool,
    idle: Option<IdleState>,
    stream_scratch: Vec<u8>,
    tls: Option<TlsChannel>,
    upgrade_cb: Option<ConnectionCallback>,
}

impl ConnIo {
    /// Queued outbound bytes: byte nodes plus buffered TLS ciphertext.
    /// File and stream nodes are unbounded sources, not queued bytes.
    fn pending_bytes(&self) -> usize {
        let queued: usize = self
            .write_queue
            .iter()
            .map(|node| match node {
                WriteNode::Bytes(buf) => buf.len(),
                _ => 0,
            })
            .sum();
        queued
            + self
                .tls
                .as_ref()
                .map_or(0, |tls| tls.outbound.readable_bytes())
    }
}

#[derive(Default)]
struct Callbacks {
    recv_message: Option<RecvMessageCallback>,
    connection: Option<ConnectionCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    id: u64,
    name: String,
    owner: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    status: AtomicU8,
    io: Mutex<ConnIo>,
    /// Count of queued (not yet executed) sends; see `send`.
    send_gate: Mutex<usize>,
    callbacks: Mutex<Callbacks>,
    high_water_mark: AtomicUsize,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TcpConnection {
    pub fn new(
        owner: &LoopHandle,
        fd: OwnedFd,
        peer_addr: SocketAddr,
        tls: Option<Box<dyn TlsFilter>>,
    ) -> Arc<TcpConnection> {
        let socket = Socket::from_owned(fd);
        let _ = socket.set_keepalive(true);
        let local_addr = socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let channel = Channel::new(owner, socket.fd());
        let name = format!("{local_addr}--{peer_addr}");
        tracing::trace!("new connection {name}");
        Arc::new(TcpConnection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            name,
            owner: owner.clone(),
            socket,
            channel,
            local_addr,
            peer_addr,
            status: AtomicU8::new(ConnStatus::Connecting as u8),
            io: Mutex::new(ConnIo {
                read_buffer: Buffer::new(),
                write_queue: VecDeque::new(),
                close_on_empty: false,
                above_water: false,
                idle: None,
                stream_scratch: Vec::new(),
                tls: tls.map(|filter| TlsChannel {
                    filter,
                    plaintext: Buffer::new(),
                    outbound: Buffer::new(),
                    established_reported: false,
                }),
                upgrade_cb: None,
            }),
            send_gate: Mutex::new(0),
            callbacks: Mutex::new(Callbacks::default()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    // --- identity and state ---

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.owner
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ConnStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.status() == ConnStatus::Connected
    }

    #[inline]
    pub fn disconnected(&self) -> bool {
        self.status() == ConnStatus::Disconnected
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        let _ = self.socket.set_nodelay(on);
    }

    // --- callback wiring (before `connect_established`) ---

    pub fn set_recv_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().recv_message = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.lock().close = Some(Arc::new(cb));
    }

    /// `cb` fires once per upward crossing of `mark` queued outbound
    /// bytes; it re-arms when the queue drains back below the mark.
    pub fn set_high_water_mark_callback(
        &self,
        mark: usize,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
        self.callbacks.lock().high_water = Some(Arc::new(cb));
    }

    // --- lifecycle ---

    /// Wire the channel and transition `Connecting -> Connected`. Runs on
    /// the owning loop.
    pub fn connect_established(self: &Arc<Self>) {
        let this = self.clone();
        self.owner.run_in_loop(move || {
            debug_assert_eq!(this.status(), ConnStatus::Connecting);
            this.channel.tie(&this);

            let weak = Arc::downgrade(&this);
            this.channel.set_read_callback({
                let weak = weak.clone();
                move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.read_callback();
                    }
                }
            });
            this.channel.set_write_callback({
                let weak = weak.clone();
                move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.write_callback();
                    }
                }
            });
            this.channel.set_close_callback({
                let weak = weak.clone();
                move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_close();
                    }
                }
            });
            this.channel.set_error_callback({
                let weak = weak.clone();
                move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_error();
                    }
                }
            });

            this.channel.enable_reading();
            this.set_status(ConnStatus::Connected);
            metrics::CONNECTIONS_ACTIVE.increment();

            // With TLS the connection callback waits for the handshake.
            let tls_active = this.io.lock().tls.is_some();
            if !tls_active {
                let cb = this.callbacks.lock().connection.clone();
                if let Some(cb) = cb {
                    cb(&this);
                }
            }
        });
    }

    /// Final teardown on the owning loop; drops the channel registration.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if self.status() == ConnStatus::Connected {
            self.set_status(ConnStatus::Disconnected);
            self.channel.disable_all();
            metrics::CONNECTIONS_ACTIVE.decrement();
            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        self.io.lock().idle = None;
        if self.channel.events() != 0 {
            self.channel.disable_all();
        }
        self.channel.remove();
    }

    /// Graceful close: drain the write queue, then half-close the write
    /// side and wait for the peer's FIN.
    pub fn shutdown(self: &Arc<Self>) {
        let this = self.clone();
        self.owner.run_in_loop(move || {
            if this.status() != ConnStatus::Connected {
                return;
            }
            let mut io = this.io.lock();
            if !io.write_queue.is_empty() || io.pending_bytes() > 0 {
                io.close_on_empty = true;
                return;
            }
            if let Some(tls) = io.tls.as_mut() {
                let TlsChannel {
                    filter, outbound, ..
                } = tls;
                filter.close(outbound);
            }
            this.flush_tls_outbound(&mut io);
            drop(io);
            this.set_status(ConnStatus::Disconnecting);
            if !this.channel.is_writing() {
                this.socket.close_write();
            }
        });
    }

    /// Immediate close on the next loop iteration.
    pub fn force_close(self: &Arc<Self>) {
        let this = self.clone();
        self.owner.queue_in_loop(move || {
            if matches!(
                this.status(),
                ConnStatus::Connected | ConnStatus::Disconnecting
            ) {
                this.set_status(ConnStatus::Disconnecting);
                this.handle_close();
            }
        });
    }

    /// Switch the connection to TLS mid-stream. `upgrade_cb` fires
    /// instead of the connection callback once the handshake completes.
    pub fn start_encryption(
        self: &Arc<Self>,
        filter: Box<dyn TlsFilter>,
        upgrade_cb: Option<ConnectionCallback>,
    ) {
        let this = self.clone();
        self.owner.run_in_loop(move || {
            let mut io = this.io.lock();
            if io.tls.is_some() {
                tracing::error!("{}: TLS already started", this.name);
                return;
            }
            io.tls = Some(TlsChannel {
                filter,
                plaintext: Buffer::new(),
                outbound: Buffer::new(),
                established_reported: false,
            });
            io.upgrade_cb = upgrade_cb;
        });
    }

    /// Arm the idle kickoff: expiry force-closes the connection unless
    /// read or write activity keeps extending the entry.
    pub fn enable_kickoff(self: &Arc<Self>, wheel: &Arc<TimingWheel>, timeout_secs: u64) {
        let weak = Arc::downgrade(self);
        let entry = wheel.insert(timeout_secs, move || {
            if let Some(conn) = weak.upgrade() {
                tracing::trace!("{}: idle timeout, kicking off", conn.name);
                metrics::CONNECTIONS_KICKED.increment();
                conn.force_close();
            }
        });
        self.io.lock().idle = Some(IdleState {
            wheel: Arc::downgrade(wheel),
            timeout: timeout_secs,
            entry,
            last_extend: Instant::now(),
        });
    }

    /// Re-register the kickoff entry, throttled to once per second.
    fn extend_life(&self, io: &mut ConnIo) {
        if let Some(idle) = io.idle.as_mut() {
            let now = Instant::now();
            if now.duration_since(idle.last_extend) < Duration::from_secs(1) {
                return;
            }
            idle.last_extend = now;
            if let Some(wheel) = idle.wheel.upgrade() {
                wheel.extend(idle.timeout, &idle.entry);
            }
        }
    }

    // --- send surface ---

    /// Send bytes, preserving call order even when same-loop direct sends
    /// race cross-thread enqueued sends: the direct fast path is taken
    /// only while no queued send is pending; otherwise this call joins
    /// the queue, so FIFO order as enqueued is the wire order.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.owner.is_in_loop_thread() {
            let mut gate = self.send_gate.lock();
            if *gate == 0 {
                self.send_in_loop(data);
                return;
            }
            *gate += 1;
            drop(gate);
            let this = self.clone();
            let owned = data.to_vec();
            self.owner.queue_in_loop(move || {
                this.send_in_loop(&owned);
                *this.send_gate.lock() -= 1;
            });
        } else {
            let this = self.clone();
            let owned = data.to_vec();
            let mut gate = self.send_gate.lock();
            *gate += 1;
            drop(gate);
            self.owner.queue_in_loop(move || {
                this.send_in_loop(&owned);
                *this.send_gate.lock() -= 1;
            });
        }
    }

    /// Queue a file region; sent with kernel `sendfile` when no TLS is
    /// active.
    pub fn send_file(self: &Arc<Self>, fd: OwnedFd, offset: u64, length: u64) {
        assert!(length > 0, "send_file with empty length");
        self.enqueue_node(WriteNode::File {
            fd,
            offset: offset as i64,
            remaining: length,
        });
    }

    /// Open `path` and queue it. `length == 0` means "rest of the file".
    pub fn send_file_path(self: &Arc<Self>, path: &Path, offset: u64, length: u64) -> io::Result<()> {
        let file = File::open(path)?;
        let length = if length == 0 {
            file.metadata()?.len().saturating_sub(offset)
        } else {
            length
        };
        if length == 0 {
            return Ok(());
        }
        self.send_file(OwnedFd::from(file), offset, length);
        Ok(())
    }

    /// Queue a pull-stream producer. The producer fills the scratch it is
    /// handed and returns the chunk length; zero means end-of-stream.
    pub fn send_stream(self: &Arc<Self>, producer: impl FnMut(&mut [u8]) -> usize + Send + 'static) {
        self.enqueue_node(WriteNode::Stream {
            producer: Box::new(producer),
            done: false,
        });
    }

    fn enqueue_node(self: &Arc<Self>, node: WriteNode) {
        if self.owner.is_in_loop_thread() {
            let mut gate = self.send_gate.lock();
            if *gate == 0 {
                self.push_node_in_loop(node);
                return;
            }
            *gate += 1;
            drop(gate);
            let this = self.clone();
            self.owner.queue_in_loop(move || {
                this.push_node_in_loop(node);
                *this.send_gate.lock() -= 1;
            });
        } else {
            let this = self.clone();
            let mut gate = self.send_gate.lock();
            *gate += 1;
            drop(gate);
            self.owner.queue_in_loop(move || {
                this.push_node_in_loop(node);
                *this.send_gate.lock() -= 1;
            });
        }
    }

    fn push_node_in_loop(self: &Arc<Self>, node: WriteNode) {
        self.owner.assert_in_loop_thread();
        if self.status() != ConnStatus::Connected {
            tracing::warn!("{}: not connected, dropping queued payload", self.name);
            return;
        }
        let mut io = self.io.lock();
        io.write_queue.push_back(node);
        if io.write_queue.len() == 1 {
            // New head: make progress now instead of waiting for a
            // writable event.
            self.drive_queue(io);
        } else if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.owner.assert_in_loop_thread();
        if self.status() != ConnStatus::Connected {
            tracing::warn!("{}: not connected, dropping {} bytes", self.name, data.len());
            return;
        }
        let mut io = self.io.lock();
        self.extend_life(&mut io);

        if io.tls.is_some() {
            {
                let tls = io.tls.as_mut().expect("checked");
                let TlsChannel {
                    filter, outbound, ..
                } = tls;
                if let Err(e) = filter.write_plaintext(data, outbound) {
                    tracing::error!("{}: TLS write: {e}", self.name);
                    drop(io);
                    self.force_close();
                    return;
                }
            }
            self.flush_tls_outbound(&mut io);
        } else {
            let mut sent = 0usize;
            // Direct-send fast path: nothing queued, channel idle.
            if !self.channel.is_writing() && io.write_queue.is_empty() {
                match self.socket.write(data) {
                    Ok(n) => {
                        self.note_sent(n);
                        sent = n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if peer_gone(&e) => {
                        tracing::trace!("{}: send: {e}", self.name);
                        return;
                    }
                    Err(e) => {
                        tracing::error!("{}: unexpected send error: {e}", self.name);
                        return;
                    }
                }
            }
            if sent < data.len() {
                match io.write_queue.back_mut() {
                    Some(WriteNode::Bytes(buf)) => buf.extend_from_slice(&data[sent..]),
                    _ => io
                        .write_queue
                        .push_back(WriteNode::Bytes(BytesMut::from(&data[sent..]))),
                }
                if !self.channel.is_writing() {
                    self.channel.enable_writing();
                }
            }
        }

        self.check_high_water(&mut io);
    }

    fn check_high_water(self: &Arc<Self>, io: &mut ConnIo) {
        let pending = io.pending_bytes();
        let mark = self.high_water_mark.load(Ordering::Relaxed);
        if pending > mark && !io.above_water {
            io.above_water = true;
            let cb = self.callbacks.lock().high_water.clone();
            if let Some(cb) = cb {
                let this = self.clone();
                self.owner.queue_in_loop(move || cb(&this, pending));
            }
        }
    }

    fn note_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        metrics::BYTES_SENT.add(n as u64);
    }

    // --- event callbacks (owning loop only) ---

    fn read_callback(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        let mut io = self.io.lock();
        match io.read_buffer.read_fd(self.socket.fd()) {
            Ok(0) => {
                drop(io);
                self.handle_close();
            }
            Ok(n) => {
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                metrics::BYTES_RECEIVED.add(n as u64);
                self.extend_life(&mut io);
                if io.tls.is_some() {
                    self.process_tls_input(io);
                } else {
                    let mut buf = std::mem::take(&mut io.read_buffer);
                    drop(io);
                    let cb = self.callbacks.lock().recv_message.clone();
                    match cb {
                        Some(cb) => cb(self, &mut buf),
                        None => buf.retrieve_all(),
                    }
                    // Unconsumed bytes wait for the next read.
                    self.io.lock().read_buffer = buf;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if peer_gone(&e) => {
                tracing::trace!("{}: read: {e}", self.name);
            }
            Err(e) => {
                tracing::error!("{}: read error: {e}", self.name);
                drop(io);
                self.handle_close();
            }
        }
    }

    fn process_tls_input(self: &Arc<Self>, mut io: MutexGuard<'_, ConnIo>) {
        let ciphertext = {
            let n = io.read_buffer.readable_bytes();
            io.read_buffer.read(n)
        };
        let state = {
            let tls = io.tls.as_mut().expect("tls checked by caller");
            let TlsChannel {
                filter,
                plaintext,
                outbound,
                ..
            } = tls;
            filter.read_ciphertext(&ciphertext, plaintext, outbound)
        };
        self.flush_tls_outbound(&mut io);

        let state = match state {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("{}: TLS error: {e}", self.name);
                drop(io);
                self.force_close();
                return;
            }
        };

        if state == TlsState::Closed {
            drop(io);
            self.shutdown();
            return;
        }

        let mut handshake_cb = None;
        if state == TlsState::Established {
            let first_report = {
                let tls = io.tls.as_mut().expect("tls checked");
                if tls.established_reported {
                    false
                } else {
                    tls.established_reported = true;
                    true
                }
            };
            if first_report {
                handshake_cb = io
                    .upgrade_cb
                    .take()
                    .or_else(|| self.callbacks.lock().connection.clone());
            }
        }

        let has_plain = io
            .tls
            .as_ref()
            .is_some_and(|tls| tls.plaintext.readable_bytes() > 0);
        let mut plain = if has_plain {
            std::mem::take(&mut io.tls.as_mut().expect("tls checked").plaintext)
        } else {
            Buffer::new()
        };
        drop(io);

        if let Some(cb) = handshake_cb {
            cb(self);
        }
        if has_plain {
            let cb = self.callbacks.lock().recv_message.clone();
            match cb {
                Some(cb) => cb(self, &mut plain),
                None => plain.retrieve_all(),
            }
            if let Some(tls) = self.io.lock().tls.as_mut() {
                tls.plaintext = plain;
            }
        }
    }

    fn write_callback(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if !self.channel.is_writing() {
            tracing::error!("{}: write event while not writing", self.name);
            return;
        }
        let mut io = self.io.lock();
        self.extend_life(&mut io);
        self.drive_queue(io);
    }

    /// Push queued data at the socket until it blocks or the queue
    /// drains, then settle interest, completion callbacks, half-close and
    /// high-water re-arm.
    fn drive_queue(self: &Arc<Self>, mut io: MutexGuard<'_, ConnIo>) {
        if !self.flush_tls_outbound(&mut io) {
            drop(io);
            return;
        }

        let mut peer_lost = false;
        loop {
            let advance = {
                let ConnIo {
                    write_queue,
                    stream_scratch,
                    tls,
                    ..
                } = &mut *io;
                let Some(node) = write_queue.front_mut() else {
                    break;
                };
                self.advance_node(node, stream_scratch, tls)
            };
            let stop = match advance {
                Advance::NodeDone => {
                    io.write_queue.pop_front();
                    false
                }
                Advance::WouldBlock => true,
                Advance::PeerGone => {
                    peer_lost = true;
                    true
                }
            };
            if !self.flush_tls_outbound(&mut io) {
                drop(io);
                return;
            }
            if stop {
                break;
            }
        }

        if peer_lost {
            // The close arrives through the read/close path; just stop.
            return;
        }

        let drained = io.write_queue.is_empty() && io.pending_bytes() == 0;
        let mut fire_write_complete = false;
        if drained {
            if self.channel.is_writing() {
                self.channel.disable_writing();
            }
            fire_write_complete = true;
            if self.status() == ConnStatus::Disconnecting {
                self.socket.close_write();
            }
        } else if !self.channel.is_writing() {
            self.channel.enable_writing();
        }

        if io.pending_bytes() <= self.high_water_mark.load(Ordering::Relaxed) {
            io.above_water = false;
        }
        let want_shutdown = io.close_on_empty && drained;
        drop(io);

        if fire_write_complete {
            // Queued so a callback that immediately sends again cannot
            // re-enter the send gate held by our caller.
            let cb = self.callbacks.lock().write_complete.clone();
            if let Some(cb) = cb {
                let this = self.clone();
                self.owner.queue_in_loop(move || cb(&this));
            }
        }
        if want_shutdown {
            self.shutdown();
        }
    }

    fn advance_node(
        &self,
        node: &mut WriteNode,
        scratch: &mut Vec<u8>,
        tls: &mut Option<TlsChannel>,
    ) -> Advance {
        match node {
            WriteNode::Bytes(buf) => {
                if buf.is_empty() {
                    return Advance::NodeDone;
                }
                if let Some(tls) = tls {
                    let TlsChannel {
                        filter, outbound, ..
                    } = tls;
                    match filter.write_plaintext(&buf[..], outbound) {
                        Ok(()) => {
                            buf.clear();
                            Advance::NodeDone
                        }
                        Err(e) => {
                            tracing::error!("TLS write: {e}");
                            Advance::PeerGone
                        }
                    }
                } else {
                    match self.socket.write(&buf[..]) {
                        Ok(n) => {
                            self.note_sent(n);
                            buf.advance(n);
                            if buf.is_empty() {
                                Advance::NodeDone
                            } else {
                                Advance::WouldBlock
                            }
                        }
                        Err(e) => self.classify_write_error(e),
                    }
                }
            }
            WriteNode::File {
                fd,
                offset,
                remaining,
            } => {
                if *remaining == 0 {
                    return Advance::NodeDone;
                }
                if tls.is_none() {
                    loop {
                        match self
                            .socket
                            .sendfile(fd.as_raw_fd(), offset, *remaining as usize)
                        {
                            Ok(0) => {
                                tracing::error!("sendfile read 0 bytes (file truncated?)");
                                return Advance::NodeDone;
                            }
                            Ok(n) => {
                                self.note_sent(n);
                                *remaining -= n as u64;
                                if *remaining == 0 {
                                    return Advance::NodeDone;
                                }
                            }
                            Err(e) => return self.classify_write_error(e),
                        }
                    }
                } else {
                    // TLS path: pull one chunk through the filter.
                    let want = (*remaining as usize).min(STREAM_CHUNK_SIZE);
                    let mut chunk = vec![0u8; want];
                    let n = unsafe {
                        libc::pread(
                            fd.as_raw_fd(),
                            chunk.as_mut_ptr() as *mut libc::c_void,
                            want,
                            *offset,
                        )
                    };
                    if n <= 0 {
                        tracing::error!("file read for TLS send failed");
                        return Advance::NodeDone;
                    }
                    let n = n as usize;
                    let tls = tls.as_mut().expect("checked");
                    let TlsChannel {
                        filter, outbound, ..
                    } = tls;
                    if let Err(e) = filter.write_plaintext(&chunk[..n], outbound) {
                        tracing::error!("TLS write: {e}");
                        return Advance::PeerGone;
                    }
                    *offset += n as i64;
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        Advance::NodeDone
                    } else {
                        // Let the ciphertext flush before the next chunk.
                        Advance::WouldBlock
                    }
                }
            }
            WriteNode::Stream { producer, done } => {
                loop {
                    if scratch.is_empty() {
                        if *done {
                            return Advance::NodeDone;
                        }
                        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
                        let n = producer(&mut chunk);
                        if n == 0 {
                            *done = true;
                            return Advance::NodeDone;
                        }
                        chunk.truncate(n);
                        *scratch = chunk;
                    }
                    if let Some(tls) = tls.as_mut() {
                        let TlsChannel {
                            filter, outbound, ..
                        } = tls;
                        match filter.write_plaintext(&scratch[..], outbound) {
                            Ok(()) => {
                                scratch.clear();
                                // Flush between chunks.
                                return Advance::WouldBlock;
                            }
                            Err(e) => {
                                tracing::error!("TLS write: {e}");
                                return Advance::PeerGone;
                            }
                        }
                    }
                    match self.socket.write(&scratch[..]) {
                        Ok(n) => {
                            self.note_sent(n);
                            if n < scratch.len() {
                                scratch.drain(..n);
                                return Advance::WouldBlock;
                            }
                            scratch.clear();
                        }
                        Err(e) => {
                            let advance = self.classify_write_error(e);
                            if matches!(advance, Advance::PeerGone) {
                                *done = true;
                            }
                            return advance;
                        }
                    }
                }
            }
        }
    }

    fn classify_write_error(&self, e: io::Error) -> Advance {
        if e.kind() == io::ErrorKind::WouldBlock {
            Advance::WouldBlock
        } else if peer_gone(&e) {
            tracing::trace!("{}: write: {e}", self.name);
            Advance::PeerGone
        } else {
            tracing::error!("{}: unexpected write error: {e}", self.name);
            Advance::PeerGone
        }
    }

    /// Returns true when no TLS ciphertext is waiting for the socket.
    fn flush_tls_outbound(&self, io: &mut MutexGuard<'_, ConnIo>) -> bool {
        let Some(tls) = io.tls.as_mut() else {
            return true;
        };
        while tls.outbound.readable_bytes() > 0 {
            match self.socket.write(tls.outbound.peek()) {
                Ok(n) => {
                    self.note_sent(n);
                    tls.outbound.retrieve(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if peer_gone(&e) => {
                    tracing::trace!("{}: TLS flush: {e}", self.name);
                    tls.outbound.retrieve_all();
                    break;
                }
                Err(e) => {
                    tracing::error!("{}: TLS flush error: {e}", self.name);
                    break;
                }
            }
        }
        let drained = tls.outbound.readable_bytes() == 0;
        if !drained && !self.channel.is_writing() {
            self.channel.enable_writing();
        }
        drained
    }

    fn handle_close(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if self.status() == ConnStatus::Disconnected {
            return;
        }
        tracing::trace!("{}: closed", self.name);
        self.set_status(ConnStatus::Disconnected);
        self.channel.disable_all();
        metrics::CONNECTIONS_ACTIVE.decrement();

        let (conn_cb, close_cb) = {
            let cbs = self.callbacks.lock();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = conn_cb {
            cb(self);
        }
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = self.socket.socket_error();
        if err == 0 {
            return;
        }
        let e = io::Error::from_raw_os_error(err);
        if matches!(err, libc::EPIPE | libc::ECONNRESET | libc::EBADMSG) {
            tracing::trace!("{}: SO_ERROR = {err} ({e})", self.name);
        } else {
            tracing::error!("{}: SO_ERROR = {err} ({e})", self.name);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        tracing::trace!("{}: dropped", self.name);
    }
}

fn peer_gone(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EPIPE) | Some(libc::ECONNRESET)
    )
}
