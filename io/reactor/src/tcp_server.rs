//! Binds an acceptor to a pool of I/O loops and wires connections up.
//!
//! The acceptor lives on the server's main loop. Each accepted socket is
//! handed to a round-robin-selected I/O loop, which owns the connection
//! exclusively from then on; all user callbacks fire there.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::connection::{ConnectionCallback, RecvMessageCallback, TcpConnection};
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::loop_thread::EventLoopThreadPool;
use crate::wheel::TimingWheel;

pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    name: String,
    main_loop: LoopHandle,
    acceptor: Arc<Acceptor>,
    pool: Mutex<Option<EventLoopThreadPool>>,
    io_loop_num: Mutex<usize>,
    connections: Mutex<HashMap<u64, Arc<TcpConnection>>>,
    /// One wheel per I/O loop, keyed by loop id. Allocated at `start`
    /// when idle kickoff (or a bare wheel) was requested.
    wheels: Mutex<HashMap<u64, Arc<TimingWheel>>>,
    idle_timeout: AtomicU64,
    wheel_max_timeout: AtomicU64,
    recv_message_cb: Mutex<Option<RecvMessageCallback>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    started: AtomicBool,
}

impl TcpServer {
    pub fn new(main_loop: &LoopHandle, addr: SocketAddr, name: &str) -> Result<TcpServer, Error> {
        Self::with_options(main_loop, addr, name, true, false)
    }

    pub fn with_options(
        main_loop: &LoopHandle,
        addr: SocketAddr,
        name: &str,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> Result<TcpServer, Error> {
        let acceptor = Acceptor::new(main_loop, addr, reuse_addr, reuse_port)?;
        Ok(TcpServer {
            inner: Arc::new(ServerInner {
                name: name.to_string(),
                main_loop: main_loop.clone(),
                acceptor,
                pool: Mutex::new(None),
                io_loop_num: Mutex::new(0),
                connections: Mutex::new(HashMap::new()),
                wheels: Mutex::new(HashMap::new()),
                idle_timeout: AtomicU64::new(0),
                wheel_max_timeout: AtomicU64::new(0),
                recv_message_cb: Mutex::new(None),
                connection_cb: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// The bound address (real port when constructed with port 0).
    pub fn addr(&self) -> SocketAddr {
        self.inner.acceptor.addr()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of I/O loop threads. Zero keeps connections on the main
    /// loop. Set before `start`.
    pub fn set_io_loop_num(&self, num: usize) {
        assert!(
            !self.inner.started.load(Ordering::Acquire),
            "set_io_loop_num after start"
        );
        *self.inner.io_loop_num.lock() = num;
    }

    pub fn set_recv_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut crate::buffer::Buffer) + Send + Sync + 'static,
    ) {
        *self.inner.recv_message_cb.lock() = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.inner.connection_cb.lock() = Some(Arc::new(cb));
    }

    /// Hook run against the listening fd right before `listen()`.
    pub fn set_before_listen_sockopt_callback(
        &self,
        cb: impl Fn(RawFd) + Send + Sync + 'static,
    ) {
        self.inner.acceptor.set_before_listen_sockopt_callback(cb);
    }

    /// Force-close connections idle for `timeout_secs`. Implies a timing
    /// wheel per I/O loop.
    pub fn kickoff_idle_connections(&self, timeout_secs: u64) {
        self.inner.idle_timeout.store(timeout_secs, Ordering::Release);
        let current = self.inner.wheel_max_timeout.load(Ordering::Acquire);
        if timeout_secs > current {
            self.inner
                .wheel_max_timeout
                .store(timeout_secs, Ordering::Release);
        }
    }

    /// Allocate per-loop timing wheels able to hold `max_timeout_secs`
    /// without arming idle kickoff. Upper layers (liveness pings) use
    /// the wheels directly.
    pub fn enable_timing_wheel(&self, max_timeout_secs: u64) {
        let current = self.inner.wheel_max_timeout.load(Ordering::Acquire);
        if max_timeout_secs > current {
            self.inner
                .wheel_max_timeout
                .store(max_timeout_secs, Ordering::Release);
        }
    }

    /// The timing wheel of the loop `handle` belongs to, if wheels are
    /// enabled.
    pub fn timing_wheel(&self, handle: &LoopHandle) -> Option<Arc<TimingWheel>> {
        self.inner.wheels.lock().get(&handle.id()).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn start(&self) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let io_loop_num = *self.inner.io_loop_num.lock();
        let pool = EventLoopThreadPool::start(io_loop_num, &format!("{}-io", self.inner.name))?;

        let wheel_max = self.inner.wheel_max_timeout.load(Ordering::Acquire);
        if wheel_max > 0 {
            let mut wheels = self.inner.wheels.lock();
            let loops = if pool.is_empty() {
                vec![self.inner.main_loop.clone()]
            } else {
                pool.handles()
            };
            for handle in loops {
                wheels.insert(handle.id(), TimingWheel::new(&handle, wheel_max));
            }
        }
        *self.inner.pool.lock() = Some(pool);

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .acceptor
            .set_new_connection_callback(move |fd, peer| {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::new_connection(&inner, fd, peer);
                }
            });

        let acceptor = self.inner.acceptor.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.inner.main_loop.run_in_loop(move || {
            let _ = tx.send(acceptor.listen());
        });
        rx.recv()
            .map_err(|_| Error::LoopThread("main loop dropped listen task".to_string()))??;

        tracing::info!(server = %self.inner.name, addr = %self.addr(), io_loops = io_loop_num, "started");
        Ok(())
    }

    /// Close the listener, force-close every connection, and stop the
    /// I/O loops.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let acceptor = self.inner.acceptor.clone();
        self.inner.main_loop.run_in_loop(move || acceptor.stop());

        let connections: Vec<_> = self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.force_close();
        }
        self.inner.wheels.lock().clear();
        if let Some(mut pool) = self.inner.pool.lock().take() {
            if let Err(e) = pool.quit_and_join() {
                tracing::warn!(server = %self.inner.name, "pool shutdown: {e}");
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerInner {
    /// Runs on the main loop (acceptor callback).
    fn new_connection(inner: &Arc<ServerInner>, fd: OwnedFd, peer: SocketAddr) {
        let io_loop = inner
            .pool
            .lock()
            .as_ref()
            .and_then(|pool| pool.next_loop())
            .unwrap_or_else(|| inner.main_loop.clone());

        let conn = TcpConnection::new(&io_loop, fd, peer, None);
        tracing::debug!(server = %inner.name, conn = %conn.name(), "new connection");

        if let Some(cb) = inner.recv_message_cb.lock().clone() {
            conn.set_recv_message_callback(move |c, buf| cb(c, buf));
        }
        if let Some(cb) = inner.connection_cb.lock().clone() {
            conn.set_connection_callback(move |c| cb(c));
        }
        let weak = Arc::downgrade(inner);
        conn.set_close_callback(move |c| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, c);
            }
        });

        inner.connections.lock().insert(conn.id(), conn.clone());

        let idle_timeout = inner.idle_timeout.load(Ordering::Acquire);
        let wheel = inner.wheels.lock().get(&io_loop.id()).cloned();
        io_loop.run_in_loop(move || {
            if idle_timeout > 0
                && let Some(wheel) = wheel.as_ref()
            {
                conn.enable_kickoff(wheel, idle_timeout);
            }
            conn.connect_established();
        });
    }

    /// Runs on the connection's I/O loop (close callback). The strong
    /// reference is dropped on the main loop; destruction happens back on
    /// the I/O loop on its next iteration.
    fn remove_connection(inner: &Arc<ServerInner>, conn: &Arc<TcpConnection>) {
        let id = conn.id();
        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        let weak = Arc::downgrade(inner);
        inner.main_loop.queue_in_loop(move || {
            if let Some(inner) = weak.upgrade() {
                inner.connections.lock().remove(&id);
            }
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        });
    }
}
