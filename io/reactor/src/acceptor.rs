//! Listening socket feeding accepted fds to a new-connection callback.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

const BACKLOG: i32 = 1024;

pub type NewConnectionCallback = Box<dyn Fn(OwnedFd, SocketAddr) + Send + Sync>;
pub type SockOptCallback = Box<dyn Fn(RawFd) + Send + Sync>;

pub struct Acceptor {
    owner: LoopHandle,
    socket: Socket,
    addr: SocketAddr,
    channel: Arc<Channel>,
    /// Reserve fd used to shed connections under `EMFILE`.
    idle_fd: Mutex<Option<OwnedFd>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    before_listen_cb: Mutex<Option<SockOptCallback>>,
}

impl Acceptor {
    pub fn new(
        owner: &LoopHandle,
        addr: SocketAddr,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let socket = Socket::bound_listener(addr, reuse_addr, reuse_port)
            .map_err(|source| Error::Bind { addr, source })?;
        // Port 0 means "pick one"; report what the kernel chose.
        let addr = if addr.port() == 0 {
            socket.local_addr().map_err(|source| Error::Bind { addr, source })?
        } else {
            addr
        };
        let channel = Channel::new(owner, socket.fd());
        Ok(Arc::new(Acceptor {
            owner: owner.clone(),
            socket,
            addr,
            channel,
            idle_fd: Mutex::new(open_idle_fd()),
            new_connection_cb: Mutex::new(None),
            before_listen_cb: Mutex::new(None),
        }))
    }

    /// The bound address (with the real port when constructed with 0).
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_new_connection_callback(&self, cb: impl Fn(OwnedFd, SocketAddr) + Send + Sync + 'static) {
        *self.new_connection_cb.lock() = Some(Box::new(cb));
    }

    /// Hook run against the listening fd right before `listen()`.
    pub fn set_before_listen_sockopt_callback(&self, cb: impl Fn(RawFd) + Send + Sync + 'static) {
        *self.before_listen_cb.lock() = Some(Box::new(cb));
    }

    pub fn listen(self: &Arc<Self>) -> Result<(), Error> {
        self.owner.assert_in_loop_thread();
        if let Some(cb) = &*self.before_listen_cb.lock() {
            cb(self.socket.fd());
        }
        self.socket.listen(BACKLOG).map_err(Error::Io)?;
        let weak = Arc::downgrade(self);
        self.channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.read_callback();
            }
        });
        self.channel.enable_reading();
        tracing::debug!(addr = %self.addr, "listening");
        Ok(())
    }

    pub fn stop(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if self.channel.is_reading() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }

    /// One accept per readable event is sufficient under level-triggered
    /// epoll; the poller reports the listener again while the backlog is
    /// non-empty.
    fn read_callback(&self) {
        match self.socket.accept() {
            Ok((fd, peer)) => {
                crate::metrics::CONNECTIONS_ACCEPTED.increment();
                match &*self.new_connection_cb.lock() {
                    Some(cb) => cb(fd, peer),
                    None => drop(fd),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                tracing::warn!("accept: file descriptor limit reached, shedding one connection");
                self.shed_connection();
            }
            Err(e) => {
                tracing::error!("accept failed: {e}");
            }
        }
    }

    /// The idle-fd trick: close the reserve fd so the pending connection
    /// can be accepted, close it immediately (the peer gets a clean FIN
    /// rather than a dangling SYN), then re-open the reserve.
    fn shed_connection(&self) {
        let mut idle = self.idle_fd.lock();
        drop(idle.take());
        match self.socket.accept() {
            Ok((fd, _)) => drop(fd),
            Err(e) => tracing::warn!("accept while shedding: {e}"),
        }
        *idle = open_idle_fd();
    }
}

fn open_idle_fd() -> Option<OwnedFd> {
    match std::fs::File::open("/dev/null") {
        Ok(file) => Some(OwnedFd::from(file)),
        Err(e) => {
            tracing::warn!("open /dev/null: {e}");
            None
        }
    }
}
