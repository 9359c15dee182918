//! Non-blocking socket construction and the handful of raw socket
//! operations the connection path needs.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Type};

/// Build the listen address from the server configuration knobs.
pub fn listen_addr(port: u16, loopback_only: bool, ipv6: bool) -> SocketAddr {
    match (ipv6, loopback_only) {
        (false, false) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        (false, true) => SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        (true, false) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        (true, true) => SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
    }
}

/// Owned non-blocking TCP socket.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Create a non-blocking listening socket bound to `addr`.
    /// `listen()` is deferred so a pre-listen sockopt hook can run.
    pub fn bound_listener(
        addr: SocketAddr,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;
        socket.set_reuse_address(reuse_addr)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(&addr.into())?;
        Ok(Socket {
            fd: OwnedFd::from(socket),
        })
    }

    pub fn from_owned(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let ret = unsafe { libc::listen(self.fd(), backlog) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Non-blocking accept; the returned fd is non-blocking and
    /// close-on-exec.
    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let peer = sockaddr_to_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        Ok((fd, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        SockRef::from(&self.fd)
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("non-inet local address"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        SockRef::from(&self.fd)
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("non-inet peer address"))
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_keepalive(on)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_nodelay(on)
    }

    /// Half-close the write side (peer sees FIN, reads keep working).
    pub fn close_write(&self) {
        let ret = unsafe { libc::shutdown(self.fd(), libc::SHUT_WR) };
        if ret < 0 {
            tracing::trace!(
                fd = self.fd(),
                "shutdown(SHUT_WR): {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Pending `SO_ERROR`, consumed.
    pub fn socket_error(&self) -> i32 {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 { errno() } else { err }
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(self.fd(), data.as_ptr() as *const libc::c_void, data.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Kernel-side file-to-socket copy. Advances `offset` by the bytes
    /// sent.
    pub fn sendfile(&self, file_fd: RawFd, offset: &mut i64, count: usize) -> io::Result<usize> {
        let n = unsafe { libc::sendfile(self.fd(), file_fd, offset as *mut libc::off_t, count) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
        }
        _ => None,
    }
}
