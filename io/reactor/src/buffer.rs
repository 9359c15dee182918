//! Growable byte buffer for the connection read path and frame assembly.
//!
//! Layout is `[prepend area | readable | spare]`. The readable region is
//! always contiguous, so parsers get a single `&[u8]` no matter how the
//! bytes arrived. The fixed prepend area lets a framing layer stick a
//! length prefix in front of already-written payload bytes without a copy.

use std::io;
use std::os::fd::RawFd;

/// Bytes reserved in front of the readable region for `prepend`.
pub const PREPEND_SIZE: usize = 8;

const INITIAL_SIZE: usize = 2048;

/// Stack extension used by `read_fd` so one syscall can pull in far more
/// than the current spare capacity.
const EXTENSION_SIZE: usize = 65536;

pub struct Buffer {
    data: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; PREPEND_SIZE + capacity],
            read_idx: PREPEND_SIZE,
            write_idx: PREPEND_SIZE,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_idx == self.write_idx
    }

    #[inline]
    fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_idx
    }

    /// The readable region without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_idx..self.write_idx]
    }

    /// Consume and return the first `n` readable bytes (clamped).
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    /// Discard the first `n` readable bytes (clamped).
    pub fn retrieve(&mut self, n: usize) {
        if n >= self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_idx += n;
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_idx = PREPEND_SIZE;
        self.write_idx = PREPEND_SIZE;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    /// Write `data` immediately in front of the readable region.
    ///
    /// Panics if the prepend area has fewer than `data.len()` bytes free,
    /// which can only happen after more than `PREPEND_SIZE` prepended bytes.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.read_idx,
            "prepend area exhausted: {} > {}",
            data.len(),
            self.read_idx
        );
        self.read_idx -= data.len();
        self.data[self.read_idx..self.read_idx + data.len()].copy_from_slice(data);
    }

    /// Offset of `needle` within the readable region.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.readable_bytes() {
            return None;
        }
        self.peek()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Offset of the first `\r\n` within the readable region.
    #[inline]
    pub fn find_crlf(&self) -> Option<usize> {
        self.find(b"\r\n")
    }

    /// Scatter-read from `fd` into the spare capacity plus a stack
    /// extension, then fold any extension bytes back in. One syscall per
    /// readable event in the common case.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let writable = self.writable_bytes();
        let mut extension = [0u8; EXTENSION_SIZE];

        let mut iov = [
            libc::iovec {
                iov_base: self.data[self.write_idx..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extension.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTENSION_SIZE,
            },
        ];
        let iovcnt = if writable < EXTENSION_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_idx += n;
        } else {
            self.write_idx = self.data.len();
            self.append(&extension[..n - writable]);
        }
        Ok(n)
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        let reclaimable = self.read_idx - PREPEND_SIZE;
        if reclaimable + self.writable_bytes() >= n {
            // Shift readable bytes to the front instead of reallocating.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_idx..self.write_idx, PREPEND_SIZE);
            self.read_idx = PREPEND_SIZE;
            self.write_idx = PREPEND_SIZE + readable;
        } else {
            let needed = self.write_idx + n;
            self.data.resize(needed.max(self.data.len() * 2), 0);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{FromRawFd, OwnedFd};

    #[test]
    fn append_and_read() {
        let mut buf = Buffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.peek(), b"hello world");
        assert_eq!(buf.read(6), b"hello ");
        assert_eq!(buf.peek(), b"world");
        buf.retrieve_all();
        assert!(buf.is_empty());
    }

    #[test]
    fn prepend_length_prefix() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let len = (buf.readable_bytes() as u32).to_le_bytes();
        buf.prepend(&len);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &7u32.to_le_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn find_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
        assert_eq!(buf.find(b"nothing"), None);
    }

    #[test]
    fn grows_geometrically() {
        let mut buf = Buffer::with_capacity(4);
        let big = vec![0xabu8; 10000];
        buf.append(&big);
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn compacts_before_reallocating() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(12);
        // 12 reclaimable bytes up front; this fits after compaction.
        buf.append(b"0123456789");
        assert_eq!(buf.peek(), b"cdef0123456789");
    }

    #[test]
    fn read_fd_pulls_from_pipe() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let payload = b"scatter read payload";
        let written = unsafe {
            libc::write(
                std::os::fd::AsRawFd::as_raw_fd(&wr),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(written as usize, payload.len());

        let mut buf = Buffer::with_capacity(4);
        let n = buf
            .read_fd(std::os::fd::AsRawFd::as_raw_fd(&rd))
            .expect("readv");
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), payload);
    }
}
