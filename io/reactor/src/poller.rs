//! Level-triggered epoll readiness multiplexing.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use crate::channel::Channel;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Where a channel currently stands with respect to the kernel interest
/// list. A channel may cycle between `Detached` (empty interest) and
/// `Added` any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    NotInPoller,
    Added,
    Detached,
}

pub(crate) struct Poller {
    epoll_fd: OwnedFd,
    channels: HashMap<RawFd, Weak<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            channels: HashMap::new(),
            events: vec![empty_event(); INIT_EVENT_LIST_SIZE],
        })
    }

    /// Wait up to `timeout_ms` and return the channels with ready events,
    /// in the kernel's order. `EINTR` yields an empty set.
    pub(crate) fn poll(&mut self, timeout_ms: i32) -> io::Result<Vec<Arc<Channel>>> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let n = n as usize;
        let mut active = Vec::with_capacity(n);
        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd).and_then(Weak::upgrade) {
                channel.set_revents(event.events);
                active.push(channel);
            }
        }
        if n == self.events.len() {
            self.events.resize(self.events.len() * 2, empty_event());
        }
        Ok(active)
    }

    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        match channel.poller_state() {
            PollerState::NotInPoller | PollerState::Detached => {
                self.channels.insert(fd, Arc::downgrade(channel));
                self.ctl(libc::EPOLL_CTL_ADD, fd, channel.events());
                channel.set_poller_state(PollerState::Added);
            }
            PollerState::Added => {
                if channel.events() == 0 {
                    self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
                    channel.set_poller_state(PollerState::Detached);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, channel.events());
                }
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if channel.poller_state() == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
        self.channels.remove(&fd);
        channel.set_poller_state(PollerState::NotInPoller);
    }

    /// Recreate the kernel handle (after a fork) and re-register every
    /// live channel.
    pub(crate) fn rebuild(&mut self) -> io::Result<()> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        self.epoll_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        self.channels.retain(|_, weak| weak.upgrade().is_some());
        for (fd, weak) in &self.channels {
            if let Some(channel) = weak.upgrade()
                && channel.events() != 0
            {
                let mut event = libc::epoll_event {
                    events: channel.events(),
                    u64: *fd as u64,
                };
                let ret = unsafe {
                    libc::epoll_ctl(
                        self.epoll_fd.as_raw_fd(),
                        libc::EPOLL_CTL_ADD,
                        *fd,
                        &mut event,
                    )
                };
                if ret != 0 {
                    tracing::error!(fd, "epoll re-register failed: {}", io::Error::last_os_error());
                }
                channel.set_poller_state(PollerState::Added);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) };
        if ret != 0 {
            // Channel bookkeeping went out of sync with the kernel; this
            // is a programming error, not a runtime condition.
            panic!(
                "epoll_ctl(op={op}, fd={fd}) failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

fn empty_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}
