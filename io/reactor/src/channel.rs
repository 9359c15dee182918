//! Binding of one file descriptor to its interest mask and callbacks
//! within an event loop.
//!
//! Channels are never shared across loops. Every interest mutation routes
//! through the owning loop's poller and asserts loop-thread affinity; a
//! violation is a programming error and panics.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event_loop::LoopHandle;
use crate::poller::PollerState;

pub(crate) const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;

pub(crate) type EventCallback = Arc<dyn Fn() + Send + Sync>;

pub struct Channel {
    fd: RawFd,
    owner: LoopHandle,
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    events: u32,
    revents: u32,
    state: PollerState,
    read_cb: Option<EventCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
    /// Back-reference to the channel's owner (e.g. the connection).
    /// When set, event dispatch is skipped if the owner is already gone.
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

impl Channel {
    pub fn new(owner: &LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            owner: owner.clone(),
            inner: Mutex::new(ChannelInner {
                events: 0,
                revents: 0,
                state: PollerState::NotInPoller,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
                tie: None,
            }),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn owner_loop(&self) -> &LoopHandle {
        &self.owner
    }

    pub fn set_read_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().read_cb = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().write_cb = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().close_cb = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().error_cb = Some(Arc::new(cb));
    }

    /// Defer event handling to the lifetime of `owner`: if the owner has
    /// been destroyed by the time an event fires, the event is dropped.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(owner) as _;
        self.inner.lock().tie = Some(weak);
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.inner.lock().events |= READ_EVENTS;
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.inner.lock().events |= WRITE_EVENTS;
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.inner.lock().events &= !WRITE_EVENTS;
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.inner.lock().events = 0;
        self.update();
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.inner.lock().events & WRITE_EVENTS != 0
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.inner.lock().events & READ_EVENTS != 0
    }

    /// Drop the channel from the poller. Interest must already be empty.
    pub fn remove(self: &Arc<Self>) {
        assert_eq!(self.inner.lock().events, 0, "remove() with live interest");
        self.owner.remove_channel(self);
    }

    fn update(self: &Arc<Self>) {
        self.owner.update_channel(self);
    }

    /// Dispatch the ready events recorded by the poller.
    pub(crate) fn handle_event(self: &Arc<Self>) {
        let (events, revents, tie, read_cb, write_cb, close_cb, error_cb) = {
            let inner = self.inner.lock();
            (
                inner.events,
                inner.revents,
                inner.tie.clone(),
                inner.read_cb.clone(),
                inner.write_cb.clone(),
                inner.close_cb.clone(),
                inner.error_cb.clone(),
            )
        };
        if events == 0 {
            return;
        }
        // Hold the owner alive across dispatch; skip if it is already gone.
        let _tie_guard = match tie {
            Some(tie) => match tie.upgrade() {
                Some(owner) => Some(owner),
                None => return,
            },
            None => None,
        };

        const HUP: u32 = libc::EPOLLHUP as u32;
        const ERR: u32 = libc::EPOLLERR as u32;
        const IN: u32 = libc::EPOLLIN as u32;
        const RDHUP: u32 = libc::EPOLLRDHUP as u32;

        if revents & HUP != 0 && revents & IN == 0 {
            if let Some(cb) = &close_cb {
                cb();
            }
        }
        if revents & ERR != 0 {
            if let Some(cb) = &error_cb {
                cb();
            }
        }
        if revents & (READ_EVENTS | RDHUP) != 0 {
            if let Some(cb) = &read_cb {
                cb();
            }
        }
        if revents & WRITE_EVENTS != 0 {
            if let Some(cb) = &write_cb {
                cb();
            }
        }
    }

    // Poller bookkeeping accessors.

    pub(crate) fn events(&self) -> u32 {
        self.inner.lock().events
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.inner.lock().revents = revents;
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        self.inner.lock().state
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.inner.lock().state = state;
    }
}
