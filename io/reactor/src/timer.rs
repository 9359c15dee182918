//! Steady-clock timers backed by a kernel timer fd.
//!
//! A min-heap keyed by deadline plus a live-id set: cancellation is a
//! logical removal, the heap entry is skipped when it pops. One timerfd is
//! armed to the earliest deadline; repeating timers rearm with
//! `deadline += interval`.

use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::event_loop::LoopHandle;

/// Minimum rearm distance; anything closer fires "immediately".
const MIN_REARM: Duration = Duration::from_micros(100);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic non-zero timer identity. Unique among active timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    fn next() -> TimerId {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct TimerEntry {
    id: TimerId,
    when: Instant,
    interval: Option<Duration>,
    cb: TimerCallback,
}

impl TimerEntry {
    pub(crate) fn new(when: Instant, interval: Option<Duration>, cb: TimerCallback) -> TimerEntry {
        TimerEntry {
            id: TimerId::next(),
            when,
            interval,
            cb,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> TimerId {
        self.id
    }
}

/// Min-heap adapter: `BinaryHeap` is a max-heap, so ordering is reversed.
struct ByDeadline(TimerEntry);

impl PartialEq for ByDeadline {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for ByDeadline {}
impl PartialOrd for ByDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByDeadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .0
            .when
            .cmp(&self.0.when)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

struct TimerQueueInner {
    heap: BinaryHeap<ByDeadline>,
    live: HashSet<TimerId>,
}

pub(crate) struct TimerQueue {
    timer_fd: Mutex<OwnedFd>,
    inner: Mutex<TimerQueueInner>,
    channel: Mutex<Option<Arc<Channel>>>,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            timer_fd: Mutex::new(create_timerfd()?),
            inner: Mutex::new(TimerQueueInner {
                heap: BinaryHeap::new(),
                live: HashSet::new(),
            }),
            channel: Mutex::new(None),
        })
    }

    /// Register the timerfd channel with the owning loop. Called once
    /// during loop construction (and again after `reset`).
    pub(crate) fn install(&self, handle: &LoopHandle) {
        let fd = self.timer_fd.lock().as_raw_fd();
        let channel = Channel::new(handle, fd);
        let weak = Arc::downgrade(&handle.shared);
        channel.set_read_callback(move || {
            if let Some(shared) = weak.upgrade() {
                shared.timers.handle_read();
            }
        });
        channel.enable_reading();
        *self.channel.lock() = Some(channel);
    }

    pub(crate) fn add_in_loop(&self, entry: TimerEntry) {
        let when = entry.when;
        let earliest_changed = {
            let mut inner = self.inner.lock();
            inner.live.insert(entry.id);
            let changed = inner
                .heap
                .peek()
                .is_none_or(|top| when < top.0.when);
            inner.heap.push(ByDeadline(entry));
            changed
        };
        if earliest_changed {
            self.rearm(when);
        }
    }

    pub(crate) fn invalidate_in_loop(&self, id: TimerId) {
        self.inner.lock().live.remove(&id);
    }

    fn handle_read(&self) {
        {
            let fd = self.timer_fd.lock();
            let mut expirations: u64 = 0;
            let n = unsafe {
                libc::read(
                    fd.as_raw_fd(),
                    &mut expirations as *mut u64 as *mut libc::c_void,
                    8,
                )
            };
            if n != 8 {
                tracing::trace!("timerfd read returned {n}");
            }
        }

        let now = Instant::now();
        let due = {
            let mut inner = self.inner.lock();
            let mut due = Vec::new();
            while let Some(top) = inner.heap.peek() {
                if top.0.when <= now {
                    due.push(inner.heap.pop().expect("peeked").0);
                } else {
                    break;
                }
            }
            // Skip-on-pop: invalidated ids never run.
            due.retain(|timer| inner.live.contains(&timer.id));
            due
        };

        // Callbacks run without the queue lock; they may add timers.
        for timer in &due {
            (timer.cb)();
        }

        let next = {
            let mut inner = self.inner.lock();
            for mut timer in due {
                if !inner.live.contains(&timer.id) {
                    continue;
                }
                match timer.interval {
                    Some(interval) => {
                        timer.when = now + interval;
                        inner.heap.push(ByDeadline(timer));
                    }
                    None => {
                        inner.live.remove(&timer.id);
                    }
                }
            }
            inner.heap.peek().map(|top| top.0.when)
        };
        if let Some(when) = next {
            self.rearm(when);
        }
    }

    fn rearm(&self, when: Instant) {
        let delta = when
            .saturating_duration_since(Instant::now())
            .max(MIN_REARM);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delta.as_secs() as libc::time_t,
                tv_nsec: delta.subsec_nanos() as libc::c_long,
            },
        };
        let fd = self.timer_fd.lock();
        let ret =
            unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &new_value, std::ptr::null_mut()) };
        if ret != 0 {
            tracing::error!("timerfd_settime: {}", io::Error::last_os_error());
        }
    }

    /// Rebuild the timer fd after a fork and re-register the channel.
    pub(crate) fn reset(&self, handle: &LoopHandle) -> io::Result<()> {
        if let Some(channel) = self.channel.lock().take() {
            channel.disable_all();
            channel.remove();
        }
        {
            let mut fd = self.timer_fd.lock();
            let _old = mem::replace(&mut *fd, create_timerfd()?);
        }
        self.install(handle);
        let next = self.inner.lock().heap.peek().map(|top| top.0.when);
        if let Some(when) = next {
            self.rearm(when);
        }
        Ok(())
    }
}

fn create_timerfd() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use crate::event_loop::EventLoop;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn run_after_fires_once() {
        let mut el = EventLoop::new().unwrap();
        let handle = el.handle();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let h = handle.clone();
        handle.run_after(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
            h.quit();
        });

        let start = Instant::now();
        el.run().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn run_every_repeats_until_invalidated() {
        let mut el = EventLoop::new().unwrap();
        let handle = el.handle();
        let ticks = Arc::new(AtomicUsize::new(0));

        let t = ticks.clone();
        let h = handle.clone();
        let id_slot = Arc::new(parking_lot::Mutex::new(None));
        let slot = id_slot.clone();
        let id = handle.run_every(Duration::from_millis(10), move || {
            if t.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                if let Some(id) = *slot.lock() {
                    h.invalidate_timer(id);
                }
                h.quit();
            }
        });
        *id_slot.lock() = Some(id);

        el.run().unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn invalidated_timer_never_fires() {
        let mut el = EventLoop::new().unwrap();
        let handle = el.handle();
        let fired = Arc::new(AtomicBool::new(false));

        let f = fired.clone();
        let id = handle.run_after(Duration::from_millis(30), move || {
            f.store(true, Ordering::SeqCst);
        });
        handle.invalidate_timer(id);

        let h = handle.clone();
        handle.run_after(Duration::from_millis(80), move || h.quit());

        el.run().unwrap();
        assert!(!fired.load(Ordering::SeqCst));
    }
}
