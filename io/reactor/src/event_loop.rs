//! Single-threaded event dispatch with a cross-thread task queue.
//!
//! One iteration: poll (10 s ceiling), dispatch ready channels in the
//! poller's order, then drain the task queue to empty. Everything a loop
//! owns (poller, channels, timers) is mutated only on the owning thread;
//! the task queue plus the eventfd wakeup is the sole remote entry point.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Error;
use crate::poller::Poller;
use crate::timer::{TimerEntry, TimerId, TimerQueue};

/// Poll ceiling. A liveness guarantee, not an accuracy one: shorter
/// timers are satisfied by the timer fd rearming.
const POLL_TIMEOUT_MS: i32 = 10_000;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Loop registered on this thread. Two loops on one thread is a
    /// programming error.
    static CURRENT_LOOP: Cell<Option<u64>> = const { Cell::new(None) };
}

pub(crate) struct LoopShared {
    pub(crate) poller: Mutex<Poller>,
    pub(crate) timers: TimerQueue,
    wakeup_fd: OwnedFd,
    task_tx: Sender<Task>,
    quit_tx: Sender<Task>,
    thread: ThreadId,
    id: u64,
    looping: AtomicBool,
    quitting: AtomicBool,
    calling_tasks: AtomicBool,
}

/// The cross-thread face of an event loop. Cheap to clone; every handle
/// refers to the same loop.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

pub struct EventLoop {
    shared: Arc<LoopShared>,
    task_rx: Receiver<Task>,
    quit_rx: Receiver<Task>,
    // Registered for the lifetime of the loop.
    wakeup_channel: Arc<Channel>,
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> Result<EventLoop, Error> {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let wakeup_fd = create_eventfd()?;
        let (task_tx, task_rx) = unbounded();
        let (quit_tx, quit_rx) = unbounded();

        let shared_poller = Poller::new()?;
        let timers = TimerQueue::new()?;

        CURRENT_LOOP.with(|slot| {
            if slot.get().is_some() {
                panic!("an event loop already exists on this thread");
            }
            slot.set(Some(id));
        });

        let shared = Arc::new(LoopShared {
            poller: Mutex::new(shared_poller),
            timers,
            wakeup_fd,
            task_tx,
            quit_tx,
            thread: thread::current().id(),
            id,
            looping: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            calling_tasks: AtomicBool::new(false),
        });
        let handle = LoopHandle {
            shared: shared.clone(),
        };

        let wakeup_channel = Channel::new(&handle, shared.wakeup_fd.as_raw_fd());
        let wakeup_raw = shared.wakeup_fd.as_raw_fd();
        wakeup_channel.set_read_callback(move || drain_eventfd(wakeup_raw));
        wakeup_channel.enable_reading();

        shared.timers.install(&handle);

        Ok(EventLoop {
            shared,
            task_rx,
            quit_rx,
            wakeup_channel,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Block the calling thread dispatching events until `quit()`.
    ///
    /// Must be called on the owning thread. A panic escaping a handler
    /// aborts the current iteration; on-quit tasks still run, then the
    /// panic resumes out of here.
    pub fn run(&mut self) -> Result<(), Error> {
        self.shared.assert_in_loop_thread();
        assert!(
            !self.shared.looping.swap(true, Ordering::AcqRel),
            "loop is already running"
        );

        // A quit() issued before run() is honored: the flag is never
        // reset, so the loop exits on its first iteration check.
        let result = catch_unwind(AssertUnwindSafe(|| self.run_inner()));

        while let Ok(task) = self.quit_rx.try_recv() {
            task();
        }
        self.shared.looping.store(false, Ordering::Release);

        match result {
            Ok(r) => r,
            Err(panic) => resume_unwind(panic),
        }
    }

    fn run_inner(&self) -> Result<(), Error> {
        while !self.shared.quitting.load(Ordering::Acquire) {
            let active = self.shared.poller.lock().poll(POLL_TIMEOUT_MS)?;
            for channel in &active {
                channel.handle_event();
            }
            self.drain_tasks();
        }
        Ok(())
    }

    /// Drain until a sample finds the queue empty, so tasks enqueued by
    /// tasks run in the same drain.
    fn drain_tasks(&self) {
        self.shared.calling_tasks.store(true, Ordering::Release);
        while !self.task_rx.is_empty() {
            while let Ok(task) = self.task_rx.try_recv() {
                task();
            }
        }
        self.shared.calling_tasks.store(false, Ordering::Release);
    }

    /// Rebuild kernel handles after a fork: new epoll fd with the
    /// registered channels preserved, fresh timer fd.
    pub fn reset_after_fork(&self) -> Result<(), Error> {
        self.shared.poller.lock().rebuild()?;
        self.shared.timers.reset(&self.handle())?;
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if self.wakeup_channel.is_reading() {
            self.wakeup_channel.disable_all();
            self.wakeup_channel.remove();
        }
        CURRENT_LOOP.with(|slot| slot.set(None));
    }
}

impl LoopHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }

    /// Run `f` synchronously when called on the owning thread, otherwise
    /// enqueue it and wake the loop.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always enqueue; wake unless already on the loop thread inside the
    /// task-drain phase (the drain will pick the task up itself). A task
    /// queued to a loop that already exited is dropped.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.shared.task_tx.send(Box::new(f)).is_err() {
            tracing::trace!(loop_id = self.shared.id, "task dropped, loop is gone");
            return;
        }
        if !(self.is_in_loop_thread() && self.shared.calling_tasks.load(Ordering::Acquire)) {
            self.wakeup();
        }
    }

    /// Enqueue a task to run after the loop exits, before `run()` returns.
    pub fn run_on_quit(&self, f: impl FnOnce() + Send + 'static) {
        if self.shared.quit_tx.send(Box::new(f)).is_err() {
            tracing::trace!(loop_id = self.shared.id, "quit task dropped, loop is gone");
        }
    }

    /// Ask the loop to exit. Idempotent, callable from any thread.
    pub fn quit(&self) {
        self.shared.quitting.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn run_at(&self, when: Instant, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.add_timer(TimerEntry::new(when, None, Arc::new(cb)))
    }

    pub fn run_after(&self, delay: Duration, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    pub fn run_every(&self, interval: Duration, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.add_timer(TimerEntry::new(
            Instant::now() + interval,
            Some(interval),
            Arc::new(cb),
        ))
    }

    fn add_timer(&self, entry: TimerEntry) -> TimerId {
        let id = entry.id();
        let shared = self.shared.clone();
        self.run_in_loop(move || shared.timers.add_in_loop(entry));
        id
    }

    /// Logically remove a timer. An in-flight firing after this call
    /// takes effect on the loop is impossible.
    pub fn invalidate_timer(&self, id: TimerId) {
        let shared = self.shared.clone();
        self.run_in_loop(move || shared.timers.invalidate_in_loop(id));
    }

    /// Write the wakeup eventfd. Idempotent; the counter value is ignored.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.shared.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if ret < 0 {
            tracing::warn!("wakeup write failed: {}", io::Error::last_os_error());
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().remove_channel(channel);
    }
}

impl LoopShared {
    fn assert_in_loop_thread(&self) {
        if thread::current().id() != self.thread {
            panic!(
                "loop {} touched from thread {:?}; loop mutations are only \
                 legal on the owning thread",
                self.id,
                thread::current().id()
            );
        }
    }
}

fn create_eventfd() -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn drain_eventfd(fd: RawFd) {
    let mut value: u64 = 0;
    let ret = unsafe { libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, 8) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            tracing::warn!("wakeup read failed: {err}");
        }
    }
}
