//! Hierarchical timing wheel for coarse timeouts at connection scale.
//!
//! Buckets rotate once per second; an entry's effect runs when the last
//! bucket holding it is evicted. Re-inserting a live entry adds a holder,
//! which defers the effect: that is how idle kickoff is extended on read
//! activity. `EntryHandle::cancel` takes the effect so it never runs.
//!
//! Insertion and expiry are amortized O(1), which is what matters when a
//! loop holds 10^4..10^6 connections with second-granularity timeouts; the
//! timer queue stays reserved for the few timers that need accuracy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::event_loop::LoopHandle;
use crate::timer::TimerId;

pub const BUCKETS_PER_WHEEL: u64 = 100;
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

type Effect = Box<dyn FnOnce() + Send>;

pub struct WheelEntry {
    holders: AtomicUsize,
    effect: Mutex<Option<Effect>>,
}

/// Weak grip on a wheel entry: enough to cancel it or re-insert it, never
/// enough to keep it (or anything its effect captures) alive.
#[derive(Clone)]
pub struct EntryHandle {
    entry: Weak<WheelEntry>,
}

impl EntryHandle {
    /// Prevent the effect from ever running. Idempotent.
    pub fn cancel(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.effect.lock().take();
        }
    }

    /// True while the entry is held by at least one bucket and has not
    /// been cancelled.
    pub fn is_armed(&self) -> bool {
        self.entry
            .upgrade()
            .is_some_and(|entry| entry.effect.lock().is_some())
    }
}

struct WheelInner {
    /// `wheels[0]` rotates every tick, `wheels[k]` every `B^k` ticks.
    wheels: Vec<VecDeque<Vec<Arc<WheelEntry>>>>,
    ticks: u64,
}

pub struct TimingWheel {
    owner: LoopHandle,
    inner: Mutex<WheelInner>,
    timer: Mutex<Option<TimerId>>,
    max_timeout: u64,
}

impl TimingWheel {
    /// Build a wheel able to hold timeouts up to `max_timeout` seconds,
    /// ticking on `loop_`.
    pub fn new(owner: &LoopHandle, max_timeout: u64) -> Arc<TimingWheel> {
        let mut wheels_num = 1;
        let mut capacity = BUCKETS_PER_WHEEL;
        while capacity < max_timeout {
            capacity *= BUCKETS_PER_WHEEL;
            wheels_num += 1;
        }

        let wheels = (0..wheels_num)
            .map(|_| {
                (0..BUCKETS_PER_WHEEL)
                    .map(|_| Vec::new())
                    .collect::<VecDeque<_>>()
            })
            .collect();

        let wheel = Arc::new(TimingWheel {
            owner: owner.clone(),
            inner: Mutex::new(WheelInner { wheels, ticks: 0 }),
            timer: Mutex::new(None),
            max_timeout,
        });

        let weak = Arc::downgrade(&wheel);
        let timer_id = owner.run_every(TICK_INTERVAL, move || {
            if let Some(wheel) = weak.upgrade() {
                wheel.tick();
            }
        });
        *wheel.timer.lock() = Some(timer_id);
        wheel
    }

    #[inline]
    pub fn max_timeout(&self) -> u64 {
        self.max_timeout
    }

    /// Schedule `effect` to run on the owning loop after `delay_secs`
    /// (rounded up to whole ticks).
    pub fn insert(
        self: &Arc<Self>,
        delay_secs: u64,
        effect: impl FnOnce() + Send + 'static,
    ) -> EntryHandle {
        let entry = Arc::new(WheelEntry {
            holders: AtomicUsize::new(0),
            effect: Mutex::new(Some(Box::new(effect))),
        });
        let handle = EntryHandle {
            entry: Arc::downgrade(&entry),
        };
        self.attach(delay_secs, entry);
        handle
    }

    /// Re-insert a live entry, deferring its effect by another
    /// `delay_secs`. A dead or cancelled handle is a no-op.
    pub fn extend(self: &Arc<Self>, delay_secs: u64, handle: &EntryHandle) {
        if let Some(entry) = handle.entry.upgrade() {
            self.attach(delay_secs, entry);
        }
    }

    fn attach(self: &Arc<Self>, delay_secs: u64, entry: Arc<WheelEntry>) {
        // Count the holder before the bucket exists so an eviction racing
        // with this insert cannot fire the effect early.
        entry.holders.fetch_add(1, Ordering::AcqRel);
        let wheel = self.clone();
        self.owner
            .run_in_loop(move || wheel.attach_in_loop(delay_secs, entry));
    }

    fn attach_in_loop(self: &Arc<Self>, delay_secs: u64, entry: Arc<WheelEntry>) {
        let delay = delay_secs.max(1);
        let mut inner = self.inner.lock();

        let mut level = 0;
        let mut span = 1u64; // ticks per bucket at this level
        while delay > span * BUCKETS_PER_WHEEL && level + 1 < inner.wheels.len() {
            span *= BUCKETS_PER_WHEEL;
            level += 1;
        }

        if level == 0 {
            // Bucket `d` is evicted between `d` and `d+1` ticks from now:
            // never early, at most one tick late.
            let idx = delay.min(BUCKETS_PER_WHEEL - 1) as usize;
            inner.wheels[0][idx].push(entry);
            return;
        }

        let rotations = (delay / span).clamp(1, BUCKETS_PER_WHEEL);
        let remaining = delay % span;
        let idx = (rotations - 1) as usize;
        if remaining == 0 {
            inner.wheels[level][idx].push(entry);
        } else {
            // Cascade: when the outer bucket evicts, re-insert into the
            // inner wheels with the remaining delay.
            let weak_wheel = Arc::downgrade(self);
            let wrapper = Arc::new(WheelEntry {
                holders: AtomicUsize::new(1),
                effect: Mutex::new(Some(Box::new(move || {
                    if let Some(wheel) = weak_wheel.upgrade() {
                        wheel.attach_in_loop(remaining, entry);
                    }
                }))),
            });
            inner.wheels[level][idx].push(wrapper);
        }
    }

    fn tick(self: &Arc<Self>) {
        let evicted = {
            let mut inner = self.inner.lock();
            inner.ticks += 1;
            let ticks = inner.ticks;
            let mut evicted = Vec::new();
            let mut span = 1u64;
            for level in 0..inner.wheels.len() {
                if ticks % span == 0 {
                    let bucket = inner.wheels[level].pop_front().expect("bucket ring");
                    inner.wheels[level].push_back(Vec::new());
                    evicted.extend(bucket);
                }
                span *= BUCKETS_PER_WHEEL;
            }
            evicted
        };

        // Effects run without the wheel lock; cascades and re-insertions
        // from inside an effect re-enter cleanly.
        for entry in evicted {
            if entry.holders.fetch_sub(1, Ordering::AcqRel) == 1
                && let Some(effect) = entry.effect.lock().take()
            {
                effect();
            }
        }
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        if let Some(id) = self.timer.lock().take() {
            self.owner.invalidate_timer(id);
        }
    }
}
