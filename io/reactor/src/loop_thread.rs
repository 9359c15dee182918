//! One OS thread per event loop, and a round-robin pool of them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// Owns an event loop running on its own named thread.
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<Result<(), Error>>>,
}

impl EventLoopThread {
    /// Spawn the thread, construct the loop on it, and hand back its
    /// handle once the loop exists.
    pub fn start(name: &str) -> Result<EventLoopThread, Error> {
        let (tx, rx) = bounded(1);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut event_loop = match EventLoop::new() {
                    Ok(el) => {
                        let _ = tx.send(Ok(el.handle()));
                        el
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return Ok(());
                    }
                };
                event_loop.run()
            })
            .map_err(Error::Io)?;

        let handle = rx
            .recv()
            .map_err(|_| Error::LoopThread("loop thread died during setup".to_string()))??;

        Ok(EventLoopThread {
            handle,
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Ask the loop to exit and join the thread.
    pub fn quit_and_join(&mut self) -> Result<(), Error> {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::LoopThread("loop thread panicked".to_string()))??;
        }
        Ok(())
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
    }
}

/// A fixed set of loop threads selected round-robin.
pub struct EventLoopThreadPool {
    threads: Vec<EventLoopThread>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn start(thread_num: usize, name_prefix: &str) -> Result<EventLoopThreadPool, Error> {
        let mut threads = Vec::with_capacity(thread_num);
        for i in 0..thread_num {
            threads.push(EventLoopThread::start(&format!("{name_prefix}-{i}"))?);
        }
        Ok(EventLoopThreadPool {
            threads,
            next: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Round-robin selection; `None` when the pool has no threads.
    pub fn next_loop(&self) -> Option<LoopHandle> {
        if self.threads.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        Some(self.threads[index % self.threads.len()].handle().clone())
    }

    pub fn handles(&self) -> Vec<LoopHandle> {
        self.threads.iter().map(|t| t.handle().clone()).collect()
    }

    pub fn quit_and_join(&mut self) -> Result<(), Error> {
        for thread in &mut self.threads {
            thread.quit_and_join()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pool_round_robins_across_loops() {
        let pool = EventLoopThreadPool::start(3, "test-io").unwrap();
        let mut seen = HashSet::new();
        for _ in 0..6 {
            seen.insert(pool.next_loop().unwrap().id());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn cross_thread_task_runs_on_loop_thread() {
        let mut thread = EventLoopThread::start("test-loop").unwrap();
        let handle = thread.handle().clone();
        let (tx, rx) = bounded(1);
        handle.run_in_loop(move || {
            let _ = tx.send(std::thread::current().name().map(String::from));
        });
        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("test-loop"));
        thread.quit_and_join().unwrap();
    }

    #[test]
    fn empty_pool_yields_no_loop() {
        let pool = EventLoopThreadPool::start(0, "none").unwrap();
        assert!(pool.next_loop().is_none());
    }
}
