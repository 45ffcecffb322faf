//! # Deferred Work
//!
//! Where completion handlers push the follow-up dispatcher pass when they
//! must not run it in interrupt context.
//!
//! The platform decides what "later" means. [`WorkQueue`] is the bottom-half
//! model: the interrupt path schedules, the platform drains it from thread
//! context. [`InlineExecutor`] runs the work on the spot.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;

use spin::Mutex;

/// A unit of deferred work
pub type DeferredWork = Box<dyn FnOnce() + Send + 'static>;

/// Runs work outside the scheduling context
pub trait DeferredExecutor: Send + Sync {
    /// Queue `work` to run later; must not run it while the caller waits
    /// on anything `work` might need
    fn schedule(&self, work: DeferredWork);
}

// =============================================================================
// INLINE EXECUTOR
// =============================================================================

/// Runs work immediately on the scheduling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl DeferredExecutor for InlineExecutor {
    fn schedule(&self, work: DeferredWork) {
        work();
    }
}

// =============================================================================
// WORK QUEUE
// =============================================================================

/// FIFO of pending work drained by the platform
#[derive(Default)]
pub struct WorkQueue {
    pending: Mutex<VecDeque<DeferredWork>>,
}

impl WorkQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Run the oldest item, if any
    pub fn run_one(&self) -> bool {
        // Pop before running so the work can schedule more
        let work = self.pending.lock().pop_front();
        match work {
            Some(work) => {
                work();
                true
            },
            None => false,
        }
    }

    /// Run items until the queue is empty, including ones scheduled meanwhile
    ///
    /// Returns the number of items run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl DeferredExecutor for WorkQueue {
    fn schedule(&self, work: DeferredWork) {
        self.pending.lock().push_back(work);
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("pending", &self.len())
            .finish()
    }
}

// =============================================================================
// THREAD EXECUTOR
// =============================================================================

#[cfg(feature = "std")]
pub use thread::ThreadExecutor;

#[cfg(feature = "std")]
mod thread {
    use super::{DeferredExecutor, DeferredWork};
    use core::fmt;
    use spin::Mutex;
    use std::sync::mpsc::{channel, Sender};
    use std::thread::JoinHandle;

    /// One worker thread running scheduled work in order
    pub struct ThreadExecutor {
        sender: Mutex<Option<Sender<DeferredWork>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
    }

    impl ThreadExecutor {
        /// Spawn the worker
        pub fn new() -> Self {
            let (sender, receiver) = channel::<DeferredWork>();
            let worker = std::thread::Builder::new()
                .name("cmdq-deferred".into())
                .spawn(move || {
                    while let Ok(work) = receiver.recv() {
                        work();
                    }
                })
                .ok();
            if worker.is_none() {
                log::error!("Deferred: could not spawn worker thread");
            }

            Self {
                sender: Mutex::new(worker.as_ref().map(|_| sender)),
                worker: Mutex::new(worker),
            }
        }

        /// Stop accepting work and wait for queued work to finish
        pub fn shutdown(&self) {
            self.sender.lock().take();
            if let Some(worker) = self.worker.lock().take() {
                if worker.join().is_err() {
                    log::error!("Deferred: worker thread panicked");
                }
            }
        }
    }

    impl Default for ThreadExecutor {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeferredExecutor for ThreadExecutor {
        fn schedule(&self, work: DeferredWork) {
            let sender = self.sender.lock();
            let rejected = match sender.as_ref() {
                Some(sender) => sender.send(work).err().map(|e| e.0),
                None => Some(work),
            };
            drop(sender);

            // No worker: run here rather than lose the pass
            if let Some(work) = rejected {
                log::warn!("Deferred: no worker, running inline");
                work();
            }
        }
    }

    impl Drop for ThreadExecutor {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    impl fmt::Debug for ThreadExecutor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ThreadExecutor")
                .field("running", &self.sender.lock().is_some())
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_inline_runs_immediately() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        InlineExecutor.schedule(Box::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_work_queue_defers_until_drained() {
        let queue = Arc::new(WorkQueue::new());
        let hits = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let h = Arc::clone(&hits);
            queue.schedule(Box::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_work_may_reschedule() {
        let queue = Arc::new(WorkQueue::new());
        let q = Arc::clone(&queue);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);

        queue.schedule(Box::new(move || {
            let h2 = Arc::clone(&h);
            q.schedule(Box::new(move || {
                h2.fetch_add(1, Ordering::Relaxed);
            }));
        }));

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_thread_executor_runs_work() {
        let executor = ThreadExecutor::new();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let h = Arc::clone(&hits);
            executor.schedule(Box::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }));
        }
        executor.shutdown();
        assert_eq!(hits.load(Ordering::Relaxed), 10);

        // After shutdown work runs inline
        let h = Arc::clone(&hits);
        executor.schedule(Box::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(hits.load(Ordering::Relaxed), 11);
    }
}
