//! Execution contexts for notification delivery.
//!
//! A live realm is confined to the context described by its [`Scheduler`].
//! When another commit makes new data available, the realm hands the
//! scheduler a [`WorkQueue`]; the host runs it on that context, which
//! advances the realm and delivers notifications there.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Pending work for a realm. Run it with [`WorkQueue::perform_work`] on the
/// scheduler's context.
pub struct WorkQueue {
    job: Box<dyn FnOnce() + Send>,
}

impl WorkQueue {
    /// Wraps `job` for delivery through a [`Scheduler`].
    pub fn new(job: impl FnOnce() + Send + 'static) -> Self {
        Self { job: Box::new(job) }
    }

    /// Runs the work.
    pub fn perform_work(self) {
        (self.job)();
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkQueue")
    }
}

/// Host integration point for an event loop.
pub trait Scheduler: Send + Sync {
    /// Requests that `work` be run on this scheduler's context.
    fn notify(&self, work: WorkQueue);

    /// Whether the calling thread belongs to this context.
    fn is_on_thread(&self) -> bool;

    /// Whether `other` describes the same context.
    fn is_same_as(&self, other: &dyn Scheduler) -> bool;

    /// Whether work handed to [`Scheduler::notify`] will ever run.
    fn can_deliver_notifications(&self) -> bool;

    /// Downcasting support for [`Scheduler::is_same_as`].
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("on_thread", &self.is_on_thread())
            .field("delivers", &self.can_deliver_notifications())
            .finish()
    }
}

static NEXT_SCHEDULER: AtomicU64 = AtomicU64::new(1);

/// A scheduler pumped explicitly by its owner.
///
/// Work accumulates until [`ManualScheduler::run_pending`] is called. The
/// scheduler belongs to the thread that created it. Clones share the queue.
#[derive(Clone)]
pub struct ManualScheduler {
    inner: Arc<ManualInner>,
}

struct ManualInner {
    id: u64,
    thread: ThreadId,
    queue: Mutex<VecDeque<WorkQueue>>,
}

impl ManualScheduler {
    /// Creates a scheduler bound to the current thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManualInner {
                id: NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed),
                thread: thread::current().id(),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Runs queued work, including work queued while running. Returns the
    /// number of items run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(work) => {
                    work.perform_work();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Number of queued items.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Process-unique identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn notify(&self, work: WorkQueue) {
        self.inner.queue.lock().push_back(work);
    }

    fn is_on_thread(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    fn is_same_as(&self, other: &dyn Scheduler) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| Arc::ptr_eq(&o.inner, &self.inner))
    }

    fn can_deliver_notifications(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Scheduler of frozen realms: usable from any thread, never delivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrozenScheduler;

impl Scheduler for FrozenScheduler {
    fn notify(&self, _work: WorkQueue) {}

    fn is_on_thread(&self) -> bool {
        true
    }

    fn is_same_as(&self, other: &dyn Scheduler) -> bool {
        other.as_any().is::<Self>()
    }

    fn can_deliver_notifications(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_scheduler_runs_queued_work_in_order() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            scheduler.notify(WorkQueue::new(move || log.lock().push(i)));
        }
        assert_eq!(scheduler.pending(), 3);
        assert_eq!(scheduler.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn work_queued_during_run_also_runs() {
        let scheduler = ManualScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let inner_scheduler = scheduler.clone();
        let inner_count = Arc::clone(&count);
        scheduler.notify(WorkQueue::new(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let c = Arc::clone(&inner_count);
            inner_scheduler.notify(WorkQueue::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn thread_binding_and_identity() {
        let scheduler = ManualScheduler::new();
        assert!(scheduler.is_on_thread());
        let clone = scheduler.clone();
        assert!(scheduler.is_same_as(&clone));
        assert!(!scheduler.is_same_as(&ManualScheduler::new()));
        assert!(!scheduler.is_same_as(&FrozenScheduler));
        let remote = scheduler.clone();
        let on_thread = std::thread::spawn(move || remote.is_on_thread()).join().unwrap();
        assert!(!on_thread);
    }
}
