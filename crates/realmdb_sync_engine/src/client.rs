//! The sync client worker.
//!
//! One thread runs a single-threaded tokio runtime that owns every session
//! driver. Everything that touches a driver is posted to it as a job, so
//! drivers never need locks. Timers are tasks that post a job when they
//! fire.

use crate::driver::SessionDriver;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use realmdb_core::{Scheduler, WorkQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};

pub(crate) type Job = Box<dyn FnOnce(&mut Worker) + Send>;

/// Runs `f` through `scheduler`, or right away without one.
pub(crate) fn deliver(scheduler: Option<&Arc<dyn Scheduler>>, f: impl FnOnce() + Send + 'static) {
    match scheduler {
        Some(scheduler) if scheduler.can_deliver_notifications() => scheduler.notify(WorkQueue::new(f)),
        _ => f(),
    }
}

/// Posts jobs to the worker.
#[derive(Clone, Debug)]
pub(crate) struct ClientHandle {
    jobs: UnboundedSender<Job>,
}

impl ClientHandle {
    /// Queues `job`. Returns false once the worker stopped.
    pub fn post(&self, job: impl FnOnce(&mut Worker) + Send + 'static) -> bool {
        self.jobs.send(Box::new(job)).is_ok()
    }

    /// Queues `job` after `delay`.
    pub fn post_after(&self, delay: Duration, job: impl FnOnce(&mut Worker) + Send + 'static) {
        let jobs = self.jobs.clone();
        let job: Job = Box::new(job);
        self.post(move |_| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = jobs.send(job);
            });
        });
    }
}

/// State owned by the worker thread.
pub(crate) struct Worker {
    drivers: HashMap<u64, SessionDriver>,
    stopped: bool,
}

impl Worker {
    pub fn start_driver(&mut self, driver: SessionDriver) {
        let id = driver.id();
        self.drivers.insert(id, driver);
        self.with_driver(id, SessionDriver::start);
    }

    pub fn with_driver(&mut self, id: u64, f: impl FnOnce(&mut SessionDriver)) {
        match self.drivers.get_mut(&id) {
            Some(driver) => f(driver),
            None => tracing::trace!(target: "realm.sync.client", session = id, "job for a removed session"),
        }
    }

    pub fn remove_driver(&mut self, id: u64) {
        if let Some(mut driver) = self.drivers.remove(&id) {
            driver.shutdown();
        }
    }

    fn shutdown(&mut self) {
        for (_, mut driver) in self.drivers.drain() {
            driver.shutdown();
        }
    }
}

/// The worker thread.
pub(crate) struct SyncClient {
    handle: ClientHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl SyncClient {
    pub fn start() -> SyncResult<Self> {
        let (jobs, mut receiver) = mpsc::unbounded_channel::<Job>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SyncError::Io)?;
        let thread = std::thread::Builder::new()
            .name("realmdb-sync-client".into())
            .spawn(move || {
                let mut worker = Worker {
                    drivers: HashMap::new(),
                    stopped: false,
                };
                runtime.block_on(async {
                    while let Some(job) = receiver.recv().await {
                        job(&mut worker);
                        if worker.stopped {
                            break;
                        }
                    }
                });
                worker.shutdown();
                tracing::debug!(target: "realm.sync.client", "sync client stopped");
            })?;
        tracing::debug!(target: "realm.sync.client", "sync client started");
        Ok(Self {
            handle: ClientHandle { jobs },
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn is_worker_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Stops the worker and waits for it, unless called from the worker
    /// itself.
    pub fn stop(&self) {
        self.handle.post(|worker| worker.stopped = true);
        if self.is_worker_thread() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!(target: "realm.sync.client", "sync client thread panicked");
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_core::ManualScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn jobs_run_in_order_on_the_worker() {
        let client = SyncClient::start().unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            client.handle().post(move |_| {
                let _ = tx.send((i, std::thread::current().name().map(str::to_owned)));
            });
        }
        for i in 0..3 {
            let (n, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(n, i);
            assert_eq!(name.as_deref(), Some("realmdb-sync-client"));
        }
    }

    #[test]
    fn delayed_jobs_fire() {
        let client = SyncClient::start().unwrap();
        let (tx, rx) = std_mpsc::channel();
        client.handle().post_after(Duration::from_millis(20), move |_| {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn stopped_clients_refuse_jobs() {
        let client = SyncClient::start().unwrap();
        let handle = client.handle().clone();
        client.stop();
        assert!(!handle.post(|_| {}));
    }

    #[test]
    fn delivery_goes_through_the_scheduler() {
        let scheduler = Arc::new(ManualScheduler::new());
        let as_dyn: Arc<dyn Scheduler> = scheduler.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        deliver(Some(&as_dyn), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
        scheduler.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&count);
        deliver(None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
