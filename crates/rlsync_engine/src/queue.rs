//! Single-threaded serial work queues.
//!
//! Each session owns two of these: one that runs every delegate callback and
//! one that runs store operations. Jobs on one queue never overlap and run in
//! submission order.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named worker thread fed by a channel.
pub struct SerialQueue {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    discard: Arc<AtomicBool>,
}

impl SerialQueue {
    /// Starts a queue with its own thread.
    pub fn new(name: impl Into<String>) -> SyncResult<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let discard = Arc::new(AtomicBool::new(false));
        let worker_discard = Arc::clone(&discard);
        let thread_name = name.clone();

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    if worker_discard.load(Ordering::SeqCst) {
                        continue;
                    }
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(queue = %thread_name, "queued job panicked");
                    }
                }
            })
            .map_err(|e| SyncError::Executor(format!("failed to start {}: {}", name, e)))?;

        Ok(Self {
            worker_id: worker.thread().id(),
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            discard,
        })
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a job. Returns false if the queue has shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Enqueues a job and blocks until it has run.
    ///
    /// Returns `None` if the queue shut down before the job ran. Called from
    /// the queue's own thread, the job runs inline.
    pub fn submit_and_wait<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Some(job());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        if !self.submit(move || {
            let _ = tx.send(job());
        }) {
            return None;
        }
        rx.recv().ok()
    }

    /// Returns true when called from the queue's worker thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Returns true once the queue no longer accepts jobs.
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stops accepting jobs, runs everything already queued, then joins.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if self.is_current() {
                return;
            }
            if worker.join().is_err() {
                error!(queue = %self.name, "worker thread panicked");
            }
            debug!(queue = %self.name, "queue drained");
        }
    }

    /// Stops accepting jobs and drops everything not yet started.
    pub fn shutdown_now(&self) {
        self.discard.store(true, Ordering::SeqCst);
        self.shutdown();
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_order() {
        let queue = SerialQueue::new("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            assert!(queue.submit(move || seen.lock().push(i)));
        }
        queue.shutdown();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn submit_and_wait_returns_value() {
        let queue = SerialQueue::new("test-wait").unwrap();
        assert_eq!(queue.submit_and_wait(|| 41 + 1), Some(42));
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let queue = SerialQueue::new("test-closed").unwrap();
        queue.shutdown();
        assert!(queue.is_shut_down());
        assert!(!queue.submit(|| {}));
        assert_eq!(queue.submit_and_wait(|| 1), None);
    }

    #[test]
    fn shutdown_now_drops_queued_jobs() {
        let queue = SerialQueue::new("test-drop").unwrap();
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();
        let ran = Arc::new(AtomicBool::new(false));

        queue.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        let ran_flag = Arc::clone(&ran);
        queue.submit(move || ran_flag.store(true, Ordering::SeqCst));

        started_rx.recv().unwrap();
        queue.discard.store(true, Ordering::SeqCst);
        release_tx.send(()).unwrap();
        queue.shutdown_now();

        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_job_does_not_kill_queue() {
        let queue = SerialQueue::new("test-panic").unwrap();
        queue.submit(|| panic!("boom"));
        assert_eq!(queue.submit_and_wait(|| "alive"), Some("alive"));
    }

    #[test]
    fn wait_from_worker_runs_inline() {
        let queue = Arc::new(SerialQueue::new("test-inline").unwrap());
        let inner = Arc::clone(&queue);
        let result = queue.submit_and_wait(move || inner.submit_and_wait(|| 7));
        assert_eq!(result, Some(Some(7)));
    }
}
