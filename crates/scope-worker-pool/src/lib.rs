//! Worker Pool (C5): a fixed number of worker threads draining a FIFO job
//! queue, with a result registry keyed by opaque task id so callers can
//! `submit` from one thread and `await_result` from another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use scope_core::error::WorkerError;
use tracing::{debug, warn};

pub type TaskId = u64;

struct Job<T> {
    func: Box<dyn FnOnce() -> Result<T, String> + Send>,
    result_tx: Sender<Result<T, String>>,
}

/// A fixed-size executor. `T` is the result type every task submitted to
/// one pool instance produces (the Triangulator uses one pool of
/// `PointCloud`-stripe tasks).
pub struct WorkerPool<T: Send + 'static> {
    job_tx: Mutex<Option<Sender<Job<T>>>>,
    discard_rx: Receiver<Job<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    results: Mutex<HashMap<TaskId, Receiver<Result<T, String>>>>,
    closed: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `worker_count` threads (minimum 1) draining a shared queue.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (job_tx, job_rx) = unbounded::<Job<T>>();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let job_rx = job_rx.clone();
            let pending = pending.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("scope-worker-{idx}"))
                    .spawn(move || {
                        for job in job_rx.iter() {
                            pending.fetch_sub(1, Ordering::SeqCst);
                            let result = (job.func)();
                            let _ = job.result_tx.send(result);
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }

        Self {
            job_tx: Mutex::new(Some(job_tx)),
            discard_rx: job_rx,
            workers: Mutex::new(workers),
            next_id: AtomicU64::new(0),
            results: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            pending,
        }
    }

    /// Default worker count: hardware parallelism minus one, floor 1.
    pub fn default_worker_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1)
    }

    /// Enqueues `task`. Fails with `Shutdown` if the pool is closed.
    pub fn submit<F>(&self, task: F) -> Result<TaskId, WorkerError>
    where
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::Shutdown);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (result_tx, result_rx) = bounded(1);
        self.results.lock().unwrap().insert(id, result_rx);

        let tx_guard = self.job_tx.lock().unwrap();
        let tx = tx_guard.as_ref().ok_or(WorkerError::Shutdown)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        tx.send(Job {
            func: Box::new(task),
            result_tx,
        })
        .map_err(|_| WorkerError::Shutdown)?;

        Ok(id)
    }

    /// Blocks until `task_id` completes, propagating the task's own error
    /// or returning `Timeout`.
    pub fn await_result(&self, task_id: TaskId, timeout: Duration) -> Result<T, WorkerError> {
        let rx = {
            let mut results = self.results.lock().unwrap();
            results.remove(&task_id)
        }
        .ok_or_else(|| WorkerError::TaskFailed(format!("unknown task id {task_id}")))?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(WorkerError::TaskFailed(message)),
            Err(_) => Err(WorkerError::Timeout),
        }
    }

    /// Number of tasks queued but not yet picked up by a worker. Used by
    /// the orchestrator's backpressure check (`len > 4*W` pauses new
    /// submissions until it drains below `2*W`).
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops accepting work. If `drain`, workers finish processing
    /// whatever is already queued; otherwise queued-but-unstarted jobs are
    /// discarded and their `await_result` callers see `TaskFailed`.
    pub fn shutdown(&self, drain: bool) {
        self.closed.store(true, Ordering::SeqCst);

        if !drain {
            let mut discarded = 0;
            while let Ok(job) = self.discard_rx.try_recv() {
                let _ = job
                    .result_tx
                    .send(Err("worker pool shut down before task ran".to_string()));
                discarded += 1;
            }
            if discarded > 0 {
                warn!(discarded, "discarded queued tasks on non-draining shutdown");
            }
        }

        // Dropping the sender closes the channel once existing clones in
        // worker threads finish iterating the remaining queue.
        self.job_tx.lock().unwrap().take();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        debug!("worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_and_await_roundtrips_a_result() {
        let pool: WorkerPool<i32> = WorkerPool::new(2);
        let id = pool.submit(|| Ok(42)).unwrap();
        let value = pool.await_result(id, Duration::from_secs(1)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn task_failure_is_propagated_not_fatal_to_the_pool() {
        let pool: WorkerPool<i32> = WorkerPool::new(1);
        let failing = pool.submit(|| Err("boom".to_string())).unwrap();
        let err = pool.await_result(failing, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, WorkerError::TaskFailed(_)));

        let ok = pool.submit(|| Ok(7)).unwrap();
        assert_eq!(pool.await_result(ok, Duration::from_secs(1)).unwrap(), 7);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool: WorkerPool<i32> = WorkerPool::new(1);
        pool.shutdown(true);
        let err = pool.submit(|| Ok(1)).unwrap_err();
        assert!(matches!(err, WorkerError::Shutdown));
    }

    #[test]
    fn draining_shutdown_still_completes_queued_work() {
        let pool: WorkerPool<i32> = WorkerPool::new(1);
        let id = pool.submit(|| Ok(99)).unwrap();
        pool.shutdown(true);
        // Worker threads are joined by shutdown(), so the result is
        // already available without blocking.
        let value = pool.await_result(id, Duration::from_millis(50)).unwrap();
        assert_eq!(value, 99);
    }
}
