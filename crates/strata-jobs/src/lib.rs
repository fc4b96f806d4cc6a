//! Background worker pool for short per-frame jobs.
//!
//! Jobs are boxed closures delivered to named worker threads over a bounded
//! channel. Every [`JobPool::spawn`] returns a [`JobHandle`] whose result is
//! collected by an explicit wait at the start of the next frame, which gives
//! the compute-then-upload pipeline its barrier.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors raised while building a pool.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The OS refused to create a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A fixed set of worker threads fed from a bounded queue.
pub struct JobPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicU64>,
}

impl JobPool {
    /// Create a pool with `thread_count` workers and a queue of `queue_capacity`
    /// jobs. A pool with zero threads runs every job on the caller.
    pub fn new(thread_count: usize, queue_capacity: usize) -> Result<Self, JobError> {
        let in_flight = Arc::new(AtomicU64::new(0));
        if thread_count == 0 {
            return Ok(Self {
                sender: None,
                workers: Vec::new(),
                in_flight,
            });
        }

        let (sender, receiver) = bounded::<Job>(queue_capacity.max(1));
        let mut workers = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let handle = std::thread::Builder::new()
                .name(format!("strata-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                    }
                })
                .map_err(JobError::Spawn)?;
            workers.push(handle);
        }
        debug!(threads = thread_count, queue_capacity, "job pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
            in_flight,
        })
    }

    /// Create a pool sized from the available cores, leaving headroom for the
    /// main and render threads.
    pub fn with_defaults() -> Result<Self, JobError> {
        let cpus = num_cpus::get().max(2);
        Self::new((cpus - 2).max(1), 64)
    }

    /// A pool without threads; every job executes inside `spawn`.
    pub fn inline() -> Self {
        Self {
            sender: None,
            workers: Vec::new(),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Jobs queued or executing on workers.
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run `job` in the background and return a handle to its result.
    ///
    /// When the queue is full (or the pool has no threads) the job runs on the
    /// calling thread before `spawn` returns.
    pub fn spawn<T, F>(&self, job: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_sender, result_receiver) = bounded::<T>(1);
        let wrapped: Job = Box::new(move || {
            let _ = result_sender.send(job());
        });

        match &self.sender {
            Some(sender) => {
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                match sender.try_send(wrapped) {
                    Ok(()) => {}
                    Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                        self.in_flight.fetch_sub(1, Ordering::Relaxed);
                        trace!("job queue full, running inline");
                        job();
                    }
                }
            }
            None => wrapped(),
        }

        JobHandle {
            receiver: result_receiver,
            result: None,
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool")
            .field("threads", &self.workers.len())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

/// The pending result of a spawned job.
#[derive(Debug)]
pub struct JobHandle<T> {
    receiver: Receiver<T>,
    result: Option<T>,
}

impl<T> JobHandle<T> {
    /// Returns `true` once the result is available without blocking.
    pub fn is_finished(&mut self) -> bool {
        self.poll();
        self.result.is_some()
    }

    /// Take the result if the job has finished.
    pub fn try_take(&mut self) -> Option<T> {
        self.poll();
        self.result.take()
    }

    /// Block until the job finishes. Returns `None` if the job panicked.
    pub fn wait(mut self) -> Option<T> {
        if let Some(result) = self.result.take() {
            return Some(result);
        }
        self.receiver.recv().ok()
    }

    fn poll(&mut self) {
        if self.result.is_none() {
            match self.receiver.try_recv() {
                Ok(value) => self.result = Some(value),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_inline_pool_runs_immediately() {
        let pool = JobPool::inline();
        let mut handle = pool.spawn(|| 21 * 2);
        assert!(handle.is_finished());
        assert_eq!(handle.wait(), Some(42));
    }

    #[test]
    fn test_zero_threads_is_inline() {
        let pool = JobPool::new(0, 8).unwrap();
        assert_eq!(pool.thread_count(), 0);
        assert_eq!(pool.spawn(|| "done").wait(), Some("done"));
    }

    #[test]
    fn test_threaded_jobs_complete() {
        let pool = JobPool::new(3, 16).unwrap();
        let handles: Vec<_> = (0..32u64).map(|i| pool.spawn(move || i * i)).collect();
        let results: Vec<u64> = handles.into_iter().filter_map(JobHandle::wait).collect();
        assert_eq!(results.len(), 32);
        assert_eq!(results[5], 25);
    }

    /// A job that runs on a worker thread sees the worker's name.
    #[test]
    fn test_workers_are_named() {
        let pool = JobPool::new(1, 4).unwrap();
        let name = pool
            .spawn(|| std::thread::current().name().map(str::to_owned))
            .wait()
            .flatten();
        assert_eq!(name.as_deref(), Some("strata-worker-0"));
    }

    #[test]
    fn test_full_queue_falls_back_to_inline() {
        let pool = JobPool::new(1, 1).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        // The blocker holds the only worker (or the only queue slot), so some
        // of the following jobs cannot be queued.
        let blocker = pool.spawn(move || {
            let _ = gate_rx.recv();
        });
        let handles: Vec<_> = (0..4).map(|i| pool.spawn(move || i)).collect();
        gate_tx.send(()).unwrap();
        assert_eq!(blocker.wait(), Some(()));
        let sum: i32 = handles.into_iter().filter_map(JobHandle::wait).sum();
        assert_eq!(sum, 6);
    }

    #[test]
    fn test_in_flight_drains() {
        let pool = JobPool::new(2, 16).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| pool.spawn(|| std::thread::sleep(Duration::from_millis(2))))
            .collect();
        for handle in handles {
            handle.wait();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.in_flight_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.in_flight_count(), 0);
    }
}
