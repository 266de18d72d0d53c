//! Shared worker-thread pool for background decode tasks
//!
//! Uses work-stealing deques for priority-based execution:
//! - New tasks pushed to the global injector (effectively high priority)
//! - Workers steal old tasks from each other when idle
//! - Zero lock contention between workers
//!
//! Epoch mechanism allows cancelling stale decode requests wholesale during
//! fast scrubbing or session teardown: a job stamped with an old epoch is
//! skipped when a worker finally picks it up.

use crossbeam::deque::{Injector, Worker};
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared decode worker pool with work stealing.
///
/// One pool serves every loader session; decode jobs block on I/O here and
/// nowhere else.
pub struct Workers {
    injector: Arc<Injector<Job>>, // Global queue for external tasks
    handles: Vec<thread::JoinHandle<()>>, // Thread handles for proper shutdown
    current_epoch: Arc<AtomicU64>, // Epoch counter (shared with CacheManager)
    shutdown: Arc<AtomicBool>,    // Shutdown signal
}

impl Workers {
    /// Create worker pool with work-stealing deques and shared epoch counter.
    ///
    /// Recommended width: `num_cpus::get() * 3 / 4` (leave headroom for the
    /// playback thread).
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers_local: Vec<Worker<Job>> = Vec::new();
        let mut stealers = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            workers_local.push(worker);
        }

        for (worker_id, worker) in workers_local.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("plate-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);

                    loop {
                        // 1. Own queue first (cache locality)
                        if let Some(job) = worker.pop() {
                            job();
                            continue;
                        }

                        // 2. Global injector
                        if let Some(job) = injector.steal().success() {
                            job();
                            continue;
                        }

                        // 3. Steal from other workers (oldest tasks first)
                        let mut found_work = false;
                        for stealer in &stealers {
                            if let Some(job) = stealer.steal().success() {
                                job();
                                found_work = true;
                                break;
                            }
                        }

                        if found_work {
                            continue;
                        }

                        // 4. Shutdown check
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        // 5. No work - short sleep to avoid CPU spin
                        thread::sleep(std::time::Duration::from_millis(1));
                    }

                    trace!("Worker {} stopped", worker_id);
                })
                .expect("Failed to spawn worker thread");

            handles.push(handle);
        }

        trace!("Workers initialized: {} threads (work-stealing)", num_threads);

        Self {
            injector,
            handles,
            current_epoch: epoch,
            shutdown,
        }
    }

    /// Pool with the recommended width for this machine
    pub fn with_default_threads(epoch: Arc<AtomicU64>) -> Self {
        let n = (num_cpus::get() * 3 / 4).max(1);
        Self::new(n, epoch)
    }

    /// Execute closure on a worker thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }

    /// Get current epoch
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Execute closure with epoch check (for cancellable decode requests).
    ///
    /// The check happens at execution time, not enqueue time, so a session
    /// teardown that bumps the epoch silently drops every job still queued.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);

        let wrapped = move || {
            if current_epoch.load(Ordering::Relaxed) == epoch {
                f();
            }
            // Otherwise silently skip: the request is stale
        };

        self.injector.push(Box::new(wrapped));
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        use std::time::{Duration, Instant};

        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Wait with timeout. Epoch bumps mean pending epoch-checked jobs are
        // skipped, so threads should drain quickly; the timeout is a safety net.
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} workers stopped gracefully", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let epoch = Arc::new(AtomicU64::new(0));
        let workers = Workers::new(2, Arc::clone(&epoch));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            workers.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::Relaxed) < 16 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_stale_epoch_skipped() {
        let epoch = Arc::new(AtomicU64::new(0));
        let workers = Workers::new(1, Arc::clone(&epoch));
        let counter = Arc::new(AtomicUsize::new(0));

        // Bump the epoch before the job gets a chance to run on a busy pool
        epoch.store(5, Ordering::Relaxed);
        {
            let counter = Arc::clone(&counter);
            workers.execute_with_epoch(0, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        {
            let counter = Arc::clone(&counter);
            workers.execute_with_epoch(5, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::Relaxed) < 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
