//! Worker-thread scheduler for off-path store maintenance.
//!
//! A fixed pool of threads pulls tasks from a FIFO queue. The store uses
//! it for the TOC rebuild scan that runs after opening a file without a
//! usable persisted TOC.

use parking_lot::{Condvar, Mutex};
use rackdb_core::{Completion, Error, Result, Scheduler, Task};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Default bound on queued tasks
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks running on a worker.
    pub running: usize,
    /// Tasks finished since start, panicked ones included.
    pub finished: u64,
    /// Worker threads.
    pub workers: usize,
}

type Job = Box<dyn FnOnce() + Send>;

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    job_ready: Condvar,
    stopping: AtomicBool,
    running: AtomicUsize,
    finished: AtomicU64,
    max_queued: usize,
}

/// Fixed pool of worker threads; tasks start in submission order.
pub struct BackgroundScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl BackgroundScheduler {
    /// Start `threads` workers (at least one) named `rackdb-bg-N`.
    ///
    /// # Errors
    ///
    /// `Io` if a worker thread cannot be spawned.
    pub fn new(threads: usize, max_queued: usize) -> Result<Self> {
        let threads = threads.max(1);
        let scheduler = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                job_ready: Condvar::new(),
                stopping: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                finished: AtomicU64::new(0),
                max_queued,
            }),
            workers: Mutex::new(Vec::with_capacity(threads)),
            worker_count: threads,
        };
        for i in 0..threads {
            let shared = Arc::clone(&scheduler.shared);
            let handle = std::thread::Builder::new()
                .name(format!("rackdb-bg-{}", i))
                .spawn(move || worker_loop(&shared))?;
            scheduler.workers.lock().push(handle);
        }
        debug!(threads, "started background scheduler");
        Ok(scheduler)
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            if self.shared.stopping.load(Ordering::Acquire) {
                return Err(Error::Background("scheduler is shut down".to_string()));
            }
            if queue.len() >= self.shared.max_queued {
                return Err(Error::Background("scheduler queue is full".to_string()));
            }
            queue.push_back(job);
        }
        self.shared.job_ready.notify_one();
        Ok(())
    }

    /// Stop accepting tasks, let workers finish the queue, join them.
    pub fn shutdown(&self) {
        {
            // Held so a worker between its stop check and wait() cannot miss this.
            let _queue = self.shared.queue.lock();
            self.shared.stopping.store(true, Ordering::Release);
            self.shared.job_ready.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Snapshot of the scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.shared.queue.lock().len(),
            running: self.shared.running.load(Ordering::Relaxed),
            finished: self.shared.finished.load(Ordering::Relaxed),
            workers: self.worker_count,
        }
    }
}

impl Scheduler for BackgroundScheduler {
    fn schedule(&self, task: Task) -> Completion {
        let (completion, completer) = Completion::pending();
        // A rejected job is dropped with its completer, failing the completion.
        match self.enqueue(Box::new(move || completer.complete(task()))) {
            Ok(()) => completion,
            Err(e) => Completion::failed(e.to_string()),
        }
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps the counters honest even when a task panics.
struct RunningJob<'a> {
    shared: &'a Shared,
}

impl Drop for RunningJob<'_> {
    fn drop(&mut self) {
        self.shared.running.fetch_sub(1, Ordering::Release);
        self.shared.finished.fetch_add(1, Ordering::Release);
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    shared.running.fetch_add(1, Ordering::Release);
                    break job;
                }
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                shared.job_ready.wait(&mut queue);
            }
        };

        let _running = RunningJob { shared };
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            error!(
                "background task panicked: {}",
                panic.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    /// Occupy the only worker until the returned barrier is released.
    fn block_worker(scheduler: &BackgroundScheduler) -> (Arc<Barrier>, Completion) {
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        let blocked = scheduler.schedule(Box::new(move || {
            b.wait();
            Ok(())
        }));
        while scheduler.stats().running == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        (barrier, blocked)
    }

    #[test]
    fn test_schedule_reports_success_and_failure() {
        let scheduler = BackgroundScheduler::new(2, 16).unwrap();
        let ok = scheduler.schedule(Box::new(|| Ok(())));
        let failed = scheduler.schedule(Box::new(|| Err(Error::corruption(8, "bad marker"))));

        assert!(ok.wait().is_ok());
        assert!(matches!(failed.wait(), Err(Error::Background(msg)) if msg.contains("bad marker")));
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let scheduler = BackgroundScheduler::new(1, 16).unwrap();
        let (barrier, blocked) = block_worker(&scheduler);

        let order = Arc::new(Mutex::new(Vec::new()));
        let completions: Vec<Completion> = ["first", "second", "third"]
            .into_iter()
            .map(|label| {
                let order = Arc::clone(&order);
                scheduler.schedule(Box::new(move || {
                    order.lock().push(label);
                    Ok(())
                }))
            })
            .collect();
        assert_eq!(scheduler.stats().queued, 3);

        barrier.wait();
        assert!(blocked.wait().is_ok());
        for completion in completions {
            assert!(completion.wait().is_ok());
        }
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_full_queue_fails_completion() {
        let scheduler = BackgroundScheduler::new(1, 1).unwrap();
        let (barrier, _blocked) = block_worker(&scheduler);

        let queued = scheduler.schedule(Box::new(|| Ok(())));
        let rejected = scheduler.schedule(Box::new(|| Ok(())));
        assert!(rejected.is_complete());
        assert!(rejected.wait().is_err());

        barrier.wait();
        assert!(queued.wait().is_ok());
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let scheduler = BackgroundScheduler::new(1, 16).unwrap();
        let panicked = scheduler.schedule(Box::new(|| panic!("boom")));
        // The completer unwinds with the task and fails the completion.
        assert!(panicked.wait().is_err());

        let after = scheduler.schedule(Box::new(|| Ok(())));
        assert!(after.wait().is_ok());
        scheduler.shutdown();
        assert_eq!(scheduler.stats().finished, 2);
    }

    #[test]
    fn test_schedule_after_shutdown_is_rejected() {
        let scheduler = BackgroundScheduler::new(1, 16).unwrap();
        scheduler.shutdown();
        assert!(scheduler.schedule(Box::new(|| Ok(()))).wait().is_err());
        assert_eq!(scheduler.stats().workers, 1);
    }
}
