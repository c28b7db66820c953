//! Bounded worker pool: one OS thread per worker, each owning its own
//! current-thread runtime. A connection is assigned once and never
//! migrates; assignment prefers the least-loaded worker and reuses idle
//! workers (least-recently-assigned wins ties) instead of spreading load
//! onto cold ones.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

const DRAIN_GRACE: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Decrements the owning worker's active-connection count when the
/// connection finishes. Move it into the connection task.
pub struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Worker {
    sender: mpsc::UnboundedSender<Job>,
    active: Arc<AtomicUsize>,
    last_assigned: AtomicU64,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// The pool. Dropping it closes all job channels and joins the workers
/// after a bounded drain period.
pub struct SoapThreadPool {
    workers: Vec<Worker>,
    assign_seq: AtomicU64,
}

impl SoapThreadPool {
    pub fn new(max_threads: usize) -> Self {
        let workers = (0..max_threads.max(1))
            .map(|index| {
                let (sender, receiver) = mpsc::unbounded_channel::<Job>();
                let active = Arc::new(AtomicUsize::new(0));
                let worker_active = active.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("soap-worker-{index}"))
                    .spawn(move || worker_main(receiver, worker_active))
                    .ok();
                if handle.is_none() {
                    error!("failed to spawn pool worker {index}");
                }
                Worker {
                    sender,
                    active,
                    last_assigned: AtomicU64::new(0),
                    handle,
                }
            })
            .collect();
        SoapThreadPool {
            workers,
            assign_seq: AtomicU64::new(1),
        }
    }

    pub fn max_thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Assign a job to the best worker: fewest active connections first,
    /// least-recently-assigned on ties. The job receives the guard that
    /// keeps the load accounting correct and runs inside the worker's
    /// runtime, where it may `tokio::spawn`.
    pub(crate) fn dispatch<F>(&self, job: F)
    where
        F: FnOnce(ActiveGuard) + Send + 'static,
    {
        let Some(worker) = self.workers.iter().min_by_key(|w| {
            (
                w.active.load(Ordering::SeqCst),
                w.last_assigned.load(Ordering::SeqCst),
            )
        }) else {
            return;
        };

        worker.active.fetch_add(1, Ordering::SeqCst);
        worker.last_assigned.store(
            self.assign_seq.fetch_add(1, Ordering::SeqCst),
            Ordering::SeqCst,
        );
        let guard = ActiveGuard {
            active: worker.active.clone(),
        };
        let boxed: Job = Box::new(move || job(guard));
        if worker.sender.send(boxed).is_err() {
            // Worker gone; dropping the closure drops the guard and
            // restores the count.
            error!("thread pool worker unavailable, connection dropped");
        }
    }
}

impl Drop for SoapThreadPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // Closing the channel lets the worker drain and exit.
            let (closed, _) = mpsc::unbounded_channel::<Job>();
            worker.sender = closed;
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("pool worker panicked during shutdown");
                }
            }
        }
    }
}

fn worker_main(mut receiver: mpsc::UnboundedReceiver<Job>, active: Arc<AtomicUsize>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to build worker runtime: {e}");
            return;
        }
    };

    runtime.block_on(async {
        while let Some(job) = receiver.recv().await {
            // The job spawns its connection task onto this runtime.
            job();
        }

        // Channel closed: give in-flight connections a bounded drain.
        let start = std::time::Instant::now();
        while active.load(Ordering::SeqCst) > 0 && start.elapsed() < DRAIN_GRACE {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        debug!("pool worker exiting");
    });
}
