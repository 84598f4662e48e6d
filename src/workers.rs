use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DRAIN_POLL_MS: u64 = 5;

#[derive(Clone)]
pub enum WorkerMode {
    /// Run the job on the caller's thread.
    Inline,
    /// Run the job on the runtime's blocking pool.
    Runtime(tokio::runtime::Handle),
}

/// Handed to a job so it can notice a global cancel.
#[derive(Clone)]
pub struct WorkerToken {
    cancelled: Arc<AtomicBool>,
}

impl WorkerToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tracks short-lived collaborator round-trips.
pub struct WorkerPool {
    mode: WorkerMode,
    active: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
    spawned: AtomicU64,
}

impl WorkerPool {
    pub fn new(mode: WorkerMode) -> Self {
        Self {
            mode,
            active: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            spawned: AtomicU64::new(0),
        }
    }

    pub fn inline() -> Self {
        Self::new(WorkerMode::Inline)
    }

    /// Start a job. Returns false once the pool is cancelled.
    ///
    /// Inline jobs run before this returns, so callers must not hold any
    /// engine lock.
    pub fn spawn<F>(&self, name: &str, job: F) -> bool
    where
        F: FnOnce(&WorkerToken) + Send + 'static,
    {
        if self.cancelled.load(Ordering::SeqCst) {
            debug!("Refusing worker '{}': pool cancelled", name);
            return false;
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let token = WorkerToken {
            cancelled: Arc::clone(&self.cancelled),
        };
        debug!("Starting worker '{}'", name);
        match &self.mode {
            WorkerMode::Inline => {
                let _guard = guard;
                job(&token);
            }
            WorkerMode::Runtime(handle) => {
                handle.spawn_blocking(move || {
                    let _guard = guard;
                    job(&token);
                });
            }
        }
        true
    }

    /// Flag every job cancelled and wait up to `wait_ms` for them to finish.
    pub fn cancel_all(&self, wait_ms: u64) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("{} worker(s) still running after {}ms", self.active_count(), wait_ms);
                return false;
            }
            std::thread::sleep(Duration::from_millis(DRAIN_POLL_MS));
        }
    }

    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn spawned_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}
