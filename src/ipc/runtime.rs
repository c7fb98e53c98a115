//! Process-wide worker pool for inbound call dispatch.
//!
//! One pool serves every registered service. Acceptor threads push jobs
//! (one per peer connection) into a shared queue; workers are spawned
//! lazily, up to the configured cap, only when a job arrives and no worker
//! is idle. Configuration calls are idempotent so bootstrap can apply them
//! unconditionally.
//!
//! Pool threads never touch the main-thread event loop. A handler that
//! needs main-thread execution posts through its `LooperHandle` and
//! returns.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::ipc::sys;
use crate::trace::{debug, warn};

/// Pool cap applied when the caller never configures one.
const DEFAULT_POOL_MAX: usize = 4;

/// Pool name applied when the caller never assigns one.
const DEFAULT_POOL_NAME: &str = "ipc-worker";

type Job = Box<dyn FnOnce() + Send + 'static>;

static GLOBAL: OnceLock<Arc<IpcRuntime>> = OnceLock::new();

/// State worker threads keep alive after the runtime handle is gone.
struct PoolShared {
    jobs_rx: Receiver<Job>,
    background_disabled: AtomicBool,
    live_workers: AtomicUsize,
    idle_workers: AtomicUsize,
}

impl PoolShared {
    /// Body of every worker thread: demote if allowed, then drain jobs
    /// until the runtime (and its sender) is gone.
    fn worker_loop(&self) {
        if !self.background_disabled.load(Ordering::Relaxed)
            && let Err(e) = sys::demote_to_background()
        {
            debug!(error = %e, "could not demote worker to background class");
        }

        loop {
            self.idle_workers.fetch_add(1, Ordering::AcqRel);
            let job = self.jobs_rx.recv();
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);
            match job {
                Ok(job) => job(),
                Err(_) => break,
            }
        }
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The cross-process call runtime: a dispatch queue plus a lazily grown
/// worker pool.
///
/// Production code uses the process-wide [`IpcRuntime::global`] singleton;
/// tests construct private instances so pools do not bleed between cases.
pub struct IpcRuntime {
    jobs_tx: Sender<Job>,
    shared: Arc<PoolShared>,
    pool_max: AtomicUsize,
    started: AtomicBool,
    pool_name: Mutex<String>,
    next_worker_id: AtomicUsize,
}

impl Default for IpcRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcRuntime {
    /// Creates an unstarted runtime with default settings.
    #[must_use]
    pub fn new() -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        Self {
            jobs_tx,
            shared: Arc::new(PoolShared {
                jobs_rx,
                background_disabled: AtomicBool::new(false),
                live_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
            }),
            pool_max: AtomicUsize::new(DEFAULT_POOL_MAX),
            started: AtomicBool::new(false),
            pool_name: Mutex::new(DEFAULT_POOL_NAME.to_owned()),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    /// The process-wide runtime every production component shares.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Caps the number of worker threads. Idempotent; lowering the cap
    /// never reaps already-spawned workers.
    pub fn set_thread_pool_max(&self, max: usize) {
        self.pool_max.store(max, Ordering::Relaxed);
    }

    /// Marks the pool as accepting dispatch. Idempotent. Workers spawn
    /// lazily on dispatch pressure, never here.
    pub fn start_thread_pool(&self) {
        if !self.started.swap(true, Ordering::Relaxed) {
            debug!(
                max = self.pool_max.load(Ordering::Relaxed),
                "thread pool started"
            );
        }
    }

    /// Assigns the diagnostic name worker threads are spawned under.
    /// Idempotent; already-spawned workers keep their old name.
    pub fn give_thread_pool_name(&self, name: &str) {
        let mut current = self.pool_name.lock().unwrap_or_else(PoisonError::into_inner);
        *current = name.to_owned();
    }

    /// Stops new workers from demoting themselves to the background
    /// niceness class; they then run at the spawner-inherited priority.
    /// Idempotent.
    pub fn disable_background_scheduling(&self) {
        self.shared
            .background_disabled
            .store(true, Ordering::Relaxed);
    }

    /// True once [`IpcRuntime::start_thread_pool`] has run.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Configured worker cap.
    #[must_use]
    pub fn thread_pool_max(&self) -> usize {
        self.pool_max.load(Ordering::Relaxed)
    }

    /// True once background scheduling has been disabled.
    #[must_use]
    pub fn background_scheduling_disabled(&self) -> bool {
        self.shared.background_disabled.load(Ordering::Relaxed)
    }

    /// Workers currently alive.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Relaxed)
    }

    /// Queues one job for the pool, growing it if every worker is busy
    /// and the cap allows.
    ///
    /// Callable only after [`IpcRuntime::start_thread_pool`]; dispatching
    /// against an unstarted pool drops the job with a warning, matching
    /// the contract that bootstrap starts the pool before the first
    /// inbound call is accepted.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if !self.is_started() {
            warn!("dispatch against an unstarted pool; job dropped");
            return;
        }
        // Unbounded channel: send cannot fail while `self` holds the
        // receiver through `shared`.
        let _ = self.jobs_tx.send(Box::new(job));
        self.maybe_spawn_worker();
    }

    fn maybe_spawn_worker(&self) {
        if self.shared.idle_workers.load(Ordering::Acquire) > 0 {
            return;
        }
        // Reserve a slot before spawning so concurrent dispatchers cannot
        // overshoot the cap.
        let mut live = self.shared.live_workers.load(Ordering::Relaxed);
        loop {
            if live >= self.pool_max.load(Ordering::Relaxed) {
                return;
            }
            match self.shared.live_workers.compare_exchange(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => live = observed,
            }
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}-{id}",
            self.pool_name.lock().unwrap_or_else(PoisonError::into_inner)
        );
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || shared.worker_loop());
        if let Err(e) = spawned {
            self.shared.live_workers.fetch_sub(1, Ordering::AcqRel);
            warn!(worker = %name, error = %e, "failed to spawn pool worker");
        } else {
            debug!(worker = %name, "pool worker spawned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    fn started_runtime(max: usize) -> IpcRuntime {
        let runtime = IpcRuntime::new();
        runtime.set_thread_pool_max(max);
        runtime.give_thread_pool_name("test-pool");
        runtime.disable_background_scheduling();
        runtime.start_thread_pool();
        runtime
    }

    #[test]
    fn configuration_calls_are_idempotent() {
        let runtime = IpcRuntime::new();
        for _ in 0..3 {
            runtime.set_thread_pool_max(9);
            runtime.start_thread_pool();
            runtime.give_thread_pool_name("statsd-ipc");
            runtime.disable_background_scheduling();
        }
        assert_eq!(runtime.thread_pool_max(), 9);
        assert!(runtime.is_started());
        assert!(runtime.background_scheduling_disabled());
    }

    #[test]
    fn dispatch_runs_the_job_on_another_thread() {
        let runtime = started_runtime(2);
        let (done_tx, done_rx) = bounded(1);
        let caller = thread::current().id();
        runtime.dispatch(move || {
            done_tx.send(thread::current().id() != caller).unwrap();
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn pool_never_exceeds_its_cap() {
        let cap = 3;
        let runtime = started_runtime(cap);

        // Saturate: every job blocks until released, forcing maximal spawn.
        let (release_tx, release_rx) = bounded::<()>(0);
        let (running_tx, running_rx) = bounded(64);
        for _ in 0..cap * 4 {
            let release = release_rx.clone();
            let running = running_tx.clone();
            runtime.dispatch(move || {
                running.send(()).unwrap();
                let _ = release.recv();
            });
        }

        for _ in 0..cap {
            running_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(runtime.live_workers(), cap);

        drop(release_tx);
        // Remaining jobs drain through the same capped pool.
        for _ in 0..cap * 3 {
            running_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert!(runtime.live_workers() <= cap);
    }

    #[test]
    fn unstarted_pool_drops_jobs() {
        let runtime = IpcRuntime::new();
        let (done_tx, done_rx) = bounded::<()>(1);
        runtime.dispatch(move || done_tx.send(()).unwrap());
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(runtime.live_workers(), 0);
    }

    #[test]
    fn idle_worker_is_reused_instead_of_spawning() {
        let runtime = started_runtime(9);
        for _ in 0..5 {
            let (done_tx, done_rx) = bounded(1);
            runtime.dispatch(move || done_tx.send(()).unwrap());
            done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
            // Let the worker park again before the next dispatch looks at
            // the idle count.
            thread::sleep(Duration::from_millis(10));
        }
        // Sequential jobs with an idle worker between them never grow the
        // pool past one.
        assert_eq!(runtime.live_workers(), 1);
    }

    #[test]
    fn global_returns_the_same_instance() {
        let a = IpcRuntime::global();
        let b = IpcRuntime::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
