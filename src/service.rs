//! The registered service object.
//!
//! `StatsService` is the one entity shared across every concurrency
//! domain: the main thread registers it and runs its hooks, pool workers
//! call [`Service::on_call`], and the ingest reader feeds
//! [`FrameSink::on_frame`]. All of its state is atomics, so no domain
//! ever blocks another. Aggregation and reporting live elsewhere; what
//! this object keeps is the intake ledger those collaborators read.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::ingest::FrameSink;
use crate::ipc::{CallStatus, Proxy, Reply, Service};
use crate::looper::LooperHandle;
use crate::trace::{debug, info};

/// Well-known name this daemon registers under.
pub const SERVICE_NAME: &str = "stats";

/// Well-known name of the companion daemon greeted at startup.
pub const COMPANION_NAME: &str = "statscompanion";

/// Liveness echo: replies with the request payload.
pub const CALL_PING: u32 = 1;
/// Returns the postcard-encoded [`Snapshot`] of the intake ledger.
pub const CALL_SNAPSHOT: u32 = 2;
/// Posts a report flush to the main thread; replies immediately.
pub const CALL_FLUSH: u32 = 3;

/// Point-in-time view of the intake ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Datagrams delivered by the ingest reader.
    pub frames: u64,
    /// Payload bytes across those datagrams.
    pub bytes: u64,
    /// Flush requests posted to the main thread so far.
    pub flushes: u64,
}

/// One-shot liveness signal to the companion daemon.
///
/// The default implementation resolves the companion by name and pings
/// it; tests substitute their own link.
pub trait CompanionLink: Send + Sync {
    /// Signals that this daemon is up. Must absorb its own failures.
    fn notify_ready(&self);
}

/// Companion link over the service directory.
struct SocketCompanion {
    config: Config,
}

impl CompanionLink for SocketCompanion {
    fn notify_ready(&self) {
        // The companion may not be running; that is its business, not
        // ours. Nothing above debug level.
        match Proxy::lookup(&self.config, COMPANION_NAME) {
            Ok(mut proxy) => match proxy.call(CALL_PING, b"") {
                Ok(_) => debug!("companion greeted"),
                Err(e) => debug!(error = %e, "companion greeting call failed"),
            },
            Err(e) => debug!(error = %e, "companion not reachable"),
        }
    }
}

/// The service object registered as [`SERVICE_NAME`].
pub struct StatsService {
    looper: LooperHandle,
    companion: Box<dyn CompanionLink>,
    started: AtomicBool,
    frames: AtomicU64,
    bytes: AtomicU64,
    flushes: AtomicU64,
}

impl fmt::Debug for StatsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsService").finish_non_exhaustive()
    }
}

impl StatsService {
    /// Builds the service bound to the main-thread loop, greeting the
    /// companion through the directory under `config`.
    pub fn new(config: Config, looper: LooperHandle) -> Arc<Self> {
        Self::with_companion(looper, Box::new(SocketCompanion { config }))
    }

    /// Builds the service with a caller-supplied companion link.
    pub fn with_companion(looper: LooperHandle, companion: Box<dyn CompanionLink>) -> Arc<Self> {
        Arc::new(Self {
            looper,
            companion,
            started: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    /// One-shot liveness signal to the companion. Failures never leave
    /// the link.
    pub fn greet_companion(&self) {
        self.companion.notify_ready();
    }

    /// Completes service-internal initialization. Idempotent; once it
    /// returns, the ingest reader may deliver frames.
    pub fn startup(&self) {
        if !self.started.swap(true, Ordering::Release) {
            info!("stats service started");
        }
    }

    /// True once [`StatsService::startup`] has run.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Current intake ledger.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl Service for StatsService {
    /// Runs on a pool thread. Never blocks on the main thread: the one
    /// code that needs it posts and returns.
    fn on_call(&self, code: u32, payload: &[u8]) -> Reply {
        match code {
            CALL_PING => Ok(payload.to_vec()),
            CALL_SNAPSHOT => {
                postcard::to_stdvec(&self.snapshot()).map_err(|_| CallStatus::Internal)
            }
            CALL_FLUSH => {
                let ledger = self.snapshot();
                self.looper
                    .post(move || {
                        info!(
                            frames = ledger.frames,
                            bytes = ledger.bytes,
                            "flushing report"
                        );
                    })
                    .map_err(|_| CallStatus::Unavailable)?;
                self.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(Vec::new())
            }
            other => Err(CallStatus::UnknownCode(other)),
        }
    }
}

impl FrameSink for StatsService {
    /// Runs on the ingest reader thread.
    fn on_frame(&self, frame: &[u8]) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
    }
}
