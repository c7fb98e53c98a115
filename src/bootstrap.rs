//! Ordered process bring-up and the main-thread pump.
//!
//! [`boot`] performs the fixed startup sequence over seam traits so the
//! ordering contract is testable with mocks; [`run`] composes the real
//! components and is what the binary executes. Failure policy is
//! crash-on-setup-failure: a refused registration exits −1, a failed
//! ingest start exits 1, and nothing is retried. After [`pump`] is
//! entered the main thread does loop work only.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::ingest::{FrameSink, IngestError, SocketIngest};
use crate::ipc::{DirectoryError, IpcRuntime, Service, ServiceDirectory};
use crate::looper::{Looper, Timeout};
use crate::service::{SERVICE_NAME, StatsService};
use crate::trace::{error, info, warn};

/// Worker cap for the cross-process call pool.
pub const THREAD_POOL_MAX: usize = 9;

/// Requested datagram queue depth for the ingest listener, matching the
/// kernel's elevated per-socket bound.
pub const INGEST_BACKLOG: usize = 600;

/// Diagnostic name the pool's worker threads spawn under.
const POOL_NAME: &str = "statsd-ipc";

/// Fatal bootstrap failure. Anything not represented here (greeting,
/// per-call, per-frame failures) is absorbed by the owning component.
#[derive(Debug, Error)]
pub enum BootError {
    /// The service directory refused publication.
    #[error("service registration failed")]
    Registration(#[source] DirectoryError),
    /// The ingest listener could not start.
    #[error("ingest start failed")]
    Ingest(#[source] IngestError),
}

impl BootError {
    /// Process exit status for this failure. Registration failures exit
    /// −1 so operators can tell a naming conflict from a socket problem.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Registration(_) => -1,
            Self::Ingest(_) => 1,
        }
    }
}

/// Publication seam; [`ServiceDirectory`] in production.
pub trait Registrar {
    /// Publishes `service` under `name`.
    ///
    /// # Errors
    ///
    /// Any refusal by the directory; fatal to bootstrap.
    fn register(&self, name: &str, service: Arc<dyn Service>) -> Result<(), DirectoryError>;
}

impl Registrar for ServiceDirectory {
    fn register(&self, name: &str, service: Arc<dyn Service>) -> Result<(), DirectoryError> {
        ServiceDirectory::register(self, name, service)
    }
}

/// The lifecycle hooks bootstrap drives on the service object.
pub trait ServiceHooks {
    /// One-shot liveness signal to the companion; absorbs its failures.
    fn greet_companion(&self);
    /// Synchronous service-internal initialization.
    fn startup(&self);
}

impl ServiceHooks for StatsService {
    fn greet_companion(&self) {
        StatsService::greet_companion(self);
    }

    fn startup(&self) {
        StatsService::startup(self);
    }
}

/// Listener seam; [`SocketIngest`] in production.
pub trait Ingest {
    /// Starts accepting frames with the supplied backlog.
    ///
    /// # Errors
    ///
    /// Any bind, configure, or spawn failure; fatal to bootstrap.
    fn start(&mut self, backlog: usize) -> Result<(), IngestError>;
}

impl Ingest for SocketIngest {
    fn start(&mut self, backlog: usize) -> Result<(), IngestError> {
        SocketIngest::start(self, backlog)
    }
}

/// Runs bootstrap steps 2 through 8: configure and start the pool,
/// construct the service, register it, greet the companion, run the
/// startup hook, construct the ingest, start listening.
///
/// Returns the strong service reference and the running ingest; the
/// caller retains both until process exit and then enters the pump.
///
/// # Errors
///
/// [`BootError::Registration`] stops the sequence before the greeting;
/// [`BootError::Ingest`] stops it after startup completed. Either way an
/// error record identifying the failed step has been emitted.
pub fn boot<S, I>(
    runtime: &Arc<IpcRuntime>,
    registrar: &impl Registrar,
    make_service: impl FnOnce() -> Arc<S>,
    make_ingest: impl FnOnce(&Arc<S>) -> I,
) -> Result<(Arc<S>, I), BootError>
where
    S: Service + ServiceHooks + 'static,
    I: Ingest,
{
    runtime.set_thread_pool_max(THREAD_POOL_MAX);
    runtime.start_thread_pool();
    runtime.give_thread_pool_name(POOL_NAME);
    runtime.disable_background_scheduling();

    let service = make_service();

    if let Err(e) = registrar.register(SERVICE_NAME, Arc::clone(&service) as Arc<dyn Service>) {
        error!(name = SERVICE_NAME, error = %e, "service registration failed");
        return Err(BootError::Registration(e));
    }

    // The companion may answer the greeting by calling us, so the name
    // must already resolve; startup has not run yet and the service's own
    // policy covers that window.
    service.greet_companion();
    service.startup();

    let mut ingest = make_ingest(&service);
    if let Err(e) = ingest.start(INGEST_BACKLOG) {
        error!(error = %e, "ingest start failed");
        return Err(BootError::Ingest(e));
    }

    Ok((service, ingest))
}

/// Step 9: surrender the main thread to the loop.
///
/// Never returns under normal operation; an infinite-timeout poll only
/// comes back to us by failing, and that failure is the return value.
pub fn pump(looper: &mut Looper) -> io::Error {
    info!("entering event loop");
    loop {
        if let Err(e) = looper.poll(Timeout::Infinite) {
            return e;
        }
    }
}

/// Maps a pump escape onto the runtime-anomaly contract: one warning
/// naming the daemon, exit status 1.
#[must_use]
pub fn loop_escaped(error: &io::Error) -> i32 {
    warn!(error = %error, "statsd escaped from its loop");
    1
}

/// Production entry: composes the real components over the default
/// socket root and returns the process exit status. Only ever returns on
/// failure; on the happy path the pump holds the thread forever.
pub fn run() -> i32 {
    let config = Config::default();

    let mut looper = match Looper::prepare() {
        Ok(looper) => looper,
        Err(e) => {
            error!(error = %e, "failed to prepare event loop");
            return 1;
        }
    };
    let handle = looper.handle();

    let runtime = IpcRuntime::global();
    let directory = ServiceDirectory::new(config.clone(), Arc::clone(&runtime));

    let booted = boot(
        &runtime,
        &directory,
        || StatsService::new(config.clone(), handle),
        |service| SocketIngest::new(config.clone(), Arc::clone(service) as Arc<dyn FrameSink>),
    );
    // One strong reference to the service and the running listener stay
    // here until the process dies.
    let (_service, _ingest) = match booted {
        Ok(parts) => parts,
        Err(e) => return e.exit_code(),
    };

    let escape = pump(&mut looper);
    loop_escaped(&escape)
}
