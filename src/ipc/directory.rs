//! Well-known-name publication over per-service Unix stream sockets.
//!
//! Registering an object under a name binds `<root>/<name>.sock` and spawns
//! an acceptor thread for it. Each accepted peer connection becomes one job
//! on the shared worker pool; the worker serves framed calls on that
//! connection until the peer hangs up. Peers resolve a name by connecting
//! to its socket, so a successful bind *is* the publication.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::Config;
use crate::ipc::runtime::IpcRuntime;
use crate::ipc::wire::{self, CallFrame, CallStatus, Reply};
use crate::ipc::{Service, ThreadState, sys};
use crate::trace::{debug, info, warn};

/// Error publishing a service.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Another live process already publishes this name.
    #[error("name {0:?} is already taken")]
    NameTaken(String),
    /// The service socket could not be bound.
    #[error("failed to bind service socket")]
    Bind(#[source] io::Error),
    /// The socket root could not be created or the acceptor thread could
    /// not be spawned.
    #[error(transparent)]
    Io(#[from] io::Error),
}

type DispatchTable = Arc<Mutex<HashMap<String, Arc<dyn Service>>>>;

/// The service directory for one socket root.
///
/// Shared between the registering thread and the per-name acceptor
/// threads; connection workers resolve names against its dispatch table.
pub struct ServiceDirectory {
    config: Config,
    runtime: Arc<IpcRuntime>,
    table: DispatchTable,
}

impl ServiceDirectory {
    /// Creates a directory rooted at `config.socket_root`, dispatching
    /// connection work onto `runtime`.
    #[must_use]
    pub fn new(config: Config, runtime: Arc<IpcRuntime>) -> Self {
        Self {
            config,
            runtime,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publishes `service` under `name`.
    ///
    /// Once this returns `Ok`, a peer connecting to the name's socket
    /// reaches `service`. A stale socket file whose previous owner is gone
    /// is reclaimed; a socket with a live listener refuses the name.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::NameTaken`] if this directory or a live peer
    /// process already publishes the name; [`DirectoryError::Bind`] if the
    /// socket cannot be bound; [`DirectoryError::Io`] for root-creation or
    /// thread-spawn failures.
    pub fn register(
        &self,
        name: &str,
        service: Arc<dyn Service>,
    ) -> Result<(), DirectoryError> {
        if self.is_registered(name) {
            return Err(DirectoryError::NameTaken(name.to_owned()));
        }

        fs::create_dir_all(&self.config.socket_root)?;
        let path = self.config.service_socket(name);
        let listener = bind_reclaiming_stale(&path, name)?;

        // Publish in the dispatch table before the acceptor runs, so the
        // very first accepted call already resolves.
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), service);

        let spawned = thread::Builder::new()
            .name(format!("accept-{name}"))
            .spawn({
                let runtime = Arc::clone(&self.runtime);
                let table = Arc::clone(&self.table);
                move || accept_loop(&listener, &runtime, &table)
            });
        if let Err(e) = spawned {
            self.table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
            let _ = fs::remove_file(&path);
            return Err(DirectoryError::Io(e));
        }

        info!(name, path = %path.display(), "service registered");
        Ok(())
    }

    /// True when `name` is published by this directory.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

/// Binds the service socket, unlinking a leftover file only when nothing
/// answers on it.
fn bind_reclaiming_stale(path: &Path, name: &str) -> Result<UnixListener, DirectoryError> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                return Err(DirectoryError::NameTaken(name.to_owned()));
            }
            debug!(path = %path.display(), "reclaiming stale service socket");
            fs::remove_file(path).map_err(DirectoryError::Bind)?;
            UnixListener::bind(path).map_err(DirectoryError::Bind)
        }
        Err(e) => Err(DirectoryError::Bind(e)),
    }
}

/// Backoff before retrying a failed accept. Errors like EMFILE recur
/// until descriptors free up; retrying immediately would spin the
/// acceptor thread at full speed.
fn accept_retry_delay(consecutive_errors: u32) -> Duration {
    const BASE_MS: u64 = 10;
    const CAP_MS: u64 = 1_000;
    let ms = BASE_MS << consecutive_errors.min(7);
    Duration::from_millis(ms.min(CAP_MS))
}

/// Acceptor body: every accepted connection becomes one pool job.
fn accept_loop(listener: &UnixListener, runtime: &Arc<IpcRuntime>, table: &DispatchTable) {
    let mut consecutive_errors: u32 = 0;
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                consecutive_errors = 0;
                let table = Arc::clone(table);
                runtime.dispatch(move || serve_connection(stream, &table));
            }
            Err(e) => {
                // One warning per burst, then back off quietly until an
                // accept succeeds again. The listener itself lives for
                // the process.
                if consecutive_errors == 0 {
                    warn!(error = %e, "accept failed; backing off");
                } else {
                    debug!(error = %e, "accept still failing");
                }
                thread::sleep(accept_retry_delay(consecutive_errors));
                consecutive_errors = consecutive_errors.saturating_add(1);
            }
        }
    }
}

/// Connection worker: frames in, replies out, until the peer hangs up.
fn serve_connection(stream: UnixStream, table: &DispatchTable) {
    let creds = sys::peer_credentials(stream.as_fd()).ok();
    let mut reader = io::BufReader::new(&stream);
    let mut writer = io::BufWriter::new(&stream);

    loop {
        let call: CallFrame = match wire::read_frame(&mut reader) {
            Ok(call) => call,
            Err(e) if e.is_disconnect() => return,
            Err(e) => {
                warn!(error = %e, "dropping connection on malformed frame");
                return;
            }
        };

        let service = table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&call.service)
            .cloned();

        let reply: Reply = match service {
            Some(service) => ThreadState::with_caller(creds, || {
                service.on_call(call.code, &call.payload)
            }),
            None => Err(CallStatus::UnknownService),
        };

        if let Err(e) = wire::write_frame(&mut writer, &reply) {
            warn!(error = %e, "failed to write reply; dropping connection");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    struct Echo;

    impl Service for Echo {
        fn on_call(&self, code: u32, payload: &[u8]) -> Reply {
            match code {
                0 => Ok(payload.to_vec()),
                other => Err(CallStatus::UnknownCode(other)),
            }
        }
    }

    fn directory() -> (tempfile::TempDir, ServiceDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let runtime = Arc::new(IpcRuntime::new());
        runtime.set_thread_pool_max(2);
        runtime.start_thread_pool();
        (dir, ServiceDirectory::new(config, runtime))
    }

    #[test]
    fn register_binds_the_name_socket() {
        let (dir, directory) = directory();
        directory.register("stats", Arc::new(Echo)).unwrap();
        assert!(directory.is_registered("stats"));
        assert!(dir.path().join("stats.sock").exists());
    }

    #[test]
    fn duplicate_name_is_refused() {
        let (_dir, directory) = directory();
        directory.register("stats", Arc::new(Echo)).unwrap();
        let err = directory.register("stats", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, DirectoryError::NameTaken(name) if name == "stats"));
    }

    #[test]
    fn live_listener_in_another_directory_is_refused() {
        let (dir, first) = directory();
        first.register("stats", Arc::new(Echo)).unwrap();

        let config = Config::with_root(dir.path());
        let runtime = Arc::new(IpcRuntime::new());
        runtime.start_thread_pool();
        let second = ServiceDirectory::new(config, runtime);
        let err = second.register("stats", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, DirectoryError::NameTaken(_)));
    }

    #[test]
    fn stale_socket_file_is_reclaimed() {
        let (dir, directory) = directory();
        // A socket file nothing listens on, as left behind by a crash.
        let path = dir.path().join("stats.sock");
        let stale = UnixDatagram::bind(&path).unwrap();
        drop(stale);

        directory.register("stats", Arc::new(Echo)).unwrap();
        assert!(directory.is_registered("stats"));
    }

    #[test]
    fn accept_retry_always_suspends_and_caps() {
        // Persistent errors such as fd exhaustion must never produce a
        // zero-delay retry, and the delay must stop growing.
        assert!(accept_retry_delay(0) >= Duration::from_millis(10));
        let mut previous = Duration::ZERO;
        for burst in 0..32 {
            let delay = accept_retry_delay(burst);
            assert!(delay > Duration::ZERO);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(1));
            previous = delay;
        }
        assert_eq!(accept_retry_delay(31), Duration::from_secs(1));
    }

    #[test]
    fn bind_failure_does_not_leave_a_table_entry() {
        let dir = tempfile::tempdir().unwrap();
        // Socket root is a file, so create_dir_all fails.
        let bogus_root = dir.path().join("root");
        fs::write(&bogus_root, b"not a directory").unwrap();

        let runtime = Arc::new(IpcRuntime::new());
        runtime.start_thread_pool();
        let directory = ServiceDirectory::new(Config::with_root(&bogus_root), runtime);
        assert!(directory.register("stats", Arc::new(Echo)).is_err());
        assert!(!directory.is_registered("stats"));
    }
}
