//! Datagram ingest: the listener and its reader thread.
//!
//! [`SocketIngest`] owns the event socket for the process lifetime. Once
//! started it delivers every received datagram to its [`FrameSink`] in
//! arrival order, from a single dedicated reader thread that blocks in a
//! reader-local poll between bursts.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Events, Interest, Poll, Token, Waker};
use thiserror::Error;

use crate::config::Config;
use crate::net::EventSocket;
use crate::trace::{debug, info, warn};

/// Largest datagram the reader accepts; longer frames are truncated by
/// the kernel at receive time.
pub const MAX_EVENT_SIZE: usize = 8 * 1024;

const SOCKET: Token = Token(0);
const SHUTDOWN: Token = Token(1);

/// Receiver of ingested frames.
///
/// Called from the reader thread, one frame at a time, in arrival order.
pub trait FrameSink: Send + Sync {
    /// Handles one received datagram payload.
    fn on_frame(&self, frame: &[u8]);
}

/// Error starting the listener.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The endpoint path could not be prepared or bound.
    #[error("failed to bind event socket at {path}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The socket or its poll could not be configured.
    #[error("failed to configure event socket")]
    Configure(#[source] io::Error),
    /// The reader thread could not be spawned.
    #[error("failed to spawn ingest reader")]
    Spawn(#[source] io::Error),
}

/// The datagram listener and owner of the reader thread.
pub struct SocketIngest {
    config: Config,
    sink: Arc<dyn FrameSink>,
    shutdown: Option<Arc<Waker>>,
    reader: Option<JoinHandle<()>>,
}

impl fmt::Debug for SocketIngest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketIngest").finish_non_exhaustive()
    }
}

impl SocketIngest {
    /// Creates an ingest that will deliver frames to `sink` once started.
    #[must_use]
    pub fn new(config: Config, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            config,
            sink,
            shutdown: None,
            reader: None,
        }
    }

    /// Binds the endpoint and spawns the reader.
    ///
    /// `backlog` is the requested datagram queue depth; the receive buffer
    /// is sized as `backlog * MAX_EVENT_SIZE` and the kernel may clamp it.
    /// A stale socket file at the endpoint is replaced.
    ///
    /// # Errors
    ///
    /// Any bind, configure, or spawn failure; the caller treats all of
    /// them as fatal.
    pub fn start(&mut self, backlog: usize) -> Result<(), IngestError> {
        let path = self.config.event_socket();
        // Datagram sockets leave their path behind; a leftover from a
        // previous run is never live once this process owns the root.
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale event socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(IngestError::Bind { path, source }),
        }

        let mut socket = EventSocket::bind(&path).map_err(|source| IngestError::Bind {
            path: path.clone(),
            source,
        })?;

        let requested = backlog.saturating_mul(MAX_EVENT_SIZE);
        socket
            .set_recv_buffer_size(requested)
            .map_err(IngestError::Configure)?;
        let granted = socket.recv_buffer_size().map_err(IngestError::Configure)?;
        if granted < requested {
            debug!(requested, granted, "kernel clamped receive queue");
        }

        let poll = Poll::new().map_err(IngestError::Configure)?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)
            .map_err(IngestError::Configure)?;
        let shutdown =
            Arc::new(Waker::new(poll.registry(), SHUTDOWN).map_err(IngestError::Configure)?);

        let sink = Arc::clone(&self.sink);
        let reader = thread::Builder::new()
            .name("statsd-ingest".into())
            .spawn(move || reader_loop(poll, &socket, &*sink))
            .map_err(IngestError::Spawn)?;

        info!(path = %path.display(), backlog, "ingest listening");
        self.shutdown = Some(shutdown);
        self.reader = Some(reader);
        Ok(())
    }

    /// True once [`SocketIngest::start`] has succeeded.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.reader.is_some()
    }
}

impl Drop for SocketIngest {
    /// Stops and joins the reader. Production never drops the ingest; this
    /// path exists for tests and for unwinding on a failed bootstrap.
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.wake();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Reader body: block in poll, then drain the socket dry.
fn reader_loop(mut poll: Poll, socket: &EventSocket, sink: &dyn FrameSink) {
    let mut events = Events::with_capacity(8);
    let mut buf = [0u8; MAX_EVENT_SIZE];

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "ingest poll failed; reader exiting");
            return;
        }

        if events.iter().any(|ev| ev.token() == SHUTDOWN) {
            debug!("ingest reader shutting down");
            return;
        }

        // Level-triggered readiness; drain everything queued before the
        // next wait so a burst costs one wakeup.
        loop {
            match socket.try_recv(&mut buf) {
                Ok(Some(n)) => sink.on_frame(&buf[..n]),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "ingest receive failed; reader exiting");
                    return;
                }
            }
        }
    }
}
