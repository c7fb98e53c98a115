//! Unix datagram socket wrapper for mio-based I/O.
//!
//! Provides a thin wrapper around [`mio::net::UnixDatagram`] with ergonomic
//! receive APIs, receive-queue sizing, and integration with mio's polling
//! infrastructure. The ingest reader thread owns one of these for the
//! lifetime of the process.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use mio::event::Source;
use mio::net::UnixDatagram as MioUnixDatagram;
use mio::{Interest, Registry, Token};

/// A non-blocking Unix-domain datagram socket bound to a filesystem path.
///
/// The socket is non-blocking; use with mio's [`Poll`] for readiness
/// notification.
///
/// [`Poll`]: mio::Poll
pub struct EventSocket {
    inner: MioUnixDatagram,
    path: PathBuf,
}

impl EventSocket {
    /// Creates a new datagram socket bound to `path`.
    ///
    /// The path must not already exist; callers that tolerate a stale
    /// socket file remove it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., path in use
    /// or parent directory missing).
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = MioUnixDatagram::bind(&path)?;
        Ok(Self { inner, path })
    }

    /// Returns the filesystem path this socket is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receives a datagram from the socket.
    ///
    /// Returns the number of bytes received, or `WouldBlock` if no data
    /// is available.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf)
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the socket's receive buffer size.
    ///
    /// The kernel may clamp or round the requested value; read it back
    /// with [`EventSocket::recv_buffer_size`] to observe the granted size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        // Use rustix for socket options since mio doesn't expose them directly
        let fd = self.inner.as_fd();
        rustix::net::sockopt::set_socket_recv_buffer_size(fd, size)?;
        Ok(())
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        let fd = self.inner.as_fd();
        Ok(rustix::net::sockopt::get_socket_recv_buffer_size(fd)?)
    }
}

impl AsFd for EventSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for EventSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
