//! Caller side of the cross-process request runtime.
//!
//! A [`Proxy`] is one connection to one published name. Lookups resolve by
//! connecting to the name's socket; each [`Proxy::call`] is one framed
//! round trip. This process uses a proxy itself for the companion
//! greeting; peer daemons use the same type against this daemon.

use std::io::{self, BufReader, BufWriter};
use std::os::unix::net::UnixStream;

use thiserror::Error;

use crate::config::Config;
use crate::ipc::wire::{self, CallFrame, CallStatus, Reply, WireError};

/// Error resolving a name or performing a call through it.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Nothing answers under the requested name.
    #[error("failed to resolve service {name:?}")]
    Resolve {
        name: String,
        #[source]
        source: io::Error,
    },
    /// The connection broke or carried a malformed frame.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The service answered, but with a per-call failure status.
    #[error("call failed: {0}")]
    Call(#[source] CallStatus),
}

/// A connected handle to one service.
#[derive(Debug)]
pub struct Proxy {
    name: String,
    stream: UnixStream,
}

impl Proxy {
    /// Resolves `name` against the directory rooted at `config`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Resolve`] when the name's socket is absent or
    /// nothing accepts on it.
    pub fn lookup(config: &Config, name: &str) -> Result<Self, ClientError> {
        let path = config.service_socket(name);
        let stream = UnixStream::connect(&path).map_err(|source| ClientError::Resolve {
            name: name.to_owned(),
            source,
        })?;
        Ok(Self {
            name: name.to_owned(),
            stream,
        })
    }

    /// Name this proxy resolved.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Performs one call: writes the request frame, blocks for the reply.
    ///
    /// # Errors
    ///
    /// [`ClientError::Wire`] on transport failure, [`ClientError::Call`]
    /// when the service reports a per-call status.
    pub fn call(&mut self, code: u32, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let frame = CallFrame {
            service: self.name.clone(),
            code,
            payload: payload.to_vec(),
        };
        let mut writer = BufWriter::new(&self.stream);
        wire::write_frame(&mut writer, &frame)?;
        drop(writer);

        let mut reader = BufReader::new(&self.stream);
        let reply: Reply = wire::read_frame(&mut reader)?;
        reply.map_err(ClientError::Call)
    }
}
