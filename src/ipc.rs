//! Cross-process request infrastructure.
//!
//! Other processes reach this daemon through objects published by well-known
//! name in the [`directory`], over per-name Unix stream sockets under the
//! configured socket root. Inbound calls are framed by [`wire`] and executed
//! on the shared worker pool owned by the [`runtime`]; the [`client`] side
//! gives peers (and this process, for the companion greeting) a matching
//! `Proxy`.
//!
//! The pool never blocks on the main-thread event loop. A handler that needs
//! main-thread execution posts a closure through its
//! [`LooperHandle`](crate::looper::LooperHandle) and returns.

pub mod client;
pub mod directory;
pub mod runtime;
mod sys;
pub mod wire;

pub use client::{ClientError, Proxy};
pub use directory::{DirectoryError, ServiceDirectory};
pub use runtime::IpcRuntime;
pub use sys::PeerCred;
pub use wire::{CallFrame, CallStatus, Reply, WireError};

use std::cell::Cell;

/// An object callable from other processes once registered in the
/// [`ServiceDirectory`].
///
/// `on_call` runs on a worker-pool thread. Implementations are shared
/// across threads behind an `Arc` and must synchronize internally.
pub trait Service: Send + Sync {
    /// Handles one inbound call and produces the reply payload.
    ///
    /// # Errors
    ///
    /// A returned [`CallStatus`] travels back to the peer; it is never
    /// fatal to the dispatching worker.
    fn on_call(&self, code: u32, payload: &[u8]) -> Reply;
}

thread_local! {
    static CALLER: Cell<Option<PeerCred>> = const { Cell::new(None) };
}

/// Per-thread IPC bookkeeping.
///
/// While a worker executes [`Service::on_call`], the credentials of the
/// calling process are pinned here so handlers can consult them without
/// plumbing them through every signature.
pub struct ThreadState;

impl ThreadState {
    /// Credentials of the peer whose call is executing on this thread.
    ///
    /// `None` outside of a call, or when the credentials could not be
    /// read from the connection.
    #[must_use]
    pub fn calling_peer() -> Option<PeerCred> {
        CALLER.with(Cell::get)
    }

    /// Runs `f` with `creds` installed as this thread's calling peer,
    /// restoring the previous value afterwards.
    pub(crate) fn with_caller<R>(creds: Option<PeerCred>, f: impl FnOnce() -> R) -> R {
        let previous = CALLER.with(|c| c.replace(creds));
        let result = f();
        CALLER.with(|c| c.set(previous));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calling_peer_is_empty_outside_calls() {
        assert!(ThreadState::calling_peer().is_none());
    }

    #[test]
    fn with_caller_scopes_and_restores() {
        let creds = PeerCred {
            pid: 42,
            uid: 1000,
            gid: 1000,
        };
        ThreadState::with_caller(Some(creds), || {
            assert_eq!(ThreadState::calling_peer(), Some(creds));
            // Nested scopes shadow and restore.
            ThreadState::with_caller(None, || {
                assert!(ThreadState::calling_peer().is_none());
            });
            assert_eq!(ThreadState::calling_peer(), Some(creds));
        });
        assert!(ThreadState::calling_peer().is_none());
    }
}
