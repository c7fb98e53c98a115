//! Process bootstrap and event-loop host for the stats daemon.
//!
//! Three subsystems cooperate: the cross-process request runtime
//! ([`ipc`]), the datagram ingest ([`ingest`] over [`net`]), and the
//! main-thread deferred-work loop ([`looper`]). [`bootstrap`] wires them
//! together in a fixed order, registers the [`service`] object under its
//! well-known name, and then surrenders the main thread to the pump for
//! the lifetime of the process.
//!
//! The concurrency contract in one paragraph: the main thread blocks only
//! inside the pump; inbound calls run on a capped worker pool that never
//! waits on the loop (handlers post to it instead); ingest frames arrive
//! on one reader thread in arrival order. The service object is the only
//! thing shared across all three domains.

pub mod bootstrap;
pub mod config;
pub mod ingest;
pub mod ipc;
pub mod looper;
pub mod net;
pub mod service;
mod trace;

pub use trace::init_tracing;
