//! Main-thread event loop.
//!
//! Responsibilities:
//! - Own the process's deferred-work queue on the thread that prepared it.
//! - Let any other thread post immediate or delayed closures through a
//!   cheaply-cloneable [`LooperHandle`].
//! - Block in the OS poller between dispatches; wake only for real work.
//!
//! The loop is level-triggered: posting from another thread enqueues the
//! closure and rings a [`mio::Waker`] registered with the owner's
//! [`mio::Poll`]. The owner drains the intake queue into a deadline-ordered
//! heap and runs every entry whose wake time has arrived, one at a time, to
//! completion. Entries with equal wake times run in intake order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::time::Duration;
//! use statsd::looper::{Looper, Timeout};
//!
//! let mut looper = Looper::prepare().unwrap();
//! let ran = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&ran);
//! looper.handle().post(move || flag.store(true, Ordering::Relaxed)).unwrap();
//! looper.poll(Timeout::Duration(Duration::from_secs(1))).unwrap();
//! assert!(ran.load(Ordering::Relaxed));
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Poll, Token, Waker};
use thiserror::Error;

/// Readiness token reserved for cross-thread wakeups.
const WAKE: Token = Token(0);

/// Event buffer capacity. Only the waker registers with this poll, so the
/// buffer stays tiny.
const EVENT_CAPACITY: usize = 8;

/// Timeout specification for a blocking poll.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely for work.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Error posting work to the loop.
#[derive(Debug, Error)]
pub enum PostError {
    /// The loop (and its intake queue) no longer exists.
    #[error("event loop is gone")]
    Disconnected,
    /// The work was queued but the owner thread could not be woken.
    #[error("failed to wake event loop")]
    Wake(#[source] io::Error),
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A posted closure travelling from a handle to the owner thread.
struct Envelope {
    due: Instant,
    run: Callback,
}

/// Heap entry: ordered by wake time, intake order breaking ties.
struct Scheduled {
    due: Instant,
    seq: u64,
    run: Callback,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Cross-thread posting end of a [`Looper`].
///
/// Clones freely; every clone posts into the same loop.
#[derive(Clone)]
pub struct LooperHandle {
    intake: Sender<Envelope>,
    waker: Arc<Waker>,
}

impl LooperHandle {
    /// Posts a closure to run on the owner thread as soon as it pumps.
    pub fn post(&self, run: impl FnOnce() + Send + 'static) -> Result<(), PostError> {
        self.post_at(Instant::now(), Box::new(run))
    }

    /// Posts a closure to run on the owner thread no earlier than `delay`
    /// from now.
    pub fn post_delayed(
        &self,
        delay: Duration,
        run: impl FnOnce() + Send + 'static,
    ) -> Result<(), PostError> {
        self.post_at(Instant::now() + delay, Box::new(run))
    }

    fn post_at(&self, due: Instant, run: Callback) -> Result<(), PostError> {
        self.intake
            .send(Envelope { due, run })
            .map_err(|_| PostError::Disconnected)?;
        self.waker.wake().map_err(PostError::Wake)
    }
}

/// The per-thread event loop. `!Send`: it stays on the thread that
/// prepared it, and only that thread may pump it.
pub struct Looper {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    intake_tx: Sender<Envelope>,
    intake_rx: Receiver<Envelope>,
    timers: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
    _affinity: PhantomData<*mut ()>,
}

impl Looper {
    /// Creates the loop bound to the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller or its waker cannot be created.
    pub fn prepare() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let (intake_tx, intake_rx) = unbounded();
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
            intake_tx,
            intake_rx,
            timers: BinaryHeap::new(),
            next_seq: 0,
            _affinity: PhantomData,
        })
    }

    /// Returns a posting handle usable from any thread.
    #[must_use]
    pub fn handle(&self) -> LooperHandle {
        LooperHandle {
            intake: self.intake_tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Blocks until work is dispatched or the timeout elapses.
    ///
    /// Returns the number of closures run. With [`Timeout::Infinite`] the
    /// call returns only after dispatching at least one closure; spurious
    /// wakeups re-enter the wait internally. With [`Timeout::Duration`] the
    /// call may return `Ok(0)` once the duration has elapsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller fails; the loop is not usable
    /// afterwards.
    pub fn poll(&mut self, timeout: Timeout) -> io::Result<usize> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };

        loop {
            self.drain_intake();
            let dispatched = self.dispatch_due();
            if dispatched > 0 {
                return Ok(dispatched);
            }

            let now = Instant::now();
            if let Some(d) = deadline
                && now >= d
            {
                return Ok(0);
            }

            let wait = self.next_wait(deadline, now);
            self.poll.poll(&mut self.events, wait)?;
        }
    }

    /// Moves every pending envelope into the deadline heap, stamping intake
    /// order.
    fn drain_intake(&mut self) {
        while let Ok(envelope) = self.intake_rx.try_recv() {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.timers.push(Reverse(Scheduled {
                due: envelope.due,
                seq,
                run: envelope.run,
            }));
        }
    }

    /// Runs every entry whose wake time has arrived. Entries run to
    /// completion one at a time; nothing preempts them on this thread.
    fn dispatch_due(&mut self) -> usize {
        let mut dispatched = 0;
        while self
            .timers
            .peek()
            .is_some_and(|Reverse(s)| s.due <= Instant::now())
        {
            if let Some(Reverse(entry)) = self.timers.pop() {
                (entry.run)();
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Wait duration until the earlier of the next timer and the caller's
    /// deadline; `None` means wait forever.
    fn next_wait(&self, deadline: Option<Instant>, now: Instant) -> Option<Duration> {
        let timer = self.timers.peek().map(|Reverse(s)| s.due);
        let next = match (timer, deadline) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (Some(at), None) | (None, Some(at)) => Some(at),
            (None, None) => None,
        };
        next.map(|at| at.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |tag| sink.lock().unwrap().push(tag))
    }

    #[test]
    fn dispatches_in_post_order() {
        let mut looper = Looper::prepare().unwrap();
        let handle = looper.handle();
        let (log, record) = recorder();

        for tag in ["a", "b", "c"] {
            let record = record.clone();
            handle.post(move || record(tag)).unwrap();
        }

        let n = looper
            .poll(Timeout::Duration(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn delayed_work_waits_for_its_deadline() {
        let mut looper = Looper::prepare().unwrap();
        let handle = looper.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let start = Instant::now();
        handle
            .post_delayed(Duration::from_millis(30), move || {
                flag.store(true, Ordering::Relaxed);
            })
            .unwrap();

        let n = looper
            .poll(Timeout::Duration(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(n, 1);
        assert!(ran.load(Ordering::Relaxed));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn earlier_wake_time_runs_first_regardless_of_post_order() {
        let mut looper = Looper::prepare().unwrap();
        let handle = looper.handle();
        let (log, record) = recorder();

        let late = record.clone();
        handle
            .post_delayed(Duration::from_millis(60), move || late("late"))
            .unwrap();
        let early = record.clone();
        handle
            .post_delayed(Duration::from_millis(10), move || early("early"))
            .unwrap();

        while log.lock().unwrap().len() < 2 {
            looper
                .poll(Timeout::Duration(Duration::from_secs(2)))
                .unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn same_delay_preserves_post_order() {
        let mut looper = Looper::prepare().unwrap();
        let handle = looper.handle();
        let (log, record) = recorder();

        for tag in ["first", "second", "third"] {
            let record = record.clone();
            handle
                .post_delayed(Duration::from_millis(5), move || record(tag))
                .unwrap();
        }

        while log.lock().unwrap().len() < 3 {
            looper
                .poll(Timeout::Duration(Duration::from_secs(2)))
                .unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn cross_thread_post_wakes_infinite_poll() {
        let mut looper = Looper::prepare().unwrap();
        let handle = looper.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle
                .post(move || flag.store(true, Ordering::Relaxed))
                .unwrap();
        });

        let n = looper.poll(Timeout::Infinite).unwrap();
        assert_eq!(n, 1);
        assert!(ran.load(Ordering::Relaxed));
        poster.join().unwrap();
    }

    #[test]
    fn finite_poll_returns_zero_when_idle() {
        let mut looper = Looper::prepare().unwrap();
        let n = looper
            .poll(Timeout::Duration(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn post_after_loop_drop_reports_disconnected() {
        let looper = Looper::prepare().unwrap();
        let handle = looper.handle();
        drop(looper);
        let err = handle.post(|| {}).unwrap_err();
        assert!(matches!(err, PostError::Disconnected));
    }
}
