//! Backlog pressure on the datagram ingest: a full backlog's worth of
//! frames is observed complete and in arrival order.

use std::os::unix::net::UnixDatagram;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use statsd::config::Config;
use statsd::ingest::{FrameSink, SocketIngest};

static TRACING: Once = Once::new();

const BACKLOG: usize = 600;

#[derive(Default)]
struct SequenceRecorder {
    seen: Mutex<Vec<u32>>,
}

impl FrameSink for SequenceRecorder {
    fn on_frame(&self, frame: &[u8]) {
        let seq = u32::from_le_bytes(frame.try_into().expect("4-byte sequence frame"));
        self.seen.lock().unwrap().push(seq);
    }
}

#[test]
fn six_hundred_frames_arrive_complete_and_in_order() {
    TRACING.call_once(statsd::init_tracing);
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_root(dir.path());

    let sink = Arc::new(SequenceRecorder::default());
    let mut ingest = SocketIngest::new(config.clone(), Arc::clone(&sink) as Arc<dyn FrameSink>);
    ingest.start(BACKLOG).unwrap();

    // One blocking sender: the kernel applies backpressure instead of
    // dropping when the queue fills, so every frame makes it through.
    let sender = UnixDatagram::unbound().unwrap();
    sender.connect(config.event_socket()).unwrap();
    for seq in 0..BACKLOG as u32 {
        sender.send(&seq.to_le_bytes()).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let seen = sink.seen.lock().unwrap();
        if seen.len() == BACKLOG {
            let expected: Vec<u32> = (0..BACKLOG as u32).collect();
            assert_eq!(*seen, expected, "frames out of order or duplicated");
            break;
        }
        assert!(
            Instant::now() < deadline,
            "only {} of {BACKLOG} frames arrived",
            seen.len()
        );
        drop(seen);
        std::thread::sleep(Duration::from_millis(10));
    }
}
