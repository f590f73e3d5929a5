//! Stream Link (C3): a SUB-socket image stream receiver with
//! auto-reconnect, grounded on `stream_receiver.py`'s `zmq.SUB` socket
//! options (`LINGER=0`, `RCVHWM=2`, `RCVTIMEO=500`) and its
//! inactivity/backoff reconnection loop — collapsed here into the single
//! implementation the origin accidentally duplicated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

const RECV_HWM: i32 = 2;
const RECV_TIMEO_MS: i32 = 500;
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Stopped,
    Running,
    Failed,
}

/// One event delivered to the sink, in addition to the frame parts
/// themselves.
#[derive(Debug)]
pub enum StreamMessage {
    /// Header bytes (part 1) and payload bytes (part 2) of one frame.
    Frame { header: Vec<u8>, payload: Vec<u8> },
    Disconnected,
    Reconnected,
    /// Reconnection attempts exhausted; the link is now `Failed`.
    GaveUp,
}

pub type Sink = Arc<dyn Fn(StreamMessage) + Send + Sync>;

/// A one-way subscriber to the scanner's image port. Owns a background
/// thread while `Running`.
pub struct StreamLink {
    sink: Mutex<Option<Sink>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    state: Arc<Mutex<LinkState>>,
}

impl Default for StreamLink {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamLink {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            state: Arc::new(Mutex::new(LinkState::Stopped)),
        }
    }

    /// Sets the sink that receives every frame and state transition. Only
    /// permitted while the link is `Stopped`, matching the origin's
    /// thread-unsafe signal re-entry being replaced by a single
    /// set-once-while-stopped sink.
    pub fn set_sink<F>(&mut self, sink: F) -> Result<(), &'static str>
    where
        F: Fn(StreamMessage) + Send + Sync + 'static,
    {
        if *self.state.lock().unwrap() != LinkState::Stopped {
            return Err("sink can only be replaced while the link is Stopped");
        }
        *self.sink.lock().unwrap() = Some(Arc::new(sink));
        Ok(())
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    /// Starts the background receive loop against `endpoint`
    /// (`tcp://host:port`, conventionally control-port + 1).
    pub fn start(&mut self, endpoint: &str) -> Result<(), &'static str> {
        if self.state() != LinkState::Stopped {
            return Err("stream link is already running");
        }
        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .ok_or("no sink configured")?;

        self.running.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = LinkState::Running;

        let running = self.running.clone();
        let state = self.state.clone();
        let endpoint = endpoint.to_string();

        self.handle = Some(std::thread::spawn(move || {
            run_receive_loop(&endpoint, &running, &state, &sink);
        }));
        Ok(())
    }

    /// Stops the background thread and closes the transport with zero
    /// linger.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        *self.state.lock().unwrap() = LinkState::Stopped;
    }
}

fn run_receive_loop(endpoint: &str, running: &AtomicBool, state: &Mutex<LinkState>, sink: &Sink) {
    let mut attempts = 0u32;

    'reconnect: while running.load(Ordering::SeqCst) && attempts <= MAX_RECONNECT_ATTEMPTS {
        let ctx = zmq::Context::new();
        let socket = match ctx.socket(zmq::SUB) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to create SUB socket: {e}");
                attempts += 1;
                backoff(attempts);
                continue;
            }
        };
        if socket.set_linger(0).is_err()
            || socket.set_rcvhwm(RECV_HWM).is_err()
            || socket.set_subscribe(b"").is_err()
            || socket.set_rcvtimeo(RECV_TIMEO_MS).is_err()
        {
            warn!("failed to configure SUB socket options");
            attempts += 1;
            backoff(attempts);
            continue;
        }
        if let Err(e) = socket.connect(endpoint) {
            warn!("failed to connect to {endpoint}: {e}");
            attempts += 1;
            backoff(attempts);
            continue;
        }

        info!("stream link connected to {endpoint}");
        if attempts > 0 {
            sink(StreamMessage::Reconnected);
        }
        attempts = 0;
        let mut last_activity = Instant::now();

        while running.load(Ordering::SeqCst) {
            match socket.recv_bytes(0) {
                Ok(header) => {
                    last_activity = Instant::now();
                    if !socket.get_rcvmore().unwrap_or(false) {
                        warn!("received header with no companion payload part; discarding");
                        continue;
                    }
                    match socket.recv_bytes(0) {
                        Ok(payload) => sink(StreamMessage::Frame { header, payload }),
                        Err(e) => warn!("failed to read payload part: {e}"),
                    }
                }
                Err(zmq::Error::EAGAIN) => {
                    if last_activity.elapsed() >= INACTIVITY_TIMEOUT {
                        warn!("no frame for {:?}, reconnecting", INACTIVITY_TIMEOUT);
                        sink(StreamMessage::Disconnected);
                        attempts += 1;
                        backoff(attempts);
                        continue 'reconnect;
                    }
                }
                Err(e) => {
                    warn!("stream recv error: {e}");
                    sink(StreamMessage::Disconnected);
                    attempts += 1;
                    backoff(attempts);
                    continue 'reconnect;
                }
            }
        }
        return;
    }

    if running.load(Ordering::SeqCst) {
        *state.lock().unwrap() = LinkState::Failed;
        sink(StreamMessage::GaveUp);
    }
}

fn backoff(attempt: u32) {
    let delay = INITIAL_BACKOFF.saturating_mul(1 << attempt.saturating_sub(1).min(8));
    std::thread::sleep(delay.min(MAX_BACKOFF));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_sink_rejects_replacement_while_running() {
        let mut link = StreamLink::new();
        link.set_sink(|_| {}).unwrap();
        // A link that has never started is still Stopped, so a second
        // set_sink call must succeed.
        assert!(link.set_sink(|_| {}).is_ok());
    }

    #[test]
    fn start_without_sink_is_an_error() {
        let mut link = StreamLink::new();
        assert!(link.start("tcp://127.0.0.1:1").is_err());
    }

    #[test]
    fn stop_on_a_stopped_link_is_a_no_op() {
        let mut link = StreamLink::new();
        link.stop();
        assert_eq!(link.state(), LinkState::Stopped);
    }

    #[test]
    fn backoff_schedule_is_monotone_and_capped() {
        let start = Instant::now();
        backoff(1);
        let first = start.elapsed();
        assert!(first >= INITIAL_BACKOFF);
        assert!(first < MAX_BACKOFF);
    }

    #[test]
    fn start_and_stop_cycles_through_running_state() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let mut link = StreamLink::new();
        link.set_sink(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        // Port 0 on loopback: connect succeeds immediately (zmq connect
        // does not block), the inner loop just times out repeatedly.
        link.start("tcp://127.0.0.1:0").unwrap();
        assert_eq!(link.state(), LinkState::Running);
        link.stop();
        assert_eq!(link.state(), LinkState::Stopped);
    }
}
