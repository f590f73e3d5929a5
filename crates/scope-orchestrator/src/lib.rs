//! Scan Orchestrator (C8): drives one scan session end-to-end through
//! `Idle -> Calibrating -> Prefetching -> Projecting(i) -> Awaiting(i) ->
//! ... -> Finalising -> Completed | Failed | Cancelled`, modelled on
//! `usb-camera::control`'s retry/backoff state handling.
//!
//! Triangulator preparation (shadow masks from the white/black reference
//! frames) needs frames that only exist once patterns 0 and 1 have been
//! captured during this very session, so — unlike C2-C6, which the
//! Session Supervisor wires at construction — the `Triangulator` is built
//! lazily inside [`ScanOrchestrator::run`] the moment the frame store
//! reports both reference pairs complete, and cached for the rest of the
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scope_calibration::StereoCalibration;
use scope_control_link::{ControlLink, ControlLinkError, Reply, ReplyStatus};
use scope_core::error::SessionError;
use scope_core::events::{ErrorCode, Event};
use scope_core::types::{PointCloud, ScanId, ScanStats};
use scope_frame_store::FrameStore;
use scope_triangulator::{Triangulator, TriangulatorConfig};
use scope_worker_pool::{TaskId, WorkerPool};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Spacing between the three clock-calibration `PING`s.
const PING_SPACING: Duration = Duration::from_millis(50);
const CALIBRATION_PING_COUNT: u32 = 3;
const MIN_ADAPTIVE_TIMEOUT_MS: u64 = 50;
/// Baseline RTT assumed when clock calibration itself fails (§4.8 failure table).
const FALLBACK_BASELINE_RTT_MS: f64 = 50.0;
/// Nominal per-pattern stabilisation wait before `projection_time_ms` and
/// the quality multiplier adjust it down or up.
const BASE_STABILIZATION_MS: f64 = 200.0;
const MIN_STABILIZATION_MS: f64 = 50.0;
const DEFAULT_LOOK_AHEAD: i32 = 4;
/// A new batch is composed once at least this many new completed indices
/// (beyond the last composed batch) have appeared (§4.8 step 3d).
const MIN_NEW_COMPLETE_FOR_BATCH: usize = 2;
/// Every blocking wait inside the pattern loop polls the stop flag at
/// least this often, keeping `stop()` -> terminal state within 500ms (P7).
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Stream inactivity thresholds from the §4.8 failure table: a warning
/// past 5s, a fatal `StreamStalled` past 10s.
const STREAM_STALL_WARN: Duration = Duration::from_secs(5);
const STREAM_STALL_ABORT: Duration = Duration::from_secs(10);
const STREAM_WATCHER_POLL: Duration = Duration::from_millis(250);

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("control link error: {0}")]
    Control(#[from] ControlLinkError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Per-session parameters the orchestrator needs; a subset of
/// `scope_core::config::ScopeConfig` plus the calibration and endpoint the
/// Session Supervisor has already resolved.
#[derive(Debug, Clone)]
pub struct OrchestratorRunConfig {
    pub scan_id: ScanId,
    pub pattern_count: u32,
    pub quality: u8,
    pub exposure_time_s: f32,
    pub worker_count: usize,
    pub triangulator_config: TriangulatorConfig,
}

/// Drives one scan. Owns the control link; the Session Supervisor supplies
/// everything else by reference (frame store, worker pool, calibration)
/// since those are shared with C1/C3/C6.
pub struct ScanOrchestrator {
    control: Mutex<ControlLink>,
    frame_store: Arc<FrameStore>,
    worker_pool: Arc<WorkerPool<PointCloud>>,
    calibration: Arc<StereoCalibration>,
    on_event: EventSink,
    /// Shared with the Session Supervisor so `latest_point_cloud()` can
    /// return actual point data without the lightweight `Event` enum
    /// having to carry a full cloud on every update.
    latest_cloud: Arc<Mutex<Option<PointCloud>>>,
    stop_flag: Arc<AtomicBool>,
    /// Set by the stream-stall watcher once inactivity exceeds
    /// `STREAM_STALL_ABORT`; the pattern loop checks it alongside
    /// `stop_flag` and aborts with `SessionError::StreamStalled`.
    stalled_flag: Arc<AtomicBool>,
}

impl ScanOrchestrator {
    pub fn new(
        control: ControlLink,
        frame_store: Arc<FrameStore>,
        worker_pool: Arc<WorkerPool<PointCloud>>,
        calibration: Arc<StereoCalibration>,
        on_event: EventSink,
        latest_cloud: Arc<Mutex<Option<PointCloud>>>,
    ) -> Self {
        Self {
            control: Mutex::new(control),
            frame_store,
            worker_pool,
            calibration,
            on_event,
            latest_cloud,
            stop_flag: Arc::new(AtomicBool::new(false)),
            stalled_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A clone-able flag `stop()` sets; `run()` polls it at least every
    /// `CANCEL_POLL_INTERVAL`, matching the "every long loop polls at
    /// least once every 500ms" rule (§5).
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Requests cancellation. Does not block; the caller observes
    /// `run()`'s return to know the session reached `Cancelled`.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Runs the full per-session procedure (§4.8) on the calling thread.
    pub fn run(&self, config: OrchestratorRunConfig) -> Result<ScanStats, SessionError> {
        let mut stats = ScanStats::default();

        self.publish(Event::ScanProgress {
            percent: 0.0,
            patterns_received: 0,
            message: "calibrating clock".to_string(),
        });
        let baseline_rtt_ms = match self.calibrate_clock(&mut stats) {
            Ok(rtt) => rtt,
            Err(OrchestratorError::Session(SessionError::Cancelled)) => {
                return self.cancel(&mut stats);
            }
            Err(e) => {
                warn!(error = %e, "clock calibration failed, continuing with baseline RTT");
                FALLBACK_BASELINE_RTT_MS
            }
        };
        if self.stop_flag.load(Ordering::SeqCst) {
            return self.cancel(&mut stats);
        }

        self.prefetch(config.pattern_count);
        if self.stop_flag.load(Ordering::SeqCst) {
            return self.cancel(&mut stats);
        }

        let triangulator: Mutex<Option<Arc<Triangulator>>> = Mutex::new(None);
        let mut last_batch_complete_count = 0usize;
        let mut pending_tasks: Vec<TaskId> = Vec::new();
        let mut cancelled = false;
        let mut stalled = false;

        let watcher_stop = Arc::new(AtomicBool::new(false));
        let watcher_handle = {
            let frame_store = self.frame_store.clone();
            let stalled_flag = self.stalled_flag.clone();
            let watcher_stop = watcher_stop.clone();
            self.stalled_flag.store(false, Ordering::SeqCst);
            std::thread::spawn(move || {
                let mut warned = false;
                while !watcher_stop.load(Ordering::SeqCst) {
                    let idle = frame_store.time_since_last_activity();
                    if idle >= STREAM_STALL_ABORT {
                        stalled_flag.store(true, Ordering::SeqCst);
                        break;
                    } else if idle >= STREAM_STALL_WARN {
                        if !warned {
                            warn!(idle_ms = idle.as_millis() as u64, "stream link inactive");
                            warned = true;
                        }
                    } else {
                        warned = false;
                    }
                    std::thread::sleep(STREAM_WATCHER_POLL);
                }
            })
        };

        for i in 0..config.pattern_count as i32 {
            if self.stop_flag.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            if self.stalled_flag.load(Ordering::SeqCst) {
                stalled = true;
                break;
            }

            self.wait_out_backpressure(config.worker_count);

            let timeout = adaptive_timeout(baseline_rtt_ms);
            let reply = match self.sync_pattern_with_retry(i, timeout) {
                Some(reply) => reply,
                None => {
                    self.publish(Event::Error {
                        code: ErrorCode::Session,
                        message: format!("pattern {i} skipped after repeated SYNC_PATTERN failures"),
                    });
                    continue;
                }
            };

            stats.patterns_completed += 1;
            stats.last_projection_rtt_ms = field_f64(&reply.fields, "projection_time_ms");

            let _ = self.request_prefetch(i + DEFAULT_LOOK_AHEAD);
            let wait = stabilization_wait(config.quality, field_f64(&reply.fields, "projection_time_ms"));
            std::thread::sleep(wait);

            if i <= 1 {
                if i == 1 && self.frame_store.has_pair(0) && self.frame_store.has_pair(1) {
                    self.ensure_triangulator(&triangulator, &config.triangulator_config);
                }
                continue;
            }

            let complete: Vec<i32> = self.frame_store.complete_indices();
            let new_complete_count = complete.iter().filter(|&&idx| idx > 1).count();
            if new_complete_count >= last_batch_complete_count + MIN_NEW_COMPLETE_FOR_BATCH {
                if let Some(task_id) = self.submit_batch(&triangulator, &complete) {
                    pending_tasks.push(task_id);
                }
                last_batch_complete_count = new_complete_count;
            }

            self.publish(Event::ScanProgress {
                percent: 100.0 * (i as f32 + 1.0) / config.pattern_count as f32,
                patterns_received: stats.patterns_completed,
                message: format!("pattern {i} captured"),
            });
        }

        watcher_stop.store(true, Ordering::SeqCst);
        let _ = watcher_handle.join();

        if stalled {
            return self.abort_stalled(&mut stats);
        }
        if cancelled {
            return self.cancel(&mut stats);
        }

        // Final batch: every complete index, awaited so the session's last
        // published cloud reflects everything captured.
        let complete = self.frame_store.complete_indices();
        if let Some(task_id) = self.submit_batch(&triangulator, &complete) {
            pending_tasks.push(task_id);
        }
        self.drain_pending(&mut pending_tasks);
        self.send_stop_stream();

        info!(scan_id = %config.scan_id, patterns = stats.patterns_completed, "scan completed");
        Ok(stats)
    }

    fn cancel(&self, stats: &mut ScanStats) -> Result<ScanStats, SessionError> {
        let _ = stats;
        self.send_stop_stream();
        Err(SessionError::Cancelled)
    }

    /// Stream link produced no frames for `STREAM_STALL_ABORT`; abort the
    /// session rather than let the pattern loop spin forever (§4.8 failure
    /// table).
    fn abort_stalled(&self, stats: &mut ScanStats) -> Result<ScanStats, SessionError> {
        let _ = stats;
        self.publish(Event::Error {
            code: ErrorCode::Session,
            message: "stream link stalled, aborting scan".to_string(),
        });
        self.send_stop_stream();
        Err(SessionError::StreamStalled)
    }

    /// Issued once a scan reaches a terminal state, whether by completion
    /// or cancellation; best-effort, since a control link failure here
    /// does not change the session's outcome.
    fn send_stop_stream(&self) {
        let mut control = self.control.lock().unwrap();
        if control.send("STOP_STREAM", Map::new(), Duration::from_millis(200)).is_ok() {
            let _ = control.receive(Duration::from_millis(200));
        }
    }

    /// `Err(Session(Cancelled))` once `stop()` has been called; callers in
    /// `calibrate_clock`/`prefetch` use this to bail out of the
    /// pre-loop phases before the per-pattern loop's own cancellation
    /// check (line ~181) would otherwise be the first one reached (P7).
    fn check_cancelled(&self) -> Result<(), OrchestratorError> {
        if self.stop_flag.load(Ordering::SeqCst) {
            Err(SessionError::Cancelled.into())
        } else {
            Ok(())
        }
    }

    fn calibrate_clock(&self, stats: &mut ScanStats) -> Result<f64, OrchestratorError> {
        let mut rtts_ms = Vec::with_capacity(CALIBRATION_PING_COUNT as usize);
        let mut last_server_timestamp = None;
        let mut last_send_instant_s = 0.0;

        for attempt in 0..CALIBRATION_PING_COUNT {
            self.check_cancelled()?;
            if attempt > 0 {
                std::thread::sleep(PING_SPACING);
            }
            self.check_cancelled()?;
            let sent_at = now_seconds();
            let mut control = self.control.lock().unwrap();
            control.send("PING", Map::new(), Duration::from_millis(500))?;
            let reply = control.receive(Duration::from_millis(500))?;
            drop(control);
            let received_at = now_seconds();
            rtts_ms.push((received_at - sent_at) * 1000.0);
            last_server_timestamp = field_f64(&reply.fields, "timestamp");
            last_send_instant_s = sent_at;
        }

        self.check_cancelled()?;

        let baseline_rtt_ms = rtts_ms.into_iter().fold(f64::INFINITY, f64::min);
        let clock_offset_s = last_server_timestamp.map(|server_ts| server_ts - (last_send_instant_s + baseline_rtt_ms / 1000.0 / 2.0));
        stats.clock_offset_s = clock_offset_s;

        let mut payload = Map::new();
        payload.insert("baseline_rtt_ms".to_string(), Value::from(baseline_rtt_ms));
        payload.insert("client_timestamp".to_string(), Value::from(now_seconds()));
        let mut control = self.control.lock().unwrap();
        control.send("SYNC_CONFIG", payload, Duration::from_millis(500))?;
        let _ = control.receive(Duration::from_millis(500));
        drop(control);

        self.check_cancelled()?;
        Ok(baseline_rtt_ms)
    }

    /// Best-effort; failure is non-fatal (§4.8 step 2). Checks the
    /// cancellation flag before and after its one round trip so a `stop()`
    /// racing this phase is observed promptly by `run()` instead of only
    /// at the per-pattern loop's own check (P7).
    fn prefetch(&self, count: u32) {
        if self.stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let mut payload = Map::new();
        payload.insert("count".to_string(), Value::from(count));
        let mut control = self.control.lock().unwrap();
        if control.send("PREFETCH_PATTERNS", payload, Duration::from_millis(500)).is_ok() {
            let _ = control.receive(Duration::from_millis(500));
        }
    }

    /// Best-effort async prefetch of a single future pattern.
    fn request_prefetch(&self, pattern_index: i32) -> Result<(), OrchestratorError> {
        let mut payload = Map::new();
        payload.insert("pattern_index".to_string(), Value::from(pattern_index));
        payload.insert("priority".to_string(), Value::from("low"));
        payload.insert("async".to_string(), Value::from(true));
        let mut control = self.control.lock().unwrap();
        if control.send("PREFETCH_PATTERN", payload, Duration::from_millis(500)).is_ok() {
            let _ = control.receive(Duration::from_millis(500));
        }
        Ok(())
    }

    /// Issues `SYNC_PATTERN` once, retrying once more on failure as §4.8's
    /// failure table prescribes; resets the control link if both attempts
    /// fail and returns `None` so the caller skips this pattern.
    fn sync_pattern_with_retry(&self, pattern_index: i32, timeout: Duration) -> Option<Reply> {
        for attempt in 0..2 {
            match self.sync_pattern(pattern_index, timeout) {
                Ok(reply) => return Some(reply),
                Err(e) => {
                    warn!(pattern_index, attempt, error = %e, "SYNC_PATTERN failed");
                }
            }
        }
        let _ = self.control.lock().unwrap().reset();
        None
    }

    fn sync_pattern(&self, pattern_index: i32, timeout: Duration) -> Result<Reply, OrchestratorError> {
        let mut payload = Map::new();
        payload.insert("pattern_index".to_string(), Value::from(pattern_index));
        payload.insert("priority".to_string(), Value::from("high"));
        payload.insert("adaptive_timing".to_string(), Value::from(true));
        payload.insert("prefetch_next".to_string(), Value::from(true));

        let mut control = self.control.lock().unwrap();
        control.send("SYNC_PATTERN", payload, timeout)?;
        let reply = control.receive(timeout)?;
        if reply.status != ReplyStatus::Ok {
            return Err(SessionError::ProjectionDesynchronised(format!(
                "SYNC_PATTERN {pattern_index} replied with error status: {:?}",
                reply.message
            ))
            .into());
        }
        Ok(reply)
    }

    fn ensure_triangulator(&self, slot: &Mutex<Option<Arc<Triangulator>>>, config: &TriangulatorConfig) {
        let mut slot = slot.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let Some((white_l, white_r)) = self.frame_store.pair(0) else { return };
        let Some((black_l, black_r)) = self.frame_store.pair(1) else { return };
        match Triangulator::new(&self.calibration, (&white_l, &white_r), (&black_l, &black_r), config.clone()) {
            Ok(t) => *slot = Some(Arc::new(t)),
            Err(e) => {
                warn!(error = %e, "failed to prepare triangulator from reference frames");
                self.publish(Event::Error {
                    code: ErrorCode::Calibration,
                    message: format!("triangulator preparation failed: {e}"),
                });
            }
        }
    }

    /// Composes `{0, 1, complete indices > 1}` and submits it to the
    /// worker pool, if the triangulator is ready. Submission failures and
    /// missing pairs are logged, not propagated — a skipped batch is
    /// superseded by the next one (monotone refinement, P2).
    fn submit_batch(&self, slot: &Mutex<Option<Arc<Triangulator>>>, complete_indices: &[i32]) -> Option<TaskId> {
        let triangulator = slot.lock().unwrap().clone()?;
        if !complete_indices.contains(&0) || !complete_indices.contains(&1) {
            return None;
        }

        let mut patterns = Vec::with_capacity(complete_indices.len());
        for &idx in complete_indices {
            let (left, right) = self.frame_store.pair(idx)?;
            patterns.push((idx, left, right));
        }

        let on_event = self.on_event.clone();
        let latest_cloud = self.latest_cloud.clone();
        let result = self.worker_pool.submit(move || {
            triangulator
                .process_batch(&patterns)
                .map(|cloud| {
                    on_event(Event::PointCloudUpdated {
                        point_count: cloud.len(),
                        timestamp: now_seconds(),
                    });
                    *latest_cloud.lock().unwrap() = Some(cloud.clone());
                    cloud
                })
                .map_err(|e| e.to_string())
        });

        match result {
            Ok(task_id) => Some(task_id),
            Err(e) => {
                warn!(error = %e, "failed to submit triangulation batch");
                None
            }
        }
    }

    fn drain_pending(&self, pending: &mut Vec<TaskId>) {
        for task_id in pending.drain(..) {
            match self.worker_pool.await_result(task_id, Duration::from_secs(30)) {
                Ok(_cloud) => {}
                Err(e) => warn!(error = %e, "triangulation task failed, batch skipped"),
            }
        }
    }

    /// Blocks while the worker pool's queue exceeds `4*W`, polling at
    /// `CANCEL_POLL_INTERVAL` so `stop()` remains responsive, and returns
    /// once it has drained below `2*W` (§5 backpressure policy).
    fn wait_out_backpressure(&self, worker_count: usize) {
        while self.worker_pool.pending_count() > 4 * worker_count {
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(CANCEL_POLL_INTERVAL);
            if self.worker_pool.pending_count() < 2 * worker_count {
                break;
            }
        }
    }

    fn publish(&self, event: Event) {
        (self.on_event)(event);
    }
}

fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn field_f64(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

/// `max(50ms, 2 * baseline_rtt_ms)` (§4.8 step 1).
fn adaptive_timeout(baseline_rtt_ms: f64) -> Duration {
    let ms = (2.0 * baseline_rtt_ms).max(MIN_ADAPTIVE_TIMEOUT_MS as f64);
    Duration::from_millis(ms as u64)
}

/// Nominal stabilisation wait, scaled by `quality` (1..5) and shortened by
/// however long the scanner reports the projection itself took, floored at
/// 50ms (§4.8 step 3a). The exact scaling §6.3 leaves unspecified beyond
/// "affects stabilisation multipliers"; this implementation uses a linear
/// 15%-per-quality-step multiplier (see DESIGN.md Open Questions for the
/// decision record).
fn stabilization_wait(quality: u8, projection_time_ms: Option<f64>) -> Duration {
    let multiplier = 0.7 + 0.15 * quality.clamp(1, 5) as f64;
    let base_ms = BASE_STABILIZATION_MS * multiplier;
    let reduced = (base_ms - projection_time_ms.unwrap_or(0.0)).max(MIN_STABILIZATION_MS);
    Duration::from_millis(reduced as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_timeout_applies_the_2x_floor_rule() {
        assert_eq!(adaptive_timeout(10.0), Duration::from_millis(50));
        assert_eq!(adaptive_timeout(100.0), Duration::from_millis(200));
    }

    #[test]
    fn stabilization_wait_is_shortened_by_reported_projection_time() {
        let without_hint = stabilization_wait(3, None);
        let with_hint = stabilization_wait(3, Some(100.0));
        assert!(with_hint < without_hint);
    }

    #[test]
    fn stabilization_wait_never_drops_below_the_floor() {
        let wait = stabilization_wait(1, Some(10_000.0));
        assert_eq!(wait, Duration::from_millis(MIN_STABILIZATION_MS as u64));
    }

    #[test]
    fn stabilization_wait_increases_with_quality() {
        let low = stabilization_wait(1, None);
        let high = stabilization_wait(5, None);
        assert!(high > low);
    }
}
