//! Shared data model for the scanning engine: frames, pattern slots,
//! reference frames, the disparity accumulator, point clouds and scan
//! session state. These types are owned by no single component; the Frame
//! Store, Triangulator, Orchestrator and Session Supervisor all read and
//! write them.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Opaque scan identity, assigned by the Session Supervisor at `start()`.
pub type ScanId = String;

/// Which physical camera a frame came from.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraIndex {
    Left = 0,
    Right = 1,
}

impl CameraIndex {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CameraIndex::Left),
            1 => Some(CameraIndex::Right),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded, immutable two-dimensional pixel grid.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// 1 (grayscale) or 3 (packed RGB/BGR); no automatic colour conversion.
    pub channels: u8,
    /// `width * height * channels` bytes, row-major.
    pub data: Vec<u8>,
    /// Seconds since the monotonic epoch shared with the scanner once the
    /// orchestrator has completed clock calibration.
    pub timestamp: f64,
}

impl Frame {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.expected_len() && (self.channels == 1 || self.channels == 3)
    }
}

/// Metadata carried alongside a frame's raw pixels, parsed from the stream
/// link's header part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub camera: CameraIndex,
    /// -1 for a live preview frame outside a scan session.
    pub pattern_index: i32,
    pub scan_id: Option<ScanId>,
    pub timestamp: f64,
    pub server_timestamp: Option<f64>,
    pub format: String,
    pub pattern_name: Option<String>,
    #[serde(default)]
    pub is_scan_frame: bool,
}

impl FrameHeader {
    pub fn is_preview(&self) -> bool {
        self.pattern_index < 0
    }
}

/// `(pattern_index -> {left, right, metadata, insertion_time})`. Complete
/// once both camera entries are present.
#[derive(Debug, Clone)]
pub struct PatternSlot {
    pub pattern_index: i32,
    pub left: Option<Frame>,
    pub right: Option<Frame>,
    pub header: Option<FrameHeader>,
    pub insertion_time: Instant,
}

impl PatternSlot {
    pub fn empty(pattern_index: i32) -> Self {
        Self {
            pattern_index,
            left: None,
            right: None,
            header: None,
            insertion_time: Instant::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    pub fn pair(&self) -> Option<(&Frame, &Frame)> {
        match (&self.left, &self.right) {
            (Some(l), Some(r)) => Some((l, r)),
            _ => None,
        }
    }
}

/// The white (index 0) and black (index 1) reference slots for a session.
#[derive(Debug, Clone)]
pub struct ReferenceFrames {
    pub white: PatternSlot,
    pub black: PatternSlot,
}

/// Intensity delta above which a pixel is considered lit by the projector.
pub const SHADOW_THRESHOLD: u8 = 40;

/// Per-camera binary mask of pixels the projector's light reaches.
#[derive(Debug, Clone)]
pub struct ShadowMask {
    pub width: u32,
    pub height: u32,
    pub mask: Vec<bool>,
}

impl ShadowMask {
    /// `mask[y, x] = white[y, x] - black[y, x] > SHADOW_THRESHOLD`. `white`
    /// and `black` must be single-channel frames of equal size.
    pub fn from_reference(white: &Frame, black: &Frame) -> Self {
        debug_assert_eq!(white.width, black.width);
        debug_assert_eq!(white.height, black.height);
        let mask = white
            .data
            .iter()
            .zip(black.data.iter())
            .map(|(&w, &b)| w.saturating_sub(b) > SHADOW_THRESHOLD)
            .collect();
        Self {
            width: white.width,
            height: white.height,
            mask,
        }
    }

    pub fn at(&self, y: u32, x: u32) -> bool {
        self.mask[(y * self.width + x) as usize]
    }
}

/// `w_p = 2^(pattern_index div 2)`: later patterns in the sequence carry
/// exponentially more weight, reflecting their finer spatial frequency.
/// Assumes a sequence where index 0 and 1 are the white/black references;
/// a differently-sequenced scanner must rebase this exponent.
pub fn pattern_weight(pattern_index: i32) -> f32 {
    2f32.powi(pattern_index / 2)
}

/// Running `sum`/`weight` rasters accumulated across patterns; final
/// disparity at a pixel is `sum / weight` where `weight > 0`.
#[derive(Debug, Clone)]
pub struct DisparityAccumulator {
    pub width: u32,
    pub height: u32,
    pub sum: Vec<f32>,
    pub weight: Vec<f32>,
}

impl DisparityAccumulator {
    pub fn new(width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Self {
            width,
            height,
            sum: vec![0.0; n],
            weight: vec![0.0; n],
        }
    }

    pub fn accumulate(&mut self, y: u32, x: u32, disparity: f32, pattern_index: i32) {
        let idx = (y * self.width + x) as usize;
        let w = pattern_weight(pattern_index);
        self.sum[idx] += disparity * w;
        self.weight[idx] += w;
    }

    /// `sum/weight` where `weight > 0`, else `0.0`.
    pub fn finalize(&self) -> Vec<f32> {
        self.sum
            .iter()
            .zip(self.weight.iter())
            .map(|(&s, &w)| if w > 0.0 { s / w } else { 0.0 })
            .collect()
    }
}

/// A single reconstructed surface point, in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// The side of the cube within which points are considered valid (`±500 mm`
/// per axis by default, see `ScopeConfig::clipping_cube_mm`).
pub fn within_clipping_cube(p: Point3, half_extent_mm: f32) -> bool {
    p.x.is_finite()
        && p.y.is_finite()
        && p.z.is_finite()
        && p.x.abs() <= half_extent_mm
        && p.y.abs() <= half_extent_mm
        && p.z.abs() <= half_extent_mm
}

/// Ordered 3D points with optional per-point confidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Point3>,
    pub confidences: Option<Vec<f32>>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Structured-light pattern family driving the orchestrator's per-pattern
/// matching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternFamily {
    Progressive,
    GrayCode,
    BinaryCode,
    /// Documented by the origin system but not required by this engine;
    /// selecting it is rejected by `ScopeConfig::validate`.
    PhaseShift,
}

impl Default for PatternFamily {
    fn default() -> Self {
        PatternFamily::Progressive
    }
}

/// `Idle -> Calibrating -> Prefetching -> Projecting(i) -> Awaiting(i) -> ...
/// -> Finalising -> Completed | Failed | Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Calibrating,
    Prefetching,
    Projecting,
    Awaiting,
    Finalising,
    Completed,
    Failed,
    Cancelled,
}

/// Running counters surfaced to the Session Supervisor and subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub frames_received: u64,
    pub patterns_completed: u32,
    pub last_projection_rtt_ms: Option<f64>,
    pub clock_offset_s: Option<f64>,
}

/// Per-session configuration plus monotone state, owned by the Session
/// Supervisor for the lifetime of one scan.
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub scan_id: ScanId,
    pub expected_pattern_count: u32,
    pub pattern_family: PatternFamily,
    pub exposure_time_s: f32,
    pub state: ScanState,
    pub stats: ScanStats,
    pub latest_point_cloud: Option<PointCloud>,
}

impl ScanSession {
    pub fn new(scan_id: ScanId, expected_pattern_count: u32, pattern_family: PatternFamily, exposure_time_s: f32) -> Self {
        Self {
            scan_id,
            expected_pattern_count,
            pattern_family,
            exposure_time_s,
            state: ScanState::Idle,
            stats: ScanStats::default(),
            latest_point_cloud: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_weight_doubles_every_two_indices() {
        assert_eq!(pattern_weight(0), 1.0);
        assert_eq!(pattern_weight(1), 1.0);
        assert_eq!(pattern_weight(2), 2.0);
        assert_eq!(pattern_weight(3), 2.0);
        assert_eq!(pattern_weight(4), 4.0);
    }

    #[test]
    fn disparity_accumulator_averages_weighted_contributions() {
        let mut acc = DisparityAccumulator::new(2, 1);
        acc.accumulate(0, 0, 10.0, 0); // weight 1
        acc.accumulate(0, 0, 20.0, 2); // weight 2
        let out = acc.finalize();
        assert!((out[0] - (10.0 + 40.0) / 3.0).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn shadow_mask_flags_pixels_above_threshold() {
        let white = Frame {
            width: 2,
            height: 1,
            channels: 1,
            data: vec![200, 50],
            timestamp: 0.0,
        };
        let black = Frame {
            width: 2,
            height: 1,
            channels: 1,
            data: vec![10, 40],
            timestamp: 0.0,
        };
        let mask = ShadowMask::from_reference(&white, &black);
        assert!(mask.at(0, 0));
        assert!(!mask.at(0, 1));
    }

    #[test]
    fn within_clipping_cube_rejects_nan_and_out_of_range() {
        assert!(within_clipping_cube(Point3 { x: 10.0, y: -10.0, z: 0.0 }, 500.0));
        assert!(!within_clipping_cube(Point3 { x: 501.0, y: 0.0, z: 0.0 }, 500.0));
        assert!(!within_clipping_cube(Point3 { x: f32::NAN, y: 0.0, z: 0.0 }, 500.0));
    }

    #[test]
    fn pattern_slot_pair_requires_both_cameras() {
        let mut slot = PatternSlot::empty(5);
        assert!(!slot.is_complete());
        slot.left = Some(Frame { width: 1, height: 1, channels: 1, data: vec![0], timestamp: 0.0 });
        assert!(slot.pair().is_none());
        slot.right = Some(Frame { width: 1, height: 1, channels: 1, data: vec![0], timestamp: 0.0 });
        assert!(slot.is_complete());
        assert!(slot.pair().is_some());
    }
}
