//! Component C7: rectify a pattern batch, disparity-match it, reproject to
//! 3D and filter the result into a point cloud. Rectification maps, shadow
//! masks and the reprojection matrix are computed once in
//! [`Triangulator::new`] from a [`scope_calibration::StereoCalibration`]
//! and the session's white/black reference frames (§4.7); `process_batch`
//! and `process_batch_parallel` then repeat the same per-pixel pipeline
//! for every subsequent pattern batch, the latter fanning stripes out to a
//! [`scope_worker_pool::WorkerPool`].

mod matcher;
mod outlier;
mod rectify;
mod reproject;

use std::sync::Arc;
use std::time::Duration;

use scope_calibration::StereoCalibration;
use scope_core::error::WorkerError;
use scope_core::types::{
    within_clipping_cube, DisparityAccumulator, Frame, PatternFamily, Point3, PointCloud, ShadowMask,
};
use scope_rectifier::{RectifyError, Rectifier};
use scope_worker_pool::WorkerPool;

#[derive(thiserror::Error, Debug)]
pub enum TriangulatorError {
    #[error("rectification failed: {0}")]
    Rectify(#[from] RectifyError),
    #[error("{0:?} pattern family is not supported by this engine")]
    UnsupportedPatternFamily(PatternFamily),
    #[error("reference or pattern frame is not well-formed, or does not match the session's image size")]
    MalformedFrame,
    #[error("pattern batch is missing the white (index 0) / black (index 1) reference pair")]
    MissingReferencePair,
    #[error("worker pool error: {0}")]
    Worker(#[from] WorkerError),
}

/// Tunables for the finalisation pipeline (§4.7 steps 4-6); defaults match
/// the origin system's fixed constants.
#[derive(Debug, Clone)]
pub struct TriangulatorConfig {
    pub clipping_cube_half_extent_mm: f32,
    pub outlier_knn: usize,
    pub outlier_sigma: f32,
    pub voxel_size_mm: f32,
    /// Number of horizontal stripes a batch is split into for
    /// [`Triangulator::process_batch_parallel`]. Ignored by the
    /// sequential [`Triangulator::process_batch`] only in that it still
    /// processes the same stripe ranges one at a time, to keep behaviour
    /// between the two entry points identical.
    pub stripe_count: u32,
    pub pattern_family: PatternFamily,
}

impl Default for TriangulatorConfig {
    fn default() -> Self {
        Self {
            clipping_cube_half_extent_mm: 500.0,
            outlier_knn: 20,
            outlier_sigma: 2.0,
            voxel_size_mm: 0.5,
            stripe_count: 4,
            pattern_family: PatternFamily::Progressive,
        }
    }
}

/// Owns the rectification maps, shadow masks and reprojection matrix for
/// one scan session's calibration, and turns pattern batches into point
/// clouds against them.
pub struct Triangulator {
    width: u32,
    height: u32,
    left_map_x: Vec<f32>,
    left_map_y: Vec<f32>,
    right_map_x: Vec<f32>,
    right_map_y: Vec<f32>,
    q: [[f64; 4]; 4],
    shadow_left: ShadowMask,
    shadow_right: ShadowMask,
    white_left_rect: Vec<u8>,
    black_left_rect: Vec<u8>,
    white_right_rect: Vec<u8>,
    black_right_rect: Vec<u8>,
    config: TriangulatorConfig,
}

impl Triangulator {
    /// `white`/`black` are the `(left, right)` reference frame pairs for
    /// pattern indices 0 and 1. Rectification and the shadow masks are
    /// computed once here and reused by every `process_batch*` call.
    pub fn new(
        cal: &StereoCalibration,
        white: (&Frame, &Frame),
        black: (&Frame, &Frame),
        config: TriangulatorConfig,
    ) -> Result<Self, TriangulatorError> {
        if config.pattern_family == PatternFamily::PhaseShift {
            return Err(TriangulatorError::UnsupportedPatternFamily(config.pattern_family));
        }

        let (white_left, white_right) = white;
        let (black_left, black_right) = black;
        for f in [white_left, white_right, black_left, black_right] {
            if !f.is_well_formed() {
                return Err(TriangulatorError::MalformedFrame);
            }
        }
        if white_left.width != white_right.width
            || white_left.height != white_right.height
            || white_left.width != black_left.width
            || white_left.height != black_left.height
            || white_left.width != black_right.width
            || white_left.height != black_right.height
        {
            return Err(TriangulatorError::MalformedFrame);
        }

        let width = white_left.width;
        let height = white_left.height;

        let rectifier = Rectifier::new(cal, width as i32, height as i32)?;
        let q = rectifier.q_array()?;
        let (left_map_x, left_map_y) = rectifier.left_maps()?;
        let (right_map_x, right_map_y) = rectifier.right_maps()?;

        let white_left_rect = rectify::remap_bilinear(&rectify::to_grayscale(white_left), width, height, &left_map_x, &left_map_y);
        let black_left_rect = rectify::remap_bilinear(&rectify::to_grayscale(black_left), width, height, &left_map_x, &left_map_y);
        let white_right_rect = rectify::remap_bilinear(&rectify::to_grayscale(white_right), width, height, &right_map_x, &right_map_y);
        let black_right_rect = rectify::remap_bilinear(&rectify::to_grayscale(black_right), width, height, &right_map_x, &right_map_y);

        let shadow_left = ShadowMask::from_reference(
            &gray_frame(width, height, white_left_rect.clone()),
            &gray_frame(width, height, black_left_rect.clone()),
        );
        let shadow_right = ShadowMask::from_reference(
            &gray_frame(width, height, white_right_rect.clone()),
            &gray_frame(width, height, black_right_rect.clone()),
        );

        Ok(Self {
            width,
            height,
            left_map_x,
            left_map_y,
            right_map_x,
            right_map_y,
            q,
            shadow_left,
            shadow_right,
            white_left_rect,
            black_left_rect,
            white_right_rect,
            black_right_rect,
            config,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Runs the full pipeline on one thread, stripe by stripe.
    pub fn process_batch(&self, patterns: &[(i32, Frame, Frame)]) -> Result<PointCloud, TriangulatorError> {
        self.validate_batch(patterns)?;
        let rectified = self.rectify_batch(patterns);

        let mut points = Vec::new();
        for (row_start, row_end) in stripe_ranges(self.height, self.config.stripe_count) {
            points.extend(compute_stripe(
                self.width,
                row_start,
                row_end,
                &rectified,
                &self.shadow_left,
                &self.shadow_right,
                self.config.pattern_family,
                &self.q,
                self.config.clipping_cube_half_extent_mm,
            ));
        }
        Ok(self.finalize(points))
    }

    /// Same pipeline, but each horizontal stripe is submitted as an
    /// independent task to `pool` (§4.7 "Parallelisation"). Rectification
    /// of the whole batch happens once up front on the calling thread;
    /// only per-stripe matching and reprojection run on worker threads.
    pub fn process_batch_parallel(
        &self,
        patterns: &[(i32, Frame, Frame)],
        pool: &WorkerPool<Vec<Point3>>,
    ) -> Result<PointCloud, TriangulatorError> {
        self.validate_batch(patterns)?;
        let rectified = Arc::new(self.rectify_batch(patterns));
        let shadow_left = Arc::new(self.shadow_left.clone());
        let shadow_right = Arc::new(self.shadow_right.clone());

        let width = self.width;
        let q = self.q;
        let pattern_family = self.config.pattern_family;
        let clip = self.config.clipping_cube_half_extent_mm;

        let mut task_ids = Vec::new();
        for (row_start, row_end) in stripe_ranges(self.height, self.config.stripe_count) {
            let rectified = rectified.clone();
            let shadow_left = shadow_left.clone();
            let shadow_right = shadow_right.clone();
            let task_id = pool
                .submit(move || {
                    Ok(compute_stripe(
                        width,
                        row_start,
                        row_end,
                        &rectified,
                        &shadow_left,
                        &shadow_right,
                        pattern_family,
                        &q,
                        clip,
                    ))
                })
                .map_err(TriangulatorError::Worker)?;
            task_ids.push(task_id);
        }

        let mut points = Vec::new();
        for task_id in task_ids {
            let stripe_points = pool
                .await_result(task_id, Duration::from_secs(30))
                .map_err(TriangulatorError::Worker)?;
            points.extend(stripe_points);
        }
        Ok(self.finalize(points))
    }

    fn validate_batch(&self, patterns: &[(i32, Frame, Frame)]) -> Result<(), TriangulatorError> {
        let has_white = patterns.iter().any(|(idx, _, _)| *idx == 0);
        let has_black = patterns.iter().any(|(idx, _, _)| *idx == 1);
        if !has_white || !has_black {
            return Err(TriangulatorError::MissingReferencePair);
        }
        for (_, left, right) in patterns {
            let size_ok = |f: &Frame| f.width == self.width && f.height == self.height;
            if !left.is_well_formed() || !right.is_well_formed() || !size_ok(left) || !size_ok(right) {
                return Err(TriangulatorError::MalformedFrame);
            }
        }
        Ok(())
    }

    fn rectify_pattern(&self, left: &Frame, right: &Frame) -> (Vec<u8>, Vec<u8>) {
        let l = rectify::remap_bilinear(&rectify::to_grayscale(left), self.width, self.height, &self.left_map_x, &self.left_map_y);
        let r = rectify::remap_bilinear(&rectify::to_grayscale(right), self.width, self.height, &self.right_map_x, &self.right_map_y);
        (l, r)
    }

    /// Rectifies every non-reference pattern (index > 1; 0/1 are already
    /// baked into the shadow masks) into plain buffers ready for matching.
    /// For [`PatternFamily::GrayCode`] the buffers are further thresholded
    /// into `0`/`1` bit planes against the rectified white/black
    /// references, since that family's matcher works on the bit stack
    /// rather than raw intensity.
    fn rectify_batch(&self, patterns: &[(i32, Frame, Frame)]) -> Vec<(i32, Arc<Vec<u8>>, Arc<Vec<u8>>)> {
        patterns
            .iter()
            .filter(|(idx, _, _)| *idx > 1)
            .map(|(idx, left, right)| {
                let (mut left_rect, mut right_rect) = self.rectify_pattern(left, right);
                if self.config.pattern_family == PatternFamily::GrayCode {
                    left_rect = threshold_bits(&left_rect, &self.white_left_rect, &self.black_left_rect);
                    right_rect = threshold_bits(&right_rect, &self.white_right_rect, &self.black_right_rect);
                }
                (*idx, Arc::new(left_rect), Arc::new(right_rect))
            })
            .collect()
    }

    fn finalize(&self, points: Vec<Point3>) -> PointCloud {
        let filtered = outlier::remove_statistical_outliers(points, self.config.outlier_knn, self.config.outlier_sigma);
        let downsampled = outlier::voxel_downsample_if_needed(filtered, self.config.voxel_size_mm);
        PointCloud {
            points: downsampled,
            confidences: None,
        }
    }
}

fn gray_frame(width: u32, height: u32, data: Vec<u8>) -> Frame {
    Frame {
        width,
        height,
        channels: 1,
        data,
        timestamp: 0.0,
    }
}

/// `1` where a rectified pixel sits closer to the white reference than the
/// black one, else `0`.
fn threshold_bits(pattern: &[u8], white: &[u8], black: &[u8]) -> Vec<u8> {
    pattern
        .iter()
        .zip(white.iter())
        .zip(black.iter())
        .map(|((&p, &w), &b)| if (p as u32) * 2 > w as u32 + b as u32 { 1 } else { 0 })
        .collect()
}

/// Splits `height` rows into up to `stripe_count` contiguous, roughly
/// equal ranges (the last stripes absorb the remainder).
fn stripe_ranges(height: u32, stripe_count: u32) -> Vec<(u32, u32)> {
    if height == 0 {
        return Vec::new();
    }
    let stripe_count = stripe_count.max(1).min(height);
    let base = height / stripe_count;
    let remainder = height % stripe_count;

    let mut ranges = Vec::with_capacity(stripe_count as usize);
    let mut start = 0;
    for i in 0..stripe_count {
        let extra = if i < remainder { 1 } else { 0 };
        let end = start + base + extra;
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Runs the matcher/median-filter/reproject/clip pipeline for one stripe
/// (`§4.7` steps 1-4), free of any `Triangulator` borrow so it can run
/// inside a `'static` worker-pool task.
#[allow(clippy::too_many_arguments)]
fn compute_stripe(
    width: u32,
    row_start: u32,
    row_end: u32,
    rectified: &[(i32, Arc<Vec<u8>>, Arc<Vec<u8>>)],
    shadow_left: &ShadowMask,
    shadow_right: &ShadowMask,
    pattern_family: PatternFamily,
    q: &[[f64; 4]; 4],
    clipping_cube_half_extent_mm: f32,
) -> Vec<Point3> {
    let stripe_height = row_end - row_start;
    let mut acc = DisparityAccumulator::new(width, stripe_height);

    match pattern_family {
        PatternFamily::Progressive | PatternFamily::BinaryCode => {
            for (index, left, right) in rectified {
                matcher::accumulate_intensity_pattern(&mut acc, left, right, shadow_left, shadow_right, row_start, *index);
            }
        }
        PatternFamily::GrayCode => {
            if !rectified.is_empty() {
                let codes_left: Vec<Vec<u8>> = rectified.iter().map(|(_, l, _)| l.as_ref().clone()).collect();
                let codes_right: Vec<Vec<u8>> = rectified.iter().map(|(_, _, r)| r.as_ref().clone()).collect();
                let last_index = rectified.iter().map(|(index, _, _)| *index).max().unwrap_or(0);
                matcher::accumulate_gray_code(&mut acc, &codes_left, &codes_right, shadow_left, shadow_right, row_start, last_index);
            }
        }
        PatternFamily::PhaseShift => unreachable!("phase-shift pattern family is rejected at Triangulator::new"),
    }

    let disparity = acc.finalize();
    let filtered = matcher::median_filter_active_rows(&disparity, &acc.weight, width, stripe_height);

    let mut points = Vec::with_capacity(filtered.len());
    for local_y in 0..stripe_height {
        let y = row_start + local_y;
        for x in 0..width {
            let idx = (local_y * width + x) as usize;
            if acc.weight[idx] <= 0.0 {
                continue;
            }
            let disparity = filtered[idx];
            if disparity <= 0.0 {
                continue;
            }
            if let Some(point) = reproject::reproject(q, x as f64, y as f64, disparity as f64) {
                if within_clipping_cube(point, clipping_cube_half_extent_mm) {
                    points.push(point);
                }
            }
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_ranges_cover_every_row_exactly_once() {
        let ranges = stripe_ranges(10, 3);
        assert_eq!(ranges, vec![(0, 4), (4, 7), (7, 10)]);
        let total: u32 = ranges.iter().map(|(s, e)| e - s).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn stripe_ranges_clamps_stripe_count_to_height() {
        let ranges = stripe_ranges(2, 8);
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn threshold_bits_follows_midpoint_of_white_and_black() {
        let pattern = vec![100u8, 150];
        let white = vec![200u8, 200];
        let black = vec![0u8, 0];
        assert_eq!(threshold_bits(&pattern, &white, &black), vec![0, 1]);
    }

    #[test]
    fn compute_stripe_reprojects_a_confident_pixel_within_the_clipping_cube() {
        let width = 5;
        let height = 1;
        let shadow_left = ShadowMask {
            width,
            height,
            mask: vec![true; (width * height) as usize],
        };
        let shadow_right = shadow_left.clone();
        let left = vec![10u8, 10, 10, 10, 200];
        let right = vec![200u8, 10, 10, 10, 10];
        let rectified = vec![(2i32, Arc::new(left), Arc::new(right))];
        let q = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 800.0],
            [0.0, 0.0, -1.0 / 60.0, 0.0],
        ];

        let points = compute_stripe(width, 0, height, &rectified, &shadow_left, &shadow_right, PatternFamily::Progressive, &q, 500.0);
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn new_rejects_phase_shift_pattern_family() {
        let cal = scope_calibration::StereoCalibration {
            left: scope_calibration::CameraIntrinsics {
                camera_matrix: [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]],
                dist_coeffs: [0.0; 5],
            },
            right: scope_calibration::CameraIntrinsics {
                camera_matrix: [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]],
                dist_coeffs: [0.0; 5],
            },
            extrinsics: scope_calibration::StereoExtrinsics {
                rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                translation: [-60.0, 0.0, 0.0],
            },
        };
        let frame = Frame {
            width: 4,
            height: 4,
            channels: 1,
            data: vec![0; 16],
            timestamp: 0.0,
        };
        let config = TriangulatorConfig {
            pattern_family: PatternFamily::PhaseShift,
            ..TriangulatorConfig::default()
        };
        let err = Triangulator::new(&cal, (&frame, &frame), (&frame, &frame), config).unwrap_err();
        assert!(matches!(err, TriangulatorError::UnsupportedPatternFamily(PatternFamily::PhaseShift)));
    }
}
