//! Integration tests for rectification map construction and remap against a
//! synthetic calibration (no real stereo fixture is required: the maps are
//! exercised for shape and error behaviour, not photometric accuracy).

use opencv::core::{Mat, MatTraitConst, Size, CV_8UC3};
use opencv::prelude::*;
use scope_calibration::{CameraIntrinsics, StereoCalibration, StereoExtrinsics};
use scope_rectifier::{RectifyError, Rectifier};

fn sample_calibration() -> StereoCalibration {
    let intr = CameraIntrinsics {
        camera_matrix: [[800.0, 0.0, 320.0], [0.0, 800.0, 240.0], [0.0, 0.0, 1.0]],
        dist_coeffs: [0.0; 5],
    };
    StereoCalibration {
        left: intr.clone(),
        right: intr,
        extrinsics: StereoExtrinsics {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [-60.0, 0.0, 0.0],
        },
    }
}

#[test]
fn new_rejects_non_positive_size() {
    let cal = sample_calibration();
    let err = Rectifier::new(&cal, 0, 480).unwrap_err();
    assert!(matches!(err, RectifyError::Invalid(_)));
}

#[test]
fn new_builds_maps_matching_image_size() {
    let cal = sample_calibration();
    let rectifier = Rectifier::new(&cal, 640, 480).unwrap();

    assert_eq!(rectifier.image_size, Size::new(640, 480));
    let map_size = rectifier.map1x.size().unwrap();
    assert_eq!(map_size, Size::new(640, 480));
    assert_eq!(rectifier.q.rows(), 4);
    assert_eq!(rectifier.q.cols(), 4);
}

#[test]
fn rectify_pair_preserves_image_size() {
    let cal = sample_calibration();
    let rectifier = Rectifier::new(&cal, 640, 480).unwrap();

    let left = Mat::new_rows_cols_with_default(480, 640, CV_8UC3, opencv::core::Scalar::all(0.0))
        .unwrap();
    let right = left.clone();

    let (out_left, out_right) = rectifier.rectify_pair(&left, &right).unwrap();
    assert_eq!(out_left.size().unwrap(), Size::new(640, 480));
    assert_eq!(out_right.size().unwrap(), Size::new(640, 480));
}

#[test]
fn rectify_left_rejects_size_mismatch() {
    let cal = sample_calibration();
    let rectifier = Rectifier::new(&cal, 640, 480).unwrap();

    let wrong_size =
        Mat::new_rows_cols_with_default(240, 320, CV_8UC3, opencv::core::Scalar::all(0.0))
            .unwrap();

    let err = rectifier.rectify_left(&wrong_size).unwrap_err();
    assert!(matches!(err, RectifyError::Invalid(_)));
}

#[test]
fn left_rectification_map_is_identity_for_zero_distortion_and_aligned_baseline() {
    // P6: with zero distortion, identity original rotation, and a baseline
    // already lying along the x axis (the translation in
    // `sample_calibration`), the left camera needs no further rotation to
    // rectify — its map should reduce to the identity mapping within
    // sub-pixel tolerance.
    let cal = sample_calibration();
    let rectifier = Rectifier::new(&cal, 640, 480).unwrap();
    let (map_x, map_y) = rectifier.left_maps().unwrap();

    let mut max_err: f32 = 0.0;
    for y in (0..480).step_by(37) {
        for x in (0..640).step_by(37) {
            let idx = y * 640 + x;
            max_err = max_err.max((map_x[idx] - x as f32).abs());
            max_err = max_err.max((map_y[idx] - y as f32).abs());
        }
    }
    assert!(max_err < 1.0, "expected sub-pixel identity rectification, got max error {max_err}");
}

#[test]
fn q_array_and_maps_export_as_plain_rust_buffers() {
    let cal = sample_calibration();
    let rectifier = Rectifier::new(&cal, 640, 480).unwrap();

    let q = rectifier.q_array().unwrap();
    // Row 2, col 3 of Q is the focal length for a fronto-parallel rig.
    assert!(q[2][3] != 0.0);

    let (map_x, map_y) = rectifier.left_maps().unwrap();
    assert_eq!(map_x.len(), 640 * 480);
    assert_eq!(map_y.len(), 640 * 480);
}
