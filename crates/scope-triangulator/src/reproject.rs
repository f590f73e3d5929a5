//! Homogeneous reprojection of `(x, y, disparity)` through the
//! reprojection matrix `Q` (§4.7 finalisation step 3).

use scope_core::types::Point3;

/// `[X, Y, Z, W]^T = Q * [x, y, disparity, 1]^T`, returned as `(X/W, Y/W,
/// Z/W)`. Returns `None` for a degenerate (near-zero) `W`, which the
/// caller's clipping-cube check would reject anyway via non-finite values.
pub fn reproject(q: &[[f64; 4]; 4], x: f64, y: f64, disparity: f64) -> Option<Point3> {
    let v = [x, y, disparity, 1.0];
    let mut out = [0.0f64; 4];
    for (i, row) in q.iter().enumerate() {
        out[i] = row[0] * v[0] + row[1] * v[1] + row[2] * v[2] + row[3] * v[3];
    }
    let w = out[3];
    if w.abs() < 1e-9 {
        return None;
    }
    let point = Point3 {
        x: (out[0] / w) as f32,
        y: (out[1] / w) as f32,
        z: (out[2] / w) as f32,
    };
    Some(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_like_q(f: f64, cx: f64, cy: f64, baseline: f64) -> [[f64; 4]; 4] {
        [
            [1.0, 0.0, 0.0, -cx],
            [0.0, 1.0, 0.0, -cy],
            [0.0, 0.0, 0.0, f],
            [0.0, 0.0, -1.0 / baseline, 0.0],
        ]
    }

    #[test]
    fn reproject_recovers_depth_from_disparity() {
        let q = identity_like_q(800.0, 320.0, 240.0, 60.0);
        let p = reproject(&q, 320.0, 240.0, 40.0).unwrap();
        // W = disparity / baseline = 40/60; Z = f/W = 800 / (40/60) = 1200.
        assert!((p.z - 1200.0).abs() < 1e-3);
        assert!(p.x.abs() < 1e-3);
        assert!(p.y.abs() < 1e-3);
    }

    #[test]
    fn reproject_rejects_degenerate_w() {
        let q = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
        ];
        assert!(reproject(&q, 1.0, 1.0, 0.0).is_none());
    }
}
