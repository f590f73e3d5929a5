//! Grayscale conversion and bilinear remap against a precomputed map,
//! operating directly on decoded frame bytes rather than `opencv::Mat` so
//! the per-pixel matching loop (§4.7 steps 1-3) stays in ordinary Rust.

use scope_core::types::Frame;

/// Converts a decoded frame to a single-channel byte buffer. 3-channel
/// frames are reduced with ITU-R BT.601 luma weights; 1-channel frames
/// pass through unchanged.
pub fn to_grayscale(frame: &Frame) -> Vec<u8> {
    if frame.channels == 1 {
        return frame.data.clone();
    }
    frame
        .data
        .chunks_exact(frame.channels as usize)
        .map(|px| {
            let r = px[0] as u32;
            let g = px[1] as u32;
            let b = px[2] as u32;
            ((r * 299 + g * 587 + b * 114) / 1000) as u8
        })
        .collect()
}

/// Remaps a grayscale buffer through `(map_x, map_y)` with bilinear
/// sampling, matching `INTER_LINEAR` with a zero border (out-of-bounds
/// source coordinates sample as 0, as `opencv::imgproc::remap` does with
/// `BORDER_CONSTANT`).
pub fn remap_bilinear(gray: &[u8], width: u32, height: u32, map_x: &[f32], map_y: &[f32]) -> Vec<u8> {
    let w = width as i32;
    let h = height as i32;
    let mut out = vec![0u8; (width * height) as usize];
    for idx in 0..out.len() {
        out[idx] = sample_bilinear(gray, w, h, map_x[idx], map_y[idx]);
    }
    out
}

fn sample_bilinear(gray: &[u8], w: i32, h: i32, sx: f32, sy: f32) -> u8 {
    if !sx.is_finite() || !sy.is_finite() || sx < 0.0 || sy < 0.0 || sx > (w - 1) as f32 || sy > (h - 1) as f32 {
        return 0;
    }
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let at = |x: i32, y: i32| gray[(y * w + x) as usize] as f32;
    let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
    let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_grayscale_passes_through_single_channel() {
        let frame = Frame {
            width: 2,
            height: 1,
            channels: 1,
            data: vec![10, 20],
            timestamp: 0.0,
        };
        assert_eq!(to_grayscale(&frame), vec![10, 20]);
    }

    #[test]
    fn to_grayscale_reduces_rgb_with_luma_weights() {
        let frame = Frame {
            width: 1,
            height: 1,
            channels: 3,
            data: vec![255, 255, 255],
            timestamp: 0.0,
        };
        assert_eq!(to_grayscale(&frame), vec![255]);
    }

    #[test]
    fn remap_bilinear_is_identity_for_an_identity_map() {
        let gray = vec![10u8, 20, 30, 40];
        let map_x = vec![0.0, 1.0, 0.0, 1.0];
        let map_y = vec![0.0, 0.0, 1.0, 1.0];
        let out = remap_bilinear(&gray, 2, 2, &map_x, &map_y);
        assert_eq!(out, gray);
    }

    #[test]
    fn remap_bilinear_interpolates_between_neighbours() {
        let gray = vec![0u8, 100, 0, 100];
        // Sample the midpoint between columns 0 and 1 on row 0.
        let map_x = vec![0.5];
        let map_y = vec![0.0];
        let out = remap_bilinear(&gray, 2, 2, &map_x, &map_y);
        assert_eq!(out, vec![50]);
    }

    #[test]
    fn remap_bilinear_returns_zero_out_of_bounds() {
        let gray = vec![10u8, 20, 30, 40];
        let map_x = vec![-1.0];
        let map_y = vec![0.0];
        let out = remap_bilinear(&gray, 2, 2, &map_x, &map_y);
        assert_eq!(out, vec![0]);
    }
}
