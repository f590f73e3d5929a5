//! Per-pattern disparity matching: the shadow-mask windowed intensity
//! matcher (progressive/binary-code families, §4.7 steps 1-3) and the
//! Gray-code Hamming-distance matcher (§4.7 "pattern-family variants").

use scope_core::types::{DisparityAccumulator, ShadowMask};

/// Maximum row-search window, in pixels, to the left of a candidate.
const SEARCH_WINDOW: u32 = 200;
/// Intensity-difference acceptance threshold on a 0-255 scale.
const INTENSITY_MATCH_THRESHOLD: i32 = 50;

/// Accumulates one pattern's contribution to `acc` using the windowed
/// intensity matcher. `left`/`right` are the full-image rectified
/// grayscale buffers; `acc` covers rows `[row_offset, row_offset +
/// acc.height)` of that full image.
pub fn accumulate_intensity_pattern(
    acc: &mut DisparityAccumulator,
    left: &[u8],
    right: &[u8],
    shadow_left: &ShadowMask,
    shadow_right: &ShadowMask,
    row_offset: u32,
    pattern_index: i32,
) {
    let width = acc.width;
    for local_y in 0..acc.height {
        let y = row_offset + local_y;
        for x in 0..width {
            if !shadow_left.at(y, x) {
                continue;
            }
            let val_l = left[(y * width + x) as usize];
            let min_x = x.saturating_sub(SEARCH_WINDOW);

            let mut best_x = None;
            let mut best_diff = i32::MAX;
            for x_r in min_x..x {
                if !shadow_right.at(y, x_r) {
                    continue;
                }
                let val_r = right[(y * width + x_r) as usize];
                let diff = (val_l as i32 - val_r as i32).abs();
                // Strict `<` keeps the first (smallest) x_r on ties.
                if diff < best_diff {
                    best_diff = diff;
                    best_x = Some(x_r);
                }
            }

            if let Some(x_r) = best_x {
                if best_diff < INTENSITY_MATCH_THRESHOLD {
                    let disparity = (x - x_r) as f32;
                    acc.accumulate(local_y, x, disparity, pattern_index);
                }
            }
        }
    }
}

/// Accumulates a batch of Gray-code bit-plane patterns by minimum Hamming
/// distance over the per-pixel bit stack. `codes_left`/`codes_right` are
/// parallel arrays of full-image rectified bit planes already thresholded
/// to `0`/`1` (one entry per bit); `acc` covers rows `[row_offset,
/// row_offset + acc.height)` of that full image. A match is accepted when
/// the minimum Hamming distance is below one quarter of the bit count.
pub fn accumulate_gray_code(
    acc: &mut DisparityAccumulator,
    codes_left: &[Vec<u8>],
    codes_right: &[Vec<u8>],
    shadow_left: &ShadowMask,
    shadow_right: &ShadowMask,
    row_offset: u32,
    pattern_index: i32,
) {
    let bit_count = codes_left.len();
    if bit_count == 0 || codes_right.len() != bit_count {
        return;
    }
    let width = acc.width;
    let threshold = (bit_count as u32).div_ceil(4);

    for local_y in 0..acc.height {
        let y = row_offset + local_y;
        for x in 0..width {
            if !shadow_left.at(y, x) {
                continue;
            }
            let min_x = x.saturating_sub(SEARCH_WINDOW);

            let mut best_x = None;
            let mut best_dist = u32::MAX;
            for x_r in min_x..x {
                if !shadow_right.at(y, x_r) {
                    continue;
                }
                let idx_l = (y * width + x) as usize;
                let idx_r = (y * width + x_r) as usize;
                let mut dist = 0u32;
                for bit in 0..bit_count {
                    if codes_left[bit][idx_l] != codes_right[bit][idx_r] {
                        dist += 1;
                    }
                }
                if dist < best_dist {
                    best_dist = dist;
                    best_x = Some(x_r);
                }
            }

            if let Some(x_r) = best_x {
                if best_dist < threshold {
                    let disparity = (x - x_r) as f32;
                    acc.accumulate(local_y, x, disparity, pattern_index);
                }
            }
        }
    }
}

/// Applies a 3x3 median filter to `disparity`, restricted to rows where
/// `weight` was ever nonzero (§4.7 finalisation step 2). Border pixels use
/// whatever subset of the 3x3 neighbourhood lies in bounds.
pub fn median_filter_active_rows(disparity: &[f32], weight: &[f32], width: u32, height: u32) -> Vec<f32> {
    let mut out = disparity.to_vec();
    for y in 0..height {
        let row_active = (0..width).any(|x| weight[(y * width + x) as usize] > 0.0);
        if !row_active {
            continue;
        }
        for x in 0..width {
            let mut window = Vec::with_capacity(9);
            for dy in -1i32..=1 {
                let yy = y as i32 + dy;
                if yy < 0 || yy >= height as i32 {
                    continue;
                }
                for dx in -1i32..=1 {
                    let xx = x as i32 + dx;
                    if xx < 0 || xx >= width as i32 {
                        continue;
                    }
                    window.push(disparity[(yy as u32 * width + xx as u32) as usize]);
                }
            }
            window.sort_by(|a, b| a.partial_cmp(b).unwrap());
            out[(y * width + x) as usize] = window[window.len() / 2];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::types::Frame;

    fn mask(width: u32, height: u32, lit: impl Fn(u32, u32) -> bool) -> ShadowMask {
        let mut m = vec![false; (width * height) as usize];
        for y in 0..height {
            for x in 0..width {
                m[(y * width + x) as usize] = lit(y, x);
            }
        }
        ShadowMask { width, height, mask: m }
    }

    #[test]
    fn accumulate_intensity_pattern_prefers_smallest_x_on_ties() {
        let width = 5;
        let height = 1;
        let mut acc = DisparityAccumulator::new(width, height);
        let left = vec![100u8, 100, 100, 100, 100];
        // x_r=0 and x_r=1 both tie at diff=0 against left pixel x=4; the
        // matcher must keep the first (smallest) x_r it sees, i.e. the
        // largest resulting disparity (4 - 0 = 4, not 4 - 1 = 3).
        let right = vec![100u8, 100, 50, 100, 50];
        let shadow_l = mask(width, height, |_, _| true);
        let shadow_r = mask(width, height, |_, _| true);

        accumulate_intensity_pattern(&mut acc, &left, &right, &shadow_l, &shadow_r, 0, 0);

        let disparity = acc.finalize();
        assert_eq!(disparity[4], 4.0);
    }

    #[test]
    fn accumulate_intensity_pattern_skips_pixels_outside_shadow() {
        let width = 3;
        let height = 1;
        let mut acc = DisparityAccumulator::new(width, height);
        let left = vec![10u8, 10, 10];
        let right = vec![10u8, 10, 10];
        let shadow_l = mask(width, height, |_, x| x != 2);
        let shadow_r = mask(width, height, |_, _| true);

        accumulate_intensity_pattern(&mut acc, &left, &right, &shadow_l, &shadow_r, 0, 0);
        let disparity = acc.finalize();
        assert_eq!(disparity[2], 0.0);
    }

    #[test]
    fn accumulate_gray_code_accepts_close_hamming_matches() {
        let width = 3;
        let height = 1;
        let mut acc = DisparityAccumulator::new(width, height);
        // 4-bit code, threshold = ceil(4/4) = 1: only an exact (dist=0)
        // match is accepted. Left pixel x=2 has code [1,0,1,0]; right
        // pixel x_r=1 carries the same code, x_r=0 does not.
        let codes_left = vec![
            vec![0u8, 0, 1],
            vec![0u8, 0, 0],
            vec![0u8, 0, 1],
            vec![0u8, 0, 0],
        ];
        let codes_right = vec![
            vec![0u8, 1, 0],
            vec![0u8, 0, 0],
            vec![0u8, 1, 0],
            vec![0u8, 0, 0],
        ];
        let shadow_l = mask(width, height, |_, _| true);
        let shadow_r = mask(width, height, |_, _| true);

        accumulate_gray_code(&mut acc, &codes_left, &codes_right, &shadow_l, &shadow_r, 0, 2);
        let disparity = acc.finalize();
        // Best match is x_r=1 (exact code match), disparity = 2 - 1 = 1.
        assert_eq!(disparity[2], 1.0);
    }

    #[test]
    fn median_filter_only_touches_rows_with_nonzero_weight() {
        let width = 3;
        let height = 2;
        let disparity = vec![5.0, 100.0, 5.0, 1.0, 1.0, 1.0];
        let weight = vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        let out = median_filter_active_rows(&disparity, &weight, width, height);
        // Row 0 is filtered (median of its neighbourhood); row 1 untouched.
        assert_eq!(out[3..6], [1.0, 1.0, 1.0]);
        assert_ne!(out[1], 100.0);
    }
}
