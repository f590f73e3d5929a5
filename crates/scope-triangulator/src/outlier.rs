//! Statistical outlier removal and voxel downsampling (§4.7 finalisation
//! steps 5-6). No crate in the retrieval pack implements point-cloud
//! spatial indexing, so the KD-tree and voxel grid here are hand-written;
//! see DESIGN.md.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use scope_core::types::Point3;

/// Above this many points, statistical outlier removal builds its KD-tree
/// on a random sample instead of the full cloud.
const MAX_KDTREE_POINTS: usize = 100_000;
/// Above this many points, the finaliser voxel-downsamples the result.
const VOXEL_DOWNSAMPLE_THRESHOLD: usize = 50_000;

struct KdNode {
    point: Point3,
    original_index: usize,
    axis: u8,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
}

/// A minimal 3D KD-tree supporting k-nearest-neighbour queries, built over
/// either the full cloud or a random subsample (§4.7 step 5).
struct KdTree {
    root: Option<Box<KdNode>>,
}

impl KdTree {
    fn build(points: &[Point3]) -> Self {
        let mut indexed: Vec<(usize, Point3)> = points.iter().copied().enumerate().collect();
        let root = Self::build_node(&mut indexed, 0);
        Self { root }
    }

    fn build_node(items: &mut [(usize, Point3)], depth: usize) -> Option<Box<KdNode>> {
        if items.is_empty() {
            return None;
        }
        let axis = (depth % 3) as u8;
        items.sort_by(|a, b| axis_value(a.1, axis).partial_cmp(&axis_value(b.1, axis)).unwrap());
        let mid = items.len() / 2;
        let (original_index, point) = items[mid];
        let (left_items, rest) = items.split_at_mut(mid);
        let right_items = &mut rest[1..];

        Some(Box::new(KdNode {
            point,
            original_index,
            axis,
            left: Self::build_node(left_items, depth + 1),
            right: Self::build_node(right_items, depth + 1),
        }))
    }

    /// Mean Euclidean distance from `query` to its `k` nearest neighbours
    /// in the tree (excluding an exact self-match at distance 0 when
    /// `query` is itself one of the tree's points).
    fn mean_knn_distance(&self, query: Point3, k: usize) -> f32 {
        let mut heap: Vec<f32> = Vec::with_capacity(k + 1);
        if let Some(root) = &self.root {
            Self::search(root, query, k, &mut heap);
        }
        heap.sort_by(|a, b| a.partial_cmp(b).unwrap());
        // Drop a single zero-distance self-match, if present.
        if let Some(first) = heap.first() {
            if *first == 0.0 {
                heap.remove(0);
            }
        }
        heap.truncate(k);
        if heap.is_empty() {
            return 0.0;
        }
        heap.iter().sum::<f32>() / heap.len() as f32
    }

    fn search(node: &KdNode, query: Point3, k: usize, heap: &mut Vec<f32>) {
        let d = dist(node.point, query);
        heap.push(d);
        heap.sort_by(|a, b| a.partial_cmp(b).unwrap());
        // Keep a small margin over k since a self-match may be pruned later.
        heap.truncate(k + 1);

        let query_val = axis_value(query, node.axis);
        let node_val = axis_value(node.point, node.axis);
        let (near, far) = if query_val < node_val {
            (&node.left, &node.right)
        } else {
            (&node.right, &node.left)
        };
        if let Some(near) = near {
            Self::search(near, query, k, heap);
        }
        let axis_dist = (query_val - node_val).abs();
        let worst = heap.last().copied().unwrap_or(f32::INFINITY);
        if axis_dist < worst || heap.len() < k + 1 {
            if let Some(far) = far {
                Self::search(far, query, k, heap);
            }
        }
        let _ = node.original_index;
    }
}

fn axis_value(p: Point3, axis: u8) -> f32 {
    match axis {
        0 => p.x,
        1 => p.y,
        _ => p.z,
    }
}

fn dist(a: Point3, b: Point3) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Drops points whose mean distance to their `knn` nearest neighbours
/// exceeds `mean + sigma * stddev` of that distribution across the cloud
/// (or a random 100k-point sample if larger, §4.7 step 5).
pub fn remove_statistical_outliers(points: Vec<Point3>, knn: usize, sigma: f32) -> Vec<Point3> {
    if points.len() <= knn {
        return points;
    }

    let sample: Vec<Point3> = if points.len() > MAX_KDTREE_POINTS {
        let mut rng = rand::rng();
        let mut indices: Vec<usize> = (0..points.len()).collect();
        indices.shuffle(&mut rng);
        indices.truncate(MAX_KDTREE_POINTS);
        indices.into_iter().map(|i| points[i]).collect()
    } else {
        points.clone()
    };

    let tree = KdTree::build(&sample);
    let mean_distances: Vec<f32> = points.iter().map(|&p| tree.mean_knn_distance(p, knn)).collect();

    let n = mean_distances.len() as f32;
    let mean: f32 = mean_distances.iter().sum::<f32>() / n;
    let variance: f32 = mean_distances.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / n;
    let stddev = variance.sqrt();
    let cutoff = mean + sigma * stddev;

    points
        .into_iter()
        .zip(mean_distances)
        .filter(|(_, d)| *d <= cutoff)
        .map(|(p, _)| p)
        .collect()
}

/// Buckets points by `floor((p - p_min) / voxel_size)` and keeps one
/// representative per bucket, when the cloud exceeds
/// [`VOXEL_DOWNSAMPLE_THRESHOLD`] (§4.7 step 6).
pub fn voxel_downsample_if_needed(points: Vec<Point3>, voxel_size_mm: f32) -> Vec<Point3> {
    if points.len() <= VOXEL_DOWNSAMPLE_THRESHOLD {
        return points;
    }
    voxel_downsample(points, voxel_size_mm)
}

pub fn voxel_downsample(points: Vec<Point3>, voxel_size_mm: f32) -> Vec<Point3> {
    if points.is_empty() || voxel_size_mm <= 0.0 {
        return points;
    }
    let (mut min_x, mut min_y, mut min_z) = (f32::INFINITY, f32::INFINITY, f32::INFINITY);
    for p in &points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        min_z = min_z.min(p.z);
    }

    let mut buckets: HashMap<(i64, i64, i64), Point3> = HashMap::new();
    for p in points {
        let key = (
            ((p.x - min_x) / voxel_size_mm).floor() as i64,
            ((p.y - min_y) / voxel_size_mm).floor() as i64,
            ((p.z - min_z) / voxel_size_mm).floor() as i64,
        );
        buckets.entry(key).or_insert(p);
    }
    buckets.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_statistical_outliers_drops_a_lone_far_point() {
        let mut points: Vec<Point3> = Vec::new();
        for i in 0..30 {
            let f = i as f32 * 0.1;
            points.push(Point3 { x: f, y: 0.0, z: 0.0 });
        }
        points.push(Point3 { x: 500.0, y: 500.0, z: 500.0 });

        let filtered = remove_statistical_outliers(points, 5, 2.0);
        assert!(!filtered.iter().any(|p| p.x == 500.0));
    }

    #[test]
    fn remove_statistical_outliers_is_a_no_op_below_knn_size() {
        let points = vec![Point3 { x: 0.0, y: 0.0, z: 0.0 }; 3];
        let filtered = remove_statistical_outliers(points.clone(), 20, 2.0);
        assert_eq!(filtered.len(), points.len());
    }

    #[test]
    fn voxel_downsample_keeps_one_point_per_bucket() {
        let points = vec![
            Point3 { x: 0.0, y: 0.0, z: 0.0 },
            Point3 { x: 0.1, y: 0.0, z: 0.0 },
            Point3 { x: 10.0, y: 0.0, z: 0.0 },
        ];
        let out = voxel_downsample(points, 0.5);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn voxel_downsample_if_needed_skips_small_clouds() {
        let points = vec![Point3 { x: 0.0, y: 0.0, z: 0.0 }; 10];
        let out = voxel_downsample_if_needed(points.clone(), 0.5);
        assert_eq!(out.len(), points.len());
    }
}
