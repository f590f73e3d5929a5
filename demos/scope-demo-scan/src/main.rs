//! Synthetic happy-path scan (spec.md §8 scenario 1): insert a white/black
//! reference pair and a few structured-light pattern pairs into the frame
//! store, build a `Triangulator` from them, and run one batch through to a
//! point cloud — exercising C4, C5 and C7 wired together the way
//! `scope-orchestrator` would during a real session, without the network
//! links.

use std::sync::Arc;

use scope_calibration::{CameraIntrinsics, StereoCalibration, StereoExtrinsics};
use scope_core::types::{CameraIndex, Frame, FrameHeader, PatternFamily, Point3};
use scope_frame_store::FrameStore;
use scope_triangulator::{Triangulator, TriangulatorConfig};
use scope_worker_pool::WorkerPool;

type StripePool = WorkerPool<Vec<Point3>>;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
/// Constant shift baked into every right-camera frame below, so the
/// windowed intensity matcher has something to actually match against.
const DISPARITY_PX: u32 = 6;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("building synthetic calibration...");
    let calibration = synthetic_calibration();

    let frame_store = Arc::new(FrameStore::new(scope_frame_store::DEFAULT_CAPACITY));
    let worker_pool: Arc<StripePool> = Arc::new(WorkerPool::new(StripePool::default_worker_count()));

    println!("inserting reference frames (pattern 0 = white, pattern 1 = black)...");
    insert_pair(&frame_store, 0, white_frame(), white_frame());
    insert_pair(&frame_store, 1, black_frame(), black_frame());
    assert!(frame_store.has_pair(0) && frame_store.has_pair(1));

    let (white_left, white_right) = frame_store.pair(0).expect("reference pair 0 just inserted");
    let (black_left, black_right) = frame_store.pair(1).expect("reference pair 1 just inserted");

    println!("constructing triangulator from reference pairs...");
    let config = TriangulatorConfig {
        pattern_family: PatternFamily::Progressive,
        ..TriangulatorConfig::default()
    };
    let triangulator = Triangulator::new(
        &calibration,
        (&white_left, &white_right),
        (&black_left, &black_right),
        config,
    )?;

    // process_batch requires every batch to carry the white/black reference
    // pair alongside whichever new pattern indices it's composing (§4.8
    // step 3d), so both go in together here.
    let mut batch = vec![(0, white_left.clone(), white_right.clone()), (1, black_left.clone(), black_right.clone())];
    println!("inserting pattern frames 2..5...");
    for pattern_index in 2..6 {
        let (left, right) = stripe_pair(pattern_index);
        insert_pair(&frame_store, pattern_index, left.clone(), right.clone());
        batch.push((pattern_index, left, right));
    }

    println!("processing batch sequentially...");
    let cloud_sequential = triangulator.process_batch(&batch)?;
    println!("sequential pass produced {} points", cloud_sequential.len());

    println!("processing the same batch through the worker pool...");
    let cloud_parallel = triangulator.process_batch_parallel(&batch, &worker_pool)?;
    println!("parallel pass produced {} points", cloud_parallel.len());

    worker_pool.shutdown(true);
    println!("done.");
    Ok(())
}

fn insert_pair(store: &FrameStore, pattern_index: i32, left: Frame, right: Frame) {
    store
        .insert(CameraIndex::Left, pattern_index, left, header(CameraIndex::Left, pattern_index))
        .expect("store has room for this synthetic session");
    store
        .insert(CameraIndex::Right, pattern_index, right, header(CameraIndex::Right, pattern_index))
        .expect("store has room for this synthetic session");
}

fn header(camera: CameraIndex, pattern_index: i32) -> FrameHeader {
    FrameHeader {
        camera,
        pattern_index,
        scan_id: None,
        timestamp: pattern_index as f64 * 0.1,
        server_timestamp: None,
        format: "raw".to_string(),
        pattern_name: None,
        is_scan_frame: true,
    }
}

fn white_frame() -> Frame {
    solid_frame(230)
}

fn black_frame() -> Frame {
    solid_frame(20)
}

fn solid_frame(value: u8) -> Frame {
    Frame {
        width: WIDTH,
        height: HEIGHT,
        channels: 1,
        data: vec![value; (WIDTH * HEIGHT) as usize],
        timestamp: 0.0,
    }
}

/// A left/right pair with a vertical-stripe pattern in the left image and
/// the same pattern shifted right by `DISPARITY_PX` in the right image,
/// so the windowed intensity matcher recovers a roughly constant
/// disparity across the lit region.
fn stripe_pair(pattern_index: i32) -> (Frame, Frame) {
    let period = 8 + (pattern_index as u32 % 4) * 2;
    let mut left = vec![0u8; (WIDTH * HEIGHT) as usize];
    let mut right = vec![0u8; (WIDTH * HEIGHT) as usize];
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let lit = (x / period) % 2 == 0;
            left[(y * WIDTH + x) as usize] = if lit { 220 } else { 30 };
            let x_r = x.saturating_sub(DISPARITY_PX);
            let lit_r = (x_r / period) % 2 == 0;
            right[(y * WIDTH + x) as usize] = if lit_r { 220 } else { 30 };
        }
    }
    (
        Frame { width: WIDTH, height: HEIGHT, channels: 1, data: left, timestamp: 0.0 },
        Frame { width: WIDTH, height: HEIGHT, channels: 1, data: right, timestamp: 0.0 },
    )
}

fn synthetic_calibration() -> StereoCalibration {
    StereoCalibration {
        left: CameraIntrinsics {
            camera_matrix: [[800.0, 0.0, WIDTH as f64 / 2.0], [0.0, 800.0, HEIGHT as f64 / 2.0], [0.0, 0.0, 1.0]],
            dist_coeffs: [-0.1, 0.05, 0.001, 0.002, -0.01],
        },
        right: CameraIntrinsics {
            camera_matrix: [[805.0, 0.0, WIDTH as f64 / 2.0], [0.0, 805.0, HEIGHT as f64 / 2.0], [0.0, 0.0, 1.0]],
            dist_coeffs: [-0.1, 0.05, 0.001, 0.002, -0.01],
        },
        extrinsics: StereoExtrinsics {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [-60.0, 0.0, 0.0],
        },
    }
}
