//! Frame Store (C4): a bounded, pattern-indexed left/right pairing buffer.
//! All operations are guarded by a single internal lock, never held across
//! a heavyweight copy — snapshot reads clone the frames they need outside
//! the critical section.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use scope_core::error::StoreError;
use scope_core::types::{CameraIndex, Frame, FrameHeader, PatternSlot};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStoreStats {
    pub slot_count: usize,
    pub complete_count: usize,
    pub bytes_resident: usize,
}

struct Inner {
    slots: BTreeMap<i32, PatternSlot>,
    /// Insertion order of pattern indices, for FIFO eviction. An index
    /// appears at most once; re-insertion into an existing slot does not
    /// move it.
    insertion_order: VecDeque<i32>,
}

pub struct FrameStore {
    inner: Mutex<Inner>,
    capacity: usize,
    /// When a frame (of any camera/pattern) was last inserted. Distinct
    /// from any one slot's `insertion_time`: this is what the orchestrator
    /// polls to detect stream inactivity (§4.8 failure table).
    last_activity: Mutex<Instant>,
}

impl FrameStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: BTreeMap::new(),
                insertion_order: VecDeque::new(),
            }),
            capacity,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Time elapsed since the last successful `insert`, measured from
    /// construction if nothing has ever been inserted.
    pub fn time_since_last_activity(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Inserts a frame for `(pattern_index, camera)`. Evicts the
    /// oldest-inserted non-pinned slot if the store would exceed capacity;
    /// fails with `CapacityExceededWhilePinned` if every slot eligible for
    /// eviction is pinned (indices 0 and 1).
    pub fn insert(
        &self,
        camera: CameraIndex,
        pattern_index: i32,
        frame: Frame,
        header: FrameHeader,
    ) -> Result<InsertOutcome, StoreError> {
        *self.last_activity.lock().unwrap() = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let is_new_slot = !inner.slots.contains_key(&pattern_index);
        if is_new_slot {
            inner
                .slots
                .insert(pattern_index, PatternSlot::empty(pattern_index));
            inner.insertion_order.push_back(pattern_index);
        }

        {
            let slot = inner.slots.get_mut(&pattern_index).unwrap();
            let existing = match camera {
                CameraIndex::Left => &slot.left,
                CameraIndex::Right => &slot.right,
            };
            if let Some(existing) = existing {
                if existing.width != frame.width || existing.height != frame.height {
                    warn!(
                        pattern_index,
                        "frame size changed after first insertion ({}x{} -> {}x{})",
                        existing.width,
                        existing.height,
                        frame.width,
                        frame.height
                    );
                }
            }
            match camera {
                CameraIndex::Left => slot.left = Some(frame),
                CameraIndex::Right => slot.right = Some(frame),
            }
            slot.header = Some(header);
        }

        if is_new_slot && inner.slots.len() > self.capacity {
            self.evict_one(&mut inner)?;
        }

        Ok(if is_new_slot {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Updated
        })
    }

    fn evict_one(&self, inner: &mut Inner) -> Result<(), StoreError> {
        let victim = inner
            .insertion_order
            .iter()
            .position(|&idx| idx != 0 && idx != 1)
            .map(|pos| inner.insertion_order.remove(pos).unwrap());

        match victim {
            Some(idx) => {
                inner.slots.remove(&idx);
                debug!(pattern_index = idx, "evicted slot (capacity exceeded)");
                Ok(())
            }
            None => Err(StoreError::CapacityExceededWhilePinned),
        }
    }

    /// Clones of the left/right frames for a complete pattern slot.
    pub fn pair(&self, pattern_index: i32) -> Option<(Frame, Frame)> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.slots.get(&pattern_index)?;
        match (&slot.left, &slot.right) {
            (Some(l), Some(r)) => Some((l.clone(), r.clone())),
            _ => None,
        }
    }

    pub fn has_pair(&self, pattern_index: i32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .slots
            .get(&pattern_index)
            .map(PatternSlot::is_complete)
            .unwrap_or(false)
    }

    /// Pattern indices with both cameras present, ascending.
    pub fn complete_indices(&self) -> Vec<i32> {
        self.inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_complete())
            .map(|(&idx, _)| idx)
            .collect()
    }

    pub fn remove(&self, pattern_index: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.remove(&pattern_index);
        inner.insertion_order.retain(|&idx| idx != pattern_index);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.clear();
        inner.insertion_order.clear();
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> FrameStoreStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = FrameStoreStats {
            slot_count: inner.slots.len(),
            ..Default::default()
        };
        for slot in inner.slots.values() {
            if slot.is_complete() {
                stats.complete_count += 1;
            }
            if let Some(l) = &slot.left {
                stats.bytes_resident += l.data.len();
            }
            if let Some(r) = &slot.right {
                stats.bytes_resident += r.data.len();
            }
        }
        stats
    }

    /// Drops every slot whose index is not in `keep_set`. Does not itself
    /// enforce the 0/1 pinning convention — the Memory Governor's default
    /// `keep_set` already includes them.
    pub fn reclaim(&self, keep_set: &HashSet<i32>) {
        let mut inner = self.inner.lock().unwrap();
        let dropped: Vec<i32> = inner
            .slots
            .keys()
            .filter(|idx| !keep_set.contains(idx))
            .copied()
            .collect();
        for idx in &dropped {
            inner.slots.remove(idx);
        }
        inner.insertion_order.retain(|idx| keep_set.contains(idx));
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "reclaimed slots under memory pressure");
        }
    }

    /// `{0, 1} ∪ last 4 complete indices`, the default `keep_set` passed
    /// to [`reclaim`](Self::reclaim).
    pub fn default_keep_set(&self) -> HashSet<i32> {
        let mut keep: HashSet<i32> = [0, 1].into_iter().collect();
        let mut complete = self.complete_indices();
        complete.sort_unstable();
        for idx in complete.into_iter().rev().take(4) {
            keep.insert(idx);
        }
        keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32) -> Frame {
        Frame {
            width: w,
            height: h,
            channels: 1,
            data: vec![0; (w * h) as usize],
            timestamp: 0.0,
        }
    }

    fn header(camera: CameraIndex, pattern_index: i32) -> FrameHeader {
        FrameHeader {
            camera,
            pattern_index,
            scan_id: None,
            timestamp: 0.0,
            server_timestamp: None,
            format: "jpeg".to_string(),
            pattern_name: None,
            is_scan_frame: true,
        }
    }

    #[test]
    fn insert_reports_inserted_then_updated() {
        let store = FrameStore::new(10);
        let outcome = store
            .insert(CameraIndex::Left, 5, frame(4, 4), header(CameraIndex::Left, 5))
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let outcome = store
            .insert(CameraIndex::Right, 5, frame(4, 4), header(CameraIndex::Right, 5))
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Updated);
        assert!(store.has_pair(5));
    }

    #[test]
    fn complete_indices_only_counts_full_pairs() {
        let store = FrameStore::new(10);
        store
            .insert(CameraIndex::Left, 2, frame(2, 2), header(CameraIndex::Left, 2))
            .unwrap();
        store
            .insert(CameraIndex::Left, 3, frame(2, 2), header(CameraIndex::Left, 3))
            .unwrap();
        store
            .insert(CameraIndex::Right, 3, frame(2, 2), header(CameraIndex::Right, 3))
            .unwrap();
        assert_eq!(store.complete_indices(), vec![3]);
    }

    #[test]
    fn capacity_exceeded_evicts_oldest_non_pinned_slot() {
        let store = FrameStore::new(3);
        for idx in 0..3 {
            store
                .insert(CameraIndex::Left, idx, frame(1, 1), header(CameraIndex::Left, idx))
                .unwrap();
        }
        // slots {0,1,2} fill capacity 3 exactly; inserting 3 forces an
        // eviction. 0 and 1 are pinned, so the oldest evictable slot is 2.
        store
            .insert(CameraIndex::Left, 3, frame(1, 1), header(CameraIndex::Left, 3))
            .unwrap();
        assert_eq!(store.len(), 3);
        assert!(store.pair(2).is_none());
        assert!(!store.has_pair(0));
    }

    #[test]
    fn pinned_only_store_reports_capacity_exceeded() {
        let store = FrameStore::new(1);
        store
            .insert(CameraIndex::Left, 0, frame(1, 1), header(CameraIndex::Left, 0))
            .unwrap();
        let err = store
            .insert(CameraIndex::Left, 1, frame(1, 1), header(CameraIndex::Left, 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceededWhilePinned));
    }

    #[test]
    fn reclaim_drops_everything_outside_the_keep_set() {
        let store = FrameStore::new(10);
        for idx in 0..5 {
            store
                .insert(CameraIndex::Left, idx, frame(1, 1), header(CameraIndex::Left, idx))
                .unwrap();
        }
        let keep: HashSet<i32> = [0, 1].into_iter().collect();
        store.reclaim(&keep);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn insert_resets_time_since_last_activity() {
        let store = FrameStore::new(10);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(store.time_since_last_activity() >= std::time::Duration::from_millis(20));
        store
            .insert(CameraIndex::Left, 0, frame(1, 1), header(CameraIndex::Left, 0))
            .unwrap();
        assert!(store.time_since_last_activity() < std::time::Duration::from_millis(20));
    }

    #[test]
    fn default_keep_set_includes_pins_and_recent_complete_indices() {
        let store = FrameStore::new(20);
        for idx in 0..10 {
            store
                .insert(CameraIndex::Left, idx, frame(1, 1), header(CameraIndex::Left, idx))
                .unwrap();
            store
                .insert(CameraIndex::Right, idx, frame(1, 1), header(CameraIndex::Right, idx))
                .unwrap();
        }
        let keep = store.default_keep_set();
        assert!(keep.contains(&0));
        assert!(keep.contains(&1));
        assert_eq!(keep.len(), 6); // {0,1} + last 4 complete (6,7,8,9)
        assert!(keep.contains(&9));
    }
}
