use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, KeelError, Result, Timestamp};

/// Tracks access history for a single frame
#[derive(Debug)]
struct FrameAccessInfo {
    /// History of access timestamps (most recent at back)
    history: VecDeque<Timestamp>,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

impl FrameAccessInfo {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    /// Records an access at the given timestamp, keeping the last k entries
    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Returns the backward k-distance from the current timestamp.
    /// None means fewer than k recorded accesses (+inf distance).
    fn k_distance(&self, current_timestamp: Timestamp, k: usize) -> Option<Timestamp> {
        if self.history.len() < k {
            None
        } else {
            Some(current_timestamp - self.history[self.history.len() - k])
        }
    }

    /// Returns the earliest timestamp in the history
    fn earliest_timestamp(&self) -> Option<Timestamp> {
        self.history.front().copied()
    }
}

/// State shared by all replacer operations, serialized by one mutex
struct ReplacerState {
    /// Access information for each tracked frame
    frame_info: HashMap<FrameId, FrameAccessInfo>,
    /// Current timestamp (monotonically increasing)
    current_timestamp: Timestamp,
    /// Number of evictable frames
    num_evictable: usize,
}

/// LRU-K Replacement Policy
///
/// The LRU-K algorithm evicts the frame whose backward k-distance is the
/// maximum of all evictable frames. Backward k-distance is the difference
/// between the current timestamp and the timestamp of the kth previous
/// access.
///
/// A frame with fewer than k historical accesses has +inf backward
/// k-distance. If multiple frames have +inf backward k-distance, the
/// replacer evicts the frame with the earliest recorded access (classical
/// LRU among the under-k frames).
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer with the given k value and maximum
    /// frame count.
    pub fn new(k: usize, max_frames: usize) -> Self {
        Self {
            k,
            max_frames,
            state: Mutex::new(ReplacerState {
                frame_info: HashMap::new(),
                current_timestamp: 0,
                num_evictable: 0,
            }),
        }
    }

    /// Evicts the frame with the largest backward k-distance.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();

        if state.num_evictable == 0 {
            return None;
        }

        let current_ts = state.current_timestamp;

        let mut victim: Option<FrameId> = None;
        let mut victim_k_dist: Option<Timestamp> = None;
        let mut victim_earliest_ts: Option<Timestamp> = None;

        for (frame_id, info) in state.frame_info.iter() {
            if !info.is_evictable {
                continue;
            }

            let k_dist = info.k_distance(current_ts, self.k);
            let earliest_ts = info.earliest_timestamp();

            let should_replace = match (victim_k_dist, k_dist) {
                // Current victim has +inf, candidate has finite -> keep victim
                (None, Some(_)) => false,
                // Current victim has finite, candidate has +inf -> replace
                (Some(_), None) => true,
                // Both +inf -> earlier first access wins
                (None, None) => match (victim_earliest_ts, earliest_ts) {
                    (Some(v_ts), Some(c_ts)) => c_ts < v_ts,
                    (None, Some(_)) => true,
                    _ => false,
                },
                // Both finite -> larger k-distance wins
                (Some(v_dist), Some(c_dist)) => c_dist > v_dist,
            };

            if victim.is_none() || should_replace {
                victim = Some(*frame_id);
                victim_k_dist = k_dist;
                victim_earliest_ts = earliest_ts;
            }
        }

        if let Some(frame_id) = victim {
            state.frame_info.remove(&frame_id);
            state.num_evictable -= 1;
        }

        victim
    }

    /// Records that the given frame was accessed, creating its tracking
    /// node on first touch.
    pub fn record_access(&self, frame_id: FrameId) -> Result<()> {
        if frame_id.as_usize() >= self.max_frames {
            return Err(KeelError::FrameOutOfRange(frame_id));
        }

        let mut state = self.state.lock();
        state.current_timestamp += 1;
        let timestamp = state.current_timestamp;

        state
            .frame_info
            .entry(frame_id)
            .or_insert_with(FrameAccessInfo::new)
            .record_access(timestamp, self.k);

        Ok(())
    }

    /// Sets whether a frame is evictable. A no-op if the flag is unchanged;
    /// fails if the frame has never been accessed.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) -> Result<()> {
        if frame_id.as_usize() >= self.max_frames {
            return Err(KeelError::FrameOutOfRange(frame_id));
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let info = state
            .frame_info
            .get_mut(&frame_id)
            .ok_or(KeelError::FrameUnknown(frame_id))?;

        if info.is_evictable != is_evictable {
            info.is_evictable = is_evictable;
            if is_evictable {
                state.num_evictable += 1;
            } else {
                state.num_evictable -= 1;
            }
        }

        Ok(())
    }

    /// Removes an evictable frame from the replacer entirely.
    /// Removing a frame the replacer does not track is a no-op; removing a
    /// non-evictable frame is an error.
    pub fn remove(&self, frame_id: FrameId) -> Result<()> {
        let mut state = self.state.lock();

        let evictable = match state.frame_info.get(&frame_id) {
            None => return Ok(()),
            Some(info) => info.is_evictable,
        };
        if !evictable {
            return Err(KeelError::NotEvictable(frame_id));
        }

        state.frame_info.remove(&frame_id);
        state.num_evictable -= 1;
        Ok(())
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().num_evictable
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_replacer_new() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.k(), 2);
    }

    #[test]
    fn test_lru_k_replacer_evict_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_basic() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();
        replacer.record_access(FrameId::new(2)).unwrap();

        replacer.set_evictable(FrameId::new(0), true).unwrap();
        replacer.set_evictable(FrameId::new(1), true).unwrap();
        replacer.set_evictable(FrameId::new(2), true).unwrap();

        assert_eq!(replacer.size(), 3);

        // All have a single access (< k), so all have +inf distance;
        // the earliest first access goes first.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_lru_k_replacer_k_distance() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();

        replacer.set_evictable(FrameId::new(0), true).unwrap();
        replacer.set_evictable(FrameId::new(1), true).unwrap();

        // Frame 0 has k accesses, frame 1 only one; +inf loses first.
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    }

    #[test]
    fn test_lru_k_replacer_tie_break_after_reaccess() {
        // Frames 1, 2, 3 accessed once each; 1 is the oldest and evicted
        // first. A second access to 2 gives it a finite distance, so 3
        // (still +inf) goes next.
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(1)).unwrap();
        replacer.record_access(FrameId::new(2)).unwrap();
        replacer.record_access(FrameId::new(3)).unwrap();
        replacer.set_evictable(FrameId::new(1), true).unwrap();
        replacer.set_evictable(FrameId::new(2), true).unwrap();
        replacer.set_evictable(FrameId::new(3), true).unwrap();

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));

        replacer.record_access(FrameId::new(2)).unwrap();
        assert_eq!(replacer.evict(), Some(FrameId::new(3)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    }

    #[test]
    fn test_lru_k_replacer_largest_k_distance() {
        let replacer = LruKReplacer::new(2, 10);

        for frame in 0..3u32 {
            replacer.record_access(FrameId::new(frame)).unwrap();
            replacer.record_access(FrameId::new(frame)).unwrap();
        }

        replacer.set_evictable(FrameId::new(0), true).unwrap();
        replacer.set_evictable(FrameId::new(1), true).unwrap();
        replacer.set_evictable(FrameId::new(2), true).unwrap();

        // Frame 0's kth-most-recent access is the oldest.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    }

    #[test]
    fn test_lru_k_replacer_set_evictable_unknown_frame() {
        let replacer = LruKReplacer::new(2, 10);
        assert!(matches!(
            replacer.set_evictable(FrameId::new(0), true),
            Err(KeelError::FrameUnknown(_))
        ));
    }

    #[test]
    fn test_lru_k_replacer_out_of_range() {
        let replacer = LruKReplacer::new(2, 4);
        assert!(matches!(
            replacer.record_access(FrameId::new(4)),
            Err(KeelError::FrameOutOfRange(_))
        ));
        assert!(matches!(
            replacer.set_evictable(FrameId::new(7), true),
            Err(KeelError::FrameOutOfRange(_))
        ));
    }

    #[test]
    fn test_lru_k_replacer_remove() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.set_evictable(FrameId::new(0), true).unwrap();
        assert_eq!(replacer.size(), 1);

        replacer.remove(FrameId::new(0)).unwrap();
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        // Removing an untracked frame is a no-op.
        replacer.remove(FrameId::new(5)).unwrap();
    }

    #[test]
    fn test_lru_k_replacer_remove_not_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        assert!(matches!(
            replacer.remove(FrameId::new(0)),
            Err(KeelError::NotEvictable(_))
        ));
    }

    #[test]
    fn test_lru_k_replacer_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.set_evictable(FrameId::new(0), true).unwrap();
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false).unwrap();
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(FrameId::new(0), true).unwrap();
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }
}
