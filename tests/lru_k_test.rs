//! Integration tests for the LRU-K replacer

use keeldb::buffer::LruKReplacer;
use keeldb::common::FrameId;

#[test]
fn test_lru_k_eviction_order() {
    let replacer = LruKReplacer::new(2, 10);

    for i in 0..5 {
        replacer.record_access(FrameId::new(i)).unwrap();
        replacer.set_evictable(FrameId::new(i), true).unwrap();
    }

    assert_eq!(replacer.size(), 5);

    // All frames have a single access (< k=2), so all have +inf distance:
    // eviction follows the earliest first access.
    for i in 0..5 {
        assert_eq!(replacer.evict(), Some(FrameId::new(i)));
    }

    assert_eq!(replacer.size(), 0);
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lru_k_respects_k_distance() {
    let replacer = LruKReplacer::new(2, 10);

    // Frame 0: accessed once (+inf k-distance)
    replacer.record_access(FrameId::new(0)).unwrap();

    // Frames 1 and 2: accessed twice each, frame 1 earlier
    replacer.record_access(FrameId::new(1)).unwrap();
    replacer.record_access(FrameId::new(1)).unwrap();
    replacer.record_access(FrameId::new(2)).unwrap();
    replacer.record_access(FrameId::new(2)).unwrap();

    replacer.set_evictable(FrameId::new(0), true).unwrap();
    replacer.set_evictable(FrameId::new(1), true).unwrap();
    replacer.set_evictable(FrameId::new(2), true).unwrap();

    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), Some(FrameId::new(2)));
}

#[test]
fn test_lru_k_reaccess_changes_order() {
    // Frames 1, 2, 3 accessed once each: 1 is evicted first as the oldest
    // single-access frame. A second access to 2 gives it a finite
    // k-distance, so 3 (still +inf) goes before 2.
    let replacer = LruKReplacer::new(2, 10);

    for i in [1, 2, 3] {
        replacer.record_access(FrameId::new(i)).unwrap();
        replacer.set_evictable(FrameId::new(i), true).unwrap();
    }

    assert_eq!(replacer.evict(), Some(FrameId::new(1)));

    replacer.record_access(FrameId::new(2)).unwrap();
    assert_eq!(replacer.evict(), Some(FrameId::new(3)));
    assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lru_k_pinned_frames_not_evicted() {
    let replacer = LruKReplacer::new(2, 10);

    replacer.record_access(FrameId::new(0)).unwrap();
    replacer.record_access(FrameId::new(1)).unwrap();
    replacer.record_access(FrameId::new(2)).unwrap();

    replacer.set_evictable(FrameId::new(1), true).unwrap();
    replacer.set_evictable(FrameId::new(2), true).unwrap();

    assert_eq!(replacer.size(), 2);

    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lru_k_size_tracks_evictable_count() {
    let replacer = LruKReplacer::new(3, 16);

    for i in 0..8 {
        replacer.record_access(FrameId::new(i)).unwrap();
    }
    assert_eq!(replacer.size(), 0);

    for i in 0..8 {
        replacer.set_evictable(FrameId::new(i), true).unwrap();
        assert_eq!(replacer.size(), (i + 1) as usize);
    }

    for i in 0..4 {
        replacer.set_evictable(FrameId::new(i), false).unwrap();
    }
    assert_eq!(replacer.size(), 4);

    replacer.remove(FrameId::new(7)).unwrap();
    assert_eq!(replacer.size(), 3);
}
