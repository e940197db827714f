use std::collections::HashSet;

use vyukovmap_rs::{NoBackoff, VyukovMap};

#[test]
fn test_emplace_get_extract_u64() {
    let m: VyukovMap<u64, u64> = VyukovMap::with_capacity(16);
    assert!(m.is_empty());

    // insert new
    assert!(m.emplace(1, 10));
    assert_eq!(m.len(), 1);
    assert_eq!(m.try_get(&1), Some(10));

    // insert another
    assert!(m.emplace(2, 20));
    assert_eq!(m.len(), 2);
    assert_eq!(m.try_get(&2), Some(20));

    // duplicate is rejected and leaves the old value
    assert!(!m.emplace(1, 11));
    assert_eq!(m.try_get(&1), Some(10));
    assert_eq!(m.len(), 2);

    // extract existing
    assert_eq!(m.extract(&2), Some(20));
    assert_eq!(m.len(), 1);
    assert_eq!(m.try_get(&2), None);
    assert_eq!(m.extract(&2), None);
}

#[test]
fn test_erase_and_contains() {
    let m: VyukovMap<i32, i32> = VyukovMap::new();
    assert!(!m.contains(&-5));
    assert!(!m.erase(&-5));

    assert!(m.emplace(-5, 7));
    assert!(m.contains(&-5));
    assert!(m.erase(&-5));
    assert!(!m.contains(&-5));
    assert!(!m.erase(&-5));

    // re-insert after erase
    assert!(m.emplace(-5, 9));
    assert_eq!(m.try_get(&-5), Some(9));
}

#[test]
fn test_zero_and_extreme_keys() {
    let m: VyukovMap<u64, u64> = VyukovMap::new();
    for k in [0, 1, u64::MAX, u64::MAX - 1, 1 << 63] {
        assert!(m.emplace(k, !k));
    }
    for k in [0, 1, u64::MAX, u64::MAX - 1, 1 << 63] {
        assert_eq!(m.try_get(&k), Some(!k));
    }
}

#[test]
fn test_four_byte_and_float_payloads() {
    let m: VyukovMap<u32, f32> = VyukovMap::new();
    assert!(m.emplace(3, 1.25));
    assert!(m.emplace(u32::MAX, -0.5));
    assert_eq!(m.try_get(&3), Some(1.25));
    assert_eq!(m.try_get(&u32::MAX), Some(-0.5));

    let c: VyukovMap<char, f64> = VyukovMap::new();
    assert!(c.emplace('ß', std::f64::consts::PI));
    assert_eq!(c.try_get(&'ß'), Some(std::f64::consts::PI));
    assert_eq!(c.try_get(&'s'), None);
}

#[test]
fn test_capacity_rounds_to_power_of_two() {
    let m: VyukovMap<u64, u64> = VyukovMap::with_capacity(100);
    assert_eq!(m.bucket_count(), 128);
    let m: VyukovMap<u64, u64> = VyukovMap::with_capacity(0);
    assert_eq!(m.bucket_count(), 1);
    let m: VyukovMap<u64, u64> = VyukovMap::new();
    assert_eq!(m.bucket_count(), 128);
}

#[test]
fn test_growth_keeps_all_entries() {
    // 128 buckets hold 384 entries inline; 500 must trigger at least one growth.
    let m: VyukovMap<u64, u64> = VyukovMap::with_capacity(128);
    for i in 0..500u64 {
        assert!(m.emplace(i, i * 3));
    }
    assert!(m.bucket_count() > 128);
    assert_eq!(m.len(), 500);
    for i in 0..500u64 {
        assert_eq!(m.try_get(&i), Some(i * 3), "key {i} lost");
    }
}

#[test]
fn test_grow_from_single_bucket() {
    let m: VyukovMap<u64, u64> = VyukovMap::with_capacity(1);
    for i in 0..10_000u64 {
        assert!(m.emplace(i, i));
    }
    assert!(m.bucket_count() >= 1024);
    for i in (0..10_000u64).step_by(2) {
        assert!(m.erase(&i));
    }
    for i in 0..10_000u64 {
        assert_eq!(m.contains(&i), i % 2 == 1);
    }
    assert_eq!(m.len(), 5_000);
}

#[test]
fn test_iter_traversal() {
    let m: VyukovMap<u64, u64> = VyukovMap::with_capacity(8);
    for i in 0..50u64 {
        m.emplace(i, i * 2);
    }

    let mut sum_keys = 0u64;
    let mut sum_vals = 0u64;
    for (k, v) in m.iter() {
        sum_keys += k;
        sum_vals += v;
    }

    assert_eq!(sum_keys, (0..50).sum());
    assert_eq!(sum_vals, (0..50).map(|i| i * 2).sum());
}

#[test]
fn test_iter_allows_writes_between_items() {
    let m: VyukovMap<u64, u64> = (0..64u64).map(|i| (i, i)).collect();
    let mut seen = HashSet::new();
    for (k, _) in &m {
        // no lock is held between items
        m.erase(&k);
        seen.insert(k);
    }
    assert_eq!(seen.len(), 64);
    assert!(m.is_empty());
}

#[test]
fn test_from_iter_and_extend() {
    let mut m: VyukovMap<u32, u32> = [(1, 1), (2, 2), (1, 100)].into_iter().collect();
    assert_eq!(m.len(), 2);
    assert_eq!(m.try_get(&1), Some(1));

    m.extend([(3, 3), (2, 200)]);
    assert_eq!(m.len(), 3);
    assert_eq!(m.try_get(&2), Some(2));
    assert_eq!(m.try_get(&3), Some(3));
}

#[test]
fn test_debug_and_default() {
    let m: VyukovMap<u32, u32> = VyukovMap::default();
    assert_eq!(format!("{m:?}"), "{}");
    m.emplace(4, 16);
    assert_eq!(format!("{m:?}"), "{4: 16}");
}

#[test]
fn test_custom_backoff_types() {
    let m: VyukovMap<u64, u64, ahash::RandomState, NoBackoff> =
        VyukovMap::with_hasher(ahash::RandomState::new());
    let s: VyukovMap<u64, u64, ahash::RandomState, crossbeam_utils::Backoff> =
        VyukovMap::with_capacity_and_hasher(4, ahash::RandomState::new());
    for i in 0..100u64 {
        assert!(m.emplace(i, i));
        assert!(s.emplace(i, i));
    }
    assert_eq!(m.len(), 100);
    assert_eq!(s.iter().count(), 100);
}
