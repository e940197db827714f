use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch as epoch;
use vyukovmap_rs::{Managed, VyukovMap};

struct DropCounter {
    id: u64,
    drops: Arc<AtomicUsize>,
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn managed_get_and_extract_under_guard() {
    let map: VyukovMap<u64, Managed<String>> = VyukovMap::new();
    assert!(map.emplace(1, Managed::new("one".to_string())));
    assert!(map.emplace(2, "two".to_string().into()));

    let guard = epoch::pin();
    assert_eq!(map.get_in(&1, &guard).map(String::as_str), Some("one"));
    assert_eq!(map.get_in(&3, &guard), None);

    let removed = map.extract_in(&2, &guard);
    assert_eq!(removed.map(String::as_str), Some("two"));
    assert!(!map.contains(&2));
    // still readable while the guard is held
    assert_eq!(removed.unwrap(), "two");
    drop(guard);

    assert!(map.erase(&1));
    assert!(map.is_empty());
}

#[test]
fn managed_duplicate_emplace_drops_rejected_value() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: VyukovMap<u64, Managed<DropCounter>> = VyukovMap::new();

    let make = |id| {
        Managed::new(DropCounter {
            id,
            drops: drops.clone(),
        })
    };
    assert!(map.emplace(5, make(50)));
    assert!(!map.emplace(5, make(51)));
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    let guard = epoch::pin();
    assert_eq!(map.get_in(&5, &guard).map(|c| c.id), Some(50));
}

#[test]
fn managed_values_dropped_with_map() {
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let map: VyukovMap<u64, Managed<DropCounter>> = VyukovMap::with_capacity(2);
        for id in 0..100u64 {
            map.emplace(
                id,
                Managed::new(DropCounter {
                    id,
                    drops: drops.clone(),
                }),
            );
        }
        assert_eq!(map.len(), 100);
        let guard = epoch::pin();
        for id in 0..100u64 {
            assert_eq!(map.get_in(&id, &guard).map(|c| c.id), Some(id));
        }
    }
    // growth copies raw pointers, never the values, so each is dropped exactly once
    assert_eq!(drops.load(Ordering::Relaxed), 100);
}

#[test]
fn managed_values_through_cursor() {
    let map: VyukovMap<u32, Managed<Vec<u32>>> = VyukovMap::with_capacity(4);
    for k in 0..20u32 {
        map.emplace(k, Managed::new(vec![k; k as usize]));
    }

    let mut cursor = map.begin();
    let mut total = 0usize;
    while let Some(k) = cursor.key() {
        let v = cursor.value().unwrap();
        assert_eq!(v.len(), k as usize);
        total += v.len();
        if k % 2 == 0 {
            cursor.erase();
        } else {
            cursor.advance();
        }
    }
    drop(cursor);

    assert_eq!(total, (0..20).sum::<usize>());
    assert_eq!(map.len(), 10);
}

#[test]
#[should_panic(expected = "guard must come from crossbeam_epoch::pin()")]
fn guard_from_foreign_collector_is_rejected() {
    let map: VyukovMap<u64, Managed<String>> = VyukovMap::new();
    let collector = epoch::Collector::new();
    let handle = collector.register();
    let guard = handle.pin();
    let _ = map.get_in(&1, &guard);
}
