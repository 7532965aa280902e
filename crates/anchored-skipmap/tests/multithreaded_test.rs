#![allow(unused_crate_dependencies, reason = "These are tests, not the main crate.")]
#![allow(unused_imports, reason = "Depending on cfg, some are unused. Annoying to annotate.")]

use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use oorandom::Rand32;

use anchored_skipmap::{OrdSkipMap, SkipMap};


#[cfg(not(miri))]
const KEYS_PER_WRITER: u64 = 4_000;
#[cfg(miri)]
const KEYS_PER_WRITER: u64 = 60;

#[cfg(not(miri))]
const SHARED_KEYS: u32 = 1_000;
#[cfg(miri)]
const SHARED_KEYS: u32 = 40;

#[cfg(not(miri))]
const STRESS_OPERATIONS: u32 = 30_000;
#[cfg(miri)]
const STRESS_OPERATIONS: u32 = 300;


/// - Spawn four writers which insert disjoint, interleaved ranges of keys
/// - Wait for them all to finish
/// - Confirm the length, every entry's value, and the traversal order
#[test]
fn concurrent_inserts_of_disjoint_keys() {
    const WRITERS: u64 = 4;

    let map: OrdSkipMap<u64, u64> = OrdSkipMap::new_ordered();

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let map = &map;
            scope.spawn(move || {
                for step in 0..KEYS_PER_WRITER {
                    let key = writer + WRITERS * step;
                    map.insert(key, key * 3);
                }
            });
        }
    });

    let total = WRITERS * KEYS_PER_WRITER;
    assert_eq!(map.len(), total as usize);

    let mut expected_next = 0;
    map.for_each(|&key, &value| {
        assert_eq!(key, expected_next);
        assert_eq!(value, key * 3);
        expected_next += 1;
        true
    });
    assert_eq!(expected_next, total);
}

/// - Spawn four writers which all insert the same range of keys, with their own id as
///   the value, racing as tightly as a barrier can arrange
/// - Confirm each key ends up present exactly once, holding one of the writers' ids
#[test]
fn racing_writers_on_shared_keys() {
    const WRITERS: u32 = 4;

    let map: OrdSkipMap<u32, u32> = OrdSkipMap::new_ordered();
    let barrier = Barrier::new(WRITERS as usize);

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let map = &map;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for key in 0..SHARED_KEYS {
                    map.insert(key, writer);
                }
            });
        }
    });

    assert_eq!(map.len(), SHARED_KEYS as usize);

    let mut expected_next = 0;
    map.for_each(|&key, &value| {
        assert_eq!(key, expected_next);
        assert!(value < WRITERS);
        expected_next += 1;
        true
    });
    assert_eq!(expected_next, SHARED_KEYS);
}

/// - Fill the map, then spawn four threads which all try to remove every key
/// - Count how many removals each thread is told succeeded
/// - Confirm every key was removed exactly once, and that the map ends up empty
#[test]
fn each_key_is_removed_exactly_once() {
    let map: OrdSkipMap<u32, u32> = OrdSkipMap::new_ordered();
    for key in 0..SHARED_KEYS {
        map.insert(key, key);
    }

    let mut total_removed = 0_u32;
    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = &map;
                scope.spawn(move || {
                    let mut removed = 0_u32;
                    for key in 0..SHARED_KEYS {
                        if map.remove(&key) {
                            removed += 1;
                        }
                    }
                    removed
                })
            })
            .collect();
        for handle in handles {
            total_removed += handle.join().unwrap();
        }
    });

    assert_eq!(total_removed, SHARED_KEYS);
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
}

/// - Fill the map, then spawn four threads which all try to take every key's value
/// - Confirm each value was handed out exactly once, by comparing counts and sums
#[test]
fn each_value_is_taken_exactly_once() {
    let keys = u64::from(SHARED_KEYS);

    let map: OrdSkipMap<u64, u64> = OrdSkipMap::new_ordered();
    for key in 0..keys {
        map.insert(key, key * 7);
    }

    let mut taken_count = 0_u64;
    let mut taken_sum = 0_u64;
    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = &map;
                scope.spawn(move || {
                    let mut count = 0_u64;
                    let mut sum = 0_u64;
                    for key in 0..keys {
                        if let Some(value) = map.take(&key) {
                            count += 1;
                            sum += value;
                        }
                    }
                    (count, sum)
                })
            })
            .collect();
        for handle in handles {
            let (count, sum) = handle.join().unwrap();
            taken_count += count;
            taken_sum += sum;
        }
    });

    assert_eq!(taken_count, keys);
    assert_eq!(taken_sum, (0..keys).map(|key| key * 7).sum::<u64>());
    assert!(map.is_empty());
}

/// - Two writers repeatedly insert and remove random keys, with values derived from
///   their keys
/// - Two readers repeatedly walk the map, checking that keys stay strictly ascending
///   and values stay consistent with their keys, however the writers interleave
/// - The readers keep walking until the writers are done
#[cfg(not(miri))]
#[test]
fn readers_always_see_sorted_consistent_entries() {
    const KEY_SPACE: u32 = 1024;
    const WRITER_OPERATIONS: u32 = 200_000;

    let map: OrdSkipMap<u32, u64> = OrdSkipMap::new_ordered();
    let writers_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writer_handles: Vec<_> = [0xDEAD_BEEF_u64, 0xFEED_F00D]
            .into_iter()
            .map(|seed| {
                let map = &map;
                scope.spawn(move || {
                    let mut prng = Rand32::new(seed);
                    for _ in 0..WRITER_OPERATIONS {
                        let key = prng.rand_range(0..KEY_SPACE);
                        if prng.rand_range(0..4) == 0 {
                            map.remove(&key);
                        } else {
                            map.insert(key, u64::from(key) * 7 + 1);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..2 {
            let map = &map;
            let writers_done = &writers_done;
            scope.spawn(move || {
                loop {
                    let mut previous = None;
                    map.for_each(|&key, &value| {
                        if let Some(previous) = previous {
                            assert!(previous < key);
                        }
                        assert_eq!(value, u64::from(key) * 7 + 1);
                        previous = Some(key);
                        true
                    });
                    if writers_done.load(Ordering::Relaxed) {
                        break;
                    }
                }
            });
        }

        for handle in writer_handles {
            handle.join().unwrap();
        }
        writers_done.store(true, Ordering::Relaxed);
    });
}

/// - Spawn eight threads which race `get_or_insert` on a single key
/// - The lookup and the insertion do not compose atomically, so several threads may be
///   told they stored their value, but the map must still end up with exactly one
///   entry, holding one of the candidate values
#[test]
fn racing_get_or_insert_settles_on_one_entry() {
    const RACERS: u32 = 8;

    let map: SkipMap<String, u32> = SkipMap::new();
    let barrier = Barrier::new(RACERS as usize);

    let mut stored_count = 0_u32;
    let mut observed = Vec::new();
    thread::scope(|scope| {
        let handles: Vec<_> = (0..RACERS)
            .map(|racer| {
                let map = &map;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    map.get_or_insert(String::from("contended"), racer)
                })
            })
            .collect();
        for handle in handles {
            match handle.join().unwrap() {
                None => stored_count += 1,
                Some(seen) => observed.push(seen),
            }
        }
    });

    assert!(stored_count >= 1);
    assert!(observed.iter().all(|&seen| seen < RACERS));
    assert_eq!(map.len(), 1);
    let final_value = map.get(&String::from("contended"));
    assert!(matches!(final_value, Some(value) if value < RACERS));
}

/// - Four threads run a seeded random mix of inserts, removals, takes, and lookups
/// - Afterwards, the surviving entries must be consistent: values derived from their
///   keys, traversal in ascending order, and a length matching a fresh count
#[test]
fn mixed_stress_settles_to_a_consistent_state() {
    const KEY_SPACE: u32 = 256;

    let map: OrdSkipMap<u32, u64> = OrdSkipMap::new_ordered();

    thread::scope(|scope| {
        for seed in 0..4_u64 {
            let map = &map;
            scope.spawn(move || {
                let mut prng = Rand32::new(0xA11C_E5ED + seed);
                for _ in 0..STRESS_OPERATIONS {
                    let key = prng.rand_range(0..KEY_SPACE);
                    let keyed_value = u64::from(key).wrapping_mul(31).wrapping_add(7);
                    match prng.rand_range(0..10) {
                        0..=4 => {
                            map.insert(key, keyed_value);
                        }
                        5 | 6 => {
                            map.remove(&key);
                        }
                        7 => {
                            if let Some(value) = map.take(&key) {
                                assert_eq!(value, keyed_value);
                            }
                        }
                        _ => {
                            if let Some(value) = map.get(&key) {
                                assert_eq!(value, keyed_value);
                            }
                            let _ = map.contains_key(&key);
                        }
                    }
                }
            });
        }
    });

    let mut visited = 0_usize;
    let mut previous = None;
    map.for_each(|&key, &value| {
        if let Some(previous) = previous {
            assert!(previous < key);
        }
        assert_eq!(value, u64::from(key).wrapping_mul(31).wrapping_add(7));
        previous = Some(key);
        visited += 1;
        true
    });
    assert_eq!(map.len(), visited);
}
