use std::thread;

use foxtrot::{debug, BulkBufferedTree};

#[test]
fn staged_keys_are_readable_before_and_after_sealing() {
    let bulk = BulkBufferedTree::new();
    for key in 1..=1_000i64 {
        bulk.insert(key, key);
        // no racing writer, so the key must be visible immediately
        assert_eq!(bulk.lookup(key), Some(key), "key {key} invisible after insert");
    }
    for key in 1..=1_000i64 {
        assert_eq!(bulk.lookup(key), Some(key), "key {key} lost");
    }

    assert!(
        debug::bulk_seals() >= 1,
        "1000 ascending keys must seal staged leaves"
    );
    assert_eq!(bulk.lookup(0), None);
    assert_eq!(bulk.lookup(5_000), None);
}

#[test]
fn keys_below_the_low_water_mark_take_the_tree_path() {
    let bulk = BulkBufferedTree::new();
    // enough ascending keys to seal at least one leaf and raise the mark
    for key in 1_000..1_100i64 {
        bulk.insert(key, key);
    }

    bulk.insert(5, 55);
    assert_eq!(bulk.lookup(5), Some(55));
    for key in 1_000..1_100i64 {
        assert_eq!(bulk.lookup(key), Some(key), "key {key} lost");
    }
}

#[test]
fn duplicate_keys_within_a_round_collapse_to_one_entry() {
    let bulk = BulkBufferedTree::new();
    bulk.insert(42i64, 1i64);
    bulk.insert(42, 2);
    assert_eq!(bulk.lookup(42), Some(2), "latest staged write must win");

    // push the round over the seal threshold
    for key in 100..200i64 {
        bulk.insert(key, key);
    }
    assert_eq!(bulk.lookup(42), Some(2), "seal must keep the latest write");

    let mut bulk = bulk;
    let dupes = bulk
        .tree_mut()
        .debug_collect_sorted()
        .iter()
        .filter(|(key, _)| *key == 42)
        .count();
    assert_eq!(dupes, 1);
}

#[test]
fn sequential_rewrites_survive_many_seals_with_the_last_value() {
    let bulk = BulkBufferedTree::new();
    // each round rewrites a fresh key twice before filler keys seal it
    for round in 0..5i64 {
        let key = 10_000 + round * 1_000;
        bulk.insert(key, -1);
        bulk.insert(key, round);
        for filler in (key + 1)..(key + 100) {
            bulk.insert(filler, filler);
        }
        assert_eq!(bulk.lookup(key), Some(round), "round {round} lost its rewrite");
    }
}

#[test]
fn concurrent_staged_inserts_are_all_found() {
    const KEYS: i64 = 50_000;
    const THREADS: usize = 8;
    let mut keys: Vec<i64> = (1..=KEYS).collect();
    fastrand::shuffle(&mut keys);

    let bulk = BulkBufferedTree::new();
    thread::scope(|scope| {
        for chunk in keys.chunks(KEYS as usize / THREADS) {
            let bulk = &bulk;
            scope.spawn(move || {
                for &key in chunk {
                    bulk.insert(key, key);
                }
            });
        }
    });

    for key in 1..=KEYS {
        assert_eq!(bulk.lookup(key), Some(key), "missing key {key}");
    }

    // whatever was sealed must sit in the tree in valid sorted shape
    let mut bulk = bulk;
    bulk.tree_mut().debug_collect_sorted();
}
