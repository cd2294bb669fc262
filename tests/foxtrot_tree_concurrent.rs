use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use foxtrot::BPlusTree;

const THREADS: usize = 8;

#[test]
fn no_lost_updates_across_threads() {
    const KEYS: usize = 100_000;
    let mut keys: Vec<i64> = (0..KEYS as i64).collect();
    fastrand::shuffle(&mut keys);

    let tree = BPlusTree::new();
    thread::scope(|scope| {
        for chunk in keys.chunks(KEYS / THREADS) {
            let tree = &tree;
            scope.spawn(move || {
                for &key in chunk {
                    tree.insert(key, key);
                }
            });
        }
    });

    for key in 0..KEYS as i64 {
        assert_eq!(tree.lookup(key), Some(key), "missing key {key}");
    }

    let mut tree = tree;
    assert_eq!(tree.debug_collect_sorted().len(), KEYS);
}

#[test]
fn racing_writes_of_one_key_keep_exactly_one_value() {
    const ROUNDS: i64 = 1_000;
    let tree = BPlusTree::new();
    thread::scope(|scope| {
        for t in 0..THREADS as i64 {
            let tree = &tree;
            scope.spawn(move || {
                for i in 0..ROUNDS {
                    tree.insert(1i64, t * ROUNDS + i);
                }
            });
        }
    });

    let got = tree.lookup(1).expect("key 1 was inserted");
    assert!(
        (0..THREADS as i64 * ROUNDS).contains(&got),
        "value {got} was never written"
    );

    let mut tree = tree;
    assert_eq!(tree.debug_collect_sorted().len(), 1);
}

#[test]
fn readers_and_writers_make_progress_together() {
    const KEYS: i64 = 20_000;
    let tree = BPlusTree::new();
    let hits = AtomicUsize::new(0);

    thread::scope(|scope| {
        for t in 0..THREADS as i64 {
            let tree = &tree;
            let hits = &hits;
            scope.spawn(move || {
                if t % 2 == 0 {
                    // writer: strided slice of the key space
                    let mut key = t / 2;
                    while key < KEYS {
                        tree.insert(key, key);
                        key += (THREADS / 2) as i64;
                    }
                } else {
                    // reader: sweep while writes are in flight
                    for key in 0..KEYS {
                        if tree.lookup(key).is_some() {
                            hits.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    // quiescent reads see everything the writers finished
    for key in 0..KEYS {
        assert_eq!(tree.lookup(key), Some(key), "missing key {key}");
    }
}
