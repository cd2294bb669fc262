use std::thread;

use foxtrot::{debug, RingBufferedTree, RingConfig};

#[test]
fn staged_inserts_are_visible_and_eventually_drain() {
    let ring = RingBufferedTree::with_workers(1);
    for key in 0..2_000i64 {
        ring.insert(0, key, key);
    }
    ring.release(0);

    assert!(
        debug::ring_drains() >= 1,
        "2000 inserts must overflow the active buffer"
    );
    for key in 0..2_000i64 {
        assert_eq!(ring.lookup(key), Some(key), "key {key} lost");
    }
    assert_eq!(ring.lookup(9_999), None);
}

#[test]
fn the_newer_version_wins_for_a_key() {
    let ring = RingBufferedTree::with_workers(1);
    ring.insert(0, 7i64, 1i64);
    ring.insert(0, 7, 2);

    let staged = ring.lookup_versioned(7).expect("7 is staged");
    assert_eq!(staged.val, 2);

    // push the pair through a rotation so it drains into the tree
    for key in 100..500i64 {
        ring.insert(0, key, key);
    }
    ring.release(0);

    let drained = ring.lookup_versioned(7).expect("7 was drained");
    assert_eq!(drained.val, 2);
    assert!(
        drained.version >= staged.version,
        "a later read went back in time: {} < {}",
        drained.version,
        staged.version
    );
}

#[test]
fn workers_share_the_ring() {
    const THREADS: usize = 8;
    const PER_WORKER: i64 = 5_000;
    let ring = RingBufferedTree::with_workers(THREADS);

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let ring = &ring;
            scope.spawn(move || {
                let base = worker as i64 * PER_WORKER;
                for i in 0..PER_WORKER {
                    ring.insert(worker, base + i, base + i);
                }
                ring.release(worker);
            });
        }
    });

    for key in 0..THREADS as i64 * PER_WORKER {
        assert_eq!(ring.lookup(key), Some(key), "missing key {key}");
    }
}

#[test]
fn a_small_ring_rotates_often() {
    let ring = RingBufferedTree::new(
        RingConfig {
            buffers: 8,
            slots: 16,
        },
        2,
    );
    for key in 0..500i64 {
        ring.insert(0, key, key);
    }
    ring.release(0);
    for key in 0..500i64 {
        assert_eq!(ring.lookup(key), Some(key), "key {key} lost");
    }
}

#[test]
fn racing_writes_of_one_key_resolve_by_version() {
    const THREADS: usize = 8;
    const ROUNDS: i64 = 500;
    let ring = RingBufferedTree::with_workers(THREADS);

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let ring = &ring;
            scope.spawn(move || {
                let base = worker as i64 * ROUNDS;
                for i in 0..ROUNDS {
                    ring.insert(worker, 1i64, base + i);
                }
                ring.release(worker);
            });
        }
    });

    let first = ring.lookup_versioned(1).expect("key 1 was inserted");
    assert!(
        (0..THREADS as i64 * ROUNDS).contains(&first.val),
        "value {} was never written",
        first.val
    );
    let second = ring.lookup_versioned(1).expect("key 1 stays present");
    assert!(second.version >= first.version);
}
