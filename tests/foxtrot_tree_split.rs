use foxtrot::{debug, BPlusTree};

#[test]
fn ascending_fill_splits_and_stays_readable() {
    debug::reset_debug_counters();
    let mut tree = BPlusTree::new();
    for key in 0..10_000i64 {
        tree.insert(key, key);
    }

    assert!(
        debug::leaf_splits() >= 1,
        "10k ascending inserts must split leaves"
    );
    assert!(
        debug::root_growths() >= 1,
        "10k ascending inserts must grow the root"
    );

    for key in 0..10_000i64 {
        assert_eq!(tree.lookup(key), Some(key), "missing key {key}");
    }

    let entries = tree.debug_collect_sorted();
    assert_eq!(entries.len(), 10_000);
    for (pos, (key, _)) in entries.iter().enumerate() {
        assert_eq!(*key, pos as i64);
    }
}

#[test]
fn shuffled_fill_matches_the_sorted_input_set() {
    let mut keys: Vec<i64> = (0..10_000).collect();
    fastrand::shuffle(&mut keys);

    let mut tree = BPlusTree::new();
    for &key in &keys {
        tree.insert(key, key);
    }
    for &key in &keys {
        assert_eq!(tree.lookup(key), Some(key), "missing key {key}");
    }

    let got: Vec<i64> = tree.debug_collect_sorted().iter().map(|(k, _)| *k).collect();
    let mut want = keys;
    want.sort_unstable();
    assert_eq!(got, want);
}
