use foxtrot::BPlusTree;

#[test]
fn insert_and_read_back() {
    let tree = BPlusTree::new();
    tree.insert(5i64, 50i64);
    tree.insert(7, 70);
    tree.insert(3, 30);

    assert_eq!(tree.lookup(5), Some(50));
    assert_eq!(tree.lookup(3), Some(30));
    assert_eq!(tree.lookup(7), Some(70));
    assert_eq!(tree.lookup(99), None);
}

#[test]
fn lookup_on_an_empty_tree_is_a_miss() {
    let tree = BPlusTree::<i64, i64>::new();
    assert_eq!(tree.lookup(1), None);
}

#[test]
fn reinserting_a_key_overwrites_its_value() {
    let tree = BPlusTree::new();
    tree.insert(5i64, 1i64);
    tree.insert(5, 2);
    assert_eq!(tree.lookup(5), Some(2));

    let mut tree = tree;
    assert_eq!(tree.debug_collect_sorted(), vec![(5, 2)]);
}

#[test]
fn quiesced_walk_returns_sorted_unique_keys() {
    let mut keys: Vec<i64> = (0..500).collect();
    fastrand::shuffle(&mut keys);

    let mut tree = BPlusTree::new();
    for &key in &keys {
        tree.insert(key, key * 10);
    }

    let entries = tree.debug_collect_sorted();
    assert_eq!(entries.len(), 500);
    for (pos, (key, val)) in entries.iter().enumerate() {
        assert_eq!(*key, pos as i64);
        assert_eq!(*val, key * 10);
    }
}

#[test]
fn negative_keys_sort_below_zero() {
    let tree = BPlusTree::new();
    tree.insert(-5i64, 1i64);
    tree.insert(0, 2);
    tree.insert(5, 3);
    assert_eq!(tree.lookup(-5), Some(1));

    let mut tree = tree;
    let keys: Vec<i64> = tree.debug_collect_sorted().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![-5, 0, 5]);
}
