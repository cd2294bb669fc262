//! The baseline concurrent B+-tree: optimistic lock coupling on the way
//! down, eager top-down splits on the way to a full page, unbounded
//! restarts with backoff on any conflict.

use std::marker::PhantomData;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::debug;
use crate::lock::{Backoff, Restart};
use crate::node::{free_subtree, InnerNode, LeafNode, NodeHead, NodeKind, NodeRef};
use crate::types::{IndexKey, IndexValue};

/// Concurrent, ordered, in-memory key→value index.
///
/// Point inserts and point lookups may run from any number of threads.
/// Readers never block: they capture a node version, read, and validate;
/// a failed validation restarts the traversal from the root. Writers take
/// a page-local write lock only for the final update, and split full
/// pages eagerly on the way down so a parent always has room for one more
/// separator.
pub struct BPlusTree<K, V> {
    /// Replaced atomically when the root splits; the old root remains a
    /// valid subtree underneath the new one.
    root: AtomicPtr<NodeHead>,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: all shared node state is reached through atomics and the
// per-node version locks; K and V are plain copyable data.
unsafe impl<K: IndexKey, V: IndexValue> Send for BPlusTree<K, V> {}
unsafe impl<K: IndexKey, V: IndexValue> Sync for BPlusTree<K, V> {}

impl<K: IndexKey, V: IndexValue> BPlusTree<K, V> {
    /// Create an empty tree. The root slot stays null until the first
    /// insert, so the staging layer can install a pre-filled leaf as the
    /// very first root.
    pub fn new() -> BPlusTree<K, V> {
        BPlusTree {
            root: AtomicPtr::new(null_mut()),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn load_root(&self) -> Option<NodeRef> {
        NonNull::new(self.root.load(Ordering::Acquire))
    }

    /// Install an empty leaf as the root if the tree has none yet.
    fn root_or_init(&self) -> NodeRef {
        loop {
            if let Some(root) = self.load_root() {
                return root;
            }
            let fresh = LeafNode::<K, V>::as_head(LeafNode::alloc());
            match self.root.compare_exchange(
                null_mut(),
                fresh.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return fresh,
                Err(_) => {
                    // lost the install race; the allocation was never shared
                    // SAFETY: only this thread has seen the pointer
                    unsafe { drop(Box::from_raw(fresh.as_ptr() as *mut LeafNode<K, V>)) };
                }
            }
        }
    }

    /// Insert the pair. An existing key is resolved through the value
    /// merge rule (plain replacement for scalar values, so the last write
    /// to reach the leaf wins). Conflicts restart internally; the call
    /// never fails.
    pub fn insert(&self, key: K, val: V) {
        let mut backoff = Backoff::new();
        loop {
            match self.try_insert(key, val) {
                Ok(()) => return,
                Err(Restart) => {
                    debug::record_restart();
                    backoff.pause();
                }
            }
        }
    }

    fn try_insert(&self, key: K, val: V) -> Result<(), Restart> {
        let mut node = self.root_or_init();
        let mut vnode = unsafe { node.as_ref() }.lock.read_lock()?;
        if self.root.load(Ordering::Acquire) != node.as_ptr() {
            return Err(Restart);
        }
        let mut parent: Option<(NonNull<InnerNode<K>>, u64)> = None;

        loop {
            match unsafe { node.as_ref() }.kind() {
                NodeKind::Inner => {
                    let inner_ptr = node.cast::<InnerNode<K>>();
                    if unsafe { inner_ptr.as_ref() }.is_full() {
                        // eager split keeps every parent one separator short
                        return Err(self.split_node(parent, node, vnode));
                    }
                    if let Some((p, vp)) = parent {
                        unsafe { p.as_ref() }.head.lock.read_unlock(vp)?;
                    }
                    let child = unsafe { inner_ptr.as_ref() }.child_for(key);
                    unsafe { node.as_ref() }.lock.check(vnode)?;
                    let vchild = unsafe { child.as_ref() }.lock.read_lock()?;
                    parent = Some((inner_ptr, vnode));
                    node = child;
                    vnode = vchild;
                }
                NodeKind::Leaf => {
                    if unsafe { LeafNode::<K, V>::from_head(node) }.is_full() {
                        // rare under the eager policy, but a staged bulk
                        // leaf can arrive full
                        return Err(self.split_node(parent, node, vnode));
                    }
                    unsafe { node.as_ref() }.lock.upgrade(vnode)?;
                    if let Some((p, vp)) = parent {
                        if unsafe { p.as_ref() }.head.lock.read_unlock(vp).is_err() {
                            unsafe { node.as_ref() }.lock.write_unlock();
                            return Err(Restart);
                        }
                    }
                    // SAFETY: write lock held, upgrade validated the version
                    unsafe { &mut *node.cast::<LeafNode<K, V>>().as_ptr() }.insert(key, val);
                    unsafe { node.as_ref() }.lock.write_unlock();
                    return Ok(());
                }
            }
        }
    }

    /// Split a full page met on the way down and link the new right
    /// sibling, growing the tree when the page was the root. The caller
    /// restarts afterwards so the traversal sees the new shape.
    fn split_node(
        &self,
        parent: Option<(NonNull<InnerNode<K>>, u64)>,
        node: NodeRef,
        vnode: u64,
    ) -> Restart {
        if let Some((p, vp)) = parent {
            if unsafe { p.as_ref() }.head.lock.upgrade(vp).is_err() {
                return Restart;
            }
        }
        if unsafe { node.as_ref() }.lock.upgrade(vnode).is_err() {
            if let Some((p, _)) = parent {
                unsafe { p.as_ref() }.head.lock.write_unlock();
            }
            return Restart;
        }
        if parent.is_none() && self.root.load(Ordering::Acquire) != node.as_ptr() {
            // the root grew above us while we were descending
            unsafe { node.as_ref() }.lock.write_unlock();
            return Restart;
        }

        let (sep, right) = match unsafe { node.as_ref() }.kind() {
            NodeKind::Inner => {
                // SAFETY: write lock held
                let (sep, right) = unsafe { &mut *node.cast::<InnerNode<K>>().as_ptr() }.split();
                debug::record_inner_split();
                (sep, InnerNode::as_head(right))
            }
            NodeKind::Leaf => {
                // SAFETY: write lock held
                let (sep, right) = unsafe { &mut *node.cast::<LeafNode<K, V>>().as_ptr() }.split();
                debug::record_leaf_split();
                (sep, LeafNode::as_head(right))
            }
        };
        match parent {
            // SAFETY: parent write lock held
            Some((p, _)) => unsafe { &mut *p.as_ptr() }.insert(sep, right),
            None => self.make_root(sep, node, right),
        }
        unsafe { node.as_ref() }.lock.write_unlock();
        if let Some((p, _)) = parent {
            unsafe { p.as_ref() }.head.lock.write_unlock();
        }
        Restart
    }

    /// Grow the tree by one level. Called while holding the write lock on
    /// `left`, the old root, which stays valid as a child.
    fn make_root(&self, sep: K, left: NodeRef, right: NodeRef) {
        let new_root = InnerNode::<K>::alloc(sep, left, right);
        self.root
            .store(InnerNode::as_head(new_root).as_ptr(), Ordering::Release);
        debug::record_root_growth();
    }

    /// Look the key up. Returns a value the key mapped to at some point
    /// during the call, or `None` if it was absent at some point; either
    /// answer is legal for a key whose insert races with the call.
    pub fn lookup(&self, key: K) -> Option<V> {
        let mut backoff = Backoff::new();
        loop {
            match self.try_lookup(key) {
                Ok(hit) => return hit,
                Err(Restart) => {
                    debug::record_restart();
                    backoff.pause();
                }
            }
        }
    }

    fn try_lookup(&self, key: K) -> Result<Option<V>, Restart> {
        let Some(mut node) = self.load_root() else {
            return Ok(None);
        };
        let mut vnode = unsafe { node.as_ref() }.lock.read_lock()?;
        if self.root.load(Ordering::Acquire) != node.as_ptr() {
            return Err(Restart);
        }
        let mut parent: Option<(NodeRef, u64)> = None;

        loop {
            match unsafe { node.as_ref() }.kind() {
                NodeKind::Inner => {
                    let inner_ptr = node.cast::<InnerNode<K>>();
                    if let Some((p, vp)) = parent {
                        unsafe { p.as_ref() }.lock.read_unlock(vp)?;
                    }
                    let child = unsafe { inner_ptr.as_ref() }.child_for(key);
                    // the child pointer only counts if the page was stable
                    unsafe { node.as_ref() }.lock.check(vnode)?;
                    let vchild = unsafe { child.as_ref() }.lock.read_lock()?;
                    parent = Some((node, vnode));
                    node = child;
                    vnode = vchild;
                }
                NodeKind::Leaf => {
                    let hit = unsafe { LeafNode::<K, V>::from_head(node) }.get(key);
                    if let Some((p, vp)) = parent {
                        unsafe { p.as_ref() }.lock.read_unlock(vp)?;
                    }
                    unsafe { node.as_ref() }.lock.read_unlock(vnode)?;
                    return Ok(hit);
                }
            }
        }
    }

    /// Install an already-sorted, sealed leaf as the right sibling of the
    /// leaf currently covering its range. The staging layer guarantees
    /// that every key in `new_leaf` is greater than every key already in
    /// the tree, so the leaf always lands on the right edge.
    pub(crate) fn insert_leaf(&self, new_leaf: NonNull<LeafNode<K, V>>) {
        let head = LeafNode::as_head(new_leaf);
        if self
            .root
            .compare_exchange(
                null_mut(),
                head.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return;
        }
        let key = unsafe { new_leaf.as_ref() }.max_key();
        let mut backoff = Backoff::new();
        loop {
            match self.try_insert_leaf(key, head) {
                Ok(()) => return,
                Err(Restart) => {
                    debug::record_restart();
                    backoff.pause();
                }
            }
        }
    }

    fn try_insert_leaf(&self, key: K, new_leaf: NodeRef) -> Result<(), Restart> {
        let Some(mut node) = self.load_root() else {
            return Err(Restart);
        };
        let mut vnode = unsafe { node.as_ref() }.lock.read_lock()?;
        if self.root.load(Ordering::Acquire) != node.as_ptr() {
            return Err(Restart);
        }
        let mut parent: Option<(NonNull<InnerNode<K>>, u64)> = None;

        loop {
            match unsafe { node.as_ref() }.kind() {
                NodeKind::Inner => {
                    let inner_ptr = node.cast::<InnerNode<K>>();
                    if unsafe { inner_ptr.as_ref() }.is_full() {
                        return Err(self.split_node(parent, node, vnode));
                    }
                    if let Some((p, vp)) = parent {
                        unsafe { p.as_ref() }.head.lock.read_unlock(vp)?;
                    }
                    let child = unsafe { inner_ptr.as_ref() }.child_for(key);
                    unsafe { node.as_ref() }.lock.check(vnode)?;
                    let vchild = unsafe { child.as_ref() }.lock.read_lock()?;
                    parent = Some((inner_ptr, vnode));
                    node = child;
                    vnode = vchild;
                }
                NodeKind::Leaf => {
                    if let Some((p, vp)) = parent {
                        unsafe { p.as_ref() }.head.lock.upgrade(vp)?;
                    }
                    if unsafe { node.as_ref() }.lock.upgrade(vnode).is_err() {
                        if let Some((p, _)) = parent {
                            unsafe { p.as_ref() }.head.lock.write_unlock();
                        }
                        return Err(Restart);
                    }
                    if parent.is_none() && self.root.load(Ordering::Acquire) != node.as_ptr() {
                        unsafe { node.as_ref() }.lock.write_unlock();
                        return Err(Restart);
                    }
                    let receiving = unsafe { LeafNode::<K, V>::from_head(node) };
                    // an empty receiving leaf can only be the freshly
                    // initialised root; everything it covers sorts at or
                    // below the sentinel
                    let sep = match receiving.count() {
                        0 => K::LOWEST,
                        _ => receiving.max_key(),
                    };
                    match parent {
                        // SAFETY: parent write lock held
                        Some((p, _)) => unsafe { &mut *p.as_ptr() }.insert(sep, new_leaf),
                        None => self.make_root(sep, node, new_leaf),
                    }
                    unsafe { node.as_ref() }.lock.write_unlock();
                    if let Some((p, _)) = parent {
                        unsafe { p.as_ref() }.head.lock.write_unlock();
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Quiescent in-order walk used by tests and debugging: exclusive
    /// access means no traversal is in flight, so pages can be read
    /// without version checks. Panics if the separator relation or the
    /// leaf ordering is violated anywhere.
    pub fn debug_collect_sorted(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        if let Some(root) = self.load_root() {
            unsafe { self.walk(root, None, None, &mut out) };
        }
        for pair in out.windows(2) {
            assert!(
                pair[0].0 < pair[1].0,
                "keys out of order: {:?} before {:?}",
                pair[0].0,
                pair[1].0
            );
        }
        out
    }

    unsafe fn walk(&self, node: NodeRef, low: Option<K>, high: Option<K>, out: &mut Vec<(K, V)>) {
        match node.as_ref().kind() {
            NodeKind::Leaf => {
                let leaf = LeafNode::<K, V>::from_head(node);
                for pos in 0..leaf.count() {
                    let (key, val) = leaf.slot_pair(pos);
                    if let Some(low) = low {
                        assert!(low < key, "leaf key {key:?} at or below separator {low:?}");
                    }
                    if let Some(high) = high {
                        assert!(key <= high, "leaf key {key:?} above separator {high:?}");
                    }
                    out.push((key, val));
                }
            }
            NodeKind::Inner => {
                let inner = node.cast::<InnerNode<K>>().as_ref();
                for pos in 0..=inner.count() {
                    let child_low = if pos == 0 {
                        low
                    } else {
                        Some(inner.key_at(pos - 1))
                    };
                    let child_high = if pos == inner.count() {
                        high
                    } else {
                        Some(inner.key_at(pos))
                    };
                    self.walk(inner.child_at(pos), child_low, child_high, out);
                }
            }
        }
    }
}

impl<K: IndexKey, V: IndexValue> Default for BPlusTree<K, V> {
    fn default() -> BPlusTree<K, V> {
        BPlusTree::new()
    }
}

impl<K, V> Drop for BPlusTree<K, V> {
    fn drop(&mut self) {
        if let Some(root) = NonNull::new(*self.root.get_mut()) {
            // SAFETY: exclusive access; every allocation stays linked under
            // the root, so the walk reaches all of them exactly once
            unsafe { free_subtree::<K, V>(root) };
        }
    }
}
