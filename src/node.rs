//! The two page kinds of the tree. Both start with the same header so a
//! traversal can inspect the kind through a `NonNull<NodeHead>` and cast
//! to the concrete page type.

use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use crate::lock::VersionLock;
use crate::types::{IndexKey, IndexValue};

/// Entries per leaf; sized so a leaf of word-sized pairs spans a handful
/// of cache lines.
pub(crate) const LEAF_CAP: usize = 64;
/// Separator keys per inner node; child slots are `INNER_CAP + 1`.
pub(crate) const INNER_CAP: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum NodeKind {
    Leaf,
    Inner,
}

/// Common page header, laid out first in both node kinds.
#[repr(C)]
pub(crate) struct NodeHead {
    pub(crate) lock: VersionLock,
    kind: NodeKind,
}

impl NodeHead {
    fn new(kind: NodeKind) -> NodeHead {
        NodeHead {
            lock: VersionLock::new(),
            kind,
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }
}

/// Type-erased page pointer, as stored in inner nodes and the root slot.
pub(crate) type NodeRef = NonNull<NodeHead>;

#[repr(C)]
pub(crate) struct LeafNode<K, V> {
    pub(crate) head: NodeHead,
    count: u16,
    keys: [MaybeUninit<K>; LEAF_CAP],
    vals: [MaybeUninit<V>; LEAF_CAP],
}

impl<K: IndexKey, V: IndexValue> LeafNode<K, V> {
    /// Allocate an empty leaf. Pages are owned by their parent once
    /// linked and reclaimed when the tree is dropped.
    pub(crate) fn alloc() -> NonNull<LeafNode<K, V>> {
        let node = Box::new(LeafNode {
            head: NodeHead::new(NodeKind::Leaf),
            count: 0,
            // SAFETY: an array of MaybeUninit needs no initialisation
            keys: unsafe { MaybeUninit::uninit().assume_init() },
            vals: unsafe { MaybeUninit::uninit().assume_init() },
        });
        NonNull::from(Box::leak(node))
    }

    pub(crate) fn as_head(this: NonNull<LeafNode<K, V>>) -> NodeRef {
        this.cast()
    }

    /// SAFETY: `head` must point at a page whose kind is `Leaf`.
    pub(crate) unsafe fn from_head<'a>(head: NodeRef) -> &'a LeafNode<K, V> {
        head.cast().as_ref()
    }

    /// Stale optimistic reads can observe a torn count; clamping keeps
    /// them in bounds until the version check throws them away.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        (self.count as usize).min(LEAF_CAP)
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.count() == LEAF_CAP
    }

    #[inline]
    fn key_at(&self, pos: usize) -> K {
        debug_assert!(pos < self.count());
        // SAFETY: slots below count are initialised
        unsafe { self.keys[pos].assume_init() }
    }

    #[inline]
    fn val_at(&self, pos: usize) -> V {
        debug_assert!(pos < self.count());
        // SAFETY: slots below count are initialised
        unsafe { self.vals[pos].assume_init() }
    }

    pub(crate) fn max_key(&self) -> K {
        self.key_at(self.count() - 1)
    }

    // index of the first key not less than the target
    #[inline]
    fn lower_bound(&self, key: K) -> usize {
        let mut low = 0;
        let mut high = self.count();
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid) < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    pub(crate) fn get(&self, key: K) -> Option<V> {
        let pos = self.lower_bound(key);
        if pos < self.count() && self.key_at(pos) == key {
            Some(self.val_at(pos))
        } else {
            None
        }
    }

    /// Sorted insert. The caller holds the write lock and has made sure
    /// the leaf is not full; an existing key goes through the value merge
    /// rule.
    pub(crate) fn insert(&mut self, key: K, val: V) {
        debug_assert!(!self.is_full());
        let count = self.count();
        let pos = self.lower_bound(key);
        if pos < count && self.key_at(pos) == key {
            let mut cur = self.val_at(pos);
            cur.merge_from(val);
            self.vals[pos] = MaybeUninit::new(cur);
            return;
        }
        self.keys.copy_within(pos..count, pos + 1);
        self.vals.copy_within(pos..count, pos + 1);
        self.keys[pos] = MaybeUninit::new(key);
        self.vals[pos] = MaybeUninit::new(val);
        self.count += 1;
    }

    /// Halve the leaf: the upper half moves into a fresh right sibling,
    /// and the separator is the largest key left behind.
    pub(crate) fn split(&mut self) -> (K, NonNull<LeafNode<K, V>>) {
        debug_assert!(self.count() >= 2);
        let right_ptr = Self::alloc();
        // SAFETY: freshly allocated, not yet linked anywhere
        let right = unsafe { &mut *right_ptr.as_ptr() };
        let keep = self.count() / 2;
        let moved = self.count() - keep;
        right.keys[..moved].copy_from_slice(&self.keys[keep..self.count()]);
        right.vals[..moved].copy_from_slice(&self.vals[keep..self.count()]);
        right.count = moved as u16;
        self.count = keep as u16;
        (self.key_at(keep - 1), right_ptr)
    }

    /// Unsorted slot write for the staging fill. Slot indices are claimed
    /// uniquely, so no two writers ever touch the same slot.
    ///
    /// SAFETY: `pos < LEAF_CAP`, `pos` is claimed exclusively by this
    /// caller, and the leaf is not yet linked into a tree.
    pub(crate) unsafe fn stage_write(this: NonNull<LeafNode<K, V>>, pos: usize, key: K, val: V) {
        let node = this.as_ptr();
        ptr::addr_of_mut!((*node).keys)
            .cast::<MaybeUninit<K>>()
            .add(pos)
            .write(MaybeUninit::new(key));
        ptr::addr_of_mut!((*node).vals)
            .cast::<MaybeUninit<V>>()
            .add(pos)
            .write(MaybeUninit::new(val));
    }

    /// Read one staged pair, ignoring `count`.
    ///
    /// SAFETY: slot `pos` must have been written, either by a completed
    /// staging write or by being below `count`.
    pub(crate) unsafe fn slot_pair(&self, pos: usize) -> (K, V) {
        (self.keys[pos].assume_init(), self.vals[pos].assume_init())
    }

    /// Sort the first `filled` staged slots in place, collapse duplicate
    /// keys through the value merge rule, and return the high key together
    /// with the number of slots kept. The caller holds the leaf's write
    /// lock and has waited for every slot writer.
    ///
    /// Slots `[kept, filled)` still hold the superseded pre-merge pairs
    /// afterwards; the caller must make them unreadable before releasing
    /// the write lock.
    pub(crate) fn sort_and_dedupe(&mut self, filled: usize) -> (K, usize) {
        debug_assert!(filled > 0 && filled <= LEAF_CAP);
        // SAFETY: all `filled` slots were written before the seal barrier
        let mut pairs: Vec<(K, V)> = (0..filled).map(|i| unsafe { self.slot_pair(i) }).collect();
        // stable by key, so slot order breaks ties and the latest staged
        // write of a key survives the merge
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = 0usize;
        for i in 0..pairs.len() {
            if out > 0 && pairs[out - 1].0 == pairs[i].0 {
                let (_, val) = pairs[i];
                pairs[out - 1].1.merge_from(val);
            } else {
                pairs[out] = pairs[i];
                out += 1;
            }
        }
        for (i, (key, val)) in pairs[..out].iter().enumerate() {
            self.keys[i] = MaybeUninit::new(*key);
            self.vals[i] = MaybeUninit::new(*val);
        }
        self.count = out as u16;
        (self.key_at(out - 1), out)
    }
}

#[repr(C)]
pub(crate) struct InnerNode<K> {
    pub(crate) head: NodeHead,
    count: u16,
    keys: [MaybeUninit<K>; INNER_CAP],
    children: [MaybeUninit<NodeRef>; INNER_CAP + 1],
}

impl<K> InnerNode<K> {
    /// See [`LeafNode::count`] on the clamp.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        (self.count as usize).min(INNER_CAP)
    }

    #[inline]
    pub(crate) fn child_at(&self, pos: usize) -> NodeRef {
        debug_assert!(pos <= self.count());
        // SAFETY: child slots up to and including count are initialised
        unsafe { self.children[pos].assume_init() }
    }
}

impl<K: IndexKey> InnerNode<K> {
    /// Allocate a one-separator inner node; this is how the tree grows a
    /// new root.
    pub(crate) fn alloc(sep: K, left: NodeRef, right: NodeRef) -> NonNull<InnerNode<K>> {
        let mut node = Self::alloc_empty();
        // SAFETY: freshly allocated, not yet linked anywhere
        let inner = unsafe { node.as_mut() };
        inner.count = 1;
        inner.keys[0] = MaybeUninit::new(sep);
        inner.children[0] = MaybeUninit::new(left);
        inner.children[1] = MaybeUninit::new(right);
        node
    }

    fn alloc_empty() -> NonNull<InnerNode<K>> {
        let node = Box::new(InnerNode {
            head: NodeHead::new(NodeKind::Inner),
            count: 0,
            // SAFETY: an array of MaybeUninit needs no initialisation
            keys: unsafe { MaybeUninit::uninit().assume_init() },
            children: unsafe { MaybeUninit::uninit().assume_init() },
        });
        NonNull::from(Box::leak(node))
    }

    pub(crate) fn as_head(this: NonNull<InnerNode<K>>) -> NodeRef {
        this.cast()
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.count() == INNER_CAP
    }

    #[inline]
    pub(crate) fn key_at(&self, pos: usize) -> K {
        debug_assert!(pos < self.count());
        // SAFETY: separator slots below count are initialised
        unsafe { self.keys[pos].assume_init() }
    }

    // index of the first separator not less than the target; equals
    // count when the target is greater than every separator
    #[inline]
    fn lower_bound(&self, key: K) -> usize {
        let mut low = 0;
        let mut high = self.count();
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid) < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Child covering `key`: child `i` holds keys `k` with
    /// `keys[i - 1] < k <= keys[i]`.
    #[inline]
    pub(crate) fn child_for(&self, key: K) -> NodeRef {
        self.child_at(self.lower_bound(key))
    }

    /// Link a new right sibling under this node. The caller holds the
    /// write lock; eager splitting on the way down guarantees room.
    pub(crate) fn insert(&mut self, sep: K, child: NodeRef) {
        debug_assert!(!self.is_full());
        let count = self.count();
        let pos = self.lower_bound(sep);
        self.keys.copy_within(pos..count, pos + 1);
        self.children.copy_within(pos + 1..count + 1, pos + 2);
        self.keys[pos] = MaybeUninit::new(sep);
        self.children[pos + 1] = MaybeUninit::new(child);
        self.count += 1;
    }

    /// Halve the node. The middle separator moves up to the parent and is
    /// removed from both halves.
    pub(crate) fn split(&mut self) -> (K, NonNull<InnerNode<K>>) {
        debug_assert!(self.count() >= 3);
        let right_ptr = Self::alloc_empty();
        // SAFETY: freshly allocated, not yet linked anywhere
        let right = unsafe { &mut *right_ptr.as_ptr() };
        let keep = self.count() / 2;
        let sep = self.key_at(keep);
        let moved = self.count() - keep - 1;
        right.keys[..moved].copy_from_slice(&self.keys[keep + 1..self.count()]);
        right.children[..moved + 1].copy_from_slice(&self.children[keep + 1..self.count() + 1]);
        right.count = moved as u16;
        self.count = keep as u16;
        (sep, right_ptr)
    }
}

/// Reclaim a whole subtree. Only sound at quiescence; the tree calls this
/// from `Drop`, where exclusive ownership is guaranteed.
pub(crate) unsafe fn free_subtree<K, V>(node: NodeRef) {
    match node.as_ref().kind() {
        NodeKind::Leaf => {
            drop(Box::from_raw(node.cast::<LeafNode<K, V>>().as_ptr()));
        }
        NodeKind::Inner => {
            let inner = node.cast::<InnerNode<K>>().as_ptr();
            for pos in 0..=(*inner).count() {
                free_subtree::<K, V>((*inner).child_at(pos));
            }
            drop(Box::from_raw(inner));
        }
    }
}
