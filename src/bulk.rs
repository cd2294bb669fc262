//! Bulk-leaf staging: concurrent appenders collaborate to fill one
//! pre-sized leaf, which is then sorted and installed into the tree as a
//! whole, so a burst of ever-increasing keys costs one descent per
//! sealed leaf instead of one per key.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::debug;
use crate::lock::{Backoff, Latch};
use crate::node::{LeafNode, LEAF_CAP};
use crate::tree::BPlusTree;
use crate::types::{IndexKey, IndexValue};

/// Slots filled before a staged leaf is sealed: a 75% load factor leaves
/// the installed leaf room for later point inserts.
pub const MAX_INSERTS: usize = LEAF_CAP * 3 / 4;

const _: () = assert!(MAX_INSERTS + 1 <= LEAF_CAP);

/// One staging round: the leaf being filled plus its per-slot publication
/// flags. A fresh round is allocated at every publication and the old one
/// is only retired, never reused, so a reader still scanning a sealed
/// round can never observe that round's flags being reset for new writes.
struct StagingRound<K, V> {
    leaf: NonNull<LeafNode<K, V>>,
    written: [AtomicBool; MAX_INSERTS + 1],
}

impl<K: IndexKey, V: IndexValue> StagingRound<K, V> {
    fn alloc() -> *mut StagingRound<K, V> {
        Box::into_raw(Box::new(StagingRound {
            leaf: LeafNode::alloc(),
            written: std::array::from_fn(|_| AtomicBool::new(false)),
        }))
    }
}

/// Staging front end over [`BPlusTree`].
///
/// Keys at or below the low-water mark bypass straight to the tree; keys
/// above it claim a slot in the staging leaf. The appender that claims
/// the last slot becomes the sealer: it waits for the in-flight slot
/// writers, sorts the leaf, installs it, and publishes a fresh round with
/// the low-water mark advanced to the sealed leaf's high key.
///
/// Lookups of staged keys scan the unsorted leaf under its optimistic
/// lock; once the insert of a key has returned, and absent racing writes
/// of the same key, a later lookup finds it either in the staging leaf or
/// in the tree.
pub struct BulkBufferedTree<K, V> {
    tree: BPlusTree<K, V>,
    /// shared for admission and slot claims, exclusive for publication
    gate: Latch,
    staged: AtomicPtr<StagingRound<K, V>>,
    /// exclusive lower bound for staged keys; written under the exclusive
    /// gate, read under the shared gate
    low_key: UnsafeCell<K>,
    /// next slot to hand out; claims beyond `MAX_INSERTS` wait for the
    /// next round
    pos: AtomicUsize,
    /// completed slot writes, the sealer's barrier
    insert_count: AtomicUsize,
    /// sealed rounds, kept alive for readers that still hold a round
    /// pointer; reclaimed at drop
    retired: Mutex<Vec<*mut StagingRound<K, V>>>,
}

// SAFETY: low_key is only written under the exclusive gate and only read
// under the shared gate; slot writes are published through the round's
// flags, and rounds stay allocated until drop.
unsafe impl<K: IndexKey, V: IndexValue> Send for BulkBufferedTree<K, V> {}
unsafe impl<K: IndexKey, V: IndexValue> Sync for BulkBufferedTree<K, V> {}

impl<K: IndexKey, V: IndexValue> BulkBufferedTree<K, V> {
    pub fn new() -> BulkBufferedTree<K, V> {
        BulkBufferedTree {
            tree: BPlusTree::new(),
            gate: Latch::new(),
            staged: AtomicPtr::new(StagingRound::<K, V>::alloc()),
            low_key: UnsafeCell::new(K::LOWEST),
            pos: AtomicUsize::new(0),
            insert_count: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Insert the pair, staging it when the key is above the current
    /// low-water mark and delegating to the tree otherwise. Never fails.
    pub fn insert(&self, key: K, val: V) {
        let mut backoff = Backoff::new();
        loop {
            self.gate.lock_shared();
            // SAFETY: shared gate held; low_key is written only under the
            // exclusive gate
            let low = unsafe { *self.low_key.get() };
            if key <= low {
                // SAFETY: acquired above
                unsafe { self.gate.unlock_shared() };
                self.tree.insert(key, val);
                return;
            }
            let round_ptr = self.staged.load(Ordering::Acquire);
            let claimed = self.pos.fetch_add(1, Ordering::AcqRel);
            // SAFETY: acquired above
            unsafe { self.gate.unlock_shared() };

            if claimed > MAX_INSERTS {
                // every slot of this round is spoken for; wait for the
                // next round to be published
                backoff.pause();
                continue;
            }

            // SAFETY: rounds are only reclaimed at drop
            let round = unsafe { &*round_ptr };
            // SAFETY: `claimed` was handed out exactly once this round
            unsafe { LeafNode::stage_write(round.leaf, claimed, key, val) };
            round.written[claimed].store(true, Ordering::Release);
            self.insert_count.fetch_add(1, Ordering::AcqRel);

            if claimed == MAX_INSERTS {
                self.seal(round_ptr);
            }
            return;
        }
    }

    /// Seal the full round: wait out the in-flight slot writers, sort and
    /// dedupe, install the leaf into the tree, then publish a fresh round.
    fn seal(&self, round_ptr: *mut StagingRound<K, V>) {
        // SAFETY: rounds are only reclaimed at drop
        let round = unsafe { &*round_ptr };
        let leaf = round.leaf;
        while self.insert_count.load(Ordering::Acquire) != MAX_INSERTS + 1 {
            std::hint::spin_loop();
        }

        // sorting shuffles the slots in place; the write lock makes the
        // unsorted optimistic readers restart instead of trusting them
        unsafe { leaf.as_ref() }.head.lock.write_lock();
        // SAFETY: write lock held and all slot writers are done
        let (high, kept) = unsafe { (*leaf.as_ptr()).sort_and_dedupe(MAX_INSERTS + 1) };
        // slots vacated by merged duplicates still hold superseded pairs;
        // unpublish them while readers are still fenced off by the lock
        for flag in &round.written[kept..] {
            flag.store(false, Ordering::Release);
        }
        unsafe { leaf.as_ref() }.head.lock.write_unlock();

        self.tree.insert_leaf(leaf);
        debug::record_bulk_seal();
        trace!(high_key = ?high, "sealed staging leaf into the tree");

        let fresh = StagingRound::<K, V>::alloc();
        self.insert_count.store(0, Ordering::Release);
        self.gate.lock_exclusive();
        // SAFETY: exclusive gate held
        unsafe { *self.low_key.get() = high };
        self.staged.store(fresh, Ordering::Release);
        self.pos.store(0, Ordering::Release);
        // SAFETY: acquired above
        unsafe { self.gate.unlock_exclusive() };

        // the sealed round's leaf now belongs to the tree; its flag block
        // must outlive any reader that captured the round before the swap
        self.retired.lock().push(round_ptr);
    }

    /// Look the key up across the staging leaf and the tree.
    pub fn lookup(&self, key: K) -> Option<V> {
        let mut backoff = Backoff::new();
        loop {
            self.gate.lock_shared();
            // SAFETY: shared gate held
            let low = unsafe { *self.low_key.get() };
            let round_ptr = self.staged.load(Ordering::Acquire);
            let claimed = self.pos.load(Ordering::Acquire);
            // SAFETY: acquired above
            unsafe { self.gate.unlock_shared() };

            if key <= low {
                return self.tree.lookup(key);
            }

            // SAFETY: rounds are only reclaimed at drop
            let round = unsafe { &*round_ptr };
            let leaf = round.leaf;
            let upto = claimed.min(MAX_INSERTS + 1);

            // unsorted scan of the live staging leaf, validated by its
            // version afterwards
            if let Ok(version) = unsafe { leaf.as_ref() }.head.lock.read_lock() {
                let mut hit = None;
                for slot in 0..upto {
                    if !round.written[slot].load(Ordering::Acquire) {
                        continue;
                    }
                    // SAFETY: the flag is set only after the slot write
                    let (k, v) = unsafe { leaf.as_ref().slot_pair(slot) };
                    if k == key {
                        hit = Some(v);
                    }
                }
                if unsafe { leaf.as_ref() }.head.lock.read_unlock(version).is_ok()
                    && self.staged.load(Ordering::Acquire) == round_ptr
                {
                    // the round is still the live one, so for a key above
                    // the low-water mark it is authoritative
                    return hit;
                }
            }

            if self.staged.load(Ordering::Acquire) == round_ptr {
                // a seal is in flight but the new round is not published
                // yet; by publication order the sealed leaf reaches the
                // tree first, so retrying is bounded by the sealer
                backoff.pause();
                continue;
            }

            // the leaf we were scanning has been sealed into the tree
            return self.read_sealed(leaf, key);
        }
    }

    /// Sorted optimistic read of a leaf that has been sealed into the
    /// tree, falling back to a full tree lookup when the key is not in it
    /// (the leaf may have split since).
    fn read_sealed(&self, leaf: NonNull<LeafNode<K, V>>, key: K) -> Option<V> {
        let mut backoff = Backoff::new();
        loop {
            let Ok(version) = unsafe { leaf.as_ref() }.head.lock.read_lock() else {
                backoff.pause();
                continue;
            };
            let hit = unsafe { leaf.as_ref() }.get(key);
            if unsafe { leaf.as_ref() }.head.lock.read_unlock(version).is_ok() {
                return match hit {
                    Some(val) => Some(val),
                    None => self.tree.lookup(key),
                };
            }
            backoff.pause();
        }
    }

    /// Quiescent access to the underlying tree, for inspection in tests.
    pub fn tree_mut(&mut self) -> &mut BPlusTree<K, V> {
        &mut self.tree
    }
}

impl<K: IndexKey, V: IndexValue> Default for BulkBufferedTree<K, V> {
    fn default() -> BulkBufferedTree<K, V> {
        BulkBufferedTree::new()
    }
}

impl<K, V> Drop for BulkBufferedTree<K, V> {
    fn drop(&mut self) {
        let staged = *self.staged.get_mut();
        if !staged.is_null() {
            // SAFETY: exclusive access; the live round still owns its leaf
            unsafe {
                let round = Box::from_raw(staged);
                drop(Box::from_raw(round.leaf.as_ptr()));
            }
        }
        // sealed rounds: their leaves belong to the tree, only the flag
        // blocks are reclaimed here
        for round_ptr in self.retired.get_mut().drain(..) {
            // SAFETY: exclusive access; unlinked from `staged` at
            // publication and never freed since
            unsafe { drop(Box::from_raw(round_ptr)) };
        }
    }
}
