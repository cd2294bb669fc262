//! Ring staging: a fixed set of insert buffers rotates through an
//! `active` slot. Appenders hold a buffer's shared latch across calls so
//! claiming a slot is one fetch-add; the appender that overflows a buffer
//! rotates a fresh one in and drains the full one into the tree behind
//! the exclusive latch. Every staged value carries a ticket from a global
//! version counter, which is what lets readers take a consistent union of
//! the buffers and the tree without waiting.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use tracing::trace;

use crate::debug;
use crate::lock::{Backoff, Latch};
use crate::tree::BPlusTree;
use crate::types::{IndexKey, IndexValue, Versioned};

const DEFAULT_BUFFERS: usize = 32;
const DEFAULT_SLOTS: usize = 256;

/// Sizing for [`RingBufferedTree`].
pub struct RingConfig {
    /// Buffers in the rotation. Must leave headroom above the worker
    /// count: a parked worker keeps a shared hold on one buffer, and the
    /// rotator needs at least one buffer nobody holds.
    pub buffers: usize,
    /// Slots per buffer.
    pub slots: usize,
}

impl Default for RingConfig {
    fn default() -> RingConfig {
        RingConfig {
            buffers: DEFAULT_BUFFERS,
            slots: DEFAULT_SLOTS,
        }
    }
}

struct Slot<K, V> {
    /// 0 marks an empty slot; any other value is the global version
    /// ticket of the pair in `data`, stored after the data write.
    version: AtomicU64,
    data: UnsafeCell<MaybeUninit<(K, V)>>,
}

struct InsertBuffer<K, V> {
    /// shared by appenders, exclusive for the drain barrier
    gate: Latch,
    pos: AtomicUsize,
    /// buffer hits older than this are stale leftovers of an earlier
    /// round and must be ignored
    min_version: AtomicU64,
    slots: Box<[Slot<K, V>]>,
}

impl<K: IndexKey, V: IndexValue> InsertBuffer<K, V> {
    fn new(slots: usize) -> InsertBuffer<K, V> {
        InsertBuffer {
            gate: Latch::new(),
            pos: AtomicUsize::new(0),
            min_version: AtomicU64::new(0),
            slots: (0..slots)
                .map(|_| Slot {
                    version: AtomicU64::new(0),
                    data: UnsafeCell::new(MaybeUninit::uninit()),
                })
                .collect(),
        }
    }
}

/// Ring staging front end over a [`BPlusTree`] of [`Versioned`] values.
///
/// Workers register by index at construction time and pass that index to
/// `insert`; each worker must call [`release`](RingBufferedTree::release)
/// when its stream of inserts ends, or the latch it still holds blocks a
/// later drain for good.
pub struct RingBufferedTree<K, V> {
    tree: BPlusTree<K, Versioned<V>>,
    buffers: Box<[InsertBuffer<K, V>]>,
    /// buffer currently accepting appends; null while a rotation is in
    /// flight
    active: AtomicPtr<InsertBuffer<K, V>>,
    /// global version counter; tickets start at 1 because 0 is the empty
    /// slot sentinel
    version: AtomicU64,
    /// which buffer each worker still holds in shared mode
    last_held: Box<[AtomicPtr<InsertBuffer<K, V>>]>,
}

// SAFETY: slot data is published by the release store of the slot
// version and revalidated after racy reads; latch holds are recorded per
// worker and only touched by that worker.
unsafe impl<K: IndexKey, V: IndexValue> Send for RingBufferedTree<K, V> {}
unsafe impl<K: IndexKey, V: IndexValue> Sync for RingBufferedTree<K, V> {}

impl<K: IndexKey, V: IndexValue> RingBufferedTree<K, V> {
    /// Default-sized ring for `workers` registered workers.
    pub fn with_workers(workers: usize) -> RingBufferedTree<K, V> {
        let config = RingConfig {
            buffers: DEFAULT_BUFFERS.max(workers + 2),
            ..RingConfig::default()
        };
        RingBufferedTree::new(config, workers)
    }

    pub fn new(config: RingConfig, workers: usize) -> RingBufferedTree<K, V> {
        assert!(config.slots >= 1, "a buffer needs at least one slot");
        assert!(
            config.buffers >= workers + 2,
            "rotation needs a spare buffer beyond one parked hold per worker"
        );
        let buffers: Box<[InsertBuffer<K, V>]> = (0..config.buffers)
            .map(|_| InsertBuffer::new(config.slots))
            .collect();
        let active = AtomicPtr::new(&buffers[0] as *const _ as *mut InsertBuffer<K, V>);
        RingBufferedTree {
            tree: BPlusTree::new(),
            buffers,
            active,
            version: AtomicU64::new(0),
            last_held: (0..workers).map(|_| AtomicPtr::new(null_mut())).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.last_held.len()
    }

    #[inline]
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stage the pair into the active buffer, rotating and draining when
    /// it overflows. `worker` is the caller's registered index.
    pub fn insert(&self, worker: usize, key: K, val: V) {
        let mut backoff = Backoff::new();
        loop {
            let buf_ptr = loop {
                let p = self.active.load(Ordering::Acquire);
                if !p.is_null() {
                    break p;
                }
                backoff.pause();
            };
            // SAFETY: buffers live as long as self
            let buf = unsafe { &*buf_ptr };

            let held = self.last_held[worker].load(Ordering::Relaxed);
            if held != buf_ptr {
                if !held.is_null() {
                    // SAFETY: this worker recorded the hold when it took
                    // the shared latch
                    unsafe { (*held).gate.unlock_shared() };
                    self.last_held[worker].store(null_mut(), Ordering::Relaxed);
                }
                if !buf.gate.try_lock_shared() {
                    backoff.pause();
                    continue;
                }
                self.last_held[worker].store(buf_ptr, Ordering::Relaxed);
            }

            let claimed = buf.pos.fetch_add(1, Ordering::AcqRel);
            if claimed < buf.slots.len() {
                let version = self.next_version();
                let slot = &buf.slots[claimed];
                // SAFETY: the slot index was handed out exactly once this
                // round; the version store publishes the write
                unsafe { (*slot.data.get()).write((key, val)) };
                slot.version.store(version, Ordering::Release);
                return;
            }

            // overflow: drop the hold and race to become the rotator
            // SAFETY: held shared per the protocol above
            unsafe { buf.gate.unlock_shared() };
            self.last_held[worker].store(null_mut(), Ordering::Relaxed);

            if self
                .active
                .compare_exchange(buf_ptr, null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let fresh = self.idle_buffer(buf_ptr);
                self.active.store(fresh, Ordering::Release);
                self.drain(buf);
            }

            // the pair that failed to stage goes straight to the tree
            let version = self.next_version();
            self.tree.insert(key, Versioned::new(val, version));
            return;
        }
    }

    /// Find an empty buffer with no holders to publish as the next active
    /// one. Appenders are spinning on the null `active` slot meanwhile,
    /// so this only has to wait for a straggler to let go of a latch.
    fn idle_buffer(&self, exclude: *mut InsertBuffer<K, V>) -> *mut InsertBuffer<K, V> {
        let mut backoff = Backoff::new();
        loop {
            for buf in self.buffers.iter() {
                let ptr = buf as *const _ as *mut InsertBuffer<K, V>;
                if ptr == exclude || buf.pos.load(Ordering::Acquire) != 0 {
                    continue;
                }
                if buf.gate.try_lock_exclusive() {
                    // SAFETY: acquired just above; the probe only proves
                    // nobody holds the buffer
                    unsafe { buf.gate.unlock_exclusive() };
                    return ptr;
                }
            }
            backoff.pause();
        }
    }

    /// Push every staged pair of a rotated-out buffer into the tree, then
    /// reset it for reuse. The exclusive latch is the drain barrier: it is
    /// granted once every shared holder has released.
    fn drain(&self, buf: &InsertBuffer<K, V>) {
        buf.gate.lock_exclusive();
        let filled = buf.pos.load(Ordering::Acquire).min(buf.slots.len());
        let mut drained = 0usize;
        for slot in buf.slots[..filled].iter() {
            let version = slot.version.load(Ordering::Acquire);
            if version == 0 {
                continue;
            }
            // SAFETY: a non-zero slot version is stored only after the
            // data write, and the exclusive latch keeps writers out
            let (key, val) = unsafe { (*slot.data.get()).assume_init_read() };
            self.tree.insert(key, Versioned::new(val, version));
            drained += 1;
        }
        for slot in buf.slots[..filled].iter() {
            slot.version.store(0, Ordering::Relaxed);
        }
        buf.min_version
            .store(self.version.load(Ordering::Acquire), Ordering::Release);
        buf.pos.store(0, Ordering::Release);
        // SAFETY: acquired at the top of this function
        unsafe { buf.gate.unlock_exclusive() };
        debug::record_ring_drain();
        trace!(drained, "drained staging buffer into the tree");
    }

    /// Look the key up, dropping the version stamp.
    pub fn lookup(&self, key: K) -> Option<V> {
        self.lookup_versioned(key).map(|hit| hit.val)
    }

    /// Version-bounded union over every buffer and the tree.
    ///
    /// The snapshot taken up front bounds which staged writes are
    /// visible: a buffer hit counts only if its ticket lies between the
    /// buffer's minimum (staler slots are leftovers of an earlier round)
    /// and the snapshot. Across all candidates the highest version wins,
    /// so a reader never goes back in time for a key within one call.
    pub fn lookup_versioned(&self, key: K) -> Option<Versioned<V>> {
        let snapshot = self.version.load(Ordering::Acquire);
        let mut best: Option<Versioned<V>> = None;
        for buf in self.buffers.iter() {
            let min_version = buf.min_version.load(Ordering::Acquire);
            let filled = buf.pos.load(Ordering::Acquire).min(buf.slots.len());
            for slot in buf.slots[..filled].iter() {
                let version = slot.version.load(Ordering::Acquire);
                if version == 0 || version < min_version || version > snapshot {
                    continue;
                }
                // SAFETY: a non-zero version is stored after the data
                // write; the recheck below discards a recycled slot
                let (k, v) = unsafe { (*slot.data.get()).assume_init_read() };
                if slot.version.load(Ordering::Acquire) != version || k != key {
                    continue;
                }
                let hit = Versioned::new(v, version);
                match best.as_mut() {
                    Some(best) => best.merge_from(hit),
                    None => best = Some(hit),
                }
            }
        }
        // a tree hit is taken even above the snapshot: a newer merge has
        // already consumed any older value, and returning the racing
        // write is legal where reporting absence would not be
        if let Some(hit) = self.tree.lookup(key) {
            match best.as_mut() {
                Some(best) => best.merge_from(hit),
                None => best = Some(hit),
            }
        }
        best
    }

    /// Per-worker exit hook: drops the shared latch the worker still
    /// holds. Rotation cannot complete without it.
    pub fn release(&self, worker: usize) {
        let held = self.last_held[worker].swap(null_mut(), Ordering::Relaxed);
        if !held.is_null() {
            // SAFETY: recorded by this worker when it took the shared
            // latch
            unsafe { (*held).gate.unlock_shared() };
        }
    }

    /// Quiescent access to the underlying tree, for inspection in tests.
    pub fn tree_mut(&mut self) -> &mut BPlusTree<K, Versioned<V>> {
        &mut self.tree
    }
}
