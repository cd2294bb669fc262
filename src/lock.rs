//! Concurrency primitives: the versioned optimistic lock carried by every
//! tree node, the restart sentinel and backoff pacing for optimistic
//! retries, and the guard-less shared/exclusive latch used by the staging
//! layers.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

/// Signals that an optimistic traversal observed concurrent mutation and
/// must start over from the root.
#[derive(Debug)]
pub struct Restart;

const OBSOLETE_BIT: u64 = 0b01;
const LOCKED_BIT: u64 = 0b10;

/// A versioned optimistic lock packed into one atomic word:
///
/// | version (62 bits) | locked (1 bit) | obsolete (1 bit) |
///
/// Readers capture the version, read without any state change, and
/// validate the version afterwards. Writers CAS the locked bit in; every
/// write unlock advances the version by one step, which is what
/// invalidates concurrent readers.
pub struct VersionLock(AtomicU64);

impl VersionLock {
    pub fn new() -> VersionLock {
        VersionLock(AtomicU64::new(0))
    }

    /// Capture the current version for an optimistic read.
    #[inline]
    pub fn read_lock(&self) -> Result<u64, Restart> {
        let version = self.0.load(Ordering::Acquire);
        match version & (LOCKED_BIT | OBSOLETE_BIT) {
            0 => Ok(version),
            _ => Err(Restart),
        }
    }

    /// Validate that nothing changed since `version` was captured.
    #[inline]
    pub fn check(&self, version: u64) -> Result<(), Restart> {
        match self.0.load(Ordering::Acquire) == version {
            true => Ok(()),
            false => Err(Restart),
        }
    }

    /// Finish an optimistic read. The read only counts if this succeeds.
    #[inline]
    pub fn read_unlock(&self, version: u64) -> Result<(), Restart> {
        self.check(version)
    }

    /// Atomically turn a captured read version into exclusive ownership.
    #[inline]
    pub fn upgrade(&self, version: u64) -> Result<(), Restart> {
        match self.0.compare_exchange(
            version,
            version + LOCKED_BIT,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(Restart),
        }
    }

    /// Blocking write acquisition: retry the read/upgrade pair until it
    /// lands. Used where the caller has nothing useful to do on conflict.
    pub fn write_lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            if let Ok(version) = self.read_lock() {
                if self.upgrade(version).is_ok() {
                    return;
                }
            }
            backoff.pause();
        }
    }

    /// Release exclusive ownership; the carry out of the locked bit is
    /// the version increment.
    #[inline]
    pub fn write_unlock(&self) {
        self.0.fetch_add(LOCKED_BIT, Ordering::Release);
    }

    /// Release and retire the node in one step. A retired node must never
    /// be written again; readers that observe it restart.
    #[inline]
    pub fn write_unlock_obsolete(&self) {
        self.0.fetch_add(LOCKED_BIT | OBSOLETE_BIT, Ordering::Release);
    }
}

impl Default for VersionLock {
    fn default() -> VersionLock {
        VersionLock::new()
    }
}

/// Restart counter with exponential, jittered pacing. Early restarts spin
/// briefly; persistent contention is handed to the scheduler. There is no
/// retry limit.
pub struct Backoff {
    restarts: u32,
}

/// Restarts beyond this count stop spinning and yield instead.
const SPIN_RESTARTS: u32 = 6;

impl Backoff {
    pub fn new() -> Backoff {
        Backoff { restarts: 0 }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Pause before the next attempt, scaling with the restart count.
    pub fn pause(&mut self) {
        self.restarts += 1;
        if self.restarts <= SPIN_RESTARTS {
            let cap = 1u32 << self.restarts;
            // jitter keeps contending threads from pausing in lockstep
            for _ in 0..fastrand::u32(cap / 2..=cap) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::new()
    }
}

/// Guard-less shared/exclusive latch: many concurrent appenders, one
/// drainer. The staging layers hold the shared side across calls, so a
/// scoped guard does not fit; pairing of lock and unlock is part of their
/// protocol.
pub struct Latch(RawRwLock);

impl Latch {
    pub fn new() -> Latch {
        Latch(RawRwLock::INIT)
    }

    #[inline]
    pub fn lock_shared(&self) {
        self.0.lock_shared();
    }

    #[inline]
    pub fn try_lock_shared(&self) -> bool {
        self.0.try_lock_shared()
    }

    /// SAFETY: the caller must hold a shared lock acquired on this latch.
    #[inline]
    pub unsafe fn unlock_shared(&self) {
        self.0.unlock_shared();
    }

    #[inline]
    pub fn lock_exclusive(&self) {
        self.0.lock_exclusive();
    }

    #[inline]
    pub fn try_lock_exclusive(&self) -> bool {
        self.0.try_lock_exclusive()
    }

    /// SAFETY: the caller must hold the exclusive lock on this latch.
    #[inline]
    pub unsafe fn unlock_exclusive(&self) {
        self.0.unlock_exclusive();
    }
}

impl Default for Latch {
    fn default() -> Latch {
        Latch::new()
    }
}
