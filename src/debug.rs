//! Process-wide event counters for tests and tuning. Updates are relaxed;
//! the numbers are only meaningful at quiescence.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};

static RESTARTS: AtomicU64 = AtomicU64::new(0);
static LEAF_SPLITS: AtomicU64 = AtomicU64::new(0);
static INNER_SPLITS: AtomicU64 = AtomicU64::new(0);
static ROOT_GROWTHS: AtomicU64 = AtomicU64::new(0);
static BULK_SEALS: AtomicU64 = AtomicU64::new(0);
static RING_DRAINS: AtomicU64 = AtomicU64::new(0);

pub fn record_restart() {
    RESTARTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_leaf_split() {
    LEAF_SPLITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_inner_split() {
    INNER_SPLITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_root_growth() {
    ROOT_GROWTHS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_bulk_seal() {
    BULK_SEALS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_ring_drain() {
    RING_DRAINS.fetch_add(1, Ordering::Relaxed);
}

pub fn reset_debug_counters() {
    RESTARTS.store(0, Ordering::Relaxed);
    LEAF_SPLITS.store(0, Ordering::Relaxed);
    INNER_SPLITS.store(0, Ordering::Relaxed);
    ROOT_GROWTHS.store(0, Ordering::Relaxed);
    BULK_SEALS.store(0, Ordering::Relaxed);
    RING_DRAINS.store(0, Ordering::Relaxed);
}

pub fn restarts() -> u64 {
    RESTARTS.load(Ordering::Relaxed)
}

pub fn leaf_splits() -> u64 {
    LEAF_SPLITS.load(Ordering::Relaxed)
}

pub fn inner_splits() -> u64 {
    INNER_SPLITS.load(Ordering::Relaxed)
}

pub fn root_growths() -> u64 {
    ROOT_GROWTHS.load(Ordering::Relaxed)
}

pub fn bulk_seals() -> u64 {
    BULK_SEALS.load(Ordering::Relaxed)
}

pub fn ring_drains() -> u64 {
    RING_DRAINS.load(Ordering::Relaxed)
}
