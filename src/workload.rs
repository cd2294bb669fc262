//! Workload driver internals: the operation model, the text-file parser,
//! the seam trait the three front ends plug into, and the scoped worker
//! pool that replays a workload and measures throughput.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::bulk::BulkBufferedTree;
use crate::error::WorkloadError;
use crate::ring::RingBufferedTree;
use crate::tree::BPlusTree;
use crate::types::{IndexKey, IndexValue};

/// Operations are claimed by workers in chunks of this many.
const CHUNK: usize = 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpKind {
    Insert,
    Read,
}

#[derive(Clone, Copy, Debug)]
pub struct Operation {
    pub kind: OpKind,
    pub key: i64,
}

/// Parse a workload file: one `INSERT <key>` or `READ <key>` per line.
/// Blank lines are skipped; anything else in the op position is fatal.
pub fn read_workload(path: &Path) -> Result<Vec<Operation>, WorkloadError> {
    let text = fs::read_to_string(path).map_err(|source| WorkloadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut ops = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let mut fields = raw.split_whitespace();
        let Some(op) = fields.next() else { continue };
        let kind = match op {
            "INSERT" => OpKind::Insert,
            "READ" => OpKind::Read,
            _ => {
                return Err(WorkloadError::UnknownOp {
                    line,
                    token: op.to_string(),
                })
            }
        };
        let key = fields
            .next()
            .and_then(|field| field.parse::<i64>().ok())
            .ok_or(WorkloadError::BadKey { line })?;
        ops.push(Operation { kind, key });
    }
    Ok(ops)
}

/// The seam between the driver and an index front end. The worker index
/// identifies the calling thread for the ring variant; the others ignore
/// it.
pub trait ConcurrentIndex<K: IndexKey, V: IndexValue>: Send + Sync {
    const NAME: &'static str;

    fn exec_insert(&self, worker: usize, key: K, val: V);
    fn exec_lookup(&self, worker: usize, key: K) -> Option<V>;

    /// Called once per worker when its share of the workload is done.
    fn exec_release(&self, _worker: usize) {}
}

impl<K: IndexKey, V: IndexValue> ConcurrentIndex<K, V> for BPlusTree<K, V> {
    const NAME: &'static str = "olc_btree";

    fn exec_insert(&self, _worker: usize, key: K, val: V) {
        self.insert(key, val);
    }

    fn exec_lookup(&self, _worker: usize, key: K) -> Option<V> {
        self.lookup(key)
    }
}

impl<K: IndexKey, V: IndexValue> ConcurrentIndex<K, V> for BulkBufferedTree<K, V> {
    const NAME: &'static str = "bulk_staged";

    fn exec_insert(&self, _worker: usize, key: K, val: V) {
        self.insert(key, val);
    }

    fn exec_lookup(&self, _worker: usize, key: K) -> Option<V> {
        self.lookup(key)
    }
}

impl<K: IndexKey, V: IndexValue> ConcurrentIndex<K, V> for RingBufferedTree<K, V> {
    const NAME: &'static str = "ring_staged";

    fn exec_insert(&self, worker: usize, key: K, val: V) {
        self.insert(worker, key, val);
    }

    fn exec_lookup(&self, _worker: usize, key: K) -> Option<V> {
        self.lookup(key)
    }

    fn exec_release(&self, worker: usize) {
        self.release(worker);
    }
}

/// One result line per algorithm, printed to stdout as JSON.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub algor: String,
    pub workload: String,
    pub ops_per_sec: f64,
    pub num_threads: usize,
}

/// Replay the operation sequence across `num_threads` workers with
/// dynamic chunked assignment and return operations per second. Inserts
/// store the key as its own value, mirroring the workload format's single
/// integer per line.
pub fn execute<I: ConcurrentIndex<i64, i64>>(
    index: &I,
    ops: &[Operation],
    num_threads: usize,
) -> f64 {
    assert!(num_threads > 0, "need at least one worker");
    let cursor = AtomicUsize::new(0);
    let start = Instant::now();
    thread::scope(|scope| {
        for worker in 0..num_threads {
            let cursor = &cursor;
            scope.spawn(move || {
                loop {
                    let at = cursor.fetch_add(CHUNK, Ordering::Relaxed);
                    if at >= ops.len() {
                        break;
                    }
                    let end = (at + CHUNK).min(ops.len());
                    for op in &ops[at..end] {
                        match op.kind {
                            OpKind::Insert => index.exec_insert(worker, op.key, op.key),
                            OpKind::Read => {
                                index.exec_lookup(worker, op.key);
                            }
                        }
                    }
                }
                index.exec_release(worker);
            });
        }
    });
    let elapsed = start.elapsed();
    debug!(ops = ops.len(), ?elapsed, "workload pass finished");
    ops.len() as f64 / elapsed.as_secs_f64()
}

/// Time one algorithm over the workload and build its report line.
pub fn run_algorithm<I: ConcurrentIndex<i64, i64>>(
    index: &I,
    ops: &[Operation],
    workload: &str,
    num_threads: usize,
) -> RunReport {
    info!(algor = I::NAME, num_threads, "running workload");
    let ops_per_sec = execute(index, ops, num_threads);
    RunReport {
        algor: I::NAME.to_string(),
        workload: workload.to_string(),
        ops_per_sec,
        num_threads,
    }
}
