//! Foxtrot - a concurrent, in-memory, ordered key→value index built for
//! many hardware threads doing mixed point inserts and point lookups.
//!
//! The load-bearing structure is a B+-tree with optimistic lock coupling:
//! readers validate per-node versions instead of taking locks, writers
//! split full pages eagerly on the way down, and any conflict restarts
//! the traversal from the root. In front of it sit two alternative
//! staging layers that amortise insert cost under write-heavy load: a
//! shared bulk leaf that appenders fill collaboratively and install into
//! the tree whole ([`bulk::BulkBufferedTree`]), and a rotating set of
//! per-buffer slots with version-stamped values for consistent reads
//! ([`ring::RingBufferedTree`]). All three expose the same insert/lookup
//! contract.
//!
//! There is no deletion, no range access, and no persistence.

pub mod bulk;
pub mod debug;
pub mod error;
pub mod lock;
mod node;
pub mod ring;
pub mod tree;
pub mod types;
pub mod workload;

pub use crate::bulk::BulkBufferedTree;
pub use crate::error::WorkloadError;
pub use crate::ring::{RingBufferedTree, RingConfig};
pub use crate::tree::BPlusTree;
pub use crate::types::{IndexKey, IndexValue, Versioned};
pub use crate::workload::ConcurrentIndex;
