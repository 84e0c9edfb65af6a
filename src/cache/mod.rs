//! Keyed cache for logical queries.
//!
//! This module provides the per-key cache entry state machine and the
//! store that orchestrates it:
//! - lazy entry creation on first read, snapshot-style synchronous reads
//! - request de-duplication: one in-flight fetch per key
//! - version-guarded completion: superseded responses are discarded
//! - staleness policy, prefix invalidation, and explicit GC sweeps

mod entry;
mod store;

pub use entry::{EntrySnapshot, QueryStatus};
pub use store::{CacheConfig, QueryCache, ReadOptions};
