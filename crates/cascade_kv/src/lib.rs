//! Ordered key-value engine contract for Cascade.
//!
//! The object store treats the KV engine as an external collaborator: it
//! opens named tables and needs point reads, atomic batches, bounded
//! ordered scans, table clears, and a write barrier. This crate publishes
//! that contract ([`KvEngine`] / [`KvTable`]) together with two engines:
//!
//! - [`MemoryEngine`]: `BTreeMap` tables, plus a batch journal that can
//!   replay a truncated prefix of the write stream for crash testing
//! - [`FileEngine`]: per-table append-only log files with CRC'd frames,
//!   replayed into memory on open
//!
//! Any engine that upholds the trait invariants can be swapped in.

mod engine;
mod error;
mod file;
mod memory;

pub use engine::{BatchOp, KvEngine, KvEntry, KvTable, ScanRange};
pub use error::{KvError, KvResult};
pub use file::FileEngine;
pub use memory::MemoryEngine;
