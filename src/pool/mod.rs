//! Slot Pool Allocator
//!
//! Each pool is a fixed set of integer-identified slots provisioned once.
//! Slots cycle between free and live-bound as urls are registered and
//! their TTL runs out; ids never change.
//!
//! # Architecture
//!
//! ```text
//! SlotAllocator (allocate / allocate_batch / resolve)
//!   └─→ dyn SlotStore ── begin() ──→ SlotTransaction
//!         └─→ SlotTable                lock_live / lock_free / update / commit
//!               ├─→ row locks          one per slot
//!               ├─→ url lock stripes   serialize lookups of the same url
//!               └─→ SlotJournal        [batch][batch][batch]... (fsync per commit)
//! ```

pub mod allocator;
pub mod journal;
pub mod slot;
pub mod store;
pub mod table;

pub use allocator::{Allocation, BatchAllocation, SlotAllocator};
pub use journal::{JournalBatch, SlotJournal};
pub use slot::{validate_url, PoolKind, Slot, SlotId, SlotOptions, MAX_URL_LENGTH};
pub use store::{PoolStats, SlotStore, SlotTransaction};
pub use table::{SlotTable, TableOptions};
