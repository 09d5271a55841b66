//! Artifact cache: entries, the persisted index, the engine and its
//! background sweeper.

pub mod engine;
pub mod entry;
pub mod index;
pub mod sweeper;

pub use engine::{CacheEngine, CacheSettings, CacheStats, CommitOutcome, Evicted, SweepReport, SweepTrigger};
pub use entry::{CacheEntry, EntryKey};
pub use index::{CacheIndex, IndexRow};
pub use sweeper::{start_sweeper, SweeperHandle};
