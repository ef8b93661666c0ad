//! Response caching: storage backends, generations and eviction.
//!
//! This module provides:
//! - A `Store` trait with SQLite and in-memory backends
//! - Versioned generations with an install/activate lifecycle
//! - A janitor that evicts entries past a fixed age horizon

mod janitor;
mod manager;
mod memory;
mod storage;
mod traits;

pub use janitor::{Janitor, SweepReport, DEFAULT_HORIZON_DAYS};
pub use manager::{
  ActivationReport, CacheStoreManager, GenerationInfo, GenerationSet, InstallReport, Role,
};
pub use memory::MemoryStore;
pub use storage::SqliteStore;
pub use traits::{CacheEntry, CacheResult, CacheSource, LifecycleState, Store};
