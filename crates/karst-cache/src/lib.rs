//! # karst-cache
//! Delta-set cache substrate and the domain state caches built on it.
//!
//! The substrate gives every cache three views: a committed read-only
//! snapshot, an exclusive delta for block execution, and a detached delta
//! for speculation on other threads. Commits swap an immutable snapshot, so
//! readers holding a view keep seeing the pre-commit state until they drop
//! it.

pub mod accounts;
pub mod block_storage;
pub mod delta_map;
pub mod hash_locks;
pub mod mosaics;
pub mod namespaces;
pub mod secret_locks;
pub mod set;
pub mod snapshot;

pub use accounts::AccountState;
pub use block_storage::{BlockStorage, MemoryBlockStorage};
pub use hash_locks::{HashLockInfo, LockStatus};
pub use mosaics::MosaicEntry;
pub use namespaces::NamespaceEntry;
pub use secret_locks::SecretLockInfo;
pub use set::{CacheDelta, CacheSet, CacheView, DeltaSet, DetachedDelta, StateRead};
pub use snapshot::{BlockUndo, StateSnapshot};
