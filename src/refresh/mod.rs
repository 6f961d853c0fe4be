//! Refresh records: the server-side anchor that makes session tokens revocable.
//!
//! Two store engines share the `RefreshTokenStore` contract: a redb-backed
//! persistent store and an in-memory store. A background task purges expired
//! records.

pub mod cleanup;
pub mod memory;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, sweep_once, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use memory::MemoryRefreshTokenStore;
pub use store::{RedbRefreshTokenStore, RefreshTokenStore};
pub use types::{RefreshTokenId, RefreshTokenRecord};
