//! Storage abstraction backing the agentpay payment execution core.
//!
//! Every stateful component of the core (guards, fund locks, reservations,
//! circuit breakers, the audit ledger, payment intents) persists through the
//! [`Store`] trait. Two interchangeable backends are provided:
//!
//! * [`MemoryStore`] — process-local, backed by a sharded concurrent map.
//!   Suitable for tests and single-process deployments.
//! * [`RedisStore`] — network-backed. Counter mutations and lock releases
//!   run as server-side Lua so they stay atomic across processes.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use agentpay_store::{MemoryStore, Store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), agentpay_store::StoreError> {
//!     let store = MemoryStore::new();
//!     store.put("greeting", "hello").await?;
//!     let count = store.atomic_add("counter", 1, None).await?;
//!     assert_eq!(count, 1);
//!     let held = store.acquire_lock("lock:w1", "token", Duration::from_secs(30)).await?;
//!     assert!(held);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod memory;
pub mod redis;

use std::time::Duration;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Atomic read-modify-write closure for [`Store::update`].
///
/// Receives the current value (`None` when the key is absent) and returns
/// the replacement value, or `None` to leave the key untouched.
pub type Mutator<'a> = &'a mut (dyn FnMut(Option<&str>) -> Option<String> + Send);

/// Uniform key/value + atomic-counter + compare-and-release lock surface.
///
/// All mutating operations are race-free under concurrent callers: the
/// in-memory backend relies on per-entry locking, the Redis backend on
/// server-side scripting. Callers must not assume any ordering between
/// operations on distinct keys.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Store `value` under `key`, overwriting any previous value.
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Fetch the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically read-modify-write the value under `key`.
    ///
    /// The mutator runs with exclusive access to the key (or inside a
    /// compare-and-set retry loop on network backends, in which case it may
    /// be invoked more than once). Returns the value in place after the
    /// call.
    async fn update(&self, key: &str, mutator: Mutator<'_>) -> Result<Option<String>, StoreError>;

    /// Atomically add `delta` to the integer counter under `key`, creating
    /// it at zero when absent, and return the post-add value.
    ///
    /// When `window` is given and the key is created (or carries no expiry),
    /// the key expires after that duration. Used for windowed rate counters.
    async fn atomic_add(
        &self,
        key: &str,
        delta: i64,
        window: Option<Duration>,
    ) -> Result<i64, StoreError>;

    /// Try to take the lock at `key`, storing `token` as the holder.
    ///
    /// Succeeds iff the key is absent or its previous holder expired.
    /// Returns `false` without blocking when the lock is held.
    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release the lock at `key` iff the stored holder equals `token`.
    ///
    /// The compare and the delete are a single atomic step; a stale holder
    /// can never release a lock that has been re-acquired by someone else.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    /// Return all live `(key, value)` pairs whose key starts with `prefix`.
    ///
    /// Intended for ledger queries only; not optimized for hot paths.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}
