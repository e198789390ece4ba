//! Key-value storage for coordinator metadata.
//!
//! The coordinator persists every scheduling step through this interface.
//! The contract mirrors an etcd-style store: string keys, binary values,
//! ordered prefix scans, and batched writes. The primary deployment backs it
//! with an external store; [`MemoryKv`] serves tests and embedded use.

mod memory;

pub use memory::MemoryKv;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by key-value backends.
#[derive(Debug, Error)]
pub enum KvError {
    /// An internal lock was poisoned.
    #[error("lock poisoned")]
    LockPoisoned,

    /// The backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for key-value operations.
pub type Result<T> = std::result::Result<T, KvError>;

/// Durable ordered key-value store with prefix operations.
///
/// The coordinator is the single writer of its namespace. Batched operations
/// (`multi_save`, `multi_remove`) must apply atomically: either every entry
/// is written/removed or none is.
#[async_trait]
pub trait MetaKv: Send + Sync {
    /// Saves one key-value pair, overwriting any existing value.
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Loads the value stored under a key.
    ///
    /// Returns `None` if the key does not exist.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Loads every pair whose key starts with the prefix, in key order.
    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Saves a batch of pairs atomically.
    async fn multi_save(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// Removes one key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Removes a batch of keys atomically.
    async fn multi_remove(&self, keys: Vec<String>) -> Result<()>;

    /// Removes every key starting with the prefix.
    async fn remove_with_prefix(&self, prefix: &str) -> Result<()>;
}
