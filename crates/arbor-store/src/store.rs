//! Key-value store trait
//!
//! [`KvStore`] is everything the engine needs from its persistence layer.
//! Set membership operations are atomic primitives of the backend; record
//! writes are guarded by per-key versions.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Monotonic per-key version stamp
pub type Version = u64;

/// A value together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Stored value
    pub value: T,
    /// Version at read time
    pub version: Version,
}

impl<T> Versioned<T> {
    /// Create versioned value
    #[inline]
    #[must_use]
    pub fn new(value: T, version: Version) -> Self {
        Self { value, version }
    }

    /// Map the value, keeping the version
    #[inline]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            value: f(self.value),
            version: self.version,
        }
    }
}

/// Async key-value store with set membership and prefix scans
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_versioned(key).await?.map(|v| v.value))
    }

    /// Read a value with its current version
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned<String>>, StoreError>;

    /// Unconditionally write a value, returning the new version
    async fn set(&self, key: &str, value: String) -> Result<Version, StoreError>;

    /// Write only if the stored version matches `expected`
    ///
    /// `None` means the key must not exist. Returns the new version on
    /// success and `None` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: String,
    ) -> Result<Option<Version>, StoreError>;

    /// Remove a value (no-op if absent)
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Add a member to the set at `key`
    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove a member from the set at `key`
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of the set at `key` (empty if absent)
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Check set membership
    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Value keys starting with `prefix`
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
