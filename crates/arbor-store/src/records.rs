//! Typed JSON records over a [`KvStore`]
//!
//! Every mutation of a stored document goes through [`Records::update`], an
//! optimistic read-modify-write loop: read the document and its version,
//! apply the change in memory, then write it back only if the version is
//! unchanged. A lost race rereads and reapplies the change.

use crate::error::StoreError;
use crate::store::{KvStore, Version, Versioned};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Default number of read-modify-write attempts before reporting a conflict
pub const DEFAULT_CAS_ATTEMPTS: u32 = 8;

/// Typed document access with compare-and-swap updates
#[derive(Debug, Clone)]
pub struct Records {
    store: Arc<dyn KvStore>,
    max_attempts: u32,
}

impl Records {
    /// Wrap a store
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    /// With a custom retry budget (minimum 1)
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Underlying store, for set and prefix operations
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Load and decode a document
    ///
    /// # Errors
    /// Returns error if the backend fails or the document does not decode
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Load and decode a document with its version
    ///
    /// # Errors
    /// Returns error if the backend fails or the document does not decode
    pub async fn load_versioned<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        match self.store.get_versioned(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw.value)?;
                Ok(Some(Versioned::new(value, raw.version)))
            }
            None => Ok(None),
        }
    }

    /// Unconditionally write a document
    ///
    /// # Errors
    /// Returns error if encoding or the backend fails
    pub async fn save<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<Version, StoreError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw).await
    }

    /// Write a document only if `key` is still at `expected`
    ///
    /// Returns `false` when another writer changed the key first.
    ///
    /// # Errors
    /// Returns error if encoding or the backend fails
    pub async fn save_if<T: Serialize + Sync>(
        &self,
        key: &str,
        expected: Option<Version>,
        value: &T,
    ) -> Result<bool, StoreError> {
        let raw = serde_json::to_string(value)?;
        Ok(self.store.compare_and_set(key, expected, raw).await?.is_some())
    }

    /// Create a document; returns `false` if the key already exists
    ///
    /// # Errors
    /// Returns error if encoding or the backend fails
    pub async fn insert_new<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<bool, StoreError> {
        self.save_if(key, None, value).await
    }

    /// Delete a document
    ///
    /// # Errors
    /// Returns error if the backend fails
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await
    }

    /// Read-modify-write a document under optimistic concurrency
    ///
    /// `apply` may run more than once if the write races with another
    /// writer, so it must only touch the document it is given. An error
    /// from `apply` aborts the update without writing.
    ///
    /// Returns `Ok(None)` if the document does not exist.
    ///
    /// # Errors
    /// - whatever `apply` returns
    /// - `StoreError::Conflict` (converted into `E`) when every attempt lost the race
    pub async fn update<T, R, E, F>(&self, key: &str, mut apply: F) -> Result<Option<R>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        R: Send,
        E: From<StoreError> + Send,
        F: FnMut(&mut T) -> Result<R, E> + Send,
    {
        for attempt in 1..=self.max_attempts {
            let Some(current) = self.load_versioned::<T>(key).await? else {
                return Ok(None);
            };

            let mut value = current.value;
            let outcome = apply(&mut value)?;

            if self.save_if(key, Some(current.version), &value).await? {
                return Ok(Some(outcome));
            }

            tracing::debug!(key, attempt, "version conflict, retrying update");
        }

        tracing::warn!(key, attempts = self.max_attempts, "update abandoned after repeated conflicts");
        Err(StoreError::Conflict {
            key: key.to_string(),
            attempts: self.max_attempts,
        }
        .into())
    }
}
