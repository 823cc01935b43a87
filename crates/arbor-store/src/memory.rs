//! In-memory store backend
//!
//! Provides [`MemoryStore`], a concurrent [`KvStore`] used by tests and by the
//! operator binary (which persists it between runs as a JSON snapshot).

use crate::error::StoreError;
use crate::store::{KvStore, Version, Versioned};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent in-memory store
///
/// Values and sets live in separate `DashMap`s so set membership never
/// contends with record writes. Versions come from a single counter, so a
/// key that is deleted and recreated never reuses an old version.
#[derive(Debug)]
pub struct MemoryStore {
    /// key -> stored value
    values: DashMap<String, Slot>,

    /// key -> set members
    sets: DashMap<String, BTreeSet<String>>,

    /// Next version to hand out
    next_version: AtomicU64,
}

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    version: Version,
}

/// Serializable image of a [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Plain values
    #[serde(default)]
    pub values: BTreeMap<String, String>,

    /// Set values
    #[serde(default)]
    pub sets: BTreeMap<String, BTreeSet<String>>,
}

impl MemoryStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            next_version: AtomicU64::new(1),
        }
    }

    /// Rebuild a store from a snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        for (key, value) in snapshot.values {
            let version = store.bump();
            store.values.insert(key, Slot { value, version });
        }
        for (key, members) in snapshot.sets {
            if !members.is_empty() {
                store.sets.insert(key, members);
            }
        }
        store
    }

    /// Capture the current contents
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            values: self
                .values
                .iter()
                .map(|e| (e.key().clone(), e.value().value.clone()))
                .collect(),
            sets: self
                .sets
                .iter()
                .filter(|e| !e.value().is_empty())
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Load a snapshot file; a missing file yields an empty store
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
                tracing::debug!(path = %path.display(), values = snapshot.values.len(), "loaded store snapshot");
                Ok(Self::from_snapshot(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the current contents to a snapshot file
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub async fn save_file(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        tokio::fs::write(path.as_ref(), json).await?;
        Ok(())
    }

    /// Number of plain values
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if no plain values are stored
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn bump(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned<String>>, StoreError> {
        Ok(self
            .values
            .get(key)
            .map(|slot| Versioned::new(slot.value.clone(), slot.version)))
    }

    async fn set(&self, key: &str, value: String) -> Result<Version, StoreError> {
        let version = self.bump();
        self.values.insert(key.to_string(), Slot { value, version });
        Ok(version)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: String,
    ) -> Result<Option<Version>, StoreError> {
        // The entry guard holds the shard lock for the whole check-and-write
        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().version) {
                    return Ok(None);
                }
                let version = self.bump();
                occupied.insert(Slot { value, version });
                Ok(Some(version))
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(None);
                }
                let version = self.bump();
                vacant.insert(Slot { value, version });
                Ok(Some(version))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member)))
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
