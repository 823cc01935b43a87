//! Testing utilities for the arbor workspace
//!
//! Shared fixtures: an engine over a fresh [`MemoryStore`] driven by a
//! [`ManualClock`], plus story and branch builders.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use arbor_engine::keys;
use arbor_engine::{
    Branch, BranchEngine, Engagement, EngineConfig, ManualClock, NewBranch, Story, VotingSession,
};
use arbor_store::{KvStore, MemoryStore, StoreError, Version, Versioned};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Fixed start instant for every fixture clock
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub engine: BranchEngine,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::new())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let engine = BranchEngine::with_clock(store.clone(), config, clock.clone());
        Self { store, clock, engine }
    }

    /// Engine over a [`FaultyStore`]; `store` still reads the data directly
    pub fn faulty() -> (Self, Arc<FaultyStore>) {
        let store = Arc::new(MemoryStore::new());
        let faulty = Arc::new(FaultyStore::new(store.clone()));
        let clock = Arc::new(ManualClock::new(epoch()));
        let engine = BranchEngine::with_clock(faulty.clone(), EngineConfig::new(), clock.clone());
        (Self { store, clock, engine }, faulty)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.engine.context().now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn story(&self, story_id: &str) -> Story {
        let story = Story::new(story_id, format!("Story {story_id}"), self.now());
        self.engine.stories().put_story(&story).await.unwrap();
        story
    }

    /// Create the root branch; the clock then ticks one second so creation
    /// order is unambiguous
    pub async fn root(&self, story_id: &str, name: &str) -> Branch {
        let branch = self
            .engine
            .create_branch(NewBranch::root(story_id, name, format!("{name} line"), "sentence_0", "author"))
            .await
            .unwrap();
        self.advance(Duration::seconds(1));
        branch
    }

    pub async fn child(&self, story_id: &str, parent_id: &str, name: &str) -> Branch {
        let branch = self
            .engine
            .create_branch(
                NewBranch::root(story_id, name, format!("{name} fork"), "sentence_0", "author")
                    .with_parent(parent_id),
            )
            .await
            .unwrap();
        self.advance(Duration::seconds(1));
        branch
    }

    /// Load a branch that must exist
    pub async fn branch(&self, branch_id: &str) -> Branch {
        self.engine.get_branch(branch_id).await.unwrap().unwrap()
    }

    pub async fn set_popularity(&self, branch_id: &str, popularity: i64) {
        let mut branch = self.branch(branch_id).await;
        branch.popularity = popularity;
        self.engine.repository().put_branch(&branch).await.unwrap();
    }

    pub async fn set_last_activity(&self, branch_id: &str, at: DateTime<Utc>) {
        let engagement = Engagement::fresh(at);
        self.engine
            .context()
            .records()
            .save(&keys::engagement(branch_id), &engagement)
            .await
            .unwrap();
    }

    /// Cast `count` approving merge votes from distinct voters
    pub async fn approve_merge(&self, branch_id: &str, count: usize) -> VotingSession {
        let mut last = None;
        for i in 0..count {
            let session = self
                .engine
                .vote_branch_merge(branch_id, &format!("voter_{i}"), true)
                .await
                .unwrap();
            last = Some(session);
        }
        last.unwrap()
    }
}

/// Store wrapper that refuses writes to keys under a chosen prefix
#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    refused: Mutex<Option<String>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            refused: Mutex::new(None),
        }
    }

    /// Fail every write to a key starting with `prefix`
    pub fn refuse_writes(&self, prefix: &str) {
        *self.refused.lock() = Some(prefix.to_string());
    }

    pub fn heal(&self) {
        *self.refused.lock() = None;
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        match self.refused.lock().as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                Err(StoreError::Backend(format!("write to {key} refused")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned<String>>, StoreError> {
        self.inner.get_versioned(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<Version, StoreError> {
        self.check(key)?;
        self.inner.set(key, value).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: String,
    ) -> Result<Option<Version>, StoreError> {
        self.check(key)?;
        self.inner.compare_and_set(key, expected, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.delete(key).await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.add_to_set(key, member).await
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.remove_from_set(key, member).await
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.members(key).await
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.is_member(key, member).await
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys_by_prefix(prefix).await
    }
}
