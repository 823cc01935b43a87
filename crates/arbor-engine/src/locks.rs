//! Keyed advisory locks
//!
//! Serializes in-process mutations per branch (votes, merges) and per story
//! (branch creation, maintenance). Cross-process safety comes from the
//! versioned writes in the record layer; these locks only stop local callers
//! from burning retries against each other.
//!
//! Entries live only while someone holds or waits for them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// One branch id
    Branch,
    /// One story id
    Story,
}

type LockKey = (LockScope, String);
type LockMap = DashMap<LockKey, Arc<Mutex<()>>>;

/// Registry of lazily created async mutexes
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Arc<LockMap>,
}

/// Held lock; releasing it drops the registry entry once nobody waits on it
#[derive(Debug)]
pub struct LockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
    key: LockKey,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // the guard owns a handle too; release it before counting
        self.guard.take();
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl LockRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &LockKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for and take the lock for `id` in `scope`
    pub async fn acquire(&self, scope: LockScope, id: &str) -> LockGuard {
        let key = (scope, id.to_string());
        let guard = self.handle(&key).lock_owned().await;
        LockGuard {
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
            key,
        }
    }

    /// Take the lock only if nobody holds it
    pub fn try_acquire(&self, scope: LockScope, id: &str) -> Option<LockGuard> {
        let key = (scope, id.to_string());
        let guard = self.handle(&key).try_lock_owned().ok()?;
        Some(LockGuard {
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
            key,
        })
    }

    /// Number of keys currently held or awaited
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if no lock is held or awaited
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let registry = LockRegistry::new();
        let guard = registry.acquire(LockScope::Story, "s1").await;

        assert!(registry.try_acquire(LockScope::Story, "s1").is_none());
        drop(guard);
        assert!(registry.try_acquire(LockScope::Story, "s1").is_some());
    }

    #[tokio::test]
    async fn scopes_and_keys_are_independent() {
        let registry = LockRegistry::new();
        let _story = registry.acquire(LockScope::Story, "x").await;

        let _branch = registry.try_acquire(LockScope::Branch, "x").unwrap();
        let _other = registry.try_acquire(LockScope::Story, "y").unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let registry = LockRegistry::new();
        for i in 0..100 {
            let _guard = registry.acquire(LockScope::Branch, &format!("b{i}")).await;
        }
        assert!(registry.try_acquire(LockScope::Story, "s1").is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_while_someone_waits() {
        let registry = Arc::new(LockRegistry::new());
        let held = registry.acquire(LockScope::Story, "s1").await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _guard = registry.acquire(LockScope::Story, "s1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        waiter.await.unwrap();
        assert!(registry.is_empty());
    }
}
