//! Shared engine context
//!
//! Every component holds a cheap clone of [`EngineContext`]: the record
//! layer, configuration, clock and lock registry.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::locks::LockRegistry;
use arbor_store::{KvStore, Records};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Handles shared by all engine components
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub(crate) records: Records,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) locks: Arc<LockRegistry>,
}

impl EngineContext {
    /// Create context over a store with the system clock
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create context with an explicit clock
    ///
    /// Out-of-range values are logged; a zero retry budget is raised to one.
    #[must_use]
    pub fn with_clock(store: Arc<dyn KvStore>, mut config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "engine configuration out of range");
        }
        config.cas_attempts = config.cas_attempts.max(1);

        let records = Records::new(store).with_max_attempts(config.cas_attempts);
        Self {
            records,
            config: Arc::new(config),
            clock,
            locks: Arc::new(LockRegistry::new()),
        }
    }

    /// Typed record access
    #[inline]
    #[must_use]
    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Raw store access
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        self.records.store()
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current time from the injected clock
    #[inline]
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Lock registry
    #[inline]
    #[must_use]
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }
}
