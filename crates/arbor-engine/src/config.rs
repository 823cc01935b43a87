//! Engine configuration
//!
//! Reads from a TOML file. Every field has a default, so an empty or missing
//! file yields [`EngineConfig::default`].

use crate::error::{BranchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine-wide tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rule values used when a story has no active branching rule
    pub defaults: RuleDefaults,

    /// Minimum approval ratio for a decided session to pass
    pub approval_ratio: f64,

    /// Days without activity before a branch counts as dormant
    pub inactivity_days: i64,

    /// Share of source popularity credited to the merge target
    pub merge_popularity_share: f64,

    /// Delete-vote threshold as a fraction of the merge threshold
    pub delete_threshold_factor: f64,

    /// Floor for the delete-vote threshold
    pub min_delete_threshold: u32,

    /// Read-modify-write attempts before reporting a conflict
    pub cas_attempts: u32,
}

/// Fallback branching rule values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDefaults {
    /// Concurrent active-branch cap
    pub max_branches: u32,
    /// Voting period in minutes
    pub voting_period_minutes: i64,
    /// Votes required before a decision
    pub merge_threshold: u32,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            max_branches: 10,
            voting_period_minutes: 24 * 60,
            merge_threshold: 5,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            defaults: RuleDefaults::default(),
            approval_ratio: 0.6,
            inactivity_days: 7,
            merge_popularity_share: 0.5,
            delete_threshold_factor: 0.7,
            min_delete_threshold: 2,
            cas_attempts: arbor_store::DEFAULT_CAS_ATTEMPTS,
        }
    }
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With fallback rule values
    #[inline]
    #[must_use]
    pub fn with_defaults(mut self, defaults: RuleDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// With dormancy threshold in days
    #[inline]
    #[must_use]
    pub fn with_inactivity_days(mut self, days: i64) -> Self {
        self.inactivity_days = days;
        self
    }

    /// With approval ratio
    #[inline]
    #[must_use]
    pub fn with_approval_ratio(mut self, ratio: f64) -> Self {
        self.approval_ratio = ratio;
        self
    }

    /// With read-modify-write retry budget
    #[inline]
    #[must_use]
    pub fn with_cas_attempts(mut self, attempts: u32) -> Self {
        self.cas_attempts = attempts;
        self
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// Returns `Validation` if the text is not valid TOML or the values are out of range
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| BranchError::Validation(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file; a missing file yields defaults
    ///
    /// # Errors
    /// Returns `Validation` if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(BranchError::Validation(format!(
                "config {}: {e}",
                path.display()
            ))),
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `Validation` naming the first out-of-range field
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(BranchError::Validation(msg.to_string()));

        if !(0.0..=1.0).contains(&self.approval_ratio) {
            return fail("approval_ratio must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.merge_popularity_share) {
            return fail("merge_popularity_share must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.delete_threshold_factor) {
            return fail("delete_threshold_factor must be within 0..=1");
        }
        if self.inactivity_days < 1 {
            return fail("inactivity_days must be at least 1");
        }
        if self.cas_attempts == 0 {
            return fail("cas_attempts must be at least 1");
        }
        if self.defaults.max_branches == 0
            || self.defaults.merge_threshold == 0
            || self.defaults.voting_period_minutes < 1
        {
            return fail("rule defaults must be positive");
        }
        Ok(())
    }

    /// Threshold for a delete vote derived from a merge threshold
    #[must_use]
    pub fn delete_threshold(&self, merge_threshold: u32) -> u32 {
        // epsilon keeps 10 * 0.7 from flooring to 6
        let scaled = (f64::from(merge_threshold) * self.delete_threshold_factor + 1e-9).floor();
        // scaled is non-negative and bounded by merge_threshold
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = scaled as u32;
        scaled.max(self.min_delete_threshold)
    }
}
