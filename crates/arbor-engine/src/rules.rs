//! Branching rules
//!
//! A story may carry several rules; the first active one (by rule id)
//! governs. Without one, the engine falls back to the configured defaults.

use crate::context::EngineContext;
use crate::error::{BranchError, Entity, Result};
use crate::keys;
use crate::types::BranchingRule;
use chrono::Duration;

/// Policy values in force for a story
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePolicy {
    /// Concurrent active-branch cap
    pub max_branches: u32,
    /// Voting period
    pub voting_period: Duration,
    /// Votes required before a decision
    pub merge_threshold: u32,
    /// Whether the values came from a stored rule
    pub from_rule: bool,
}

/// Rule storage and selection
#[derive(Debug, Clone)]
pub struct RuleBook {
    ctx: EngineContext,
}

impl RuleBook {
    /// Create over a shared context
    #[inline]
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Validate and store a rule, replacing any rule with the same id
    ///
    /// # Errors
    /// - `Validation` if the rule is malformed
    /// - `NotFound` if the story does not exist
    pub async fn set_branching_rule(&self, rule: &BranchingRule) -> Result<()> {
        rule.validate()?;
        if rule.id.contains(':') {
            return Err(BranchError::Validation("rule id must not contain ':'".to_string()));
        }

        let story_exists = self.ctx.store().get(&keys::story(&rule.story_id)).await?.is_some();
        if !story_exists {
            return Err(BranchError::not_found(Entity::Story, &rule.story_id));
        }

        self.ctx
            .records
            .save(&keys::rule(&rule.story_id, &rule.id), rule)
            .await?;
        tracing::info!(story_id = %rule.story_id, rule_id = %rule.id, "branching rule stored");
        Ok(())
    }

    /// Delete a rule; returns whether it existed
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn remove_branching_rule(&self, story_id: &str, rule_id: &str) -> Result<bool> {
        let key = keys::rule(story_id, rule_id);
        let existed = self.ctx.store().get(&key).await?.is_some();
        self.ctx.records.remove(&key).await?;
        Ok(existed)
    }

    /// Every rule stored for a story, ordered by id
    ///
    /// # Errors
    /// Returns error if the store fails or a rule is malformed
    pub async fn rules_for_story(&self, story_id: &str) -> Result<Vec<BranchingRule>> {
        let keys = self.ctx.store().keys_by_prefix(&keys::rule_prefix(story_id)).await?;
        let mut rules = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(rule) = self.ctx.records.load::<BranchingRule>(&key).await? {
                // the prefix scan is already story-scoped; guard against foreign ids anyway
                if rule.story_id == story_id {
                    rules.push(rule);
                }
            }
        }
        Ok(rules)
    }

    /// The governing rule for a story, if any
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn rule_for_story(&self, story_id: &str) -> Result<Option<BranchingRule>> {
        Ok(self
            .rules_for_story(story_id)
            .await?
            .into_iter()
            .find(|r| r.is_active))
    }

    /// Rule values in force, falling back to configured defaults
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn effective_policy(&self, story_id: &str) -> Result<EffectivePolicy> {
        let policy = match self.rule_for_story(story_id).await? {
            Some(rule) => EffectivePolicy {
                max_branches: rule.max_branches,
                voting_period: rule.voting_period(),
                merge_threshold: rule.merge_threshold,
                from_rule: true,
            },
            None => {
                let defaults = self.ctx.config.defaults;
                EffectivePolicy {
                    max_branches: defaults.max_branches,
                    voting_period: Duration::minutes(defaults.voting_period_minutes),
                    merge_threshold: defaults.merge_threshold,
                    from_rule: false,
                }
            }
        };
        Ok(policy)
    }
}
