//! Popularity scorer
//!
//! Ranks branches from engagement signals:
//!
//! | Signal | Contribution |
//! |--------|--------------|
//! | recency | `max(0, 1 - days_idle / 7) * 30` |
//! | contributions | `× 10` |
//! | votes | `max(0, votes) × 5` |
//! | views | `ln(views + 1) × 2` |
//! | children | `× 15` |
//!
//! Scoring is best effort: failures are logged and reported as `false`.

use crate::context::EngineContext;
use crate::error::{BranchError, Result};
use crate::keys;
use crate::types::{Branch, Engagement, EngagementKind};
use arbor_store::StoreError;
use chrono::{DateTime, Utc};

/// Days over which the recency bonus decays to zero
pub const RECENCY_WINDOW_DAYS: f64 = 7.0;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Score a branch from its engagement and child count at `now`
#[must_use]
pub fn compute_popularity(engagement: &Engagement, child_count: usize, now: DateTime<Utc>) -> i64 {
    #[allow(clippy::cast_precision_loss)]
    let idle_days = (now - engagement.last_activity).num_milliseconds() as f64 / MILLIS_PER_DAY;
    let recency = (1.0 - idle_days.max(0.0) / RECENCY_WINDOW_DAYS).max(0.0) * 30.0;

    #[allow(clippy::cast_precision_loss)]
    let score = recency
        + engagement.contributions as f64 * 10.0
        + engagement.votes.max(0) as f64 * 5.0
        + (engagement.views.max(0) as f64 + 1.0).ln() * 2.0
        + child_count as f64 * 15.0;

    #[allow(clippy::cast_possible_truncation)]
    let rounded = score.round() as i64;
    rounded
}

/// Maintains popularity scores and engagement counters
#[derive(Debug, Clone)]
pub struct PopularityScorer {
    ctx: EngineContext,
}

impl PopularityScorer {
    /// Create over a shared context
    #[inline]
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Engagement counters of a branch
    ///
    /// # Errors
    /// Returns error if the store fails or the record is malformed
    pub async fn engagement(&self, branch_id: &str) -> Result<Option<Engagement>> {
        Ok(self.ctx.records.load(&keys::engagement(branch_id)).await?)
    }

    /// Recompute and store a branch's popularity
    ///
    /// Returns `false` if the branch does not exist or the update failed.
    pub async fn update_branch_popularity(&self, branch_id: &str) -> bool {
        match self.try_update_popularity(branch_id).await {
            Ok(Some(score)) => {
                tracing::debug!(branch_id, score, "popularity updated");
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(branch_id, error = %e, "popularity update failed");
                false
            }
        }
    }

    /// Record an engagement signal and rescore the branch
    ///
    /// Views never count as activity. Returns `false` if the branch does not
    /// exist, the amount is invalid for the signal, or a write failed.
    pub async fn track_engagement(&self, branch_id: &str, kind: EngagementKind, amount: i64) -> bool {
        if amount == 0 || (amount < 0 && kind != EngagementKind::Vote) {
            tracing::warn!(branch_id, ?kind, amount, "rejected engagement amount");
            return false;
        }

        match self.try_track(branch_id, kind, amount).await {
            Ok(true) => self.update_branch_popularity(branch_id).await,
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(branch_id, ?kind, error = %e, "engagement tracking failed");
                false
            }
        }
    }

    /// Rescore every active branch of a story; returns how many were updated
    pub async fn refresh_story(&self, story_id: &str) -> usize {
        let ids = match self.ctx.store().members(&keys::active_branches(story_id)).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(story_id, error = %e, "cannot list active branches for rescoring");
                return 0;
            }
        };

        let mut updated = 0;
        for id in ids {
            if self.update_branch_popularity(&id).await {
                updated += 1;
            }
        }
        updated
    }

    async fn try_update_popularity(&self, branch_id: &str) -> Result<Option<i64>> {
        let now = self.ctx.now();
        let engagement = self
            .engagement(branch_id)
            .await?
            .unwrap_or_else(|| Engagement::fresh(now));

        self.ctx
            .records
            .update(&keys::branch(branch_id), |branch: &mut Branch| -> Result<i64> {
                branch.popularity = compute_popularity(&engagement, branch.child_branches.len(), now);
                Ok(branch.popularity)
            })
            .await
    }

    async fn try_track(&self, branch_id: &str, kind: EngagementKind, amount: i64) -> Result<bool> {
        if self.ctx.records.load::<Branch>(&keys::branch(branch_id)).await?.is_none() {
            return Ok(false);
        }

        let now = self.ctx.now();
        let apply = |e: &mut Engagement| {
            match kind {
                EngagementKind::View => e.views = e.views.saturating_add(amount),
                EngagementKind::Contribution => e.contributions = e.contributions.saturating_add(amount),
                EngagementKind::Vote => e.votes = e.votes.saturating_add(amount),
            }
            if kind.bumps_activity() {
                e.last_activity = now;
            }
        };

        let key = keys::engagement(branch_id);
        for _ in 0..self.ctx.config.cas_attempts {
            let updated = self
                .ctx
                .records
                .update(&key, |e: &mut Engagement| -> Result<()> {
                    apply(e);
                    Ok(())
                })
                .await?;
            if updated.is_some() {
                return Ok(true);
            }

            // First signal seeds the record the scorer assumes when none exists
            let mut fresh = Engagement::fresh(now);
            apply(&mut fresh);
            if self.ctx.records.insert_new(&key, &fresh).await? {
                return Ok(true);
            }
        }

        Err(BranchError::Store(StoreError::Conflict {
            key,
            attempts: self.ctx.config.cas_attempts,
        }))
    }
}
