//! Maintenance orchestrator
//!
//! The scheduled sweep over a story:
//! 1. resolve lapsed and decided voting sessions
//! 2. retire dormant leaves, put dormant inner branches to a delete vote
//! 3. execute approved merges
//! 4. rescore the remaining active branches
//!
//! Nothing here returns an error. Failures are logged and the affected
//! branch or step contributes nothing to the report.

use crate::context::EngineContext;
use crate::error::Result;
use crate::keys;
use crate::locks::LockScope;
use crate::merge::{MergeEngine, MergeResult};
use crate::popularity::PopularityScorer;
use crate::repository::BranchRepository;
use crate::rules::{EffectivePolicy, RuleBook};
use crate::stories::StoryRecords;
use crate::types::{Branch, Engagement};
use crate::voting::{VotingEngine, VotingSession, VotingStatus, VotingType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Deactivation reason for dormant leaves
pub const INACTIVE_REASON: &str = "inactive";

/// Deactivation reason for branches retired by a delete vote
pub const COMMUNITY_VOTE_REASON: &str = "community_vote";

/// Check if a branch idle since `last_activity` is past the inactivity window
#[inline]
#[must_use]
pub fn is_dormant(last_activity: DateTime<Utc>, now: DateTime<Utc>, inactivity_days: i64) -> bool {
    now - last_activity > Duration::days(inactivity_days)
}

/// Summary of one maintenance run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Story swept
    pub story_id: String,
    /// Branches deactivated in this run
    pub cleaned_branches: Vec<String>,
    /// Merges attempted in this run
    pub merge_results: Vec<MergeResult>,
    /// Branches rescored
    pub refreshed: usize,
    /// Human-readable summary
    pub message: String,
}

impl MaintenanceReport {
    /// Check if the run changed nothing beyond rescoring
    #[inline]
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.cleaned_branches.is_empty() && self.merge_results.is_empty()
    }
}

/// What cleanup did to one branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    Untouched,
    Deactivated,
    DeleteVoteOpened,
}

/// Runs the maintenance sweep
#[derive(Debug, Clone)]
pub struct MaintenanceOrchestrator {
    ctx: EngineContext,
    repo: BranchRepository,
    rules: RuleBook,
    stories: StoryRecords,
    voting: VotingEngine,
    merges: MergeEngine,
    popularity: PopularityScorer,
}

impl MaintenanceOrchestrator {
    /// Create over a shared context
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            repo: BranchRepository::new(ctx.clone()),
            rules: RuleBook::new(ctx.clone()),
            stories: StoryRecords::new(ctx.clone()),
            voting: VotingEngine::new(ctx.clone()),
            merges: MergeEngine::new(ctx.clone()),
            popularity: PopularityScorer::new(ctx.clone()),
            ctx,
        }
    }

    /// Resolve sessions and handle dormant branches of a story
    ///
    /// Returns the ids deactivated in this pass.
    pub async fn cleanup_inactive_branches(&self, story_id: &str) -> Vec<String> {
        let (active, policy) = match self.load_story_state(story_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(story_id, error = %e, "cleanup skipped");
                return Vec::new();
            }
        };

        let mut cleaned = Vec::new();
        for branch in &active {
            match self.clean_branch(branch, &policy).await {
                Ok(Cleanup::Deactivated) => cleaned.push(branch.id.clone()),
                Ok(Cleanup::DeleteVoteOpened | Cleanup::Untouched) => {}
                Err(e) => tracing::warn!(story_id, branch_id = %branch.id, error = %e, "branch cleanup failed"),
            }
        }
        cleaned
    }

    /// Full sweep of one story, serialized per story
    #[tracing::instrument(skip(self))]
    pub async fn run_branch_maintenance(&self, story_id: &str) -> MaintenanceReport {
        let _guard = self.ctx.locks.acquire(LockScope::Story, story_id).await;

        let cleaned_branches = self.cleanup_inactive_branches(story_id).await;
        let merge_results = match self.merges.process_approved_merges(story_id).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(story_id, error = %e, "approved merges skipped");
                Vec::new()
            }
        };
        let refreshed = self.popularity.refresh_story(story_id).await;

        let merged = merge_results.iter().filter(|r| r.success).count();
        let message = format!(
            "cleaned {} branches, merged {merged} of {} approved, rescored {refreshed}",
            cleaned_branches.len(),
            merge_results.len()
        );
        tracing::info!(
            story_id,
            cleaned = cleaned_branches.len(),
            merged,
            refreshed,
            "maintenance finished"
        );

        MaintenanceReport {
            story_id: story_id.to_string(),
            cleaned_branches,
            merge_results,
            refreshed,
            message,
        }
    }

    /// Sweep every stored story
    pub async fn run_all_maintenance(&self) -> Vec<MaintenanceReport> {
        let story_ids = match self.stories.list_story_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "cannot enumerate stories");
                return Vec::new();
            }
        };

        let mut reports = Vec::with_capacity(story_ids.len());
        for story_id in story_ids {
            reports.push(self.run_branch_maintenance(&story_id).await);
        }
        reports
    }

    async fn load_story_state(&self, story_id: &str) -> Result<(Vec<Branch>, EffectivePolicy)> {
        let active = self.repo.get_active_branches(story_id).await?;
        let policy = self.rules.effective_policy(story_id).await?;
        Ok((active, policy))
    }

    async fn clean_branch(&self, branch: &Branch, policy: &EffectivePolicy) -> Result<Cleanup> {
        let branch_id = branch.id.as_str();
        let mut session = self.voting.get_voting_session(branch_id).await?;

        if session.as_ref().is_some_and(|s| s.is_past_deadline(self.ctx.now())) {
            if let Some(expired) = self.voting.expire_if_due(branch_id).await? {
                session = Some(expired);
            }
        }

        if let Some(decided) = session.as_ref().filter(|s| s.status == VotingStatus::Passed) {
            match decided.voting_type {
                VotingType::Delete => {
                    self.repo
                        .deactivate_branch(branch_id, Some(COMMUNITY_VOTE_REASON))
                        .await?;
                    self.voting.clear_session(branch_id).await?;
                    return Ok(Cleanup::Deactivated);
                }
                VotingType::KeepSeparate => {
                    self.ctx
                        .records
                        .update(&keys::branch(branch_id), |b: &mut Branch| -> Result<()> {
                            b.merge_candidate = false;
                            Ok(())
                        })
                        .await?;
                    self.voting.clear_session(branch_id).await?;
                    tracing::info!(branch_id, "branch confirmed separate");
                    session = None;
                }
                // consumed by the merge step
                VotingType::Merge => {}
            }
        }

        let now = self.ctx.now();
        let last_activity = self
            .ctx
            .records
            .load::<Engagement>(&keys::engagement(branch_id))
            .await?
            .map_or(branch.created_at, |e| e.last_activity);
        if !is_dormant(last_activity, now, self.ctx.config.inactivity_days) {
            return Ok(Cleanup::Untouched);
        }

        if branch.is_leaf() {
            self.repo.deactivate_branch(branch_id, Some(INACTIVE_REASON)).await?;
            if session.is_some() {
                self.voting.clear_session(branch_id).await?;
            }
            return Ok(Cleanup::Deactivated);
        }

        if branch.merge_candidate || session.as_ref().is_some_and(|s| blocks_delete_vote(s, now)) {
            return Ok(Cleanup::Untouched);
        }

        let threshold = self.ctx.config.delete_threshold(policy.merge_threshold);
        let period_minutes = policy.voting_period.num_minutes().max(1);
        self.voting
            .create_voting_session(branch_id, VotingType::Delete, period_minutes, threshold)
            .await?;
        tracing::info!(
            branch_id,
            children = branch.child_branches.len(),
            threshold,
            "dormant branch put to a delete vote"
        );
        Ok(Cleanup::DeleteVoteOpened)
    }
}

/// A live vote, or a passed one awaiting its effect, holds off a new delete vote
fn blocks_delete_vote(session: &VotingSession, now: DateTime<Utc>) -> bool {
    session.is_live(now) || session.status == VotingStatus::Passed
}
