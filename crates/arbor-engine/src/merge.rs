//! Merge engine
//!
//! Folds an approved branch into its target: content units move to the
//! target, part of the source's popularity transfers, and the source retires.
//! A refused merge is an ordinary outcome and comes back as a
//! [`MergeResult`] with `success == false`.

use crate::context::EngineContext;
use crate::error::{BranchError, Entity, Result};
use crate::keys;
use crate::locks::LockScope;
use crate::repository::BranchRepository;
use crate::types::{Branch, Story};
use crate::voting::{VotingEngine, VotingStatus, VotingType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deactivation reason recorded on merged branches
pub const MERGED_REASON: &str = "merged";

/// Outcome of one merge attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    /// Whether the merge happened
    pub success: bool,
    /// Branch folded away
    pub source_id: String,
    /// Branch receiving the content
    pub target_id: String,
    /// Content units retagged onto the target
    pub merged_sentence_count: usize,
    /// Human-readable summary
    pub message: String,
}

impl MergeResult {
    fn refused(source_id: &str, target_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            merged_sentence_count: 0,
            message: message.into(),
        }
    }
}

/// Executes merges
#[derive(Debug, Clone)]
pub struct MergeEngine {
    ctx: EngineContext,
    repo: BranchRepository,
    voting: VotingEngine,
}

impl MergeEngine {
    /// Create over a shared context
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            repo: BranchRepository::new(ctx.clone()),
            voting: VotingEngine::new(ctx.clone()),
            ctx,
        }
    }

    /// Merge `source_id` into `target_id`
    ///
    /// Refused without changes when either branch is missing or inactive, they
    /// belong to different stories, or the source is not a merge candidate.
    pub async fn merge_branch(&self, source_id: &str, target_id: &str) -> MergeResult {
        let _guard = self.ctx.locks.acquire(LockScope::Branch, source_id).await;

        match self.try_merge(source_id, target_id).await {
            Ok(result) => {
                if result.success {
                    tracing::info!(
                        source_id,
                        target_id,
                        sentences = result.merged_sentence_count,
                        "branch merged"
                    );
                } else {
                    tracing::debug!(source_id, target_id, reason = %result.message, "merge refused");
                }
                result
            }
            Err(e) => {
                tracing::warn!(source_id, target_id, error = %e, "merge failed");
                MergeResult::refused(source_id, target_id, e.to_string())
            }
        }
    }

    /// Merge every approved candidate of a story into its target
    ///
    /// The target is the parent, or for a rootless candidate the most popular
    /// other active root of the same story. Candidates without a usable target
    /// are skipped.
    ///
    /// # Errors
    /// Returns error if the story's branches cannot be loaded
    pub async fn process_approved_merges(&self, story_id: &str) -> Result<Vec<MergeResult>> {
        let active = self.repo.get_active_branches(story_id).await?;
        let mut results = Vec::new();

        for candidate in active.iter().filter(|b| b.merge_candidate) {
            let approved = self
                .voting
                .get_voting_session(&candidate.id)
                .await?
                .is_some_and(|s| s.voting_type == VotingType::Merge && s.status == VotingStatus::Passed);
            if !approved {
                continue;
            }

            let Some(target_id) = self.merge_target(candidate, &active).await? else {
                tracing::debug!(branch_id = %candidate.id, "no merge target, skipping");
                continue;
            };
            results.push(self.merge_branch(&candidate.id, &target_id).await);
        }

        Ok(results)
    }

    async fn merge_target(&self, candidate: &Branch, active: &[Branch]) -> Result<Option<String>> {
        if let Some(parent_id) = candidate.parent_branch_id.as_deref() {
            let parent = self.repo.get_branch(parent_id).await?;
            return Ok(parent
                .filter(|p| p.is_active && p.story_id == candidate.story_id)
                .map(|p| p.id));
        }

        // `active` is oldest first, so ties go to the older root
        let mut best: Option<&Branch> = None;
        for branch in active.iter().filter(|b| b.is_root() && b.id != candidate.id) {
            if best.map_or(true, |b| branch.popularity > b.popularity) {
                best = Some(branch);
            }
        }
        Ok(best.map(|b| b.id.clone()))
    }

    async fn try_merge(&self, source_id: &str, target_id: &str) -> Result<MergeResult> {
        if source_id == target_id {
            return Ok(MergeResult::refused(source_id, target_id, "cannot merge a branch into itself"));
        }

        let Some(source) = self.repo.get_branch(source_id).await? else {
            return Ok(MergeResult::refused(source_id, target_id, format!("branch {source_id} not found")));
        };
        let Some(target) = self.repo.get_branch(target_id).await? else {
            return Ok(MergeResult::refused(source_id, target_id, format!("branch {target_id} not found")));
        };

        if source.story_id != target.story_id {
            return Ok(MergeResult::refused(source_id, target_id, "branches belong to different stories"));
        }
        if !source.merge_candidate {
            return Ok(MergeResult::refused(
                source_id,
                target_id,
                format!("branch {source_id} is not approved for merging"),
            ));
        }
        if !source.is_active || !target.is_active {
            return Ok(MergeResult::refused(source_id, target_id, "both branches must be active"));
        }

        let story_key = keys::story(&source.story_id);
        if self.ctx.records.load::<Story>(&story_key).await?.is_none() {
            return Err(BranchError::not_found(Entity::Story, &source.story_id));
        }

        let now = self.ctx.now();

        // Retire the source first; a concurrent merge of the same branch sees it gone
        let target_owned = target_id.to_string();
        let claimed = self
            .ctx
            .records
            .update(&keys::branch(source_id), |branch: &mut Branch| -> Result<Option<i64>> {
                if !branch.is_active || !branch.merge_candidate {
                    return Ok(None);
                }
                branch.is_active = false;
                branch.merge_candidate = false;
                branch.merged_into = Some(target_owned.clone());
                branch.merged_at = Some(now);
                branch.deactivation_reason = Some(MERGED_REASON.to_string());
                Ok(Some(branch.popularity))
            })
            .await?
            .flatten();
        let Some(source_popularity) = claimed else {
            return Ok(MergeResult::refused(source_id, target_id, "branch changed before the merge"));
        };

        let merged = match self.fold_into_target(&source, target_id, source_popularity, now).await {
            Ok(merged) => merged,
            Err(e) => {
                self.release_claim(&source, target_id).await;
                return Err(e);
            }
        };

        // The merge is committed; a leftover session on an inactive branch is inert
        if let Err(e) = self.voting.clear_session(source_id).await {
            tracing::warn!(source_id, error = %e, "merged branch keeps its voting session");
        }

        Ok(MergeResult {
            success: true,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            merged_sentence_count: merged,
            message: format!("merged {merged} sentences from {source_id} into {target_id}"),
        })
    }

    /// Move content, credit the target and drop the source from the active
    /// index; a failing step undoes the ones before it
    async fn fold_into_target(
        &self,
        source: &Branch,
        target_id: &str,
        source_popularity: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let story_key = keys::story(&source.story_id);
        let moved = self
            .ctx
            .records
            .update(&story_key, |story: &mut Story| -> Result<Vec<MovedSentence>> {
                let mut moved = Vec::new();
                for (index, sentence) in story.sentences.iter_mut().enumerate() {
                    if sentence.branch_id.as_deref() == Some(source.id.as_str()) {
                        moved.push(MovedSentence {
                            index,
                            merged_from: sentence.merged_from.take(),
                            merged_at: sentence.merged_at.take(),
                        });
                        sentence.branch_id = Some(target_id.to_string());
                        sentence.merged_from = Some(source.id.clone());
                        sentence.merged_at = Some(now);
                    }
                }
                Ok(moved)
            })
            .await?
            .ok_or_else(|| BranchError::not_found(Entity::Story, &source.story_id))?;

        let transfer = transferred_popularity(source_popularity, self.ctx.config.merge_popularity_share);
        if let Err(e) = self.credit(target_id, transfer).await {
            self.restore_sentences(&story_key, &source.id, target_id, &moved).await;
            return Err(e);
        }

        if let Err(e) = self
            .ctx
            .store()
            .remove_from_set(&keys::active_branches(&source.story_id), &source.id)
            .await
        {
            if let Err(undo) = self.credit(target_id, -transfer).await {
                tracing::error!(target_id, error = %undo, "could not take back merge popularity");
            }
            self.restore_sentences(&story_key, &source.id, target_id, &moved).await;
            return Err(e.into());
        }

        Ok(moved.len())
    }

    async fn credit(&self, branch_id: &str, amount: i64) -> Result<()> {
        self.ctx
            .records
            .update(&keys::branch(branch_id), |branch: &mut Branch| -> Result<()> {
                branch.popularity = branch.popularity.saturating_add(amount);
                Ok(())
            })
            .await?
            .ok_or_else(|| BranchError::not_found(Entity::Branch, branch_id))
    }

    async fn restore_sentences(&self, story_key: &str, source_id: &str, target_id: &str, moved: &[MovedSentence]) {
        let restored = self
            .ctx
            .records
            .update(story_key, |story: &mut Story| -> Result<()> {
                for m in moved {
                    let Some(sentence) = story.sentences.get_mut(m.index) else {
                        continue;
                    };
                    if sentence.branch_id.as_deref() == Some(target_id)
                        && sentence.merged_from.as_deref() == Some(source_id)
                    {
                        sentence.branch_id = Some(source_id.to_string());
                        sentence.merged_from.clone_from(&m.merged_from);
                        sentence.merged_at = m.merged_at;
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = restored {
            tracing::error!(source_id, target_id, error = %e, "could not move sentences back after failed merge");
        }
    }

    /// Put a claimed source back the way it was before the merge began
    async fn release_claim(&self, source: &Branch, target_id: &str) {
        let released = self
            .ctx
            .records
            .update(&keys::branch(&source.id), |branch: &mut Branch| -> Result<()> {
                if branch.merged_into.as_deref() == Some(target_id) {
                    branch.is_active = source.is_active;
                    branch.merge_candidate = source.merge_candidate;
                    branch.merged_into.clone_from(&source.merged_into);
                    branch.merged_at = source.merged_at;
                    branch.deactivation_reason.clone_from(&source.deactivation_reason);
                }
                Ok(())
            })
            .await;
        match released {
            Ok(_) => tracing::info!(source_id = %source.id, target_id, "merge rolled back"),
            Err(e) => tracing::error!(source_id = %source.id, target_id, error = %e, "could not release merge claim"),
        }
    }
}

/// Where a retagged content unit came from, for undoing a merge
struct MovedSentence {
    index: usize,
    merged_from: Option<String>,
    merged_at: Option<DateTime<Utc>>,
}

/// Popularity credited to a merge target
#[must_use]
pub fn transferred_popularity(source_popularity: i64, share: f64) -> i64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let transfer = (source_popularity.max(0) as f64 * share).floor() as i64;
    transfer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_is_floored_half() {
        assert_eq!(transferred_popularity(50, 0.5), 25);
        assert_eq!(transferred_popularity(51, 0.5), 25);
        assert_eq!(transferred_popularity(1, 0.5), 0);
    }

    #[test]
    fn negative_popularity_transfers_nothing() {
        assert_eq!(transferred_popularity(-10, 0.5), 0);
    }
}
