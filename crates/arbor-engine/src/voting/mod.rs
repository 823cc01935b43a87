//! Voting and consensus
//!
//! One session per branch at a time. A session opens lazily on the first vote
//! (or explicitly through [`VotingEngine::create_voting_session`]), decides
//! once `threshold` votes are in, and expires when its deadline passes first.
//! Expiry is detected on the next vote or by maintenance.
//!
//! Session lifecycle:
//!
//! ```text
//! Active ──► Passed
//!    │──────► Failed
//!    └──────► Expired
//! ```
//!
//! Failed and expired sessions are replaced by a fresh one on the next vote.
//! A passed session stays until maintenance or a merge consumes it.

mod session;
mod state_machine;

pub use session::{VotingSession, VotingStatus, VotingType};
pub use state_machine::{allowed_transitions, is_terminal, validate_transition, IllegalTransition};

use crate::context::EngineContext;
use crate::error::{BranchError, Entity, Result};
use crate::keys;
use crate::locks::LockScope;
use crate::rules::RuleBook;
use crate::types::Branch;
use arbor_store::StoreError;
use chrono::Duration;

/// Voting sessions over branches
#[derive(Debug, Clone)]
pub struct VotingEngine {
    ctx: EngineContext,
    rules: RuleBook,
}

impl VotingEngine {
    /// Create over a shared context
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        let rules = RuleBook::new(ctx.clone());
        Self { ctx, rules }
    }

    /// Vote on merging a branch
    ///
    /// # Errors
    /// See [`VotingEngine::cast_vote`]
    pub async fn vote_branch_merge(&self, branch_id: &str, voter_id: &str, approve: bool) -> Result<VotingSession> {
        self.cast_vote(branch_id, VotingType::Merge, voter_id, approve).await
    }

    /// Record a vote, opening a session of `voting_type` if none is live
    ///
    /// A repeat vote from the same voter replaces their earlier one. When the
    /// vote brings the session to its threshold the outcome is decided, and a
    /// passed merge vote marks the branch as a merge candidate.
    ///
    /// # Errors
    /// - `Validation` if the voter id is blank
    /// - `NotFound` if the branch does not exist
    /// - `InvalidState` if the branch is inactive, the session already passed,
    ///   or a live session of another type is open
    /// - `Expired` if the open session's deadline has passed; the session is
    ///   marked expired before returning
    #[tracing::instrument(skip(self))]
    pub async fn cast_vote(
        &self,
        branch_id: &str,
        voting_type: VotingType,
        voter_id: &str,
        approve: bool,
    ) -> Result<VotingSession> {
        if voter_id.trim().is_empty() {
            return Err(BranchError::Validation("voter id must not be empty".to_string()));
        }

        let _guard = self.ctx.locks.acquire(LockScope::Branch, branch_id).await;

        let branch = self.active_branch(branch_id).await?;
        let key = keys::voting(branch_id);
        let attempts = self.ctx.config.cas_attempts;

        for _ in 0..attempts {
            let now = self.ctx.now();
            let current = self.ctx.records.load_versioned::<VotingSession>(&key).await?;
            let expected = current.as_ref().map(|c| c.version);

            let mut session = match current.map(|c| c.value) {
                None => self.open_session(&branch, voting_type, None).await?,
                Some(mut existing) => {
                    if existing.expire_if_due(now) {
                        if !self.ctx.records.save_if(&key, expected, &existing).await? {
                            continue;
                        }
                        self.clear_merge_candidate(branch_id).await?;
                        tracing::info!(branch_id, session_id = %existing.id, "voting session expired");
                        return Err(BranchError::Expired {
                            branch_id: branch_id.to_string(),
                            deadline: existing.deadline,
                        });
                    }
                    match existing.status {
                        VotingStatus::Active if existing.voting_type != voting_type => {
                            return Err(BranchError::InvalidState(format!(
                                "branch {branch_id} has a live {} vote",
                                existing.voting_type
                            )));
                        }
                        VotingStatus::Active => existing,
                        VotingStatus::Passed => {
                            return Err(BranchError::InvalidState(format!(
                                "{} vote on branch {branch_id} already passed",
                                existing.voting_type
                            )));
                        }
                        VotingStatus::Failed | VotingStatus::Expired => {
                            self.open_session(&branch, voting_type, None).await?
                        }
                    }
                }
            };

            session.record_vote(voter_id, approve);
            if let Some(outcome) = session.decide(self.ctx.config.approval_ratio) {
                session.transition(outcome)?;
            }

            if !self.ctx.records.save_if(&key, expected, &session).await? {
                tracing::debug!(branch_id, "voting session changed underneath, retrying");
                continue;
            }

            match session.status {
                VotingStatus::Passed => {
                    if session.voting_type == VotingType::Merge {
                        self.mark_merge_candidate(branch_id).await?;
                    }
                    tracing::info!(
                        branch_id,
                        votes_for = session.votes_for.len(),
                        total = session.total_votes,
                        "vote passed"
                    );
                }
                VotingStatus::Failed => {
                    tracing::info!(
                        branch_id,
                        votes_for = session.votes_for.len(),
                        total = session.total_votes,
                        "vote failed"
                    );
                }
                _ => tracing::debug!(branch_id, total = session.total_votes, "vote recorded"),
            }
            return Ok(session);
        }

        Err(BranchError::Store(StoreError::Conflict { key, attempts }))
    }

    /// Open a session explicitly
    ///
    /// Replaces a failed or lapsed session; refuses while one is live or a
    /// passed outcome is still pending.
    ///
    /// # Errors
    /// - `Validation` if the period or threshold is not positive
    /// - `NotFound` if the branch does not exist
    /// - `InvalidState` if the branch is inactive, or a live or passed session exists
    pub async fn create_voting_session(
        &self,
        branch_id: &str,
        voting_type: VotingType,
        period_minutes: i64,
        threshold: u32,
    ) -> Result<VotingSession> {
        if period_minutes < 1 || threshold < 1 {
            return Err(BranchError::Validation(
                "voting period and threshold must be positive".to_string(),
            ));
        }

        let _guard = self.ctx.locks.acquire(LockScope::Branch, branch_id).await;
        let branch = self.active_branch(branch_id).await?;

        let key = keys::voting(branch_id);
        let current = self.ctx.records.load_versioned::<VotingSession>(&key).await?;
        let now = self.ctx.now();
        if let Some(existing) = current
            .as_ref()
            .map(|c| &c.value)
            .filter(|s| s.is_live(now) || s.status == VotingStatus::Passed)
        {
            return Err(BranchError::InvalidState(format!(
                "branch {branch_id} already has a {:?} {} vote",
                existing.status, existing.voting_type
            )));
        }

        let session = self
            .open_session(&branch, voting_type, Some((Duration::minutes(period_minutes), threshold)))
            .await?;
        if !self
            .ctx
            .records
            .save_if(&key, current.map(|c| c.version), &session)
            .await?
        {
            return Err(BranchError::Store(StoreError::Conflict { key, attempts: 1 }));
        }

        tracing::info!(
            branch_id,
            voting_type = %voting_type,
            threshold,
            deadline = %session.deadline,
            "voting session opened"
        );
        Ok(session)
    }

    /// Current session of a branch, whatever its status
    ///
    /// # Errors
    /// Returns error if the store fails or the record is malformed
    pub async fn get_voting_session(&self, branch_id: &str) -> Result<Option<VotingSession>> {
        Ok(self.ctx.records.load(&keys::voting(branch_id)).await?)
    }

    /// Mark an overdue active session expired
    ///
    /// Returns the expired session, or `None` if nothing changed.
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn expire_if_due(&self, branch_id: &str) -> Result<Option<VotingSession>> {
        let now = self.ctx.now();
        let key = keys::voting(branch_id);
        let expired = self
            .ctx
            .records
            .update(&key, |session: &mut VotingSession| -> Result<bool> {
                Ok(session.expire_if_due(now))
            })
            .await?;

        if expired != Some(true) {
            return Ok(None);
        }
        self.clear_merge_candidate(branch_id).await?;
        let session = self.get_voting_session(branch_id).await?;
        if let Some(s) = &session {
            tracing::info!(branch_id, session_id = %s.id, "voting session expired");
        }
        Ok(session)
    }

    /// Drop a branch's session record
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn clear_session(&self, branch_id: &str) -> Result<()> {
        self.ctx.records.remove(&keys::voting(branch_id)).await?;
        Ok(())
    }

    async fn active_branch(&self, branch_id: &str) -> Result<Branch> {
        let branch: Branch = self
            .ctx
            .records
            .load(&keys::branch(branch_id))
            .await?
            .ok_or_else(|| BranchError::not_found(Entity::Branch, branch_id))?;
        if !branch.is_active {
            return Err(BranchError::InvalidState(format!("branch {branch_id} is inactive")));
        }
        Ok(branch)
    }

    /// Build a fresh session; `terms` overrides the story's policy
    async fn open_session(
        &self,
        branch: &Branch,
        voting_type: VotingType,
        terms: Option<(Duration, u32)>,
    ) -> Result<VotingSession> {
        let (period, threshold) = match terms {
            Some(terms) => terms,
            None => {
                let policy = self.rules.effective_policy(&branch.story_id).await?;
                (policy.voting_period, policy.merge_threshold)
            }
        };
        Ok(VotingSession::open(
            &branch.id,
            &branch.story_id,
            voting_type,
            self.ctx.now(),
            period,
            threshold,
        ))
    }

    async fn mark_merge_candidate(&self, branch_id: &str) -> Result<()> {
        self.ctx
            .records
            .update(&keys::branch(branch_id), |branch: &mut Branch| -> Result<()> {
                if branch.is_active {
                    branch.merge_candidate = true;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn clear_merge_candidate(&self, branch_id: &str) -> Result<()> {
        self.ctx
            .records
            .update(&keys::branch(branch_id), |branch: &mut Branch| -> Result<()> {
                branch.merge_candidate = false;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
