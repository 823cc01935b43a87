//! Branch engine facade
//!
//! Wires every component over one [`EngineContext`] and forwards the public
//! operations, so callers hold a single handle.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::Result;
use crate::hierarchy::{BranchTree, HierarchyBuilder};
use crate::maintenance::{MaintenanceOrchestrator, MaintenanceReport};
use crate::merge::{MergeEngine, MergeResult};
use crate::popularity::PopularityScorer;
use crate::repository::{BranchRepository, NewBranch};
use crate::rules::RuleBook;
use crate::stories::StoryRecords;
use crate::types::{Branch, EngagementKind};
use crate::voting::{VotingEngine, VotingSession, VotingType};
use arbor_store::KvStore;
use std::sync::Arc;

/// Entry point to the branch-graph engine
#[derive(Debug, Clone)]
pub struct BranchEngine {
    ctx: EngineContext,
    repository: BranchRepository,
    hierarchy: HierarchyBuilder,
    popularity: PopularityScorer,
    voting: VotingEngine,
    merges: MergeEngine,
    maintenance: MaintenanceOrchestrator,
    stories: StoryRecords,
    rules: RuleBook,
}

impl BranchEngine {
    /// Create an engine on the system clock
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, config: EngineConfig) -> Self {
        Self::from_context(EngineContext::new(store, config))
    }

    /// Create an engine with an explicit clock
    #[must_use]
    pub fn with_clock(store: Arc<dyn KvStore>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::from_context(EngineContext::with_clock(store, config, clock))
    }

    /// Create an engine over an existing context
    #[must_use]
    pub fn from_context(ctx: EngineContext) -> Self {
        let repository = BranchRepository::new(ctx.clone());
        Self {
            hierarchy: HierarchyBuilder::new(repository.clone()),
            popularity: PopularityScorer::new(ctx.clone()),
            voting: VotingEngine::new(ctx.clone()),
            merges: MergeEngine::new(ctx.clone()),
            maintenance: MaintenanceOrchestrator::new(ctx.clone()),
            stories: StoryRecords::new(ctx.clone()),
            rules: RuleBook::new(ctx.clone()),
            repository,
            ctx,
        }
    }

    /// Shared context
    #[inline]
    #[must_use]
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Branch repository
    #[inline]
    #[must_use]
    pub fn repository(&self) -> &BranchRepository {
        &self.repository
    }

    /// Tree views
    #[inline]
    #[must_use]
    pub fn hierarchy(&self) -> &HierarchyBuilder {
        &self.hierarchy
    }

    /// Popularity scorer
    #[inline]
    #[must_use]
    pub fn popularity(&self) -> &PopularityScorer {
        &self.popularity
    }

    /// Voting engine
    #[inline]
    #[must_use]
    pub fn voting(&self) -> &VotingEngine {
        &self.voting
    }

    /// Merge engine
    #[inline]
    #[must_use]
    pub fn merges(&self) -> &MergeEngine {
        &self.merges
    }

    /// Maintenance orchestrator
    #[inline]
    #[must_use]
    pub fn maintenance(&self) -> &MaintenanceOrchestrator {
        &self.maintenance
    }

    /// Story records
    #[inline]
    #[must_use]
    pub fn stories(&self) -> &StoryRecords {
        &self.stories
    }

    /// Branching rules
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    /// See [`BranchRepository::create_branch`]
    ///
    /// # Errors
    /// See [`BranchRepository::create_branch`]
    pub async fn create_branch(&self, request: NewBranch) -> Result<Branch> {
        self.repository.create_branch(request).await
    }

    /// See [`BranchRepository::get_branch`]
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>> {
        self.repository.get_branch(branch_id).await
    }

    /// See [`HierarchyBuilder::get_branch_tree`]
    pub async fn get_branch_tree(&self, story_id: &str) -> Option<BranchTree> {
        self.hierarchy.get_branch_tree(story_id).await
    }

    /// See [`PopularityScorer::track_engagement`]
    pub async fn track_engagement(&self, branch_id: &str, kind: EngagementKind, amount: i64) -> bool {
        self.popularity.track_engagement(branch_id, kind, amount).await
    }

    /// See [`VotingEngine::vote_branch_merge`]
    ///
    /// # Errors
    /// See [`VotingEngine::cast_vote`]
    pub async fn vote_branch_merge(&self, branch_id: &str, voter_id: &str, approve: bool) -> Result<VotingSession> {
        self.voting.vote_branch_merge(branch_id, voter_id, approve).await
    }

    /// See [`VotingEngine::cast_vote`]
    ///
    /// # Errors
    /// See [`VotingEngine::cast_vote`]
    pub async fn cast_vote(
        &self,
        branch_id: &str,
        voting_type: VotingType,
        voter_id: &str,
        approve: bool,
    ) -> Result<VotingSession> {
        self.voting.cast_vote(branch_id, voting_type, voter_id, approve).await
    }

    /// See [`MergeEngine::merge_branch`]
    pub async fn merge_branch(&self, source_id: &str, target_id: &str) -> MergeResult {
        self.merges.merge_branch(source_id, target_id).await
    }

    /// See [`MaintenanceOrchestrator::run_branch_maintenance`]
    pub async fn run_branch_maintenance(&self, story_id: &str) -> MaintenanceReport {
        self.maintenance.run_branch_maintenance(story_id).await
    }

    /// See [`MaintenanceOrchestrator::run_all_maintenance`]
    pub async fn run_all_maintenance(&self) -> Vec<MaintenanceReport> {
        self.maintenance.run_all_maintenance().await
    }
}
