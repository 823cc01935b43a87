//! Branch repository
//!
//! CRUD over branch records and the per-story index sets (all branches,
//! active branches). Creation enforces the hierarchy rules: the story must be
//! active, a named parent must belong to the same story, a story has at most
//! one root, and the active-branch cap of the governing rule holds.

use crate::context::EngineContext;
use crate::error::{BranchError, Entity, Result};
use crate::keys;
use crate::locks::LockScope;
use crate::rules::RuleBook;
use crate::types::{new_id, Branch, BranchType, Story, StoryStatus};

/// Parameters for [`BranchRepository::create_branch`]
#[derive(Debug, Clone)]
pub struct NewBranch {
    /// Owning story
    pub story_id: String,
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
    /// Content position the fork starts from
    pub starting_sentence_id: String,
    /// Parent branch; `None` creates the root
    pub parent_branch_id: Option<String>,
    /// Kind of fork
    pub branch_type: BranchType,
    /// Opaque creator identity
    pub created_by: String,
}

impl NewBranch {
    /// Root branch request
    #[must_use]
    pub fn root(
        story_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        starting_sentence_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            story_id: story_id.into(),
            name: name.into(),
            description: description.into(),
            starting_sentence_id: starting_sentence_id.into(),
            parent_branch_id: None,
            branch_type: BranchType::default(),
            created_by: created_by.into(),
        }
    }

    /// Fork under a parent
    #[inline]
    #[must_use]
    pub fn with_parent(mut self, parent_branch_id: impl Into<String>) -> Self {
        self.parent_branch_id = Some(parent_branch_id.into());
        self
    }

    /// With branch type
    #[inline]
    #[must_use]
    pub fn with_type(mut self, branch_type: BranchType) -> Self {
        self.branch_type = branch_type;
        self
    }
}

/// Branch record storage
#[derive(Debug, Clone)]
pub struct BranchRepository {
    ctx: EngineContext,
    rules: RuleBook,
}

impl BranchRepository {
    /// Create over a shared context
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        let rules = RuleBook::new(ctx.clone());
        Self { ctx, rules }
    }

    /// Create a branch
    ///
    /// All checks run before the first write.
    ///
    /// # Errors
    /// - `Validation` if name or description is blank
    /// - `NotFound` if the story or the parent does not exist
    /// - `InvalidState` if the story is not active, or a second root is requested
    /// - `LimitExceeded` if the story is at its active-branch cap
    #[tracing::instrument(skip(self, request), fields(story_id = %request.story_id))]
    pub async fn create_branch(&self, request: NewBranch) -> Result<Branch> {
        let name = request.name.trim();
        let description = request.description.trim();
        if name.is_empty() || description.is_empty() {
            return Err(BranchError::Validation(
                "branch name and description must not be empty".to_string(),
            ));
        }

        let story_id = request.story_id.as_str();

        // Cap check and index insert must not interleave with another create
        let _guard = self.ctx.locks.acquire(LockScope::Story, story_id).await;

        let story: Story = self
            .ctx
            .records
            .load(&keys::story(story_id))
            .await?
            .ok_or_else(|| BranchError::not_found(Entity::Story, story_id))?;
        if story.status != StoryStatus::Active {
            return Err(BranchError::InvalidState(format!(
                "story {story_id} is {:?}, branching requires an active story",
                story.status
            )));
        }

        match request.parent_branch_id.as_deref() {
            Some(parent_id) => {
                let parent = self.get_branch(parent_id).await?;
                if !parent.is_some_and(|p| p.story_id == story_id) {
                    return Err(BranchError::not_found(Entity::ParentBranch, parent_id));
                }
            }
            None => {
                if let Some(root) = self.find_root(story_id).await? {
                    return Err(BranchError::InvalidState(format!(
                        "story {story_id} already has root branch {}",
                        root.id
                    )));
                }
            }
        }

        let policy = self.rules.effective_policy(story_id).await?;
        let active = self.ctx.store().members(&keys::active_branches(story_id)).await?;
        if active.len() >= policy.max_branches as usize {
            return Err(BranchError::LimitExceeded {
                story_id: story_id.to_string(),
                limit: policy.max_branches,
            });
        }

        let branch = Branch {
            id: new_id("branch"),
            story_id: story_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            starting_sentence_id: request.starting_sentence_id.clone(),
            parent_branch_id: request.parent_branch_id.clone(),
            child_branches: Vec::new(),
            is_active: true,
            popularity: 0,
            merge_candidate: false,
            branch_type: request.branch_type,
            created_at: self.ctx.now(),
            created_by: request.created_by.clone(),
            merged_into: None,
            merged_at: None,
            deactivation_reason: None,
        };

        if !self.ctx.records.insert_new(&keys::branch(&branch.id), &branch).await? {
            return Err(BranchError::InvalidState(format!("branch id {} already taken", branch.id)));
        }

        if let Some(parent_id) = branch.parent_branch_id.as_deref() {
            let child_id = branch.id.clone();
            self.ctx
                .records
                .update(&keys::branch(parent_id), |parent: &mut Branch| -> Result<()> {
                    if !parent.child_branches.contains(&child_id) {
                        parent.child_branches.push(child_id.clone());
                    }
                    Ok(())
                })
                .await?;
        }

        let branch_id = branch.id.clone();
        self.ctx
            .records
            .update(&keys::story(story_id), |story: &mut Story| -> Result<()> {
                if !story.branches.contains(&branch_id) {
                    story.branches.push(branch_id.clone());
                }
                Ok(())
            })
            .await?;

        let store = self.ctx.store();
        store.add_to_set(&keys::story_branches(story_id), &branch.id).await?;
        store.add_to_set(&keys::active_branches(story_id), &branch.id).await?;

        tracing::info!(
            branch_id = %branch.id,
            parent = ?branch.parent_branch_id,
            branch_type = %branch.branch_type,
            "branch created"
        );
        Ok(branch)
    }

    /// Load a branch
    ///
    /// # Errors
    /// Returns error if the store fails or the record is malformed
    pub async fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>> {
        Ok(self.ctx.records.load(&keys::branch(branch_id)).await?)
    }

    /// Every branch of a story, oldest first
    ///
    /// Ids whose records are gone are skipped.
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn get_story_branches(&self, story_id: &str) -> Result<Vec<Branch>> {
        self.resolve_index(&keys::story_branches(story_id)).await
    }

    /// Active branches of a story, oldest first
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn get_active_branches(&self, story_id: &str) -> Result<Vec<Branch>> {
        let mut branches = self.resolve_index(&keys::active_branches(story_id)).await?;
        branches.retain(|b| b.is_active);
        Ok(branches)
    }

    /// Direct children of a branch in creation order
    ///
    /// # Errors
    /// - `NotFound` if the branch does not exist
    /// - store errors
    pub async fn get_children(&self, branch_id: &str) -> Result<Vec<Branch>> {
        let branch = self
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| BranchError::not_found(Entity::Branch, branch_id))?;

        let mut children = Vec::with_capacity(branch.child_branches.len());
        for child_id in &branch.child_branches {
            if let Some(child) = self.get_branch(child_id).await? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Most popular active branches of a story
    ///
    /// Ties keep the older branch first.
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn top_branches(&self, story_id: &str, limit: usize) -> Result<Vec<Branch>> {
        let mut branches = self.get_active_branches(story_id).await?;
        // stable sort keeps the creation order from get_active_branches for ties
        branches.sort_by(|a, b| b.popularity.cmp(&a.popularity));
        branches.truncate(limit);
        Ok(branches)
    }

    /// Retire a branch
    ///
    /// Clears `merge_candidate` and removes the id from the active index.
    /// Returns `false` if the branch does not exist.
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn deactivate_branch(&self, branch_id: &str, reason: Option<&str>) -> Result<bool> {
        let reason = reason.map(str::to_string);
        let updated = self
            .ctx
            .records
            .update(&keys::branch(branch_id), |branch: &mut Branch| -> Result<(String, bool)> {
                let was_active = branch.is_active;
                branch.is_active = false;
                branch.merge_candidate = false;
                if was_active || branch.deactivation_reason.is_none() {
                    branch.deactivation_reason.clone_from(&reason);
                }
                Ok((branch.story_id.clone(), was_active))
            })
            .await?;

        let Some((story_id, was_active)) = updated else {
            tracing::debug!(branch_id, "deactivate skipped, branch absent");
            return Ok(false);
        };

        self.ctx
            .store()
            .remove_from_set(&keys::active_branches(&story_id), branch_id)
            .await?;

        if was_active {
            tracing::info!(branch_id, story_id = %story_id, reason = ?reason, "branch deactivated");
        }
        Ok(true)
    }

    /// Persist a whole branch record, keeping indexes in step with `is_active`
    ///
    /// Intended for imports and repairs; normal mutations use the narrower
    /// operations above.
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn put_branch(&self, branch: &Branch) -> Result<()> {
        self.ctx.records.save(&keys::branch(&branch.id), branch).await?;

        let store = self.ctx.store();
        store.add_to_set(&keys::story_branches(&branch.story_id), &branch.id).await?;
        if branch.is_active {
            store.add_to_set(&keys::active_branches(&branch.story_id), &branch.id).await?;
        } else {
            store.remove_from_set(&keys::active_branches(&branch.story_id), &branch.id).await?;
        }
        Ok(())
    }

    /// The rootless branch of a story, if one exists
    async fn find_root(&self, story_id: &str) -> Result<Option<Branch>> {
        Ok(self
            .get_story_branches(story_id)
            .await?
            .into_iter()
            .find(Branch::is_root))
    }

    async fn resolve_index(&self, index_key: &str) -> Result<Vec<Branch>> {
        let ids = self.ctx.store().members(index_key).await?;
        let mut branches = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_branch(&id).await? {
                Some(branch) => branches.push(branch),
                None => tracing::debug!(branch_id = %id, index = index_key, "skipping missing branch record"),
            }
        }
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(branches)
    }
}
