//! Error types for the branch engine
//!
//! Mirrors the failure taxonomy callers see:
//! - missing stories, branches, parents and rules
//! - operations refused because of the current state
//! - branch caps, expired voting sessions and malformed rules
//! - structurally corrupt branch sets

use arbor_store::StoreError;
use chrono::{DateTime, Utc};
use std::fmt;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    /// Referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity
        entity: Entity,
        /// Identifier that failed to resolve
        id: String,
    },

    /// Operation is not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Story already holds the maximum number of active branches
    #[error("branch limit reached for story {story_id} (max: {limit})")]
    LimitExceeded {
        /// Story at capacity
        story_id: String,
        /// Governing cap
        limit: u32,
    },

    /// Voting session is past its deadline
    #[error("voting on branch {branch_id} closed at {deadline}")]
    Expired {
        /// Branch the session belongs to
        branch_id: String,
        /// Deadline that passed
        deadline: DateTime<Utc>,
    },

    /// Input or rule failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// Branch set does not form a single-rooted forest
    #[error("inconsistent hierarchy: {0}")]
    Inconsistent(#[from] HierarchyViolation),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BranchError {
    /// Shorthand for [`BranchError::NotFound`]
    #[inline]
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }

    /// Check if the error reflects caller input rather than system state
    #[inline]
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InvalidState(_)
                | Self::LimitExceeded { .. }
                | Self::Expired { .. }
                | Self::Validation(_)
        )
    }
}

/// Entity kinds named in [`BranchError::NotFound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    /// Story record
    Story,
    /// Branch record
    Branch,
    /// Parent branch named at creation
    ParentBranch,
    /// Voting session
    VotingSession,
    /// Branching rule
    Rule,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Story => "story",
            Entity::Branch => "branch",
            Entity::ParentBranch => "parent branch",
            Entity::VotingSession => "voting session",
            Entity::Rule => "branching rule",
        };
        f.write_str(name)
    }
}

/// Structural defects that make a branch set unusable as a tree
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyViolation {
    /// More than one branch without a parent
    #[error("multiple root branches: {roots:?}")]
    MultipleRoots {
        /// Ids of every rootless branch
        roots: Vec<String>,
    },

    /// A branch is its own ancestor
    #[error("cycle through branch {branch_id}")]
    Cycle {
        /// A branch on the cycle
        branch_id: String,
    },

    /// Parent pointer leaves the branch set
    #[error("branch {branch_id} points at missing parent {parent_id}")]
    DanglingParent {
        /// Child branch
        branch_id: String,
        /// Parent that is not in the set
        parent_id: String,
    },

    /// Non-empty set without any root
    #[error("no root branch")]
    NoRoot,

    /// Requested root is not a rootless member of the set
    #[error("branch {0} is not a root of this set")]
    NotARoot(String),
}

/// Result alias used across the engine
pub type Result<T, E = BranchError> = std::result::Result<T, E>;
