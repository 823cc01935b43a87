//! Core types for the branch engine
//!
//! Defines the stored documents:
//! - branches and their type
//! - the story record the engine reads and tags
//! - engagement counters feeding popularity
//! - per-story branching rules

use crate::error::{BranchError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Generate a sortable identifier with a readable prefix
#[must_use]
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new().to_string().to_lowercase())
}

/// A node in a story's fork graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Unique, immutable id
    pub id: String,
    /// Owning story
    pub story_id: String,
    /// Display name (trimmed, non-empty)
    pub name: String,
    /// Description (trimmed, non-empty)
    pub description: String,
    /// Content position this branch diverges from
    pub starting_sentence_id: String,
    /// Parent branch; `None` marks the root
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    /// Child branch ids in creation order
    #[serde(default)]
    pub child_branches: Vec<String>,
    /// `false` once merged or cleaned up
    pub is_active: bool,
    /// Ranking score
    #[serde(default)]
    pub popularity: i64,
    /// Set once a merge vote passes
    #[serde(default)]
    pub merge_candidate: bool,
    /// Kind of fork
    pub branch_type: BranchType,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Opaque creator identity
    pub created_by: String,
    /// Branch this one was merged into
    #[serde(default)]
    pub merged_into: Option<String>,
    /// Merge instant
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    /// Why the branch was retired
    #[serde(default)]
    pub deactivation_reason: Option<String>,
}

impl Branch {
    /// Check if this branch has no parent
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_branch_id.is_none()
    }

    /// Check if this branch has no children
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.child_branches.is_empty()
    }
}

/// Kind of fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    /// A choice point in the narrative
    Decision,
    /// An alternative telling
    #[default]
    Alternative,
    /// Speculative fork
    Experimental,
}

impl fmt::Display for BranchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchType::Decision => "decision",
            BranchType::Alternative => "alternative",
            BranchType::Experimental => "experimental",
        };
        f.write_str(name)
    }
}

impl FromStr for BranchType {
    type Err = BranchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "decision" => Ok(Self::Decision),
            "alternative" => Ok(Self::Alternative),
            "experimental" => Ok(Self::Experimental),
            other => Err(BranchError::Validation(format!("unknown branch type: {other}"))),
        }
    }
}

/// Lifecycle of a story (owned by the story service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    /// Accepting contributions and forks
    #[default]
    Active,
    /// Finished
    Completed,
    /// Frozen
    Archived,
}

/// The story record as seen by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    /// Story id
    pub id: String,
    /// Title
    #[serde(default)]
    pub title: String,
    /// Lifecycle status
    #[serde(default)]
    pub status: StoryStatus,
    /// Branch ids in creation order
    #[serde(default)]
    pub branches: Vec<String>,
    /// Content units
    #[serde(default)]
    pub sentences: Vec<Sentence>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl Story {
    /// Create an active story with no content
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: StoryStatus::Active,
            branches: Vec::new(),
            sentences: Vec::new(),
            created_at,
        }
    }

    /// Content units attached to a branch
    pub fn sentences_on<'a>(&'a self, branch_id: &'a str) -> impl Iterator<Item = &'a Sentence> + 'a {
        self.sentences
            .iter()
            .filter(move |s| s.branch_id.as_deref() == Some(branch_id))
    }
}

/// One content unit of a story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    /// Sentence id
    pub id: String,
    /// Text
    pub text: String,
    /// Opaque author identity
    pub author: String,
    /// Branch the sentence belongs to; `None` is the trunk
    #[serde(default)]
    pub branch_id: Option<String>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Branch the sentence came from, if it arrived by merge
    #[serde(default)]
    pub merged_from: Option<String>,
    /// Merge instant
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
}

/// Engagement counters for one branch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    /// View count
    #[serde(default)]
    pub views: i64,
    /// Contribution count
    #[serde(default)]
    pub contributions: i64,
    /// Net vote count (may be negative)
    #[serde(default)]
    pub votes: i64,
    /// Last contribution or vote
    pub last_activity: DateTime<Utc>,
}

impl Engagement {
    /// Zeroed counters with activity at `now`
    #[inline]
    #[must_use]
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            views: 0,
            contributions: 0,
            votes: 0,
            last_activity: now,
        }
    }
}

/// Kind of engagement signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    /// Branch was viewed
    View,
    /// Content was added
    Contribution,
    /// Branch was up- or down-voted
    Vote,
}

impl EngagementKind {
    /// Check if this signal counts as activity for dormancy
    #[inline]
    #[must_use]
    pub fn bumps_activity(self) -> bool {
        !matches!(self, Self::View)
    }
}

/// Where branching is permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Any sentence
    #[default]
    Anywhere,
    /// Every `every`-th sentence
    SentenceInterval {
        /// Interval length
        every: u32,
    },
    /// Only where a moderator opens a fork point
    Manual,
}

/// Per-story branching policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchingRule {
    /// Rule id
    pub id: String,
    /// Story this rule governs
    pub story_id: String,
    /// Concurrent active-branch cap
    pub max_branches: u32,
    /// Voting period in minutes
    pub voting_period_minutes: i64,
    /// Votes required before a decision
    pub merge_threshold: u32,
    /// Where branching is permitted
    #[serde(default)]
    pub trigger_condition: TriggerCondition,
    /// Inactive rules are ignored
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl BranchingRule {
    /// Create an active rule
    #[must_use]
    pub fn new(
        story_id: impl Into<String>,
        max_branches: u32,
        voting_period_minutes: i64,
        merge_threshold: u32,
    ) -> Self {
        Self {
            id: new_id("rule"),
            story_id: story_id.into(),
            max_branches,
            voting_period_minutes,
            merge_threshold,
            trigger_condition: TriggerCondition::Anywhere,
            is_active: true,
        }
    }

    /// With trigger condition
    #[inline]
    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerCondition) -> Self {
        self.trigger_condition = trigger;
        self
    }

    /// Voting period as a duration
    #[inline]
    #[must_use]
    pub fn voting_period(&self) -> Duration {
        Duration::minutes(self.voting_period_minutes)
    }

    /// Check the rule is well formed
    ///
    /// # Errors
    /// Returns `Validation` describing the first malformed field
    pub fn validate(&self) -> Result<()> {
        let problem = if self.id.trim().is_empty() {
            Some("rule id must not be empty")
        } else if self.story_id.trim().is_empty() {
            Some("rule story_id must not be empty")
        } else if self.max_branches == 0 {
            Some("max_branches must be at least 1")
        } else if self.voting_period_minutes < 1 {
            Some("voting_period_minutes must be at least 1")
        } else if self.merge_threshold == 0 {
            Some("merge_threshold must be at least 1")
        } else if matches!(self.trigger_condition, TriggerCondition::SentenceInterval { every: 0 }) {
            Some("sentence interval must be at least 1")
        } else {
            None
        };

        match problem {
            Some(msg) => Err(BranchError::Validation(msg.to_string())),
            None => Ok(()),
        }
    }
}
