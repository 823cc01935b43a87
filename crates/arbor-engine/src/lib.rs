//! Arbor Engine - branch-graph engine for collaborative stories
//!
//! Stories fork into alternative continuations. The engine:
//! - Creates branches under hierarchy rules and per-story caps
//! - Rebuilds and validates the branch tree on demand
//! - Scores branches from engagement signals
//! - Runs time-boxed votes to merge, keep or delete branches
//! - Merges approved branches into their targets
//! - Sweeps stories for dormant branches and approved merges
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor_engine::prelude::*;
//! use arbor_store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BranchEngine::new(Arc::new(MemoryStore::new()), EngineConfig::new());
//!
//! let root = engine
//!     .create_branch(NewBranch::root("story_1", "Main", "Main line", "sentence_0", "alice"))
//!     .await?;
//! engine.vote_branch_merge(&root.id, "bob", true).await?;
//!
//! let report = engine.run_branch_maintenance("story_1").await;
//! println!("{}", report.message);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod keys;
pub mod locks;
pub mod maintenance;
pub mod merge;
pub mod popularity;
pub mod repository;
pub mod rules;
pub mod stories;
pub mod types;
pub mod voting;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, RuleDefaults};
pub use context::EngineContext;
pub use engine::BranchEngine;
pub use error::{BranchError, Entity, HierarchyViolation, Result};
pub use hierarchy::{build_branch_tree, check_hierarchy, validate_hierarchy, BranchTree, BranchTreeNode, HierarchyBuilder};
pub use locks::{LockGuard, LockRegistry, LockScope};
pub use maintenance::{is_dormant, MaintenanceOrchestrator, MaintenanceReport};
pub use merge::{MergeEngine, MergeResult};
pub use popularity::{compute_popularity, PopularityScorer};
pub use repository::{BranchRepository, NewBranch};
pub use rules::{EffectivePolicy, RuleBook};
pub use stories::StoryRecords;
pub use types::{
    Branch, BranchType, BranchingRule, Engagement, EngagementKind, Sentence, Story, StoryStatus,
    TriggerCondition,
};
pub use voting::{VotingEngine, VotingSession, VotingStatus, VotingType};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the branch engine
    pub use crate::{
        BranchEngine, BranchError, BranchType, BranchingRule, EngagementKind, EngineConfig, NewBranch,
        Story, VotingStatus, VotingType,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
