//! Hierarchy builder
//!
//! Validates that a flat branch set forms a single-rooted forest and
//! assembles it into a nested, read-only [`BranchTree`]. The flat set is the
//! arena: nodes refer to each other by id only, and a tree is a traversal
//! over that arena computed on demand, never stored.

use crate::error::HierarchyViolation;
use crate::repository::BranchRepository;
use crate::types::Branch;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Nested view of a story's branches
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchTree {
    /// Root-level nodes (at most one for a valid story)
    pub roots: Vec<BranchTreeNode>,
    /// Number of nodes
    pub total_branches: usize,
    /// Number of active nodes
    pub active_branches: usize,
    /// Longest root-to-leaf path, root depth = 0
    pub max_depth: usize,
}

/// A branch and its nested children
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchTreeNode {
    /// The branch record
    pub branch: Branch,
    /// Distance from the root
    pub depth: usize,
    /// Children in `child_branches` order
    pub children: Vec<BranchTreeNode>,
}

impl BranchTree {
    /// The single root, if the tree has one
    #[must_use]
    pub fn root(&self) -> Option<&BranchTreeNode> {
        self.roots.first()
    }

    /// Locate a node by branch id
    #[must_use]
    pub fn find(&self, branch_id: &str) -> Option<&BranchTreeNode> {
        self.roots.iter().find_map(|root| root.find(branch_id))
    }
}

impl BranchTreeNode {
    /// Locate a node in this subtree
    #[must_use]
    pub fn find(&self, branch_id: &str) -> Option<&BranchTreeNode> {
        if self.branch.id == branch_id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(branch_id))
    }

    /// Pre-order walk of this subtree
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a BranchTreeNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Check a branch set forms a single-rooted forest
///
/// # Errors
/// Names the first defect found: a parent outside the set, more than one
/// root, a cycle, or no root at all.
pub fn check_hierarchy(branches: &[Branch]) -> Result<(), HierarchyViolation> {
    if branches.is_empty() {
        return Ok(());
    }

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::with_capacity(branches.len(), branches.len());
    for branch in branches {
        graph.add_node(branch.id.as_str());
    }

    let mut roots = Vec::new();
    for branch in branches {
        match branch.parent_branch_id.as_deref() {
            None => roots.push(branch.id.clone()),
            Some(parent) if !graph.contains_node(parent) => {
                return Err(HierarchyViolation::DanglingParent {
                    branch_id: branch.id.clone(),
                    parent_id: parent.to_string(),
                });
            }
            Some(parent) => {
                graph.add_edge(parent, branch.id.as_str(), ());
            }
        }
    }

    if roots.len() > 1 {
        return Err(HierarchyViolation::MultipleRoots { roots });
    }

    if let Err(cycle) = toposort(&graph, None) {
        return Err(HierarchyViolation::Cycle {
            branch_id: cycle.node_id().to_string(),
        });
    }

    if roots.is_empty() {
        return Err(HierarchyViolation::NoRoot);
    }

    Ok(())
}

/// Check whether a branch set forms a single-rooted forest
#[inline]
#[must_use]
pub fn validate_hierarchy(branches: &[Branch]) -> bool {
    check_hierarchy(branches).is_ok()
}

/// Assemble a validated branch set into a tree rooted at `root_id`
///
/// Children follow `child_branches` order; children whose parent pointer
/// names a node that does not list them are appended oldest first, so the
/// tree always covers every branch reachable by parent pointers.
///
/// # Errors
/// Any [`HierarchyViolation`] in the set, or `NotARoot` if `root_id` is not
/// a rootless member of it.
pub fn build_branch_tree(branches: &[Branch], root_id: &str) -> Result<BranchTree, HierarchyViolation> {
    check_hierarchy(branches)?;

    let by_id: HashMap<&str, &Branch> = branches.iter().map(|b| (b.id.as_str(), b)).collect();
    let root = by_id
        .get(root_id)
        .copied()
        .filter(|b| b.is_root())
        .ok_or_else(|| HierarchyViolation::NotARoot(root_id.to_string()))?;

    let mut by_parent: HashMap<&str, Vec<&Branch>> = HashMap::new();
    for branch in branches {
        if let Some(parent) = branch.parent_branch_id.as_deref() {
            by_parent.entry(parent).or_default().push(branch);
        }
    }
    for children in by_parent.values_mut() {
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }

    let arena = Arena { by_id, by_parent };
    let mut stats = TreeStats::default();
    let mut visited = HashSet::new();
    let root_node = arena.nest(root, 0, &mut visited, &mut stats);

    Ok(BranchTree {
        roots: vec![root_node],
        total_branches: stats.total,
        active_branches: stats.active,
        max_depth: stats.max_depth,
    })
}

struct Arena<'a> {
    by_id: HashMap<&'a str, &'a Branch>,
    by_parent: HashMap<&'a str, Vec<&'a Branch>>,
}

#[derive(Default)]
struct TreeStats {
    total: usize,
    active: usize,
    max_depth: usize,
}

impl<'a> Arena<'a> {
    fn nest(
        &self,
        branch: &'a Branch,
        depth: usize,
        visited: &mut HashSet<&'a str>,
        stats: &mut TreeStats,
    ) -> BranchTreeNode {
        visited.insert(branch.id.as_str());
        stats.total += 1;
        if branch.is_active {
            stats.active += 1;
        }
        stats.max_depth = stats.max_depth.max(depth);

        let mut ordered: Vec<&'a Branch> = branch
            .child_branches
            .iter()
            .filter_map(|id| self.by_id.get(id.as_str()).copied())
            .filter(|child| child.parent_branch_id.as_deref() == Some(branch.id.as_str()))
            .collect();
        if let Some(pointed) = self.by_parent.get(branch.id.as_str()) {
            for child in pointed {
                if !ordered.iter().any(|c| c.id == child.id) {
                    ordered.push(child);
                }
            }
        }

        let mut children = Vec::with_capacity(ordered.len());
        for child in ordered {
            if visited.contains(child.id.as_str()) {
                continue;
            }
            children.push(self.nest(child, depth + 1, visited, stats));
        }

        BranchTreeNode {
            branch: branch.clone(),
            depth,
            children,
        }
    }
}

/// Materializes tree views of stored stories
#[derive(Debug, Clone)]
pub struct HierarchyBuilder {
    repo: BranchRepository,
}

impl HierarchyBuilder {
    /// Create over a repository
    #[inline]
    #[must_use]
    pub fn new(repo: BranchRepository) -> Self {
        Self { repo }
    }

    /// Tree view of a story
    ///
    /// Returns `None` when the story has no branches, when its branch set is
    /// structurally corrupt, or when the store cannot be read. Never writes.
    pub async fn get_branch_tree(&self, story_id: &str) -> Option<BranchTree> {
        let branches = match self.repo.get_story_branches(story_id).await {
            Ok(branches) => branches,
            Err(e) => {
                tracing::warn!(story_id, error = %e, "cannot load branches for tree");
                return None;
            }
        };
        if branches.is_empty() {
            return None;
        }

        if let Err(violation) = check_hierarchy(&branches) {
            tracing::warn!(story_id, %violation, "branch hierarchy is inconsistent");
            return None;
        }

        let root_id = branches.iter().find(|b| b.is_root())?.id.clone();
        match build_branch_tree(&branches, &root_id) {
            Ok(tree) => Some(tree),
            Err(violation) => {
                tracing::warn!(story_id, %violation, "tree construction failed");
                None
            }
        }
    }
}
