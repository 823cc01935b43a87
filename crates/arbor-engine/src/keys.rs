//! Store key layout

/// Prefix shared by story records and their index sets
pub const STORY_PREFIX: &str = "story:";

/// Story record
pub fn story(story_id: &str) -> String {
    format!("{STORY_PREFIX}{story_id}")
}

/// Set of every branch id in a story
pub fn story_branches(story_id: &str) -> String {
    format!("{STORY_PREFIX}{story_id}:branches")
}

/// Set of active branch ids in a story
pub fn active_branches(story_id: &str) -> String {
    format!("{STORY_PREFIX}{story_id}:active_branches")
}

/// Branch record
pub fn branch(branch_id: &str) -> String {
    format!("branch:{branch_id}")
}

/// Voting session for a branch
pub fn voting(branch_id: &str) -> String {
    format!("voting:{branch_id}")
}

/// Engagement counters for a branch
pub fn engagement(branch_id: &str) -> String {
    format!("engagement:{branch_id}")
}

/// Prefix of every rule for a story
pub fn rule_prefix(story_id: &str) -> String {
    format!("rule:{story_id}:")
}

/// Branching rule record
pub fn rule(story_id: &str, rule_id: &str) -> String {
    format!("rule:{story_id}:{rule_id}")
}

/// Extract the story id from a story record key
///
/// Returns `None` for index-set keys and foreign keys.
pub fn story_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(STORY_PREFIX)
        .filter(|rest| !rest.is_empty() && !rest.contains(':'))
}
