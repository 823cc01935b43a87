//! Merging approved branches and selecting merge targets

use arbor_engine::keys;
use arbor_engine::{Branch, BranchingRule, Story};
use arbor_store::KvStore;
use arbor_test_utils::Fixture;
use pretty_assertions::assert_eq;

/// Story `s1` with root A and child B, merges decided by three votes
async fn two_level(fx: &Fixture) -> (Branch, Branch) {
    fx.story("s1").await;
    fx.engine
        .rules()
        .set_branching_rule(&BranchingRule::new("s1", 10, 60, 3))
        .await
        .unwrap();
    let a = fx.root("s1", "A").await;
    let b = fx.child("s1", &a.id, "B").await;
    (a, b)
}

async fn story(fx: &Fixture) -> Story {
    fx.engine.stories().get_story("s1").await.unwrap().unwrap()
}

#[tokio::test]
async fn approved_child_merges_into_root() {
    let fx = Fixture::new();
    let (a, b) = two_level(&fx).await;
    fx.set_popularity(&a.id, 100).await;
    fx.set_popularity(&b.id, 50).await;
    fx.approve_merge(&b.id, 3).await;
    assert!(fx.branch(&b.id).await.merge_candidate);

    let result = fx.engine.merge_branch(&b.id, &a.id).await;

    assert!(result.success, "{}", result.message);
    assert_eq!(fx.branch(&a.id).await.popularity, 125);

    let merged = fx.branch(&b.id).await;
    assert!(!merged.is_active);
    assert!(!merged.merge_candidate);
    assert_eq!(merged.merged_into.as_deref(), Some(a.id.as_str()));
    assert_eq!(merged.merged_at, Some(fx.now()));

    let store = fx.engine.context().store();
    assert!(!store.is_member(&keys::active_branches("s1"), &b.id).await.unwrap());
    assert!(fx.engine.voting().get_voting_session(&b.id).await.unwrap().is_none());
}

#[tokio::test]
async fn merge_moves_content_with_audit_tags() {
    let fx = Fixture::new();
    let (a, b) = two_level(&fx).await;
    let stories = fx.engine.stories();
    stories.append_sentence("s1", Some(a.id.as_str()), "u", "Main line.").await.unwrap();
    stories.append_sentence("s1", Some(b.id.as_str()), "u", "Fork one.").await.unwrap();
    stories.append_sentence("s1", Some(b.id.as_str()), "u", "Fork two.").await.unwrap();
    stories.append_sentence("s1", None, "u", "Preface.").await.unwrap();
    fx.approve_merge(&b.id, 3).await;

    let result = fx.engine.merge_branch(&b.id, &a.id).await;
    assert!(result.success);
    assert_eq!(result.merged_sentence_count, 2);

    let story = story(&fx).await;
    assert_eq!(story.sentences_on(&b.id).count(), 0);
    let on_target: Vec<_> = story.sentences_on(&a.id).collect();
    assert_eq!(on_target.len(), 3);
    let moved: Vec<_> = on_target
        .iter()
        .filter(|s| s.merged_from.as_deref() == Some(b.id.as_str()))
        .collect();
    assert_eq!(moved.len(), 2);
    assert!(moved.iter().all(|s| s.merged_at == Some(fx.now())));
}

#[tokio::test]
async fn non_candidate_merge_changes_nothing() {
    let fx = Fixture::new();
    let (a, b) = two_level(&fx).await;
    fx.engine
        .stories()
        .append_sentence("s1", Some(b.id.as_str()), "u", "Fork.")
        .await
        .unwrap();
    let before = (fx.branch(&a.id).await, fx.branch(&b.id).await, story(&fx).await);

    let result = fx.engine.merge_branch(&b.id, &a.id).await;

    assert!(!result.success);
    assert_eq!(result.merged_sentence_count, 0);
    let after = (fx.branch(&a.id).await, fx.branch(&b.id).await, story(&fx).await);
    assert_eq!(before, after);
}

#[tokio::test]
async fn missing_or_self_targets_are_refused() {
    let fx = Fixture::new();
    let (a, b) = two_level(&fx).await;
    fx.approve_merge(&b.id, 3).await;

    assert!(!fx.engine.merge_branch(&b.id, "branch_missing").await.success);
    assert!(!fx.engine.merge_branch("branch_missing", &a.id).await.success);
    assert!(!fx.engine.merge_branch(&b.id, &b.id).await.success);
    assert!(fx.branch(&b.id).await.is_active);
}

#[tokio::test]
async fn second_merge_of_same_branch_fails() {
    let fx = Fixture::new();
    let (a, b) = two_level(&fx).await;
    fx.approve_merge(&b.id, 3).await;

    assert!(fx.engine.merge_branch(&b.id, &a.id).await.success);
    let again = fx.engine.merge_branch(&b.id, &a.id).await;
    assert!(!again.success);
}

#[tokio::test]
async fn approved_merges_target_parent() {
    let fx = Fixture::new();
    let (a, b) = two_level(&fx).await;
    let c = fx.child("s1", &a.id, "C").await;
    fx.approve_merge(&b.id, 3).await;
    // C is voted on but not decided
    fx.engine.vote_branch_merge(&c.id, "x", true).await.unwrap();

    let results = fx.engine.merges().process_approved_merges("s1").await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(results[0].source_id, b.id);
    assert_eq!(results[0].target_id, a.id);
    assert!(fx.branch(&c.id).await.is_active);
}

#[tokio::test]
async fn inactive_parent_leaves_candidate_waiting() {
    let fx = Fixture::new();
    let (a, b) = two_level(&fx).await;
    let grandchild = fx.child("s1", &b.id, "D").await;
    fx.approve_merge(&grandchild.id, 3).await;
    fx.engine.repository().deactivate_branch(&b.id, None).await.unwrap();

    let results = fx.engine.merges().process_approved_merges("s1").await.unwrap();

    assert!(results.is_empty());
    let waiting = fx.branch(&grandchild.id).await;
    assert!(waiting.is_active);
    assert!(waiting.merge_candidate);
    assert!(fx.branch(&a.id).await.is_active);
}

#[tokio::test]
async fn rootless_candidate_merges_into_most_popular_root() {
    let fx = Fixture::new();
    let (a, _) = two_level(&fx).await;
    fx.set_popularity(&a.id, 20).await;

    // legacy data: extra roots written directly
    let template = fx.branch(&a.id).await;
    let extra_root = |id: &str, popularity: i64| Branch {
        id: id.to_string(),
        name: id.to_string(),
        child_branches: Vec::new(),
        popularity,
        ..template.clone()
    };
    let orphan = extra_root("branch_orphan", 5);
    let favourite = extra_root("branch_favourite", 60);
    fx.engine.repository().put_branch(&orphan).await.unwrap();
    fx.engine.repository().put_branch(&favourite).await.unwrap();

    fx.approve_merge(&orphan.id, 3).await;
    let results = fx.engine.merges().process_approved_merges("s1").await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].target_id, favourite.id);
    assert!(results[0].success);
    assert_eq!(fx.branch(&favourite.id).await.popularity, 62);
}

/// Faulty-store variant of `two_level` with popularities 100 and 50 and one
/// sentence on the fork
async fn approved_fork(fx: &Fixture) -> (Branch, Branch) {
    let (a, b) = two_level(fx).await;
    fx.set_popularity(&a.id, 100).await;
    fx.set_popularity(&b.id, 50).await;
    fx.engine
        .stories()
        .append_sentence("s1", Some(b.id.as_str()), "u", "Fork.")
        .await
        .unwrap();
    fx.approve_merge(&b.id, 3).await;
    (a, b)
}

async fn assert_untouched(fx: &Fixture, a: &Branch, b: &Branch) {
    let source = fx.branch(&b.id).await;
    assert!(source.is_active);
    assert!(source.merge_candidate);
    assert_eq!(source.merged_into, None);
    assert_eq!(source.merged_at, None);
    assert_eq!(source.deactivation_reason, None);
    assert_eq!(fx.branch(&a.id).await.popularity, 100);

    let store = fx.engine.context().store();
    assert!(store.is_member(&keys::active_branches("s1"), &b.id).await.unwrap());
    let story = story(fx).await;
    assert_eq!(story.sentences_on(&b.id).count(), 1);
    assert!(story.sentences.iter().all(|s| s.merged_from.is_none()));
}

#[tokio::test]
async fn failed_content_move_releases_source() {
    let (fx, faulty) = Fixture::faulty();
    let (a, b) = approved_fork(&fx).await;

    faulty.refuse_writes("story:");
    let result = fx.engine.merge_branch(&b.id, &a.id).await;
    faulty.heal();

    assert!(!result.success);
    assert_untouched(&fx, &a, &b).await;

    // the approved candidate is picked up again once the store recovers
    let results = fx.engine.merges().process_approved_merges("s1").await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{}", results[0].message);
    assert_eq!(fx.branch(&a.id).await.popularity, 125);
}

#[tokio::test]
async fn failed_index_update_undoes_whole_merge() {
    let (fx, faulty) = Fixture::faulty();
    let (a, b) = approved_fork(&fx).await;

    faulty.refuse_writes(&keys::active_branches("s1"));
    let result = fx.engine.merge_branch(&b.id, &a.id).await;
    faulty.heal();

    assert!(!result.success);
    assert_eq!(result.merged_sentence_count, 0);
    assert_untouched(&fx, &a, &b).await;
}
