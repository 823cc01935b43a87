//! Maintenance sweeps: dormancy, decided sessions, merges and isolation

use arbor_engine::keys;
use arbor_engine::maintenance::{COMMUNITY_VOTE_REASON, INACTIVE_REASON};
use arbor_engine::{BranchingRule, VotingStatus, VotingType};
use arbor_store::KvStore;
use arbor_test_utils::Fixture;
use chrono::Duration;
use pretty_assertions::assert_eq;

async fn keep_alive(fx: &Fixture, branch_ids: &[&String]) {
    for id in branch_ids {
        fx.set_last_activity(id, fx.now()).await;
    }
}

#[tokio::test]
async fn dormant_leaf_is_deactivated() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let c = fx.child("s1", &a.id, "C").await;

    fx.advance(Duration::days(8));
    keep_alive(&fx, &[&a.id]).await;

    let cleaned = fx.engine.maintenance().cleanup_inactive_branches("s1").await;

    assert_eq!(cleaned, vec![c.id.clone()]);
    let retired = fx.branch(&c.id).await;
    assert!(!retired.is_active);
    assert_eq!(retired.deactivation_reason.as_deref(), Some(INACTIVE_REASON));
    assert!(fx.branch(&a.id).await.is_active);
}

#[tokio::test]
async fn recent_activity_keeps_branch() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let c = fx.child("s1", &a.id, "C").await;

    fx.advance(Duration::days(5));
    keep_alive(&fx, &[&c.id]).await;
    fx.advance(Duration::days(3));

    let cleaned = fx.engine.maintenance().cleanup_inactive_branches("s1").await;
    assert!(!cleaned.contains(&c.id));
    assert!(fx.branch(&c.id).await.is_active);
}

#[tokio::test]
async fn dormant_parent_goes_to_delete_vote() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let d = fx.child("s1", &a.id, "D").await;
    let e = fx.child("s1", &d.id, "E").await;
    let f = fx.child("s1", &d.id, "F").await;

    fx.advance(Duration::days(8));
    keep_alive(&fx, &[&a.id, &e.id, &f.id]).await;

    let cleaned = fx.engine.maintenance().cleanup_inactive_branches("s1").await;

    assert!(cleaned.is_empty());
    assert!(fx.branch(&d.id).await.is_active);
    let session = fx.engine.voting().get_voting_session(&d.id).await.unwrap().unwrap();
    assert_eq!(session.voting_type, VotingType::Delete);
    assert_eq!(session.status, VotingStatus::Active);
    // 70% of the default threshold of 5
    assert_eq!(session.threshold, 3);

    // a second pass leaves the live session alone
    let again = fx.engine.maintenance().cleanup_inactive_branches("s1").await;
    assert!(again.is_empty());
    let same = fx.engine.voting().get_voting_session(&d.id).await.unwrap().unwrap();
    assert_eq!(same.id, session.id);
}

#[tokio::test]
async fn delete_threshold_has_floor_of_two() {
    let fx = Fixture::new();
    fx.story("s1").await;
    fx.engine
        .rules()
        .set_branching_rule(&BranchingRule::new("s1", 10, 60, 1))
        .await
        .unwrap();
    let a = fx.root("s1", "A").await;
    let d = fx.child("s1", &a.id, "D").await;
    let e = fx.child("s1", &d.id, "E").await;

    fx.advance(Duration::days(8));
    keep_alive(&fx, &[&a.id, &e.id]).await;
    fx.engine.maintenance().cleanup_inactive_branches("s1").await;

    let session = fx.engine.voting().get_voting_session(&d.id).await.unwrap().unwrap();
    assert_eq!(session.threshold, 2);
    assert_eq!(session.deadline - session.started_at, Duration::minutes(60));
}

#[tokio::test]
async fn merge_candidate_is_not_put_to_delete_vote() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let d = fx.child("s1", &a.id, "D").await;
    let e = fx.child("s1", &d.id, "E").await;
    fx.approve_merge(&d.id, 5).await;

    fx.advance(Duration::days(8));
    keep_alive(&fx, &[&a.id, &e.id]).await;
    fx.engine.maintenance().cleanup_inactive_branches("s1").await;

    let session = fx.engine.voting().get_voting_session(&d.id).await.unwrap().unwrap();
    assert_eq!(session.voting_type, VotingType::Merge);
    assert_eq!(session.status, VotingStatus::Passed);
}

#[tokio::test]
async fn overdue_session_is_expired() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let c = fx.child("s1", &a.id, "C").await;
    fx.engine.vote_branch_merge(&c.id, "alice", true).await.unwrap();

    fx.advance(Duration::days(2));
    let cleaned = fx.engine.maintenance().cleanup_inactive_branches("s1").await;

    assert!(cleaned.is_empty());
    let session = fx.engine.voting().get_voting_session(&c.id).await.unwrap().unwrap();
    assert_eq!(session.status, VotingStatus::Expired);
    assert!(!fx.branch(&c.id).await.merge_candidate);
}

#[tokio::test]
async fn passed_delete_vote_retires_branch() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let d = fx.child("s1", &a.id, "D").await;
    fx.child("s1", &d.id, "E").await;

    for voter in ["v1", "v2", "v3", "v4", "v5"] {
        fx.engine.cast_vote(&d.id, VotingType::Delete, voter, true).await.unwrap();
    }

    let cleaned = fx.engine.maintenance().cleanup_inactive_branches("s1").await;

    assert_eq!(cleaned, vec![d.id.clone()]);
    let retired = fx.branch(&d.id).await;
    assert!(!retired.is_active);
    assert_eq!(retired.deactivation_reason.as_deref(), Some(COMMUNITY_VOTE_REASON));
    assert!(fx.engine.voting().get_voting_session(&d.id).await.unwrap().is_none());
}

#[tokio::test]
async fn passed_keep_separate_vote_is_consumed() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let c = fx.child("s1", &a.id, "C").await;

    for voter in ["v1", "v2", "v3", "v4", "v5"] {
        fx.engine.cast_vote(&c.id, VotingType::KeepSeparate, voter, true).await.unwrap();
    }
    let cleaned = fx.engine.maintenance().cleanup_inactive_branches("s1").await;

    assert!(cleaned.is_empty());
    let kept = fx.branch(&c.id).await;
    assert!(kept.is_active);
    assert!(!kept.merge_candidate);
    assert!(fx.engine.voting().get_voting_session(&c.id).await.unwrap().is_none());
}

#[tokio::test]
async fn full_run_merges_and_is_idempotent() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let b = fx.child("s1", &a.id, "B").await;
    fx.approve_merge(&b.id, 5).await;

    let report = fx.engine.run_branch_maintenance("s1").await;

    assert!(report.cleaned_branches.is_empty());
    assert_eq!(report.merge_results.len(), 1);
    assert!(report.merge_results[0].success);
    assert_eq!(report.refreshed, 1);
    assert!(!fx.branch(&b.id).await.is_active);
    // no engagement record: full recency plus the merged child still listed
    assert_eq!(fx.branch(&a.id).await.popularity, 45);

    let second = fx.engine.run_branch_maintenance("s1").await;
    assert!(second.is_quiet(), "{}", second.message);
}

#[tokio::test]
async fn corrupt_story_does_not_stop_sweep() {
    let fx = Fixture::new();
    fx.story("good").await;
    fx.story("bad").await;
    let root = fx.root("good", "A").await;
    let leaf = fx.child("good", &root.id, "C").await;
    let bad_root = fx.root("bad", "A").await;

    let store = fx.engine.context().store();
    store.set(&keys::branch(&bad_root.id), "{not json".to_string()).await.unwrap();

    fx.advance(Duration::days(8));
    keep_alive(&fx, &[&root.id]).await;

    let mut reports = fx.engine.run_all_maintenance().await;
    reports.sort_by(|x, y| x.story_id.cmp(&y.story_id));

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].story_id, "bad");
    assert!(reports[0].is_quiet());
    assert_eq!(reports[1].story_id, "good");
    assert_eq!(reports[1].cleaned_branches, vec![leaf.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_runs_merge_once() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let b = fx.child("s1", &a.id, "B").await;
    fx.engine
        .stories()
        .append_sentence("s1", Some(b.id.as_str()), "u", "Fork.")
        .await
        .unwrap();
    fx.approve_merge(&b.id, 5).await;

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let engine = fx.engine.clone();
            tokio::spawn(async move { engine.run_branch_maintenance("s1").await })
        })
        .collect();
    let reports: Vec<_> = futures::future::join_all(runs)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let merges: Vec<_> = reports.iter().flat_map(|r| &r.merge_results).collect();
    assert_eq!(merges.len(), 1);
    assert!(merges[0].success);
    assert_eq!(merges[0].merged_sentence_count, 1);

    let story = fx.engine.stories().get_story("s1").await.unwrap().unwrap();
    assert_eq!(story.sentences_on(&a.id).count(), 1);
    assert!(!fx.branch(&b.id).await.is_active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_runs_retire_and_expire_once() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let c = fx.child("s1", &a.id, "C").await;
    let d = fx.child("s1", &a.id, "D").await;
    let opened = fx.engine.vote_branch_merge(&d.id, "alice", true).await.unwrap();

    fx.advance(Duration::days(8));
    keep_alive(&fx, &[&a.id, &d.id]).await;

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let engine = fx.engine.clone();
            tokio::spawn(async move { engine.run_branch_maintenance("s1").await })
        })
        .collect();
    let cleaned: Vec<String> = futures::future::join_all(runs)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap().cleaned_branches)
        .collect();

    assert_eq!(cleaned, vec![c.id.clone()]);
    let session = fx.engine.voting().get_voting_session(&d.id).await.unwrap().unwrap();
    assert_eq!(session.id, opened.id);
    assert_eq!(session.status, VotingStatus::Expired);
    assert!(fx.branch(&d.id).await.is_active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_vote_racing_sweep_never_counts_in_lapsed_session() {
    let fx = Fixture::new();
    fx.story("s1").await;
    let a = fx.root("s1", "A").await;
    let c = fx.child("s1", &a.id, "C").await;
    let opened = fx.engine.vote_branch_merge(&c.id, "alice", true).await.unwrap();
    fx.advance(Duration::hours(25));

    let voter = {
        let engine = fx.engine.clone();
        let id = c.id.clone();
        tokio::spawn(async move { engine.vote_branch_merge(&id, "bob", true).await })
    };
    let sweep = {
        let engine = fx.engine.clone();
        tokio::spawn(async move { engine.run_branch_maintenance("s1").await })
    };
    let (vote, report) = tokio::join!(voter, sweep);
    report.unwrap();

    let stored = fx.engine.voting().get_voting_session(&c.id).await.unwrap().unwrap();
    match vote.unwrap() {
        // the sweep expired the old session first, so bob opened a new one
        Ok(session) => {
            assert_ne!(session.id, opened.id);
            assert_eq!(stored.id, session.id);
            assert_eq!(stored.votes_for, vec!["bob"]);
            assert_eq!(stored.status, VotingStatus::Active);
        }
        Err(err) => {
            assert!(matches!(err, arbor_engine::BranchError::Expired { .. }), "{err}");
            assert_eq!(stored.id, opened.id);
            assert_eq!(stored.votes_for, vec!["alice"]);
            assert_eq!(stored.status, VotingStatus::Expired);
        }
    }
    assert!(!fx.branch(&c.id).await.merge_candidate);
}
