//! Voting session record and its pure decision rules
//!
//! Nothing here reads the clock: every time-dependent check takes `now`.

use super::state_machine::{validate_transition, IllegalTransition};
use crate::error::BranchError;
use crate::types::new_id;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a session decides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingType {
    /// Fold the branch into its target
    Merge,
    /// Confirm the branch stays separate
    KeepSeparate,
    /// Retire the branch
    Delete,
}

impl fmt::Display for VotingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VotingType::Merge => "merge",
            VotingType::KeepSeparate => "keep_separate",
            VotingType::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl FromStr for VotingType {
    type Err = BranchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(VotingType::Merge),
            "keep_separate" | "keep-separate" => Ok(VotingType::KeepSeparate),
            "delete" => Ok(VotingType::Delete),
            other => Err(BranchError::Validation(format!("unknown voting type: {other}"))),
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStatus {
    /// Accepting votes
    Active,
    /// Threshold met with enough approval
    Passed,
    /// Threshold met without enough approval
    Failed,
    /// Deadline passed before the threshold was met
    Expired,
}

/// Time-boxed consensus process for one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingSession {
    /// Session id
    pub id: String,
    /// Branch under vote
    pub branch_id: String,
    /// Story of the branch
    pub story_id: String,
    /// What is being decided
    pub voting_type: VotingType,
    /// Approving voters
    #[serde(default)]
    pub votes_for: Vec<String>,
    /// Rejecting voters
    #[serde(default)]
    pub votes_against: Vec<String>,
    /// `votes_for.len() + votes_against.len()`
    #[serde(default)]
    pub total_votes: u32,
    /// Opening instant
    pub started_at: DateTime<Utc>,
    /// Closing instant
    pub deadline: DateTime<Utc>,
    /// Votes required before a decision
    pub threshold: u32,
    /// Lifecycle status
    pub status: VotingStatus,
}

impl VotingSession {
    /// Open an active session at `now`
    #[must_use]
    pub fn open(
        branch_id: impl Into<String>,
        story_id: impl Into<String>,
        voting_type: VotingType,
        now: DateTime<Utc>,
        period: Duration,
        threshold: u32,
    ) -> Self {
        Self {
            id: new_id("vote"),
            branch_id: branch_id.into(),
            story_id: story_id.into(),
            voting_type,
            votes_for: Vec::new(),
            votes_against: Vec::new(),
            total_votes: 0,
            started_at: now,
            deadline: now + period,
            threshold,
            status: VotingStatus::Active,
        }
    }

    /// Check if the deadline has passed at `now`
    #[inline]
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Check if the session still accepts votes at `now`
    #[inline]
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == VotingStatus::Active && !self.is_past_deadline(now)
    }

    /// Record a voter's choice, replacing any earlier vote from them
    pub fn record_vote(&mut self, voter_id: &str, approve: bool) {
        self.votes_for.retain(|v| v != voter_id);
        self.votes_against.retain(|v| v != voter_id);
        if approve {
            self.votes_for.push(voter_id.to_string());
        } else {
            self.votes_against.push(voter_id.to_string());
        }
        self.recount();
    }

    /// Share of approving votes (0 with no votes)
    #[must_use]
    pub fn approval_ratio(&self) -> f64 {
        if self.total_votes == 0 {
            return 0.0;
        }
        f64::from(self.count(&self.votes_for)) / f64::from(self.total_votes)
    }

    /// Outcome once the threshold is met, given the required approval ratio
    #[must_use]
    pub fn decide(&self, required_ratio: f64) -> Option<VotingStatus> {
        if self.total_votes < self.threshold {
            return None;
        }
        if self.approval_ratio() >= required_ratio {
            Some(VotingStatus::Passed)
        } else {
            Some(VotingStatus::Failed)
        }
    }

    /// Move to a new status
    ///
    /// # Errors
    /// Returns `IllegalTransition` if the current status is terminal
    pub fn transition(&mut self, to: VotingStatus) -> Result<(), IllegalTransition> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }

    /// Expire an active session whose deadline has passed
    ///
    /// Returns whether the status changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == VotingStatus::Active && self.is_past_deadline(now) {
            self.status = VotingStatus::Expired;
            true
        } else {
            false
        }
    }

    fn recount(&mut self) {
        self.total_votes = self.count(&self.votes_for) + self.count(&self.votes_against);
    }

    fn count(&self, voters: &[String]) -> u32 {
        u32::try_from(voters.len()).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(threshold: u32) -> (VotingSession, DateTime<Utc>) {
        let now = Utc::now();
        let s = VotingSession::open("b1", "s1", VotingType::Merge, now, Duration::hours(1), threshold);
        (s, now)
    }

    #[test]
    fn revote_replaces_previous_choice() {
        let (mut s, _) = session(5);
        s.record_vote("alice", true);
        s.record_vote("alice", false);

        assert_eq!(s.total_votes, 1);
        assert!(s.votes_for.is_empty());
        assert_eq!(s.votes_against, vec!["alice"]);
    }

    #[test]
    fn no_decision_below_threshold() {
        let (mut s, _) = session(3);
        s.record_vote("a", true);
        s.record_vote("b", true);
        assert_eq!(s.decide(0.6), None);
    }

    #[test]
    fn passes_at_exact_ratio() {
        let (mut s, _) = session(5);
        for voter in ["a", "b", "c"] {
            s.record_vote(voter, true);
        }
        for voter in ["d", "e"] {
            s.record_vote(voter, false);
        }
        assert!((s.approval_ratio() - 0.6).abs() < f64::EPSILON);
        assert_eq!(s.decide(0.6), Some(VotingStatus::Passed));
    }

    #[test]
    fn fails_below_ratio() {
        let (mut s, _) = session(2);
        s.record_vote("a", true);
        s.record_vote("b", false);
        assert_eq!(s.decide(0.6), Some(VotingStatus::Failed));
    }

    #[test]
    fn deadline_is_exclusive() {
        let (s, now) = session(1);
        assert!(!s.is_past_deadline(now + Duration::hours(1)));
        assert!(s.is_past_deadline(now + Duration::hours(1) + Duration::seconds(1)));
        assert!(s.is_live(now));
    }

    #[test]
    fn expire_only_when_due() {
        let (mut s, now) = session(1);
        assert!(!s.expire_if_due(now));
        assert!(s.expire_if_due(now + Duration::hours(2)));
        assert_eq!(s.status, VotingStatus::Expired);
        assert!(!s.expire_if_due(now + Duration::hours(3)));
    }

    #[test]
    fn voting_type_parses_display_form() {
        for t in [VotingType::Merge, VotingType::KeepSeparate, VotingType::Delete] {
            assert_eq!(t.to_string().parse::<VotingType>().unwrap(), t);
        }
        assert!("fork".parse::<VotingType>().is_err());
    }

    #[test]
    fn terminal_status_cannot_change() {
        let (mut s, _) = session(1);
        s.transition(VotingStatus::Passed).unwrap();
        assert!(s.transition(VotingStatus::Failed).is_err());
    }
}
