use super::session::VotingStatus;
use crate::error::BranchError;

/// Attempted status change the session lifecycle does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal voting transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    /// Current status
    pub from: VotingStatus,
    /// Requested status
    pub to: VotingStatus,
}

impl From<IllegalTransition> for BranchError {
    fn from(value: IllegalTransition) -> Self {
        BranchError::InvalidState(value.to_string())
    }
}

/// Validates a session status transition.
///
/// Only an active session may change status; passed, failed and expired are
/// terminal.
pub fn validate_transition(from: VotingStatus, to: VotingStatus) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Statuses reachable from `from` in one step
pub fn allowed_transitions(from: VotingStatus) -> Vec<VotingStatus> {
    use VotingStatus::*;
    match from {
        Active => vec![Passed, Failed, Expired],
        Passed => vec![],
        Failed => vec![],
        Expired => vec![],
    }
}

/// Check if no transition leaves `status`
#[inline]
pub fn is_terminal(status: VotingStatus) -> bool {
    allowed_transitions(status).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_reaches_every_outcome() {
        for to in [VotingStatus::Passed, VotingStatus::Failed, VotingStatus::Expired] {
            assert!(validate_transition(VotingStatus::Active, to).is_ok());
        }
        assert!(validate_transition(VotingStatus::Active, VotingStatus::Active).is_err());
    }

    #[test]
    fn outcomes_are_terminal() {
        assert!(!is_terminal(VotingStatus::Active));
        assert!(is_terminal(VotingStatus::Passed));
        assert!(is_terminal(VotingStatus::Failed));
        assert!(is_terminal(VotingStatus::Expired));
    }

    #[test]
    fn illegal_transition_maps_to_invalid_state() {
        let err: BranchError = validate_transition(VotingStatus::Expired, VotingStatus::Passed)
            .unwrap_err()
            .into();
        assert!(matches!(err, BranchError::InvalidState(_)));
    }
}
