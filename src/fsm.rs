use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Meeting lifecycle state (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Requested,
    Joining,
    AwaitingAdmission,
    Active,
    Stopping,
    Completed,
    Failed,
}

impl MeetingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MeetingStatus::Completed | MeetingStatus::Failed)
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            MeetingStatus::Requested => "requested",
            MeetingStatus::Joining => "joining",
            MeetingStatus::AwaitingAdmission => "awaiting_admission",
            MeetingStatus::Active => "active",
            MeetingStatus::Stopping => "stopping",
            MeetingStatus::Completed => "completed",
            MeetingStatus::Failed => "failed",
        }
    }

    /// Validate `self -> next`. A same-state transition is an idempotent
    /// no-op (spec §4.1) and returns `Ok(true)`; a legal transition returns
    /// `Ok(false)`; an illegal one returns `InvalidTransition`.
    pub fn validate_transition(&self, next: MeetingStatus) -> Result<bool, Error> {
        if *self == next {
            return Ok(true);
        }
        let allowed: &[MeetingStatus] = match self {
            MeetingStatus::Requested => &[
                MeetingStatus::Joining,
                MeetingStatus::Failed,
                MeetingStatus::Completed,
                MeetingStatus::Stopping,
            ],
            MeetingStatus::Joining => &[
                MeetingStatus::AwaitingAdmission,
                MeetingStatus::Failed,
                MeetingStatus::Completed,
                MeetingStatus::Stopping,
            ],
            MeetingStatus::AwaitingAdmission => &[
                MeetingStatus::Active,
                MeetingStatus::Failed,
                MeetingStatus::Completed,
                MeetingStatus::Stopping,
            ],
            MeetingStatus::Active => &[
                MeetingStatus::Stopping,
                MeetingStatus::Completed,
                MeetingStatus::Failed,
            ],
            MeetingStatus::Stopping => &[MeetingStatus::Completed, MeetingStatus::Failed],
            MeetingStatus::Completed | MeetingStatus::Failed => &[],
        };
        if allowed.contains(&next) {
            Ok(false)
        } else {
            Err(Error::InvalidTransition(format!(
                "{:?} -> {:?} is not allowed",
                self, next
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_state_is_idempotent_noop() {
        assert_eq!(
            MeetingStatus::Active
                .validate_transition(MeetingStatus::Active)
                .unwrap(),
            true
        );
    }

    #[test]
    fn requested_to_joining_is_allowed() {
        assert_eq!(
            MeetingStatus::Requested
                .validate_transition(MeetingStatus::Joining)
                .unwrap(),
            false
        );
    }

    #[test]
    fn terminal_states_reject_all_transitions() {
        assert!(MeetingStatus::Completed
            .validate_transition(MeetingStatus::Active)
            .is_err());
        assert!(MeetingStatus::Failed
            .validate_transition(MeetingStatus::Joining)
            .is_err());
    }

    #[test]
    fn joining_cannot_skip_back_to_requested() {
        assert!(MeetingStatus::Joining
            .validate_transition(MeetingStatus::Requested)
            .is_err());
    }

    #[test]
    fn active_to_stopping_to_completed_chain_is_valid() {
        assert!(MeetingStatus::Active
            .validate_transition(MeetingStatus::Stopping)
            .is_ok());
        assert!(MeetingStatus::Stopping
            .validate_transition(MeetingStatus::Completed)
            .is_ok());
    }
}
