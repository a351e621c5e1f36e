//! Session lifecycle state.

use std::fmt;

/// Lifecycle of a bridged session.
///
/// `Starting -> Active -> Closing -> Closed`, with `Starting -> Closing` for
/// sessions that never came up. Every path to `Closed` goes through `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Process spawn and registration in progress.
    Starting,
    /// Both directions are being pumped.
    Active,
    /// Teardown in progress.
    Closing,
    /// Process reaped, connection closed, registry entry removed.
    Closed,
}

impl SessionState {
    /// Returns whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Active)
                | (Self::Starting, Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        assert!(SessionState::Starting.can_transition_to(SessionState::Active));
        assert!(SessionState::Active.can_transition_to(SessionState::Closing));
        assert!(SessionState::Closing.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn test_failed_start_goes_through_closing() {
        assert!(SessionState::Starting.can_transition_to(SessionState::Closing));
        assert!(!SessionState::Starting.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn test_no_skipping_closing() {
        assert!(!SessionState::Active.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn test_no_going_back() {
        assert!(!SessionState::Active.can_transition_to(SessionState::Starting));
        assert!(!SessionState::Closing.can_transition_to(SessionState::Active));
        assert!(!SessionState::Closed.can_transition_to(SessionState::Starting));
        assert!(!SessionState::Closed.can_transition_to(SessionState::Closing));
    }

    #[test]
    fn test_self_transitions_rejected() {
        for state in [
            SessionState::Starting,
            SessionState::Active,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn test_closed_is_final_and_display() {
        for next in [
            SessionState::Starting,
            SessionState::Active,
            SessionState::Closing,
        ] {
            assert!(!SessionState::Closed.can_transition_to(next));
        }
        assert_eq!(SessionState::Active.to_string(), "active");
    }
}
