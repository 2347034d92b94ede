//! Lifecycle state machine and the records built around it.

use crate::error::ServiceFault;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-service lifecycle state.
///
/// States only advance forward; see [`LifecycleState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Registered, not yet initialized
    Idle,
    /// Initialized and ready to start
    Ready,
    /// Start command in flight
    Starting,
    /// Started, being polled for completion
    Running,
    /// Device reported completion without error
    Finished,
    /// Device or transport failure
    Failed,
    /// Never started because a dependency did not come up
    Skipped,
    /// Session was cancelled while the service was active
    Cancelled,
}

impl LifecycleState {
    /// Terminal states admit no further transitions except an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Finished
                | LifecycleState::Failed
                | LifecycleState::Skipped
                | LifecycleState::Cancelled
        )
    }

    /// Starting or running.
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Running)
    }

    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Idle, Ready) => true,
            (Ready, Starting) => true,
            (Starting, Running) => true,
            (Running, Finished) => true,
            (Idle | Ready, Skipped) => true,
            (Idle | Ready | Starting | Running, Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Ready => "ready",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Finished => "finished",
            LifecycleState::Failed => "failed",
            LifecycleState::Skipped => "skipped",
            LifecycleState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The event that caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Initialize,
    Start,
    Poll,
    Stop,
    Timeout,
    Cancel,
    Dependency,
    Reset,
}

/// Snapshot of a service's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: LifecycleState,
    pub last_error: Option<ServiceFault>,
    pub last_verified: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            last_error: None,
            last_verified: None,
            updated_at: Utc::now(),
        }
    }
}

/// One lifecycle transition, as published to telemetry subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub service: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub cause: TransitionCause,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceFault>,
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    #[test]
    fn test_forward_path() {
        assert!(Idle.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn test_no_regression_or_skipping_ahead() {
        assert!(!Running.can_transition_to(Ready));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Ready.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Finished));
        assert!(!Starting.can_transition_to(Skipped));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Finished, Failed, Skipped, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Idle, Ready, Starting, Running, Finished, Failed, Skipped, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = LifecycleEvent {
            service: "sync".into(),
            from: Running,
            to: Finished,
            cause: TransitionCause::Poll,
            at: Utc::now(),
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["from"], "running");
        assert_eq!(json["to"], "finished");
        assert_eq!(json["cause"], "poll");
        assert!(json.get("error").is_none());
    }
}
