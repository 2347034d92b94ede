//! Session results.

use crate::error::ServiceFault;
use crate::service::{Artifact, LifecycleState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Every member finished
    Completed,
    /// At least one member failed, was skipped or was cancelled
    PartiallyFailed,
    /// A fatal error or the caller stopped the session
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Completed => "completed",
            SessionStatus::PartiallyFailed => "partially_failed",
            SessionStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How one member ended its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ServiceOutcome {
    /// Reported finished and passed its data checks
    Finished,
    /// Failed to come up, to run or to validate, or hit the session deadline
    Failed,
    /// Not started because `dependency` did not come up
    SkippedDueToDependency { dependency: String },
    /// The caller cancelled the session while this member was active
    Cancelled,
    /// The session aborted before this member was touched
    NotStarted,
}

impl ServiceOutcome {
    /// Only [`ServiceOutcome::Finished`] counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, ServiceOutcome::Finished)
    }
}

/// Per-member section of a [`SessionReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReport {
    /// Registered service name
    pub name: String,
    pub outcome: ServiceOutcome,
    /// Lifecycle state at the end of the session
    pub state: LifecycleState,
    /// Whether the member was required by the plan
    pub required: bool,
    /// First fault recorded for the member, if any
    pub error: Option<ServiceFault>,
    /// Latest data, collected only from finished members
    pub artifact: Option<Artifact>,
}

/// Everything a caller learns about a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Unique per run
    pub id: Uuid,
    pub status: SessionStatus,
    /// When the session began resolving its members
    pub started_at: DateTime<Utc>,
    /// When the report was built
    pub finished_at: DateTime<Utc>,
    /// Members in plan order
    pub services: Vec<ServiceReport>,
    /// Why an aborted session stopped; `None` otherwise
    pub abort_reason: Option<ServiceFault>,
}

impl SessionReport {
    /// Report section of `name`.
    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Outcome of `name`.
    pub fn outcome(&self, name: &str) -> Option<&ServiceOutcome> {
        self.service(name).map(|s| &s.outcome)
    }

    /// Artifacts collected from finished members.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.services.iter().filter_map(|s| s.artifact.as_ref())
    }

    /// Names of members that did not finish.
    pub fn unfinished(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| !s.outcome.is_success())
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Whether every member finished.
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// Wall-clock time from start to report.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ArtifactData;

    fn report(name: &str, outcome: ServiceOutcome, artifact: bool) -> ServiceReport {
        ServiceReport {
            name: name.to_string(),
            state: if outcome.is_success() {
                LifecycleState::Finished
            } else {
                LifecycleState::Failed
            },
            outcome,
            required: true,
            error: None,
            artifact: artifact.then(|| Artifact::new(name, ArtifactData::Text("ok".into()))),
        }
    }

    #[test]
    fn test_accessors() {
        let now = Utc::now();
        let session = SessionReport {
            id: Uuid::new_v4(),
            status: SessionStatus::PartiallyFailed,
            started_at: now,
            finished_at: now + chrono::Duration::seconds(90),
            services: vec![
                report("sync", ServiceOutcome::Finished, true),
                report(
                    "video",
                    ServiceOutcome::SkippedDueToDependency {
                        dependency: "sync".into(),
                    },
                    false,
                ),
            ],
            abort_reason: None,
        };

        assert_eq!(session.outcome("sync"), Some(&ServiceOutcome::Finished));
        assert!(session.outcome("mic").is_none());
        assert_eq!(session.artifacts().count(), 1);
        assert_eq!(session.unfinished(), vec!["video"]);
        assert!(!session.is_completed());
        assert_eq!(session.duration().num_seconds(), 90);

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "partially_failed");
        assert_eq!(json["services"][1]["outcome"]["outcome"], "skipped_due_to_dependency");
        assert_eq!(json["services"][1]["outcome"]["dependency"], "sync");
    }
}
