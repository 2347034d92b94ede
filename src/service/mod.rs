//! The uniform service abstraction.
//!
//! Every device taking part in a session implements [`Service`]. The trait is
//! deliberately small: the lifecycle rules live in
//! [`crate::registry::ServiceHandle`], which wraps a service and drives it
//! through the [`LifecycleState`] machine. Implementations only talk to their
//! device.
//!
//! Most rigs need no custom implementation at all: [`DeviceService`] speaks the
//! common command protocol over any of the three transport kinds and is built
//! straight from a `[[services]]` configuration entry.

pub mod device;
pub mod state;

pub use device::{DeviceLink, DeviceService};
pub use state::{LifecycleEvent, LifecycleState, ServiceStatus, TransitionCause};

use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::transport::TransportKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Async contract implemented by every device.
///
/// Methods take `&self`; implementations keep their own state behind interior
/// mutability so a service can be shared between the orchestrator and the
/// poller. Transport failures should be returned as
/// [`crate::ServiceError::Transport`] so the caller's retry policy can absorb
/// the transient ones.
#[async_trait]
pub trait Service: Send + Sync {
    /// Transport kind used to reach the device.
    fn transport_kind(&self) -> TransportKind;

    /// Idempotent setup. Safe to call again before `start`.
    async fn initialize(&self, config: &ServiceConfig) -> ServiceResult<()>;

    /// Preflight connectivity/readiness check, without side effects.
    async fn test(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Begin recording.
    async fn start(&self) -> ServiceResult<()>;

    /// Confirm right after [`Service::start`] that the device took it up.
    async fn verify(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Non-blocking completion check.
    ///
    /// Returning `true` while [`Service::last_error`] is set means the device
    /// stopped because of a failure.
    async fn verify_finished(&self) -> ServiceResult<bool>;

    /// Failure detail reported by the device, if any.
    fn last_error(&self) -> Option<String>;

    /// Stop the device. Must be safe even if it never reported finished.
    async fn stop(&self) -> ServiceResult<()>;

    /// Wrap up after the device reported finished, e.g. wait for post-processing.
    async fn finalize(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Check the data recorded during the session. Runs after [`Service::finalize`].
    async fn validate(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Most recent data produced by the device. No lifecycle side effects.
    async fn get_latest_data(&self) -> ServiceResult<Option<Artifact>>;
}

/// Data collected from a finished service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Service that produced the data
    pub service: String,
    pub collected_at: DateTime<Utc>,
    pub data: ArtifactData,
}

impl Artifact {
    /// Artifact of `service`, stamped with the current time.
    pub fn new(service: impl Into<String>, data: ArtifactData) -> Self {
        Self {
            service: service.into(),
            collected_at: Utc::now(),
            data,
        }
    }
}

/// Payload of an [`Artifact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ArtifactData {
    /// Files written by the device during the session
    Files(Vec<PathBuf>),
    /// Structured reply from the device
    Json(Value),
    /// Plain-text reply from the device
    Text(String),
}
