//! Core library for coordinating laboratory services during an experiment session.
//!
//! Devices (cameras, sync boxes, acquisition stations, recording agents) are
//! wrapped as [`Service`]s, registered in a [`ServiceRegistry`] and driven
//! through a common lifecycle by the [`SessionOrchestrator`]. Devices are
//! reached over request/reply, publish/subscribe or remote shell transports.

pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod service;
pub mod session;
pub mod transport;

pub use config::{ConfigError, RigConfig};
pub use error::{ErrorKind, ServiceError, ServiceFault, ServiceResult, TransportError};
pub use orchestrator::{OptionalFailurePolicy, SessionMember, SessionOrchestrator, SessionPlan};
pub use registry::{ServiceHandle, ServiceOptions, ServiceRegistry};
pub use retry::{execute_with_retry, RetryPolicy};
pub use service::{
    Artifact, ArtifactData, DeviceService, LifecycleEvent, LifecycleState, Service,
    ServiceStatus, TransitionCause,
};
pub use session::{ServiceOutcome, ServiceReport, SessionReport, SessionStatus};
pub use transport::{Transport, TransportKind};
