//! Error types for service orchestration.
//!
//! This module defines the error taxonomy shared by every layer of the crate.
//! Using the `thiserror` crate, it keeps transport failures, registry misuse and
//! session-level conditions in one place so they can be propagated with `?`.
//!
//! ## Error Hierarchy
//!
//! - **[`TransportError`]**: raised by transport adapters. Each variant is either
//!   retryable (timeouts, refused or reset connections) or fatal for the call
//!   (authentication, malformed replies, device-reported errors).
//! - **[`ServiceError`]**: everything above the transport. Retry exhaustion wraps
//!   the last transport error; registry misuse (`DuplicateName`, `NotFound`) and
//!   state machine violations are programming errors and are never retried.
//! - **[`ServiceFault`]**: a cloneable record of an error (kind + message) that
//!   lifecycle statuses and session reports keep after the error itself is gone.

use crate::service::LifecycleState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the service error type.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Failure of a single transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing listens at the endpoint.
    #[error("Connection refused by {endpoint}")]
    ConnectionRefused {
        /// Address of the device, `host:port` or `tcp://host:port`
        endpoint: String,
    },

    /// The peer closed or reset an open connection.
    #[error("Connection to {endpoint} reset")]
    ConnectionReset {
        /// Address of the device
        endpoint: String,
    },

    /// No reply arrived within the transport timeout.
    #[error("Timed out after {timeout:?} waiting for {endpoint}")]
    Timeout {
        /// Address of the device
        endpoint: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Any other socket or process failure.
    #[error("I/O error talking to {endpoint}: {message}")]
    Io {
        /// Address of the device
        endpoint: String,
        /// Underlying error text
        message: String,
    },

    /// The remote host rejected the credentials.
    #[error("Authentication with {endpoint} failed: {message}")]
    Authentication {
        /// Address of the device
        endpoint: String,
        /// Underlying error text
        message: String,
    },

    /// The reply could not be decoded.
    #[error("Malformed response from {endpoint}: {message}")]
    MalformedResponse {
        /// Address of the device
        endpoint: String,
        /// What was wrong with the reply
        message: String,
    },

    /// The device answered with an error reply.
    #[error("Device at {endpoint} reported an error: {message}")]
    Remote {
        /// Address of the device
        endpoint: String,
        /// Error text sent by the device
        message: String,
    },

    /// The transport has no such operation, e.g. `receive` on request/reply.
    #[error("Operation '{operation}' is not supported by {kind} transport")]
    Unsupported {
        /// Transport kind, as in [`TransportKind::as_str`](crate::transport::TransportKind::as_str)
        kind: &'static str,
        /// Name of the refused operation
        operation: &'static str,
    },
}

impl TransportError {
    /// Whether reattempting the call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused { .. }
                | TransportError::ConnectionReset { .. }
                | TransportError::Timeout { .. }
                | TransportError::Io { .. }
        )
    }

    /// Classify an I/O error raised while talking to `endpoint`.
    pub fn from_io(endpoint: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let endpoint = endpoint.to_string();
        match err.kind() {
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused { endpoint },
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::ConnectionReset { endpoint },
            ErrorKind::PermissionDenied => TransportError::Authentication {
                endpoint,
                message: err.to_string(),
            },
            _ => TransportError::Io {
                endpoint,
                message: err.to_string(),
            },
        }
    }
}

/// Errors surfaced by services, the registry and the orchestrator.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: TransportError },

    #[error("A service named '{0}' is already registered")]
    DuplicateName(String),

    #[error("No service named '{0}' is registered")]
    NotFound(String),

    #[error("Dependency '{dependency}' of '{service}' did not come up")]
    DependencyFailed { service: String, dependency: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Session timed out after {0:?}")]
    SessionTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Service '{service}' cannot go from {from} to {to}")]
    InvalidTransition {
        service: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServiceError {
    /// Only retryable transport errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Transport(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Programming errors that abort a session instead of failing one device.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServiceError::DuplicateName(_)
                | ServiceError::NotFound(_)
                | ServiceError::DependencyCycle(_)
                | ServiceError::InvalidTransition { .. }
                | ServiceError::Config(_)
        )
    }

    /// Coarse classification used in reports and lifecycle events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Transport(_) => ErrorKind::Transport,
            ServiceError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            ServiceError::DuplicateName(_) => ErrorKind::DuplicateName,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            ServiceError::DependencyCycle(_) => ErrorKind::DependencyCycle,
            ServiceError::SessionTimeout(_) => ErrorKind::SessionTimeout,
            ServiceError::Cancelled => ErrorKind::Cancelled,
            ServiceError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            ServiceError::Device(_) => ErrorKind::Device,
            ServiceError::Config(_) => ErrorKind::Config,
        }
    }

    /// Snapshot this error as a cloneable fault record.
    pub fn fault(&self) -> ServiceFault {
        ServiceFault {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Copyable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    RetryExhausted,
    DuplicateName,
    NotFound,
    DependencyFailed,
    DependencyCycle,
    SessionTimeout,
    Cancelled,
    InvalidTransition,
    Device,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::DuplicateName => "duplicate_name",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::DependencyCycle => "dependency_cycle",
            ErrorKind::SessionTimeout => "session_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Device => "device",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Error detail kept in statuses, events and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFault {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ServiceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl From<&ServiceError> for ServiceFault {
    fn from(err: &ServiceError) -> Self {
        err.fault()
    }
}
