//! Transport adapters
//!
//! This module contains implementations of the [`Transport`] trait, providing
//! the low-level mechanics of one communication channel per device:
//!
//! - [`RequestReplyTransport`]: newline-delimited JSON request/response over TCP
//! - [`PubSubTransport`]: topic-based publish/subscribe over TCP
//! - [`RemoteShellTransport`]: command execution on another host via `ssh`
//! - [`MockTransport`]: scripted replies for tests and dry runs
//!
//! Adapters carry no orchestration state. Each instance is bound to a single
//! endpoint; connection reuse is an internal detail invisible to callers.

pub mod mock;
pub mod pubsub;
pub mod remote_shell;
pub mod request_reply;

pub use mock::MockTransport;
pub use pubsub::PubSubTransport;
pub use remote_shell::{RemoteShellTransport, ShellOutput};
pub use request_reply::RequestReplyTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How a device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    RequestReply,
    PubSub,
    RemoteShell,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::RequestReply => "request_reply",
            TransportKind::PubSub => "pub_sub",
            TransportKind::RemoteShell => "remote_shell",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal send/receive contract shared by every adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind implemented by this adapter.
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint, used in errors and logs.
    fn endpoint(&self) -> &str;

    /// Send `command` with `payload` and return the device's raw response.
    async fn send(&self, command: &str, payload: &Value) -> Result<Value, TransportError>;

    /// Make sure the channel to the device is open, without exchanging any
    /// device message. Adapters that connect per call have nothing to do.
    async fn ensure_connected(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Next queued message, if any. Only meaningful for pub/sub.
    async fn receive(&self) -> Result<Option<Value>, TransportError> {
        Err(TransportError::Unsupported {
            kind: self.kind().as_str(),
            operation: "receive",
        })
    }
}

/// Reply envelope used by the JSON line protocols.
#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Interpret one reply line. A bare JSON value is taken as a successful result.
pub(crate) fn decode_reply(endpoint: &str, line: &str) -> Result<Value, TransportError> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| TransportError::MalformedResponse {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

    let is_envelope = value
        .as_object()
        .map(|obj| obj.contains_key("ok"))
        .unwrap_or(false);
    if !is_envelope {
        return Ok(value);
    }

    let envelope: ReplyEnvelope =
        serde_json::from_value(value).map_err(|e| TransportError::MalformedResponse {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;
    if envelope.ok {
        Ok(envelope.result)
    } else {
        Err(TransportError::Remote {
            endpoint: endpoint.to_string(),
            message: envelope
                .error
                .unwrap_or_else(|| "unspecified device error".to_string()),
        })
    }
}
