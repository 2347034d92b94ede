//! Scripted transport for tests and dry runs.

use super::{Transport, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

type Reply = Result<Value, TransportError>;

/// Transport that answers from a script and records every call.
///
/// One-shot replies queued with [`MockTransport::push_reply`] are consumed
/// first; afterwards the sticky reply set with [`MockTransport::reply`] is
/// returned. Unscripted commands answer `null`.
pub struct MockTransport {
    kind: TransportKind,
    endpoint: String,
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    sticky: Mutex<HashMap<String, Reply>>,
    inbox: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            endpoint: format!("mock-{}", kind),
            queued: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            inbox: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer `command` with `value` from now on.
    pub fn reply(&self, command: &str, value: Value) -> &Self {
        self.sticky.lock().insert(command.to_string(), Ok(value));
        self
    }

    /// Fail `command` with `error` from now on.
    pub fn fail(&self, command: &str, error: TransportError) -> &Self {
        self.sticky.lock().insert(command.to_string(), Err(error));
        self
    }

    /// Queue a single reply for `command`, used before the sticky one.
    pub fn push_reply(&self, command: &str, reply: Reply) -> &Self {
        self.queued
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Queue a message for [`Transport::receive`].
    pub fn push_message(&self, message: Value) -> &Self {
        self.inbox.lock().push_back(message);
        self
    }

    /// Every `(command, payload)` sent so far.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls.lock().iter().filter(|(c, _)| c == command).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, command: &str, payload: &Value) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .push((command.to_string(), payload.clone()));

        if let Some(reply) = self
            .queued
            .lock()
            .get_mut(command)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.sticky
            .lock()
            .get(command)
            .cloned()
            .unwrap_or(Ok(Value::Null))
    }

    async fn receive(&self) -> Result<Option<Value>, TransportError> {
        if self.kind != TransportKind::PubSub {
            return Err(TransportError::Unsupported {
                kind: self.kind.as_str(),
                operation: "receive",
            });
        }
        Ok(self.inbox.lock().pop_front())
    }
}
