//! Publish/subscribe transport over TCP.
//!
//! Publishing writes one JSON line `{"topic": .., "command": .., "payload": ..}`
//! on a publisher connection. Subscribing sends `{"subscribe": topic}` once on a
//! second connection; a background reader task then queues every message that
//! arrives, and [`Transport::receive`] drains that queue without blocking.

use super::{Transport, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const QUEUE_CAPACITY: usize = 256;

struct Subscription {
    messages: mpsc::Receiver<Value>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Pub/sub adapter bound to one broker endpoint and topic.
pub struct PubSubTransport {
    endpoint: String,
    topic: String,
    timeout: Duration,
    publisher: Mutex<Option<OwnedWriteHalf>>,
    subscription: Mutex<Option<Subscription>>,
}

impl PubSubTransport {
    /// Adapter for the broker at `endpoint` (`host:port`), bound to `topic`.
    pub fn new(endpoint: impl Into<String>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            topic: topic.into(),
            timeout,
            publisher: Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    /// Topic this adapter publishes and subscribes on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        timeout(self.timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| TransportError::from_io(&self.endpoint, &e))
    }

    async fn write_line(
        &self,
        writer: &mut OwnedWriteHalf,
        message: &Value,
    ) -> Result<(), TransportError> {
        let mut line = message.to_string();
        line.push('\n');
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        timeout(self.timeout, write)
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| TransportError::from_io(&self.endpoint, &e))
    }

    /// Open the subscriber connection if there is none, or if the previous one
    /// closed and every message it delivered has been received.
    async fn ensure_subscribed(&self) -> Result<(), TransportError> {
        {
            let mut guard = self.subscription.lock();
            let usable = guard
                .as_ref()
                .map(|sub| !sub.closed.load(Ordering::Acquire) || !sub.messages.is_empty());
            match usable {
                Some(true) => return Ok(()),
                Some(false) => *guard = None,
                None => {}
            }
        }

        let stream = self.connect().await?;
        let (read, mut write) = stream.into_split();
        self.write_line(&mut write, &json!({ "subscribe": self.topic }))
            .await?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_messages(
            BufReader::new(read),
            write,
            tx,
            closed.clone(),
            self.endpoint.clone(),
            self.topic.clone(),
        ));

        debug!(endpoint = %self.endpoint, topic = %self.topic, "Subscribed");
        *self.subscription.lock() = Some(Subscription {
            messages: rx,
            closed,
            reader,
        });
        Ok(())
    }
}

async fn read_messages(
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    // Held so the broker keeps the subscription open.
    _write: OwnedWriteHalf,
    tx: mpsc::Sender<Value>,
    closed: Arc<AtomicBool>,
    endpoint: String,
    topic: String,
) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    warn!(endpoint = %endpoint, line = %line, "Dropping malformed message");
                    continue;
                };
                let matches_topic = message
                    .get("topic")
                    .and_then(Value::as_str)
                    .map_or(true, |t| t == topic);
                if !matches_topic {
                    continue;
                }
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "Subscription read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
}

#[async_trait]
impl Transport for PubSubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Publish a command. Returns `null`; replies arrive through [`Self::receive`].
    async fn send(&self, command: &str, payload: &Value) -> Result<Value, TransportError> {
        // Subscribe before publishing so replies to this command are not missed.
        self.ensure_subscribed().await?;

        let message = json!({ "topic": self.topic, "command": command, "payload": payload });
        let writer = self.publisher.lock().take();
        let mut writer = match writer {
            Some(writer) => writer,
            None => {
                let (_read, write) = self.connect().await?.into_split();
                write
            }
        };

        self.write_line(&mut writer, &message).await?;
        *self.publisher.lock() = Some(writer);
        Ok(Value::Null)
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        self.ensure_subscribed().await
    }

    /// Next queued message. Messages delivered before the broker closed the
    /// subscription are still returned; once they are drained the close is
    /// reported as [`TransportError::ConnectionReset`] and the next call
    /// subscribes again.
    async fn receive(&self) -> Result<Option<Value>, TransportError> {
        if self.subscription.lock().is_none() {
            self.ensure_subscribed().await?;
        }

        let mut guard = self.subscription.lock();
        let Some(sub) = guard.as_mut() else {
            return Ok(None);
        };
        match sub.messages.try_recv() {
            Ok(message) => Ok(Some(message)),
            // The reader queues everything it read before raising `closed`.
            Err(mpsc::error::TryRecvError::Empty) if !sub.closed.load(Ordering::Acquire) => {
                Ok(None)
            }
            Err(_) => {
                *guard = None;
                debug!(endpoint = %self.endpoint, topic = %self.topic, "Subscription closed");
                Err(TransportError::ConnectionReset {
                    endpoint: self.endpoint.clone(),
                })
            }
        }
    }
}
