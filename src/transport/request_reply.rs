//! Request/response transport over TCP.
//!
//! Each request is a single JSON line `{"command": .., "payload": ..}`; the
//! device answers with one JSON line (see [`super::decode_reply`]). Idle
//! connections are kept in a small pool and checked out per call, so no lock is
//! held while waiting on the network.

use super::{decode_reply, Transport, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

const MAX_IDLE_CONNECTIONS: usize = 4;

type Connection = BufStream<TcpStream>;

/// Request/response adapter bound to one `host:port` endpoint.
pub struct RequestReplyTransport {
    endpoint: String,
    timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl RequestReplyTransport {
    /// Create an adapter for `endpoint` (`host:port`) with a per-call timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Number of pooled idle connections.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    fn checkout(&self) -> Option<Connection> {
        self.idle.lock().pop()
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        trace!(endpoint = %self.endpoint, "Opening connection");
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| TransportError::from_io(&self.endpoint, &e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::from_io(&self.endpoint, &e))?;
        Ok(BufStream::new(stream))
    }

    async fn exchange(
        &self,
        mut conn: Connection,
        request: &str,
    ) -> Result<(Connection, String), TransportError> {
        let io_err = |e: std::io::Error| TransportError::from_io(&self.endpoint, &e);

        conn.write_all(request.as_bytes()).await.map_err(io_err)?;
        conn.flush().await.map_err(io_err)?;

        let mut reply = String::new();
        let read = conn.read_line(&mut reply).await.map_err(io_err)?;
        if read == 0 {
            return Err(TransportError::ConnectionReset {
                endpoint: self.endpoint.clone(),
            });
        }
        Ok((conn, reply))
    }
}

#[async_trait]
impl Transport for RequestReplyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RequestReply
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, command: &str, payload: &Value) -> Result<Value, TransportError> {
        let mut request = json!({ "command": command, "payload": payload }).to_string();
        request.push('\n');

        let call = async {
            let conn = match self.checkout() {
                Some(conn) => conn,
                None => self.connect().await?,
            };
            self.exchange(conn, &request).await
        };

        let (conn, reply) = timeout(self.timeout, call)
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: self.timeout,
            })??;

        self.checkin(conn);
        trace!(endpoint = %self.endpoint, command, reply = reply.trim(), "Reply received");
        decode_reply(&self.endpoint, &reply)
    }
}
