//! Scripted services shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rig_services::config::ServiceConfig;
use rig_services::{
    Artifact, ArtifactData, RetryPolicy, Service, ServiceError, ServiceOptions, ServiceResult,
    TransportError, TransportKind,
};
use serde_json::json;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory device with call counters and scripted behaviour.
pub struct TestService {
    name: String,
    polls_until_finished: u32,
    initialize_error: Option<String>,
    test_error: Option<String>,
    finish_error: Option<String>,
    validate_error: Option<String>,
    start_refusals: AtomicU32,
    stop_delay: Duration,
    last_error: Mutex<Option<String>>,
    pub initialize_calls: AtomicU32,
    pub test_calls: AtomicU32,
    pub start_calls: AtomicU32,
    pub poll_calls: AtomicU32,
    pub stop_calls: AtomicU32,
    pub finalize_calls: AtomicU32,
    pub data_calls: AtomicU32,
}

impl TestService {
    /// Finishes on the `polls`-th completion check after start.
    pub fn finishing_after(name: &str, polls: u32) -> Self {
        Self {
            name: name.to_string(),
            polls_until_finished: polls.max(1),
            initialize_error: None,
            test_error: None,
            finish_error: None,
            validate_error: None,
            start_refusals: AtomicU32::new(0),
            stop_delay: Duration::ZERO,
            last_error: Mutex::new(None),
            initialize_calls: AtomicU32::new(0),
            test_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            finalize_calls: AtomicU32::new(0),
            data_calls: AtomicU32::new(0),
        }
    }

    pub fn never_finishing(name: &str) -> Self {
        Self::finishing_after(name, u32::MAX)
    }

    pub fn failing_initialize(mut self, message: &str) -> Self {
        self.initialize_error = Some(message.to_string());
        self
    }

    pub fn failing_test(mut self, message: &str) -> Self {
        self.test_error = Some(message.to_string());
        self
    }

    /// Reports finished, but with a device error.
    pub fn finishing_with_error(mut self, message: &str) -> Self {
        self.finish_error = Some(message.to_string());
        self
    }

    /// Reports finished, but its data fails validation.
    pub fn failing_validate(mut self, message: &str) -> Self {
        self.validate_error = Some(message.to_string());
        self
    }

    /// Refuse the connection on the first `count` start attempts.
    pub fn refusing_start(self, count: u32) -> Self {
        self.start_refusals.store(count, Ordering::SeqCst);
        self
    }

    pub fn slow_to_stop(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for TestService {
    fn transport_kind(&self) -> TransportKind {
        TransportKind::RequestReply
    }

    async fn initialize(&self, _config: &ServiceConfig) -> ServiceResult<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        match &self.initialize_error {
            Some(message) => Err(ServiceError::Device(message.clone())),
            None => Ok(()),
        }
    }

    async fn test(&self) -> ServiceResult<()> {
        self.test_calls.fetch_add(1, Ordering::SeqCst);
        match &self.test_error {
            Some(message) => Err(ServiceError::Device(message.clone())),
            None => Ok(()),
        }
    }

    async fn start(&self) -> ServiceResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.poll_calls.store(0, Ordering::SeqCst);
        let refused = self
            .start_refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionRefused {
                endpoint: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn verify_finished(&self) -> ServiceResult<bool> {
        let polls = self.poll_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let finished = polls >= self.polls_until_finished;
        if finished {
            *self.last_error.lock() = self.finish_error.clone();
        }
        Ok(finished)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    async fn finalize(&self) -> ServiceResult<()> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self) -> ServiceResult<()> {
        match &self.validate_error {
            Some(message) => Err(ServiceError::Device(message.clone())),
            None => Ok(()),
        }
    }

    async fn stop(&self) -> ServiceResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.stop_delay).await;
        Ok(())
    }

    async fn get_latest_data(&self) -> ServiceResult<Option<Artifact>> {
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Artifact::new(
            &self.name,
            ArtifactData::Json(json!({ "polls": self.poll_calls.load(Ordering::SeqCst) })),
        )))
    }
}

/// Quick polling, quick retries.
pub fn fast_options() -> ServiceOptions {
    ServiceOptions::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        )
}

/// Shared in-memory sink for formatted log output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
