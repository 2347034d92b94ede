//! Bounded exponential backoff for transport calls.
//!
//! Every device call made by the orchestrator and the poller goes through
//! [`execute_with_retry`]. Retryable transport errors are absorbed here and
//! only surface as [`ServiceError::RetryExhausted`] once the policy gives up.
//! Each call owns a fresh [`RetryContext`], so concurrent operations against
//! different services never share backoff state.

use crate::config::RetrySettings;
use crate::error::{ServiceError, ServiceResult, TransportError};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Defines how an operation is retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay, before jitter.
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.base_delay,
            multiplier: settings.multiplier,
            max_delay: settings.max_delay,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Total attempts; at least one is always made.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before the first retry.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Backoff with `± jitter` applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Bookkeeping for one logical operation.
#[derive(Debug)]
pub struct RetryContext {
    /// Attempts made so far
    pub attempts: u32,
    /// When the first attempt began
    pub started: Instant,
    /// Last retryable error seen
    pub last_error: Option<TransportError>,
}

impl RetryContext {
    fn new() -> Self {
        Self {
            attempts: 0,
            started: Instant::now(),
            last_error: None,
        }
    }

    /// Time since the first attempt.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Runs `operation` until it succeeds, fails fatally, exhausts the policy, or
/// `cancel` fires.
///
/// * retryable transport errors: back off and retry
/// * any other error: returned immediately after a single attempt
/// * exhaustion: [`ServiceError::RetryExhausted`] wrapping the last error
/// * cancellation (during an attempt or a backoff): [`ServiceError::Cancelled`]
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut ctx = RetryContext::new();
    let max_attempts = policy.max_attempts.max(1);

    loop {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        ctx.attempts += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(ServiceError::Transport(err)) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        if ctx.attempts >= max_attempts {
            warn!(
                attempts = ctx.attempts,
                elapsed_ms = ctx.elapsed().as_millis() as u64,
                error = %err,
                "Retries exhausted"
            );
            return Err(ServiceError::RetryExhausted {
                attempts: ctx.attempts,
                last: err,
            });
        }

        let delay = policy.delay_for(ctx.attempts - 1);
        debug!(
            attempt = ctx.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable failure, backing off"
        );
        ctx.last_error = Some(err);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
