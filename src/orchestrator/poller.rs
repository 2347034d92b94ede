//! Concurrent completion polling.
//!
//! One task per running service checks [`Service::verify_finished`] right away
//! and then at the service's own cadence. Each task reports exactly one
//! [`PollEvent`] and exits; a task whose token is cancelled reports
//! [`PollOutcome::Cancelled`] and makes no further calls. A service that
//! reports finished is wrapped up with [`ServiceHandle::finalize`] before its
//! task reports [`PollOutcome::Finished`].
//!
//! [`Service::verify_finished`]: crate::service::Service::verify_finished

use crate::error::ServiceError;
use crate::registry::ServiceHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal result of polling one service.
#[derive(Debug)]
pub enum PollOutcome {
    /// Reported finished without a device error, data finalized and valid
    Finished,
    /// Check, device error or data validation failed
    Failed(ServiceError),
    /// Polling was stopped before a result
    Cancelled,
}

/// Result message of one polling task.
#[derive(Debug)]
pub struct PollEvent {
    /// Registered service name
    pub service: String,
    /// How polling ended
    pub outcome: PollOutcome,
    /// Completion checks issued, including the last one
    pub polls: u32,
}

/// Spawner for the polling tasks.
pub struct Poller;

impl Poller {
    /// Start polling every handle in `handles`.
    ///
    /// The tasks observe a child of `cancel`: cancelling the parent or calling
    /// [`PollerHandle::shutdown`] stops them all.
    pub fn spawn(
        handles: Vec<Arc<ServiceHandle>>,
        cancel: &CancellationToken,
    ) -> (PollerHandle, mpsc::Receiver<PollEvent>) {
        let token = cancel.child_token();
        let (tx, rx) = mpsc::channel(handles.len().max(1));
        let mut tasks = JoinSet::new();
        for handle in handles {
            tasks.spawn(poll_until_done(handle, tx.clone(), token.clone()));
        }
        (PollerHandle { token, tasks }, rx)
    }
}

/// Owner of the polling tasks. Dropping it aborts them.
pub struct PollerHandle {
    token: CancellationToken,
    tasks: JoinSet<()>,
}

impl PollerHandle {
    /// Cancel every task and wait until all of them have exited.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    warn!(error = %err, "Poll task panicked");
                }
            }
        }
    }
}

async fn poll_until_done(
    handle: Arc<ServiceHandle>,
    tx: mpsc::Sender<PollEvent>,
    token: CancellationToken,
) {
    let mut ticker = interval(handle.options().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls = 0u32;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break PollOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        polls += 1;
        match handle.poll(&token).await {
            Ok(false) => continue,
            Ok(true) => match handle.device_error() {
                Some(message) => break PollOutcome::Failed(ServiceError::Device(message)),
                None => match handle.finalize(&token).await {
                    Ok(()) => break PollOutcome::Finished,
                    Err(ServiceError::Cancelled) => break PollOutcome::Cancelled,
                    Err(err) => break PollOutcome::Failed(err),
                },
            },
            Err(ServiceError::Cancelled) => break PollOutcome::Cancelled,
            Err(err) => break PollOutcome::Failed(err),
        }
    };

    debug!(service = %handle.name(), polls, outcome = ?outcome, "Polling ended");
    let event = PollEvent {
        service: handle.name().to_string(),
        outcome,
        polls,
    };
    // The receiver is gone once the session has moved on.
    let _ = tx.send(event).await;
}
