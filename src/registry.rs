//! Service registry and lifecycle handles.
//!
//! The registry owns one [`ServiceHandle`] per live service. A handle pairs the
//! [`Service`] implementation with its lifecycle status and is the only place
//! state transitions happen: every transition is validated against the state
//! machine, recorded under the handle's lock, emitted as a `tracing` event on
//! [`crate::logging::LIFECYCLE_TARGET`] and broadcast to
//! [`ServiceRegistry::subscribe`]rs.
//!
//! Locks are only held for synchronous bookkeeping, never across an `.await`.

use crate::config::{RigConfig, ServiceConfig, ServiceDefinition};
use crate::error::{ServiceError, ServiceFault, ServiceResult};
use crate::logging::LIFECYCLE_TARGET;
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::service::{
    Artifact, DeviceService, LifecycleEvent, LifecycleState, Service, ServiceStatus,
    TransitionCause,
};
use crate::transport::TransportKind;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Per-service call policy.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Retry policy wrapped around every device call
    pub retry: RetryPolicy,
    /// Completion polling cadence while running
    pub poll_interval: Duration,
    /// Configuration handed to [`Service::initialize`]
    pub config: ServiceConfig,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        let config = ServiceConfig::default();
        Self {
            retry: RetryPolicy::default(),
            poll_interval: config.poll_interval,
            config,
        }
    }
}

impl ServiceOptions {
    /// Options for a configured service; a per-service retry override wins.
    pub fn from_definition(definition: &ServiceDefinition, defaults: &RetryPolicy) -> Self {
        Self {
            retry: definition
                .retry
                .as_ref()
                .map(RetryPolicy::from)
                .unwrap_or_else(|| defaults.clone()),
            poll_interval: definition.connection.poll_interval,
            config: definition.connection.clone(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the completion polling cadence.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// A registered service together with its lifecycle status.
pub struct ServiceHandle {
    name: String,
    service: Arc<dyn Service>,
    options: ServiceOptions,
    status: Mutex<ServiceStatus>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("kind", &self.service.transport_kind())
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl ServiceHandle {
    fn new(
        name: String,
        service: Arc<dyn Service>,
        options: ServiceOptions,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            name,
            service,
            options,
            status: Mutex::new(ServiceStatus::new()),
            events,
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport kind of the wrapped service.
    pub fn kind(&self) -> TransportKind {
        self.service.transport_kind()
    }

    /// Call policy the handle applies.
    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// The wrapped service.
    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> ServiceStatus {
        self.status.lock().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.status.lock().state
    }

    /// Move to `to`, recording `error` as the last error when given.
    ///
    /// Fails with [`ServiceError::InvalidTransition`] if the state machine does
    /// not allow the move; the status is then left untouched.
    pub fn transition(
        &self,
        to: LifecycleState,
        cause: TransitionCause,
        error: Option<ServiceFault>,
    ) -> ServiceResult<LifecycleEvent> {
        let event = {
            let mut status = self.status.lock();
            let from = status.state;
            if !from.can_transition_to(to) {
                return Err(ServiceError::InvalidTransition {
                    service: self.name.clone(),
                    from,
                    to,
                });
            }
            let now = Utc::now();
            status.state = to;
            status.updated_at = now;
            if error.is_some() {
                status.last_error = error.clone();
            }
            LifecycleEvent {
                service: self.name.clone(),
                from,
                to,
                cause,
                at: now,
                error,
            }
        };
        self.publish(&event);
        Ok(event)
    }

    /// Return to `Idle` from any state, clearing the last error.
    pub fn reset(&self) -> LifecycleEvent {
        let event = {
            let mut status = self.status.lock();
            let from = status.state;
            let now = Utc::now();
            *status = ServiceStatus {
                state: LifecycleState::Idle,
                last_error: None,
                last_verified: status.last_verified,
                updated_at: now,
            };
            LifecycleEvent {
                service: self.name.clone(),
                from,
                to: LifecycleState::Idle,
                cause: TransitionCause::Reset,
                at: now,
                error: None,
            }
        };
        self.publish(&event);
        event
    }

    fn publish(&self, event: &LifecycleEvent) {
        match &event.error {
            Some(error) => warn!(
                target: LIFECYCLE_TARGET,
                service = %event.service,
                from = %event.from,
                to = %event.to,
                cause = ?event.cause,
                error = %error,
                "Lifecycle transition"
            ),
            None => info!(
                target: LIFECYCLE_TARGET,
                service = %event.service,
                from = %event.from,
                to = %event.to,
                cause = ?event.cause,
                "Lifecycle transition"
            ),
        }
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
    }

    /// Record a failure reached through `cause`, if the state machine still allows it.
    fn fail(&self, cause: TransitionCause, err: &ServiceError) {
        if let Err(invalid) = self.transition(LifecycleState::Failed, cause, Some(err.fault())) {
            debug!(service = %self.name, error = %invalid, "Failure not recorded");
        }
    }

    /// `Idle -> Ready`. Re-initializing a `Ready` service repeats the device
    /// setup without a transition.
    pub async fn initialize(
        &self,
        config: &ServiceConfig,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let from = self.state();
        if !matches!(from, LifecycleState::Idle | LifecycleState::Ready) {
            return Err(ServiceError::InvalidTransition {
                service: self.name.clone(),
                from,
                to: LifecycleState::Ready,
            });
        }

        let service = &self.service;
        match execute_with_retry(&self.options.retry, cancel, || service.initialize(config)).await
        {
            Ok(()) => {
                if from == LifecycleState::Idle {
                    self.transition(LifecycleState::Ready, TransitionCause::Initialize, None)?;
                }
                Ok(())
            }
            Err(ServiceError::Cancelled) => Err(ServiceError::Cancelled),
            Err(err) => {
                self.fail(TransitionCause::Initialize, &err);
                Err(err)
            }
        }
    }

    /// `Ready -> Starting -> Running`, or `Failed` if the device refuses.
    ///
    /// The device must also pass [`Service::verify`] before the service counts
    /// as running; a device that started but fails verification is told to stop.
    pub async fn start(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        self.transition(LifecycleState::Starting, TransitionCause::Start, None)?;

        let service = &self.service;
        let started = execute_with_retry(&self.options.retry, cancel, || service.start()).await;
        let result = match started {
            Ok(()) => {
                let verified =
                    execute_with_retry(&self.options.retry, cancel, || service.verify()).await;
                if let Err(err) = &verified {
                    if !matches!(err, ServiceError::Cancelled) {
                        warn!(service = %self.name, error = %err, "Verification failed, stopping device");
                        if let Err(stop_err) = self.stop_device(cancel).await {
                            debug!(service = %self.name, error = %stop_err, "Stop after failed verification failed");
                        }
                    }
                }
                verified
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.transition(LifecycleState::Running, TransitionCause::Start, None)?;
                Ok(())
            }
            Err(ServiceError::Cancelled) => Err(ServiceError::Cancelled),
            Err(err) => {
                self.fail(TransitionCause::Start, &err);
                Err(err)
            }
        }
    }

    /// One completion check. Updates `last_verified`; never transitions.
    pub async fn poll(&self, cancel: &CancellationToken) -> ServiceResult<bool> {
        let service = &self.service;
        let finished =
            execute_with_retry(&self.options.retry, cancel, || service.verify_finished()).await?;
        self.status.lock().last_verified = Some(Utc::now());
        Ok(finished)
    }

    /// Stop the device. A running service becomes `Finished` on a clean stop
    /// and `Failed` otherwise; in any other state only the device is told to stop.
    pub async fn stop(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        let was_running = self.state() == LifecycleState::Running;
        let result = self.stop_device(cancel).await;
        if !was_running {
            return result;
        }
        match result {
            Ok(()) => {
                self.transition(LifecycleState::Finished, TransitionCause::Stop, None)?;
                Ok(())
            }
            Err(ServiceError::Cancelled) => Err(ServiceError::Cancelled),
            Err(err) => {
                self.fail(TransitionCause::Stop, &err);
                Err(err)
            }
        }
    }

    /// Send the stop command without touching the lifecycle state.
    pub async fn stop_device(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        let service = &self.service;
        execute_with_retry(&self.options.retry, cancel, || service.stop()).await
    }

    /// Preflight check.
    pub async fn test(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        let service = &self.service;
        execute_with_retry(&self.options.retry, cancel, || service.test()).await
    }

    /// Wrap up a device that reported finished: [`Service::finalize`], then
    /// [`Service::validate`]. Never transitions; the caller decides the outcome.
    pub async fn finalize(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        let service = &self.service;
        execute_with_retry(&self.options.retry, cancel, || service.finalize()).await?;
        execute_with_retry(&self.options.retry, cancel, || service.validate()).await
    }

    /// Latest data of the device, see [`Service::get_latest_data`].
    pub async fn latest_data(&self, cancel: &CancellationToken) -> ServiceResult<Option<Artifact>> {
        let service = &self.service;
        execute_with_retry(&self.options.retry, cancel, || service.get_latest_data()).await
    }

    /// Failure detail currently reported by the device.
    pub fn device_error(&self) -> Option<String> {
        self.service.last_error()
    }
}

/// Process-wide collection of live services, keyed by unique name.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceHandle>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register every enabled service of `config` as a [`DeviceService`].
    pub fn from_config(config: &RigConfig) -> ServiceResult<Self> {
        let registry = Self::new();
        let defaults = RetryPolicy::from(&config.retry);
        for definition in config.enabled_services() {
            let service = DeviceService::from_definition(definition)?;
            let options = ServiceOptions::from_definition(definition, &defaults);
            registry.register_with(definition.name.clone(), Arc::new(service), options)?;
        }
        info!(count = registry.len(), "Registry built from configuration");
        Ok(registry)
    }

    /// Register `service` under `name` with default options.
    pub fn register(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> ServiceResult<Arc<ServiceHandle>> {
        self.register_with(name, service, ServiceOptions::default())
    }

    /// Register `service` under `name`. Fails with [`ServiceError::DuplicateName`]
    /// if the name is taken; the existing registration is kept.
    pub fn register_with(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
        options: ServiceOptions,
    ) -> ServiceResult<Arc<ServiceHandle>> {
        let name = name.into();
        let mut services = self.services.write();
        if services.contains_key(&name) {
            return Err(ServiceError::DuplicateName(name));
        }
        let handle = Arc::new(ServiceHandle::new(
            name.clone(),
            service,
            options,
            self.events.clone(),
        ));
        services.insert(name.clone(), handle.clone());
        debug!(service = %name, kind = %handle.kind(), "Registered");
        Ok(handle)
    }

    /// Handle of `name`, or [`ServiceError::NotFound`].
    pub fn get(&self, name: &str) -> ServiceResult<Arc<ServiceHandle>> {
        self.services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Remove `name`. Removing an unknown name is a no-op.
    pub fn deregister(&self, name: &str) -> Option<Arc<ServiceHandle>> {
        let removed = self.services.write().remove(name);
        if removed.is_some() {
            debug!(service = %name, "Deregistered");
        }
        removed
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Status snapshot of every service.
    pub fn statuses(&self) -> BTreeMap<String, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.status()))
            .collect()
    }

    /// Lifecycle events of every registered service.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}
