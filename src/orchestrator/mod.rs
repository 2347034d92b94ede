//! Session orchestration.
//!
//! [`SessionOrchestrator::run`] takes a group of registered services through one
//! session:
//!
//! 1. resolve every member and the dependency graph (fatal errors abort here,
//!    before any device call)
//! 2. initialize, layer by layer in dependency order
//! 3. start the members whose dependencies are running and confirm each one
//!    took up the start
//! 4. poll until every running member finished, the session deadline passes or
//!    the caller cancels; a member only counts as finished once its data was
//!    finalized and validated
//! 5. force-stop whatever is still active, each stop bounded by the grace period
//! 6. collect data from finished members and build the [`SessionReport`]
//!
//! Members without a dependency link never affect each other: a failure only
//! propagates to dependents, which are skipped.

pub mod dependency;
pub mod poller;

pub use dependency::DependencyGraph;
pub use poller::{PollEvent, PollOutcome, Poller, PollerHandle};

use crate::config::RigConfig;
use crate::error::{ServiceError, ServiceFault, ServiceResult};
use crate::registry::{ServiceHandle, ServiceRegistry};
use crate::service::{Artifact, LifecycleState, TransitionCause};
use crate::session::{ServiceOutcome, ServiceReport, SessionReport, SessionStatus};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a failed optional member affects the session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalFailurePolicy {
    /// Report the session as partially failed
    #[default]
    PartiallyFailed,
    /// Escalate to an aborted session
    Abort,
}

/// One service taking part in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMember {
    /// Registered service name
    pub name: String,
    /// Members that must be running before this one starts
    pub depends_on: Vec<String>,
    /// A failed required member fails the session
    pub required: bool,
}

impl SessionMember {
    /// Required member without dependencies.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            required: true,
        }
    }

    /// Start only once `dependency` is running.
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    /// Let the session complete partially without this member.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Members and limits of one session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    members: Vec<SessionMember>,
    timeout: Duration,
    grace_period: Duration,
    optional_failure: OptionalFailurePolicy,
}

impl SessionPlan {
    /// Empty plan with a session deadline of `timeout` and a 10 s grace period.
    pub fn new(timeout: Duration) -> Self {
        Self {
            members: Vec::new(),
            timeout,
            grace_period: Duration::from_secs(10),
            optional_failure: OptionalFailurePolicy::default(),
        }
    }

    /// Every enabled service of `config`, with the `[session]` limits.
    pub fn from_config(config: &RigConfig) -> Self {
        let mut plan = Self::new(config.session.timeout)
            .with_grace_period(config.session.grace_period)
            .with_optional_failure_policy(config.session.optional_failure);
        for definition in config.enabled_services() {
            let mut member = SessionMember::new(definition.name.clone());
            member.depends_on = definition.depends_on.clone();
            member.required = definition.required;
            plan = plan.member(member);
        }
        plan
    }

    /// Add a member; plan order is report order.
    pub fn member(mut self, member: SessionMember) -> Self {
        self.members.push(member);
        self
    }

    /// Upper bound for each forced stop.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// How a failed optional member affects the session status.
    pub fn with_optional_failure_policy(mut self, policy: OptionalFailurePolicy) -> Self {
        self.optional_failure = policy;
        self
    }

    /// Members in plan order.
    pub fn members(&self) -> &[SessionMember] {
        &self.members
    }

    /// Session deadline, counted from the start of the run.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bound for each forced stop.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Policy for failed optional members.
    pub fn optional_failure(&self) -> OptionalFailurePolicy {
        self.optional_failure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Timeout,
    Cancel,
}

struct MemberRecord {
    handle: Arc<ServiceHandle>,
    required: bool,
    depends_on: Vec<String>,
    outcome: Option<ServiceOutcome>,
    error: Option<ServiceFault>,
    artifact: Option<Artifact>,
}

impl MemberRecord {
    fn settle(&mut self, outcome: ServiceOutcome, error: Option<ServiceFault>) {
        self.outcome = Some(outcome);
        if error.is_some() {
            self.error = error;
        }
    }
}

/// Runs sessions against a [`ServiceRegistry`].
pub struct SessionOrchestrator;

impl SessionOrchestrator {
    /// Run `plan` to completion. Always returns a complete report.
    pub async fn run(registry: &ServiceRegistry, plan: &SessionPlan) -> SessionReport {
        Self::run_with_cancel(registry, plan, CancellationToken::new()).await
    }

    /// Like [`Self::run`]; cancelling `cancel` stops the session early and
    /// reports it as aborted.
    pub async fn run_with_cancel(
        registry: &ServiceRegistry,
        plan: &SessionPlan,
        cancel: CancellationToken,
    ) -> SessionReport {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = Instant::now() + plan.timeout;
        info!(session = %id, members = plan.members.len(), timeout = ?plan.timeout, "Session starting");

        let (records, layers) = match resolve(registry, plan) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!(session = %id, error = %err, "Session aborted before start");
                return aborted_report(id, started_at, registry, plan, err.fault());
            }
        };

        let mut run = SessionRun {
            id,
            plan,
            records,
            layers,
            cancel: cancel.clone(),
        };

        let mut interrupt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Interrupt::Cancel),
            _ = sleep_until(deadline) => Some(Interrupt::Timeout),
            _ = run.bring_up() => None,
        };
        if interrupt.is_none() {
            interrupt = run.monitor(deadline).await;
        }
        if let Some(interrupt) = interrupt {
            run.interrupt(interrupt).await;
        }
        run.collect_artifacts().await;

        let report = run.finish(started_at, interrupt);
        info!(
            session = %id,
            status = %report.status,
            duration_ms = report.duration().num_milliseconds(),
            unfinished = ?report.unfinished(),
            "Session ended"
        );
        report
    }

    /// Run every named service's preflight check concurrently.
    pub async fn preflight(
        registry: &ServiceRegistry,
        names: &[&str],
    ) -> Vec<(String, ServiceResult<()>)> {
        let cancel = CancellationToken::new();
        join_all(names.iter().map(|name| {
            let cancel = cancel.clone();
            let handle = registry.get(name);
            async move {
                let result = match handle {
                    Ok(handle) => handle.test(&cancel).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = &result {
                    warn!(service = %name, error = %err, "Preflight check failed");
                }
                (name.to_string(), result)
            }
        }))
        .await
    }
}

/// Look up every member and order them. Nothing is touched unless all checks pass.
fn resolve(
    registry: &ServiceRegistry,
    plan: &SessionPlan,
) -> ServiceResult<(HashMap<String, MemberRecord>, Vec<Vec<String>>)> {
    let mut records = HashMap::new();
    let mut graph = DependencyGraph::new();

    for member in &plan.members {
        let handle = registry.get(&member.name)?;
        let state = handle.state();
        if state.is_active() {
            return Err(ServiceError::InvalidTransition {
                service: member.name.clone(),
                from: state,
                to: LifecycleState::Ready,
            });
        }
        graph.add_node(&member.name);
        let record = MemberRecord {
            handle,
            required: member.required,
            depends_on: member.depends_on.clone(),
            outcome: None,
            error: None,
            artifact: None,
        };
        if records.insert(member.name.clone(), record).is_some() {
            return Err(ServiceError::DuplicateName(member.name.clone()));
        }
    }

    let names: HashSet<&str> = plan.members.iter().map(|m| m.name.as_str()).collect();
    for member in &plan.members {
        for dependency in &member.depends_on {
            if !names.contains(dependency.as_str()) {
                return Err(ServiceError::Config(format!(
                    "'{}' depends on '{}', which is not part of the session",
                    member.name, dependency
                )));
            }
            graph.add_edge(&member.name, dependency);
        }
    }
    let layers = graph.layers()?;

    for record in records.values() {
        if record.handle.state().is_terminal() {
            record.handle.reset();
        }
    }
    Ok((records, layers))
}

fn aborted_report(
    id: Uuid,
    started_at: chrono::DateTime<Utc>,
    registry: &ServiceRegistry,
    plan: &SessionPlan,
    reason: ServiceFault,
) -> SessionReport {
    let services = plan
        .members
        .iter()
        .map(|member| ServiceReport {
            name: member.name.clone(),
            outcome: ServiceOutcome::NotStarted,
            state: registry
                .get(&member.name)
                .map(|h| h.state())
                .unwrap_or(LifecycleState::Idle),
            required: member.required,
            error: None,
            artifact: None,
        })
        .collect();
    SessionReport {
        id,
        status: SessionStatus::Aborted,
        started_at,
        finished_at: Utc::now(),
        services,
        abort_reason: Some(reason),
    }
}

struct SessionRun<'a> {
    id: Uuid,
    plan: &'a SessionPlan,
    records: HashMap<String, MemberRecord>,
    layers: Vec<Vec<String>>,
    cancel: CancellationToken,
}

impl SessionRun<'_> {
    /// First dependency of `name` that is not in `wanted` state.
    fn blocking_dependency(&self, name: &str, wanted: LifecycleState) -> Option<String> {
        let record = &self.records[name];
        record
            .depends_on
            .iter()
            .find(|dep| self.records[dep.as_str()].handle.state() != wanted)
            .cloned()
    }

    fn skip(&mut self, name: &str, dependency: String) {
        let record = match self.records.get_mut(name) {
            Some(record) => record,
            None => return,
        };
        let fault = ServiceError::DependencyFailed {
            service: name.to_string(),
            dependency: dependency.clone(),
        }
        .fault();
        if let Err(err) = record.handle.transition(
            LifecycleState::Skipped,
            TransitionCause::Dependency,
            Some(fault.clone()),
        ) {
            warn!(service = %name, error = %err, "Could not mark service skipped");
        }
        record.settle(ServiceOutcome::SkippedDueToDependency { dependency }, Some(fault));
    }

    /// Initialize then start every member, layer by layer.
    async fn bring_up(&mut self) {
        let layers = self.layers.clone();

        for layer in &layers {
            let mut ready = Vec::new();
            for name in layer {
                match self.blocking_dependency(name, LifecycleState::Ready) {
                    Some(dependency) => self.skip(name, dependency),
                    None => ready.push(name.clone()),
                }
            }

            let results = join_all(ready.iter().map(|name| {
                let handle = self.records[name].handle.clone();
                let cancel = self.cancel.clone();
                async move {
                    let config = handle.options().config.clone();
                    handle.initialize(&config, &cancel).await
                }
            }))
            .await;

            for (name, result) in ready.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(ServiceError::Cancelled) => return,
                    Err(err) => {
                        warn!(session = %self.id, service = %name, error = %err, "Initialize failed");
                        if let Some(record) = self.records.get_mut(name) {
                            record.settle(ServiceOutcome::Failed, Some(err.fault()));
                        }
                    }
                }
            }
        }

        for layer in &layers {
            let mut startable = Vec::new();
            for name in layer {
                if self.records[name].outcome.is_some() {
                    continue;
                }
                match self.blocking_dependency(name, LifecycleState::Running) {
                    Some(dependency) => self.skip(name, dependency),
                    None => startable.push(name.clone()),
                }
            }

            let results = join_all(startable.iter().map(|name| {
                let handle = self.records[name].handle.clone();
                let cancel = self.cancel.clone();
                async move { handle.start(&cancel).await }
            }))
            .await;

            for (name, result) in startable.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(ServiceError::Cancelled) => return,
                    Err(err) => {
                        warn!(session = %self.id, service = %name, error = %err, "Start failed");
                        if let Some(record) = self.records.get_mut(name) {
                            record.settle(ServiceOutcome::Failed, Some(err.fault()));
                        }
                    }
                }
            }
        }
    }

    /// Poll running members until they are all terminal or the session is interrupted.
    async fn monitor(&mut self, deadline: Instant) -> Option<Interrupt> {
        let running: Vec<Arc<ServiceHandle>> = self
            .records
            .values()
            .filter(|r| r.outcome.is_none() && r.handle.state() == LifecycleState::Running)
            .map(|r| r.handle.clone())
            .collect();
        if running.is_empty() {
            return None;
        }

        let mut pending: HashSet<String> =
            running.iter().map(|h| h.name().to_string()).collect();
        let (poller, mut events) = Poller::spawn(running, &self.cancel);

        let mut interrupt = None;
        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    interrupt = Some(Interrupt::Cancel);
                    break;
                }
                _ = sleep_until(deadline) => {
                    interrupt = Some(Interrupt::Timeout);
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                }
            }
            pending.retain(|name| self.records[name].outcome.is_none());
        }

        poller.shutdown().await;
        // Results that landed while the loop was leaving still count.
        self.drain(&mut events);
        interrupt
    }

    /// Apply every poll result already queued on `events`.
    fn drain(&mut self, events: &mut mpsc::Receiver<PollEvent>) {
        while let Ok(event) = events.try_recv() {
            self.apply(event);
        }
    }

    /// Record one poll result. A cancelled poll settles nothing.
    fn apply(&mut self, event: PollEvent) {
        let Some(record) = self.records.get_mut(&event.service) else {
            return;
        };
        let (state, outcome, fault) = match event.outcome {
            PollOutcome::Finished => (LifecycleState::Finished, ServiceOutcome::Finished, None),
            PollOutcome::Failed(err) => (
                LifecycleState::Failed,
                ServiceOutcome::Failed,
                Some(err.fault()),
            ),
            PollOutcome::Cancelled => return,
        };
        debug!(session = %self.id, service = %event.service, polls = event.polls, ?outcome, "Poll result");
        if let Err(err) = record
            .handle
            .transition(state, TransitionCause::Poll, fault.clone())
        {
            warn!(service = %event.service, error = %err, "Could not record poll result");
        }
        record.settle(outcome, fault);
    }

    /// Force every unsettled member to a terminal state.
    async fn interrupt(&mut self, interrupt: Interrupt) {
        let grace = self.plan.grace_period;
        let unsettled: Vec<Arc<ServiceHandle>> = self
            .records
            .values()
            .filter(|r| r.outcome.is_none() && !r.handle.state().is_terminal())
            .map(|r| r.handle.clone())
            .collect();
        warn!(
            session = %self.id,
            reason = ?interrupt,
            remaining = unsettled.len(),
            "Session interrupted, stopping remaining services"
        );

        // The session token may already be cancelled; stops get their own.
        let stop_token = CancellationToken::new();
        join_all(
            unsettled
                .iter()
                .filter(|h| h.state().is_active())
                .map(|handle| {
                    let stop_token = stop_token.clone();
                    async move {
                        match timeout(grace, handle.stop_device(&stop_token)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                warn!(service = %handle.name(), error = %err, "Forced stop failed")
                            }
                            Err(_) => {
                                warn!(service = %handle.name(), grace = ?grace, "Forced stop timed out")
                            }
                        }
                    }
                }),
        )
        .await;
        stop_token.cancel();

        let (state, cause, outcome, fault) = match interrupt {
            Interrupt::Timeout => (
                LifecycleState::Failed,
                TransitionCause::Timeout,
                ServiceOutcome::Failed,
                Some(ServiceError::SessionTimeout(self.plan.timeout).fault()),
            ),
            Interrupt::Cancel => (
                LifecycleState::Cancelled,
                TransitionCause::Cancel,
                ServiceOutcome::Cancelled,
                None,
            ),
        };
        for handle in unsettled {
            if let Err(err) = handle.transition(state, cause, fault.clone()) {
                debug!(service = %handle.name(), error = %err, "Already settled");
            }
            if let Some(record) = self.records.get_mut(handle.name()) {
                record.settle(outcome.clone(), fault.clone());
            }
        }
    }

    /// Fetch the latest data of every finished member.
    async fn collect_artifacts(&mut self) {
        let finished: Vec<Arc<ServiceHandle>> = self
            .records
            .values()
            .filter(|r| r.handle.state() == LifecycleState::Finished)
            .map(|r| r.handle.clone())
            .collect();
        let cancel = CancellationToken::new();

        let results = join_all(finished.iter().map(|handle| {
            let cancel = cancel.clone();
            async move { handle.latest_data(&cancel).await }
        }))
        .await;

        for (handle, result) in finished.iter().zip(results) {
            match result {
                Ok(artifact) => {
                    if let Some(record) = self.records.get_mut(handle.name()) {
                        record.artifact = artifact;
                    }
                }
                Err(err) => {
                    warn!(service = %handle.name(), error = %err, "Could not collect data")
                }
            }
        }
    }

    fn finish(
        mut self,
        started_at: chrono::DateTime<Utc>,
        interrupt: Option<Interrupt>,
    ) -> SessionReport {
        let mut services = Vec::with_capacity(self.plan.members.len());
        for member in &self.plan.members {
            let Some(record) = self.records.remove(&member.name) else {
                continue;
            };
            let status = record.handle.status();
            let outcome = record.outcome.unwrap_or(match status.state {
                LifecycleState::Finished => ServiceOutcome::Finished,
                LifecycleState::Cancelled => ServiceOutcome::Cancelled,
                LifecycleState::Idle => ServiceOutcome::NotStarted,
                _ => ServiceOutcome::Failed,
            });
            services.push(ServiceReport {
                name: member.name.clone(),
                outcome,
                state: status.state,
                required: record.required,
                error: record.error.or(status.last_error),
                artifact: record.artifact,
            });
        }

        let optional_failure = services
            .iter()
            .find(|s| !s.required && !s.outcome.is_success());
        let (status, abort_reason) = if interrupt == Some(Interrupt::Cancel) {
            (SessionStatus::Aborted, Some(ServiceError::Cancelled.fault()))
        } else if services.iter().all(|s| s.outcome.is_success()) {
            (SessionStatus::Completed, None)
        } else if let (OptionalFailurePolicy::Abort, Some(failed)) =
            (self.plan.optional_failure, optional_failure)
        {
            let reason = failed.error.clone().unwrap_or_else(|| ServiceFault {
                kind: crate::error::ErrorKind::Device,
                message: format!("optional service '{}' did not finish", failed.name),
            });
            (SessionStatus::Aborted, Some(reason))
        } else {
            (SessionStatus::PartiallyFailed, None)
        };

        SessionReport {
            id: self.id,
            status,
            started_at,
            finished_at: Utc::now(),
            services,
            abort_reason,
        }
    }
}
