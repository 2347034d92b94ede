//! Every transition is broadcast to subscribers and logged on the lifecycle target.

mod common;

use common::{fast_options, LogBuffer, TestService};
use rig_services::{
    LifecycleState, ServiceRegistry, SessionMember, SessionOrchestrator, SessionPlan,
    SessionStatus, TransitionCause,
};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

#[tokio::test]
async fn test_session_emits_ordered_events() {
    let registry = ServiceRegistry::new();
    let mut events = registry.subscribe();
    let sync = TestService::finishing_after("sync", 2).into_arc();
    let video = TestService::finishing_after("video", 1)
        .failing_initialize("camera offline")
        .into_arc();
    let stim = TestService::finishing_after("stim", 1).into_arc();
    registry.register_with("sync", sync, fast_options()).unwrap();
    registry.register_with("video", video, fast_options()).unwrap();
    registry.register_with("stim", stim, fast_options()).unwrap();

    let plan = SessionPlan::new(Duration::from_secs(5))
        .member(SessionMember::new("sync"))
        .member(SessionMember::new("video"))
        .member(SessionMember::new("stim").depends_on("video"));
    let report = SessionOrchestrator::run(&registry, &plan).await;
    assert_eq!(report.status, SessionStatus::PartiallyFailed);

    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Empty) => break,
            Err(err) => panic!("unexpected receive error: {err}"),
        }
    }

    let transitions = |name: &str| -> Vec<(LifecycleState, LifecycleState, TransitionCause)> {
        seen.iter()
            .filter(|e| e.service == name)
            .map(|e| (e.from, e.to, e.cause))
            .collect()
    };

    assert_eq!(
        transitions("sync"),
        vec![
            (LifecycleState::Idle, LifecycleState::Ready, TransitionCause::Initialize),
            (LifecycleState::Ready, LifecycleState::Starting, TransitionCause::Start),
            (LifecycleState::Starting, LifecycleState::Running, TransitionCause::Start),
            (LifecycleState::Running, LifecycleState::Finished, TransitionCause::Poll),
        ]
    );
    assert_eq!(
        transitions("video"),
        vec![(LifecycleState::Idle, LifecycleState::Failed, TransitionCause::Initialize)]
    );
    assert_eq!(
        transitions("stim"),
        vec![(LifecycleState::Idle, LifecycleState::Skipped, TransitionCause::Dependency)]
    );

    let failure = seen.iter().find(|e| e.service == "video").unwrap();
    assert!(failure.error.as_ref().unwrap().message.contains("camera offline"));
    assert!(seen.iter().all(|e| e.from.can_transition_to(e.to)));
}

#[tokio::test]
async fn test_transitions_are_logged_on_lifecycle_target() {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("rig_services::lifecycle=info"))
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_target(true)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let registry = ServiceRegistry::new();
    let sync = TestService::finishing_after("sync", 1).into_arc();
    registry.register_with("sync", sync, fast_options()).unwrap();
    let plan = SessionPlan::new(Duration::from_secs(5)).member(SessionMember::new("sync"));
    let report = SessionOrchestrator::run(&registry, &plan).await;
    assert_eq!(report.status, SessionStatus::Completed);

    let logs = buffer.contents();
    assert!(logs.contains("rig_services::lifecycle"), "logs: {logs}");
    assert!(logs.contains("Lifecycle transition"));
    assert!(logs.contains("service=sync"));
    assert!(logs.contains("to=finished"));
    // Only the lifecycle target passes the filter.
    assert!(!logs.contains("Session starting"));
}
