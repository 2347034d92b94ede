//! Generic device service driven by configuration.
//!
//! One [`DeviceService`] speaks the command protocol of its [`DeviceLink`]:
//!
//! | Link | ready check | finished check |
//! |---|---|---|
//! | request/reply | state command answers `READY` | `BUSY` -> running, `READY` after a start -> finished, `ERROR` -> failed |
//! | pub/sub | subscription can be opened | `{"status": "finished"}` or `{"status": "error", "message": ..}` |
//! | remote shell | check command exits 0 | status command: 0 -> finished, 1 -> running, other -> failed |
//!
//! A request/reply device counts as finished only once it went `BUSY` after the
//! latest start and is `READY` again.
//!
//! With a `data_dir` configured, [`Service::get_latest_data`] returns the files
//! written there since the latest start, [`Service::validate`] requires at least
//! one non-empty file, and the optional `gb_per_hour` and `growth_window`
//! settings add a free-space check on initialize and a growth check on verify.

use super::{Artifact, ArtifactData, Service};
use crate::config::{ServiceConfig, ServiceDefinition};
use crate::error::{ServiceError, ServiceResult, TransportError};
use crate::transport::{
    PubSubTransport, RemoteShellTransport, RequestReplyTransport, ShellOutput, Transport,
    TransportKind,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const READY: &str = "READY";
const BUSY: &str = "BUSY";
const ERROR: &str = "ERROR";

/// Transport bound to a device, tagged with the protocol spoken over it.
#[derive(Clone)]
pub enum DeviceLink {
    /// State/start/stop commands with one reply each
    RequestReply(Arc<dyn Transport>),
    /// Commands published on a topic, status read from the subscription
    PubSub(Arc<dyn Transport>),
    /// Shell command lines judged by exit code
    RemoteShell(Arc<dyn Transport>),
}

impl DeviceLink {
    /// Tag `transport` with the protocol matching its kind.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        match transport.kind() {
            TransportKind::RequestReply => DeviceLink::RequestReply(transport),
            TransportKind::PubSub => DeviceLink::PubSub(transport),
            TransportKind::RemoteShell => DeviceLink::RemoteShell(transport),
        }
    }

    /// Build the adapter described by a service definition.
    pub fn from_definition(definition: &ServiceDefinition) -> ServiceResult<Self> {
        let connection = &definition.connection;
        let require_address = || {
            connection.address().ok_or_else(|| {
                ServiceError::Config(format!(
                    "service '{}' needs host and port for {} transport",
                    definition.name, definition.transport
                ))
            })
        };

        let link = match definition.transport {
            TransportKind::RequestReply => DeviceLink::RequestReply(Arc::new(
                RequestReplyTransport::new(require_address()?, connection.timeout),
            )),
            TransportKind::PubSub => {
                let topic = connection
                    .topic
                    .clone()
                    .unwrap_or_else(|| definition.name.clone());
                DeviceLink::PubSub(Arc::new(PubSubTransport::new(
                    require_address()?,
                    topic,
                    connection.timeout,
                )))
            }
            TransportKind::RemoteShell => {
                let shell = match &connection.host {
                    Some(host) => RemoteShellTransport::ssh(
                        host.clone(),
                        connection.user.as_deref(),
                        connection.timeout,
                    ),
                    None => RemoteShellTransport::local(connection.timeout),
                };
                DeviceLink::RemoteShell(Arc::new(shell))
            }
        };
        Ok(link)
    }

    /// Transport kind of the underlying adapter.
    pub fn kind(&self) -> TransportKind {
        self.transport().kind()
    }

    /// The underlying adapter.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        match self {
            DeviceLink::RequestReply(t) | DeviceLink::PubSub(t) | DeviceLink::RemoteShell(t) => t,
        }
    }
}

/// Device state as reported by the request/reply state command.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceState {
    marker: String,
    message: String,
}

impl DeviceState {
    /// Accepts `["READY", "msg"]`, `"READY"` or `{"state": .., "message": ..}`.
    fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::String(marker) => Some(Self {
                marker: marker.trim().to_uppercase(),
                message: String::new(),
            }),
            Value::Array(items) => {
                let marker = items.first()?.as_str()?.trim().to_uppercase();
                let message = items
                    .iter()
                    .skip(1)
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(Self { marker, message })
            }
            Value::Object(obj) => {
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let marker = match obj.get("state").and_then(Value::as_str) {
                    Some(state) => state.trim().to_uppercase(),
                    // Older devices put the marker in `message`.
                    None => message.trim().to_uppercase(),
                };
                Some(Self { marker, message })
            }
            _ => None,
        }
    }
}

/// A file found in the data directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DataFile {
    modified: SystemTime,
    path: PathBuf,
    len: u64,
}

/// Whole-second floor of `time`. File timestamps come from a coarser clock than
/// [`SystemTime::now`], so a file written just after `time` can carry an
/// earlier modification time.
fn floor_to_second(time: SystemTime) -> SystemTime {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => SystemTime::UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()),
        Err(_) => time,
    }
}

/// Configurable device implementation over any [`DeviceLink`].
pub struct DeviceService {
    name: String,
    link: DeviceLink,
    config: RwLock<ServiceConfig>,
    started_at: Mutex<Option<SystemTime>>,
    /// Set once the device reported `BUSY` after the latest start
    seen_busy: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_message: Mutex<Option<Value>>,
}

impl DeviceService {
    /// Service named `name` talking over `link`, with `config` until the next initialize.
    pub fn new(name: impl Into<String>, link: DeviceLink, config: ServiceConfig) -> Self {
        Self {
            name: name.into(),
            link,
            config: RwLock::new(config),
            started_at: Mutex::new(None),
            seen_busy: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_message: Mutex::new(None),
        }
    }

    /// Build the service and its transport adapter from configuration.
    pub fn from_definition(definition: &ServiceDefinition) -> ServiceResult<Self> {
        let link = DeviceLink::from_definition(definition)?;
        Ok(Self::new(
            definition.name.clone(),
            link,
            definition.connection.clone(),
        ))
    }

    /// Name the service was registered with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport the device is reached over.
    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    fn config(&self) -> ServiceConfig {
        self.config.read().clone()
    }

    fn has_started(&self) -> bool {
        self.started_at.lock().is_some()
    }

    fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(service = %self.name, error = %message, "Device reported an error");
        *self.last_error.lock() = Some(message);
    }

    async fn query_state(&self, transport: &Arc<dyn Transport>) -> ServiceResult<DeviceState> {
        let command = self.config.read().commands.state.clone();
        let reply = transport.send(&command, &Value::Null).await?;
        DeviceState::parse(&reply).ok_or_else(|| {
            TransportError::MalformedResponse {
                endpoint: transport.endpoint().to_string(),
                message: format!("unrecognized state reply: {}", reply),
            }
            .into()
        })
    }

    async fn run_shell(
        &self,
        transport: &Arc<dyn Transport>,
        command: &str,
    ) -> ServiceResult<ShellOutput> {
        let reply = transport.send(command, &Value::Null).await?;
        serde_json::from_value(reply).map_err(|e| {
            TransportError::MalformedResponse {
                endpoint: transport.endpoint().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Send a configured finalize/validate command. Shell commands must exit 0.
    async fn run_step(&self, step: &str, command: &str) -> ServiceResult<()> {
        match &self.link {
            DeviceLink::RemoteShell(transport) => {
                let output = self.run_shell(transport, command).await?;
                if !output.success() {
                    return Err(ServiceError::Device(format!(
                        "{} command exited with {}: {}",
                        step,
                        output.exit_code,
                        output.stderr.trim()
                    )));
                }
            }
            DeviceLink::RequestReply(transport) | DeviceLink::PubSub(transport) => {
                transport.send(command, &Value::Null).await?;
            }
        }
        debug!(service = %self.name, step, "Step complete");
        Ok(())
    }

    /// Drain queued pub/sub messages. Returns `true` once a terminal status was seen.
    async fn drain_messages(&self, transport: &Arc<dyn Transport>) -> ServiceResult<bool> {
        let mut finished = false;
        loop {
            let message = match transport.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                // The terminal status already arrived; the reconnect can wait.
                Err(err) if finished => {
                    debug!(service = %self.name, error = %err, "Subscription lost after final status");
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            let status = message
                .get("status")
                .or_else(|| message.get("payload").and_then(|p| p.get("status")))
                .and_then(Value::as_str)
                .map(str::to_lowercase);
            match status.as_deref() {
                Some("finished") => finished = true,
                Some("error") => {
                    let detail = message
                        .get("message")
                        .or_else(|| message.get("payload").and_then(|p| p.get("message")))
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified error");
                    self.record_error(detail);
                    finished = true;
                }
                Some(other) => debug!(service = %self.name, status = other, "Status update"),
                None => continue,
            }
            *self.last_message.lock() = Some(message);
        }
        Ok(finished)
    }

    /// Files in `dir` modified between the latest start and now, oldest first.
    async fn data_files(&self, dir: &Path, suffix: Option<&str>) -> ServiceResult<Vec<DataFile>> {
        let since = floor_to_second(self.started_at.lock().unwrap_or(SystemTime::UNIX_EPOCH));
        let until = SystemTime::now();
        let io_err = |e: std::io::Error| {
            ServiceError::Device(format!("cannot read data directory {}: {}", dir.display(), e))
        };

        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let metadata = entry.metadata().await.map_err(io_err)?;
            if !metadata.is_file() {
                continue;
            }
            let path = entry.path();
            let suffix_matches = suffix.map_or(true, |suffix| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(suffix))
            });
            let modified = metadata.modified().map_err(io_err)?;
            if suffix_matches && modified >= since && modified <= until {
                found.push(DataFile {
                    modified,
                    path,
                    len: metadata.len(),
                });
            }
        }
        found.sort();
        Ok(found)
    }

    async fn collect_files(&self, config: &ServiceConfig) -> ServiceResult<Option<Artifact>> {
        let Some(dir) = &config.data_dir else {
            return Ok(None);
        };
        let files = self.data_files(dir, config.data_suffix.as_deref()).await?;
        if files.is_empty() {
            return Ok(None);
        }
        let paths = files.into_iter().map(|file| file.path).collect();
        Ok(Some(Artifact::new(&self.name, ArtifactData::Files(paths))))
    }

    /// Fail unless `data_dir` has room for `min_record_hours` at `gb_per_hour`.
    fn check_disk_space(&self, config: &ServiceConfig) -> ServiceResult<()> {
        let required_gb = config.required_disk_gb();
        let Some(dir) = config.data_dir.as_deref().filter(|_| required_gb > 0.0) else {
            return Ok(());
        };
        let free = fs2::available_space(dir).map_err(|e| {
            ServiceError::Device(format!(
                "data directory {} not accessible: {}",
                dir.display(),
                e
            ))
        })?;
        let free_gb = free as f64 / 1e9;
        debug!(service = %self.name, free_gb, required_gb, "Free disk space");
        if free_gb <= required_gb {
            return Err(ServiceError::Device(format!(
                "free disk space in {} is {:.1} GB, below the required {:.1} GB",
                dir.display(),
                free_gb,
                required_gb
            )));
        }
        Ok(())
    }

    /// Sample the newest data file twice, `window` apart; it must have grown.
    async fn check_growth(&self, config: &ServiceConfig, window: Duration) -> ServiceResult<()> {
        let Some(dir) = &config.data_dir else {
            return Ok(());
        };
        let suffix = config.data_suffix.as_deref();
        let Some(newest) = self.data_files(dir, suffix).await?.pop() else {
            return Err(ServiceError::Device(format!(
                "no data file written to {} since start",
                dir.display()
            )));
        };
        tokio::time::sleep(window).await;
        let len = tokio::fs::metadata(&newest.path)
            .await
            .map(|m| m.len())
            .map_err(|e| {
                ServiceError::Device(format!("cannot read {}: {}", newest.path.display(), e))
            })?;
        if len <= newest.len {
            return Err(ServiceError::Device(format!(
                "data file {} is not growing",
                newest.path.display()
            )));
        }
        debug!(service = %self.name, file = %newest.path.display(), len, "Data file growing");
        Ok(())
    }
}

#[async_trait]
impl Service for DeviceService {
    fn transport_kind(&self) -> TransportKind {
        self.link.kind()
    }

    async fn initialize(&self, config: &ServiceConfig) -> ServiceResult<()> {
        *self.config.write() = config.clone();
        *self.last_error.lock() = None;

        match &self.link {
            DeviceLink::RequestReply(transport) => {
                let state = self.query_state(transport).await?;
                if state.marker != READY {
                    return Err(ServiceError::Device(format!(
                        "{} not ready to start: {} {}",
                        self.name, state.marker, state.message
                    )));
                }
            }
            DeviceLink::PubSub(transport) => {
                // Subscribes, and discards anything left from a previous run.
                while transport.receive().await?.is_some() {}
            }
            DeviceLink::RemoteShell(transport) => {
                let check = config.commands.check.clone();
                let output = self.run_shell(transport, &check).await?;
                if !output.success() {
                    return Err(ServiceError::Device(format!(
                        "readiness check '{}' exited with {}: {}",
                        check,
                        output.exit_code,
                        output.stderr.trim()
                    )));
                }
            }
        }
        self.check_disk_space(config)?;
        debug!(service = %self.name, "Initialized");
        Ok(())
    }

    async fn test(&self) -> ServiceResult<()> {
        match &self.link {
            DeviceLink::RequestReply(transport) => {
                self.query_state(transport).await?;
            }
            DeviceLink::PubSub(transport) => {
                transport.ensure_connected().await?;
            }
            DeviceLink::RemoteShell(transport) => {
                let check = self.config.read().commands.check.clone();
                let output = self.run_shell(transport, &check).await?;
                if !output.success() {
                    return Err(ServiceError::Device(format!(
                        "readiness check exited with {}",
                        output.exit_code
                    )));
                }
            }
        }
        self.check_disk_space(&self.config())
    }

    async fn start(&self) -> ServiceResult<()> {
        let config = self.config();
        *self.last_error.lock() = None;
        *self.last_message.lock() = None;
        self.seen_busy.store(false, Ordering::Release);
        let started = SystemTime::now();

        match &self.link {
            DeviceLink::RequestReply(transport) => {
                transport.send(&config.commands.start, &Value::Null).await?;
            }
            DeviceLink::PubSub(transport) => {
                transport.send(&config.commands.start, &json!({})).await?;
            }
            DeviceLink::RemoteShell(transport) => {
                let output = self.run_shell(transport, &config.commands.start).await?;
                if !output.success() {
                    return Err(ServiceError::Device(format!(
                        "start command exited with {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    )));
                }
            }
        }

        *self.started_at.lock() = Some(started);
        info!(service = %self.name, "Started");
        Ok(())
    }

    async fn verify(&self) -> ServiceResult<()> {
        let config = self.config();
        match &self.link {
            DeviceLink::RequestReply(transport) => {
                let state = self.query_state(transport).await?;
                match state.marker.as_str() {
                    BUSY => self.seen_busy.store(true, Ordering::Release),
                    ERROR => {
                        self.record_error(state.message.clone());
                        return Err(ServiceError::Device(format!(
                            "{} reported an error after start: {}",
                            self.name, state.message
                        )));
                    }
                    other => {
                        return Err(ServiceError::Device(format!(
                            "{} not started: {} {}",
                            self.name, other, state.message
                        )))
                    }
                }
            }
            DeviceLink::PubSub(transport) => transport.ensure_connected().await?,
            DeviceLink::RemoteShell(_) => {}
        }
        if let Some(window) = config.growth_window {
            self.check_growth(&config, window).await?;
        }
        Ok(())
    }

    async fn verify_finished(&self) -> ServiceResult<bool> {
        match &self.link {
            DeviceLink::RequestReply(transport) => {
                let state = self.query_state(transport).await?;
                match state.marker.as_str() {
                    BUSY => {
                        self.seen_busy.store(true, Ordering::Release);
                        Ok(false)
                    }
                    // Ready again counts only after the device took up the start.
                    READY => Ok(self.has_started() && self.seen_busy.load(Ordering::Acquire)),
                    ERROR => {
                        self.record_error(state.message);
                        Ok(true)
                    }
                    other => {
                        debug!(service = %self.name, state = other, "Unrecognized state marker");
                        Ok(false)
                    }
                }
            }
            DeviceLink::PubSub(transport) => self.drain_messages(transport).await,
            DeviceLink::RemoteShell(transport) => {
                let status = self.config.read().commands.status.clone();
                let output = self.run_shell(transport, &status).await?;
                match output.exit_code {
                    0 => Ok(true),
                    1 => Ok(false),
                    code => {
                        let stderr = output.stderr.trim();
                        self.record_error(if stderr.is_empty() {
                            format!("status command exited with {}", code)
                        } else {
                            format!("status command exited with {}: {}", code, stderr)
                        });
                        Ok(true)
                    }
                }
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    async fn stop(&self) -> ServiceResult<()> {
        let command = self.config.read().commands.stop.clone();
        match &self.link {
            DeviceLink::RequestReply(transport) => {
                transport.send(&command, &Value::Null).await?;
            }
            DeviceLink::PubSub(transport) => {
                transport.send(&command, &json!({})).await?;
            }
            DeviceLink::RemoteShell(transport) => {
                let output = self.run_shell(transport, &command).await?;
                if !output.success() {
                    return Err(ServiceError::Device(format!(
                        "stop command exited with {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    )));
                }
            }
        }
        info!(service = %self.name, "Stopped");
        Ok(())
    }

    async fn finalize(&self) -> ServiceResult<()> {
        let finalize = self.config.read().commands.finalize.clone();
        match finalize {
            Some(command) => self.run_step("finalize", &command).await,
            None => Ok(()),
        }
    }

    async fn validate(&self) -> ServiceResult<()> {
        let config = self.config();
        if let Some(dir) = &config.data_dir {
            let files = self.data_files(dir, config.data_suffix.as_deref()).await?;
            if files.is_empty() {
                return Err(ServiceError::Device(format!(
                    "no data written to {} since start",
                    dir.display()
                )));
            }
            if let Some(empty) = files.iter().find(|file| file.len == 0) {
                return Err(ServiceError::Device(format!(
                    "empty data file {}",
                    empty.path.display()
                )));
            }
        }
        if let Some(command) = &config.commands.validate {
            self.run_step("validate", command).await?;
        }
        Ok(())
    }

    async fn get_latest_data(&self) -> ServiceResult<Option<Artifact>> {
        let config = self.config();
        if config.data_dir.is_some() {
            return self.collect_files(&config).await;
        }

        match &self.link {
            DeviceLink::RequestReply(transport) => {
                let reply = transport
                    .send(&config.commands.latest_data, &Value::Null)
                    .await?;
                Ok(match reply {
                    Value::Null => None,
                    Value::String(text) => Some(Artifact::new(&self.name, ArtifactData::Text(text))),
                    other => Some(Artifact::new(&self.name, ArtifactData::Json(other))),
                })
            }
            DeviceLink::PubSub(_) => Ok(self
                .last_message
                .lock()
                .clone()
                .map(|message| Artifact::new(&self.name, ArtifactData::Json(message)))),
            DeviceLink::RemoteShell(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSet;
    use crate::transport::MockTransport;
    use std::io::Write;

    fn service_over(mock: &Arc<MockTransport>) -> DeviceService {
        DeviceService::new(
            "sync",
            DeviceLink::new(mock.clone()),
            ServiceConfig::default(),
        )
    }

    #[test]
    fn test_state_parsing() {
        let ready = DeviceState::parse(&json!(["READY", ""])).unwrap();
        assert_eq!(ready.marker, READY);
        let busy = DeviceState::parse(&json!(["BUSY", "RECORDING"])).unwrap();
        assert_eq!(busy.message, "RECORDING");
        let legacy = DeviceState::parse(&json!({"message": "READY"})).unwrap();
        assert_eq!(legacy.marker, READY);
        assert!(DeviceState::parse(&json!(42)).is_none());
    }

    #[tokio::test]
    async fn test_request_reply_lifecycle() {
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.reply("get_state", json!(["READY", ""]));
        let service = service_over(&mock);

        service.initialize(&ServiceConfig::default()).await.unwrap();
        // Ready before any start is not "finished".
        assert!(!service.verify_finished().await.unwrap());

        service.start().await.unwrap();
        mock.push_reply("get_state", Ok(json!(["BUSY", "RECORDING"])));
        assert!(!service.verify_finished().await.unwrap());
        assert!(service.verify_finished().await.unwrap());
        assert!(service.last_error().is_none());

        service.stop().await.unwrap();
        assert_eq!(mock.call_count("start"), 1);
        assert_eq!(mock.call_count("stop"), 1);
    }

    #[tokio::test]
    async fn test_busy_device_is_not_ready() {
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.reply("get_state", json!(["BUSY", "RECORDING"]));
        let err = service_over(&mock)
            .initialize(&ServiceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Device(_)));
    }

    #[tokio::test]
    async fn test_error_marker_finishes_with_error() {
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.reply("get_state", json!(["READY", ""]));
        let service = service_over(&mock);
        service.initialize(&ServiceConfig::default()).await.unwrap();
        service.start().await.unwrap();

        mock.reply("get_state", json!(["ERROR", "disk full"]));
        assert!(service.verify_finished().await.unwrap());
        assert_eq!(service.last_error().as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_transport_errors_propagate_unchanged() {
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.fail(
            "get_state",
            TransportError::Timeout {
                endpoint: "sync:5000".into(),
                timeout: Duration::from_secs(1),
            },
        );
        let err = service_over(&mock).test().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_pubsub_status_messages() {
        let mock = Arc::new(MockTransport::new(TransportKind::PubSub));
        let service = DeviceService::new("cam3d", DeviceLink::new(mock.clone()), ServiceConfig::default());
        mock.push_message(json!({"status": "stale"}));
        service.initialize(&ServiceConfig::default()).await.unwrap();
        service.start().await.unwrap();

        assert!(!service.verify_finished().await.unwrap());
        mock.push_message(json!({"topic": "cam3d", "command": "start"}))
            .push_message(json!({"status": "error", "message": "camera lost"}));
        assert!(service.verify_finished().await.unwrap());
        assert_eq!(service.last_error().as_deref(), Some("camera lost"));

        let artifact = service.get_latest_data().await.unwrap().unwrap();
        assert_eq!(artifact.service, "cam3d");
        assert!(matches!(artifact.data, ArtifactData::Json(_)));
    }

    #[tokio::test]
    async fn test_remote_shell_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            commands: CommandSet {
                start: format!("touch {}/started", dir.path().display()),
                // `test -f` exits 1 while the file is missing.
                status: format!("test -f {}/done", dir.path().display()),
                ..CommandSet::default()
            },
            ..ServiceConfig::default()
        };
        let shell = RemoteShellTransport::local(Duration::from_secs(5));
        let service = DeviceService::new("mvr", DeviceLink::new(Arc::new(shell)), config.clone());

        service.initialize(&config).await.unwrap();
        service.start().await.unwrap();
        assert!(dir.path().join("started").exists());
        assert!(!service.verify_finished().await.unwrap());

        std::fs::write(dir.path().join("done"), b"").unwrap();
        assert!(service.verify_finished().await.unwrap());
        assert!(service.last_error().is_none());
    }

    #[tokio::test]
    async fn test_remote_shell_unexpected_status_is_failure() {
        let config = ServiceConfig {
            commands: CommandSet {
                status: "echo 'no space left' >&2; exit 7".into(),
                ..CommandSet::default()
            },
            ..ServiceConfig::default()
        };
        let shell = RemoteShellTransport::local(Duration::from_secs(5));
        let service = DeviceService::new("mvr", DeviceLink::new(Arc::new(shell)), config.clone());
        service.initialize(&config).await.unwrap();

        assert!(service.verify_finished().await.unwrap());
        let error = service.last_error().unwrap();
        assert!(error.contains("exited with 7"));
        assert!(error.contains("no space left"));
    }

    #[tokio::test]
    async fn test_failed_check_is_device_error() {
        let config = ServiceConfig {
            commands: CommandSet {
                check: "exit 3".into(),
                ..CommandSet::default()
            },
            ..ServiceConfig::default()
        };
        let shell = RemoteShellTransport::local(Duration::from_secs(5));
        let service = DeviceService::new("mvr", DeviceLink::new(Arc::new(shell)), config.clone());
        let err = service.initialize(&config).await.unwrap_err();
        assert!(matches!(err, ServiceError::Device(_)));
    }

    #[tokio::test]
    async fn test_ready_without_busy_is_not_finished() {
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.reply("get_state", json!(["READY", ""]));
        let service = service_over(&mock);
        service.initialize(&ServiceConfig::default()).await.unwrap();
        service.start().await.unwrap();

        // The device ignored the start: it never reports BUSY.
        assert!(!service.verify_finished().await.unwrap());
        assert!(!service.verify_finished().await.unwrap());
        let err = service.verify().await.unwrap_err();
        assert!(matches!(err, ServiceError::Device(ref m) if m.contains("not started")));

        // A new start forgets the BUSY seen during the previous one.
        mock.push_reply("get_state", Ok(json!(["BUSY", "RECORDING"])));
        service.verify().await.unwrap();
        assert!(service.verify_finished().await.unwrap());
        service.start().await.unwrap();
        assert!(!service.verify_finished().await.unwrap());
    }

    #[tokio::test]
    async fn test_pubsub_preflight_keeps_messages() {
        let mock = Arc::new(MockTransport::new(TransportKind::PubSub));
        let service = DeviceService::new("cam3d", DeviceLink::new(mock.clone()), ServiceConfig::default());
        mock.push_message(json!({"status": "finished"}));

        service.test().await.unwrap();
        assert_eq!(
            mock.receive().await.unwrap(),
            Some(json!({"status": "finished"}))
        );
    }

    fn data_config(dir: &std::path::Path, suffix: &str) -> ServiceConfig {
        ServiceConfig {
            data_dir: Some(dir.to_path_buf()),
            data_suffix: Some(suffix.into()),
            ..ServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_collects_files_since_start() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.sync");
        std::fs::write(&old, b"x").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.reply("get_state", json!(["READY", ""]));
        let config = data_config(dir.path(), ".sync");
        let service = DeviceService::new("sync", DeviceLink::new(mock.clone()), config.clone());
        service.initialize(&config).await.unwrap();
        service.start().await.unwrap();

        std::fs::write(dir.path().join("session.sync"), b"data").unwrap();
        std::fs::write(dir.path().join("session.log"), b"log").unwrap();

        let artifact = service.get_latest_data().await.unwrap().unwrap();
        match artifact.data {
            ArtifactData::Files(files) => {
                assert_eq!(files.len(), 1);
                assert!(files[0].ends_with("session.sync"));
            }
            other => panic!("expected files, got {:?}", other),
        }
        assert_eq!(mock.call_count("get_latest_data"), 0);
    }

    #[tokio::test]
    async fn test_collects_file_written_by_start_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            commands: CommandSet {
                start: format!("printf frames > {}/take.mp4", dir.path().display()),
                ..CommandSet::default()
            },
            ..data_config(dir.path(), ".mp4")
        };
        let shell = RemoteShellTransport::local(Duration::from_secs(5));
        let service = DeviceService::new("mvr", DeviceLink::new(Arc::new(shell)), config.clone());
        service.initialize(&config).await.unwrap();
        service.start().await.unwrap();

        service.validate().await.unwrap();
        let artifact = service.get_latest_data().await.unwrap().unwrap();
        assert!(matches!(
            artifact.data,
            ArtifactData::Files(ref files) if files.len() == 1 && files[0].ends_with("take.mp4")
        ));
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_or_empty_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = data_config(dir.path(), ".sync");
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.reply("get_state", json!(["READY", ""]));
        let service = DeviceService::new("sync", DeviceLink::new(mock.clone()), config.clone());
        service.initialize(&config).await.unwrap();
        service.start().await.unwrap();

        let err = service.validate().await.unwrap_err();
        assert!(err.to_string().contains("no data written"));

        std::fs::write(dir.path().join("session.sync"), b"").unwrap();
        let err = service.validate().await.unwrap_err();
        assert!(err.to_string().contains("empty data file"));

        std::fs::write(dir.path().join("session.sync"), b"data").unwrap();
        service.validate().await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_and_validate_commands() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("flushed");
        let config = ServiceConfig {
            commands: CommandSet {
                finalize: Some(format!("touch {}", marker.display())),
                validate: Some(format!("test -f {}", marker.display())),
                ..CommandSet::default()
            },
            ..ServiceConfig::default()
        };
        let shell = RemoteShellTransport::local(Duration::from_secs(5));
        let service = DeviceService::new("mvr", DeviceLink::new(Arc::new(shell)), config.clone());
        service.initialize(&config).await.unwrap();

        let err = service.validate().await.unwrap_err();
        assert!(err.to_string().contains("validate command exited with 1"));
        service.finalize().await.unwrap();
        service.validate().await.unwrap();

        // Request/reply devices receive the step as a command.
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        let config = ServiceConfig {
            commands: CommandSet {
                finalize: Some("flush".into()),
                ..CommandSet::default()
            },
            ..ServiceConfig::default()
        };
        let sync = DeviceService::new("sync", DeviceLink::new(mock.clone()), config);
        sync.finalize().await.unwrap();
        sync.validate().await.unwrap();
        assert_eq!(mock.call_count("flush"), 1);
    }

    #[tokio::test]
    async fn test_disk_space_check_on_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(TransportKind::RequestReply));
        mock.reply("get_state", json!(["READY", ""]));
        let service = service_over(&mock);

        let greedy = ServiceConfig {
            gb_per_hour: Some(1e9),
            ..data_config(dir.path(), ".sync")
        };
        let err = service.initialize(&greedy).await.unwrap_err();
        assert!(err.to_string().contains("free disk space"), "{err}");

        let modest = ServiceConfig {
            gb_per_hour: Some(0.05),
            min_record_hours: 1.0,
            ..data_config(dir.path(), ".sync")
        };
        service.initialize(&modest).await.unwrap();

        let missing = ServiceConfig {
            gb_per_hour: Some(1.0),
            ..data_config(&dir.path().join("absent"), ".sync")
        };
        let err = service.initialize(&missing).await.unwrap_err();
        assert!(err.to_string().contains("not accessible"), "{err}");
    }

    #[tokio::test]
    async fn test_growth_check_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("take.sync");
        let config = ServiceConfig {
            growth_window: Some(Duration::from_millis(500)),
            commands: CommandSet {
                start: format!("printf a > {}", file.display()),
                ..CommandSet::default()
            },
            ..data_config(dir.path(), ".sync")
        };
        let shell = RemoteShellTransport::local(Duration::from_secs(5));
        let service = DeviceService::new("sync", DeviceLink::new(Arc::new(shell)), config.clone());
        service.initialize(&config).await.unwrap();

        // Stalled recording.
        service.start().await.unwrap();
        let err = service.verify().await.unwrap_err();
        assert!(err.to_string().contains("not growing"), "{err}");

        // Recording that keeps appending.
        service.start().await.unwrap();
        let writer = {
            let file = file.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
                handle.write_all(b"bcd").unwrap();
            })
        };
        service.verify().await.unwrap();
        writer.await.unwrap();
    }
}
