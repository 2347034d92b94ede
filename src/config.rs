//! Rig configuration using Figment
//!
//! Configuration is loaded from a TOML file merged with environment variables
//! prefixed with `RIGSVC_`. Nested keys are separated with a double underscore:
//!
//! ```text
//! RIGSVC_SESSION__LOG_LEVEL=debug
//! RIGSVC_SESSION__TIMEOUT=2h
//! RIGSVC_RETRY__MAX_ATTEMPTS=8
//! ```
//!
//! The core only consumes the parsed values; see [`crate::registry::ServiceRegistry::from_config`]
//! and [`crate::orchestrator::SessionPlan::from_config`].
//!
//! # Example
//!
//! ```toml
//! [session]
//! timeout = "90m"
//! grace_period = "10s"
//!
//! [[services]]
//! name = "sync"
//! transport = "request_reply"
//! host = "w10dtsm18306"
//! port = 5000
//!
//! [[services]]
//! name = "video"
//! transport = "remote_shell"
//! host = "acq-mvr"
//! depends_on = ["sync"]
//! required = false
//! commands.start = "mvr-ctl record"
//! commands.status = "mvr-ctl is-done"
//! ```

use crate::orchestrator::OptionalFailurePolicy;
use crate::transport::TransportKind;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    /// Session-wide settings
    #[serde(default)]
    pub session: SessionSettings,
    /// Default retry policy for every device call
    #[serde(default)]
    pub retry: RetrySettings,
    /// Service definitions, in session order
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

/// Session-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Overall session timeout, measured from session start
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Bound on each forced stop after a timeout or cancellation
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
    /// How a failed optional service affects the session status
    #[serde(default)]
    pub optional_failure: OptionalFailurePolicy,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: default_session_timeout(),
            grace_period: default_grace_period(),
            optional_failure: OptionalFailurePolicy::default(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Retry policy parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// One service participating in sessions on this rig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique service name
    pub name: String,
    /// How the device is reached
    pub transport: TransportKind,
    /// Whether this service is registered at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether a failure of this service counts against the session
    #[serde(default = "default_true")]
    pub required: bool,
    /// Services that must be running before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Connection parameters handed to the service on initialize
    #[serde(flatten)]
    pub connection: ServiceConfig,
    /// Per-service retry override
    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

/// Per-service connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Host name or address; `None` for local remote-shell execution
    #[serde(default)]
    pub host: Option<String>,
    /// TCP port for request/reply and pub/sub
    #[serde(default)]
    pub port: Option<u16>,
    /// Per-call timeout
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Polling cadence while the service runs
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Remote shell user
    #[serde(default)]
    pub user: Option<String>,
    /// Credential, forwarded to devices that ask for one
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Pub/sub topic; defaults to the service name
    #[serde(default)]
    pub topic: Option<String>,
    /// Directory the device writes its data into
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// File suffix of the data the device produces (e.g. ".sync")
    #[serde(default)]
    pub data_suffix: Option<String>,
    /// Data rate in GB per recorded hour; enables the free-space check on initialize
    #[serde(default)]
    pub gb_per_hour: Option<f64>,
    /// Recording length the free-space check must cover
    #[serde(default = "default_min_record_hours")]
    pub min_record_hours: f64,
    /// After start, the newest data file must grow within this window
    #[serde(default, with = "humantime_serde")]
    pub growth_window: Option<Duration>,
    /// Command names or shell commands used by the generic device service
    #[serde(default)]
    pub commands: CommandSet,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            timeout: default_call_timeout(),
            poll_interval: default_poll_interval(),
            user: None,
            password: None,
            topic: None,
            data_dir: None,
            data_suffix: None,
            gb_per_hour: None,
            min_record_hours: default_min_record_hours(),
            growth_window: None,
            commands: CommandSet::default(),
        }
    }
}

impl ServiceConfig {
    /// `host:port` when both are set.
    pub fn address(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }

    /// Free space needed in `data_dir` before a start, in GB rounded to 0.1.
    /// `0.0` when the service declares no data rate.
    pub fn required_disk_gb(&self) -> f64 {
        match self.gb_per_hour {
            Some(rate) => (rate * self.min_record_hours * 10.0).round() / 10.0,
            None => 0.0,
        }
    }
}

/// Device commands. For request/reply and pub/sub these are command names;
/// for remote shell they are shell command lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    #[serde(default = "default_start_command")]
    pub start: String,
    #[serde(default = "default_stop_command")]
    pub stop: String,
    #[serde(default = "default_state_command")]
    pub state: String,
    #[serde(default = "default_latest_data_command")]
    pub latest_data: String,
    /// Remote shell readiness check
    #[serde(default = "default_check_command")]
    pub check: String,
    /// Remote shell completion check (exit 0 = finished, 1 = running)
    #[serde(default = "default_status_command")]
    pub status: String,
    /// Run once the device finished, e.g. to wait for post-processing
    #[serde(default)]
    pub finalize: Option<String>,
    /// Run after `finalize` to check the recorded data
    #[serde(default)]
    pub validate: Option<String>,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            start: default_start_command(),
            stop: default_stop_command(),
            state: default_state_command(),
            latest_data: default_latest_data_command(),
            check: default_check_command(),
            status: default_status_command(),
            finalize: None,
            validate: None,
        }
    }
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_jitter() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_min_record_hours() -> f64 {
    3.0
}

fn default_start_command() -> String {
    "start".to_string()
}

fn default_stop_command() -> String {
    "stop".to_string()
}

fn default_state_command() -> String {
    "get_state".to_string()
}

fn default_latest_data_command() -> String {
    "get_latest_data".to_string()
}

fn default_check_command() -> String {
    "true".to_string()
}

fn default_status_command() -> String {
    "exit 1".to_string()
}

impl RigConfig {
    /// Load configuration from a TOML file, merged with `RIGSVC_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RIGSVC_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Retry parameters are sane
    /// - Service names are unique and non-empty
    /// - Dependencies name other enabled services
    /// - Each service has the fields its transport needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.session.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.session.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "Session timeout must be greater than zero".to_string(),
            ));
        }

        validate_retry("retry", &self.retry)?;

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Service name cannot be empty".to_string(),
                ));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate service name: '{}'",
                    service.name
                )));
            }
            self.validate_service(service)?;
        }

        let enabled: HashSet<&str> = self
            .enabled_services()
            .into_iter()
            .map(|s| s.name.as_str())
            .collect();
        for service in self.enabled_services() {
            for dependency in &service.depends_on {
                if dependency == &service.name {
                    return Err(ConfigError::ValidationError(format!(
                        "Service '{}' depends on itself",
                        service.name
                    )));
                }
                if !enabled.contains(dependency.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Service '{}' depends on unknown or disabled service '{}'",
                        service.name, dependency
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_service(&self, service: &ServiceDefinition) -> Result<(), ConfigError> {
        if let Some(retry) = &service.retry {
            validate_retry(&format!("services.{}.retry", service.name), retry)?;
        }
        if service.connection.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' poll_interval must be greater than zero",
                service.name
            )));
        }

        let connection = &service.connection;
        if connection.data_dir.is_none()
            && (connection.gb_per_hour.is_some() || connection.growth_window.is_some())
        {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' checks disk space or data growth but has no data_dir",
                service.name
            )));
        }
        if connection.gb_per_hour.is_some_and(|rate| rate < 0.0) || connection.min_record_hours < 0.0
        {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' gb_per_hour and min_record_hours must not be negative",
                service.name
            )));
        }

        match service.transport {
            TransportKind::RequestReply | TransportKind::PubSub => {
                if service.connection.address().is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "Service '{}' uses {} transport and needs both host and port",
                        service.name, service.transport
                    )));
                }
            }
            TransportKind::RemoteShell => {
                if service.connection.commands.start.trim().is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Service '{}' has an empty start command",
                        service.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Get enabled services only
    pub fn enabled_services(&self) -> Vec<&ServiceDefinition> {
        self.services.iter().filter(|s| s.enabled).collect()
    }

    /// Look up a service definition by name
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }
}

fn validate_retry(section: &str, retry: &RetrySettings) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}.max_attempts must be at least 1",
            section
        )));
    }
    if !(0.0..1.0).contains(&retry.jitter) {
        return Err(ConfigError::ValidationError(format!(
            "{}.jitter must be in [0, 1), got {}",
            section, retry.jitter
        )));
    }
    if retry.multiplier < 1.0 {
        return Err(ConfigError::ValidationError(format!(
            "{}.multiplier must be >= 1, got {}",
            section, retry.multiplier
        )));
    }
    if retry.max_delay < retry.base_delay {
        return Err(ConfigError::ValidationError(format!(
            "{}.max_delay must not be shorter than base_delay",
            section
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RIG: &str = r#"
        [session]
        timeout = "30m"
        grace_period = "5s"
        optional_failure = "abort"

        [retry]
        max_attempts = 3
        base_delay = "50ms"

        [[services]]
        name = "sync"
        transport = "request_reply"
        host = "sync-host"
        port = 5000

        [[services]]
        name = "video"
        transport = "remote_shell"
        host = "acq"
        user = "svc_neuropix"
        depends_on = ["sync"]
        required = false
        poll_interval = "1s"
        commands.start = "mvr-ctl record"
        commands.status = "mvr-ctl is-done"

        [[services]]
        name = "stim"
        transport = "pub_sub"
        host = "stim-host"
        port = 5001
        enabled = false
    "#;

    #[test]
    fn test_parse_valid_config() {
        let config = RigConfig::from_toml_str(RIG).unwrap();
        assert_eq!(config.session.timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.session.grace_period, Duration::from_secs(5));
        assert_eq!(config.session.optional_failure, OptionalFailurePolicy::Abort);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_delay, Duration::from_secs(5));

        let video = config.service("video").unwrap();
        assert_eq!(video.transport, TransportKind::RemoteShell);
        assert!(!video.required);
        assert_eq!(video.depends_on, vec!["sync".to_string()]);
        assert_eq!(video.connection.poll_interval, Duration::from_secs(1));
        assert_eq!(video.connection.commands.start, "mvr-ctl record");
        assert_eq!(video.connection.commands.stop, "stop");

        let sync = config.service("sync").unwrap();
        assert_eq!(sync.connection.address().as_deref(), Some("sync-host:5000"));
        assert_eq!(sync.connection.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_enabled_services_filter() {
        let config = RigConfig::from_toml_str(RIG).unwrap();
        let enabled: Vec<_> = config
            .enabled_services()
            .into_iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(enabled, vec!["sync", "video"]);
    }

    #[test]
    fn test_duplicate_service_names() {
        let toml = r#"
            [[services]]
            name = "sync"
            transport = "remote_shell"

            [[services]]
            name = "sync"
            transport = "remote_shell"
        "#;
        let err = RigConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate service name"));
    }

    #[test]
    fn test_unknown_dependency() {
        let toml = r#"
            [[services]]
            name = "cam"
            transport = "remote_shell"
            depends_on = ["sync"]
        "#;
        let err = RigConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("unknown or disabled service 'sync'"));
    }

    #[test]
    fn test_request_reply_requires_address() {
        let toml = r#"
            [[services]]
            name = "sync"
            transport = "request_reply"
            host = "sync-host"
        "#;
        let err = RigConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("needs both host and port"));
    }

    #[test]
    fn test_invalid_retry_settings() {
        let toml = r#"
            [retry]
            max_attempts = 0
        "#;
        assert!(RigConfig::from_toml_str(toml).is_err());

        let toml = r#"
            [retry]
            jitter = 1.5
        "#;
        assert!(RigConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let toml = r#"
            [session]
            log_level = "verbose"
        "#;
        let err = RigConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(&path, RIG).unwrap();

        let config = RigConfig::load_from(&path).unwrap();
        assert_eq!(config.services.len(), 3);
        assert_eq!(config.session.timeout, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_data_checks_need_data_dir() {
        let toml = r#"
            [[services]]
            name = "video"
            transport = "remote_shell"
            gb_per_hour = 20.0
        "#;
        let err = RigConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("has no data_dir"));

        let toml = r#"
            [[services]]
            name = "video"
            transport = "remote_shell"
            data_dir = "/data/mvr"
            gb_per_hour = 2.5
            min_record_hours = 1.5
            growth_window = "3s"
            commands.finalize = "mvr-ctl flush"
        "#;
        let config = RigConfig::from_toml_str(toml).unwrap();
        let video = &config.service("video").unwrap().connection;
        assert_eq!(video.required_disk_gb(), 3.8);
        assert_eq!(video.growth_window, Some(Duration::from_secs(3)));
        assert_eq!(video.commands.finalize.as_deref(), Some("mvr-ctl flush"));
        assert!(video.commands.validate.is_none());
        assert_eq!(ServiceConfig::default().required_disk_gb(), 0.0);
    }
}
