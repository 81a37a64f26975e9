//! Coordinator Configuration
//!
//! JSON document describing the coordinator: listen addresses, TLS
//! material, scheduler cadence and retry policy, and the provisioning
//! backends. Every field has a default so a minimal `{}` file is valid.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{PoolKind, PooledBackend, ProvisioningBackend, SimulatedProvisioningService};
use crate::coordinator::CoordinatorSettings;
use crate::events::DEFAULT_SLOW_THRESHOLD;
use crate::master::Organization;
use crate::protocol::{ProtocolError, TlsConfig};
use crate::scheduler::{Cadence, RetryPolicy, SchedulerSettings};

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] ProtocolError),
}

/// Top-level coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Organization the coordinator declares to masters (default: "coordinator")
    #[serde(default = "default_organization")]
    pub organization: String,

    /// Agent endpoint (default: "127.0.0.1:7443")
    #[serde(default = "default_agent_listen")]
    pub agent_listen: String,

    /// Admin API (default: "127.0.0.1:8080")
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    #[serde(default)]
    pub tls: TlsSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub protocol: ProtocolSection,

    #[serde(default)]
    pub listeners: ListenersSection,

    /// Masters allowed to be connected at once (default: unlimited)
    #[serde(default)]
    pub max_connected_masters: Option<usize>,

    /// JSON file the master records are persisted to (default: none)
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    #[serde(default = "default_backends")]
    pub backends: Vec<BackendSection>,
}

fn default_organization() -> String {
    "coordinator".to_string()
}

fn default_agent_listen() -> String {
    "127.0.0.1:7443".to_string()
}

fn default_http_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_backends() -> Vec<BackendSection> {
    vec![BackendSection::default()]
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            organization: default_organization(),
            agent_listen: default_agent_listen(),
            http_listen: default_http_listen(),
            tls: TlsSection::default(),
            scheduler: SchedulerSection::default(),
            protocol: ProtocolSection::default(),
            listeners: ListenersSection::default(),
            max_connected_masters: None,
            state_file: None,
            backends: default_backends(),
        }
    }
}

/// PEM material for the agent endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSection {
    #[serde(default = "default_ca_cert")]
    pub ca_cert: PathBuf,

    #[serde(default = "default_cert")]
    pub cert: PathBuf,

    #[serde(default = "default_key")]
    pub key: PathBuf,

    /// CA private key. Only simulated backends need it, to issue master
    /// identities.
    #[serde(default)]
    pub ca_key: Option<PathBuf>,

    /// DNS name in the coordinator certificate (default: "coordinator.local")
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_ca_cert() -> PathBuf {
    PathBuf::from("tls/ca.pem")
}

fn default_cert() -> PathBuf {
    PathBuf::from("tls/coordinator.pem")
}

fn default_key() -> PathBuf {
    PathBuf::from("tls/coordinator.key")
}

fn default_server_name() -> String {
    "coordinator.local".to_string()
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            ca_cert: default_ca_cert(),
            cert: default_cert(),
            key: default_key(),
            ca_key: None,
            server_name: default_server_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_recurrence_period_ms")]
    pub recurrence_period_ms: u64,

    #[serde(default)]
    pub retry: RetrySection,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_recurrence_period_ms() -> u64 {
    10_000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            recurrence_period_ms: default_recurrence_period_ms(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenersSection {
    /// Listeners slower than this are logged (default: 250)
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
}

fn default_slow_threshold_ms() -> u64 {
    DEFAULT_SLOW_THRESHOLD.as_millis() as u64
}

impl Default for ListenersSection {
    fn default() -> Self {
        Self {
            slow_threshold_ms: default_slow_threshold_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cloud,
    Node,
}

/// One provisioning backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// Backend name; the node label for node pools (default: "default")
    #[serde(default = "default_backend_name")]
    pub name: String,

    /// Starts allowed in flight at once (default: 4)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub start_timeout_ms: Option<u64>,

    #[serde(default)]
    pub service: ServiceSection,
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Cloud
}

fn default_backend_name() -> String {
    "default".to_string()
}

fn default_capacity() -> usize {
    4
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            name: default_backend_name(),
            capacity: default_capacity(),
            start_timeout_ms: None,
            service: ServiceSection::default(),
        }
    }
}

/// What actually launches masters for a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceSection {
    Simulated {
        #[serde(default)]
        delay_ms: u64,

        /// Number of initial starts that fail
        #[serde(default)]
        fail_first: u32,
    },
}

impl Default for ServiceSection {
    fn default() -> Self {
        ServiceSection::Simulated {
            delay_ms: 0,
            fail_first: 0,
        }
    }
}

/// Backends built from configuration.
#[derive(Default)]
pub struct BuiltBackends {
    pub backends: Vec<Arc<dyn ProvisioningBackend>>,
    /// Simulated services among them, to be pointed at the agent endpoint
    /// once it is bound.
    pub simulated: Vec<Arc<SimulatedProvisioningService>>,
}

impl fmt::Debug for BuiltBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("BuiltBackends")
            .field("backends", &names)
            .field("simulated", &self.simulated.len())
            .finish()
    }
}

impl CoordinatorConfig {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON document
    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let config: CoordinatorConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.organization()?;
        self.agent_addr()?;
        self.http_addr()?;

        if self.tls.server_name.is_empty() {
            return Err(ConfigError::Invalid("tls.server_name must not be empty".into()));
        }
        if self.protocol.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "protocol.handshake_timeout_ms must be > 0".into(),
            ));
        }
        if self.max_connected_masters == Some(0) {
            return Err(ConfigError::Invalid(
                "max_connected_masters must be > 0 when set".into(),
            ));
        }

        let settings = self.scheduler_settings();
        settings
            .cadence
            .validate()
            .and_then(|_| settings.retry.validate())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.backends.is_empty() {
            return Err(ConfigError::Invalid("at least one backend is required".into()));
        }
        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ConfigError::Invalid("backend name must not be empty".into()));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name: '{}'",
                    backend.name
                )));
            }
            if backend.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' capacity must be > 0",
                    backend.name
                )));
            }
            if backend.start_timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' start_timeout_ms must be > 0 when set",
                    backend.name
                )));
            }
        }

        Ok(())
    }

    pub fn organization(&self) -> ConfigResult<Organization> {
        Organization::new(self.organization.clone())
            .map_err(|e| ConfigError::Invalid(format!("organization: {e}")))
    }

    pub fn agent_addr(&self) -> ConfigResult<SocketAddr> {
        parse_addr("agent_listen", &self.agent_listen)
    }

    pub fn http_addr(&self) -> ConfigResult<SocketAddr> {
        parse_addr("http_listen", &self.http_listen)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.listeners.slow_threshold_ms)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let retry = &self.scheduler.retry;
        SchedulerSettings {
            cadence: Cadence {
                initial_delay: Duration::from_millis(self.scheduler.initial_delay_ms),
                recurrence_period: Duration::from_millis(self.scheduler.recurrence_period_ms),
            },
            retry: RetryPolicy {
                max_attempts: retry.max_attempts,
                initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(retry.max_backoff_ms),
                multiplier: retry.multiplier,
                jitter: retry.jitter,
            },
        }
    }

    pub fn coordinator_settings(&self) -> ConfigResult<CoordinatorSettings> {
        let mut settings = CoordinatorSettings::new(self.organization()?);
        settings.scheduler = self.scheduler_settings();
        settings.handshake_timeout = Duration::from_millis(self.protocol.handshake_timeout_ms);
        settings.max_connected_masters = self.max_connected_masters;
        Ok(settings)
    }

    /// Load the coordinator's TLS identity
    pub fn load_tls(&self) -> ConfigResult<TlsConfig> {
        Ok(TlsConfig::from_files(
            &self.tls.ca_cert,
            &self.tls.cert,
            &self.tls.key,
        )?)
    }

    /// Instantiate the configured backends in order
    pub fn build_backends(&self) -> BuiltBackends {
        let mut built = BuiltBackends::default();
        for section in &self.backends {
            let service = match section.service {
                ServiceSection::Simulated {
                    delay_ms,
                    fail_first,
                } => Arc::new(
                    SimulatedProvisioningService::new(Duration::from_millis(delay_ms))
                        .with_failures(fail_first),
                ),
            };
            built.simulated.push(service.clone());

            let kind = match section.kind {
                BackendKind::Cloud => PoolKind::Cloud {
                    name: section.name.clone(),
                },
                BackendKind::Node => PoolKind::Node {
                    label: section.name.clone(),
                },
            };
            let mut backend = PooledBackend::new(kind, section.capacity, service);
            if let Some(ms) = section.start_timeout_ms {
                backend = backend.with_start_timeout(Duration::from_millis(ms));
            }
            built.backends.push(Arc::new(backend));
        }
        built
    }
}

fn parse_addr(field: &str, value: &str) -> ConfigResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{field} '{value}': {e}")))
}
