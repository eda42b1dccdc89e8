use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Lifecycle timings shared by all kinds
    #[serde(default)]
    pub defaults: SupervisorDefaults,

    /// Server proxy kinds launched from command templates, keyed by kind id
    #[serde(default)]
    pub kinds: BTreeMap<String, KindConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Front door port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Prefix the whole namespace is mounted under, e.g. "/ide"
    #[serde(default)]
    pub home_path: String,

    /// Max time to wait for an instance to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            home_path: String::new(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

/// How the health poller decides an instance is ready
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Any HTTP response with a status below 400
    #[default]
    Status,
    /// The port accepts a TCP connection
    Connect,
}

/// What path the instance sees on proxied requests
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// Drop everything up to and including the instance id
    #[default]
    Strip,
    /// Forward the internal path (`/server-proxy/<kind>/<id>/...`), for tools
    /// that are told their base URL at launch
    Preserve,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorDefaults {
    /// Interval between health probes in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Time allowed for an instance to become healthy
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Bounded wait for each phase of a stop (SIGTERM, then SIGKILL)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Timeout of a single probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    #[serde(default)]
    pub validation: ValidationMode,
}

impl SupervisorDefaults {
    pub fn timings(&self) -> LifecycleTimings {
        LifecycleTimings {
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            validation: self.validation,
        }
    }
}

impl Default for SupervisorDefaults {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_interval(),
            startup_timeout_secs: default_startup_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            validation: ValidationMode::default(),
        }
    }
}

/// Resolved timings an instance runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    pub health_check_interval: Duration,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub probe_timeout: Duration,
    pub validation: ValidationMode,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        SupervisorDefaults::default().timings()
    }
}

/// A command given either as an argument list or as one shell-style line
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    Args(Vec<String>),
    Line(String),
}

impl CommandLine {
    /// Split into program and arguments
    pub fn to_args(&self) -> Result<Vec<String>, String> {
        match self {
            CommandLine::Args(args) => Ok(args.clone()),
            CommandLine::Line(line) => {
                shell_words::split(line).map_err(|e| format!("invalid command line: {}", e))
            }
        }
    }
}

/// A server proxy kind defined by a command template
///
/// # Security Warning
///
/// `command` is executed directly with the permissions of the supervisor.
/// Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct KindConfig {
    /// Display name (defaults to the kind id)
    pub name: Option<String>,

    /// Command template, see `registry::TemplateKind` for placeholders
    pub command: CommandLine,

    /// Environment templates added on top of the supervisor's environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    pub working_dir: Option<String>,

    /// Health check path, overriding the one derived from `path_mode`
    pub validation_path: Option<String>,

    #[serde(default)]
    pub path_mode: PathMode,

    /// Rewrite `Location: http://localhost:<port>/...` redirects (default: true)
    #[serde(default = "default_true")]
    pub rewrite_location: bool,

    pub validation: Option<ValidationMode>,
    pub health_check_interval_ms: Option<u64>,
    pub startup_timeout_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
}

impl KindConfig {
    pub fn new(command: CommandLine) -> Self {
        Self {
            name: None,
            command,
            env: HashMap::new(),
            working_dir: None,
            validation_path: None,
            path_mode: PathMode::default(),
            rewrite_location: true,
            validation: None,
            health_check_interval_ms: None,
            startup_timeout_secs: None,
            stop_timeout_secs: None,
            probe_timeout_ms: None,
        }
    }

    /// Timings for this kind, falling back to the supervisor defaults
    pub fn timings(&self, defaults: &LifecycleTimings) -> LifecycleTimings {
        LifecycleTimings {
            health_check_interval: self
                .health_check_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.health_check_interval),
            startup_timeout: self
                .startup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_timeout),
            stop_timeout: self
                .stop_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_timeout),
            probe_timeout: self
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            validation: self.validation.unwrap_or(defaults.validation),
        }
    }

    /// Validate the kind configuration
    pub fn validate(&self, id: &str) -> Result<(), String> {
        if id.is_empty() {
            return Err("Kind id must not be empty".to_string());
        }
        if id.contains('/') {
            return Err(format!("Kind '{}': id must not contain '/'", id));
        }

        let args = self
            .command
            .to_args()
            .map_err(|e| format!("Kind '{}': {}", id, e))?;
        if args.is_empty() {
            return Err(format!("Kind '{}': 'command' must not be empty", id));
        }

        for template in args.iter().chain(self.env.values()) {
            crate::registry::check_template(template)
                .map_err(|e| format!("Kind '{}': {}", id, e))?;
        }

        if self.health_check_interval_ms == Some(0) {
            return Err(format!(
                "Kind '{}': 'health_check_interval_ms' must be greater than 0",
                id
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_health_interval() -> u64 {
    1000
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Server: 'port' must be greater than 0".to_string());
        }
        if self.defaults.health_check_interval_ms == 0 {
            errors.push("Defaults: 'health_check_interval_ms' must be greater than 0".to_string());
        }

        for (id, kind) in &self.kinds {
            if let Err(e) = kind.validate(id) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
