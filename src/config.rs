use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Complete dispatcher configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and process-level settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool sizing and recycling
    #[serde(default)]
    pub pool: PoolConfig,

    /// External command run for every request
    #[serde(default)]
    pub cgi: CgiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address to listen on, as `host:port` (default: localhost:8888)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Detach from the terminal before starting (default: false)
    #[serde(default)]
    pub daemon: bool,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Directory to change into after daemonizing (default: /tmp)
    #[serde(default = "default_running_dir")]
    pub working_dir: String,
}

impl ServerConfig {
    /// Split `listen` into host and port
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let (host, port) = self.listen.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some((host, port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            daemon: false,
            pid_file: None,
            working_dir: default_running_dir(),
        }
    }
}

/// How workers are realised
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Separate OS processes re-executed from this binary (default)
    #[default]
    Process,
    /// Tasks inside the dispatcher process
    Task,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Number of workers kept alive (default: 2)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Requests a worker serves before it is retired and replaced (default: 100)
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// How long to wait for a worker to acknowledge a dispatch, in milliseconds
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL for a retired worker
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Worker mechanism: "process" (default) or "task"
    #[serde(default)]
    pub mode: WorkerMode,
}

impl PoolConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_requests: default_max_requests(),
            ack_timeout_ms: default_ack_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            mode: WorkerMode::default(),
        }
    }
}

/// The command run once per request
///
/// # Security Warning
///
/// `command` is executed for every inbound request with the permissions of
/// the worker process. Configuration files must be protected with
/// appropriate file permissions.
///
/// `env` values may hold secrets. Process workers receive this table on
/// stdin, never on their command line, so it does not show up in `ps`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CgiConfig {
    /// Command line to execute
    #[serde(default)]
    pub command: String,

    /// Run through `sh -c` (default: true); otherwise split into argv and exec directly
    #[serde(default = "default_shell")]
    pub shell: bool,

    /// Working directory for the command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Give up on a request that has not ended after this many seconds (default: wait forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    /// Extra environment variables for the command
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CgiConfig {
    /// Create a shell command config with defaults
    pub fn shell(command: &str) -> Self {
        Self {
            command: command.to_string(),
            shell: true,
            working_dir: None,
            request_timeout_secs: None,
            env: HashMap::new(),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Program and arguments to execute
    pub fn argv(&self) -> Result<Vec<String>, String> {
        if self.shell {
            return Ok(vec![
                "sh".to_string(),
                "-c".to_string(),
                self.command.clone(),
            ]);
        }
        let words = shell_words::split(&self.command)
            .map_err(|e| format!("cgi.command could not be split: {}", e))?;
        if words.is_empty() {
            return Err("cgi.command contains no program".to_string());
        }
        Ok(words)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.command.trim().is_empty() {
            errors.push("cgi.command is required".to_string());
            return;
        }
        if let Err(e) = self.argv() {
            errors.push(e);
        }
        if self.request_timeout_secs == Some(0) {
            errors.push("cgi.request_timeout_secs must be greater than 0".to_string());
        }
    }
}

impl Default for CgiConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            shell: default_shell(),
            working_dir: None,
            request_timeout_secs: None,
            env: HashMap::new(),
        }
    }
}

// Default value functions
fn default_listen() -> String {
    "localhost:8888".to_string()
}

fn default_running_dir() -> String {
    "/tmp".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_max_requests() -> u64 {
    100
}

fn default_ack_timeout() -> u64 {
    5000 // 5 seconds for a worker to take a connection
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_shell() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.host_port().is_none() {
            errors.push(format!(
                "server.listen '{}' must be of the form host:port",
                self.server.listen
            ));
        }
        if self.pool.workers == 0 {
            errors.push("pool.workers must be greater than 0".to_string());
        }
        if self.pool.max_requests == 0 {
            errors.push("pool.max_requests must be greater than 0".to_string());
        }
        if self.pool.ack_timeout_ms == 0 {
            errors.push("pool.ack_timeout_ms must be greater than 0".to_string());
        }
        self.cgi.validate(&mut errors);

        if !errors.is_empty() {
            return Err(ConfigError(errors));
        }

        Ok(())
    }
}
