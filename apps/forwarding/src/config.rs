//! Configuration model and discovery for the forwarder.
//!
//! The configuration is a YAML file listing SSH servers, each carrying the
//! forwarding rules that tunnel through it. It is searched for in a fixed set
//! of places unless a path is given explicitly.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ForwardingError;

// ============================================================================
// Environment variable names
// ============================================================================

mod env {
    pub const CONFIG_PATH: &str = "FORWARDING_CONFIG";
    pub const HOME: &str = "HOME";
    pub const USER_PROFILE: &str = "USERPROFILE";
}

/// File names tried in every search directory, in order
const CONFIG_FILE_NAMES: [&str; 2] = ["forwarding.yaml", "forwarding.yml"];

/// Directory under the user's home holding the configuration
const HOME_CONFIG_DIR: &str = ".ssh-forwarding";

/// Address substituted for an empty `local_host`
pub const WILDCARD_HOST: &str = "0.0.0.0";

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_LOG_LEVEL: &str = "info";

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Status API, disabled when absent
    #[serde(default)]
    pub management: Option<ManagementConfig>,
    #[serde(default)]
    pub ssh_servers: Vec<SshServerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagementConfig {
    /// Bind address of the management API, e.g. "127.0.0.1:7070"
    pub listen: String,
}

/// An SSH server and the forwarding rules tunnelled through it.
#[derive(Clone, Deserialize)]
pub struct SshServerSpec {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Expected SHA-256 host key fingerprint ("SHA256:..."); any key is
    /// accepted when unset
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub forwardings: Vec<ForwardingRule>,
}

impl SshServerSpec {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl fmt::Debug for SshServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshServerSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("forwardings", &self.forwardings)
            .finish()
    }
}

/// A local listen address paired with the remote target it forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardingRule {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardingRule {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Fill in the wildcard local host and a label when they are missing.
    pub fn resolve(&mut self) {
        if self.local_host.trim().is_empty() {
            self.local_host = WILDCARD_HOST.to_string();
        }
        if self.label.trim().is_empty() {
            self.label = format!("{}->{}", self.local_port, self.remote_addr());
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Parse, resolve defaults and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ForwardingError> {
        let mut config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ForwardingError::Config(e.to_string()))?;
        config.resolve();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ForwardingError> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ForwardingError::Config(format!("read {} failed: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    fn resolve(&mut self) {
        for server in &mut self.ssh_servers {
            for rule in &mut server.forwardings {
                rule.resolve();
            }
        }
    }

    fn validate(&self) -> Result<(), ForwardingError> {
        let mut bound = HashSet::new();
        let mut labels = HashSet::new();
        for server in &self.ssh_servers {
            if server.host.trim().is_empty() {
                return Err(ForwardingError::Config("ssh server host is empty".to_string()));
            }
            if server.username.trim().is_empty() {
                return Err(ForwardingError::Config(format!(
                    "ssh server {} has no username",
                    server.addr()
                )));
            }
            if server.connect_timeout_secs == 0 {
                return Err(ForwardingError::Config(format!(
                    "ssh server {} has a zero connect timeout",
                    server.addr()
                )));
            }
            for rule in &server.forwardings {
                if rule.local_port == 0 || rule.remote_port == 0 {
                    return Err(ForwardingError::Config(format!(
                        "forwarding [{}] needs non-zero local and remote ports",
                        rule.label
                    )));
                }
                if rule.remote_host.trim().is_empty() {
                    return Err(ForwardingError::Config(format!(
                        "forwarding [{}] has no remote host",
                        rule.label
                    )));
                }
                if !labels.insert(rule.label.as_str()) {
                    return Err(ForwardingError::Config(format!(
                        "label [{}] is used by more than one forwarding",
                        rule.label
                    )));
                }
                if !bound.insert(rule.local_addr()) {
                    return Err(ForwardingError::Config(format!(
                        "local address {} is used by more than one forwarding",
                        rule.local_addr()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every (server, rule) pair in configuration order.
    pub fn forwardings(&self) -> impl Iterator<Item = (&SshServerSpec, &ForwardingRule)> {
        self.ssh_servers
            .iter()
            .flat_map(|server| server.forwardings.iter().map(move |rule| (server, rule)))
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Locate the configuration file.
///
/// An explicit path wins, then `FORWARDING_CONFIG`, then the first
/// `forwarding.yaml`/`forwarding.yml` found in the working directory, the
/// executable's directory and `~/.ssh-forwarding`.
pub fn search_config_file(explicit: Option<PathBuf>) -> Result<PathBuf, ForwardingError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Ok(path) = std::env::var(env::CONFIG_PATH) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let mut dirs = vec![PathBuf::new()];
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(dir);
    }
    if let Some(home) = home_dir() {
        dirs.push(home.join(HOME_CONFIG_DIR));
    }

    search_in_dirs(&dirs).ok_or_else(|| ForwardingError::Config("config file not found".to_string()))
}

fn search_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os(env::HOME)
        .or_else(|| std::env::var_os(env::USER_PROFILE))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}
