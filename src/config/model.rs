use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Characters forbidden in hostnames to prevent shell injection.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
];

/// Lowest local port a tunnel may listen on. Privileged ports are off limits.
pub const MIN_LOCAL_PORT: u16 = 1024;

/// Default SSH connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub tunnels: Vec<TunnelDefinition>,
}

/// Which `Transport` implementation the manager drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Real SSH sessions through russh.
    #[default]
    Ssh,
    /// Randomized synthetic sessions, useful for demos and UI work.
    Simulated,
}

/// Global orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// First port handed out by the local port allocator.
    pub port_base: u16,

    /// Establishment attempts per `connect()` before the tunnel enters `error`.
    pub max_attempts: u32,

    /// Backoff unit. Attempt `n` waits `n * retry_base_delay_ms` before retrying.
    pub retry_base_delay_ms: u64,

    /// Period of each connected tunnel's health sampling loop.
    pub health_interval_ms: u64,

    /// Period of the global statistics roll-up.
    pub stats_interval_ms: u64,

    /// Number of latency samples kept for the rolling average.
    pub latency_window: usize,

    /// Buffered events per subscriber before slow subscribers start lagging.
    pub event_capacity: usize,

    pub transport: TransportKind,

    pub simulated: SimulatedSettings,
}

/// Knobs for the synthetic transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedSettings {
    /// Probability that a single establishment attempt fails.
    pub failure_rate: f64,

    /// Probability per health sample that the link is reported lost.
    pub link_loss_probability: f64,

    pub min_latency_ms: u64,
    pub max_latency_ms: u64,

    /// Upper bound of synthetic bytes reported per probe and direction.
    pub max_bytes_per_probe: u64,
}

/// A named tunnel as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    pub name: String,
    #[serde(flatten)]
    pub config: TunnelConfig,
}

/// Connection descriptor for one tunnel. Immutable once the tunnel exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// SSH server hostname or IP address.
    pub host: String,

    /// SSH server port (not the forwarded target port).
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// SSH username. Falls back to the current OS user.
    pub username: Option<String>,

    #[serde(flatten)]
    pub credentials: Credentials,

    /// Local listening port. `None` lets the registry allocate one.
    pub local_port: Option<u16>,

    /// Forwarding target, as seen from the SSH server.
    pub remote_host: String,
    pub remote_port: u16,

    /// Send SSH keepalives while connected.
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Upper bound for a single establishment attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Authentication material. Password, private key, or both.
///
/// Secret fields are never serialized back out and are redacted from `Debug`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Inline private key (OpenSSH or PEM text).
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,

    /// Path to a private key file (supports ~ and $VAR expansion).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,

    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("password", &redact(&self.password))
            .field("private_key", &redact(&self.private_key))
            .field("identity_file", &self.identity_file)
            .field("passphrase", &redact(&self.passphrase))
            .finish()
    }
}

impl Credentials {
    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            || self
                .identity_file
                .as_deref()
                .is_some_and(|p| !p.trim().is_empty())
    }

    /// Resolve the private key text: inline key first, then the identity file.
    pub fn load_private_key(&self) -> anyhow::Result<Option<String>> {
        if let Some(key) = self.private_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key.clone()));
        }
        match self.resolved_identity_file() {
            Some(path) => {
                let path = path?;
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow!("Failed to read identity file '{path}': {e}"))?;
                Ok(Some(content))
            }
            None => Ok(None),
        }
    }

    /// Resolve identity file path with tilde AND environment variable expansion.
    /// Returns None if the field is not set.
    pub fn resolved_identity_file(&self) -> Option<anyhow::Result<String>> {
        self.identity_file.as_ref().map(|p| {
            shellexpand::full(p)
                .map(|expanded| expanded.to_string())
                .map_err(|e| anyhow!("Failed to expand identity file path '{}': {}", p, e))
        })
    }
}

impl TunnelConfig {
    /// Resolve the effective username: configured value, then the OS user.
    pub fn effective_user(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| whoami::username().to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Check everything `connect()` needs before any state changes.
    pub fn validate(&self) -> Result<(), TunnelError> {
        validate_hostname(&self.host).map_err(TunnelError::Validation)?;

        if self.port == 0 {
            return Err(TunnelError::Validation(
                "SSH port must be between 1 and 65535".into(),
            ));
        }

        if self.effective_user().trim().is_empty() {
            return Err(TunnelError::Validation("Username cannot be empty".into()));
        }

        if !self.credentials.has_password() && !self.credentials.has_private_key() {
            return Err(TunnelError::Validation(
                "Either a password or a private key is required".into(),
            ));
        }

        match self.local_port {
            Some(port) => validate_local_port(port)?,
            None => {
                return Err(TunnelError::Validation(
                    "Local port has not been assigned".into(),
                ));
            }
        }

        validate_hostname(&self.remote_host)
            .map_err(|e| TunnelError::Validation(format!("Forward target: {e}")))?;

        if self.remote_port == 0 {
            return Err(TunnelError::Validation(
                "Remote port must be between 1 and 65535".into(),
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(TunnelError::Validation(
                "Connect timeout must be at least one second".into(),
            ));
        }

        Ok(())
    }
}

/// Local ports must sit in the unprivileged range.
pub fn validate_local_port(port: u16) -> Result<(), TunnelError> {
    if port < MIN_LOCAL_PORT {
        return Err(TunnelError::Validation(format!(
            "Local port {port} out of valid range ({MIN_LOCAL_PORT}-65535)"
        )));
    }
    Ok(())
}

/// Validate that a hostname is present and free of shell metacharacters.
pub fn validate_hostname(host: &str) -> Result<(), String> {
    if host.trim().is_empty() {
        return Err("Hostname cannot be empty".into());
    }

    if let Some(bad_char) = host.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(format!(
            "Hostname '{}' contains forbidden character '{}'",
            host, bad_char
        ));
    }

    Ok(())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port_base: 3000,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            health_interval_ms: 5000,
            stats_interval_ms: 10_000,
            latency_window: 20,
            event_capacity: 256,
            transport: TransportKind::default(),
            simulated: SimulatedSettings::default(),
        }
    }
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            failure_rate: 0.1,
            link_loss_probability: 0.01,
            min_latency_ms: 10,
            max_latency_ms: 120,
            max_bytes_per_probe: 64 * 1024,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
