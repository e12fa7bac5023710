pub mod monitor;
pub mod orchestrator;
pub mod port;
pub mod registry;
pub mod stats;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::model::TunnelConfig;

/// Opaque tunnel identifier. Generated at creation and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(Uuid);

impl TunnelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TunnelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Disconnected => write!(f, "disconnected"),
            TunnelStatus::Connecting => write!(f, "connecting"),
            TunnelStatus::Connected => write!(f, "connected"),
            TunnelStatus::Error => write!(f, "error"),
        }
    }
}

/// A managed mapping from a local port to a remote host:port.
///
/// Membership is owned by [`registry::TunnelRegistry`]. Status, timestamps and
/// `last_error` are written only by the orchestrator; byte counters only by
/// the health monitor while the tunnel is connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub name: String,
    pub config: TunnelConfig,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Successful connects over the tunnel's lifetime.
    pub connection_count: u64,
}

impl Tunnel {
    pub(crate) fn new(name: String, config: TunnelConfig) -> Self {
        Self {
            id: TunnelId::new(),
            name,
            config,
            status: TunnelStatus::Disconnected,
            created_at: Utc::now(),
            connected_at: None,
            last_error: None,
            bytes_sent: 0,
            bytes_received: 0,
            connection_count: 0,
        }
    }

    /// Local listening port. Always assigned once the tunnel is registered.
    pub fn local_port(&self) -> u16 {
        self.config.local_port.unwrap_or_default()
    }

    /// Address external clients use while the tunnel is connected.
    pub fn local_address(&self) -> String {
        format!("localhost:{}", self.local_port())
    }

    pub fn is_connected(&self) -> bool {
        self.status == TunnelStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Credentials;

    fn sample_tunnel() -> Tunnel {
        Tunnel::new(
            "postgres".into(),
            TunnelConfig {
                host: "bastion".into(),
                port: 22,
                username: Some("deploy".into()),
                credentials: Credentials::default(),
                local_port: Some(5433),
                remote_host: "db".into(),
                remote_port: 5432,
                keep_alive: true,
                connect_timeout_secs: 15,
            },
        )
    }

    #[test]
    fn test_new_tunnel_is_disconnected() {
        let tunnel = sample_tunnel();
        assert_eq!(tunnel.status, TunnelStatus::Disconnected);
        assert!(tunnel.connected_at.is_none());
        assert_eq!(tunnel.connection_count, 0);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(sample_tunnel().id, sample_tunnel().id);
    }

    #[test]
    fn test_local_address() {
        assert_eq!(sample_tunnel().local_address(), "localhost:5433");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TunnelStatus::Disconnected.to_string(), "disconnected");
        assert_eq!(TunnelStatus::Connecting.to_string(), "connecting");
        assert_eq!(TunnelStatus::Connected.to_string(), "connected");
        assert_eq!(TunnelStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TunnelStatus::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
    }

    #[test]
    fn test_tunnel_id_parse_roundtrip() {
        let id = TunnelId::new();
        let parsed: TunnelId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
