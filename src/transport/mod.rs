//! Pluggable secure-session capability.
//!
//! The orchestrator only ever talks to a [`Transport`]. `ssh` drives real
//! sessions through russh; `simulated` produces synthetic outcomes.

pub mod simulated;
pub mod ssh;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::model::TunnelConfig;

/// Opaque reference to a session owned by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// One health sample: traffic since the previous probe and a round-trip time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSample {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Local port {0} is already in use")]
    PortInUse(u16),

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("Session error: {0}")]
    Session(String),
}

impl TransportError {
    /// Network-class failures may heal between attempts. A taken local port
    /// or rejected credentials will not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::PortInUse(_) | TransportError::Auth(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open and authenticate a session.
    async fn establish(&self, config: &TunnelConfig) -> Result<SessionHandle, TransportError>;

    /// Start forwarding `127.0.0.1:local_port` to `remote_host:remote_port`.
    async fn bind_forward(
        &self,
        handle: SessionHandle,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError>;

    /// Release the session and its local listener. Unknown handles are ignored.
    async fn close(&self, handle: SessionHandle);

    /// Sample traffic and liveness. An error means the link is gone.
    async fn probe(&self, handle: SessionHandle) -> Result<ProbeSample, TransportError>;
}
