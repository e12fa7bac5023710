use thiserror::Error;

use crate::tunnel::{TunnelId, TunnelStatus};

/// Broad failure classes reported to callers.
///
/// `Validation`, `NotFound` and `Conflict` are synchronous and never retried.
/// `Establishment` failures are retried internally and only surface once the
/// retry policy is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Establishment,
    KeyFormat,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    Validation(String),

    #[error("Tunnel {0} not found")]
    NotFound(TunnelId),

    #[error("Tunnel {0} is already connected")]
    AlreadyConnected(TunnelId),

    #[error("Cannot {operation} tunnel {id} while it is {status}")]
    Conflict {
        id: TunnelId,
        status: TunnelStatus,
        operation: &'static str,
    },

    #[error("Failed to establish tunnel: {0}")]
    Establishment(String),

    #[error("Unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("No free local ports left above the allocator base")]
    PortsExhausted,
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Validation(_) | TunnelError::PortsExhausted => ErrorKind::Validation,
            TunnelError::NotFound(_) => ErrorKind::NotFound,
            TunnelError::AlreadyConnected(_) | TunnelError::Conflict { .. } => ErrorKind::Conflict,
            TunnelError::Establishment(_) => ErrorKind::Establishment,
            TunnelError::UnsupportedAlgorithm(_) | TunnelError::InvalidKeyFormat(_) => {
                ErrorKind::KeyFormat
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_connected_is_conflict() {
        let id = TunnelId::new();
        assert_eq!(TunnelError::AlreadyConnected(id).kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_conflict_message_names_operation_and_status() {
        let id = TunnelId::new();
        let err = TunnelError::Conflict {
            id,
            status: TunnelStatus::Connecting,
            operation: "disconnect",
        };
        let msg = err.to_string();
        assert!(msg.contains("disconnect"));
        assert!(msg.contains("connecting"));
    }

    #[test]
    fn test_key_errors_share_kind() {
        assert_eq!(
            TunnelError::UnsupportedAlgorithm("dsa".into()).kind(),
            ErrorKind::KeyFormat
        );
        assert_eq!(
            TunnelError::InvalidKeyFormat("no header".into()).kind(),
            ErrorKind::KeyFormat
        );
    }
}
