//! Supervise many independent SSH port-forwarding tunnels.
//!
//! [`manager::TunnelManager`] is the entry point: it owns the registry, the
//! connection orchestrator, per-tunnel health monitors and the global stats
//! loop, and publishes every lifecycle change on an event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod manager;
pub mod transport;
pub mod tunnel;

pub use error::{ErrorKind, Result, TunnelError};
pub use manager::TunnelManager;
