//! Lifecycle and metric events.
//!
//! Built on a `tokio::sync::broadcast` channel: every subscriber gets its own
//! receiver and sees every event published after it subscribed. Publishing
//! never blocks and never fails when nobody is listening.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::tunnel::stats::GlobalStats;
use crate::tunnel::{Tunnel, TunnelId};

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TunnelEvent {
    TunnelCreated { tunnel: Tunnel },
    /// Any status transition, including into `connecting`.
    TunnelStatusChanged { tunnel: Tunnel },
    TunnelDeleted { id: TunnelId },
    StatsUpdated { stats: GlobalStats },
}

impl TunnelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TunnelEvent::TunnelCreated { .. } => "tunnel-created",
            TunnelEvent::TunnelStatusChanged { .. } => "tunnel-status-changed",
            TunnelEvent::TunnelDeleted { .. } => "tunnel-deleted",
            TunnelEvent::StatsUpdated { .. } => "stats-updated",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TunnelEvent) {
        trace!(event = event.name(), "Publishing event");
        // An error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
