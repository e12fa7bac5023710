//! Global statistics roll-up.
//!
//! `StatsCounters` holds the monotonic counters fed by the orchestrator and
//! the health monitors. `StatsAggregator` combines them with a registry scan
//! into a [`GlobalStats`] snapshot and publishes it on a fixed interval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{EventBus, TunnelEvent};
use crate::tunnel::registry::TunnelRegistry;
use crate::tunnel::TunnelStatus;

/// Derived snapshot. Always recomputed, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalStats {
    pub total_tunnels: usize,
    pub active_tunnels: usize,
    pub total_bytes_transferred: u64,
    pub total_connections: u64,
    pub average_latency_ms: f64,
    pub connection_errors: u64,
}

/// Process-wide counters shared by every tunnel.
pub struct StatsCounters {
    bytes_transferred: AtomicU64,
    connections: AtomicU64,
    connection_errors: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl StatsCounters {
    pub fn new(latency_window: usize) -> Self {
        let capacity = latency_window.max(1);
        Self {
            bytes_transferred: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow {
                samples: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Counted once per failed `connect()`, not per attempt.
    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, sample: Duration) {
        let mut window = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if window.samples.len() == window.capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(sample);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    /// Mean of the retained latency samples, 0 when there are none.
    pub fn average_latency_ms(&self) -> f64 {
        let window = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if window.samples.is_empty() {
            return 0.0;
        }
        let total: f64 = window.samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        total / window.samples.len() as f64
    }
}

impl Default for StatsCounters {
    fn default() -> Self {
        Self::new(20)
    }
}

pub struct StatsAggregator {
    registry: Arc<TunnelRegistry>,
    counters: Arc<StatsCounters>,
    events: EventBus,
    interval: Duration,
}

impl StatsAggregator {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        counters: Arc<StatsCounters>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            counters,
            events,
            interval,
        }
    }

    /// Recompute the global snapshot from a single registry scan.
    pub async fn snapshot(&self) -> GlobalStats {
        let tunnels = self.registry.list().await;
        let active = tunnels
            .iter()
            .filter(|t| t.status == TunnelStatus::Connected)
            .count();

        GlobalStats {
            total_tunnels: tunnels.len(),
            active_tunnels: active,
            total_bytes_transferred: self.counters.bytes_transferred(),
            total_connections: self.counters.connections(),
            average_latency_ms: self.counters.average_latency_ms(),
            connection_errors: self.counters.connection_errors(),
        }
    }

    /// Compute and publish one snapshot.
    pub async fn tick(&self) -> GlobalStats {
        let stats = self.snapshot().await;
        debug!(
            total = stats.total_tunnels,
            active = stats.active_tunnels,
            bytes = stats.total_bytes_transferred,
            errors = stats.connection_errors,
            "Stats tick"
        );
        self.events.publish(TunnelEvent::StatsUpdated {
            stats: stats.clone(),
        });
        stats
    }

    /// Run the periodic roll-up until `shutdown` is cancelled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Stats aggregator shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }
}
