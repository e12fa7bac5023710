use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::model::{Settings, TransportKind, TunnelConfig};
use crate::error::Result;
use crate::events::{EventBus, TunnelEvent};
use crate::transport::Transport;
use crate::transport::simulated::SimulatedTransport;
use crate::transport::ssh::SshTransport;
use crate::tunnel::orchestrator::{ConnectionOrchestrator, RetryPolicy};
use crate::tunnel::port::PortAllocator;
use crate::tunnel::registry::TunnelRegistry;
use crate::tunnel::stats::{GlobalStats, StatsAggregator, StatsCounters};
use crate::tunnel::{Tunnel, TunnelId};

/// Build the transport selected in settings.
pub fn transport_for(settings: &Settings) -> Arc<dyn Transport> {
    match settings.transport {
        TransportKind::Ssh => Arc::new(SshTransport::new()),
        TransportKind::Simulated => Arc::new(SimulatedTransport::new(settings.simulated.clone())),
    }
}

/// Owns every tunnel component for one process.
///
/// Construct once, call [`TunnelManager::start`] to begin periodic stats, and
/// [`TunnelManager::shutdown`] to disconnect everything. Must be created
/// inside a tokio runtime.
pub struct TunnelManager {
    settings: Settings,
    events: EventBus,
    registry: Arc<TunnelRegistry>,
    orchestrator: Arc<ConnectionOrchestrator>,
    stats: Arc<StatsAggregator>,
    shutdown: CancellationToken,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelManager {
    pub fn new(settings: Settings, transport: Arc<dyn Transport>) -> Self {
        let events = EventBus::new(settings.event_capacity);
        let registry = Arc::new(TunnelRegistry::new(
            PortAllocator::new(settings.port_base),
            events.clone(),
        ));
        let counters = Arc::new(StatsCounters::new(settings.latency_window));
        let orchestrator = ConnectionOrchestrator::new(
            Arc::clone(&registry),
            transport,
            events.clone(),
            Arc::clone(&counters),
            RetryPolicy::from(&settings),
            Duration::from_millis(settings.health_interval_ms),
        );
        let stats = Arc::new(StatsAggregator::new(
            Arc::clone(&registry),
            counters,
            events.clone(),
            Duration::from_millis(settings.stats_interval_ms),
        ));

        Self {
            settings,
            events,
            registry,
            orchestrator,
            stats,
            shutdown: CancellationToken::new(),
            stats_task: Mutex::new(None),
        }
    }

    /// Build a manager with the transport named in `settings`.
    pub fn from_settings(settings: Settings) -> Self {
        let transport = transport_for(&settings);
        Self::new(settings, transport)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start the periodic stats roll-up. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.stats_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() && !self.shutdown.is_cancelled() {
            *task = Some(Arc::clone(&self.stats).start(self.shutdown.child_token()));
            info!(interval_ms = self.settings.stats_interval_ms, "Stats aggregator started");
        }
    }

    pub async fn create(&self, name: impl Into<String>, config: TunnelConfig) -> Result<Tunnel> {
        self.registry.create(name, config).await
    }

    pub async fn connect(&self, id: TunnelId) -> Result<Tunnel> {
        self.orchestrator.connect(id).await
    }

    pub async fn disconnect(&self, id: TunnelId) -> Result<Tunnel> {
        self.orchestrator.disconnect(id).await
    }

    pub async fn delete(&self, id: TunnelId) -> Result<Tunnel> {
        self.orchestrator.delete(id).await
    }

    pub async fn get(&self, id: TunnelId) -> Option<Tunnel> {
        self.registry.get(id).await
    }

    pub async fn list(&self) -> Vec<Tunnel> {
        self.registry.list().await
    }

    /// Live transport sessions. Zero once every tunnel is down.
    pub async fn open_sessions(&self) -> usize {
        self.orchestrator.open_sessions().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// A fresh snapshot, independent of the periodic loop.
    pub async fn stats(&self) -> GlobalStats {
        self.stats.snapshot().await
    }

    /// Disconnect every tunnel and stop background work.
    pub async fn shutdown(&self) {
        info!("Shutting down tunnel manager");
        self.orchestrator.disconnect_all().await;
        self.shutdown.cancel();

        let task = self
            .stats_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            warn!(error = %e, "Stats task ended abnormally");
        }
    }
}
