//! Connection state machine.
//!
//! ```text
//! disconnected/error --connect()--> connecting --ok--> connected
//!                                        |                 |
//!                                        +--exhausted--> error
//!                                                          |
//! connected --disconnect() or fatal report--> disconnected
//! ```
//!
//! The orchestrator is the only writer of `status`, `connected_at`,
//! `last_error` and `connection_count`. A connect against a tunnel that is
//! already `connecting` or `connected` is rejected, never queued, so at most
//! one lifecycle operation is in flight per tunnel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::model::{Settings, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::events::{EventBus, TunnelEvent};
use crate::transport::{SessionHandle, Transport, TransportError};
use crate::tunnel::monitor::{FatalReport, HealthMonitor, MonitorHandle};
use crate::tunnel::registry::TunnelRegistry;
use crate::tunnel::stats::StatsCounters;
use crate::tunnel::{Tunnel, TunnelId, TunnelStatus};

/// Linear backoff: attempt `n` is followed by a wait of `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&Settings> for RetryPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
        }
    }
}

struct ActiveSession {
    handle: SessionHandle,
    generation: u64,
    monitor: MonitorHandle,
}

pub struct ConnectionOrchestrator {
    registry: Arc<TunnelRegistry>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    counters: Arc<StatsCounters>,
    policy: RetryPolicy,
    health_interval: Duration,
    sessions: Mutex<HashMap<TunnelId, ActiveSession>>,
    generation: AtomicU64,
    fatal_tx: mpsc::UnboundedSender<FatalReport>,
    /// Parent of every monitor token. Cancelled on drop.
    root: CancellationToken,
}

impl ConnectionOrchestrator {
    /// Build the orchestrator and spawn its fatal-report listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<TunnelRegistry>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        counters: Arc<StatsCounters>,
        policy: RetryPolicy,
        health_interval: Duration,
    ) -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            registry,
            transport,
            events,
            counters,
            policy,
            health_interval,
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            fatal_tx,
            root: CancellationToken::new(),
        });
        tokio::spawn(Self::listen_for_fatal(
            Arc::downgrade(&orchestrator),
            fatal_rx,
            orchestrator.root.clone(),
        ));
        orchestrator
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Number of live transport sessions this orchestrator owns.
    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Validate, move to `connecting`, then establish with retry.
    ///
    /// Establishment runs on its own task. Dropping the returned future stops
    /// the wait, not the attempt: the tunnel still ends up `connected` or
    /// `error`, and a session opened along the way is either promoted or
    /// closed.
    pub async fn connect(self: &Arc<Self>, id: TunnelId) -> Result<Tunnel> {
        let tunnel = self.registry.get(id).await.ok_or(TunnelError::NotFound(id))?;
        check_connectable(&tunnel)?;
        tunnel.config.validate()?;

        // Re-check under the write lock so two callers cannot both start.
        let tunnel = self
            .registry
            .update(id, |t| {
                check_connectable(t)?;
                t.status = TunnelStatus::Connecting;
                Ok::<_, TunnelError>(t.clone())
            })
            .await??;
        info!(tunnel_id = %id, name = %tunnel.name, "Connecting tunnel");
        self.publish_status(tunnel.clone());

        let orchestrator = Arc::clone(self);
        let config = tunnel.config;
        let task = tokio::spawn(async move {
            match orchestrator.establish_with_retry(id, &config).await {
                Ok(handle) => orchestrator.promote(id, handle).await,
                Err(e) => orchestrator.fail_connect(id, e.to_string()).await,
            }
        });

        match task.await {
            Ok(result) => result,
            Err(e) => self.fail_connect(id, format!("Connect task ended abnormally: {e}")).await,
        }
    }

    /// Move a `connecting` tunnel to `error` and count one connection error.
    async fn fail_connect(&self, id: TunnelId, message: String) -> Result<Tunnel> {
        self.counters.record_connection_error();
        let tunnel = self
            .registry
            .update(id, |t| {
                t.status = TunnelStatus::Error;
                t.connected_at = None;
                t.last_error = Some(message.clone());
                t.clone()
            })
            .await?;
        error!(tunnel_id = %id, error = %message, "Tunnel failed to connect");
        self.publish_status(tunnel);
        Err(TunnelError::Establishment(message))
    }

    /// Idempotent: a tunnel without a live session is returned unchanged.
    pub async fn disconnect(&self, id: TunnelId) -> Result<Tunnel> {
        let tunnel = self.registry.get(id).await.ok_or(TunnelError::NotFound(id))?;
        match tunnel.status {
            TunnelStatus::Disconnected | TunnelStatus::Error => return Ok(tunnel),
            TunnelStatus::Connecting => {
                return Err(TunnelError::Conflict {
                    id,
                    status: tunnel.status,
                    operation: "disconnect",
                });
            }
            TunnelStatus::Connected => {}
        }

        match self.teardown(id, None, None).await? {
            Some(tunnel) => Ok(tunnel),
            // Another path tore the session down first.
            None => self.registry.get(id).await.ok_or(TunnelError::NotFound(id)),
        }
    }

    /// Disconnect if needed, then remove from the registry.
    pub async fn delete(&self, id: TunnelId) -> Result<Tunnel> {
        let tunnel = self.registry.get(id).await.ok_or(TunnelError::NotFound(id))?;
        match tunnel.status {
            TunnelStatus::Connecting => {
                return Err(TunnelError::Conflict {
                    id,
                    status: tunnel.status,
                    operation: "delete",
                });
            }
            TunnelStatus::Connected => {
                self.disconnect(id).await?;
            }
            TunnelStatus::Disconnected | TunnelStatus::Error => {}
        }
        self.registry.remove(id).await
    }

    /// Tear down every live session. Used on service shutdown.
    pub async fn disconnect_all(&self) {
        let ids: Vec<TunnelId> = self.sessions.lock().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.teardown(id, None, None).await {
                warn!(tunnel_id = %id, error = %e, "Failed to disconnect tunnel during shutdown");
            }
        }
    }

    async fn establish_with_retry(
        &self,
        id: TunnelId,
        config: &TunnelConfig,
    ) -> std::result::Result<SessionHandle, TransportError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.attempt(config).await {
                Ok(handle) => return Ok(handle),
                Err(e) => e,
            };

            warn!(
                tunnel_id = %id,
                attempt,
                max_attempts = attempts,
                error = %err,
                "Establishment attempt failed"
            );

            if !err.is_retryable() || attempt >= attempts {
                return Err(err);
            }

            let delay = self.policy.delay_after(attempt);
            debug!(tunnel_id = %id, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One establish + bind, bounded by the tunnel's connect timeout.
    /// A session opened by a failed attempt is always closed.
    async fn attempt(&self, config: &TunnelConfig) -> std::result::Result<SessionHandle, TransportError> {
        let deadline = Instant::now() + config.connect_timeout();
        let timed_out = || {
            TransportError::Timeout(format!(
                "{}:{} did not complete within {}s",
                config.host, config.port, config.connect_timeout_secs
            ))
        };

        let handle = tokio::time::timeout_at(deadline, self.transport.establish(config))
            .await
            .map_err(|_| timed_out())??;

        let local_port = config.local_port.unwrap_or_default();
        let bound = tokio::time::timeout_at(
            deadline,
            self.transport
                .bind_forward(handle, local_port, &config.remote_host, config.remote_port),
        )
        .await;

        let err = match bound {
            Ok(Ok(())) => return Ok(handle),
            Ok(Err(e)) => e,
            Err(_) => timed_out(),
        };
        self.transport.close(handle).await;
        Err(err)
    }

    async fn promote(&self, id: TunnelId, handle: SessionHandle) -> Result<Tunnel> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        // Held until the session is recorded so a disconnect cannot observe
        // `connected` without finding the session.
        let mut sessions = self.sessions.lock().await;
        let tunnel = match self
            .registry
            .update(id, |t| {
                t.status = TunnelStatus::Connected;
                t.connected_at = Some(Utc::now());
                t.last_error = None;
                t.connection_count += 1;
                t.clone()
            })
            .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                drop(sessions);
                self.transport.close(handle).await;
                return Err(e);
            }
        };
        self.counters.record_connection();

        let monitor = HealthMonitor {
            id,
            handle,
            generation,
            interval: self.health_interval,
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&self.transport),
            counters: Arc::clone(&self.counters),
            fatal_tx: self.fatal_tx.clone(),
        }
        .spawn(self.root.child_token());

        sessions.insert(
            id,
            ActiveSession {
                handle,
                generation,
                monitor,
            },
        );
        drop(sessions);

        info!(
            tunnel_id = %id,
            name = %tunnel.name,
            address = %tunnel.local_address(),
            "Tunnel connected"
        );
        self.publish_status(tunnel.clone());
        Ok(tunnel)
    }

    /// Stop the monitor, close the session, then mark the tunnel disconnected.
    ///
    /// With `generation` set, only a session of that generation is torn down.
    /// Returns `None` when there was nothing to tear down.
    async fn teardown(
        &self,
        id: TunnelId,
        generation: Option<u64>,
        reason: Option<String>,
    ) -> Result<Option<Tunnel>> {
        let active = {
            let mut sessions = self.sessions.lock().await;
            let current = sessions.get(&id).map(|a| a.generation);
            match current {
                Some(live) if generation.is_none_or(|g| g == live) => sessions.remove(&id),
                _ => None,
            }
        };
        let Some(active) = active else {
            return Ok(None);
        };

        active.monitor.stop().await;
        self.transport.close(active.handle).await;

        let tunnel = self
            .registry
            .update(id, |t| {
                t.status = TunnelStatus::Disconnected;
                t.connected_at = None;
                if let Some(reason) = reason {
                    t.last_error = Some(reason);
                }
                t.clone()
            })
            .await?;

        info!(tunnel_id = %id, name = %tunnel.name, "Tunnel disconnected");
        self.publish_status(tunnel.clone());
        Ok(Some(tunnel))
    }

    async fn listen_for_fatal(
        orchestrator: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<FatalReport>,
        shutdown: CancellationToken,
    ) {
        loop {
            let report = tokio::select! {
                _ = shutdown.cancelled() => break,
                report = rx.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };

            warn!(tunnel_id = %report.id, reason = %report.reason, "Forcing disconnect");
            match orchestrator
                .teardown(report.id, Some(report.generation), Some(report.reason))
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => debug!(tunnel_id = %report.id, "Ignoring stale fatal report"),
                Err(e) => warn!(tunnel_id = %report.id, error = %e, "Forced disconnect failed"),
            }
        }
    }

    fn publish_status(&self, tunnel: Tunnel) {
        self.events
            .publish(TunnelEvent::TunnelStatusChanged { tunnel });
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn check_connectable(tunnel: &Tunnel) -> Result<()> {
    match tunnel.status {
        TunnelStatus::Connected => Err(TunnelError::AlreadyConnected(tunnel.id)),
        TunnelStatus::Connecting => Err(TunnelError::Conflict {
            id: tunnel.id,
            status: tunnel.status,
            operation: "connect",
        }),
        TunnelStatus::Disconnected | TunnelStatus::Error => Ok(()),
    }
}
