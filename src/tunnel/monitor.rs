//! Per-tunnel health sampling.
//!
//! One loop per connected tunnel. Every tick it re-checks that the tunnel is
//! still `connected`, probes the transport and folds the sample into the
//! tunnel's byte counters and the global stats. A failed probe is reported to
//! the orchestrator, which performs the forced disconnect; the monitor never
//! changes tunnel status itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{SessionHandle, Transport};
use crate::tunnel::registry::TunnelRegistry;
use crate::tunnel::stats::StatsCounters;
use crate::tunnel::{TunnelId, TunnelStatus};

/// A monitor's request to force a tunnel down.
#[derive(Debug, Clone)]
pub(crate) struct FatalReport {
    pub id: TunnelId,
    /// Session generation the monitor was watching. Stale reports are ignored.
    pub generation: u64,
    pub reason: String,
}

pub(crate) struct HealthMonitor {
    pub id: TunnelId,
    pub handle: SessionHandle,
    pub generation: u64,
    pub interval: Duration,
    pub registry: Arc<TunnelRegistry>,
    pub transport: Arc<dyn Transport>,
    pub counters: Arc<StatsCounters>,
    pub fatal_tx: mpsc::UnboundedSender<FatalReport>,
}

/// Cancellable handle to a running monitor loop.
pub(crate) struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the loop and wait until it has fully exited.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
    }
}

impl HealthMonitor {
    pub fn spawn(self, cancel: CancellationToken) -> MonitorHandle {
        let task = tokio::spawn(self.run(cancel.clone()));
        MonitorHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(tunnel_id = %self.id, handle = %self.handle, "Health monitor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let connected = self
                .registry
                .get(self.id)
                .await
                .is_some_and(|t| t.status == TunnelStatus::Connected);
            if !connected {
                debug!(tunnel_id = %self.id, "Tunnel no longer connected, monitor exiting");
                break;
            }

            let probed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                probed = self.transport.probe(self.handle) => probed,
            };

            match probed {
                Ok(sample) => {
                    let applied = self
                        .registry
                        .update(self.id, |t| {
                            if t.status != TunnelStatus::Connected {
                                return false;
                            }
                            t.bytes_sent += sample.bytes_sent;
                            t.bytes_received += sample.bytes_received;
                            true
                        })
                        .await
                        .unwrap_or(false);

                    if !applied {
                        break;
                    }
                    self.counters
                        .record_bytes(sample.bytes_sent + sample.bytes_received);
                    if let Some(latency) = sample.latency {
                        self.counters.record_latency(latency);
                    }
                }
                Err(e) => {
                    warn!(tunnel_id = %self.id, error = %e, "Health probe failed, requesting disconnect");
                    let report = FatalReport {
                        id: self.id,
                        generation: self.generation,
                        reason: e.to_string(),
                    };
                    if self.fatal_tx.send(report).is_err() {
                        debug!(tunnel_id = %self.id, "Orchestrator gone, dropping fatal report");
                    }
                    break;
                }
            }
        }

        debug!(tunnel_id = %self.id, "Health monitor stopped");
    }
}
