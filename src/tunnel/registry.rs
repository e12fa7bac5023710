use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::model::{TunnelConfig, validate_local_port};
use crate::error::{Result, TunnelError};
use crate::events::{EventBus, TunnelEvent};
use crate::tunnel::port::PortAllocator;
use crate::tunnel::{Tunnel, TunnelId, TunnelStatus};

struct Entry {
    tunnel: Tunnel,
    /// The local port came from the allocator and goes back on removal.
    allocated_port: bool,
}

/// Authoritative in-memory collection of tunnels.
///
/// The registry alone adds and removes tunnels. Field updates on an existing
/// tunnel go through [`TunnelRegistry::update`], used by the orchestrator and
/// the health monitor for the fields they own.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<TunnelId, Entry>>,
    ports: PortAllocator,
    events: EventBus,
}

impl TunnelRegistry {
    pub fn new(ports: PortAllocator, events: EventBus) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            ports,
            events,
        }
    }

    /// Register a new tunnel, allocating a local port when none is given.
    ///
    /// Only the name and the local port range are checked here. The rest of
    /// the config is validated by `connect()`.
    pub async fn create(&self, name: impl Into<String>, mut config: TunnelConfig) -> Result<Tunnel> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TunnelError::Validation("Tunnel name cannot be empty".into()));
        }

        let mut tunnels = self.tunnels.write().await;
        let in_use: HashSet<u16> = tunnels.values().map(|e| e.tunnel.local_port()).collect();

        let allocated_port = match config.local_port {
            Some(port) => {
                validate_local_port(port)?;
                if in_use.contains(&port) {
                    warn!(port, name = %name, "Local port already used by another tunnel");
                }
                false
            }
            None => {
                config.local_port = Some(self.ports.allocate_excluding(&in_use)?);
                true
            }
        };

        let tunnel = Tunnel::new(name, config);
        info!(
            tunnel_id = %tunnel.id,
            name = %tunnel.name,
            local_port = tunnel.local_port(),
            "Tunnel created"
        );

        tunnels.insert(
            tunnel.id,
            Entry {
                tunnel: tunnel.clone(),
                allocated_port,
            },
        );
        drop(tunnels);

        self.events.publish(TunnelEvent::TunnelCreated {
            tunnel: tunnel.clone(),
        });
        Ok(tunnel)
    }

    pub async fn get(&self, id: TunnelId) -> Option<Tunnel> {
        self.tunnels.read().await.get(&id).map(|e| e.tunnel.clone())
    }

    /// All tunnels, oldest first.
    pub async fn list(&self) -> Vec<Tunnel> {
        let mut tunnels: Vec<Tunnel> = self
            .tunnels
            .read()
            .await
            .values()
            .map(|e| e.tunnel.clone())
            .collect();
        tunnels.sort_by_key(|t| t.created_at);
        tunnels
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }

    pub async fn count_by_status(&self, status: TunnelStatus) -> usize {
        self.tunnels
            .read()
            .await
            .values()
            .filter(|e| e.tunnel.status == status)
            .count()
    }

    /// Mutate fields of an existing tunnel under the write lock.
    pub(crate) async fn update<R>(
        &self,
        id: TunnelId,
        f: impl FnOnce(&mut Tunnel) -> R,
    ) -> Result<R> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels.get_mut(&id).ok_or(TunnelError::NotFound(id))?;
        Ok(f(&mut entry.tunnel))
    }

    /// Remove a tunnel that has no live or pending session.
    ///
    /// Callers disconnect first; a tunnel still `connected` or `connecting`
    /// is refused so a session can never outlive its registry entry.
    pub async fn remove(&self, id: TunnelId) -> Result<Tunnel> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels.get(&id).ok_or(TunnelError::NotFound(id))?;

        let status = entry.tunnel.status;
        if matches!(status, TunnelStatus::Connected | TunnelStatus::Connecting) {
            return Err(TunnelError::Conflict {
                id,
                status,
                operation: "remove",
            });
        }

        let entry = tunnels.remove(&id).ok_or(TunnelError::NotFound(id))?;
        drop(tunnels);

        if entry.allocated_port {
            self.ports.release(entry.tunnel.local_port());
        }
        info!(tunnel_id = %id, name = %entry.tunnel.name, "Tunnel removed");
        self.events.publish(TunnelEvent::TunnelDeleted { id });
        Ok(entry.tunnel)
    }
}
