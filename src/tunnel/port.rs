use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::config::model::MIN_LOCAL_PORT;
use crate::error::{Result, TunnelError};

/// Hands out candidate local ports, counting up from a base.
///
/// Allocation never binds: whether the port is actually free is only known
/// when the transport binds it at connect time. Released ports go on a
/// free-list and are reused lowest-first before the counter advances.
pub struct PortAllocator {
    base: u16,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    /// Next never-used candidate. `u32` so exhaustion past 65535 is detectable.
    next: u32,
    free: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        let base = base.max(MIN_LOCAL_PORT);
        Self {
            base,
            state: Mutex::new(AllocatorState {
                next: u32::from(base),
                free: BTreeSet::new(),
            }),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Return the next candidate port.
    pub fn allocate(&self) -> Result<u16> {
        self.allocate_excluding(&HashSet::new())
    }

    /// Return the next candidate port that is not in `in_use`.
    ///
    /// Skipped ports are consumed, not returned to the free-list: they belong
    /// to tunnels that chose them explicitly.
    pub fn allocate_excluding(&self, in_use: &HashSet<u16>) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(port) = state.free.pop_first() {
            if !in_use.contains(&port) {
                debug!(port, "Reusing released local port");
                return Ok(port);
            }
        }

        while state.next <= u32::from(u16::MAX) {
            let candidate = state.next as u16;
            state.next += 1;
            if !in_use.contains(&candidate) {
                debug!(port = candidate, "Allocated local port");
                return Ok(candidate);
            }
        }

        Err(TunnelError::PortsExhausted)
    }

    /// Give a previously allocated port back for reuse.
    ///
    /// Ports this allocator never handed out are ignored.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if port >= self.base && u32::from(port) < state.next {
            state.free.insert(port);
        }
    }
}
