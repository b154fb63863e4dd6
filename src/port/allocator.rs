//! Conflict-free port allocation within the configured range.
//!
//! All bookkeeping goes through [`PortAllocator`]; the in-memory map is the
//! source of truth for conflicts and is mirrored to the store with
//! reserve-then-commit semantics.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::probe::{PortHold, PortProbe};
use crate::config::PortConfig;
use crate::db::{PortAllocation, PortPurpose, Store, StoreError, SYSTEM_NODE_ID};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port {port} is already allocated to node {node_id}: port already allocated for {purpose}")]
    PortConflict {
        port: u16,
        node_id: i64,
        purpose: PortPurpose,
    },

    #[error("no available ports in range {start}-{end}, {used} ports already used")]
    PortExhaustion { start: u16, end: u16, used: usize },

    #[error("port {port} is outside allowed range {start}-{end}")]
    OutOfRange { port: u16, start: u16, end: u16 },

    #[error("port {port} is not available on system")]
    Unavailable { port: u16 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Snapshot of allocator usage.
#[derive(Debug, Clone, Serialize)]
pub struct PortMetrics {
    pub range_start: u16,
    pub range_end: u16,
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    pub conflict_count: u64,
}

#[derive(Default)]
struct AllocatorState {
    allocations: HashMap<u16, PortAllocation>,
    holds: HashMap<u16, PortHold>,
    conflict_count: u64,
}

impl AllocatorState {
    fn used_in_range(&self, range: &PortConfig) -> usize {
        self.allocations.keys().filter(|p| range.contains(**p)).count()
    }
}

pub struct PortAllocator {
    range: PortConfig,
    store: Arc<Store>,
    probe: Arc<dyn PortProbe>,
    state: RwLock<AllocatorState>,
}

impl PortAllocator {
    pub fn new(range: PortConfig, store: Arc<Store>, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            range,
            store,
            probe,
            state: RwLock::new(AllocatorState::default()),
        }
    }

    pub fn range(&self) -> &PortConfig {
        &self.range
    }

    /// Rebuild the in-memory map from active rows. Returns how many were loaded.
    pub async fn restore(&self) -> Result<usize, PortError> {
        let rows = self.store.active_port_allocations().await?;
        let mut state = self.state.write().await;
        state.allocations.clear();
        state.holds.clear();

        for allocation in rows {
            if !self.range.contains(allocation.port) {
                warn!(
                    port = allocation.port,
                    node_id = allocation.node_id,
                    "Active allocation outside configured range, ignoring"
                );
                continue;
            }
            state.allocations.insert(allocation.port, allocation);
        }

        let loaded = state.allocations.len();
        info!(loaded, start = self.range.start, end = self.range.end, "Restored port allocations");
        Ok(loaded)
    }

    /// First free port in the range, ascending.
    pub async fn allocate_port(&self, node_id: i64, purpose: PortPurpose) -> Result<u16, PortError> {
        let (allocation, hold) = {
            let mut state = self.state.write().await;
            let mut found = None;
            for port in self.range.start..=self.range.end {
                if state.allocations.contains_key(&port) {
                    continue;
                }
                match self.probe.acquire(port) {
                    Ok(hold) => {
                        found = Some((port, hold));
                        break;
                    }
                    Err(e) => debug!(port, error = %e, "Port busy on system, skipping"),
                }
            }

            let Some((port, hold)) = found else {
                return Err(PortError::PortExhaustion {
                    start: self.range.start,
                    end: self.range.end,
                    used: state.used_in_range(&self.range),
                });
            };

            let allocation = PortAllocation::new(port, node_id, purpose);
            state.allocations.insert(port, allocation.clone());
            (allocation, hold)
        };

        self.commit(allocation, hold).await
    }

    /// Allocate exactly `port`.
    pub async fn allocate_specific_port(
        &self,
        port: u16,
        node_id: i64,
        purpose: PortPurpose,
    ) -> Result<u16, PortError> {
        if !self.range.contains(port) {
            return Err(PortError::OutOfRange {
                port,
                start: self.range.start,
                end: self.range.end,
            });
        }

        let (allocation, hold) = {
            let mut state = self.state.write().await;
            if let Some(existing) = state.allocations.get(&port) {
                let err = PortError::PortConflict {
                    port,
                    node_id: existing.node_id,
                    purpose: existing.purpose,
                };
                state.conflict_count += 1;
                return Err(err);
            }

            let hold = self
                .probe
                .acquire(port)
                .map_err(|_| PortError::Unavailable { port })?;

            let allocation = PortAllocation::new(port, node_id, purpose);
            state.allocations.insert(port, allocation.clone());
            (allocation, hold)
        };

        self.commit(allocation, hold).await
    }

    /// Persist a reservation, rolling it back from memory if the write fails.
    async fn commit(&self, allocation: PortAllocation, hold: PortHold) -> Result<u16, PortError> {
        let port = allocation.port;
        if let Err(e) = self.store.insert_port_allocation(&allocation).await {
            let mut state = self.state.write().await;
            state.allocations.remove(&port);
            warn!(port, error = %e, "Failed to persist port allocation, rolled back");
            return Err(e.into());
        }

        if self.range.hold_sockets && hold.is_bound() {
            self.state.write().await.holds.insert(port, hold);
        }

        info!(
            port,
            node_id = allocation.node_id,
            purpose = %allocation.purpose,
            "Allocated port"
        );
        Ok(port)
    }

    /// Release `port`. Releasing an untracked port is a no-op.
    pub async fn release_port(&self, port: u16) -> Result<bool, PortError> {
        let removed = {
            let mut state = self.state.write().await;
            state.holds.remove(&port);
            state.allocations.remove(&port)
        };

        match self.store.release_port_allocation(port, Utc::now()).await {
            Ok(updated) => {
                if removed.is_some() || updated {
                    info!(port, "Released port");
                }
                Ok(removed.is_some() || updated)
            }
            Err(e) => {
                if let Some(allocation) = removed {
                    self.state.write().await.allocations.insert(port, allocation);
                }
                Err(e.into())
            }
        }
    }

    /// Release every port held by `node_id`. Returns the released ports.
    pub async fn release_ports_by_node(&self, node_id: i64) -> Result<Vec<u16>, PortError> {
        let ports = self.node_ports(node_id).await;
        for port in &ports {
            self.release_port(*port).await?;
        }
        Ok(ports)
    }

    /// Transfer an allocation to another node.
    pub async fn assign_owner(&self, port: u16, node_id: i64) -> Result<(), PortError> {
        let previous = {
            let mut state = self.state.write().await;
            match state.allocations.get_mut(&port) {
                Some(allocation) => std::mem::replace(&mut allocation.node_id, node_id),
                None => return Err(StoreError::NotFound(format!("allocation for port {}", port)).into()),
            }
        };

        if let Err(e) = self.store.reassign_port_allocation(port, node_id).await {
            if let Some(allocation) = self.state.write().await.allocations.get_mut(&port) {
                allocation.node_id = previous;
            }
            return Err(e.into());
        }
        debug!(port, from = previous, to = node_id, "Reassigned port");
        Ok(())
    }

    /// Record OS-bound ports the allocator does not know about as system-owned.
    pub async fn scan_and_record_used_ports(&self) -> Result<usize, PortError> {
        let busy: Vec<PortAllocation> = {
            let mut state = self.state.write().await;
            let mut busy = Vec::new();
            for port in self.range.start..=self.range.end {
                if state.allocations.contains_key(&port) {
                    continue;
                }
                if self.probe.acquire(port).is_err() {
                    let allocation = PortAllocation::new(port, SYSTEM_NODE_ID, PortPurpose::System);
                    state.allocations.insert(port, allocation.clone());
                    busy.push(allocation);
                }
            }
            busy
        };

        let mut recorded = 0;
        for allocation in busy {
            let port = allocation.port;
            match self.store.insert_port_allocation(&allocation).await {
                Ok(()) => recorded += 1,
                Err(e) => {
                    self.state.write().await.allocations.remove(&port);
                    warn!(port, error = %e, "Failed to record system port");
                }
            }
        }

        info!(recorded, "Recorded ports in use by the system");
        Ok(recorded)
    }

    /// True if `port` is in range and not tracked.
    pub async fn is_port_available(&self, port: u16) -> bool {
        self.range.contains(port) && !self.state.read().await.allocations.contains_key(&port)
    }

    pub async fn used_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.state.read().await.allocations.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub async fn port_allocation(&self, port: u16) -> Option<PortAllocation> {
        self.state.read().await.allocations.get(&port).cloned()
    }

    pub async fn node_ports(&self, node_id: i64) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .state
            .read()
            .await
            .allocations
            .values()
            .filter(|a| a.node_id == node_id)
            .map(|a| a.port)
            .collect();
        ports.sort_unstable();
        ports
    }

    pub async fn allocations(&self) -> Vec<PortAllocation> {
        let mut allocations: Vec<PortAllocation> =
            self.state.read().await.allocations.values().cloned().collect();
        allocations.sort_by_key(|a| a.port);
        allocations
    }

    pub async fn available_count(&self) -> usize {
        let state = self.state.read().await;
        self.range.size() - state.used_in_range(&self.range)
    }

    pub async fn metrics(&self) -> PortMetrics {
        let state = self.state.read().await;
        let allocated = state.used_in_range(&self.range);
        PortMetrics {
            range_start: self.range.start,
            range_end: self.range.end,
            total: self.range.size(),
            allocated,
            available: self.range.size() - allocated,
            conflict_count: state.conflict_count,
        }
    }
}
