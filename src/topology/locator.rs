//! Consistent key-to-node routing.
//!
//! The locator publishes a [`RoutingSnapshot`], the current config paired
//! with the node map built for exactly that config, as one immutable unit.
//! Readers grab the current `Arc` and route against it; the monitor replaces
//! the whole snapshot on significant topology changes. A reader therefore
//! never observes a config paired with a mismatched node map.
//!
//! Routing decisions in flight when a swap happens may still complete
//! against the old node; the server answers "not responsible" and the caller
//! resubmits via [`VBucketLocator::alternative_excluding`].

use crate::core::error::{MeridianError, MeridianResult};
use crate::topology::cluster::ClusterConfig;
use crate::topology::registry::{LiveConnection, NodeHandle, NodeMap, NodeRegistry};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Config plus the node map built for it, swapped wholesale.
#[derive(Debug)]
pub struct RoutingSnapshot {
    /// The partition table in force.
    pub config: Arc<ClusterConfig>,
    /// Address-keyed handles for the config's servers.
    pub nodes: NodeMap,
}

impl RoutingSnapshot {
    fn resolve(&self, server_index: usize) -> MeridianResult<Arc<NodeHandle>> {
        let address = self
            .config
            .server_address(server_index)
            .ok_or_else(|| MeridianError::internal(format!(
                "partition table references server index {server_index} beyond the server list"
            )))?;
        self.nodes
            .get(address)
            .cloned()
            .ok_or_else(|| MeridianError::NodeUnresolved {
                address: address.to_string(),
            })
    }
}

/// Key → partition → node resolution over the published snapshot.
pub struct VBucketLocator {
    snapshot: RwLock<Option<Arc<RoutingSnapshot>>>,
}

impl VBucketLocator {
    /// Create a locator with no published snapshot.
    ///
    /// Routing fails with [`MeridianError::SnapshotUnavailable`] until the
    /// topology monitor publishes the first config.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
        }
    }

    /// The currently published snapshot, if any.
    ///
    /// The lock is held only for the `Arc` clone; callers route against
    /// their copy without blocking the publisher.
    pub fn current(&self) -> Option<Arc<RoutingSnapshot>> {
        self.snapshot.read().clone()
    }

    fn require_snapshot(&self) -> MeridianResult<Arc<RoutingSnapshot>> {
        self.current().ok_or(MeridianError::SnapshotUnavailable)
    }

    /// Partition id for a key under the current snapshot.
    pub fn partition_for(&self, key: &[u8]) -> MeridianResult<u16> {
        Ok(self.require_snapshot()?.config.partition_for_key(key))
    }

    /// Node currently responsible for a key.
    ///
    /// An unowned partition (master slot `-1`, seen mid-failover) is a
    /// transient condition: retry after a short delay with whatever snapshot
    /// is current then, never cache the miss.
    pub fn primary_for(&self, key: &[u8]) -> MeridianResult<Arc<NodeHandle>> {
        let snapshot = self.require_snapshot()?;
        let partition = snapshot.config.partition_for_key(key);
        let master = snapshot
            .config
            .master_index(partition)
            .ok_or(MeridianError::PartitionUnowned { partition })?;
        snapshot.resolve(master)
    }

    /// Node holding the `replica`-th replica (0-based) of a key's partition.
    ///
    /// Errors when fewer replicas are configured or alive than requested;
    /// that is a configuration limit, not a transient condition.
    pub fn replica_for(&self, key: &[u8], replica: usize) -> MeridianResult<Arc<NodeHandle>> {
        let snapshot = self.require_snapshot()?;
        let partition = snapshot.config.partition_for_key(key);
        let index = snapshot
            .config
            .replica_index(partition, replica)
            .ok_or(MeridianError::NoReplica {
                partition,
                index: replica,
            })?;
        snapshot.resolve(index)
    }

    /// An arbitrary live node not in `excluded`.
    ///
    /// Used when a node answered "not responsible" for a key because the
    /// client's map is stale. `None` means every node has been excluded and
    /// the caller must fail the operation.
    pub fn alternative_excluding(
        &self,
        excluded: &HashSet<String>,
    ) -> MeridianResult<Option<Arc<NodeHandle>>> {
        let snapshot = self.require_snapshot()?;
        for address in &snapshot.config.servers {
            if excluded.contains(address) {
                continue;
            }
            if let Some(handle) = snapshot.nodes.get(address) {
                return Ok(Some(handle.clone()));
            }
        }
        Ok(None)
    }

    /// Adopt a new config if it differs significantly from the current one.
    ///
    /// Significance is judged on three axes: config sequence, partition-table
    /// contents, server-list size. An insignificant update leaves the
    /// published snapshot untouched (same `Arc`), avoiding reader churn.
    /// Returns `true` when a new snapshot was published.
    pub fn update_from(&self, new_config: ClusterConfig, live: &[LiveConnection]) -> bool {
        if let Some(current) = self.current() {
            let delta = new_config.delta_from(&current.config);
            if !delta.is_significant() {
                tracing::debug!(
                    bucket = %new_config.bucket,
                    sequence = new_config.sequence,
                    "config unchanged; keeping published snapshot"
                );
                return false;
            }
            tracing::info!(
                bucket = %new_config.bucket,
                sequence = new_config.sequence,
                rows_changed = delta.rows_changed,
                server_count_changed = delta.server_count_changed,
                "adopting new cluster config"
            );
        } else {
            tracing::info!(
                bucket = %new_config.bucket,
                sequence = new_config.sequence,
                servers = new_config.servers.len(),
                partitions = new_config.partition_count(),
                "publishing initial cluster config"
            );
        }

        let nodes = NodeRegistry::build(&new_config, live);
        let snapshot = Arc::new(RoutingSnapshot {
            config: Arc::new(new_config),
            nodes,
        });
        *self.snapshot.write() = Some(snapshot);
        true
    }
}

impl Default for VBucketLocator {
    fn default() -> Self {
        Self::new()
    }
}
