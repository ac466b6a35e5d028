//! Cluster configuration snapshots.
//!
//! A [`ClusterConfig`] is the client's copy of the server-assigned partition
//! map: which node owns each vbucket, which nodes hold its replicas, and the
//! hash algorithm that assigns keys to vbuckets. The table is authoritative
//! on the server side; the client replays it, it never computes its own
//! partition boundaries.
//!
//! Configs are immutable. Topology changes are handled by parsing a whole
//! new document and republishing it, never by mutating in place.

use crate::core::error::{MeridianError, MeridianResult};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Marker index for a partition slot with no assigned server.
///
/// The server map reports `-1` mid-failover when no replica has been
/// promoted yet.
pub const NO_SERVER: i32 = -1;

/// Hash algorithm used to map keys to partitions.
///
/// Server-assigned; the client must apply exactly the algorithm the config
/// names or successive runs would route the same key differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HashAlgorithm {
    /// CRC32 of the key, folded to 15 bits. The default.
    Crc32,
    /// xxHash64 with a zero seed.
    XxHash64,
}

impl TryFrom<String> for HashAlgorithm {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "crc" | "crc32" => Ok(Self::Crc32),
            "xxhash64" | "xx64" => Ok(Self::XxHash64),
            other => Err(format!("unknown hash algorithm {other:?}")),
        }
    }
}

impl From<HashAlgorithm> for String {
    fn from(value: HashAlgorithm) -> Self {
        match value {
            HashAlgorithm::Crc32 => "crc32".to_string(),
            HashAlgorithm::XxHash64 => "xxhash64".to_string(),
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::Crc32
    }
}

/// Wire shape of a cluster configuration document.
///
/// This is the decoded JSON pushed by the topology feed. It is validated
/// into a [`ClusterConfig`] before anything routes against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfigDoc {
    /// Bucket name.
    name: String,
    /// Monotonic config revision.
    rev: u64,
    /// Hash algorithm name.
    #[serde(default)]
    hash_algorithm: HashAlgorithm,
    /// Ordered list of `host:port` addresses.
    server_list: Vec<String>,
    /// Per-partition rows of `[master_index, replica_index, ...]`.
    v_bucket_map: Vec<Vec<i32>>,
}

/// Immutable snapshot of the partition table and server list.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Bucket this config describes.
    pub bucket: String,
    /// Monotonic config revision assigned by the server.
    pub sequence: u64,
    /// Key-to-partition hash algorithm.
    pub hash_algorithm: HashAlgorithm,
    /// Ordered server addresses; partition table cells index into this.
    pub servers: Vec<String>,
    /// Per-partition rows: first cell is the master index, the rest are
    /// replica indices. Any cell may be [`NO_SERVER`].
    partition_table: Vec<Vec<i32>>,
}

impl ClusterConfig {
    /// Parse and validate a configuration document.
    ///
    /// Fails as a whole on any structural problem; a partially-valid
    /// document never becomes a config.
    pub fn parse(json: &str) -> MeridianResult<Self> {
        let doc: ClusterConfigDoc = serde_json::from_str(json)
            .map_err(|e| MeridianError::config_rejected(e.to_string()))?;
        Self::from_doc(doc)
    }

    fn from_doc(doc: ClusterConfigDoc) -> MeridianResult<Self> {
        if doc.server_list.is_empty() {
            return Err(MeridianError::config_rejected("empty server list"));
        }
        let count = doc.v_bucket_map.len();
        if count == 0 || !count.is_power_of_two() {
            return Err(MeridianError::config_rejected(format!(
                "partition count {count} is not a power of two"
            )));
        }
        // The CRC fold is 15-bit, so larger tables could never be addressed.
        if count > 0x8000 {
            return Err(MeridianError::config_rejected(format!(
                "partition count {count} exceeds the addressable range"
            )));
        }
        let server_count = doc.server_list.len() as i32;
        for (partition, row) in doc.v_bucket_map.iter().enumerate() {
            if row.is_empty() {
                return Err(MeridianError::config_rejected(format!(
                    "partition {partition} has an empty table row"
                )));
            }
            for &cell in row {
                if cell != NO_SERVER && (cell < 0 || cell >= server_count) {
                    return Err(MeridianError::config_rejected(format!(
                        "partition {partition} references server index {cell} out of range 0..{server_count}"
                    )));
                }
            }
        }
        Ok(Self {
            bucket: doc.name,
            sequence: doc.rev,
            hash_algorithm: doc.hash_algorithm,
            servers: doc.server_list,
            partition_table: doc.v_bucket_map,
        })
    }

    /// Number of partitions in the table.
    pub fn partition_count(&self) -> u16 {
        self.partition_table.len() as u16
    }

    /// Map a key to its partition id.
    ///
    /// Deterministic and stable across client restarts: the same key and the
    /// same config always yield the same partition.
    pub fn partition_for_key(&self, key: &[u8]) -> u16 {
        let count = self.partition_table.len() as u64;
        let hash = match self.hash_algorithm {
            // CRC32 folded to 15 bits, matching the server's assignment.
            HashAlgorithm::Crc32 => u64::from((crc32fast::hash(key) >> 16) & 0x7fff),
            HashAlgorithm::XxHash64 => {
                let mut hasher = XxHash64::with_seed(0);
                hasher.write(key);
                hasher.finish()
            }
        };
        (hash % count) as u16
    }

    /// Master server index for a partition, or `None` when the slot is
    /// currently unowned.
    pub fn master_index(&self, partition: u16) -> Option<usize> {
        let cell = *self.partition_table.get(partition as usize)?.first()?;
        (cell != NO_SERVER).then_some(cell as usize)
    }

    /// Replica server index at `replica` (0-based), or `None` when that slot
    /// is empty or absent.
    pub fn replica_index(&self, partition: u16, replica: usize) -> Option<usize> {
        let cell = *self.partition_table.get(partition as usize)?.get(replica + 1)?;
        (cell != NO_SERVER).then_some(cell as usize)
    }

    /// Address of the server at `index`.
    pub fn server_address(&self, index: usize) -> Option<&str> {
        self.servers.get(index).map(String::as_str)
    }

    /// Compare against the currently published config along the three axes
    /// that make an update significant.
    pub fn delta_from(&self, current: &ClusterConfig) -> TopologyDelta {
        let rows_changed = if self.partition_table.len() == current.partition_table.len() {
            self.partition_table
                .iter()
                .zip(current.partition_table.iter())
                .filter(|(a, b)| a != b)
                .count()
        } else {
            // Different table sizes: every row counts as changed.
            self.partition_table.len().max(current.partition_table.len())
        };
        TopologyDelta {
            sequence_changed: self.sequence != current.sequence,
            rows_changed,
            server_count_changed: self.servers.len() != current.servers.len(),
        }
    }
}

/// What changed between two configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyDelta {
    /// The config revision moved.
    pub sequence_changed: bool,
    /// Number of partition-table rows that differ.
    pub rows_changed: usize,
    /// The server list grew or shrank.
    pub server_count_changed: bool,
}

impl TopologyDelta {
    /// An update is significant when any axis moved; otherwise republishing
    /// would only churn readers.
    pub fn is_significant(&self) -> bool {
        self.sequence_changed || self.rows_changed > 0 || self.server_count_changed
    }
}
