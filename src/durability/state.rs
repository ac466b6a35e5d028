//! Mutation tokens and the consistency-vector accumulator.
//!
//! A [`MutationToken`] names a point in one partition's mutation log. A
//! [`MutationState`] accumulates tokens into per-`(bucket, partition)`
//! watermarks: merging keeps the higher sequence number, so merge order
//! never matters and merging the same token twice is a no-op. The exported
//! form is handed to a query engine as a "read no older than these
//! watermarks" consistency bound.
//!
//! `MutationState` has no internal locking. Concurrent merges from multiple
//! tasks require external synchronization; that is the caller's
//! responsibility by contract.

use crate::core::error::{MeridianError, MeridianResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A point in one partition's mutation log, produced by the write path
/// after a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationToken {
    /// Bucket the mutation landed in.
    pub bucket: String,
    /// Partition (vbucket) id.
    pub partition_id: u16,
    /// Partition epoch; changes when ownership history diverges, so
    /// sequence numbers stay unambiguous across failover.
    pub partition_epoch: u64,
    /// Sequence number within the partition's log.
    pub sequence: u64,
}

/// Highest observed point for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWatermark {
    /// Epoch the sequence belongs to.
    pub epoch: u64,
    /// Highest merged sequence number.
    pub sequence: u64,
}

/// Accumulated watermarks across buckets and partitions.
///
/// Merging is commutative and idempotent: per `(bucket, partition)` the
/// higher sequence wins, entries for different keys are unioned, and the
/// recorded sequence for any key never decreases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationState {
    entries: BTreeMap<String, BTreeMap<u16, PartitionWatermark>>,
}

impl MutationState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from an initial set of tokens.
    pub fn from_tokens<'a>(tokens: impl IntoIterator<Item = &'a MutationToken>) -> Self {
        let mut state = Self::new();
        for token in tokens {
            state.merge_token(token);
        }
        state
    }

    /// True when no watermark has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Watermark recorded for a `(bucket, partition)` pair.
    pub fn watermark(&self, bucket: &str, partition_id: u16) -> Option<PartitionWatermark> {
        self.entries.get(bucket)?.get(&partition_id).copied()
    }

    /// Merge one token in.
    pub fn merge_token(&mut self, token: &MutationToken) {
        let slot = self
            .entries
            .entry(token.bucket.clone())
            .or_default()
            .entry(token.partition_id);
        slot.and_modify(|watermark| {
            if token.sequence > watermark.sequence {
                watermark.sequence = token.sequence;
                watermark.epoch = token.partition_epoch;
            }
        })
        .or_insert(PartitionWatermark {
            epoch: token.partition_epoch,
            sequence: token.sequence,
        });
    }

    /// Merge another state in.
    pub fn merge(&mut self, other: &MutationState) {
        for (bucket, partitions) in &other.entries {
            let ours = self.entries.entry(bucket.clone()).or_default();
            for (&partition_id, &theirs) in partitions {
                ours.entry(partition_id)
                    .and_modify(|watermark| {
                        if theirs.sequence > watermark.sequence {
                            *watermark = theirs;
                        }
                    })
                    .or_insert(theirs);
            }
        }
    }

    /// Serialize to the consistency-vector form:
    /// `bucket → partition-id-as-key → [sequence, epoch-as-string]`.
    pub fn export(&self) -> Value {
        let mut buckets = serde_json::Map::new();
        for (bucket, partitions) in &self.entries {
            let mut map = serde_json::Map::new();
            for (partition_id, watermark) in partitions {
                map.insert(
                    partition_id.to_string(),
                    json!([watermark.sequence, watermark.epoch.to_string()]),
                );
            }
            buckets.insert(bucket.clone(), Value::Object(map));
        }
        Value::Object(buckets)
    }

    /// Exact inverse of [`export`](Self::export).
    ///
    /// All-or-nothing: any malformed element fails the whole import; a
    /// partial state is never produced.
    pub fn import(data: &Value) -> MeridianResult<Self> {
        let buckets = data
            .as_object()
            .ok_or_else(|| MeridianError::invalid_mutation_state("top level is not an object"))?;

        let mut entries: BTreeMap<String, BTreeMap<u16, PartitionWatermark>> = BTreeMap::new();
        for (bucket, partitions) in buckets {
            let partitions = partitions.as_object().ok_or_else(|| {
                MeridianError::invalid_mutation_state(format!(
                    "bucket {bucket:?} entry is not an object"
                ))
            })?;

            let mut parsed = BTreeMap::new();
            for (partition_key, watermark) in partitions {
                let partition_id: u16 = partition_key.parse().map_err(|_| {
                    MeridianError::invalid_mutation_state(format!(
                        "partition key {partition_key:?} is not a partition id"
                    ))
                })?;

                let pair = watermark.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    MeridianError::invalid_mutation_state(format!(
                        "watermark for {bucket}/{partition_key} is not a [sequence, epoch] pair"
                    ))
                })?;

                let sequence = pair[0].as_u64().ok_or_else(|| {
                    MeridianError::invalid_mutation_state(format!(
                        "sequence for {bucket}/{partition_key} is not an unsigned integer"
                    ))
                })?;

                let epoch: u64 = pair[1]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        MeridianError::invalid_mutation_state(format!(
                            "epoch for {bucket}/{partition_key} is not a numeric string"
                        ))
                    })?;

                parsed.insert(partition_id, PartitionWatermark { epoch, sequence });
            }
            entries.insert(bucket.clone(), parsed);
        }

        Ok(Self { entries })
    }
}
