//! Error types for routing, topology, throttling and durability tracking.
//!
//! Meridian distinguishes transient conditions (absorbed locally, safe to
//! retry after a short delay) from structural misconfigurations (retrying
//! cannot fix them, surfaced immediately). [`MeridianError::is_retriable`]
//! encodes that split for callers that drive their own retry loops.

use thiserror::Error;

/// Common Meridian error conditions.
#[derive(Debug, Error)]
pub enum MeridianError {
    /// The partition currently has no owner in the cluster map.
    ///
    /// Happens mid-failover before a replica is promoted. The server map is
    /// still converging; callers should retry after a short delay with a
    /// fresh snapshot rather than caching the miss.
    #[error("partition {partition} has no current owner")]
    PartitionUnowned { partition: u16 },

    /// The requested replica slot is not populated for this partition.
    ///
    /// Fewer replicas are configured or alive than the requested index.
    /// This is a configuration limit, not a transient condition.
    #[error("partition {partition} has no replica at index {index}")]
    NoReplica { partition: u16, index: usize },

    /// A config server address could not be matched to any live connection.
    ///
    /// Routing to the address fails loudly instead of silently reusing a
    /// stale handle.
    #[error("no live connection for node {address}")]
    NodeUnresolved { address: String },

    /// Every candidate node was excluded by the caller.
    #[error("all nodes excluded while resolving an alternative node")]
    AllNodesExcluded,

    /// No routing snapshot has been published yet.
    ///
    /// Only seen between construction and the first good config from the
    /// topology feed; transient by definition.
    #[error("no routing snapshot has been published yet")]
    SnapshotUnavailable,

    /// A topology document failed to parse or validate.
    #[error("rejected cluster config: {reason}")]
    ConfigRejected { reason: String },

    /// The retry deadline elapsed with the operation still failing.
    #[error("operation exceeded its retry deadline after {attempts} attempts")]
    RetryDeadlineExceeded { attempts: u32 },

    /// A query-style service reported a terminal failure.
    ///
    /// Carries the status or structured code plus a body fragment so the
    /// caller can distinguish "resource absent" from "malformed request"
    /// from "server overloaded".
    #[error("service failure (code {code}): {detail}")]
    ServiceFailed { code: u32, detail: String },

    /// A named resource (view, index, design document) does not exist.
    #[error("resource not found (status {status}): {detail}")]
    ResourceMissing { status: u16, detail: String },

    /// An exported consistency vector failed to parse.
    ///
    /// Import is all-or-nothing; a partial state is never produced.
    #[error("invalid mutation state payload: {reason}")]
    InvalidMutationState { reason: String },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl MeridianError {
    /// Create a `ConfigRejected` error.
    pub fn config_rejected(reason: impl Into<String>) -> Self {
        Self::ConfigRejected {
            reason: reason.into(),
        }
    }

    /// Create an `InvalidMutationState` error.
    pub fn invalid_mutation_state(reason: impl Into<String>) -> Self {
        Self::InvalidMutationState {
            reason: reason.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error indicates the operation should be retried.
    ///
    /// Only convergence-related conditions qualify. Structural errors
    /// (`NoReplica`, `NodeUnresolved`, `ResourceMissing`) do not: the same
    /// request against the same topology will fail the same way.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::PartitionUnowned { .. } | Self::SnapshotUnavailable
        )
    }
}

/// Result type using MeridianError.
pub type MeridianResult<T> = Result<T, MeridianError>;
