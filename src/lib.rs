//! Meridian - client-side routing and consistency core for a vbucket-sharded
//! key-value store.
//!
//! Meridian is the part of a store driver that decides *where* an operation
//! goes and *whether* it should go again: deterministic key-to-node routing
//! over a server-assigned partition table, hot-swapped topology under live
//! traffic, adaptive backpressure when a node reports memory pressure,
//! durability watermark tracking for consistency-bound queries, and
//! retry-versus-fail classification for query-style services.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Request Dispatch (caller)                   │
//! │        keyed ops → locator    │    query ops → retry policy     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Dispatch Policy                         │
//! │     Throttle gate │ Retry classification │ Replica-read race    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Topology Core                          │
//! │   VBucketLocator │ RoutingSnapshot │ NodeRegistry │ Monitor     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Cluster (external collaborators)               │
//! │      streaming config feed │ data connections │ stats replies   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The topology monitor is the only writer: it parses each pushed config
//! document and republishes an immutable `(ClusterConfig, node map)` pair as
//! one snapshot. Request tasks read the current snapshot without locking
//! across a routing decision; an operation in flight across a swap may land
//! on the old node, and the "not responsible" fallback corrects it.
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - TOML configuration with per-field defaults
//! - [`core::error`] - Error taxonomy and retriability
//!
//! ## Topology
//! - [`topology::cluster`] - Immutable cluster config snapshots
//! - [`topology::registry`] - Address-to-connection matching
//! - [`topology::locator`] - Key → partition → node resolution
//! - [`topology::monitor`] - Streaming config watcher
//!
//! ## Dispatch
//! - [`dispatch::throttle`] - Per-node adaptive backpressure
//! - [`dispatch::retry`] - Failure classification and bounded backoff
//! - [`dispatch::race`] - First-success fan-out for replica reads
//!
//! ## Durability
//! - [`durability::state`] - Mutation tokens and consistency vectors
//!
//! # Out of scope
//!
//! Document transcoding, query statement construction, REST administration
//! and the per-message wire codec live in collaborating crates. Meridian
//! consumes decoded config documents and produces routing and retry
//! decisions; it never parses bytes off the data path itself.

pub mod core;
pub mod dispatch;
pub mod durability;
pub mod topology;

pub use crate::core::error::{MeridianError, MeridianResult};
