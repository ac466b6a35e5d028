//! Per-node adaptive backpressure.
//!
//! Each target node carries a severity derived from its last sampled memory
//! stats. Dispatch calls [`ThrottleController::on_before_dispatch`] once per
//! outgoing request; every N ops (N shrinking as severity rises, so pressure
//! is re-checked more often) fresh stats are fetched with a bounded wait and
//! the severity recomputed. High and Critical severities pause the calling
//! task for a fixed configured duration before returning.
//!
//! This is a synchronous backpressure point: callers experience added
//! latency, never an error. A node that misses the stats window, or returns
//! malformed stats, simply isn't throttled this round.

use crate::core::config::ThrottleConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Memory-pressure severity for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThrottleSeverity {
    /// Below the high-water mark.
    Normal,
    /// At or above the high-water mark.
    High,
    /// At or above 1.1 times the high-water mark.
    Critical,
}

impl ThrottleSeverity {
    /// Derive severity from sampled memory stats.
    pub fn from_memory(mem_used: u64, high_water_mark: u64) -> Self {
        if high_water_mark == 0 {
            return Self::Normal;
        }
        let critical_at = high_water_mark as f64 * 1.1;
        if mem_used as f64 >= critical_at {
            Self::Critical
        } else if mem_used >= high_water_mark {
            Self::High
        } else {
            Self::Normal
        }
    }
}

/// Parsed per-node memory stats.
///
/// Stats arrive as maps of numeric strings; anything missing or unparsable
/// makes the whole sample unusable and the round is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently in use.
    pub mem_used: u64,
    /// Server-reported high-water mark.
    pub high_water_mark: u64,
}

impl MemoryStats {
    /// Parse from a raw stats reply.
    pub fn from_stats_map(stats: &HashMap<String, String>) -> Option<Self> {
        let mem_used = stats.get("mem_used")?.trim().parse().ok()?;
        let high_water_mark = stats.get("ep_mem_high_wat")?.trim().parse().ok()?;
        Some(Self {
            mem_used,
            high_water_mark,
        })
    }

    /// Severity implied by this sample.
    pub fn severity(&self) -> ThrottleSeverity {
        ThrottleSeverity::from_memory(self.mem_used, self.high_water_mark)
    }
}

/// Fetches raw stats for a node.
///
/// The transport is an external collaborator; the controller applies its own
/// bounded wait around this call and treats a miss as "no data this round".
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Raw stats map for `address`, or `None` if the node did not reply.
    async fn memory_stats(&self, address: &str) -> Option<HashMap<String, String>>;
}

/// Per-node throttle bookkeeping.
#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    severity: ThrottleSeverity,
    ops_since_check: u32,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            severity: ThrottleSeverity::Normal,
            ops_since_check: 0,
        }
    }
}

/// Outcome of a throttle gate check, returned for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    /// Severity in force for the node after this check.
    pub severity: ThrottleSeverity,
    /// Pause applied to the calling task, if any.
    pub pause: Option<Duration>,
}

/// Adaptive per-node throttle gate.
pub struct ThrottleController {
    config: ThrottleConfig,
    stats: Arc<dyn StatsSource>,
    states: Mutex<HashMap<String, ThrottleState>>,
}

impl ThrottleController {
    /// Create a controller over a stats source.
    ///
    /// Explicit factory by design: one controller per bucket, parameterized
    /// by shared config, with the strategy fixed at compile time.
    pub fn new(config: ThrottleConfig, stats: Arc<dyn StatsSource>) -> Self {
        Self {
            config,
            stats,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Ops between stats checks at a given severity.
    fn check_threshold(&self, severity: ThrottleSeverity) -> u32 {
        match severity {
            ThrottleSeverity::Normal => self.config.normal_check_ops,
            ThrottleSeverity::High => self.config.high_check_ops,
            ThrottleSeverity::Critical => self.config.critical_check_ops,
        }
    }

    /// Pause applied per dispatch at a given severity.
    pub fn pause_for(config: &ThrottleConfig, severity: ThrottleSeverity) -> Option<Duration> {
        match severity {
            ThrottleSeverity::Normal => None,
            ThrottleSeverity::High => Some(config.high_sleep()),
            ThrottleSeverity::Critical => Some(config.critical_sleep()),
        }
    }

    /// Drop bookkeeping for nodes the predicate rejects.
    ///
    /// Called on topology snapshot swaps with the new server list, so the
    /// per-node map tracks the current topology instead of every node ever
    /// dispatched to over the life of the client.
    pub fn retain_nodes(&self, mut keep: impl FnMut(&str) -> bool) {
        self.states.lock().retain(|address, _| keep(address));
    }

    /// Current severity recorded for a node.
    pub fn severity(&self, address: &str) -> ThrottleSeverity {
        self.states
            .lock()
            .get(address)
            .map(|s| s.severity)
            .unwrap_or(ThrottleSeverity::Normal)
    }

    /// Throttle gate, called once per outgoing request.
    ///
    /// May pause the calling task for up to the configured per-severity
    /// duration, and may itself perform a bounded-wait stats round trip.
    pub async fn on_before_dispatch(&self, address: &str) -> ThrottleDecision {
        let due = {
            let mut states = self.states.lock();
            let state = states.entry(address.to_string()).or_default();
            state.ops_since_check += 1;
            if state.ops_since_check >= self.check_threshold(state.severity) {
                state.ops_since_check = 0;
                true
            } else {
                false
            }
        };

        if !due {
            return ThrottleDecision {
                severity: self.severity(address),
                pause: None,
            };
        }

        let sample = match tokio::time::timeout(
            self.config.stats_wait(),
            self.stats.memory_stats(address),
        )
        .await
        {
            Ok(Some(raw)) => MemoryStats::from_stats_map(&raw),
            Ok(None) => None,
            Err(_) => {
                tracing::debug!(address, "stats reply missed the wait window; skipping round");
                None
            }
        };

        let Some(sample) = sample else {
            // No usable data: no throttling this round.
            return ThrottleDecision {
                severity: self.severity(address),
                pause: None,
            };
        };

        let severity = sample.severity();
        {
            let mut states = self.states.lock();
            states.entry(address.to_string()).or_default().severity = severity;
        }

        let pause = Self::pause_for(&self.config, severity);
        if let Some(duration) = pause {
            tracing::debug!(
                address,
                ?severity,
                mem_used = sample.mem_used,
                high_water_mark = sample.high_water_mark,
                pause_ms = duration.as_millis() as u64,
                "memory pressure detected; pausing dispatch"
            );
            tokio::time::sleep(duration).await;
        }

        ThrottleDecision { severity, pause }
    }
}
