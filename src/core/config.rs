//! Configuration parsing and validation.
//!
//! Meridian configuration is loaded from TOML files with per-field defaults.
//! Sections mirror the architectural components: `[topology]` for the
//! streaming monitor, `[throttle]` for adaptive backpressure, `[retry]` for
//! the query-service retry driver.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level Meridian configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Topology monitor configuration.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Throttle controller configuration.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Retry driver configuration.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            throttle: ThrottleConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Topology monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Forced reconnect interval for the streaming feed, in seconds.
    ///
    /// Streaming config endpoints are known to stall server-side without
    /// closing the socket; the connection is recycled on this timer
    /// independent of errors.
    #[serde(default = "default_recycle_interval_seconds")]
    pub recycle_interval_seconds: u64,

    /// Initial reconnect backoff after a stream failure, in milliseconds.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Maximum reconnect backoff, in milliseconds.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            recycle_interval_seconds: default_recycle_interval_seconds(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl TopologyConfig {
    /// Recycle interval as a [`Duration`].
    pub fn recycle_interval(&self) -> Duration {
        Duration::from_secs(self.recycle_interval_seconds)
    }

    /// Initial reconnect backoff as a [`Duration`].
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    /// Maximum reconnect backoff as a [`Duration`].
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Throttle controller configuration.
///
/// Thresholds are counted in operations between stats checks; smaller
/// thresholds at higher severity so pressure is re-checked more often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Ops between stats checks while severity is Normal.
    #[serde(default = "default_normal_check_ops")]
    pub normal_check_ops: u32,

    /// Ops between stats checks while severity is High.
    #[serde(default = "default_high_check_ops")]
    pub high_check_ops: u32,

    /// Ops between stats checks while severity is Critical.
    #[serde(default = "default_critical_check_ops")]
    pub critical_check_ops: u32,

    /// Pause applied per dispatch while severity is High, in milliseconds.
    #[serde(default = "default_high_sleep_ms")]
    pub high_sleep_ms: u64,

    /// Pause applied per dispatch while severity is Critical, in milliseconds.
    #[serde(default = "default_critical_sleep_ms")]
    pub critical_sleep_ms: u64,

    /// Bounded wait for per-node stats replies, in milliseconds.
    ///
    /// A node that fails to reply within the window is skipped this round.
    #[serde(default = "default_stats_wait_ms")]
    pub stats_wait_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            normal_check_ops: default_normal_check_ops(),
            high_check_ops: default_high_check_ops(),
            critical_check_ops: default_critical_check_ops(),
            high_sleep_ms: default_high_sleep_ms(),
            critical_sleep_ms: default_critical_sleep_ms(),
            stats_wait_ms: default_stats_wait_ms(),
        }
    }
}

impl ThrottleConfig {
    /// High-severity pause as a [`Duration`].
    pub fn high_sleep(&self) -> Duration {
        Duration::from_millis(self.high_sleep_ms)
    }

    /// Critical-severity pause as a [`Duration`].
    pub fn critical_sleep(&self) -> Duration {
        Duration::from_millis(self.critical_sleep_ms)
    }

    /// Stats reply wait as a [`Duration`].
    pub fn stats_wait(&self) -> Duration {
        Duration::from_millis(self.stats_wait_ms)
    }
}

/// Retry driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay before the first resubmission, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,

    /// Cap on the exponential backoff delay, in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub max_delay_ms: u64,

    /// Overall deadline for an operation including retries, in milliseconds.
    #[serde(default = "default_retry_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_cap_ms(),
            deadline_ms: default_retry_deadline_ms(),
        }
    }
}

impl RetryConfig {
    /// Base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap as a [`Duration`].
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Overall deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

fn default_recycle_interval_seconds() -> u64 {
    600
}

fn default_reconnect_initial_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_normal_check_ops() -> u32 {
    1000
}

fn default_high_check_ops() -> u32 {
    100
}

fn default_critical_check_ops() -> u32 {
    10
}

fn default_high_sleep_ms() -> u64 {
    1
}

fn default_critical_sleep_ms() -> u64 {
    3
}

fn default_stats_wait_ms() -> u64 {
    1000
}

fn default_retry_base_ms() -> u64 {
    50
}

fn default_retry_cap_ms() -> u64 {
    2000
}

fn default_retry_deadline_ms() -> u64 {
    75_000
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.throttle.normal_check_ops == 0
            || self.throttle.high_check_ops == 0
            || self.throttle.critical_check_ops == 0
        {
            anyhow::bail!("throttle check thresholds must be non-zero");
        }
        if self.throttle.high_check_ops < self.throttle.critical_check_ops {
            anyhow::bail!(
                "throttle thresholds must shrink with severity: high_check_ops {} < critical_check_ops {}",
                self.throttle.high_check_ops,
                self.throttle.critical_check_ops
            );
        }
        if self.throttle.normal_check_ops < self.throttle.high_check_ops {
            anyhow::bail!(
                "throttle thresholds must shrink with severity: normal_check_ops {} < high_check_ops {}",
                self.throttle.normal_check_ops,
                self.throttle.high_check_ops
            );
        }
        if self.topology.reconnect_initial_ms > self.topology.reconnect_max_ms {
            anyhow::bail!("reconnect_initial_ms must not exceed reconnect_max_ms");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry base_delay_ms must not exceed max_delay_ms");
        }
        if self.retry.deadline_ms == 0 {
            anyhow::bail!("retry deadline_ms must be non-zero");
        }
        Ok(())
    }
}
