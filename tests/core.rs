//! Core tests: configuration loading and the error taxonomy.

mod common;

use meridian::core::config::CoreConfig;
use meridian::core::error::MeridianError;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("failed to write config");
    file
}

// ============================================================================
// Configuration tests
// ============================================================================

#[test]
fn empty_config_gets_defaults() {
    let file = write_config("");
    let config = CoreConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.topology.recycle_interval(), Duration::from_secs(600));
    assert_eq!(config.throttle.normal_check_ops, 1000);
    assert_eq!(config.throttle.stats_wait(), Duration::from_millis(1000));
    assert_eq!(config.retry.deadline(), Duration::from_millis(75_000));
}

#[test]
fn sections_override_defaults() {
    let file = write_config(
        r#"
[topology]
recycle_interval_seconds = 30
reconnect_initial_ms = 50
reconnect_max_ms = 500

[throttle]
normal_check_ops = 100
high_check_ops = 10
critical_check_ops = 2
high_sleep_ms = 2
critical_sleep_ms = 5

[retry]
base_delay_ms = 25
max_delay_ms = 1000
deadline_ms = 10000
"#,
    );
    let config = CoreConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.topology.recycle_interval(), Duration::from_secs(30));
    assert_eq!(config.throttle.critical_check_ops, 2);
    assert_eq!(config.throttle.critical_sleep(), Duration::from_millis(5));
    assert_eq!(config.retry.base_delay(), Duration::from_millis(25));
}

#[test]
fn thresholds_must_shrink_with_severity() {
    let file = write_config(
        r#"
[throttle]
normal_check_ops = 10
high_check_ops = 100
critical_check_ops = 2
"#,
    );
    assert!(CoreConfig::load_from_file(file.path()).is_err());
}

#[test]
fn zero_thresholds_are_rejected() {
    let file = write_config(
        r#"
[throttle]
critical_check_ops = 0
"#,
    );
    assert!(CoreConfig::load_from_file(file.path()).is_err());
}

#[test]
fn inverted_backoff_bounds_are_rejected() {
    let file = write_config(
        r#"
[retry]
base_delay_ms = 5000
max_delay_ms = 100
"#,
    );
    assert!(CoreConfig::load_from_file(file.path()).is_err());
}

#[test]
fn missing_file_is_an_error() {
    assert!(CoreConfig::load_from_file("/nonexistent/meridian.toml").is_err());
}

// ============================================================================
// Error taxonomy tests
// ============================================================================

#[test]
fn transient_conditions_are_retriable() {
    assert!(MeridianError::PartitionUnowned { partition: 3 }.is_retriable());
    assert!(MeridianError::SnapshotUnavailable.is_retriable());
}

#[test]
fn structural_errors_are_not_retriable() {
    assert!(!MeridianError::NoReplica {
        partition: 3,
        index: 2
    }
    .is_retriable());
    assert!(!MeridianError::NodeUnresolved {
        address: "a:11210".to_string()
    }
    .is_retriable());
    assert!(!MeridianError::ResourceMissing {
        status: 404,
        detail: String::new()
    }
    .is_retriable());
    // Exhausting every node is terminal for the operation: retrying against
    // the same exclusion set cannot succeed.
    assert!(!MeridianError::AllNodesExcluded.is_retriable());
}

#[test]
fn errors_carry_enough_context_to_act_on() {
    let err = MeridianError::PartitionUnowned { partition: 42 };
    assert!(err.to_string().contains("42"));

    let err = MeridianError::ServiceFailed {
        code: 25000,
        detail: "internal error".to_string(),
    };
    let rendered = err.to_string();
    assert!(rendered.contains("25000"));
    assert!(rendered.contains("internal error"));
}
