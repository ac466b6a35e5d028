//! Topology tests: locator routing, snapshot swaps, and the streaming monitor.

mod common;

use common::{config_doc, live, ClosingSource, ScriptedSource, StaticDirectory};
use meridian::core::config::TopologyConfig;
use meridian::core::error::MeridianError;
use meridian::topology::cluster::ClusterConfig;
use meridian::topology::locator::VBucketLocator;
use meridian::topology::monitor::{
    ConfigStream, FramedStream, MonitorState, TopologyMonitor,
};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const A: &str = "a.example.com:11210";
const B: &str = "b.example.com:11210";
const C: &str = "c.example.com:11210";

/// 4 partitions over [A, B, C]: table [[A], [B], [C], [A]].
fn four_partition_doc(rev: u64) -> String {
    config_doc(rev, &[A, B, C], &[&[0], &[1], &[2], &[0]])
}

fn all_live() -> Vec<meridian::topology::registry::LiveConnection> {
    vec![live(A, 1), live(B, 2), live(C, 3)]
}

/// Search for a key that hashes to `partition` under `config`.
fn key_for_partition(config: &ClusterConfig, partition: u16) -> Vec<u8> {
    for i in 0..100_000u32 {
        let key = format!("key-{i}").into_bytes();
        if config.partition_for_key(&key) == partition {
            return key;
        }
    }
    panic!("no key found for partition {partition}");
}

// ============================================================================
// Locator tests
// ============================================================================

#[test]
fn routing_is_deterministic_for_a_fixed_snapshot() {
    let locator = VBucketLocator::new();
    let config = ClusterConfig::parse(&four_partition_doc(1)).unwrap();
    locator.update_from(config, &all_live());

    let key = b"user::1234";
    let first = locator.primary_for(key).unwrap();
    for _ in 0..100 {
        assert_eq!(locator.primary_for(key).unwrap().address, first.address);
    }
}

#[test]
fn partition_ids_stay_in_range() {
    let locator = VBucketLocator::new();
    let config = ClusterConfig::parse(&four_partition_doc(1)).unwrap();
    locator.update_from(config, &all_live());

    for i in 0..5000 {
        let key = format!("k{i}");
        assert!(locator.partition_for(key.as_bytes()).unwrap() < 4);
    }
}

#[test]
fn routing_before_first_config_is_a_transient_error() {
    let locator = VBucketLocator::new();
    let err = locator.primary_for(b"k").unwrap_err();
    assert!(matches!(err, MeridianError::SnapshotUnavailable));
    assert!(err.is_retriable());
}

#[test]
fn insignificant_update_keeps_the_published_snapshot() {
    let locator = VBucketLocator::new();
    locator.update_from(
        ClusterConfig::parse(&four_partition_doc(5)).unwrap(),
        &all_live(),
    );
    let before = locator.current().unwrap();

    // Same sequence, same table, same server count: must be a no-op.
    let published = locator.update_from(
        ClusterConfig::parse(&four_partition_doc(5)).unwrap(),
        &all_live(),
    );
    assert!(!published);
    assert!(Arc::ptr_eq(&before, &locator.current().unwrap()));
}

#[test]
fn sequence_bump_republishes() {
    let locator = VBucketLocator::new();
    locator.update_from(
        ClusterConfig::parse(&four_partition_doc(5)).unwrap(),
        &all_live(),
    );
    let before = locator.current().unwrap();

    assert!(locator.update_from(
        ClusterConfig::parse(&four_partition_doc(6)).unwrap(),
        &all_live(),
    ));
    assert!(!Arc::ptr_eq(&before, &locator.current().unwrap()));
}

#[test]
fn unowned_partition_is_retriable_not_cached() {
    let locator = VBucketLocator::new();
    // Partition 0 has no owner mid-failover.
    let doc = config_doc(1, &[A, B, C], &[&[-1], &[1], &[2], &[0]]);
    locator.update_from(ClusterConfig::parse(&doc).unwrap(), &all_live());

    let config = locator.current().unwrap().config.clone();
    let key = key_for_partition(&config, 0);

    let err = locator.primary_for(&key).unwrap_err();
    assert!(matches!(err, MeridianError::PartitionUnowned { partition: 0 }));
    assert!(err.is_retriable());

    // Promotion arrives; the same key must route immediately.
    let healed = config_doc(2, &[A, B, C], &[&[1], &[1], &[2], &[0]]);
    locator.update_from(ClusterConfig::parse(&healed).unwrap(), &all_live());
    assert_eq!(locator.primary_for(&key).unwrap().address, B);
}

#[test]
fn replica_lookup_and_missing_replica() {
    let locator = VBucketLocator::new();
    let doc = config_doc(1, &[A, B, C], &[&[0, 1], &[1, -1], &[2, 0], &[0, 2]]);
    locator.update_from(ClusterConfig::parse(&doc).unwrap(), &all_live());

    let config = locator.current().unwrap().config.clone();
    let key0 = key_for_partition(&config, 0);
    assert_eq!(locator.replica_for(&key0, 0).unwrap().address, B);

    let key1 = key_for_partition(&config, 1);
    assert!(matches!(
        locator.replica_for(&key1, 0).unwrap_err(),
        MeridianError::NoReplica {
            partition: 1,
            index: 0
        }
    ));
}

#[test]
fn unresolved_address_fails_loudly() {
    let locator = VBucketLocator::new();
    // C has no live connection; its address is dropped from the map.
    let live_nodes = vec![live(A, 1), live(B, 2)];
    locator.update_from(
        ClusterConfig::parse(&four_partition_doc(1)).unwrap(),
        &live_nodes,
    );

    let config = locator.current().unwrap().config.clone();
    let key = key_for_partition(&config, 2);
    assert!(matches!(
        locator.primary_for(&key).unwrap_err(),
        MeridianError::NodeUnresolved { .. }
    ));
}

// ============================================================================
// End-to-end scenario: ownership moves under live routing
// ============================================================================

#[test]
fn ownership_move_and_not_responsible_fallback() {
    let locator = VBucketLocator::new();
    locator.update_from(
        ClusterConfig::parse(&four_partition_doc(1)).unwrap(),
        &all_live(),
    );

    let config = locator.current().unwrap().config.clone();
    let key = key_for_partition(&config, 0);
    assert_eq!(locator.primary_for(&key).unwrap().address, A);

    // Rebalance moves partition 0 to B under a sequence bump.
    let moved = config_doc(2, &[A, B, C], &[&[1], &[1], &[2], &[0]]);
    locator.update_from(ClusterConfig::parse(&moved).unwrap(), &all_live());
    assert_eq!(locator.primary_for(&key).unwrap().address, B);

    // An operation still in flight against A gets "not responsible" back
    // and resolves an alternative node excluding A.
    let excluded: HashSet<String> = [A.to_string()].into();
    let alternative = locator.alternative_excluding(&excluded).unwrap().unwrap();
    assert_ne!(alternative.address, A);

    // With every node excluded the caller must fail the operation.
    let all: HashSet<String> = [A, B, C].iter().map(|s| s.to_string()).collect();
    assert!(locator.alternative_excluding(&all).unwrap().is_none());
}

// ============================================================================
// Monitor tests
// ============================================================================

fn fast_monitor_config() -> TopologyConfig {
    TopologyConfig {
        recycle_interval_seconds: 3600,
        reconnect_initial_ms: 5,
        reconnect_max_ms: 20,
    }
}

#[tokio::test]
async fn monitor_adopts_configs_and_ignores_malformed_chunks() {
    let locator = Arc::new(VBucketLocator::new());
    let directory = Arc::new(StaticDirectory::new(all_live()));
    let (source, mut senders) = ScriptedSource::with_streams(1);
    let tx = senders.remove(0);

    let handle = TopologyMonitor::spawn(
        "default",
        locator.clone(),
        Arc::new(source),
        directory,
        fast_monitor_config(),
    );
    let mut status = handle.status();

    tx.send(four_partition_doc(1)).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.last_sequence == Some(1)),
    )
    .await
    .expect("monitor should adopt the first config")
    .unwrap();

    let config = locator.current().unwrap().config.clone();
    let key = key_for_partition(&config, 0);
    assert_eq!(locator.primary_for(&key).unwrap().address, A);

    // Malformed chunk: logged and dropped, last good snapshot stays.
    tx.send("{ this is not json".to_string()).unwrap();
    // A later good chunk still lands.
    tx.send(config_doc(2, &[A, B, C], &[&[1], &[1], &[2], &[0]]))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.last_sequence == Some(2)),
    )
    .await
    .expect("monitor should survive a malformed chunk")
    .unwrap();

    assert_eq!(locator.primary_for(&key).unwrap().address, B);

    handle.stop().await;
}

#[tokio::test]
async fn monitor_reconnects_after_peer_close() {
    let locator = Arc::new(VBucketLocator::new());
    let directory = Arc::new(StaticDirectory::new(all_live()));
    let (source, mut senders) = ScriptedSource::with_streams(2);
    let second = senders.pop().unwrap();
    let first = senders.pop().unwrap();

    let handle = TopologyMonitor::spawn(
        "default",
        locator.clone(),
        Arc::new(source),
        directory,
        fast_monitor_config(),
    );
    let mut status = handle.status();

    first.send(four_partition_doc(1)).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.last_sequence == Some(1)),
    )
    .await
    .unwrap()
    .unwrap();

    // Peer closes the stream; the monitor must reconnect on its own and
    // keep serving the last good snapshot in the meantime.
    drop(first);
    assert!(locator.current().is_some());

    second
        .send(config_doc(2, &[A, B, C], &[&[1], &[1], &[2], &[0]]))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.last_sequence == Some(2)),
    )
    .await
    .expect("monitor should reconnect and adopt the next config")
    .unwrap();

    handle.stop().await;
}

#[tokio::test]
async fn instantly_closing_feed_is_paced_by_backoff() {
    let locator = Arc::new(VBucketLocator::new());
    let directory = Arc::new(StaticDirectory::new(Vec::new()));
    let (source, connects) = ClosingSource::new();

    let handle = TopologyMonitor::spawn(
        "default",
        locator,
        Arc::new(source),
        directory,
        TopologyConfig {
            recycle_interval_seconds: 3600,
            reconnect_initial_ms: 20,
            reconnect_max_ms: 80,
        },
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let attempts = connects.load(Ordering::SeqCst);
    handle.stop().await;

    // Unproductive streams must not reset the backoff: delays of
    // 20, 40, 80, 80, ... ms between attempts bound the count over the
    // window. An unpaced loop racks up tens of thousands.
    assert!(attempts >= 2, "monitor gave up after {attempts} attempts");
    assert!(attempts <= 8, "connect storm: {attempts} attempts in 300ms");
}

#[tokio::test]
async fn monitor_stop_unblocks_pending_read() {
    let locator = Arc::new(VBucketLocator::new());
    let directory = Arc::new(StaticDirectory::new(Vec::new()));
    let (source, senders) = ScriptedSource::with_streams(1);

    let handle = TopologyMonitor::spawn(
        "default",
        locator,
        Arc::new(source),
        directory,
        fast_monitor_config(),
    );
    let mut status = handle.status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == MonitorState::Streaming),
    )
    .await
    .unwrap()
    .unwrap();

    // The stream is idle (no documents); stop must not hang on the read.
    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("stop should unblock the pending read");
    drop(senders);
}

#[tokio::test]
async fn framed_stream_splits_documents_across_reads() {
    let (mut client, server) = tokio::io::duplex(256);
    let mut stream = FramedStream::new(server);

    let doc = four_partition_doc(1);
    let payload = format!("{doc}\n\n\n\n");
    let (head, tail) = payload.split_at(payload.len() / 2);

    client.write_all(head.as_bytes()).await.unwrap();
    let pending = tokio::time::timeout(Duration::from_millis(50), stream.next_document()).await;
    assert!(pending.is_err(), "half a document must not frame");

    client.write_all(tail.as_bytes()).await.unwrap();
    let framed = stream.next_document().await.unwrap().unwrap();
    assert_eq!(framed, doc);

    drop(client);
    assert!(stream.next_document().await.unwrap().is_none());
}
