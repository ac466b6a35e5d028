//! Common test utilities.
//!
//! Shared helpers for integration tests: cluster config documents, live
//! connection fixtures, and scripted fakes for the monitor's collaborators.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use meridian::core::error::{MeridianError, MeridianResult};
use meridian::dispatch::throttle::StatsSource;
use meridian::topology::monitor::{ConfigSource, ConfigStream, ConnectionDirectory};
use meridian::topology::registry::{ConnectionId, LiveConnection};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Build a config document over `servers` with the given partition rows.
pub fn config_doc(rev: u64, servers: &[&str], table: &[&[i32]]) -> String {
    let servers: Vec<String> = servers.iter().map(|s| format!("\"{s}\"")).collect();
    let rows: Vec<String> = table
        .iter()
        .map(|row| {
            let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            format!("[{}]", cells.join(", "))
        })
        .collect();
    format!(
        r#"{{
            "name": "default",
            "rev": {rev},
            "hashAlgorithm": "crc32",
            "serverList": [{}],
            "vBucketMap": [{}]
        }}"#,
        servers.join(", "),
        rows.join(", ")
    )
}

/// A live connection whose hostname matches the config address exactly.
pub fn live(address: &str, id: u64) -> LiveConnection {
    let (hostname, port) = address.rsplit_once(':').expect("address must be host:port");
    LiveConnection {
        hostname: hostname.to_string(),
        resolved_ip: None,
        port: port.parse().expect("port must be numeric"),
        id: ConnectionId(id),
    }
}

/// Connection directory serving a fixed list.
pub struct StaticDirectory {
    connections: Mutex<Vec<LiveConnection>>,
}

impl StaticDirectory {
    pub fn new(connections: Vec<LiveConnection>) -> Self {
        Self {
            connections: Mutex::new(connections),
        }
    }

    pub fn set(&self, connections: Vec<LiveConnection>) {
        *self.connections.lock() = connections;
    }
}

impl ConnectionDirectory for StaticDirectory {
    fn live_connections(&self) -> Vec<LiveConnection> {
        self.connections.lock().clone()
    }
}

/// Config stream fed by a channel; the stream stays open until the sender
/// is dropped, like a real comet feed between pushes.
pub struct ChannelStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ConfigStream for ChannelStream {
    async fn next_document(&mut self) -> MeridianResult<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// Config source handing out pre-created channel streams, one per connect.
pub struct ScriptedSource {
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<String>>>,
}

impl ScriptedSource {
    /// Create a source plus `count` senders, one per expected connect.
    pub fn with_streams(count: usize) -> (Self, Vec<mpsc::UnboundedSender<String>>) {
        let mut senders = Vec::with_capacity(count);
        let mut streams = VecDeque::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            streams.push_back(rx);
        }
        (
            Self {
                streams: Mutex::new(streams),
            },
            senders,
        )
    }
}

#[async_trait]
impl ConfigSource for ScriptedSource {
    async fn connect(&self, _bucket: &str) -> MeridianResult<Box<dyn ConfigStream>> {
        match self.streams.lock().pop_front() {
            Some(rx) => Ok(Box::new(ChannelStream { rx })),
            None => Err(MeridianError::internal("no scripted stream left")),
        }
    }
}

/// Config source whose streams close as soon as they are read, counting
/// connect attempts. Models a feed endpoint that accepts the connection and
/// immediately hangs up.
pub struct ClosingSource {
    connects: Arc<AtomicUsize>,
}

impl ClosingSource {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        (
            Self {
                connects: connects.clone(),
            },
            connects,
        )
    }
}

struct ClosedStream;

#[async_trait]
impl ConfigStream for ClosedStream {
    async fn next_document(&mut self) -> MeridianResult<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
impl ConfigSource for ClosingSource {
    async fn connect(&self, _bucket: &str) -> MeridianResult<Box<dyn ConfigStream>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ClosedStream))
    }
}

/// Stats source answering from a fixed per-node map.
pub struct MapStats {
    replies: HashMap<String, HashMap<String, String>>,
    delay: Option<Duration>,
}

impl MapStats {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            delay: None,
        }
    }

    pub fn with_memory(mut self, address: &str, mem_used: u64, high_water_mark: u64) -> Self {
        let mut stats = HashMap::new();
        stats.insert("mem_used".to_string(), mem_used.to_string());
        stats.insert("ep_mem_high_wat".to_string(), high_water_mark.to_string());
        self.replies.insert(address.to_string(), stats);
        self
    }

    /// Delay every reply, for exercising the bounded wait.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl StatsSource for MapStats {
    async fn memory_stats(&self, address: &str) -> Option<HashMap<String, String>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies.get(address).cloned()
    }
}
