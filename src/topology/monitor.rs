//! Streaming topology watcher.
//!
//! The monitor holds a long-lived streaming connection to a per-bucket
//! topology feed. Each inbound chunk is a whole configuration document:
//! parse failures are logged and the last good snapshot stays in force,
//! successes are handed to the locator's `update_from`.
//!
//! State machine: `Disconnected → Connecting → Streaming → Disconnected`
//! (on error) `→ Connecting` (retry with backoff).
//!
//! The connection is also recycled on a fixed timer independent of errors:
//! streaming config endpoints are known to stall server-side without closing
//! the socket, so a forced reconnect is part of normal operation, not an
//! error path. Loss of the stream is observable through the status channel
//! but never blocks in-flight operations; routing continues against the last
//! good snapshot.

use crate::core::config::TopologyConfig;
use crate::core::error::{MeridianError, MeridianResult};
use crate::topology::cluster::ClusterConfig;
use crate::topology::locator::VBucketLocator;
use crate::topology::registry::LiveConnection;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Delimiter between successive documents on a comet-style feed.
const CHUNK_DELIMITER: &[u8] = b"\n\n\n\n";

/// Monitor connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// No connection to the feed.
    Disconnected,
    /// Dialing the feed.
    Connecting,
    /// Receiving configuration documents.
    Streaming,
    /// Shut down, will not reconnect.
    Stopped,
}

/// Observable monitor status, published through a watch channel.
///
/// Dependent components (health checks, staleness probes) subscribe instead
/// of polling; routing itself never consults this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    /// Bucket the monitor is watching.
    pub bucket: String,
    /// Connection state.
    pub state: MonitorState,
    /// Sequence of the last config adopted, if any.
    pub last_sequence: Option<u64>,
    /// Whether the bucket is currently receiving updates.
    pub updating: bool,
}

/// One established streaming connection to the topology feed.
#[async_trait]
pub trait ConfigStream: Send {
    /// Next whole configuration document.
    ///
    /// `Ok(None)` is a clean end of stream; an error is an unexpected
    /// disconnect. Both send the monitor back through its reconnect loop.
    async fn next_document(&mut self) -> MeridianResult<Option<String>>;
}

/// Dials the per-bucket topology feed.
///
/// The transport (HTTP comet, push socket) is an external collaborator; the
/// monitor only consumes documents.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Open a stream of configuration documents for `bucket`.
    async fn connect(&self, bucket: &str) -> MeridianResult<Box<dyn ConfigStream>>;
}

/// Reports the currently established data connections.
///
/// Consulted on every adopted config so the node map is rebuilt against
/// connections that actually exist.
pub trait ConnectionDirectory: Send + Sync {
    /// Snapshot of live connections.
    fn live_connections(&self) -> Vec<LiveConnection>;
}

/// Splits a byte stream into delimiter-separated documents.
///
/// Comet-style feeds separate successive JSON documents with a blank-line
/// delimiter; reads arrive at arbitrary boundaries, so bytes are accumulated
/// until a full document is present.
#[derive(Debug, Default)]
pub struct ChunkFramer {
    buffer: BytesMut,
}

impl ChunkFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete document, if one is buffered.
    ///
    /// Empty segments (keep-alive delimiters) are skipped.
    pub fn next_document(&mut self) -> Option<String> {
        loop {
            let pos = self
                .buffer
                .windows(CHUNK_DELIMITER.len())
                .position(|w| w == CHUNK_DELIMITER)?;
            let segment = self.buffer.split_to(pos);
            self.buffer.advance(CHUNK_DELIMITER.len());
            let text = String::from_utf8_lossy(&segment).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
}

/// [`ConfigStream`] over any async byte stream using the comet framing.
pub struct FramedStream<R> {
    reader: R,
    framer: ChunkFramer,
    read_buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> FramedStream<R> {
    /// Wrap a raw byte stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            framer: ChunkFramer::new(),
            read_buf: vec![0u8; 8 * 1024],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ConfigStream for FramedStream<R> {
    async fn next_document(&mut self) -> MeridianResult<Option<String>> {
        loop {
            if let Some(doc) = self.framer.next_document() {
                return Ok(Some(doc));
            }
            let n = self
                .reader
                .read(&mut self.read_buf)
                .await
                .map_err(|e| MeridianError::internal(format!("stream read failed: {e}")))?;
            if n == 0 {
                return Ok(None);
            }
            self.framer.push(&self.read_buf[..n]);
        }
    }
}

/// Why the streaming phase ended.
enum StreamEnd {
    Shutdown,
    Recycle,
    /// The peer closed the stream or a read failed. `adopted` records
    /// whether the stream delivered at least one valid document first.
    Lost { adopted: bool },
}

/// Long-lived watcher that feeds the locator.
pub struct TopologyMonitor {
    bucket: String,
    locator: Arc<VBucketLocator>,
    source: Arc<dyn ConfigSource>,
    directory: Arc<dyn ConnectionDirectory>,
    config: TopologyConfig,
    status_tx: watch::Sender<MonitorStatus>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<MonitorStatus>,
}

impl MonitorHandle {
    /// Subscribe to monitor status changes.
    pub fn status(&self) -> watch::Receiver<MonitorStatus> {
        self.status_rx.clone()
    }

    /// Stop the monitor, unblocking any pending read, and wait for the task
    /// to release its connection.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

impl TopologyMonitor {
    /// Spawn the monitor on its own task.
    ///
    /// The streaming read loop must never run on a request-dispatch task;
    /// spawning here is the only supported way to start it.
    pub fn spawn(
        bucket: impl Into<String>,
        locator: Arc<VBucketLocator>,
        source: Arc<dyn ConfigSource>,
        directory: Arc<dyn ConnectionDirectory>,
        config: TopologyConfig,
    ) -> MonitorHandle {
        let bucket = bucket.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(MonitorStatus {
            bucket: bucket.clone(),
            state: MonitorState::Disconnected,
            last_sequence: None,
            updating: false,
        });

        let monitor = Self {
            bucket,
            locator,
            source,
            directory,
            config,
            status_tx,
            shutdown_rx,
        };
        let task = tokio::spawn(monitor.run());

        MonitorHandle {
            task,
            shutdown_tx,
            status_rx,
        }
    }

    fn set_status(&self, state: MonitorState, updating: bool) {
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.updating = updating;
        });
    }

    async fn run(mut self) {
        let mut backoff = self.config.reconnect_initial();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            self.set_status(MonitorState::Connecting, false);

            let stream = tokio::select! {
                result = self.source.connect(&self.bucket) => result,
                _ = self.shutdown_rx.changed() => break,
            };

            match stream {
                Ok(stream) => {
                    self.set_status(MonitorState::Streaming, true);
                    let end = self.stream_until_recycle(stream).await;
                    self.set_status(MonitorState::Disconnected, false);
                    match end {
                        StreamEnd::Shutdown => break,
                        // Deliberate reconnect after a full healthy interval;
                        // no pacing needed.
                        StreamEnd::Recycle => {
                            backoff = self.config.reconnect_initial();
                        }
                        StreamEnd::Lost { adopted } => {
                            // Only a stream that produced a valid config
                            // earns a fresh backoff; an unproductive stream
                            // keeps the growing delay so a feed that accepts
                            // and immediately closes stays paced.
                            if adopted {
                                backoff = self.config.reconnect_initial();
                            }
                            if !self.pause(backoff).await {
                                break;
                            }
                            backoff = (backoff * 2).min(self.config.reconnect_max());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        bucket = %self.bucket,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "topology feed connect failed"
                    );
                    self.set_status(MonitorState::Disconnected, false);
                    if !self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.reconnect_max());
                }
            }
        }

        self.set_status(MonitorState::Stopped, false);
        tracing::info!(bucket = %self.bucket, "topology monitor stopped");
    }

    /// Sleep between connection attempts; `false` when shutdown arrived first.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown_rx.changed() => false,
        }
    }

    /// Consume documents until recycle, disconnect, or shutdown.
    async fn stream_until_recycle(&mut self, mut stream: Box<dyn ConfigStream>) -> StreamEnd {
        enum StreamEvent {
            Shutdown,
            Recycle,
            Document(String),
            Closed,
            Failed(MeridianError),
        }

        let recycle_at = tokio::time::Instant::now() + self.config.recycle_interval();
        let mut adopted = false;

        loop {
            let event = tokio::select! {
                _ = self.shutdown_rx.changed() => StreamEvent::Shutdown,
                _ = tokio::time::sleep_until(recycle_at) => StreamEvent::Recycle,
                document = stream.next_document() => match document {
                    Ok(Some(doc)) => StreamEvent::Document(doc),
                    Ok(None) => StreamEvent::Closed,
                    Err(e) => StreamEvent::Failed(e),
                },
            };

            match event {
                StreamEvent::Shutdown => return StreamEnd::Shutdown,
                StreamEvent::Recycle => {
                    // Deliberate reconnect, not an error path.
                    tracing::info!(bucket = %self.bucket, "recycling topology feed connection");
                    return StreamEnd::Recycle;
                }
                StreamEvent::Document(doc) => {
                    if self.adopt_document(&doc) {
                        adopted = true;
                    }
                }
                StreamEvent::Closed => {
                    tracing::warn!(bucket = %self.bucket, "topology feed closed by peer");
                    return StreamEnd::Lost { adopted };
                }
                StreamEvent::Failed(e) => {
                    tracing::warn!(bucket = %self.bucket, error = %e, "topology feed read failed");
                    return StreamEnd::Lost { adopted };
                }
            }
        }
    }

    /// Parse a document and hand it to the locator. Returns whether the
    /// document was valid.
    ///
    /// Fail-safe: a malformed document is logged and dropped, the last good
    /// snapshot stays in force.
    fn adopt_document(&self, document: &str) -> bool {
        match ClusterConfig::parse(document) {
            Ok(config) => {
                let sequence = config.sequence;
                let live = self.directory.live_connections();
                if self.locator.update_from(config, &live) {
                    self.status_tx.send_modify(|status| {
                        status.last_sequence = Some(sequence);
                    });
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    bucket = %self.bucket,
                    error = %e,
                    "ignoring malformed config document"
                );
                false
            }
        }
    }
}
