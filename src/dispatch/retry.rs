//! Retry classification and bounded backoff for query-style services.
//!
//! View, analytics and search executors hand completed-but-unsuccessful
//! responses to [`RetryPolicy::classify_http`] (or
//! [`RetryPolicy::classify_code`] for services that report structured
//! numeric codes) and get back a [`Classification`]: success, retry, or a
//! terminal error carrying enough context to distinguish "resource absent"
//! from "malformed request" from "server overloaded".
//!
//! Retries are bounded by an overall deadline through [`RetrySchedule`];
//! once it elapses any pending retry becomes a terminal timeout. The async
//! driver [`run_with_retries`] schedules each resubmission (never spins) and
//! stops promptly on cancellation.

use crate::core::config::RetryConfig;
use crate::core::error::{MeridianError, MeridianResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// HTTP statuses retried unconditionally: redirects, auth races, timeouts,
/// conflicts and gateway-side overload are all transient from the client's
/// point of view.
const RETRYABLE_STATUSES: &[u16] = &[
    300, 301, 302, 303, 307, 401, 408, 409, 412, 416, 417, 501, 502, 503, 504,
];

/// Structured error codes in the temporary/server-busy family.
///
/// Anything outside this set is permanent by default: never infinite-retry
/// on an unrecognized condition.
const RETRYABLE_SERVICE_CODES: &[u32] = &[21_002, 23_000, 23_003, 23_007];

/// How a request failed at the transport layer, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The request timed out in flight.
    Timeout,
    /// The connection was closed mid-request.
    ConnectionClosed,
    /// The connection could not be established.
    ConnectRefused,
}

/// A completed-but-unsuccessful response from a query-style service.
#[derive(Debug, Clone)]
pub struct QueryFailure {
    /// HTTP status code, 0 when the failure was purely transport-level.
    pub status: u16,
    /// Response body (or fragment) for marker inspection.
    pub body: String,
    /// Transport failure, if the request never produced a response.
    pub transport: Option<TransportFailure>,
}

/// Outcome of classifying a response.
#[derive(Debug)]
pub enum Classification {
    /// The response is a success; stop.
    Success,
    /// Resubmit on the same or an alternative node.
    Retry {
        /// The failure pattern suggests the client's topology is stale;
        /// an out-of-band config refresh should be triggered.
        refresh_topology: bool,
    },
    /// Terminal; retrying will never succeed.
    FailPermanent(MeridianError),
}

impl Classification {
    /// Whether this classification asks for a resubmission.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Failure classifier for query-style services.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Status treated as success; 200 unless the service says otherwise.
    success_status: u16,
}

impl RetryPolicy {
    /// Policy with the standard success status of 200.
    pub fn new() -> Self {
        Self {
            success_status: 200,
        }
    }

    /// Policy for a service with a non-standard success status.
    pub fn with_success_status(success_status: u16) -> Self {
        Self { success_status }
    }

    /// Classify an HTTP-style response.
    pub fn classify_http(&self, failure: &QueryFailure) -> Classification {
        if let Some(transport) = failure.transport {
            return match transport {
                TransportFailure::Timeout => Classification::Retry {
                    refresh_topology: false,
                },
                // A closed or refused connection usually means the node went
                // away under us; the map needs refreshing.
                TransportFailure::ConnectionClosed | TransportFailure::ConnectRefused => {
                    Classification::Retry {
                        refresh_topology: true,
                    }
                }
            };
        }

        if failure.status == self.success_status {
            return Classification::Success;
        }

        if RETRYABLE_STATUSES.contains(&failure.status) {
            return Classification::Retry {
                refresh_topology: false,
            };
        }

        match failure.status {
            404 => {
                // "not_found" alone can be transient routing/propagation
                // lag; paired with missing/deleted it names an absent
                // resource.
                let body = failure.body.as_str();
                if body.contains("not_found")
                    && (body.contains("missing") || body.contains("deleted"))
                {
                    Classification::FailPermanent(MeridianError::ResourceMissing {
                        status: 404,
                        detail: truncate_body(body),
                    })
                } else {
                    Classification::Retry {
                        refresh_topology: false,
                    }
                }
            }
            500 => {
                if failure.body.contains("missing_named_view") {
                    Classification::FailPermanent(MeridianError::ResourceMissing {
                        status: 500,
                        detail: truncate_body(&failure.body),
                    })
                } else {
                    Classification::Retry {
                        refresh_topology: false,
                    }
                }
            }
            status => Classification::FailPermanent(MeridianError::ServiceFailed {
                code: u32::from(status),
                detail: truncate_body(&failure.body),
            }),
        }
    }

    /// Classify a structured numeric error code.
    pub fn classify_code(&self, code: u32, message: &str) -> Classification {
        if RETRYABLE_SERVICE_CODES.contains(&code) {
            Classification::Retry {
                refresh_topology: false,
            }
        } else {
            Classification::FailPermanent(MeridianError::ServiceFailed {
                code,
                detail: truncate_body(message),
            })
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep error payloads readable without dragging whole bodies around.
fn truncate_body(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

/// Capped exponential backoff bounded by an overall deadline.
#[derive(Debug)]
pub struct RetrySchedule {
    started: Instant,
    deadline: Duration,
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl RetrySchedule {
    /// Start a schedule; the deadline clock begins now.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            started: Instant::now(),
            deadline: config.deadline(),
            base: config.base_delay(),
            cap: config.max_delay(),
            attempts: 0,
        }
    }

    /// Attempts granted so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next resubmission, or `None` once the deadline
    /// cannot be met. `None` converts a pending retry into a terminal
    /// timeout at the call site.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let exponent = self.attempts.min(16);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap));
        let elapsed = self.started.elapsed();
        if elapsed + delay >= self.deadline {
            return None;
        }
        self.attempts += 1;
        Some(delay)
    }
}

/// One attempt's result, as seen by the retry driver.
pub enum AttemptOutcome<T> {
    /// The operation produced a usable result.
    Success(T),
    /// The operation completed unsuccessfully; classify and maybe retry.
    Failure(QueryFailure),
}

/// Resolves only once `cancel` reads true.
///
/// A dropped sender means the caller will never cancel, not that it has;
/// the future stays pending so the driver keeps running.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drive an operation through classification and bounded backoff.
///
/// Each retry is scheduled with a timer, not spun. `cancel` stops the loop
/// promptly: no further resubmission is scheduled once it fires. Dropping
/// the cancel sender leaves the operation uncancellable, it does not abort
/// it. `notify_stale` is invoked when a failure pattern suggests the
/// topology is stale, so the caller can trigger an out-of-band config
/// refresh.
pub async fn run_with_retries<T, F, Fut, N>(
    policy: &RetryPolicy,
    config: &RetryConfig,
    mut cancel: watch::Receiver<bool>,
    mut notify_stale: N,
    mut attempt: F,
) -> MeridianResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
    N: FnMut(),
{
    let mut schedule = RetrySchedule::new(config);

    loop {
        if *cancel.borrow() {
            return Err(MeridianError::Cancelled);
        }

        let outcome = tokio::select! {
            outcome = attempt(schedule.attempts()) => outcome,
            _ = cancelled(&mut cancel) => return Err(MeridianError::Cancelled),
        };

        let failure = match outcome {
            AttemptOutcome::Success(value) => return Ok(value),
            AttemptOutcome::Failure(failure) => failure,
        };

        match policy.classify_http(&failure) {
            Classification::Success => {
                return Err(MeridianError::internal(
                    "response classified as success but carried no result",
                ))
            }
            Classification::FailPermanent(error) => return Err(error),
            Classification::Retry { refresh_topology } => {
                if refresh_topology {
                    notify_stale();
                }
                let Some(delay) = schedule.next_delay() else {
                    return Err(MeridianError::RetryDeadlineExceeded {
                        attempts: schedule.attempts(),
                    });
                };
                tracing::debug!(
                    status = failure.status,
                    attempts = schedule.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut cancel) => return Err(MeridianError::Cancelled),
                }
            }
        }
    }
}
