//! First-success fan-out for replica reads.
//!
//! Replica gets race the primary and one or more replicas: every candidate
//! runs concurrently, the first success wins, and the losers are aborted
//! rather than left running against nodes that no longer need to answer.

use crate::core::error::{MeridianError, MeridianResult};
use std::future::Future;
use tokio::task::JoinSet;

/// Run candidate futures concurrently and keep the first success.
///
/// Remaining candidates are aborted as soon as one succeeds. If every
/// candidate fails, the last failure is returned so the caller sees a real
/// cause rather than a generic exhaustion error.
pub async fn first_success<T, F>(candidates: Vec<F>) -> MeridianResult<T>
where
    F: Future<Output = MeridianResult<T>> + Send + 'static,
    T: Send + 'static,
{
    if candidates.is_empty() {
        return Err(MeridianError::internal(
            "first_success called with no candidates",
        ));
    }

    let mut set = JoinSet::new();
    for candidate in candidates {
        set.spawn(candidate);
    }

    let mut last_failure = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(value)) => {
                set.abort_all();
                return Ok(value);
            }
            Ok(Err(e)) => last_failure = Some(e),
            // An aborted or panicked candidate never outranks a real failure.
            Err(_) => {}
        }
    }

    Err(last_failure
        .unwrap_or_else(|| MeridianError::internal("all candidates were aborted")))
}
