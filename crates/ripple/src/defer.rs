//! Deferred handler execution.
//!
//! A handler registered with a [`DeferSpec`] is not run while the stream
//! batch is processed. The router serializes the matched records into a
//! [`DeferredInvocation`] and hands it to a [`DeferQueue`]; a worker later
//! claims it from a [`DeferStore`] and passes the payload to
//! [`crate::StreamRouter::process_deferred`]. [`drain`] is that worker loop
//! body. It heartbeats every running invocation so long handlers keep their
//! lease.
//!
//! ```text
//! StreamRouter.process()
//!     │ handler matched, deferred
//!     ▼
//! DeferQueue.enqueue(payload) ──► external queue / jobs table
//!                                          │
//!                      worker: DeferStore.claim_ready()
//!                                          │
//!                                          ▼
//!                      StreamRouter.process_deferred(payload)
//!                                          │   DeferStore.heartbeat() every
//!                                          │   heartbeat_interval meanwhile
//!                          mark_succeeded / mark_failed
//! ```
//!
//! The payload carries raw wire records, not decoded values, so typed sets
//! survive the trip.

use crate::error::RouterError;
use crate::record::StreamRecord;
use crate::router::StreamRouter;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::pin;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

/// How and where a deferred handler is queued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferSpec {
    /// Queue name. Falls back to the router's default queue.
    pub queue: Option<String>,
    /// Lower runs first.
    pub priority: i32,
    pub max_retries: i32,
    /// Run no earlier than this long after the record was processed.
    #[serde(with = "duration_ms")]
    pub delay: Option<Duration>,
}

impl DeferSpec {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            ..Self::default()
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match delay {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Queue payload: which handler to run, on which records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredInvocation {
    pub handler_id: String,
    pub records: Vec<StreamRecord>,
}

/// Producer side of a deferral queue.
#[async_trait]
pub trait DeferQueue: Send + Sync + 'static {
    /// Queue for immediate execution.
    async fn enqueue(&self, payload: serde_json::Value, spec: DeferSpec) -> Result<Uuid>;

    /// Queue for execution at `run_at`.
    async fn schedule(
        &self,
        payload: serde_json::Value,
        spec: DeferSpec,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid>;
}

/// Whether a failed invocation should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

/// A deferred invocation claimed by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedInvocation {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub attempt: i32,
}

/// Worker side of a deferral queue.
#[async_trait]
pub trait DeferStore: Send + Sync + 'static {
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedInvocation>>;

    async fn mark_succeeded(&self, id: Uuid) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()>;

    /// Extend the lease of a long-running invocation.
    async fn heartbeat(&self, id: Uuid) -> Result<()>;
}

// ============================================================================
// Worker
// ============================================================================

/// How one [`drain`] pass claims and runs invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOptions {
    /// Most invocations claimed per pass.
    pub limit: i64,
    /// Most invocations running at once.
    pub concurrency: usize,
    /// Lease extension period. Keep it well under the store's lease timeout.
    pub heartbeat_interval: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            concurrency: 4,
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

impl DrainOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Counts from one [`drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Claim ready invocations and run them through the router, within the
/// limits of `options`. Each result is recorded against its job.
///
/// Errors from the store itself abort the pass; handler errors do not. A
/// failed heartbeat is logged and the invocation keeps running.
pub async fn drain(
    store: &dyn DeferStore,
    router: &StreamRouter,
    worker_id: &str,
    options: &DrainOptions,
) -> Result<DrainReport> {
    let claimed = store.claim_ready(worker_id, options.limit).await?;
    let mut report = DrainReport {
        claimed: claimed.len(),
        ..DrainReport::default()
    };
    if claimed.is_empty() {
        return Ok(report);
    }
    debug!(worker_id, claimed = claimed.len(), "draining deferred invocations");

    let every = options.heartbeat_interval.max(Duration::from_millis(1));
    let results: Vec<(Uuid, Result<(), RouterError>)> = stream::iter(claimed)
        .map(|job| async move {
            let outcome = run_with_heartbeat(store, router, job.id, job.payload, every).await;
            (job.id, outcome)
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    for (id, outcome) in results {
        match outcome {
            Ok(()) => {
                store.mark_succeeded(id).await?;
                report.succeeded += 1;
            }
            Err(error) => {
                let kind = if error.is_retryable() {
                    FailureKind::Retryable
                } else {
                    FailureKind::NonRetryable
                };
                warn!(%id, %error, ?kind, "deferred invocation failed");
                store.mark_failed(id, &error.to_string(), kind).await?;
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn run_with_heartbeat(
    store: &dyn DeferStore,
    router: &StreamRouter,
    id: Uuid,
    payload: serde_json::Value,
    every: Duration,
) -> Result<(), RouterError> {
    let mut work = pin!(router.process_deferred(payload));
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            outcome = &mut work => return outcome,
            _ = ticker.tick() => {
                if let Err(error) = store.heartbeat(id).await {
                    warn!(%id, %error, "failed to extend lease");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delay_serializes_as_millis() {
        let spec = DeferSpec::new()
            .on_queue("emails")
            .with_delay(Duration::from_secs(2));
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["delay"], json!(2000));
        assert_eq!(json["max_retries"], json!(3));

        let back: DeferSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
