//! Testing utilities for ripple routers.
//!
//! - [`RecordBuilder`] builds stream records from JSON-shaped images
//! - [`RecordingHandler`] and [`RecordingBatchHandler`] capture what they were given
//! - [`FailingHandler`] fails on demand
//! - [`InMemoryDeferQueue`] is both sides of deferral, without a database
//!
//! ```ignore
//! let seen = RecordingHandler::new();
//! let router = RouterBuilder::new(RouterConfig::default())
//!     .on_modify(Matcher::any(), seen.clone())
//!     .build()?;
//!
//! let event = stream_event([RecordBuilder::modify("1")
//!     .old_image(json!({"status": "pending"}))
//!     .new_image(json!({"status": "active"}))
//!     .build()?]);
//!
//! router.process(&event).await?;
//! assert_eq!(seen.sequence_numbers().await, vec!["1"]);
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ripple_core::{
    marshall, AttributeMap, BatchHandler, ClaimedInvocation, CodecError, DeferQueue, DeferSpec,
    DeferStore, EventName, FailureKind, RecordChange, RecordHandler, StreamEvent, StreamPayload,
    StreamRecord, Value, DEFAULT_DEFER_QUEUE,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Records
// ============================================================================

/// Builds a [`StreamRecord`] from decoded images.
///
/// Images are anything convertible into a [`Value`]; `serde_json::Value`
/// objects work directly. Use [`Value::set`] for typed sets, which JSON
/// cannot express.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    event_name: EventName,
    sequence_number: String,
    region: Option<String>,
    keys: Option<Value>,
    old_image: Option<Value>,
    new_image: Option<Value>,
}

impl RecordBuilder {
    pub fn new(event_name: EventName, sequence_number: impl Into<String>) -> Self {
        Self {
            event_name,
            sequence_number: sequence_number.into(),
            region: None,
            keys: None,
            old_image: None,
            new_image: None,
        }
    }

    pub fn insert(sequence_number: impl Into<String>) -> Self {
        Self::new(EventName::Insert, sequence_number)
    }

    pub fn modify(sequence_number: impl Into<String>) -> Self {
        Self::new(EventName::Modify, sequence_number)
    }

    pub fn remove(sequence_number: impl Into<String>) -> Self {
        Self::new(EventName::Remove, sequence_number)
    }

    pub fn keys(mut self, keys: impl Into<Value>) -> Self {
        self.keys = Some(keys.into());
        self
    }

    pub fn old_image(mut self, image: impl Into<Value>) -> Self {
        self.old_image = Some(image.into());
        self
    }

    pub fn new_image(mut self, image: impl Into<Value>) -> Self {
        self.new_image = Some(image.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Encode the images into wire form.
    pub fn build(self) -> Result<StreamRecord, CodecError> {
        let keys = match &self.keys {
            Some(keys) => marshall(keys)?,
            None => AttributeMap::new(),
        };
        let old_image = self.old_image.as_ref().map(marshall).transpose()?;
        let new_image = self.new_image.as_ref().map(marshall).transpose()?;

        Ok(StreamRecord {
            event_id: format!("event-{}", self.sequence_number),
            event_name: self.event_name,
            event_source: Some("ripple:test".to_string()),
            event_source_arn: None,
            region: self.region,
            change: StreamPayload {
                keys,
                old_image,
                new_image,
                sequence_number: self.sequence_number,
                approximate_creation_date_time: Some(Utc::now().timestamp() as f64),
                size_bytes: None,
            },
        })
    }
}

/// Wrap records into a stream batch.
pub fn stream_event(records: impl IntoIterator<Item = StreamRecord>) -> StreamEvent {
    StreamEvent::new(records.into_iter().collect())
}

// ============================================================================
// Handlers
// ============================================================================

/// Records every change it is given. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<RecordChange>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seen(&self) -> Vec<RecordChange> {
        self.seen.lock().await.clone()
    }

    pub async fn sequence_numbers(&self) -> Vec<String> {
        self.seen
            .lock()
            .await
            .iter()
            .map(|c| c.sequence_number().to_string())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, change: &RecordChange) -> Result<()> {
        self.seen.lock().await.push(change.clone());
        Ok(())
    }
}

/// Records every batch it is given, one entry per call.
#[derive(Clone, Default)]
pub struct RecordingBatchHandler {
    calls: Arc<Mutex<Vec<Vec<RecordChange>>>>,
}

impl RecordingBatchHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence numbers per call.
    pub async fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|batch| batch.iter().map(|c| c.sequence_number().to_string()).collect())
            .collect()
    }
}

#[async_trait]
impl BatchHandler for RecordingBatchHandler {
    async fn handle_batch(&self, changes: &[RecordChange]) -> Result<()> {
        self.calls.lock().await.push(changes.to_vec());
        Ok(())
    }
}

/// Fails on every record, or only on the listed sequence numbers.
#[derive(Clone, Default)]
pub struct FailingHandler {
    only: Option<HashSet<String>>,
    attempts: Arc<AtomicU64>,
}

impl FailingHandler {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn on<I, S>(sequence_numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            only: Some(sequence_numbers.into_iter().map(Into::into).collect()),
            attempts: Arc::default(),
        }
    }

    /// Calls made so far, failed or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for FailingHandler {
    async fn handle(&self, change: &RecordChange) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let seq = change.sequence_number();
        match &self.only {
            Some(only) if !only.contains(seq) => Ok(()),
            _ => Err(anyhow!("induced failure on record {seq}")),
        }
    }
}

// ============================================================================
// Deferral
// ============================================================================

/// Lifecycle of an in-memory invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct StoredInvocation {
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: i32,
    pub attempt: i32,
    pub run_at: DateTime<Utc>,
    pub status: InvocationStatus,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

/// Defer queue and store backed by a [`DashMap`].
///
/// Same claim order and retry rules as the Postgres store, except retries
/// are immediately runnable so tests need not wait out a backoff.
#[derive(Clone, Default)]
pub struct InMemoryDeferQueue {
    invocations: Arc<DashMap<Uuid, StoredInvocation>>,
    heartbeats: Arc<DashMap<Uuid, u64>>,
}

impl InMemoryDeferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<StoredInvocation> {
        self.invocations.get(&id).map(|entry| entry.clone())
    }

    pub fn count(&self, status: InvocationStatus) -> usize {
        self.invocations
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }

    /// Ids of invocations currently in `status`.
    pub fn ids(&self, status: InvocationStatus) -> Vec<Uuid> {
        self.invocations
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Lease extensions received for `id`.
    pub fn heartbeats(&self, id: Uuid) -> u64 {
        self.heartbeats.get(&id).map(|n| *n).unwrap_or(0)
    }

    fn insert(&self, payload: serde_json::Value, spec: DeferSpec, run_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.invocations.insert(
            id,
            StoredInvocation {
                queue: spec.queue.unwrap_or_else(|| DEFAULT_DEFER_QUEUE.to_string()),
                payload,
                priority: spec.priority,
                max_retries: spec.max_retries,
                attempt: 1,
                run_at,
                status: InvocationStatus::Pending,
                worker_id: None,
                error: None,
            },
        );
        id
    }
}

#[async_trait]
impl DeferQueue for InMemoryDeferQueue {
    async fn enqueue(&self, payload: serde_json::Value, spec: DeferSpec) -> Result<Uuid> {
        Ok(self.insert(payload, spec, Utc::now()))
    }

    async fn schedule(
        &self,
        payload: serde_json::Value,
        spec: DeferSpec,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        Ok(self.insert(payload, spec, run_at))
    }
}

#[async_trait]
impl DeferStore for InMemoryDeferQueue {
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedInvocation>> {
        let now = Utc::now();
        let mut ready: Vec<(i32, DateTime<Utc>, Uuid)> = self
            .invocations
            .iter()
            .filter(|entry| entry.status == InvocationStatus::Pending && entry.run_at <= now)
            .map(|entry| (entry.priority, entry.run_at, *entry.key()))
            .collect();
        ready.sort();

        let mut claimed = Vec::new();
        for (_, _, id) in ready.into_iter().take(limit.max(0) as usize) {
            let Some(mut entry) = self.invocations.get_mut(&id) else {
                continue;
            };
            // Another worker may have claimed it since the scan.
            if entry.status != InvocationStatus::Pending {
                continue;
            }
            entry.status = InvocationStatus::Running;
            entry.worker_id = Some(worker_id.to_string());
            claimed.push(ClaimedInvocation {
                id,
                queue: entry.queue.clone(),
                payload: entry.payload.clone(),
                attempt: entry.attempt,
            });
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, id: Uuid) -> Result<()> {
        let mut entry = self
            .invocations
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown invocation {id}"))?;
        entry.status = InvocationStatus::Succeeded;
        entry.worker_id = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let mut entry = self
            .invocations
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown invocation {id}"))?;
        entry.error = Some(error.to_string());
        entry.worker_id = None;
        match kind {
            FailureKind::Retryable if entry.attempt < entry.max_retries => {
                entry.attempt += 1;
                entry.status = InvocationStatus::Pending;
            }
            _ => entry.status = InvocationStatus::DeadLetter,
        }
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid) -> Result<()> {
        *self.heartbeats.entry(id).or_insert(0) += 1;
        Ok(())
    }
}
