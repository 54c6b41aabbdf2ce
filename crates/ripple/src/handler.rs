//! Handler contracts and registration options.

use crate::defer::DeferSpec;
use crate::filter::FilterSpec;
use crate::record::{EventName, RecordChange};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Every event kind.
pub const ANY_EVENT: &[EventName] = &[EventName::Insert, EventName::Modify, EventName::Remove];

/// Handles one matched record at a time.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle(&self, change: &RecordChange) -> Result<()>;
}

/// Handles every matched record of a stream batch in one call.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    async fn handle_batch(&self, changes: &[RecordChange]) -> Result<()>;
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F>(F);

/// Use an async closure as a [`RecordHandler`].
///
/// ```ignore
/// router.on_modify(Matcher::any(), handler_fn(|change| async move {
///     tracing::info!(seq = change.sequence_number(), "modified");
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RecordChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(RecordChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, change: &RecordChange) -> Result<()> {
        (self.0)(change.clone()).await
    }
}

/// Adapter returned by [`batch_handler_fn`].
pub struct FnBatchHandler<F>(F);

/// Use an async closure as a [`BatchHandler`].
pub fn batch_handler_fn<F, Fut>(f: F) -> FnBatchHandler<F>
where
    F: Fn(Vec<RecordChange>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnBatchHandler(f)
}

#[async_trait]
impl<F, Fut> BatchHandler for FnBatchHandler<F>
where
    F: Fn(Vec<RecordChange>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle_batch(&self, changes: &[RecordChange]) -> Result<()> {
        (self.0)(changes.to_vec()).await
    }
}

#[async_trait]
impl<H: RecordHandler> RecordHandler for Arc<H> {
    async fn handle(&self, change: &RecordChange) -> Result<()> {
        (**self).handle(change).await
    }
}

#[async_trait]
impl<H: BatchHandler> BatchHandler for Arc<H> {
    async fn handle_batch(&self, changes: &[RecordChange]) -> Result<()> {
        (**self).handle_batch(changes).await
    }
}

/// Per-handler registration options.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Stable id. Required to be unique; defaults to `<events>:<index>`.
    /// Deferred handlers are looked up by id when the worker runs them, so
    /// producer and worker must register them identically.
    pub id: Option<String>,
    pub filter: Option<FilterSpec>,
    /// Batch handlers only: split the batch into one call per distinct value
    /// of this attribute path in the matched image.
    pub batch_key: Option<String>,
    pub deferred: Option<DeferSpec>,
    /// Skip records written outside the router's configured region.
    pub same_region_only: bool,
    pub timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn batch_key(mut self, path: impl Into<String>) -> Self {
        self.batch_key = Some(path.into());
        self
    }

    pub fn deferred(mut self, spec: DeferSpec) -> Self {
        self.deferred = Some(spec);
        self
    }

    pub fn same_region_only(mut self) -> Self {
        self.same_region_only = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub(crate) enum HandlerKind {
    Single(Arc<dyn RecordHandler>),
    Batch(Arc<dyn BatchHandler>),
}
