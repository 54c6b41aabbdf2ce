//! Handler registration and the dispatch loop.

use crate::config::{FailurePolicy, RouterConfig};
use crate::defer::{DeferQueue, DeferSpec, DeferredInvocation};
use crate::diff::AttributeDiff;
use crate::error::RouterError;
use crate::handler::{BatchHandler, HandlerKind, HandlerOptions, RecordHandler, ANY_EVENT};
use crate::matcher::Matcher;
use crate::middleware::{Middleware, Next};
use crate::record::{EventName, RecordChange, StreamEvent, StreamRecord};
use crate::value::canonical_key;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// Outcome
// ============================================================================

/// What happened while processing one stream batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    pub records: usize,
    /// Handler calls made inline (a batch handler call counts once).
    pub invocations: usize,
    pub deferred: usize,
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub sequence_number: String,
    pub handler_id: Option<String>,
    pub error: String,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Partial batch response naming each failed record once.
    pub fn batch_item_failures(&self) -> BatchResponse {
        let mut seen = HashSet::new();
        let batch_item_failures = self
            .failures
            .iter()
            .filter(|f| seen.insert(f.sequence_number.as_str()))
            .map(|f| BatchItemFailure {
                item_identifier: f.sequence_number.clone(),
            })
            .collect();
        BatchResponse {
            batch_item_failures,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

// ============================================================================
// Builder
// ============================================================================

struct Registration {
    id: String,
    events: &'static [EventName],
    matcher: Matcher,
    options: HandlerOptions,
    kind: HandlerKind,
}

/// Builder for [`StreamRouter`].
///
/// ```ignore
/// let router = RouterBuilder::new(RouterConfig::from_env()?)
///     .on_insert(Matcher::field_equals("type", "user"), WelcomeEmail)
///     .on_modify_with(
///         Matcher::field_equals("type", "user"),
///         EmailChanged,
///         HandlerOptions::new().filter(FilterSpec::attribute("email")),
///     )
///     .with_middleware(TracingMiddleware)
///     .build()?;
///
/// let outcome = router.process(&event).await?;
/// ```
pub struct RouterBuilder {
    config: RouterConfig,
    registrations: Vec<Registration>,
    middleware: Vec<Arc<dyn Middleware>>,
    defer_queue: Option<Arc<dyn DeferQueue>>,
}

impl RouterBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            registrations: Vec::new(),
            middleware: Vec::new(),
            defer_queue: None,
        }
    }

    /// Register a per-record handler for the given event kinds.
    pub fn on<H: RecordHandler>(
        self,
        events: &'static [EventName],
        matcher: Matcher,
        handler: H,
        options: HandlerOptions,
    ) -> Self {
        self.register(events, matcher, HandlerKind::Single(Arc::new(handler)), options)
    }

    /// Register a handler that receives all matched records of a batch at once.
    pub fn on_batch<H: BatchHandler>(
        self,
        events: &'static [EventName],
        matcher: Matcher,
        handler: H,
        options: HandlerOptions,
    ) -> Self {
        self.register(events, matcher, HandlerKind::Batch(Arc::new(handler)), options)
    }

    pub fn on_insert<H: RecordHandler>(self, matcher: Matcher, handler: H) -> Self {
        self.on(&[EventName::Insert], matcher, handler, HandlerOptions::default())
    }

    pub fn on_insert_with<H: RecordHandler>(
        self,
        matcher: Matcher,
        handler: H,
        options: HandlerOptions,
    ) -> Self {
        self.on(&[EventName::Insert], matcher, handler, options)
    }

    pub fn on_modify<H: RecordHandler>(self, matcher: Matcher, handler: H) -> Self {
        self.on(&[EventName::Modify], matcher, handler, HandlerOptions::default())
    }

    pub fn on_modify_with<H: RecordHandler>(
        self,
        matcher: Matcher,
        handler: H,
        options: HandlerOptions,
    ) -> Self {
        self.on(&[EventName::Modify], matcher, handler, options)
    }

    pub fn on_remove<H: RecordHandler>(self, matcher: Matcher, handler: H) -> Self {
        self.on(&[EventName::Remove], matcher, handler, HandlerOptions::default())
    }

    pub fn on_remove_with<H: RecordHandler>(
        self,
        matcher: Matcher,
        handler: H,
        options: HandlerOptions,
    ) -> Self {
        self.on(&[EventName::Remove], matcher, handler, options)
    }

    /// Register for every event kind.
    pub fn on_change<H: RecordHandler>(self, matcher: Matcher, handler: H) -> Self {
        self.on(ANY_EVENT, matcher, handler, HandlerOptions::default())
    }

    pub fn on_change_with<H: RecordHandler>(
        self,
        matcher: Matcher,
        handler: H,
        options: HandlerOptions,
    ) -> Self {
        self.on(ANY_EVENT, matcher, handler, options)
    }

    pub fn with_middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_defer_queue(mut self, queue: Arc<dyn DeferQueue>) -> Self {
        self.defer_queue = Some(queue);
        self
    }

    fn register(
        mut self,
        events: &'static [EventName],
        matcher: Matcher,
        kind: HandlerKind,
        options: HandlerOptions,
    ) -> Self {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| default_id(events, self.registrations.len()));
        self.registrations.push(Registration {
            id,
            events,
            matcher,
            options,
            kind,
        });
        self
    }

    /// Validate registrations and build the router.
    ///
    /// Fails on duplicate ids, filters that can never match, and deferred
    /// handlers without a defer queue.
    pub fn build(self) -> Result<StreamRouter, RouterError> {
        let mut ids = HashSet::new();
        for registration in &self.registrations {
            if !ids.insert(registration.id.as_str()) {
                return Err(RouterError::DuplicateHandler(registration.id.clone()));
            }
            if let Some(filter) = &registration.options.filter {
                filter.validate().map_err(|e| match e {
                    RouterError::InvalidFilter { reason } => RouterError::InvalidHandlerFilter {
                        handler_id: registration.id.clone(),
                        reason,
                    },
                    other => other,
                })?;
            }
            if registration.options.deferred.is_some() && self.defer_queue.is_none() {
                return Err(RouterError::NoDeferQueue(registration.id.clone()));
            }
        }

        debug!(
            handlers = self.registrations.len(),
            middleware = self.middleware.len(),
            region = self.config.region.as_deref().unwrap_or("-"),
            "router built"
        );

        Ok(StreamRouter {
            config: self.config,
            registrations: self.registrations,
            middleware: self.middleware,
            defer_queue: self.defer_queue,
        })
    }
}

fn default_id(events: &[EventName], index: usize) -> String {
    let label = if events.len() == ANY_EVENT.len() {
        "change".to_string()
    } else {
        events
            .iter()
            .map(|e| e.as_str().to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join("+")
    };
    format!("{label}:{index}")
}

// ============================================================================
// Router
// ============================================================================

/// Dispatches stream records to registered handlers.
///
/// Per-record handlers run inline in record order, then in registration
/// order within a record. Batch handlers run once all records have been
/// visited, one call per batch key group.
pub struct StreamRouter {
    config: RouterConfig,
    registrations: Vec<Registration>,
    middleware: Vec<Arc<dyn Middleware>>,
    defer_queue: Option<Arc<dyn DeferQueue>>,
}

/// Matched records waiting for a batch handler, grouped by batch key.
type PendingBatches = IndexMap<usize, IndexMap<Option<String>, Vec<RecordChange>>>;

impl StreamRouter {
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn handler_ids(&self) -> impl Iterator<Item = &str> {
        self.registrations.iter().map(|r| r.id.as_str())
    }

    /// Run a stream batch through the middleware chain and dispatch it.
    pub async fn process(&self, event: &StreamEvent) -> Result<ProcessOutcome, RouterError> {
        Next::new(&self.middleware, self).run(event).await
    }

    pub(crate) async fn dispatch(&self, event: &StreamEvent) -> Result<ProcessOutcome, RouterError> {
        let mut outcome = ProcessOutcome {
            records: event.records.len(),
            ..ProcessOutcome::default()
        };
        let mut batches = PendingBatches::new();

        for record in &event.records {
            let change = match RecordChange::decode(record.clone()) {
                Ok(change) => change,
                Err(error) => {
                    self.fail(&mut outcome, None, record.sequence_number(), error)?;
                    continue;
                }
            };
            self.dispatch_record(&change, &mut outcome, &mut batches)
                .await?;
        }

        for (index, groups) in batches {
            let registration = &self.registrations[index];
            let HandlerKind::Batch(handler) = &registration.kind else {
                continue;
            };
            for (key, changes) in groups {
                debug!(
                    handler = %registration.id,
                    batch_key = key.as_deref().unwrap_or("-"),
                    records = changes.len(),
                    "dispatching batch"
                );
                self.run_batch(registration, handler.as_ref(), &changes, &mut outcome)
                    .await?;
            }
        }

        Ok(outcome)
    }

    async fn dispatch_record(
        &self,
        change: &RecordChange,
        outcome: &mut ProcessOutcome,
        batches: &mut PendingBatches,
    ) -> Result<(), RouterError> {
        let mut diff: Option<Cow<'_, AttributeDiff>> = None;

        for (index, registration) in self.registrations.iter().enumerate() {
            if !self.selects(registration, change, &mut diff) {
                continue;
            }
            debug!(
                handler = %registration.id,
                seq = change.sequence_number(),
                event = %change.event_name(),
                "handler matched"
            );

            match &registration.kind {
                HandlerKind::Batch(_) => {
                    let key = registration.options.batch_key.as_deref().map(|path| {
                        change
                            .subject()
                            .and_then(|image| image.get_path(path))
                            .map(canonical_key)
                            .unwrap_or_default()
                    });
                    batches
                        .entry(index)
                        .or_default()
                        .entry(key)
                        .or_default()
                        .push(change.clone());
                }
                HandlerKind::Single(handler) => {
                    if let Some(spec) = &registration.options.deferred {
                        if let Err(error) = self
                            .defer(registration, spec, vec![change.record.clone()])
                            .await
                        {
                            let seq = change.sequence_number();
                            self.fail(outcome, Some(registration.id.as_str()), seq, error)?;
                        } else {
                            outcome.deferred += 1;
                        }
                        continue;
                    }

                    outcome.invocations += 1;
                    let seq = change.sequence_number();
                    if let Err(error) = self.invoke(registration, seq, handler.handle(change)).await {
                        self.fail(outcome, Some(registration.id.as_str()), seq, error)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Event kind, region, type match, then filter. The diff is computed at
    /// most once per record, and only if some candidate has a filter.
    fn selects<'c>(
        &self,
        registration: &Registration,
        change: &'c RecordChange,
        diff: &mut Option<Cow<'c, AttributeDiff>>,
    ) -> bool {
        if !registration.events.contains(&change.event_name()) {
            return false;
        }
        if registration.options.same_region_only {
            if let Some(region) = self.config.region.as_deref() {
                if !change.record.is_from_region(region) {
                    debug!(
                        handler = %registration.id,
                        seq = change.sequence_number(),
                        record_region = change.record.region.as_deref().unwrap_or("-"),
                        "skipping record from another region"
                    );
                    return false;
                }
            }
        }
        if !registration.matcher.matches(change.subject()) {
            return false;
        }
        match &registration.options.filter {
            None => true,
            Some(filter) => {
                let diff = diff.get_or_insert_with(|| change.diff());
                filter.matches(&**diff, change.old.as_ref(), change.new.as_ref())
            }
        }
    }

    async fn run_batch(
        &self,
        registration: &Registration,
        handler: &dyn BatchHandler,
        changes: &[RecordChange],
        outcome: &mut ProcessOutcome,
    ) -> Result<(), RouterError> {
        let result = match &registration.options.deferred {
            Some(spec) => {
                let records = changes.iter().map(|c| c.record.clone()).collect();
                self.defer(registration, spec, records).await.map(|()| {
                    outcome.deferred += 1;
                })
            }
            None => {
                outcome.invocations += 1;
                let first = changes.first().map(|c| c.sequence_number()).unwrap_or_default();
                self.invoke(registration, first, handler.handle_batch(changes))
                    .await
            }
        };

        if let Err(error) = result {
            if self.config.failure_policy == FailurePolicy::FailFast {
                return Err(error);
            }
            let message = error.to_string();
            warn!(handler = %registration.id, records = changes.len(), error = %message, "batch handler failed");
            outcome.failures.extend(changes.iter().map(|c| RecordFailure {
                sequence_number: c.sequence_number().to_string(),
                handler_id: Some(registration.id.clone()),
                error: message.clone(),
            }));
        }
        Ok(())
    }

    async fn invoke<F>(
        &self,
        registration: &Registration,
        sequence_number: &str,
        call: F,
    ) -> Result<(), RouterError>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let result = match registration.options.timeout {
            None => call.await,
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(RouterError::Timeout {
                        handler_id: registration.id.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
        };
        result.map_err(|source| RouterError::Handler {
            handler_id: registration.id.clone(),
            sequence_number: sequence_number.to_string(),
            source,
        })
    }

    async fn defer(
        &self,
        registration: &Registration,
        spec: &DeferSpec,
        records: Vec<StreamRecord>,
    ) -> Result<(), RouterError> {
        let queue = self
            .defer_queue
            .as_ref()
            .ok_or_else(|| RouterError::NoDeferQueue(registration.id.clone()))?;

        let payload = serde_json::to_value(DeferredInvocation {
            handler_id: registration.id.clone(),
            records,
        })?;
        let mut spec = spec.clone();
        if spec.queue.is_none() {
            spec.queue = Some(self.config.default_defer_queue.clone());
        }

        let queued = match spec.delay {
            Some(delay) => {
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                queue.schedule(payload, spec, run_at).await
            }
            None => queue.enqueue(payload, spec).await,
        };

        let job_id = queued.map_err(|source| RouterError::Defer {
            handler_id: registration.id.clone(),
            source,
        })?;
        debug!(handler = %registration.id, %job_id, "handler deferred");
        Ok(())
    }

    fn fail(
        &self,
        outcome: &mut ProcessOutcome,
        handler_id: Option<&str>,
        sequence_number: &str,
        error: RouterError,
    ) -> Result<(), RouterError> {
        if self.config.failure_policy == FailurePolicy::FailFast {
            return Err(error);
        }
        warn!(
            handler = handler_id.unwrap_or("-"),
            seq = sequence_number,
            %error,
            "record failed"
        );
        outcome.failures.push(RecordFailure {
            sequence_number: sequence_number.to_string(),
            handler_id: handler_id.map(str::to_string),
            error: error.to_string(),
        });
        Ok(())
    }

    /// Run a deferred invocation claimed from a queue.
    ///
    /// The handler runs directly; filters and matchers were already applied
    /// when the invocation was queued. Any failure is returned so the worker
    /// can record it against the job.
    pub async fn process_deferred(&self, payload: serde_json::Value) -> Result<(), RouterError> {
        let invocation: DeferredInvocation = serde_json::from_value(payload)?;
        let registration = self
            .registrations
            .iter()
            .find(|r| r.id == invocation.handler_id)
            .ok_or_else(|| RouterError::UnknownHandler(invocation.handler_id.clone()))?;

        let changes = invocation
            .records
            .into_iter()
            .map(RecordChange::decode)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(handler = %registration.id, records = changes.len(), "running deferred handler");

        match &registration.kind {
            HandlerKind::Single(handler) => {
                for change in &changes {
                    let seq = change.sequence_number();
                    self.invoke(registration, seq, handler.handle(change)).await?;
                }
                Ok(())
            }
            HandlerKind::Batch(handler) => {
                let first = changes.first().map(|c| c.sequence_number()).unwrap_or_default();
                self.invoke(registration, first, handler.handle_batch(&changes))
                    .await
            }
        }
    }
}
