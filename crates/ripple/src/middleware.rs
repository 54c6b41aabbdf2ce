//! Middleware around stream batch processing.
//!
//! Middleware run in registration order. Each one receives the event and a
//! [`Next`] handle; calling [`Next::run`] continues down the chain and
//! finally into the router's dispatch loop. Not calling it short-circuits.

use crate::error::RouterError;
use crate::record::StreamEvent;
use crate::router::{ProcessOutcome, StreamRouter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(
        &self,
        event: &StreamEvent,
        next: Next<'_>,
    ) -> Result<ProcessOutcome, RouterError>;
}

/// The rest of the middleware chain.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    router: &'a StreamRouter,
}

impl<'a> Next<'a> {
    pub(crate) fn new(remaining: &'a [Arc<dyn Middleware>], router: &'a StreamRouter) -> Self {
        Self { remaining, router }
    }

    pub async fn run(self, event: &StreamEvent) -> Result<ProcessOutcome, RouterError> {
        match self.remaining.split_first() {
            Some((first, rest)) => first.handle(event, Next::new(rest, self.router)).await,
            None => self.router.dispatch(event).await,
        }
    }
}

/// Logs a summary line per stream batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(
        &self,
        event: &StreamEvent,
        next: Next<'_>,
    ) -> Result<ProcessOutcome, RouterError> {
        let started = Instant::now();
        let result = next.run(event).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => tracing::info!(
                records = outcome.records,
                invocations = outcome.invocations,
                deferred = outcome.deferred,
                failures = outcome.failures.len(),
                elapsed_ms,
                "stream batch processed"
            ),
            Err(error) => tracing::error!(%error, elapsed_ms, "stream batch failed"),
        }
        result
    }
}
