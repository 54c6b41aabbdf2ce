//! PostgreSQL defer queue for ripple.
//!
//! Implements both sides of deferral: [`DeferQueue`] for the router that
//! queues handler invocations while processing a stream batch, and
//! [`DeferStore`] for the worker that claims and runs them later.
//!
//! # Features
//!
//! - Named queues, so workers can drain a subset
//! - Optimistic locking with `FOR UPDATE SKIP LOCKED`
//! - Exponential backoff retry logic
//! - Dead letter for permanently failed invocations
//! - Worker heartbeats and lease reclaim
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TYPE deferred_status AS ENUM ('pending', 'running', 'succeeded', 'dead_letter');
//! CREATE TYPE failure_kind AS ENUM ('retryable', 'non_retryable');
//!
//! CREATE TABLE deferred_invocations (
//!     id UUID PRIMARY KEY,
//!     queue TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!
//!     -- Execution
//!     status deferred_status NOT NULL DEFAULT 'pending',
//!     attempt INTEGER NOT NULL DEFAULT 1,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!
//!     -- Scheduling
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     -- Worker tracking
//!     worker_id TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!
//!     -- Error tracking
//!     error_message TEXT,
//!     error_kind failure_kind,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_deferred_ready ON deferred_invocations (queue, priority, run_at)
//!     WHERE status = 'pending';
//! CREATE INDEX idx_deferred_lease ON deferred_invocations (lease_expires_at)
//!     WHERE status = 'running' AND lease_expires_at IS NOT NULL;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ripple_queue_postgres::PgDeferQueue;
//! use ripple_core::DrainOptions;
//! use sqlx::PgPool;
//! use std::time::Duration;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let queue = Arc::new(PgDeferQueue::new(pool));
//!
//! let router = RouterBuilder::new(config)
//!     .with_defer_queue(queue.clone())
//!     .on_insert_with(matcher, handler, HandlerOptions::new().deferred(DeferSpec::new()))
//!     .build()?;
//!
//! // worker: heartbeat well inside the 60s default lease
//! let options = DrainOptions::new()
//!     .with_limit(50)
//!     .with_concurrency(8)
//!     .with_heartbeat_interval(Duration::from_secs(15));
//! ripple_core::drain(queue.as_ref(), &router, "worker-1", &options).await?;
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ripple_core::{ClaimedInvocation, DeferQueue, DeferSpec, DeferStore, FailureKind, DEFAULT_DEFER_QUEUE};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest retry backoff.
const MAX_BACKOFF_SECS: i64 = 3600;

/// PostgreSQL defer queue.
#[derive(Clone)]
pub struct PgDeferQueue {
    pool: PgPool,
    default_lease_ms: i64,
    /// Queues this instance claims from. Empty means all queues.
    queues: Vec<String>,
}

impl PgDeferQueue {
    /// Lease timeout defaults to 60 seconds.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease_ms: 60_000,
            queues: Vec::new(),
        }
    }

    /// The lease timeout determines how long a worker can hold an
    /// invocation before it is considered abandoned.
    pub fn with_lease_timeout(mut self, lease_ms: i64) -> Self {
        self.default_lease_ms = lease_ms;
        self
    }

    /// Only claim from the named queues.
    pub fn claiming_from<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(
        &self,
        payload: serde_json::Value,
        spec: DeferSpec,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let queue = spec.queue.unwrap_or_else(|| DEFAULT_DEFER_QUEUE.to_string());

        sqlx::query(
            r#"
            INSERT INTO deferred_invocations (id, queue, payload, priority, max_retries, run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&queue)
        .bind(payload)
        .bind(spec.priority)
        .bind(spec.max_retries)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        debug!(%id, queue = %queue, %run_at, "invocation queued");
        Ok(id)
    }
}

#[async_trait]
impl DeferQueue for PgDeferQueue {
    async fn enqueue(&self, payload: serde_json::Value, spec: DeferSpec) -> Result<Uuid> {
        self.insert(payload, spec, Utc::now()).await
    }

    async fn schedule(
        &self,
        payload: serde_json::Value,
        spec: DeferSpec,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.insert(payload, spec, run_at).await
    }
}

#[async_trait]
impl DeferStore for PgDeferQueue {
    /// Claim ready invocations, lowest priority value first.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the
    /// same row.
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedInvocation>> {
        let lease_expires_at = Utc::now() + Duration::milliseconds(self.default_lease_ms);

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM deferred_invocations
                WHERE status = 'pending'
                  AND run_at <= NOW()
                  AND (cardinality($4::text[]) = 0 OR queue = ANY($4))
                ORDER BY priority ASC, run_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE deferred_invocations
            SET status = 'running',
                worker_id = $2,
                lease_expires_at = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, queue, payload, attempt
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .bind(lease_expires_at)
        .bind(&self.queues)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ClaimedInvocation {
                id: row.get("id"),
                queue: row.get("queue"),
                payload: row.get("payload"),
                attempt: row.get("attempt"),
            })
            .collect())
    }

    async fn mark_succeeded(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deferred_invocations
            SET status = 'succeeded',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retryable failures under the retry limit go back to pending after
    /// `2^attempt` seconds (capped at an hour). Everything else is dead
    /// lettered.
    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT attempt, max_retries FROM deferred_invocations WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let attempt: i32 = row.get("attempt");
        let max_retries: i32 = row.get("max_retries");

        match kind {
            FailureKind::Retryable if attempt < max_retries => {
                let retry_at = Utc::now() + Duration::seconds(backoff_secs(attempt));

                sqlx::query(
                    r#"
                    UPDATE deferred_invocations
                    SET status = 'pending',
                        run_at = $1,
                        attempt = attempt + 1,
                        error_message = $2,
                        error_kind = 'retryable',
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(retry_at)
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                debug!(%id, attempt, %retry_at, "invocation scheduled for retry");
            }
            _ => {
                sqlx::query(
                    r#"
                    UPDATE deferred_invocations
                    SET status = 'dead_letter',
                        error_message = $1,
                        error_kind = $2::failure_kind,
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(error)
                .bind(failure_kind_label(kind))
                .bind(id)
                .execute(&mut *tx)
                .await?;

                warn!(%id, attempt, ?kind, error, "invocation dead lettered");
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Workers should call this periodically for long-running invocations
    /// so they are not reclaimed.
    async fn heartbeat(&self, id: Uuid) -> Result<()> {
        let lease_expires_at = Utc::now() + Duration::milliseconds(self.default_lease_ms);

        sqlx::query(
            r#"
            UPDATE deferred_invocations
            SET lease_expires_at = $1,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(lease_expires_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Maintenance.
impl PgDeferQueue {
    /// Put invocations whose lease expired back to pending.
    ///
    /// Run periodically from a maintenance task.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE deferred_invocations
            SET status = 'pending',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!(reclaimed = result.rows_affected(), "reclaimed expired invocations");
        }
        Ok(result.rows_affected())
    }

    /// Delete succeeded invocations last touched before `older_than`.
    pub async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM deferred_invocations
            WHERE status = 'succeeded'
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Put a dead-lettered invocation back in its queue with a fresh
    /// attempt count.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deferred_invocations
            SET status = 'pending',
                attempt = 1,
                run_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Counts per status, optionally for one queue.
    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'succeeded') as succeeded,
                COUNT(*) FILTER (WHERE status = 'dead_letter') as dead_letter
            FROM deferred_invocations
            WHERE $1::text IS NULL OR queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            succeeded: row.get("succeeded"),
            dead_letter: row.get("dead_letter"),
        })
    }
}

/// Defer queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub dead_letter: i64,
}

impl QueueStats {
    /// Invocations not yet finished either way.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running
    }
}

fn backoff_secs(attempt: i32) -> i64 {
    2i64.saturating_pow(attempt.max(0) as u32).min(MAX_BACKOFF_SECS)
}

fn failure_kind_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Retryable => "retryable",
        FailureKind::NonRetryable => "non_retryable",
    }
}
