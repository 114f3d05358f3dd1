//! # Batched Persistence
//!
//! Admitted errors are buffered and written to the relational store in bulk.
//! A batch is flushed when it reaches `batch_size` or `batch_timeout_ms` after
//! its first item was queued, whichever comes first. A failed flush puts the
//! whole batch back at the head of the queue and re-arms the timer, so rows
//! are written at least once. Until that retry succeeds only the timer writes;
//! a full batch no longer triggers an inline flush.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, error, info};

use crate::monitoring::{EngineStats, PipelineEvent};
use crate::types::ErrorDetails;

/// Rows per INSERT statement, keeping bind parameters under the Postgres limit
const MAX_ROWS_PER_STATEMENT: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 5_000,
        }
    }
}

/// Durable sink for handled errors
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ErrorStore: Send + Sync {
    /// Writes all rows or none
    async fn insert_batch(&self, errors: &[ErrorDetails]) -> anyhow::Result<()>;

    /// Cheap liveness probe
    async fn ping(&self) -> anyhow::Result<()>;
}

/// PostgreSQL store backed by the `error_logs` table
pub struct PostgresErrorStore {
    pool: PgPool,
}

impl PostgresErrorStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `error_logs` table if it does not exist
    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS error_logs (
                id UUID PRIMARY KEY,
                message TEXT NOT NULL,
                code VARCHAR(255) NOT NULL,
                stack TEXT,
                severity VARCHAR(16) NOT NULL,
                category VARCHAR(32) NOT NULL,
                source VARCHAR(255) NOT NULL,
                user_id VARCHAR(255),
                request_id VARCHAR(255),
                correlation_id VARCHAR(255),
                retry_count INTEGER NOT NULL DEFAULT 0,
                recovery_attempted BOOLEAN NOT NULL DEFAULT FALSE,
                recovery_successful BOOLEAN NOT NULL DEFAULT FALSE,
                context JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create error_logs table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS error_logs_category_created_at ON error_logs (category, created_at)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create error_logs index")?;

        info!("error_logs table initialized");
        Ok(())
    }
}

#[async_trait]
impl ErrorStore for PostgresErrorStore {
    async fn insert_batch(&self, errors: &[ErrorDetails]) -> anyhow::Result<()> {
        if errors.is_empty() {
            return Ok(());
        }

        // Dropping the transaction on an early return rolls it back
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        for chunk in errors.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO error_logs (id, message, code, stack, severity, category, source, \
                 user_id, request_id, correlation_id, retry_count, recovery_attempted, \
                 recovery_successful, context, created_at) ",
            );

            builder.push_values(chunk, |mut row, error| {
                row.push_bind(error.id)
                    .push_bind(&error.message)
                    .push_bind(&error.code)
                    .push_bind(&error.stack)
                    .push_bind(error.severity.as_str())
                    .push_bind(error.category.as_str())
                    .push_bind(&error.source)
                    .push_bind(&error.user_id)
                    .push_bind(&error.request_id)
                    .push_bind(&error.correlation_id)
                    .push_bind(i32::try_from(error.retry_count).unwrap_or(i32::MAX))
                    .push_bind(error.recovery_attempted)
                    .push_bind(error.recovery_successful)
                    .push_bind(sqlx::types::Json(&error.context))
                    .push_bind(error.timestamp);
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");

            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert error batch")?;
        }

        tx.commit().await.context("Failed to commit error batch")?;
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

#[derive(Default)]
struct BatchState {
    queue: Vec<ErrorDetails>,
    /// Generation of the armed flush timer, if any
    timer: Option<u64>,
    next_timer: u64,
    /// Set after a failed write until a later write succeeds
    retry_pending: bool,
}

pub struct BatchPersister {
    store: Arc<dyn ErrorStore>,
    config: BatchConfig,
    stats: Arc<EngineStats>,
    state: Mutex<BatchState>,
    weak_self: Weak<BatchPersister>,
}

impl BatchPersister {
    pub fn new(store: Arc<dyn ErrorStore>, config: BatchConfig, stats: Arc<EngineStats>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store,
            config,
            stats,
            state: Mutex::new(BatchState::default()),
            weak_self: weak_self.clone(),
        })
    }

    /// Queues an error, flushing inline once the batch is full
    pub async fn enqueue(&self, error: ErrorDetails) {
        let ready = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.queue.push(error);

            if state.queue.len() >= self.config.batch_size && !state.retry_pending {
                Some(Self::take_batch(&mut state))
            } else {
                self.arm_timer(&mut state);
                None
            }
        };

        if let Some(batch) = ready {
            self.write_batch(batch).await;
        }
    }

    /// Writes everything queued right now. Returns the number of rows persisted.
    pub async fn flush(&self) -> usize {
        let batch = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            Self::take_batch(&mut state)
        };

        self.write_batch(batch).await
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    fn take_batch(state: &mut BatchState) -> Vec<ErrorDetails> {
        state.timer = None;
        std::mem::take(&mut state.queue)
    }

    fn arm_timer(&self, state: &mut BatchState) {
        if state.timer.is_some() || state.queue.is_empty() {
            return;
        }

        let generation = state.next_timer;
        state.next_timer = state.next_timer.wrapping_add(1);
        state.timer = Some(generation);

        let weak = self.weak_self.clone();
        let timeout = Duration::from_millis(self.config.batch_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(persister) = weak.upgrade() {
                persister.on_timer(generation).await;
            }
        });
    }

    async fn on_timer(&self, generation: u64) {
        let batch = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            // A flush since arming already took this batch
            if state.timer != Some(generation) {
                return;
            }
            Self::take_batch(&mut state)
        };

        debug!(rows = batch.len(), "Batch timeout reached, flushing");
        self.write_batch(batch).await;
    }

    async fn write_batch(&self, mut batch: Vec<ErrorDetails>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let rows = batch.len();
        match self.store.insert_batch(&batch).await {
            Ok(()) => {
                self.state.lock().unwrap_or_else(|e| e.into_inner()).retry_pending = false;
                self.stats.record_n(PipelineEvent::Persisted, rows as u64);
                debug!(rows, "Persisted error batch");
                rows
            }
            Err(e) => {
                self.stats.record(PipelineEvent::PersistFailure);
                error!(rows, error = %e, "Failed to persist error batch, re-queueing");

                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                batch.append(&mut state.queue);
                state.queue = batch;
                state.retry_pending = true;
                self.arm_timer(&mut state);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn error(n: usize) -> ErrorDetails {
        ErrorDetails::new(format!("failure {}", n))
    }

    fn persister(store: MockErrorStore, batch_size: usize) -> Arc<BatchPersister> {
        BatchPersister::new(
            Arc::new(store),
            BatchConfig {
                batch_size,
                batch_timeout_ms: 5_000,
            },
            Arc::new(EngineStats::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_when_batch_is_full() {
        let mut store = MockErrorStore::new();
        store
            .expect_insert_batch()
            .withf(|errors| errors.len() == 100)
            .times(1)
            .returning(|_| Ok(()));

        let persister = persister(store, 100);
        for n in 0..100 {
            persister.enqueue(error(n)).await;
        }

        assert_eq!(persister.pending(), 0);
        assert_eq!(persister.stats.get(PipelineEvent::Persisted), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_timeout() {
        let written = Arc::new(AtomicUsize::new(0));
        let counter = written.clone();
        let mut store = MockErrorStore::new();
        store.expect_insert_batch().times(1).returning(move |errors| {
            counter.fetch_add(errors.len(), Ordering::SeqCst);
            Ok(())
        });

        let persister = persister(store, 100);
        persister.enqueue(error(1)).await;
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        persister.enqueue(error(2)).await;

        // The timer runs from the first unflushed item
        tokio::time::sleep(Duration::from_millis(2_999)).await;
        assert_eq!(written.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(written.load(Ordering::SeqCst), 2);
        assert_eq!(persister.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_requeues_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut store = MockErrorStore::new();
        store.expect_insert_batch().returning(move |errors| {
            let call = seen.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Err(anyhow::anyhow!("connection reset"))
            } else {
                assert_eq!(errors.len(), 3);
                assert_eq!(errors[0].message, "failure 0");
                Ok(())
            }
        });

        let persister = persister(store, 2);
        persister.enqueue(error(0)).await;
        persister.enqueue(error(1)).await;

        assert_eq!(persister.pending(), 2);
        assert_eq!(persister.stats.get(PipelineEvent::PersistFailure), 1);

        // Only the re-armed timer retries
        persister.enqueue(error(2)).await;
        assert_eq!(persister.pending(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(persister.pending(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(persister.stats.get(PipelineEvent::Persisted), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_does_not_rewrite_backlog_per_enqueue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut store = MockErrorStore::new();
        store.expect_insert_batch().returning(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("database is down"))
        });

        let persister = persister(store, 100);
        for n in 0..300 {
            persister.enqueue(error(n)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(persister.pending(), 300);

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(persister.pending(), 300);
        assert_eq!(persister.stats.get(PipelineEvent::PersistFailure), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_rearms_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut store = MockErrorStore::new();
        store.expect_insert_batch().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow::anyhow!("database is down"))
            } else {
                Ok(())
            }
        });

        let persister = persister(store, 100);
        persister.enqueue(error(0)).await;

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(persister.pending(), 1);

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(persister.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_of_empty_queue_skips_store() {
        let mut store = MockErrorStore::new();
        store.expect_insert_batch().never();

        let persister = persister(store, 10);
        assert_eq!(persister.flush().await, 0);
    }
}
