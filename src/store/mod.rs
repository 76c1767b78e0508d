//! src/store/mod.rs
//!
//! The durable store: Postgres via `sqlx`, the single authority for job
//! and allocation state (spec.md §4.2). The fast store (`faststore`) is
//! a best-effort cache layered on top of this, never the other way
//! around.
//!
//! Schema init is idempotent (`CREATE TABLE IF NOT EXISTS`) so the
//! daemon can start against a fresh database with no separate migration
//! step, matching the teacher's `CheckpointStore::new` pattern in
//! `checkpoint.rs` of creating its schema inline on connect.

pub mod allocations;
pub mod jobs;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::domain::{Job, NewJob, ResourceAllocation};
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              BIGSERIAL PRIMARY KEY,
    script          TEXT NOT NULL,
    work_dir        TEXT NOT NULL,
    stdout_path     TEXT NOT NULL,
    stderr_path     TEXT NOT NULL,
    environment     JSONB NOT NULL DEFAULT '{}',
    ntasks_per_node INTEGER NOT NULL,
    cpus_per_task   INTEGER NOT NULL,
    memory_per_node BIGINT NOT NULL,
    time_limit_minutes INTEGER NOT NULL,
    partition       TEXT NOT NULL,
    account         TEXT NOT NULL,
    exclusive       BOOLEAN NOT NULL DEFAULT FALSE,
    priority        INTEGER NOT NULL DEFAULT 0,
    submit_time     TIMESTAMPTZ NOT NULL DEFAULT now(),
    eligible_time   TIMESTAMPTZ NOT NULL DEFAULT now(),
    start_time      TIMESTAMPTZ,
    end_time        TIMESTAMPTZ,
    node_list       JSONB NOT NULL DEFAULT '[]',
    exit_code       TEXT,
    error_msg       TEXT,
    state           TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS jobs_state_idx ON jobs (state);
CREATE INDEX IF NOT EXISTS jobs_state_submit_idx ON jobs (state, submit_time, id);

CREATE TABLE IF NOT EXISTS resource_allocations (
    job_id          BIGINT PRIMARY KEY REFERENCES jobs (id),
    allocated_cpus  INTEGER NOT NULL,
    node_name       TEXT NOT NULL,
    process_id      INTEGER,
    status          TEXT NOT NULL,
    allocated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    released_at     TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS allocations_status_idx ON resource_allocations (status);
CREATE INDEX IF NOT EXISTS allocations_node_status_idx ON resource_allocations (node_name, status);
"#;

/// Retries a fallible operation against the durable store with bounded
/// exponential backoff (spec.md §7: transient errors are retried
/// in-place, contract violations are not). Three attempts, 100ms base.
pub async fn with_retry<T, F, Fut>(op_name: &'static str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let backoff = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_millis(400))
        .with_max_elapsed_time(Some(Duration::from_millis(700)))
        .build();

    let mut attempt = 0usize;
    backoff::future::retry(backoff, || {
        attempt += 1;
        let attempt = attempt;
        async move {
            match f().await {
                Ok(v) => Ok(v),
                Err(e) if e.is_transient() => {
                    log::warn!("{op_name}: transient error on attempt {attempt}, retrying: {e}");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
    .map_err(|e| match e {
        backoff::Error::Transient { err, .. } => err,
        backoff::Error::Permanent(err) => err,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

/// Job bookkeeping: creation, transitions, and the lookups the
/// scheduler/worker/cleanup daemons need. Reservation and allocation of
/// CPUs is expressed in terms of the paired `ResourceAllocation` row
/// (see `AllocationRepository`), never on `Job` itself.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_pending(&self, job: NewJob) -> Result<Job, StoreError>;
    async fn get(&self, job_id: i64) -> Result<Option<Job>, StoreError>;
    async fn list_pending_fifo(&self, limit: i64) -> Result<Vec<Job>, StoreError>;
    async fn list_running(&self, limit: i64) -> Result<Vec<Job>, StoreError>;
    async fn transition_to_running(
        &self,
        job_id: i64,
        node_list: Vec<String>,
    ) -> Result<bool, StoreError>;
    async fn mark_terminal(
        &self,
        job_id: i64,
        state: crate::domain::JobState,
        exit_code: Option<String>,
        error_msg: Option<String>,
    ) -> Result<bool, StoreError>;
    async fn cancel_if_cancellable(&self, job_id: i64) -> Result<bool, StoreError>;
    async fn find_running_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Job>, StoreError>;
    async fn find_terminal_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Hard-deletes a terminal job row. Used only by the
    /// default-disabled `old_job_cleanup` strategy.
    async fn delete(&self, job_id: i64) -> Result<bool, StoreError>;
}

/// The three-state allocation ledger (spec.md §3, §9): `reserved` is
/// written in the same transaction as admission, `allocated` once the
/// worker has a live PID, `released` the moment the process exits —
/// strictly before the job's own terminal state is written.
#[async_trait]
pub trait AllocationRepository: Send + Sync {
    async fn reserve(
        &self,
        job_id: i64,
        allocated_cpus: i32,
        node_name: &str,
    ) -> Result<ResourceAllocation, StoreError>;

    async fn record_pid(&self, job_id: i64, process_id: i32) -> Result<bool, StoreError>;

    async fn transition_to_allocated(&self, job_id: i64) -> Result<bool, StoreError>;

    /// Releases the allocation and returns the status it held prior to
    /// release, or `None` if no row existed (idempotent: releasing an
    /// already-released row succeeds and returns `Released`).
    async fn release(
        &self,
        job_id: i64,
    ) -> Result<Option<crate::domain::AllocationStatus>, StoreError>;

    async fn sum_allocated_cpus(&self, node_name: &str) -> Result<i32, StoreError>;

    /// Global authoritative sum across every node, used by the
    /// dashboard's drift figure; the per-node variant above is what the
    /// cache actually tracks.
    async fn sum_allocated_cpus_all(&self) -> Result<i32, StoreError>;

    async fn get(&self, job_id: i64) -> Result<Option<ResourceAllocation>, StoreError>;

    async fn find_stale_reservations(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ResourceAllocation>, StoreError>;

    /// Reconciliation query (spec.md §4.2): allocations not yet
    /// `released` whose job has already reached a terminal state.
    async fn find_completed_jobs_with_live_allocations(
        &self,
    ) -> Result<Vec<ResourceAllocation>, StoreError>;

    async fn find_allocated_with_dead_pid(
        &self,
        node_name: &str,
        is_alive: &(dyn Fn(i32) -> bool + Send + Sync),
    ) -> Result<Vec<ResourceAllocation>, StoreError>;
}

/// The durable store as a single trait object: everything above this
/// line that consults Postgres does so through `Arc<dyn Store>`, so
/// tests can substitute an in-memory fake (see `testutil`) without
/// a live database.
pub trait Store: JobRepository + AllocationRepository + Send + Sync {}
impl<T: JobRepository + AllocationRepository + Send + Sync> Store for T {}
