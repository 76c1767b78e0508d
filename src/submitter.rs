//! src/submitter.rs
//!
//! `SubmitterApi` — the external interface (spec.md §6): submit, query,
//! cancel, dashboard. A plain async API with no transport baked in,
//! matching spec.md §9's note that a synchronous/thin request handler
//! suffices because the heavy work is offloaded through the queue; a
//! CLI (`main.rs`) is the only consumer built here.

use std::sync::Arc;

use serde::Serialize;

use crate::domain::{Job, JobState, NewJob};
use crate::error::StoreError;
use crate::faststore::registry::WorkerRegistry;
use crate::resource_manager::ResourceManager;
use crate::store::{AllocationRepository, JobRepository};

pub struct SubmitterApi {
    resources: Arc<ResourceManager>,
    registry: Arc<dyn WorkerRegistry>,
    supervisor: Arc<crate::supervisor::ProcessSupervisor>,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job: Job,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub counts_by_state: std::collections::HashMap<String, i64>,
    pub total_cpus: i32,
    pub allocated_cpus: i32,
    pub available_cpus: i32,
    pub node_list: Vec<String>,
    pub recent_running: Vec<Job>,
    pub recent_pending: Vec<Job>,
    /// Observational only: the absolute difference between the Redis
    /// counter and a fresh `SUM(allocated_cpus)` read straight from
    /// Postgres. A nonzero value just means the next periodic resync
    /// hasn't fired yet; it is not itself an error condition.
    pub cache_vs_store_drift: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job {0} not found")]
    NotFound(i64),
}

impl SubmitterApi {
    pub fn new(
        resources: Arc<ResourceManager>,
        registry: Arc<dyn WorkerRegistry>,
        supervisor: Arc<crate::supervisor::ProcessSupervisor>,
    ) -> Self {
        Self {
            resources,
            registry,
            supervisor,
        }
    }

    /// Creates the job row in `pending`. Does **not** enqueue directly —
    /// admission (and the reservation that goes with it) is the
    /// scheduler's job; this just makes the job visible to it.
    pub async fn submit(&self, spec: NewJob) -> Result<i64, SubmitError> {
        let job = self.resources.store().create_pending(spec).await?;
        Ok(job.id)
    }

    pub async fn query(&self, job_id: i64) -> Result<JobView, SubmitError> {
        let job = self
            .resources
            .get_job(job_id)
            .await?
            .ok_or(SubmitError::NotFound(job_id))?;
        let stdout = read_or_empty(&job.stdout_path).await;
        let stderr = read_or_empty(&job.stderr_path).await;
        Ok(JobView { job, stdout, stderr })
    }

    /// Idempotent: not-found surfaces as an error, but cancelling an
    /// already-terminal job is success with no side effects (spec.md §7).
    pub async fn cancel(&self, job_id: i64) -> Result<(), SubmitError> {
        let job = self
            .resources
            .get_job(job_id)
            .await?
            .ok_or(SubmitError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Ok(());
        }
        let cancelled = self.resources.store().cancel_if_cancellable(job_id).await?;
        if cancelled {
            if let Some(allocation) = self.resources.get_allocation(job_id).await? {
                if let Some(pid) = allocation.process_id {
                    let _ = self.supervisor.cancel(pid);
                }
            }
        }
        Ok(())
    }

    pub async fn dashboard(&self) -> Result<DashboardStats, SubmitError> {
        let workers = self.registry.list_alive().await?;
        let total_cpus = workers.iter().map(|w| w.cpus).sum();
        let node_list = workers.into_iter().map(|w| w.hostname).collect();

        let cached_allocated = total_cpus - self.resources.available_cpus().await?;
        let store_allocated = self.resources.store().sum_allocated_cpus_all().await?;
        let cache_vs_store_drift = (cached_allocated - store_allocated).abs();

        let recent_running = self.resources.store().list_running(20).await?;
        let recent_pending = self.resources.store().list_pending_fifo(20).await?;

        let mut counts_by_state = std::collections::HashMap::new();
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            counts_by_state.insert(state.as_str().to_string(), 0);
        }
        for job in recent_running.iter().chain(recent_pending.iter()) {
            *counts_by_state.entry(job.state.as_str().to_string()).or_insert(0) += 1;
        }

        Ok(DashboardStats {
            counts_by_state,
            total_cpus,
            allocated_cpus: store_allocated,
            available_cpus: (total_cpus - store_allocated).max(0),
            node_list,
            recent_running,
            recent_pending,
            cache_vs_store_drift,
        })
    }
}

async fn read_or_empty(path: &str) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}
