//! src/recovery.rs
//!
//! The startup reconciliation composite (spec.md §4.8). Grounded on the
//! `RecoveryService::recover_orphaned_jobs` shape from the
//! semantica-task-engine example: a sequence of independent sweeps, each
//! counted and logged, none allowed to abort the ones after it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain::{exit_codes, JobState};
use crate::error::StoreError;
use crate::faststore::queue::ExecutionQueue;
use crate::resource_manager::ResourceManager;
use crate::store::{AllocationRepository, JobRepository};
use crate::supervisor::process_alive;

#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub pending_requeued: usize,
    pub orphans_failed: usize,
    pub timeouts_failed: usize,
    pub stale_allocations_released: usize,
}

pub struct Recovery {
    resources: Arc<ResourceManager>,
    queue: Arc<dyn ExecutionQueue>,
    orphan_probe_timeout: Duration,
}

impl Recovery {
    pub fn new(
        resources: Arc<ResourceManager>,
        queue: Arc<dyn ExecutionQueue>,
        orphan_probe_timeout: Duration,
    ) -> Self {
        Self {
            resources,
            queue,
            orphan_probe_timeout,
        }
    }

    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();

        report.pending_requeued = self.recover_pending().await?;
        report.orphans_failed = self.detect_orphans().await?;
        report.timeouts_failed = self.sweep_timeouts().await?;
        report.stale_allocations_released = self.sweep_stale_allocations().await?;

        log::info!(
            "startup recovery complete: {} pending requeued, {} orphans failed, \
             {} timeouts failed, {} stale allocations released",
            report.pending_requeued,
            report.orphans_failed,
            report.timeouts_failed,
            report.stale_allocations_released,
        );
        Ok(report)
    }

    async fn recover_pending(&self) -> Result<usize, StoreError> {
        let pending = self.resources.store().list_pending_fifo(10_000).await?;
        let mut count = 0;
        for job in pending {
            if let Err(e) = self.queue.enqueue(job.id).await {
                log::warn!("pending recovery: failed to re-enqueue job {}: {e}", job.id);
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    async fn detect_orphans(&self) -> Result<usize, StoreError> {
        // All currently-running jobs have a start_time no later than now.
        let running = self.resources.store().find_running_older_than(Utc::now()).await?;
        let mut count = 0;
        for job in running {
            let Some(allocation) = self.resources.get_allocation(job.id).await? else {
                continue;
            };
            let Some(pid) = allocation.process_id else {
                continue;
            };
            if process_alive(pid) {
                continue;
            }
            self.resources.release(job.id).await?;
            self.resources
                .store()
                .mark_terminal(
                    job.id,
                    JobState::Failed,
                    Some(exit_codes::ORPHAN.to_string()),
                    Some("worker process exited without releasing this job's allocation".to_string()),
                )
                .await?;
            count += 1;
        }
        Ok(count)
    }

    async fn sweep_timeouts(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.orphan_probe_timeout).unwrap();
        let overdue = self.resources.store().find_running_older_than(cutoff).await?;
        let mut count = 0;
        for job in overdue {
            // `detect_orphans` already failed every running job whose
            // recorded pid was dead, so whatever's left here is either
            // still genuinely alive past the cutoff or never had a pid
            // recorded at all — both are timeouts (spec.md §4.8 step 3
            // doesn't condition this sweep on process liveness).
            self.resources.release(job.id).await?;
            self.resources
                .store()
                .mark_terminal(
                    job.id,
                    JobState::Failed,
                    Some(exit_codes::TIMEOUT_SWEEP.to_string()),
                    Some("job exceeded the configured maximum runtime at startup".to_string()),
                )
                .await?;
            count += 1;
        }
        Ok(count)
    }

    async fn sweep_stale_allocations(&self) -> Result<usize, StoreError> {
        let live = self
            .resources
            .store()
            .find_completed_jobs_with_live_allocations()
            .await?;
        let mut count = 0;
        for allocation in live {
            self.resources.release(allocation.job_id).await?;
            count += 1;
        }
        Ok(count)
    }
}
