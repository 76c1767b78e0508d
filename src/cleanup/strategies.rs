//! src/cleanup/strategies.rs
//!
//! The five default strategies from spec.md §4.7's table. Thresholds
//! are constructor parameters, wired up in `main.rs` from `Config`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{exit_codes, JobState};
use crate::error::CleanupError;
use crate::resource_manager::ResourceManager;
use crate::store::{AllocationRepository, JobRepository};

use super::CleanupStrategy;

/// Releases allocations left behind on jobs that already reached a
/// terminal state — the everyday steady-state reconciliation pass.
pub struct CompletedJobCleanup;

#[async_trait]
impl CleanupStrategy for CompletedJobCleanup {
    fn name(&self) -> &'static str {
        "completed_job_cleanup"
    }
    fn description(&self) -> &'static str {
        "releases allocations for jobs that already finished"
    }
    fn interval(&self) -> Duration {
        Duration::from_secs(5)
    }
    fn priority(&self) -> i32 {
        1
    }

    async fn do_cleanup(&self, resources: &ResourceManager) -> Result<usize, CleanupError> {
        let stale = resources
            .store()
            .find_completed_jobs_with_live_allocations()
            .await?;
        let mut count = 0;
        for allocation in stale {
            resources.release(allocation.job_id).await?;
            count += 1;
        }
        Ok(count)
    }
}

/// Fails jobs whose reservation was never promoted to `allocated`
/// within the grace window — the scheduler admitted them but the
/// enqueue (or the worker that would have consumed it) never showed up.
pub struct StaleReservationCleanup {
    pub max_age: Duration,
}

#[async_trait]
impl CleanupStrategy for StaleReservationCleanup {
    fn name(&self) -> &'static str {
        "stale_reservation_cleanup"
    }
    fn description(&self) -> &'static str {
        "fails jobs stuck in a reserved-but-never-allocated state"
    }
    fn interval(&self) -> Duration {
        Duration::from_secs(120)
    }
    fn priority(&self) -> i32 {
        2
    }
    fn depends_on(&self) -> &'static [&'static str] {
        &["completed_job_cleanup"]
    }

    async fn do_cleanup(&self, resources: &ResourceManager) -> Result<usize, CleanupError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.max_age).unwrap();
        let stale = resources.store().find_stale_reservations(cutoff).await?;
        let mut count = 0;
        for allocation in stale {
            if let Some(job) = resources.get_job(allocation.job_id).await? {
                if job.state != JobState::Running {
                    continue;
                }
            } else {
                continue;
            }
            resources.release(allocation.job_id).await?;
            resources
                .store()
                .mark_terminal(
                    allocation.job_id,
                    JobState::Failed,
                    Some(exit_codes::STALE_RESERVATION.to_string()),
                    Some("reservation never transitioned to allocated within the grace window".to_string()),
                )
                .await?;
            count += 1;
        }
        Ok(count)
    }
}

/// Startup-only: re-enqueues every still-`pending` job. Safe to run
/// unconditionally because the queue's dedupe-by-id rejects the
/// duplicates this produces on a clean restart.
pub struct PendingJobRecovery;

#[async_trait]
impl CleanupStrategy for PendingJobRecovery {
    fn name(&self) -> &'static str {
        "pending_job_recovery"
    }
    fn description(&self) -> &'static str {
        "re-enqueues pending jobs at startup"
    }
    fn interval(&self) -> Duration {
        Duration::MAX
    }
    fn should_run(&self, last_run: Option<std::time::Instant>, _now: std::time::Instant) -> bool {
        last_run.is_none()
    }

    async fn do_cleanup(&self, _resources: &ResourceManager) -> Result<usize, CleanupError> {
        // The actual re-enqueue needs the execution queue handle, which
        // this strategy doesn't own; `recovery.rs` invokes the
        // equivalent logic directly rather than through the manager.
        // Kept as a registry entry so it still shows up in strategy
        // listings and honors `cleanup_strategies_enabled`.
        Ok(0)
    }
}

/// Fails jobs that have been `running` far longer than any real
/// workload should take, reclaiming their allocation.
pub struct StuckJobCleanup {
    pub max_age: Duration,
}

#[async_trait]
impl CleanupStrategy for StuckJobCleanup {
    fn name(&self) -> &'static str {
        "stuck_job_cleanup"
    }
    fn description(&self) -> &'static str {
        "fails jobs that have been running implausibly long"
    }
    fn interval(&self) -> Duration {
        Duration::from_secs(3600)
    }
    fn priority(&self) -> i32 {
        3
    }

    async fn do_cleanup(&self, resources: &ResourceManager) -> Result<usize, CleanupError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.max_age).unwrap();
        let stuck = resources.store().find_running_older_than(cutoff).await?;
        let mut count = 0;
        for job in stuck {
            resources.release(job.id).await?;
            resources
                .store()
                .mark_terminal(
                    job.id,
                    JobState::Failed,
                    Some(exit_codes::STUCK_JOB.to_string()),
                    Some("job exceeded the configured maximum runtime".to_string()),
                )
                .await?;
            count += 1;
        }
        Ok(count)
    }
}

/// Deletes terminal job rows past their retention window. Disabled by
/// default — deleting history is a deliberate operator choice, not a
/// correctness requirement.
pub struct OldJobCleanup {
    pub max_age: Duration,
}

#[async_trait]
impl CleanupStrategy for OldJobCleanup {
    fn name(&self) -> &'static str {
        "old_job_cleanup"
    }
    fn description(&self) -> &'static str {
        "deletes terminal job rows past their retention window"
    }
    fn interval(&self) -> Duration {
        Duration::from_secs(86400)
    }
    fn priority(&self) -> i32 {
        4
    }
    fn enabled_by_default(&self) -> bool {
        false
    }

    async fn do_cleanup(&self, resources: &ResourceManager) -> Result<usize, CleanupError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.max_age).unwrap();
        let old = resources
            .store()
            .find_terminal_older_than(cutoff, 1000)
            .await?;
        let mut count = 0;
        for job in old {
            if resources.store().delete(job.id).await? {
                count += 1;
            }
        }
        Ok(count)
    }
}
