//! src/scheduler.rs
//!
//! `SchedulerDaemon` — the admission loop (spec.md §4.5). Structured
//! the way the teacher's own daemon loops tick on a `tokio::time::interval`
//! and check a stop flag between iterations (see `main.rs`'s
//! `ctrl_c()`-driven shutdown).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::JobState;
use crate::faststore::queue::ExecutionQueue;
use crate::resource_manager::ResourceManager;
use crate::store::JobRepository;

pub struct SchedulerDaemon {
    resources: Arc<ResourceManager>,
    queue: Arc<dyn ExecutionQueue>,
    node_name: String,
    tick_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl SchedulerDaemon {
    pub fn new(
        resources: Arc<ResourceManager>,
        queue: Arc<dyn ExecutionQueue>,
        node_name: String,
        tick_interval: Duration,
    ) -> Self {
        Self {
            resources,
            queue,
            node_name,
            tick_interval,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            if self.stop.load(Ordering::Relaxed) {
                log::info!("scheduler daemon stopping");
                return;
            }
            if let Err(e) = self.tick().await {
                log::warn!("scheduler tick failed, will retry next interval: {e}");
            }
        }
    }

    /// Runs a single admission pass. Exposed separately from `run` so
    /// tests can drive ticks deterministically without a timer.
    pub async fn tick(&self) -> Result<usize, crate::error::SchedulerError> {
        let total = self.resources.total_cpus().await;
        if total == 0 {
            return Ok(0);
        }
        let mut available = self.resources.available_cpus().await?;

        let pending = self.resources.store().list_pending_fifo(256).await?;
        let mut admitted = 0usize;

        for job in pending {
            let required = job.resources.total_cpus_required();
            if required > available {
                continue;
            }

            self.resources.reserve(job.id, required).await?;
            let committed = self
                .resources
                .store()
                .transition_to_running(job.id, vec![self.node_name.clone()])
                .await?;
            if !committed {
                // Lost the race (e.g. cancelled between list and commit); undo the
                // reservation rather than leave an orphaned one behind.
                self.resources.release(job.id).await?;
                continue;
            }

            if let Err(e) = self.queue.enqueue(job.id).await {
                log::warn!(
                    "job {} reserved but enqueue failed, leaving for stale_reservation_cleanup: {e}",
                    job.id
                );
            }

            available -= required;
            admitted += 1;
        }

        Ok(admitted)
    }
}

/// True once a job's state makes it ineligible for further admission
/// consideration — used by tests and the worker's idempotent drop path.
pub fn is_terminal_or_running(state: JobState) -> bool {
    state.is_terminal() || matches!(state, JobState::Running)
}
