//! src/worker_pool.rs
//!
//! `WorkerPool` — drains the execution queue and supervises each job
//! through its full lifecycle (spec.md §4.6). The per-job state machine
//! mirrors the teacher's `NodeGuardian::execute_lifecycle` in
//! `guardian.rs`: setup, execute, finalize, teardown, with resources
//! freed in a path that always runs regardless of how execution ended.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::domain::{exit_codes, format_exit_code, Job, JobState};
use crate::error::WorkerError;
use crate::faststore::queue::ExecutionQueue;
use crate::faststore::registry::WorkerRegistry;
use crate::domain::WorkerPresence;
use crate::resource_manager::ResourceManager;
use crate::store::JobRepository;
use crate::supervisor::ProcessSupervisor;

const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PENDING_POLL_BOUND: Duration = Duration::from_secs(3600);

pub struct WorkerPool {
    worker_id: String,
    node_name: String,
    cpus: i32,
    resources: Arc<ResourceManager>,
    registry: Arc<dyn WorkerRegistry>,
    queue: Arc<dyn ExecutionQueue>,
    supervisor: Arc<ProcessSupervisor>,
    heartbeat_interval: Duration,
    presence_ttl: Duration,
    concurrency: usize,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        node_name: String,
        cpus: i32,
        resources: Arc<ResourceManager>,
        registry: Arc<dyn WorkerRegistry>,
        queue: Arc<dyn ExecutionQueue>,
        supervisor: Arc<ProcessSupervisor>,
        heartbeat_interval: Duration,
        presence_ttl: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            worker_id,
            node_name,
            cpus,
            resources,
            registry,
            queue,
            supervisor,
            heartbeat_interval,
            presence_ttl,
            concurrency,
        }
    }

    /// Registers this worker, detecting and clearing any stale record
    /// left by a prior unclean exit under the same name (spec.md §4.6
    /// "worker-name collision on restart").
    pub async fn register(&self) -> Result<(), WorkerError> {
        self.registry.unregister(&self.worker_id).await?;
        let presence = WorkerPresence {
            worker_id: self.worker_id.clone(),
            cpus: self.cpus,
            status: "alive".to_string(),
            hostname: self.node_name.clone(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };
        self.registry
            .register(&presence, self.presence_ttl.as_secs())
            .await?;
        Ok(())
    }

    pub async fn run_heartbeat_loop(&self, stop: Arc<std::sync::atomic::AtomicBool>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            interval.tick().await;
            if stop.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            if let Err(e) = self.registry.heartbeat(&self.worker_id, self.presence_ttl.as_secs()).await {
                log::warn!("heartbeat failed for {}: {e}", self.worker_id);
            }
        }
    }

    /// Main drain loop: blocks on the queue, spawns each job's execution
    /// under a semaphore permit bounding `concurrency` in-flight jobs.
    pub async fn run(&self, stop: Arc<std::sync::atomic::AtomicBool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        loop {
            if stop.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            let job_id = match self.queue.dequeue(1.0).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("queue dequeue failed: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let this = self.clone_handles();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = this.execute_job(job_id).await {
                    log::error!("job {job_id} execution error: {e}");
                }
                if let Err(e) = this.queue.ack(job_id).await {
                    log::warn!("failed to ack job {job_id}: {e}");
                }
            });
        }
    }

    /// Cheap `Arc`-sharing clone for handing a second handle (the
    /// heartbeat loop) to its own task alongside the drain loop in `run`.
    pub fn clone_for_heartbeat(&self) -> WorkerPool {
        self.clone_handles()
    }

    fn clone_handles(&self) -> WorkerPool {
        WorkerPool {
            worker_id: self.worker_id.clone(),
            node_name: self.node_name.clone(),
            cpus: self.cpus,
            resources: self.resources.clone(),
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            supervisor: self.supervisor.clone(),
            heartbeat_interval: self.heartbeat_interval,
            presence_ttl: self.presence_ttl,
            concurrency: self.concurrency,
        }
    }

    async fn execute_job(&self, job_id: i64) -> Result<(), WorkerError> {
        let Some(mut job) = self.resources.get_job(job_id).await? else {
            log::info!("job {job_id} not found, dropping work item");
            return Ok(());
        };
        if job.state.is_terminal() {
            log::info!("job {job_id} already terminal ({:?}), dropping work item", job.state);
            return Ok(());
        }

        if job.state == JobState::Pending {
            job = self.wait_for_running(job_id).await?;
        }

        let allocated = self.resources.transition_to_allocated(job_id).await?;
        if !allocated {
            log::warn!("job {job_id} had no reserved allocation to promote; proceeding without cache credit");
        }

        let launched = match self.supervisor.launch(&job).await {
            Ok(l) => l,
            Err(e) => {
                self.finish_job(
                    job_id,
                    Some(exit_codes::LAUNCH_FAILED.to_string()),
                    Some(format!("launch failed: {e}")),
                )
                .await?;
                return Ok(());
            }
        };

        self.resources.record_pid(job_id, launched.pid).await?;

        let finished = self.supervisor.wait(launched.child).await;

        match finished {
            Ok(outcome) => {
                let exit_code = format_exit_code(outcome.exit_code, outcome.signal);
                let error_msg = if outcome.exit_code != 0 {
                    Some(format!("script exited with code {}", outcome.exit_code))
                } else {
                    None
                };
                self.finish_job(job_id, Some(exit_code), error_msg).await?;
            }
            Err(e) => {
                self.finish_job(
                    job_id,
                    Some(exit_codes::SUPERVISOR_WAIT_FAILED.to_string()),
                    Some(format!("supervisor wait failed: {e}")),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Release-then-mark-terminal, in that order, on every exit path —
    /// the rule spec.md §4.6 calls out as non-negotiable.
    async fn finish_job(
        &self,
        job_id: i64,
        exit_code: Option<String>,
        error_msg: Option<String>,
    ) -> Result<(), WorkerError> {
        self.resources.release(job_id).await?;
        let state = if error_msg.is_some() {
            JobState::Failed
        } else {
            JobState::Completed
        };
        self.resources
            .store()
            .mark_terminal(job_id, state, exit_code, error_msg)
            .await?;
        Ok(())
    }

    async fn wait_for_running(&self, job_id: i64) -> Result<Job, WorkerError> {
        let deadline = tokio::time::Instant::now() + PENDING_POLL_BOUND;
        loop {
            if let Some(job) = self.resources.get_job(job_id).await? {
                if job.state != JobState::Pending {
                    return Ok(job);
                }
            } else {
                return Err(WorkerError::JobNotFound(job_id));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WorkerError::NeverStarted(job_id));
            }
            tokio::time::sleep(PENDING_POLL_INTERVAL).await;
        }
    }

    /// Handles an external cancel request: flips the job to `cancelled`
    /// and signals the recorded PID's process group. Idempotent per
    /// spec.md §4.6 — re-cancelling a terminal job is a success no-op.
    pub async fn cancel(&self, job_id: i64) -> Result<(), WorkerError> {
        let cancelled = self.resources.store().cancel_if_cancellable(job_id).await?;
        if !cancelled {
            return Ok(());
        }
        if let Some(allocation) = self.resources.get_allocation(job_id).await? {
            if let Some(pid) = allocation.process_id {
                let _ = self.supervisor.cancel(pid);
            }
        }
        Ok(())
    }
}
