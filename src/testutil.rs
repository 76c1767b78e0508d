//! src/testutil.rs
//!
//! In-memory fakes for every repository-shaped trait, so the
//! scheduler/worker/cleanup/recovery logic can be exercised
//! deterministically without a live Postgres or Redis. The "fake
//! repository" pattern here mirrors the teacher's own in-process
//! `ResourceLedger` (`resources.rs`) — a `Mutex`-guarded in-memory
//! structure standing in for a real store. Compiled unconditionally
//! (not behind `#[cfg(test)]`) so both the crate's own unit tests and
//! the integration tests under `tests/` can depend on it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AllocationStatus, Job, JobPriority, JobState, NewJob, ResourceAllocation, ResourceSpec,
};
use crate::error::StoreError;
use crate::faststore::queue::ExecutionQueue;
use crate::faststore::registry::WorkerRegistry;
use crate::faststore::ResourceCache;
use crate::store::{AllocationRepository, JobRepository};

#[derive(Default)]
pub struct FakeStore {
    jobs: Mutex<HashMap<i64, Job>>,
    allocations: Mutex<HashMap<i64, ResourceAllocation>>,
    next_id: Mutex<i64>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a pending job directly, bypassing `create_pending`'s
    /// auto-incrementing id, for tests that want explicit ids.
    pub fn seed_pending(&self, id: i64, cpus: i32, submit_time: DateTime<Utc>) {
        let job = Job {
            id,
            script: "#!/bin/bash\necho hi\n".to_string(),
            work_dir: "/tmp".to_string(),
            stdout_path: "/tmp/out".to_string(),
            stderr_path: "/tmp/err".to_string(),
            environment: HashMap::new(),
            resources: ResourceSpec {
                ntasks_per_node: 1,
                cpus_per_task: cpus,
                memory_per_node: 1024,
                time_limit_minutes: 60,
            },
            partition: "default".to_string(),
            account: "default".to_string(),
            exclusive: false,
            priority: JobPriority::NORMAL,
            submit_time,
            eligible_time: submit_time,
            start_time: None,
            end_time: None,
            node_list: Vec::new(),
            exit_code: None,
            error_msg: None,
            state: JobState::Pending,
        };
        self.jobs.lock().unwrap().insert(id, job);
    }
}

#[async_trait]
impl JobRepository for FakeStore {
    async fn create_pending(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = *next_id;
        let now = Utc::now();
        let created = Job {
            id,
            script: job.script,
            work_dir: job.work_dir,
            stdout_path: job.stdout_path,
            stderr_path: job.stderr_path,
            environment: job.environment,
            resources: job.resources,
            partition: job.partition,
            account: job.account,
            exclusive: job.exclusive,
            priority: JobPriority::NORMAL,
            submit_time: now,
            eligible_time: now,
            start_time: None,
            end_time: None,
            node_list: Vec::new(),
            exit_code: None,
            error_msg: None,
            state: JobState::Pending,
        };
        self.jobs.lock().unwrap().insert(id, created.clone());
        Ok(created)
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn list_pending_fifo(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.eligible_time <= Utc::now())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.submit_time.cmp(&b.submit_time).then(a.id.cmp(&b.id)));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn list_running(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut running: Vec<Job> = jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        running.truncate(limit.max(0) as usize);
        Ok(running)
    }

    async fn transition_to_running(
        &self,
        job_id: i64,
        node_list: Vec<String>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Pending => {
                job.state = JobState::Running;
                job.start_time = Some(Utc::now());
                job.node_list = node_list;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_terminal(
        &self,
        job_id: i64,
        state: JobState,
        exit_code: Option<String>,
        error_msg: Option<String>,
    ) -> Result<bool, StoreError> {
        if !state.is_terminal() {
            return Err(StoreError::contract("mark_terminal with non-terminal state"));
        }
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if !job.state.is_terminal() => {
                job.state = state;
                job.end_time = Some(Utc::now());
                job.exit_code = exit_code;
                job.error_msg = error_msg;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_if_cancellable(&self, job_id: i64) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if !job.state.is_terminal() => {
                job.state = JobState::Cancelled;
                job.end_time = Some(Utc::now());
                job.exit_code = Some(crate::domain::exit_codes::CANCELLED.to_string());
                job.error_msg = Some("cancelled by request".to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_running_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|j| j.state == JobState::Running && j.start_time.map(|t| t < cutoff).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn find_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|j| j.state.is_terminal() && j.end_time.map(|t| t < cutoff).unwrap_or(false))
            .cloned()
            .collect();
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn delete(&self, job_id: i64) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(&job_id) {
            Some(job) if job.state.is_terminal() => {
                jobs.remove(&job_id);
                self.allocations.lock().unwrap().remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AllocationRepository for FakeStore {
    async fn reserve(
        &self,
        job_id: i64,
        allocated_cpus: i32,
        node_name: &str,
    ) -> Result<ResourceAllocation, StoreError> {
        let allocation = ResourceAllocation {
            job_id,
            allocated_cpus,
            node_name: node_name.to_string(),
            process_id: None,
            status: AllocationStatus::Reserved,
            allocated_at: Utc::now(),
            released_at: None,
        };
        self.allocations.lock().unwrap().insert(job_id, allocation.clone());
        Ok(allocation)
    }

    async fn record_pid(&self, job_id: i64, process_id: i32) -> Result<bool, StoreError> {
        let mut allocations = self.allocations.lock().unwrap();
        match allocations.get_mut(&job_id) {
            Some(a) if a.status == AllocationStatus::Reserved => {
                a.process_id = Some(process_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_to_allocated(&self, job_id: i64) -> Result<bool, StoreError> {
        let mut allocations = self.allocations.lock().unwrap();
        match allocations.get_mut(&job_id) {
            Some(a) if a.status == AllocationStatus::Reserved => {
                a.status = AllocationStatus::Allocated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, job_id: i64) -> Result<Option<AllocationStatus>, StoreError> {
        let mut allocations = self.allocations.lock().unwrap();
        match allocations.get_mut(&job_id) {
            Some(a) => {
                let prior = a.status;
                if a.status != AllocationStatus::Released {
                    a.status = AllocationStatus::Released;
                    a.released_at = Some(Utc::now());
                }
                Ok(Some(prior))
            }
            None => Ok(None),
        }
    }

    async fn sum_allocated_cpus(&self, node_name: &str) -> Result<i32, StoreError> {
        let allocations = self.allocations.lock().unwrap();
        Ok(allocations
            .values()
            .filter(|a| a.node_name == node_name && a.status == AllocationStatus::Allocated)
            .map(|a| a.allocated_cpus)
            .sum())
    }

    async fn sum_allocated_cpus_all(&self) -> Result<i32, StoreError> {
        let allocations = self.allocations.lock().unwrap();
        Ok(allocations
            .values()
            .filter(|a| a.status == AllocationStatus::Allocated)
            .map(|a| a.allocated_cpus)
            .sum())
    }

    async fn get(&self, job_id: i64) -> Result<Option<ResourceAllocation>, StoreError> {
        Ok(self.allocations.lock().unwrap().get(&job_id).cloned())
    }

    async fn find_stale_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ResourceAllocation>, StoreError> {
        let allocations = self.allocations.lock().unwrap();
        Ok(allocations
            .values()
            .filter(|a| a.status == AllocationStatus::Reserved && a.allocated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn find_completed_jobs_with_live_allocations(
        &self,
    ) -> Result<Vec<ResourceAllocation>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let allocations = self.allocations.lock().unwrap();
        Ok(allocations
            .values()
            .filter(|a| {
                a.status != AllocationStatus::Released
                    && jobs.get(&a.job_id).map(|j| j.state.is_terminal()).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_allocated_with_dead_pid(
        &self,
        node_name: &str,
        is_alive: &(dyn Fn(i32) -> bool + Send + Sync),
    ) -> Result<Vec<ResourceAllocation>, StoreError> {
        let allocations = self.allocations.lock().unwrap();
        Ok(allocations
            .values()
            .filter(|a| {
                a.node_name == node_name
                    && a.status == AllocationStatus::Allocated
                    && a.process_id.map(|pid| !is_alive(pid)).unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeCache {
    values: Mutex<HashMap<String, i32>>,
}

impl FakeCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceCache for FakeCache {
    async fn get(&self, node_name: &str) -> Result<i32, StoreError> {
        Ok(*self.values.lock().unwrap().get(node_name).unwrap_or(&0))
    }

    async fn set(&self, node_name: &str, value: i32) -> Result<(), StoreError> {
        self.values.lock().unwrap().insert(node_name.to_string(), value);
        Ok(())
    }

    async fn incr(&self, node_name: &str, delta: i32) -> Result<(), StoreError> {
        *self.values.lock().unwrap().entry(node_name.to_string()).or_insert(0) += delta;
        Ok(())
    }

    async fn decr(&self, node_name: &str, delta: i32) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap();
        let entry = values.entry(node_name.to_string()).or_insert(0);
        *entry = (*entry - delta).max(0);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeQueue {
    items: Mutex<Vec<i64>>,
    members: Mutex<std::collections::HashSet<i64>>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutionQueue for FakeQueue {
    async fn enqueue(&self, job_id: i64) -> Result<(), StoreError> {
        let mut members = self.members.lock().unwrap();
        if members.insert(job_id) {
            self.items.lock().unwrap().push(job_id);
        }
        Ok(())
    }

    async fn dequeue(&self, _timeout_secs: f64) -> Result<Option<i64>, StoreError> {
        Ok(self.items.lock().unwrap().pop())
    }

    async fn ack(&self, job_id: i64) -> Result<(), StoreError> {
        self.members.lock().unwrap().remove(&job_id);
        Ok(())
    }

    async fn requeue_abandoned(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    workers: Mutex<HashMap<String, crate::domain::WorkerPresence>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a single synthetic worker advertising `cpus`, for tests
    /// that want a fixed total capacity without wiring up a whole
    /// worker-pool registration flow.
    pub fn with_total_cpus(cpus: i32) -> Self {
        let registry = Self::default();
        registry.workers.lock().unwrap().insert(
            "fake-worker".to_string(),
            crate::domain::WorkerPresence {
                worker_id: "fake-worker".to_string(),
                cpus,
                status: "alive".to_string(),
                hostname: "fake-node".to_string(),
                registered_at: Utc::now(),
                last_heartbeat: Utc::now(),
            },
        );
        registry
    }
}

#[async_trait]
impl WorkerRegistry for FakeRegistry {
    async fn register(
        &self,
        presence: &crate::domain::WorkerPresence,
        _ttl_secs: u64,
    ) -> Result<(), StoreError> {
        self.workers
            .lock()
            .unwrap()
            .insert(presence.worker_id.clone(), presence.clone());
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, _ttl_secs: u64) -> Result<bool, StoreError> {
        let mut workers = self.workers.lock().unwrap();
        match workers.get_mut(worker_id) {
            Some(w) => {
                w.last_heartbeat = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn unregister(&self, worker_id: &str) -> Result<(), StoreError> {
        self.workers.lock().unwrap().remove(worker_id);
        Ok(())
    }

    async fn list_alive(&self) -> Result<Vec<crate::domain::WorkerPresence>, StoreError> {
        Ok(self.workers.lock().unwrap().values().cloned().collect())
    }

    async fn total_cpus(&self) -> Result<i32, StoreError> {
        Ok(self.workers.lock().unwrap().values().map(|w| w.cpus).sum())
    }
}
