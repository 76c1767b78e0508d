//! Every externally-triggerable action here is safe to repeat: a
//! second cancel, a second release, a second enqueue, or a recovery
//! pass over an already-clean store must all be no-ops rather than
//! errors or double effects.

use std::collections::HashMap;
use std::sync::Arc;

use taskforge::domain::{AllocationStatus, NewJob, ResourceSpec};
use taskforge::faststore::queue::ExecutionQueue;
use taskforge::recovery::Recovery;
use taskforge::resource_manager::ResourceManager;
use taskforge::store::{AllocationRepository, JobRepository, Store};
use taskforge::testutil::{FakeCache, FakeQueue, FakeRegistry, FakeStore};

fn sample_job() -> NewJob {
    NewJob {
        script: "#!/bin/bash\ntrue\n".to_string(),
        work_dir: "/tmp".to_string(),
        stdout_path: "/tmp/out".to_string(),
        stderr_path: "/tmp/err".to_string(),
        environment: HashMap::new(),
        resources: ResourceSpec {
            ntasks_per_node: 1,
            cpus_per_task: 1,
            memory_per_node: 1024,
            time_limit_minutes: 10,
        },
        partition: "default".to_string(),
        account: "default".to_string(),
        exclusive: false,
    }
}

#[tokio::test]
async fn cancelling_an_already_terminal_job_is_a_no_op() {
    let store = FakeStore::new();
    let job = store.create_pending(sample_job()).await.unwrap();

    assert!(store.cancel_if_cancellable(job.id).await.unwrap());
    assert!(!store.cancel_if_cancellable(job.id).await.unwrap());

    let reloaded = JobRepository::get(&store, job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.state, taskforge::domain::JobState::Cancelled);
}

#[tokio::test]
async fn releasing_an_already_released_allocation_is_a_no_op() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let cache = Arc::new(FakeCache::new());
    let registry = Arc::new(FakeRegistry::with_total_cpus(8));
    let resources = ResourceManager::new(store.clone(), cache.clone(), registry, 8, "node-a".to_string());

    let job = JobRepository::create_pending(store.as_ref(), sample_job()).await.unwrap();
    AllocationRepository::reserve(store.as_ref(), job.id, 2, "node-a").await.unwrap();
    AllocationRepository::transition_to_allocated(store.as_ref(), job.id).await.unwrap();

    resources.release(job.id).await.unwrap();
    let allocation = AllocationRepository::get(store.as_ref(), job.id).await.unwrap().unwrap();
    assert_eq!(allocation.status, AllocationStatus::Released);

    // Releasing again must not double-decrement the cache.
    resources.release(job.id).await.unwrap();
    assert_eq!(resources.available_cpus().await.unwrap(), 8);
}

#[tokio::test]
async fn enqueueing_the_same_job_twice_before_ack_is_deduped() {
    let queue = FakeQueue::new();
    queue.enqueue(7).await.unwrap();
    queue.enqueue(7).await.unwrap();
    assert_eq!(queue.len(), 1);

    let dequeued = queue.dequeue(0.0).await.unwrap();
    assert_eq!(dequeued, Some(7));
    queue.ack(7).await.unwrap();

    // Acking clears the dedupe entry, so a later resubmission is allowed.
    queue.enqueue(7).await.unwrap();
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn startup_recovery_is_a_no_op_on_a_clean_store() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let cache = Arc::new(FakeCache::new());
    let registry = Arc::new(FakeRegistry::with_total_cpus(8));
    let resources = Arc::new(ResourceManager::new(store, cache, registry, 8, "node-a".to_string()));
    let queue: Arc<dyn ExecutionQueue> = Arc::new(FakeQueue::new());
    let recovery = Recovery::new(resources, queue, std::time::Duration::from_secs(3600));

    let report = recovery.recover_on_startup().await.unwrap();
    assert_eq!(report.pending_requeued, 0);
    assert_eq!(report.orphans_failed, 0);
    assert_eq!(report.timeouts_failed, 0);
    assert_eq!(report.stale_allocations_released, 0);
}
