//! Invariant checks on the three-state resource allocation ledger:
//! at most one allocation row per job, and the permitted transition
//! edges (reserved -> allocated -> released, plus reserved -> released
//! directly) are the only ones the repository will perform.

use std::collections::HashMap;
use std::sync::Arc;

use taskforge::domain::{AllocationStatus, NewJob, ResourceSpec};
use taskforge::faststore::ResourceCache;
use taskforge::resource_manager::ResourceManager;
use taskforge::store::{AllocationRepository, JobRepository, Store};
use taskforge::testutil::{FakeCache, FakeRegistry, FakeStore};

fn sample_job(cpus: i32) -> NewJob {
    NewJob {
        script: "#!/bin/bash\ntrue\n".to_string(),
        work_dir: "/tmp".to_string(),
        stdout_path: "/tmp/out".to_string(),
        stderr_path: "/tmp/err".to_string(),
        environment: HashMap::new(),
        resources: ResourceSpec {
            ntasks_per_node: 1,
            cpus_per_task: cpus,
            memory_per_node: 1024,
            time_limit_minutes: 10,
        },
        partition: "default".to_string(),
        account: "default".to_string(),
        exclusive: false,
    }
}

#[tokio::test]
async fn reserve_is_idempotent_on_the_allocation_row() {
    let store = FakeStore::new();
    let job = store.create_pending(sample_job(2)).await.unwrap();

    store.reserve(job.id, 2, "node-a").await.unwrap();
    store.reserve(job.id, 4, "node-a").await.unwrap();

    // A second reserve call for the same job replaces, not duplicates,
    // its one allocation row.
    let allocation = AllocationRepository::get(&store, job.id).await.unwrap().unwrap();
    assert_eq!(allocation.allocated_cpus, 4);
    assert_eq!(allocation.status, AllocationStatus::Reserved);
}

#[tokio::test]
async fn record_pid_is_rejected_outside_reserved() {
    let store = FakeStore::new();
    let job = store.create_pending(sample_job(2)).await.unwrap();
    store.reserve(job.id, 2, "node-a").await.unwrap();
    assert!(store.transition_to_allocated(job.id).await.unwrap());

    // Once promoted to `allocated`, recording a pid against the same row
    // again is refused — `record_pid` only accepts `reserved` rows.
    let accepted = store.record_pid(job.id, 4242).await.unwrap();
    assert!(!accepted);
}

#[tokio::test]
async fn transition_to_allocated_requires_reserved() {
    let store = FakeStore::new();
    let job = store.create_pending(sample_job(2)).await.unwrap();
    store.reserve(job.id, 2, "node-a").await.unwrap();

    assert!(store.transition_to_allocated(job.id).await.unwrap());
    // Already allocated: the second call is not a second valid edge.
    assert!(!store.transition_to_allocated(job.id).await.unwrap());
}

#[tokio::test]
async fn release_is_valid_from_either_reserved_or_allocated() {
    let store = FakeStore::new();

    let reserved_only = store.create_pending(sample_job(2)).await.unwrap();
    store.reserve(reserved_only.id, 2, "node-a").await.unwrap();
    let prior = store.release(reserved_only.id).await.unwrap();
    assert_eq!(prior, Some(AllocationStatus::Reserved));

    let allocated = store.create_pending(sample_job(2)).await.unwrap();
    store.reserve(allocated.id, 2, "node-a").await.unwrap();
    store.transition_to_allocated(allocated.id).await.unwrap();
    let prior = store.release(allocated.id).await.unwrap();
    assert_eq!(prior, Some(AllocationStatus::Allocated));
}

#[tokio::test]
async fn cache_converges_to_the_durable_sum_after_sync() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let cache = Arc::new(FakeCache::new());
    let registry = Arc::new(FakeRegistry::with_total_cpus(10));
    let resources = ResourceManager::new(store.clone(), cache.clone(), registry, 10, "node-a".to_string());

    let job = JobRepository::create_pending(store.as_ref(), sample_job(3)).await.unwrap();
    AllocationRepository::reserve(store.as_ref(), job.id, 3, "node-a").await.unwrap();
    AllocationRepository::transition_to_allocated(store.as_ref(), job.id).await.unwrap();

    // Deliberately desync the cache from the ledger.
    cache.set("node-a", 99).await.unwrap();
    assert_eq!(resources.available_cpus().await.unwrap(), 0);

    resources.sync_from_store().await.unwrap();
    assert_eq!(resources.available_cpus().await.unwrap(), 7);
}
