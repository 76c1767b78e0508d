//! FIFO + first-fit admission. The scheduler always walks the pending
//! queue in submit order but will scan past a head-of-line job that
//! doesn't currently fit to admit a smaller one behind it.

use std::collections::HashMap;
use std::sync::Arc;

use taskforge::domain::{JobState, NewJob, ResourceSpec};
use taskforge::resource_manager::ResourceManager;
use taskforge::scheduler::SchedulerDaemon;
use taskforge::store::{JobRepository, Store};
use taskforge::testutil::{FakeCache, FakeQueue, FakeRegistry, FakeStore};

fn job_requiring(cpus: i32) -> NewJob {
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

fn scheduler_with(total_cpus: i32) -> (Arc<dyn Store>, Arc<FakeQueue>, SchedulerDaemon) {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let cache = Arc::new(FakeCache::new());
    let queue = Arc::new(FakeQueue::new());
    let registry = Arc::new(FakeRegistry::with_total_cpus(total_cpus));
    let resources = Arc::new(ResourceManager::new(
        store.clone(),
        cache,
        registry,
        total_cpus,
        "node-a".to_string(),
    ));
    let scheduler = SchedulerDaemon::new(
        resources,
        queue.clone(),
        "node-a".to_string(),
        std::time::Duration::from_secs(5),
    );
    (store, queue, scheduler)
}

#[tokio::test]
async fn admits_as_many_fifo_jobs_as_capacity_allows() {
    let (store, queue, scheduler) = scheduler_with(10);
    let j1 = JobRepository::create_pending(store.as_ref(), job_requiring(4)).await.unwrap();
    let j2 = JobRepository::create_pending(store.as_ref(), job_requiring(4)).await.unwrap();
    let j3 = JobRepository::create_pending(store.as_ref(), job_requiring(4)).await.unwrap();

    let admitted = scheduler.tick().await.unwrap();
    assert_eq!(admitted, 2);

    assert_eq!(JobRepository::get(store.as_ref(), j1.id).await.unwrap().unwrap().state, JobState::Running);
    assert_eq!(JobRepository::get(store.as_ref(), j2.id).await.unwrap().unwrap().state, JobState::Running);
    assert_eq!(JobRepository::get(store.as_ref(), j3.id).await.unwrap().unwrap().state, JobState::Pending);
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn first_fit_skips_a_head_of_line_job_that_never_fits() {
    // Total capacity is smaller than the first job's request, so it can
    // never be admitted; the second, smaller job behind it should still
    // go through in the same tick.
    let (store, _queue, scheduler) = scheduler_with(5);
    let too_big = JobRepository::create_pending(store.as_ref(), job_requiring(9)).await.unwrap();
    let fits = JobRepository::create_pending(store.as_ref(), job_requiring(4)).await.unwrap();

    let admitted = scheduler.tick().await.unwrap();
    assert_eq!(admitted, 1);

    assert_eq!(JobRepository::get(store.as_ref(), too_big.id).await.unwrap().unwrap().state, JobState::Pending);
    assert_eq!(JobRepository::get(store.as_ref(), fits.id).await.unwrap().unwrap().state, JobState::Running);
}

#[tokio::test]
async fn first_fit_keeps_scanning_after_a_large_job_is_admitted() {
    // 9, 1, 4 against a capacity of 10: the big job and the tiny one
    // both fit; the last one doesn't and is left pending.
    let (store, _queue, scheduler) = scheduler_with(10);
    let big = JobRepository::create_pending(store.as_ref(), job_requiring(9)).await.unwrap();
    let tiny = JobRepository::create_pending(store.as_ref(), job_requiring(1)).await.unwrap();
    let too_big_now = JobRepository::create_pending(store.as_ref(), job_requiring(4)).await.unwrap();

    let admitted = scheduler.tick().await.unwrap();
    assert_eq!(admitted, 2);

    assert_eq!(JobRepository::get(store.as_ref(), big.id).await.unwrap().unwrap().state, JobState::Running);
    assert_eq!(JobRepository::get(store.as_ref(), tiny.id).await.unwrap().unwrap().state, JobState::Running);
    assert_eq!(JobRepository::get(store.as_ref(), too_big_now.id).await.unwrap().unwrap().state, JobState::Pending);
}

#[tokio::test]
async fn zero_capacity_node_admits_nothing() {
    let (store, _queue, scheduler) = scheduler_with(0);
    JobRepository::create_pending(store.as_ref(), job_requiring(1)).await.unwrap();

    let admitted = scheduler.tick().await.unwrap();
    assert_eq!(admitted, 0);
}
