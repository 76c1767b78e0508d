//! Crash-recovery scenarios: a reservation that outlives its worker, a
//! worker process that dies mid-execution, a double cancel, and a
//! completed job whose allocation was never released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use taskforge::cleanup::strategies::{CompletedJobCleanup, StaleReservationCleanup};
use taskforge::cleanup::CleanupStrategy;
use taskforge::domain::{exit_codes, AllocationStatus, JobState, NewJob, ResourceSpec};
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
            cpus_per_task: 2,
            memory_per_node: 1024,
            time_limit_minutes: 10,
        },
        partition: "default".to_string(),
        account: "default".to_string(),
        exclusive: false,
    }
}

fn resources_over(store: Arc<dyn Store>, total_cpus: i32) -> ResourceManager {
    ResourceManager::new(
        store,
        Arc::new(FakeCache::new()),
        Arc::new(FakeRegistry::new()),
        total_cpus,
        "node-a".to_string(),
    )
}

/// S1: a reservation is committed (job admitted, allocation `reserved`)
/// but the worker that should have promoted it to `allocated` never
/// shows up. `stale_reservation_cleanup` fails the job and releases
/// the reservation once it has sat past the grace window.
#[tokio::test]
async fn s1_stale_reservation_is_released_and_failed() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let resources = resources_over(store.clone(), 8);

    let job = JobRepository::create_pending(store.as_ref(), sample_job()).await.unwrap();
    AllocationRepository::reserve(store.as_ref(), job.id, 2, "node-a").await.unwrap();
    JobRepository::transition_to_running(store.as_ref(), job.id, vec!["node-a".to_string()])
        .await
        .unwrap();

    // A 1ms grace window that we immediately outlive, rather than
    // manipulating the clock.
    let strategy = StaleReservationCleanup {
        max_age: Duration::from_millis(1),
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let affected = strategy.do_cleanup(&resources).await.unwrap();
    assert_eq!(affected, 1);

    let reloaded = JobRepository::get(store.as_ref(), job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.state, JobState::Failed);
    assert_eq!(reloaded.exit_code.as_deref(), Some(exit_codes::STALE_RESERVATION));

    let allocation = AllocationRepository::get(store.as_ref(), job.id).await.unwrap().unwrap();
    assert_eq!(allocation.status, AllocationStatus::Released);
}

/// S2: the worker process backing a running job dies without the
/// daemon ever seeing it exit (e.g. the whole worker crashed). The
/// startup orphan probe notices the recorded pid is dead and fails the
/// job with the orphan exit code.
#[tokio::test]
async fn s2_orphaned_job_is_detected_and_failed_on_restart() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let resources = Arc::new(resources_over(store.clone(), 8));
    let queue = Arc::new(FakeQueue::new());

    let job = JobRepository::create_pending(store.as_ref(), sample_job()).await.unwrap();
    AllocationRepository::reserve(store.as_ref(), job.id, 2, "node-a").await.unwrap();
    JobRepository::transition_to_running(store.as_ref(), job.id, vec!["node-a".to_string()])
        .await
        .unwrap();
    AllocationRepository::transition_to_allocated(store.as_ref(), job.id).await.unwrap();

    // A process that has already exited and been reaped; its pid is
    // guaranteed dead for the rest of this test.
    let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
    let dead_pid = child.id() as i32;
    child.wait().unwrap();
    AllocationRepository::record_pid(store.as_ref(), job.id, dead_pid).await.unwrap();

    let recovery = Recovery::new(resources, queue, Duration::from_secs(3600));
    let report = recovery.recover_on_startup().await.unwrap();
    assert_eq!(report.orphans_failed, 1);

    let reloaded = JobRepository::get(store.as_ref(), job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.state, JobState::Failed);
    assert_eq!(reloaded.exit_code.as_deref(), Some(exit_codes::ORPHAN));

    let allocation = AllocationRepository::get(store.as_ref(), job.id).await.unwrap().unwrap();
    assert_eq!(allocation.status, AllocationStatus::Released);
}

/// S3: two cancel requests race against the same job. Only the first
/// has any effect; the second observes an already-terminal job and
/// does nothing.
#[tokio::test]
async fn s3_double_cancel_is_safe() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let job = JobRepository::create_pending(store.as_ref(), sample_job()).await.unwrap();

    let first = JobRepository::cancel_if_cancellable(store.as_ref(), job.id).await.unwrap();
    let second = JobRepository::cancel_if_cancellable(store.as_ref(), job.id).await.unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(
        JobRepository::get(store.as_ref(), job.id).await.unwrap().unwrap().state,
        JobState::Cancelled
    );
}

/// S6: a job reaches a terminal state through the normal worker path,
/// but its allocation is still `allocated` (the release call that
/// should have preceded the terminal write was lost). The steady-state
/// `completed_job_cleanup` strategy reconciles it on its very next
/// pass.
#[tokio::test]
async fn s6_completed_job_cleanup_reconciles_within_one_pass() {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let resources = resources_over(store.clone(), 8);

    let job = JobRepository::create_pending(store.as_ref(), sample_job()).await.unwrap();
    AllocationRepository::reserve(store.as_ref(), job.id, 2, "node-a").await.unwrap();
    AllocationRepository::transition_to_allocated(store.as_ref(), job.id).await.unwrap();
    JobRepository::mark_terminal(store.as_ref(), job.id, JobState::Completed, Some("0:0".to_string()), None)
        .await
        .unwrap();

    let strategy = CompletedJobCleanup;
    let affected = strategy.do_cleanup(&resources).await.unwrap();
    assert_eq!(affected, 1);

    let allocation = AllocationRepository::get(store.as_ref(), job.id).await.unwrap().unwrap();
    assert_eq!(allocation.status, AllocationStatus::Released);
}
