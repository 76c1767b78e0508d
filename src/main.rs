// src/main.rs
//
// =============================================================================
// TASKFORGE: COMMANDER & ENTRY POINT
// =============================================================================
//
// The wiring center of the entire architecture.
//
// Modes:
// 1. SERVE:  Boots the scheduler daemon + cleanup registry for this node.
// 2. WORK:   Boots a worker pool draining the execution queue.
// 3. SUBMIT/QUERY/CANCEL/DASHBOARD: Thin CLI onto the submitter surface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;

use taskforge::cleanup::strategies::{
    CompletedJobCleanup, OldJobCleanup, PendingJobRecovery, StaleReservationCleanup,
    StuckJobCleanup,
};
use taskforge::cleanup::{CleanupManager, CleanupStrategy, LoggingObserver};
use taskforge::config::Config;
use taskforge::domain::{NewJob, ResourceSpec};
use taskforge::faststore::queue::{ExecutionQueue, RedisExecutionQueue};
use taskforge::faststore::registry::WorkerRegistry;
use taskforge::faststore::{RedisPool, ResourceCache};
use taskforge::recovery::Recovery;
use taskforge::resource_manager::ResourceManager;
use taskforge::scheduler::SchedulerDaemon;
use taskforge::store::{PgStore, Store};
use taskforge::submitter::SubmitterApi;
use taskforge::supervisor::ProcessSupervisor;
use taskforge::worker_pool::WorkerPool;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "taskforge", version, about = "Single-node job scheduling and execution service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon and cleanup registry.
    Serve,

    /// Run a worker pool draining the execution queue.
    Work {
        /// Worker identity; defaults to hostname.
        #[arg(long)]
        id: Option<String>,
    },

    /// Submit a job from a script file.
    Submit {
        #[arg(long)]
        script: String,
        #[arg(long, default_value = ".")]
        work_dir: String,
        #[arg(long, default_value = "stdout.log")]
        stdout: String,
        #[arg(long, default_value = "stderr.log")]
        stderr: String,
        #[arg(long, default_value_t = 1)]
        cpus: i32,
        #[arg(long, default_value_t = 1024)]
        memory_mb: i64,
        #[arg(long, default_value_t = 60)]
        time_limit_minutes: i32,
        #[arg(long, default_value = "default")]
        partition: String,
        #[arg(long, default_value = "default")]
        account: String,
    },

    /// Show a job's current status and captured output.
    Query {
        job_id: i64,
    },

    /// Cancel a job (idempotent).
    Cancel {
        job_id: i64,
    },

    /// Print an aggregate snapshot of cluster state.
    Dashboard,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Work { id } => run_worker(config, id).await,
        Commands::Submit {
            script,
            work_dir,
            stdout,
            stderr,
            cpus,
            memory_mb,
            time_limit_minutes,
            partition,
            account,
        } => {
            run_submit(
                config, script, work_dir, stdout, stderr, cpus, memory_mb,
                time_limit_minutes, partition, account,
            )
            .await
        }
        Commands::Query { job_id } => run_query(config, job_id).await,
        Commands::Cancel { job_id } => run_cancel(config, job_id).await,
        Commands::Dashboard => run_dashboard(config).await,
    }
}

// ============================================================================
// 3. SHARED WIRING
// ============================================================================

async fn connect_store(config: &Config) -> Result<Arc<dyn Store>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to durable store")?;
    Ok(Arc::new(store))
}

async fn connect_cache(config: &Config) -> Result<(Arc<dyn ResourceCache>, Arc<dyn WorkerRegistry>)> {
    let pool = RedisPool::connect(&config.redis_url)
        .await
        .context("connecting to fast store")?;
    Ok((Arc::new(pool.clone()), Arc::new(pool)))
}

async fn connect_queue(config: &Config) -> Result<Arc<dyn ExecutionQueue>> {
    let pool = RedisPool::connect(&config.redis_url)
        .await
        .context("connecting to execution queue")?;
    Ok(Arc::new(RedisExecutionQueue::new(pool, config.queue_name.clone())))
}

fn build_resource_manager(
    store: Arc<dyn Store>,
    cache: Arc<dyn ResourceCache>,
    registry: Arc<dyn WorkerRegistry>,
    config: &Config,
) -> Arc<ResourceManager> {
    Arc::new(ResourceManager::new(
        store,
        cache,
        registry,
        config.total_cpus,
        config.node_name.clone(),
    ))
}

fn build_cleanup_manager(config: &Config) -> Arc<CleanupManager> {
    let strategies: Vec<Arc<dyn CleanupStrategy>> = vec![
        Arc::new(CompletedJobCleanup),
        Arc::new(StaleReservationCleanup {
            max_age: config.stale_reservation_max_age,
        }),
        Arc::new(PendingJobRecovery),
        Arc::new(StuckJobCleanup {
            max_age: config.stuck_job_max_age,
        }),
        Arc::new(OldJobCleanup {
            max_age: config.old_job_max_age,
        }),
    ];
    let enabled: HashMap<String, bool> = config.cleanup_strategies_enabled.clone();
    Arc::new(CleanupManager::new(strategies, vec![Arc::new(LoggingObserver)], enabled))
}

fn install_shutdown_handler() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("interrupt received, stopping");
        stop_clone.store(true, Ordering::SeqCst);
    });
    stop
}

// ============================================================================
// 4. SERVE: SCHEDULER + CLEANUP
// ============================================================================

async fn run_serve(config: Config) -> Result<()> {
    let store = connect_store(&config).await?;
    let (cache, registry) = connect_cache(&config).await?;
    let queue = connect_queue(&config).await?;
    let resources = build_resource_manager(store, cache, registry, &config);
    resources.sync_from_store().await.context("priming resource cache")?;

    let stop = install_shutdown_handler();

    let scheduler = SchedulerDaemon::new(
        resources.clone(),
        queue,
        config.node_name.clone(),
        config.scheduler_interval,
    );

    let cleanup = build_cleanup_manager(&config);
    let cleanup_resources = resources.clone();
    let cleanup_stop = stop.clone();
    let cleanup_handle = tokio::spawn(async move {
        cleanup.run_loop(cleanup_resources, std::time::Duration::from_secs(5), cleanup_stop).await;
    });

    let resync_resources = resources.clone();
    let resync_stop = stop.clone();
    let resync_interval = config.resource_sync_interval;
    let resync_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(resync_interval);
        loop {
            interval.tick().await;
            if resync_stop.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = resync_resources.sync_from_store().await {
                log::warn!("periodic cache resync failed: {e}");
            }
        }
    });

    log::info!("scheduler daemon serving on node {}", config.node_name);
    scheduler.run().await;
    let _ = tokio::join!(cleanup_handle, resync_handle);
    Ok(())
}

// ============================================================================
// 5. WORK: WORKER POOL
// ============================================================================

async fn run_worker(config: Config, worker_id: Option<String>) -> Result<()> {
    let store = connect_store(&config).await?;
    let (cache, registry) = connect_cache(&config).await?;
    let queue = connect_queue(&config).await?;
    let resources = build_resource_manager(store, cache, registry.clone(), &config);

    let supervisor = Arc::new(ProcessSupervisor::new(config.script_dir.clone()));
    let worker_id = worker_id.unwrap_or_else(|| config.node_name.clone());

    let pool = WorkerPool::new(
        worker_id,
        config.node_name.clone(),
        config.total_cpus,
        resources.clone(),
        registry,
        queue.clone(),
        supervisor,
        config.worker_heartbeat_interval,
        config.worker_presence_ttl,
        config.worker_concurrency,
    );

    pool.register().await.context("registering worker presence")?;

    let requeued = queue
        .requeue_abandoned()
        .await
        .context("requeueing work items abandoned mid-dequeue by a prior crash")?;
    if requeued > 0 {
        log::info!("requeued {requeued} abandoned work item(s) from the processing list");
    }

    let recovery = Recovery::new(resources.clone(), queue, config.orphan_probe_timeout);
    recovery.recover_on_startup().await.context("startup recovery")?;
    resources.sync_from_store().await.context("priming resource cache after recovery")?;

    let stop = install_shutdown_handler();

    let heartbeat_pool = pool.clone_for_heartbeat();
    let heartbeat_stop = stop.clone();
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat_pool.run_heartbeat_loop(heartbeat_stop).await;
    });

    log::info!("worker pool draining queue on node {}", config.node_name);
    pool.run(stop).await;
    let _ = heartbeat_handle.await;
    Ok(())
}

// ============================================================================
// 6. SUBMITTER-FACING COMMANDS
// ============================================================================

async fn build_submitter(config: &Config) -> Result<SubmitterApi> {
    let store = connect_store(config).await?;
    let (cache, registry) = connect_cache(config).await?;
    let resources = build_resource_manager(store, cache, registry.clone(), config);
    let supervisor = Arc::new(ProcessSupervisor::new(config.script_dir.clone()));
    Ok(SubmitterApi::new(resources, registry, supervisor))
}

#[allow(clippy::too_many_arguments)]
async fn run_submit(
    config: Config,
    script_path: String,
    work_dir: String,
    stdout: String,
    stderr: String,
    cpus: i32,
    memory_mb: i64,
    time_limit_minutes: i32,
    partition: String,
    account: String,
) -> Result<()> {
    let script = tokio::fs::read_to_string(&script_path)
        .await
        .with_context(|| format!("reading script file {script_path}"))?;
    let submitter = build_submitter(&config).await?;
    let job_id = submitter
        .submit(NewJob {
            script,
            work_dir,
            stdout_path: stdout,
            stderr_path: stderr,
            environment: HashMap::new(),
            resources: ResourceSpec {
                ntasks_per_node: 1,
                cpus_per_task: cpus,
                memory_per_node: memory_mb,
                time_limit_minutes,
            },
            partition,
            account,
            exclusive: false,
        })
        .await?;
    println!("{job_id}");
    Ok(())
}

async fn run_query(config: Config, job_id: i64) -> Result<()> {
    let submitter = build_submitter(&config).await?;
    let view = submitter.query(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn run_cancel(config: Config, job_id: i64) -> Result<()> {
    let submitter = build_submitter(&config).await?;
    submitter.cancel(job_id).await?;
    println!("cancelled job {job_id}");
    Ok(())
}

async fn run_dashboard(config: Config) -> Result<()> {
    let submitter = build_submitter(&config).await?;
    let stats = submitter.dashboard().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
