//! src/config.rs
//!
//! Typed configuration, resolved from environment variables per the
//! option table in spec.md §6. Mirrors the teacher's own
//! `env::var(..).ok().and_then(..).unwrap_or(default)` idiom (see
//! `resources.rs::detect_cpu_mem`) rather than pulling in a config-file
//! parser — config *files* are explicitly out of scope (spec.md §1).

use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    pub total_cpus: i32,
    pub node_name: String,

    pub scheduler_interval: Duration,
    pub resource_sync_interval: Duration,
    pub worker_heartbeat_interval: Duration,
    pub worker_presence_ttl: Duration,

    pub stale_reservation_max_age: Duration,
    pub stuck_job_max_age: Duration,
    pub orphan_probe_timeout: Duration,
    pub old_job_max_age: Duration,

    pub cleanup_strategies_enabled: HashMap<String, bool>,
    pub queue_name: String,

    pub worker_concurrency: usize,
    pub script_dir: String,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_i32(key: &str, default: i32) -> i32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_secs))
}

impl Config {
    /// Resolve configuration from the process environment, falling back
    /// to spec.md §6's documented defaults for anything unset.
    pub fn from_env() -> Self {
        let default_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        let cleanup_strategies_enabled = env::var("CLEANUP_STRATEGIES_ENABLED")
            .ok()
            .map(|raw| parse_strategy_flags(&raw))
            .unwrap_or_else(default_strategy_flags);

        Self {
            database_url: env_string(
                "DATABASE_URL",
                "postgres://localhost/taskforge",
            ),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),

            total_cpus: env_i32("TOTAL_CPUS", num_cpus::get() as i32),
            node_name: env_string("NODE_NAME", &default_hostname),

            scheduler_interval: env_secs("SCHEDULER_INTERVAL_SECONDS", 5),
            resource_sync_interval: env_secs("RESOURCE_SYNC_INTERVAL_SECONDS", 300),
            worker_heartbeat_interval: env_secs("WORKER_HEARTBEAT_INTERVAL_SECONDS", 30),
            worker_presence_ttl: env_secs("WORKER_PRESENCE_TTL_SECONDS", 60),

            stale_reservation_max_age: Duration::from_secs(
                env_u64("STALE_RESERVATION_MAX_AGE_MINUTES", 10) * 60,
            ),
            stuck_job_max_age: Duration::from_secs(
                env_u64("STUCK_JOB_MAX_AGE_HOURS", 48) * 3600,
            ),
            orphan_probe_timeout: Duration::from_secs(
                env_u64("ORPHAN_PROBE_TIMEOUT_HOURS", 72) * 3600,
            ),
            old_job_max_age: Duration::from_secs(env_u64("OLD_JOB_MAX_AGE_DAYS", 30) * 86400),

            cleanup_strategies_enabled,
            queue_name: env_string("QUEUE_NAME", "taskforge:execution"),

            worker_concurrency: env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| num_cpus::get().max(1)),
            script_dir: env_string("SCRIPT_DIR", "/tmp/taskforge/scripts"),
        }
    }
}

fn default_strategy_flags() -> HashMap<String, bool> {
    let mut m = HashMap::new();
    m.insert("completed_job_cleanup".to_string(), true);
    m.insert("stale_reservation_cleanup".to_string(), true);
    m.insert("pending_job_recovery".to_string(), true);
    m.insert("stuck_job_cleanup".to_string(), true);
    m.insert("old_job_cleanup".to_string(), false);
    m
}

/// Parses `"name=true,other=false"` pairs; unrecognized/malformed
/// entries are ignored rather than treated as fatal config errors.
fn parse_strategy_flags(raw: &str) -> HashMap<String, bool> {
    let mut flags = default_strategy_flags();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((name, val)) = pair.split_once('=') {
            if let Ok(b) = val.trim().parse::<bool>() {
                flags.insert(name.trim().to_string(), b);
            }
        }
    }
    flags
}
