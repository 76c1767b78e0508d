//! src/domain/job.rs
//!
//! The unit of work. Mirrors the teacher's `core.rs` schema-authority
//! pattern: one struct per entity, `serde`-derived, with small
//! constructors and zero business logic beyond simple derived fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobState::Pending,
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            _ => return None,
        })
    }
}

/// Declared resource requirements, one per job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub ntasks_per_node: i32,
    pub cpus_per_task: i32,
    pub memory_per_node: i64,
    pub time_limit_minutes: i32,
}

impl ResourceSpec {
    /// `total_cpus_required = ntasks_per_node * cpus_per_task` (spec.md §3).
    pub fn total_cpus_required(&self) -> i32 {
        self.ntasks_per_node * self.cpus_per_task
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPriority(pub i32);

impl JobPriority {
    pub const NORMAL: JobPriority = JobPriority(0);
}

/// The submitted unit of work. Mutated exclusively by the scheduler, the
/// worker pool, and cleanup strategies after creation (spec.md §3
/// Ownership) — never by the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub script: String,
    pub work_dir: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub environment: HashMap<String, String>,
    pub resources: ResourceSpec,
    pub partition: String,
    pub account: String,
    pub exclusive: bool,
    pub priority: JobPriority,

    pub submit_time: DateTime<Utc>,
    pub eligible_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub node_list: Vec<String>,
    /// `"<code>:<signal>"`, e.g. `"0:0"`, `"-1:15"`, `"-999:0"`.
    pub exit_code: Option<String>,
    pub error_msg: Option<String>,
    pub state: JobState,
}

/// Fields the submitter provides; everything else (id, timestamps,
/// state) is assigned by the store on create.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub script: String,
    pub work_dir: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub environment: HashMap<String, String>,
    pub resources: ResourceSpec,
    pub partition: String,
    pub account: String,
    pub exclusive: bool,
}

/// Format an exit code the way cleanup strategies and the supervisor do:
/// `"<code>:<signal>"`.
pub fn format_exit_code(code: i32, signal: i32) -> String {
    format!("{code}:{signal}")
}

pub mod exit_codes {
    pub const CANCELLED: &str = "-1:15";
    pub const STALE_RESERVATION: &str = "-3:0";
    pub const STUCK_JOB: &str = "-2:0";
    pub const TIMEOUT_SWEEP: &str = "-998:0";
    pub const ORPHAN: &str = "-999:0";
    pub const LAUNCH_FAILED: &str = "-997:0";
    pub const SUPERVISOR_WAIT_FAILED: &str = "-996:0";
}
