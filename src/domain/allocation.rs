//! src/domain/allocation.rs
//!
//! `ResourceAllocation` — the three-state ledger row central to
//! crash-safety (spec.md §3, §9 "three-state allocation is canonical").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Reserved,
    Allocated,
    Released,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Reserved => "reserved",
            AllocationStatus::Allocated => "allocated",
            AllocationStatus::Released => "released",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "reserved" => AllocationStatus::Reserved,
            "allocated" => AllocationStatus::Allocated,
            "released" => AllocationStatus::Released,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub job_id: i64,
    pub allocated_cpus: i32,
    pub node_name: String,
    pub process_id: Option<i32>,
    pub status: AllocationStatus,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}
