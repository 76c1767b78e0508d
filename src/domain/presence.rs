//! src/domain/presence.rs
//!
//! `WorkerPresence` — ephemeral, TTL-backed liveness record (spec.md §3).
//! Lives entirely in the fast store; there is no durable row for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPresence {
    pub worker_id: String,
    pub cpus: i32,
    pub status: String,
    pub hostname: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}
