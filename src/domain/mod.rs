//! src/domain/mod.rs
//!
//! The data model (spec.md §3): `Job`, `ResourceAllocation`,
//! `WorkerPresence`. Pure data + small derived helpers, no I/O.

pub mod allocation;
pub mod job;
pub mod presence;

pub use allocation::{AllocationStatus, ResourceAllocation};
pub use job::{exit_codes, format_exit_code, Job, JobPriority, JobState, NewJob, ResourceSpec};
pub use presence::WorkerPresence;
