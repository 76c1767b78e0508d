//! src/error.rs
//!
//! Error taxonomy (spec.md §7): transient store errors are retried
//! in-place by the repository layer; logical-contract violations and
//! child-process failures propagate as data, not panics. Daemon loops
//! (scheduler tick, cleanup strategy, worker job execution) catch at
//! their own boundary so one bad unit of work never takes the process
//! down with it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("contract violation: {0}")]
    Contract(String),
}

impl StoreError {
    pub fn contract(msg: impl Into<String>) -> Self {
        StoreError::Contract(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Transient(anyhow::Error::new(e))
            }
            sqlx::Error::RowNotFound => StoreError::Contract("row not found".into()),
            _ => StoreError::Transient(anyhow::Error::new(e)),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Transient(anyhow::Error::new(e))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job {0} did not become running within the poll bound")]
    NeverStarted(i64),
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("strategy {name} failed: {source}")]
    StrategyFailed {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
