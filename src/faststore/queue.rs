//! src/faststore/queue.rs
//!
//! At-least-once execution queue over Redis lists, reliable-queue
//! pattern (`BRPOPLPUSH` into a processing list, acked on completion) —
//! grounded on the `JobQueue` doc-comments in the dataforge scheduler
//! module. Enqueue is deduplicated by a deterministic id (`job_<id>`),
//! so a crash between "commit reservation" and "enqueue" that gets
//! retried by recovery never double-enqueues the same job.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::StoreError;

use super::RedisPool;

fn member_id(job_id: i64) -> String {
    format!("job_{job_id}")
}

#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    /// Enqueues `job_id`; a no-op if it (or an un-acked in-flight copy)
    /// is already present.
    async fn enqueue(&self, job_id: i64) -> Result<(), StoreError>;

    /// Blocks up to `timeout_secs` for work, moving it atomically into
    /// the processing list. Returns `None` on timeout.
    async fn dequeue(&self, timeout_secs: f64) -> Result<Option<i64>, StoreError>;

    /// Marks `job_id` done: removes it from the processing list and the
    /// dedupe set so it can be enqueued again in the future.
    async fn ack(&self, job_id: i64) -> Result<(), StoreError>;

    /// Moves everything sitting in the processing list (left behind by
    /// a worker that crashed mid-dequeue) back onto the main queue.
    /// Called once at startup (spec.md §4.7 recovery).
    async fn requeue_abandoned(&self) -> Result<usize, StoreError>;
}

pub struct RedisExecutionQueue {
    pub pool: RedisPool,
    pub queue_name: String,
}

impl RedisExecutionQueue {
    pub fn new(pool: RedisPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.queue_name)
    }

    fn members_key(&self) -> String {
        format!("{}:members", self.queue_name)
    }
}

#[async_trait]
impl ExecutionQueue for RedisExecutionQueue {
    async fn enqueue(&self, job_id: i64) -> Result<(), StoreError> {
        let mut conn = self.pool.manager.clone();
        let member = member_id(job_id);
        let added: i32 = conn.sadd(self.members_key(), &member).await?;
        if added == 1 {
            let _: () = conn.lpush(&self.queue_name, job_id).await?;
        }
        Ok(())
    }

    async fn dequeue(&self, timeout_secs: f64) -> Result<Option<i64>, StoreError> {
        let mut conn = self.pool.manager.clone();
        let job_id: Option<i64> = conn
            .brpoplpush(&self.queue_name, self.processing_key(), timeout_secs)
            .await?;
        Ok(job_id)
    }

    async fn ack(&self, job_id: i64) -> Result<(), StoreError> {
        let mut conn = self.pool.manager.clone();
        let _: () = conn.lrem(self.processing_key(), 0, job_id).await?;
        let _: () = conn.srem(self.members_key(), member_id(job_id)).await?;
        Ok(())
    }

    async fn requeue_abandoned(&self) -> Result<usize, StoreError> {
        let mut conn = self.pool.manager.clone();
        let mut moved = 0usize;
        loop {
            let item: Option<i64> = conn.rpoplpush(self.processing_key(), &self.queue_name).await?;
            match item {
                Some(_) => moved += 1,
                None => break,
            }
        }
        Ok(moved)
    }
}
