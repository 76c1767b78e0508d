//! src/faststore/registry.rs
//!
//! Worker presence, held entirely in Redis with a TTL: a worker that
//! stops heartbeating simply expires out of the registry, no explicit
//! deregistration required on crash (spec.md §4.3, §4.6).

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;

use crate::domain::WorkerPresence;
use crate::error::StoreError;

use super::RedisPool;

const WORKER_KEY_PREFIX: &str = "taskforge:worker:";
const WORKER_INDEX_KEY: &str = "taskforge:workers:index";

fn worker_key(worker_id: &str) -> String {
    format!("{WORKER_KEY_PREFIX}{worker_id}")
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(&self, presence: &WorkerPresence, ttl_secs: u64) -> Result<(), StoreError>;
    async fn heartbeat(&self, worker_id: &str, ttl_secs: u64) -> Result<bool, StoreError>;
    async fn unregister(&self, worker_id: &str) -> Result<(), StoreError>;
    async fn list_alive(&self) -> Result<Vec<WorkerPresence>, StoreError>;
    async fn total_cpus(&self) -> Result<i32, StoreError>;
}

#[async_trait]
impl WorkerRegistry for RedisPool {
    async fn register(&self, presence: &WorkerPresence, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let key = worker_key(&presence.worker_id);
        let fields: Vec<(&str, String)> = vec![
            ("cpus", presence.cpus.to_string()),
            ("status", presence.status.clone()),
            ("hostname", presence.hostname.clone()),
            ("registered_at", presence.registered_at.to_rfc3339()),
            ("last_heartbeat", presence.last_heartbeat.to_rfc3339()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await?;
        let _: () = conn.expire(&key, ttl_secs as i64).await?;
        let _: () = conn.sadd(WORKER_INDEX_KEY, &presence.worker_id).await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let key = worker_key(worker_id);
        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(false);
        }
        let _: () = conn
            .hset(&key, "last_heartbeat", Utc::now().to_rfc3339())
            .await?;
        let _: () = conn.expire(&key, ttl_secs as i64).await?;
        Ok(true)
    }

    async fn unregister(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(worker_key(worker_id)).await?;
        let _: () = conn.srem(WORKER_INDEX_KEY, worker_id).await?;
        Ok(())
    }

    async fn list_alive(&self) -> Result<Vec<WorkerPresence>, StoreError> {
        let mut conn = self.manager.clone();
        let ids: Vec<String> = conn.smembers(WORKER_INDEX_KEY).await?;
        let mut alive = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            let key = worker_key(&id);
            let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
            if fields.is_empty() {
                stale.push(id);
                continue;
            }
            let presence = WorkerPresence {
                worker_id: id,
                cpus: fields.get("cpus").and_then(|v| v.parse().ok()).unwrap_or(0),
                status: fields.get("status").cloned().unwrap_or_default(),
                hostname: fields.get("hostname").cloned().unwrap_or_default(),
                registered_at: fields
                    .get("registered_at")
                    .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
                last_heartbeat: fields
                    .get("last_heartbeat")
                    .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            };
            alive.push(presence);
        }
        if !stale.is_empty() {
            let _: () = conn.srem(WORKER_INDEX_KEY, stale).await?;
        }
        Ok(alive)
    }

    async fn total_cpus(&self) -> Result<i32, StoreError> {
        Ok(self.list_alive().await?.iter().map(|w| w.cpus).sum())
    }
}
