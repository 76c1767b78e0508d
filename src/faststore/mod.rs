//! src/faststore/mod.rs
//!
//! The fast store: Redis, a best-effort cache layered over the durable
//! Postgres store (spec.md §4.3). Nothing here is ever treated as
//! authoritative — every cached value can be reconstructed from
//! `store::PgStore` by `sync_from_store`, and the dashboard's
//! `cache_vs_store_drift` figure exists precisely so operators can see
//! when it has drifted.

pub mod queue;
pub mod registry;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::StoreError;

#[derive(Clone)]
pub struct RedisPool {
    pub manager: ConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Transient(anyhow::Error::new(e)))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

/// The `allocated_cpus` cache counter, abstracted so `ResourceManager`
/// can be driven by an in-memory fake in tests (spec.md §4.4). Real
/// traffic goes through Redis `INCRBY`/`DECRBY`/`SET`/`GET`.
#[async_trait]
pub trait ResourceCache: Send + Sync {
    async fn get(&self, node_name: &str) -> Result<i32, StoreError>;
    async fn set(&self, node_name: &str, value: i32) -> Result<(), StoreError>;
    async fn incr(&self, node_name: &str, delta: i32) -> Result<(), StoreError>;
    async fn decr(&self, node_name: &str, delta: i32) -> Result<(), StoreError>;
}

fn cache_key(node_name: &str) -> String {
    format!("taskforge:resource:{node_name}:allocated_cpus")
}

#[async_trait]
impl ResourceCache for RedisPool {
    async fn get(&self, node_name: &str) -> Result<i32, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.get::<_, Option<i32>>(cache_key(node_name)).await?.unwrap_or(0))
    }

    async fn set(&self, node_name: &str, value: i32) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(cache_key(node_name), value).await?;
        Ok(())
    }

    async fn incr(&self, node_name: &str, delta: i32) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.incr(cache_key(node_name), delta).await?;
        Ok(())
    }

    async fn decr(&self, node_name: &str, delta: i32) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.decr(cache_key(node_name), delta).await?;
        Ok(())
    }
}
