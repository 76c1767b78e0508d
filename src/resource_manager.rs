//! src/resource_manager.rs
//!
//! `ResourceManager` — the facade the scheduler and worker pool
//! consult for "does this job fit" and "what changed" (spec.md §4.4).
//! Postgres's `resource_allocations` table is authoritative; the Redis
//! counter (`resource:<node>:allocated_cpus`) exists purely so the
//! scheduler's hot admission-check path doesn't hit Postgres on every
//! tick, the same cache-in-front-of-ledger split the teacher's
//! `ResourceLedger` collapses into a single in-process `Mutex` because
//! it never needed to survive a process restart. Both the store and the
//! cache are held as trait objects so tests can substitute in-memory
//! fakes (see `testutil`).

use std::sync::Arc;

use crate::domain::{AllocationStatus, Job, ResourceAllocation};
use crate::error::StoreError;
use crate::faststore::registry::WorkerRegistry;
use crate::faststore::ResourceCache;
use crate::store::{AllocationRepository, JobRepository, Store};

pub struct ResourceManager {
    store: Arc<dyn Store>,
    cache: Arc<dyn ResourceCache>,
    registry: Arc<dyn WorkerRegistry>,
    /// Used only when the registry is unreachable (spec.md §4.3's
    /// "fall back to a configured minimum" clause); normally `total_cpus`
    /// is the live sum of advertised cpus across alive workers.
    fallback_total_cpus: i32,
    node_name: String,
}

impl ResourceManager {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn ResourceCache>,
        registry: Arc<dyn WorkerRegistry>,
        fallback_total_cpus: i32,
        node_name: String,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            fallback_total_cpus,
            node_name,
        }
    }

    /// Primes the cache counter from the durable ledger. Called once at
    /// startup, after recovery has reconciled any crash-time drift, so
    /// the cache never starts out of sync.
    pub async fn init_cache(&self) -> Result<(), StoreError> {
        let sum = self.store.sum_allocated_cpus(&self.node_name).await?;
        self.cache.set(&self.node_name, sum).await
    }

    pub async fn available_cpus(&self) -> Result<i32, StoreError> {
        let allocated = self.cache.get(&self.node_name).await?;
        Ok((self.total_cpus().await - allocated).max(0))
    }

    /// Sum of advertised cpus across currently-alive workers (spec.md
    /// §4.3, §4.4). A registry that's temporarily unreachable falls back
    /// to the configured minimum rather than propagating the error —
    /// callers treat a degraded registry as reduced, not zero, capacity
    /// unless the operator configured the fallback as zero.
    pub async fn total_cpus(&self) -> i32 {
        match self.registry.total_cpus().await {
            Ok(cpus) => cpus,
            Err(e) => {
                log::warn!(
                    "worker registry unreachable ({e}), falling back to configured total_cpus={}",
                    self.fallback_total_cpus
                );
                self.fallback_total_cpus
            }
        }
    }

    /// Reserves `cpus` for `job_id` in the durable ledger. No cache
    /// change here — the three-state model (spec.md §4.4) only counts a
    /// job once it reaches `allocated`, so a reservation that's never
    /// promoted (lost queue item, worker crash before fork) never burns
    /// capacity in the first place.
    pub async fn reserve(&self, job_id: i64, cpus: i32) -> Result<(), StoreError> {
        self.store.reserve(job_id, cpus, &self.node_name).await?;
        Ok(())
    }

    pub async fn record_pid(&self, job_id: i64, pid: i32) -> Result<bool, StoreError> {
        self.store.record_pid(job_id, pid).await
    }

    pub async fn transition_to_allocated(&self, job_id: i64) -> Result<bool, StoreError> {
        let promoted = self.store.transition_to_allocated(job_id).await?;
        if promoted {
            if let Some(allocation) = AllocationRepository::get(self.store.as_ref(), job_id).await? {
                self.cache.incr(&self.node_name, allocation.allocated_cpus).await?;
            }
        }
        Ok(promoted)
    }

    /// Releases the allocation. Idempotent: releasing an
    /// already-`released` row is a no-op on both store and cache.
    /// Decrements the cache only if the prior status was `allocated` —
    /// a `reserved` row was never counted up, so releasing it must not
    /// decrement.
    pub async fn release(&self, job_id: i64) -> Result<(), StoreError> {
        let allocated_cpus = AllocationRepository::get(self.store.as_ref(), job_id)
            .await?
            .map(|a| a.allocated_cpus);
        let prior = self.store.release(job_id).await?;
        if prior == Some(AllocationStatus::Allocated) {
            if let Some(cpus) = allocated_cpus {
                self.cache.decr(&self.node_name, cpus).await?;
            }
        }
        Ok(())
    }

    /// Recomputes the cache counter from the durable ledger. Used both
    /// at startup and on the periodic resync tick (spec.md §4.4) to
    /// bound how long a missed decrement/increment can leave the cache
    /// drifted from the store.
    pub async fn sync_from_store(&self) -> Result<(), StoreError> {
        self.init_cache().await
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub async fn get_allocation(&self, job_id: i64) -> Result<Option<ResourceAllocation>, StoreError> {
        AllocationRepository::get(self.store.as_ref(), job_id).await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        JobRepository::get(self.store.as_ref(), job_id).await
    }
}
