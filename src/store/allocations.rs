//! src/store/allocations.rs
//!
//! `PgStore`'s `AllocationRepository` implementation — the three-state
//! (`reserved` → `allocated` → `released`) ledger that makes crash
//! recovery possible (spec.md §3, §9).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::domain::{AllocationStatus, ResourceAllocation};
use crate::error::StoreError;

use super::{with_retry, AllocationRepository, PgStore};

fn row_to_allocation(row: sqlx::postgres::PgRow) -> Result<ResourceAllocation, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = AllocationStatus::parse(&status_str)
        .ok_or_else(|| StoreError::contract(format!("unknown allocation status {status_str:?}")))?;
    Ok(ResourceAllocation {
        job_id: row.try_get("job_id")?,
        allocated_cpus: row.try_get("allocated_cpus")?,
        node_name: row.try_get("node_name")?,
        process_id: row.try_get("process_id")?,
        status,
        allocated_at: row.try_get("allocated_at")?,
        released_at: row.try_get("released_at")?,
    })
}

#[async_trait]
impl AllocationRepository for PgStore {
    async fn reserve(
        &self,
        job_id: i64,
        allocated_cpus: i32,
        node_name: &str,
    ) -> Result<ResourceAllocation, StoreError> {
        with_retry("reserve_allocation", || async {
            let row = sqlx::query(
                "INSERT INTO resource_allocations (job_id, allocated_cpus, node_name, status) \
                 VALUES ($1, $2, $3, 'reserved') \
                 ON CONFLICT (job_id) DO UPDATE SET \
                    allocated_cpus = EXCLUDED.allocated_cpus, \
                    node_name = EXCLUDED.node_name, \
                    status = 'reserved', \
                    allocated_at = now(), \
                    released_at = NULL \
                 RETURNING *",
            )
            .bind(job_id)
            .bind(allocated_cpus)
            .bind(node_name)
            .fetch_one(&self.pool)
            .await?;
            row_to_allocation(row)
        })
        .await
    }

    async fn record_pid(&self, job_id: i64, process_id: i32) -> Result<bool, StoreError> {
        with_retry("record_pid", || async {
            let result = sqlx::query(
                "UPDATE resource_allocations SET process_id = $2 \
                 WHERE job_id = $1 AND status = 'reserved'",
            )
            .bind(job_id)
            .bind(process_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn transition_to_allocated(&self, job_id: i64) -> Result<bool, StoreError> {
        with_retry("transition_to_allocated", || async {
            let result = sqlx::query(
                "UPDATE resource_allocations SET status = 'allocated' \
                 WHERE job_id = $1 AND status = 'reserved'",
            )
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn release(
        &self,
        job_id: i64,
    ) -> Result<Option<AllocationStatus>, StoreError> {
        with_retry("release_allocation", || async {
            let prior: Option<String> = sqlx::query_scalar(
                "SELECT status FROM resource_allocations WHERE job_id = $1",
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
            let Some(prior) = prior else {
                return Ok(None);
            };
            sqlx::query(
                "UPDATE resource_allocations SET status = 'released', released_at = now() \
                 WHERE job_id = $1 AND status != 'released'",
            )
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            let status = AllocationStatus::parse(&prior)
                .ok_or_else(|| StoreError::contract(format!("unknown allocation status {prior:?}")))?;
            Ok(Some(status))
        })
        .await
    }

    async fn sum_allocated_cpus(&self, node_name: &str) -> Result<i32, StoreError> {
        with_retry("sum_allocated_cpus", || async {
            let sum: Option<i64> = sqlx::query_scalar(
                "SELECT SUM(allocated_cpus) FROM resource_allocations \
                 WHERE node_name = $1 AND status = 'allocated'",
            )
            .bind(node_name)
            .fetch_one(&self.pool)
            .await?;
            Ok(sum.unwrap_or(0) as i32)
        })
        .await
    }

    async fn sum_allocated_cpus_all(&self) -> Result<i32, StoreError> {
        with_retry("sum_allocated_cpus_all", || async {
            let sum: Option<i64> = sqlx::query_scalar(
                "SELECT SUM(allocated_cpus) FROM resource_allocations WHERE status = 'allocated'",
            )
            .fetch_one(&self.pool)
            .await?;
            Ok(sum.unwrap_or(0) as i32)
        })
        .await
    }

    async fn get(&self, job_id: i64) -> Result<Option<ResourceAllocation>, StoreError> {
        with_retry("get_allocation", || async {
            let row = sqlx::query("SELECT * FROM resource_allocations WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(row_to_allocation).transpose()
        })
        .await
    }

    async fn find_stale_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ResourceAllocation>, StoreError> {
        with_retry("find_stale_reservations", || async {
            let rows = sqlx::query(
                "SELECT * FROM resource_allocations \
                 WHERE status = 'reserved' AND allocated_at < $1 \
                 ORDER BY job_id ASC",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_allocation).collect()
        })
        .await
    }

    async fn find_completed_jobs_with_live_allocations(
        &self,
    ) -> Result<Vec<ResourceAllocation>, StoreError> {
        with_retry("find_completed_jobs_with_live_allocations", || async {
            let rows = sqlx::query(
                "SELECT ra.* FROM resource_allocations ra \
                 JOIN jobs j ON j.id = ra.job_id \
                 WHERE ra.status != 'released' \
                   AND j.state IN ('completed', 'failed', 'cancelled') \
                 ORDER BY ra.job_id ASC",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_allocation).collect()
        })
        .await
    }

    async fn find_allocated_with_dead_pid(
        &self,
        node_name: &str,
        is_alive: &(dyn Fn(i32) -> bool + Send + Sync),
    ) -> Result<Vec<ResourceAllocation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM resource_allocations WHERE node_name = $1 AND status = 'allocated'",
        )
        .bind(node_name)
        .fetch_all(&self.pool)
        .await?;
        let allocations = rows
            .into_iter()
            .map(row_to_allocation)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(allocations
            .into_iter()
            .filter(|a| match a.process_id {
                Some(pid) => !is_alive(pid),
                None => true,
            })
            .collect())
    }
}
