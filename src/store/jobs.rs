//! src/store/jobs.rs
//!
//! `PgJobRepository` — the concrete `JobRepository` over Postgres.
//! Column mapping follows the `#[sqlx(type_name = ..., rename_all =
//! "snake_case")]` / `fetch_optional` idiom used throughout the fourth
//! example pack's job-store code, adapted to this schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::domain::{Job, JobPriority, JobState, NewJob, ResourceSpec};
use crate::error::StoreError;

use super::{with_retry, JobRepository, PgStore};

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let state_str: String = row.try_get("state")?;
    let state = JobState::parse(&state_str)
        .ok_or_else(|| StoreError::contract(format!("unknown job state {state_str:?}")))?;
    let environment: serde_json::Value = row.try_get("environment")?;
    let node_list: serde_json::Value = row.try_get("node_list")?;

    Ok(Job {
        id: row.try_get("id")?,
        script: row.try_get("script")?,
        work_dir: row.try_get("work_dir")?,
        stdout_path: row.try_get("stdout_path")?,
        stderr_path: row.try_get("stderr_path")?,
        environment: serde_json::from_value(environment).unwrap_or_default(),
        resources: ResourceSpec {
            ntasks_per_node: row.try_get("ntasks_per_node")?,
            cpus_per_task: row.try_get("cpus_per_task")?,
            memory_per_node: row.try_get("memory_per_node")?,
            time_limit_minutes: row.try_get("time_limit_minutes")?,
        },
        partition: row.try_get("partition")?,
        account: row.try_get("account")?,
        exclusive: row.try_get("exclusive")?,
        priority: JobPriority(row.try_get("priority")?),
        submit_time: row.try_get("submit_time")?,
        eligible_time: row.try_get("eligible_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        node_list: serde_json::from_value(node_list).unwrap_or_default(),
        exit_code: row.try_get("exit_code")?,
        error_msg: row.try_get("error_msg")?,
        state,
    })
}

#[async_trait]
impl JobRepository for PgStore {
    async fn create_pending(&self, job: NewJob) -> Result<Job, StoreError> {
        with_retry("create_pending", || async {
            let environment = serde_json::to_value(&job.environment)
                .map_err(|e| StoreError::contract(e.to_string()))?;
            let row = sqlx::query(
                r#"
                INSERT INTO jobs (
                    script, work_dir, stdout_path, stderr_path, environment,
                    ntasks_per_node, cpus_per_task, memory_per_node, time_limit_minutes,
                    partition, account, exclusive, priority, state
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, 'pending')
                RETURNING *
                "#,
            )
            .bind(&job.script)
            .bind(&job.work_dir)
            .bind(&job.stdout_path)
            .bind(&job.stderr_path)
            .bind(&environment)
            .bind(job.resources.ntasks_per_node)
            .bind(job.resources.cpus_per_task)
            .bind(job.resources.memory_per_node)
            .bind(job.resources.time_limit_minutes)
            .bind(&job.partition)
            .bind(&job.account)
            .bind(job.exclusive)
            .fetch_one(&self.pool)
            .await?;
            row_to_job(row)
        })
        .await
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        with_retry("get_job", || async {
            let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(row_to_job).transpose()
        })
        .await
    }

    async fn list_pending_fifo(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        with_retry("list_pending_fifo", || async {
            let rows = sqlx::query(
                "SELECT * FROM jobs WHERE state = 'pending' AND eligible_time <= now() \
                 ORDER BY submit_time ASC, id ASC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_job).collect()
        })
        .await
    }

    async fn list_running(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        with_retry("list_running", || async {
            let rows = sqlx::query(
                "SELECT * FROM jobs WHERE state = 'running' ORDER BY start_time DESC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_job).collect()
        })
        .await
    }

    async fn transition_to_running(
        &self,
        job_id: i64,
        node_list: Vec<String>,
    ) -> Result<bool, StoreError> {
        with_retry("transition_to_running", || {
            let node_list = node_list.clone();
            async move {
                let node_list_json = serde_json::to_value(&node_list)
                    .map_err(|e| StoreError::contract(e.to_string()))?;
                let result = sqlx::query(
                    "UPDATE jobs SET state = 'running', start_time = now(), node_list = $2 \
                     WHERE id = $1 AND state = 'pending'",
                )
                .bind(job_id)
                .bind(&node_list_json)
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() > 0)
            }
        })
        .await
    }

    async fn mark_terminal(
        &self,
        job_id: i64,
        state: JobState,
        exit_code: Option<String>,
        error_msg: Option<String>,
    ) -> Result<bool, StoreError> {
        if !state.is_terminal() {
            return Err(StoreError::contract(format!(
                "mark_terminal called with non-terminal state {state:?}"
            )));
        }
        with_retry("mark_terminal", || {
            let exit_code = exit_code.clone();
            let error_msg = error_msg.clone();
            async move {
                let result = sqlx::query(
                    "UPDATE jobs SET state = $2, end_time = now(), exit_code = $3, error_msg = $4 \
                     WHERE id = $1 AND state NOT IN ('completed', 'failed', 'cancelled')",
                )
                .bind(job_id)
                .bind(state.as_str())
                .bind(&exit_code)
                .bind(&error_msg)
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() > 0)
            }
        })
        .await
    }

    async fn cancel_if_cancellable(&self, job_id: i64) -> Result<bool, StoreError> {
        with_retry("cancel_if_cancellable", || async {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'cancelled', end_time = now(), \
                 exit_code = $2, error_msg = 'cancelled by request' \
                 WHERE id = $1 AND state IN ('pending', 'running')",
            )
            .bind(job_id)
            .bind(crate::domain::exit_codes::CANCELLED)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn find_running_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        with_retry("find_running_older_than", || async {
            let rows = sqlx::query(
                "SELECT * FROM jobs WHERE state = 'running' AND start_time < $1 \
                 ORDER BY id ASC",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_job).collect()
        })
        .await
    }

    async fn find_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        with_retry("find_terminal_older_than", || async {
            let rows = sqlx::query(
                "SELECT * FROM jobs \
                 WHERE state IN ('completed', 'failed', 'cancelled') AND end_time < $1 \
                 ORDER BY end_time ASC LIMIT $2",
            )
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_job).collect()
        })
        .await
    }

    async fn delete(&self, job_id: i64) -> Result<bool, StoreError> {
        with_retry("delete_job", || async {
            sqlx::query("DELETE FROM resource_allocations WHERE job_id = $1")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            let result = sqlx::query(
                "DELETE FROM jobs WHERE id = $1 \
                 AND state IN ('completed', 'failed', 'cancelled')",
            )
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}
