//! Database query functions for the `tasks` table.
//!
//! All status mutations use optimistic locking: the UPDATE's WHERE clause
//! pins the expected current status, and the caller observes
//! `rows_affected` (0 means another writer won the race). These functions
//! are the only mutators of `tasks.status`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskRecord, TaskStatus};

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<TaskRecord>> {
    let task = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Optional filters for [`list_tasks`]. All fields are ANDed together.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub group_id: Option<String>,
    pub kind: Option<String>,
    pub status: Option<TaskStatus>,
    pub entity_id: Option<String>,
}

/// List tasks matching the filter, newest first.
pub async fn list_tasks(
    pool: &PgPool,
    filter: &TaskFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<TaskRecord>> {
    let tasks = sqlx::query_as::<_, TaskRecord>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR group_id = $1) \
           AND ($2::text IS NULL OR kind = $2) \
           AND ($3::text IS NULL OR status = $3) \
           AND ($4::text IS NULL OR entity_id = $4) \
         ORDER BY created_at DESC \
         LIMIT $5 OFFSET $6",
    )
    .bind(&filter.group_id)
    .bind(&filter.kind)
    .bind(filter.status)
    .bind(&filter.entity_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Claim a pending task for a worker: `pending -> processing`.
///
/// Sets `started_at` and `worker_id`, and resets `progress`/`message` for
/// the new attempt. Returns the number of rows affected (0 means the task
/// was claimed, stopped, or finished elsewhere).
pub async fn begin_processing(pool: &PgPool, id: Uuid, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'processing', \
             started_at = NOW(), \
             worker_id = $2, \
             progress = 0, \
             message = NULL \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to begin processing")?;

    Ok(result.rows_affected())
}

/// Record a successful outcome: `processing -> completed`.
///
/// Clears the worker claim, stamps `completed_at`, and forces progress to
/// 100 regardless of the last throttled flush.
pub async fn complete_task(
    pool: &PgPool,
    id: Uuid,
    result_payload: Option<&[u8]>,
    entity_id: Option<&str>,
    entity_type: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', \
             completed_at = NOW(), \
             worker_id = NULL, \
             progress = 100, \
             result = $2, \
             entity_id = COALESCE($3, entity_id), \
             entity_type = COALESCE($4, entity_type) \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(result_payload)
    .bind(entity_id)
    .bind(entity_type)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Record a terminal failure: `processing -> failed`.
///
/// Increments the attempt counter (the failed run counts) and clears the
/// worker claim.
pub async fn fail_task(pool: &PgPool, id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', \
             completed_at = NOW(), \
             worker_id = NULL, \
             attempts = attempts + 1, \
             error = $2 \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Send a task back for another attempt: `processing -> pending`.
///
/// Increments the attempt counter, clears the claim and start time, records
/// the error that caused the retry, and resets progress for the next
/// attempt.
pub async fn retry_to_pending(pool: &PgPool, id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             worker_id = NULL, \
             started_at = NULL, \
             attempts = attempts + 1, \
             error = $2, \
             progress = 0 \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to retry task to pending")?;

    Ok(result.rows_affected())
}

/// Stop a task that has not been picked up yet: `pending -> stopped`.
pub async fn stop_pending(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'stopped', stopped_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to stop pending task")?;

    Ok(result.rows_affected())
}

/// Stop a running task: `processing -> stopped`.
///
/// Clears the worker claim so the terminal-state invariant holds; the
/// worker still holding the handler observes the stop at its next progress
/// flush and abandons the run.
pub async fn stop_processing(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'stopped', stopped_at = NOW(), worker_id = NULL \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to stop processing task")?;

    Ok(result.rows_affected())
}

/// Write a throttled progress update.
///
/// `GREATEST` keeps the stored percent monotonic within an attempt even if
/// flushes arrive out of order. Only applies while the task is still
/// processing; 0 rows affected tells the reporter the task was stopped or
/// finished by another writer.
pub async fn update_progress(
    pool: &PgPool,
    id: Uuid,
    progress: i32,
    message: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET progress = GREATEST(progress, $2), \
             message = COALESCE($3, message) \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(progress)
    .bind(message)
    .execute(pool)
    .await
    .context("failed to update task progress")?;

    Ok(result.rows_affected())
}

/// Find processing tasks of one kind whose run started before `cutoff`.
///
/// The caller derives `cutoff` from the kind's handler timeout plus a grace
/// period, so tasks about to fail naturally are not double-recovered.
pub async fn find_stalled(
    pool: &PgPool,
    kind: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<TaskRecord>> {
    let tasks = sqlx::query_as::<_, TaskRecord>(
        "SELECT * FROM tasks \
         WHERE status = 'processing' \
           AND kind = $1 \
           AND started_at IS NOT NULL \
           AND started_at < $2 \
         ORDER BY started_at ASC",
    )
    .bind(kind)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to find stalled tasks of kind {kind}"))?;

    Ok(tasks)
}

/// Status counts for one group's tasks.
#[derive(Debug, Clone, Default)]
pub struct GroupProgress {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub stopped: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given group.
pub async fn get_group_progress(pool: &PgPool, group_id: &str) -> Result<GroupProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM tasks \
         WHERE group_id = $1 \
         GROUP BY status",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
    .context("failed to get group progress")?;

    let mut progress = GroupProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "processing" => progress.processing = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "stopped" => progress.stopped = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
