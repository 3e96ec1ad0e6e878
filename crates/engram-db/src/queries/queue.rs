//! Database query functions for the `queue_state` table -- the durable
//! per-group FIFO and in-flight set.
//!
//! A task id has at most one row here. `worker_id` discriminates pending
//! (NULL) from in-flight (non-NULL), so an id can never be in both states,
//! and a terminal task has no row at all.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{QueueEntry, TaskRecord};

/// Parameters for enqueueing a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub group_id: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub max_attempts: i32,
}

/// Insert a pending task row and its queue entry in one transaction.
///
/// The two writes commit or fail together, so a task row can never exist
/// without its ordering entry (or vice versa). A unique violation on the
/// task id propagates to the caller, which may treat it as an idempotent
/// duplicate.
pub async fn enqueue(pool: &PgPool, new: &NewTask) -> Result<TaskRecord> {
    let mut tx = pool.begin().await.context("failed to begin enqueue")?;

    let task = sqlx::query_as::<_, TaskRecord>(
        "INSERT INTO tasks (id, group_id, kind, payload, max_attempts) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(&new.group_id)
    .bind(&new.kind)
    .bind(&new.payload)
    .bind(new.max_attempts)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert task")?;

    sqlx::query("INSERT INTO queue_state (task_id, group_id) VALUES ($1, $2)")
        .bind(new.id)
        .bind(&new.group_id)
        .execute(&mut *tx)
        .await
        .context("failed to insert queue entry")?;

    tx.commit().await.context("failed to commit enqueue")?;

    Ok(task)
}

/// Atomically claim the head of a group's pending queue for a worker.
///
/// Single statement: the subselect pins the lowest-position pending row
/// with `FOR UPDATE SKIP LOCKED`, and the UPDATE moves it into the
/// in-flight state. Returns `None` when the group has no pending entries.
pub async fn claim(pool: &PgPool, group_id: &str, worker_id: &str) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "UPDATE queue_state \
         SET worker_id = $2, claimed_at = NOW() \
         WHERE task_id = ( \
             SELECT task_id FROM queue_state \
             WHERE group_id = $1 AND worker_id IS NULL \
             ORDER BY position \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING task_id",
    )
    .bind(group_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to claim from group {group_id}"))?;

    Ok(row.map(|(id,)| id))
}

/// Acknowledge a claimed task: remove its in-flight entry.
///
/// No-op if the entry is absent or held by a different worker (e.g. the
/// entry was already re-enqueued by the recovery sweeper).
pub async fn ack(pool: &PgPool, task_id: Uuid, worker_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM queue_state WHERE task_id = $1 AND worker_id = $2")
        .bind(task_id)
        .bind(worker_id)
        .execute(pool)
        .await
        .context("failed to ack queue entry")?;

    Ok(result.rows_affected())
}

/// Remove a queue entry unconditionally (terminal cleanup).
pub async fn remove(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM queue_state WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to remove queue entry")?;

    Ok(result.rows_affected())
}

/// Remove a queue entry only while it is still pending.
///
/// Used by stop: if a worker claimed the entry concurrently, the row is
/// left alone and the worker's own claim CAS loses against the stopped
/// task row instead.
pub async fn remove_pending(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM queue_state WHERE task_id = $1 AND worker_id IS NULL")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to remove pending queue entry")?;

    Ok(result.rows_affected())
}

/// Return a claimed task to the head of its group's pending queue.
///
/// The entry gets a position below the group's current minimum, so the
/// retried task stays ahead of every sibling enqueued after it. Upserts:
/// an entry that was already acked (or otherwise lost) is recreated, so a
/// pending task row always regains its ordering entry.
pub async fn re_enqueue_stalled(pool: &PgPool, task_id: Uuid, group_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO queue_state (task_id, group_id, position) \
         VALUES ($1, $2, \
             COALESCE( \
                 (SELECT MIN(position) FROM queue_state \
                  WHERE group_id = $2 AND task_id <> $1), \
                 nextval('queue_position_seq')) - 1) \
         ON CONFLICT (task_id) DO UPDATE \
         SET worker_id = NULL, \
             claimed_at = NULL, \
             position = EXCLUDED.position",
    )
    .bind(task_id)
    .bind(group_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to re-enqueue task {task_id}"))?;

    Ok(result.rows_affected())
}

/// Fetch a task's queue entry, if it has one.
pub async fn get_entry(pool: &PgPool, task_id: Uuid) -> Result<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>("SELECT * FROM queue_state WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch queue entry")?;

    Ok(entry)
}

/// Number of pending (unclaimed) entries in a group.
pub async fn pending_len(pool: &PgPool, group_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM queue_state \
         WHERE group_id = $1 AND worker_id IS NULL",
    )
    .bind(group_id)
    .fetch_one(pool)
    .await
    .context("failed to count pending queue entries")?;

    Ok(row.0)
}

/// Distinct groups that currently have pending entries.
pub async fn groups_with_pending(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT group_id FROM queue_state WHERE worker_id IS NULL",
    )
    .fetch_all(pool)
    .await
    .context("failed to list groups with pending entries")?;

    Ok(rows.into_iter().map(|(g,)| g).collect())
}

/// Pending depth per group, deepest first (operator visibility).
pub async fn pending_depths(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT group_id, COUNT(*) as cnt \
         FROM queue_state \
         WHERE worker_id IS NULL \
         GROUP BY group_id \
         ORDER BY cnt DESC, group_id",
    )
    .fetch_all(pool)
    .await
    .context("failed to get pending depths")?;

    Ok(rows)
}

/// Drop queue entries whose task row is already terminal (e.g. a stop
/// that landed while the claiming worker was dying).
pub async fn purge_terminal(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM queue_state q \
         USING tasks t \
         WHERE q.task_id = t.id \
           AND t.status IN ('completed', 'failed', 'stopped')",
    )
    .execute(pool)
    .await
    .context("failed to purge terminal queue entries")?;

    Ok(result.rows_affected())
}

/// Rebuild missing queue entries from pending task rows.
///
/// Cold-start repair: the tasks table is the source of truth, so any
/// pending task without an ordering entry gets one back, in creation
/// order. Returns the number of rows inserted.
pub async fn recover(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO queue_state (task_id, group_id) \
         SELECT t.id, t.group_id FROM tasks t \
         WHERE t.status = 'pending' \
           AND NOT EXISTS (SELECT 1 FROM queue_state q WHERE q.task_id = t.id) \
         ORDER BY t.created_at ASC",
    )
    .execute(pool)
    .await
    .context("failed to recover queue entries")?;

    Ok(result.rows_affected())
}
