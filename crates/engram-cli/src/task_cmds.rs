//! Thin task commands: enqueue, status, stop, retry.

use anyhow::{Context, Result};
use uuid::Uuid;

use engram_core::{EnqueueOptions, TaskQueue};
use engram_db::models::TaskStatus;
use engram_db::queries::tasks as task_db;
use engram_db::queries::tasks::TaskFilter;

/// Run the enqueue command. The payload must be a JSON document; it is
/// stored verbatim for the handler.
pub async fn run_enqueue(
    queue: &TaskQueue,
    kind: &str,
    group: &str,
    payload: &str,
    max_attempts: Option<i32>,
    task_id: Option<&str>,
) -> Result<()> {
    let payload_json: serde_json::Value =
        serde_json::from_str(payload).context("payload must be valid JSON")?;
    let task_id = task_id
        .map(|s| Uuid::parse_str(s).with_context(|| format!("invalid task ID: {s}")))
        .transpose()?;

    let id = queue
        .enqueue(
            kind,
            group,
            serde_json::to_vec(&payload_json).context("failed to encode payload")?,
            EnqueueOptions {
                max_attempts,
                task_id,
            },
        )
        .await?;

    println!("Enqueued task {id} (kind {kind}, group {group}).");
    Ok(())
}

/// Run the status command.
///
/// When `task_id_str` is `Some`, shows detailed status for that task.
/// When `None`, lists recent tasks matching the filters.
pub async fn run_status(
    queue: &TaskQueue,
    task_id_str: Option<&str>,
    group: Option<&str>,
    kind: Option<&str>,
    status: Option<&str>,
    limit: i64,
) -> Result<()> {
    match task_id_str {
        Some(id_str) => run_task_status(queue, id_str).await,
        None => run_task_list(queue, group, kind, status, limit).await,
    }
}

/// Show detailed status for a single task.
async fn run_task_status(queue: &TaskQueue, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;
    let task = queue.get(task_id).await?;

    println!("Task: {} (kind {}, group {})", task.id, task.kind, task.group_id);
    println!(
        "Status: {} (attempt {}/{}, progress {}%)",
        task.status, task.attempts, task.max_attempts, task.progress
    );
    if let Some(message) = &task.message {
        println!("Message: {message}");
    }
    if let Some(error) = &task.error {
        println!("Error: {error}");
    }
    if let Some(worker_id) = &task.worker_id {
        println!("Worker: {worker_id}");
    }
    println!("Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(started_at) = task.started_at {
        println!("Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed_at) = task.completed_at {
        println!(
            "Completed: {}",
            completed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(stopped_at) = task.stopped_at {
        println!("Stopped: {}", stopped_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(result) = &task.result {
        println!("Result: {}", String::from_utf8_lossy(result));
    }

    Ok(())
}

/// List recent tasks matching the filters.
///
/// With a group filter, leads with the group's status counts.
async fn run_task_list(
    queue: &TaskQueue,
    group: Option<&str>,
    kind: Option<&str>,
    status: Option<&str>,
    limit: i64,
) -> Result<()> {
    if let Some(group) = group {
        let progress = task_db::get_group_progress(queue.pool(), group).await?;
        println!("Group: {group}");
        println!("Progress: {}/{} completed", progress.completed, progress.total);
        println!(
            "  pending={} processing={} completed={} failed={} stopped={}",
            progress.pending,
            progress.processing,
            progress.completed,
            progress.failed,
            progress.stopped,
        );
        println!();
    }

    let status = status
        .map(|s| s.parse::<TaskStatus>())
        .transpose()
        .context("invalid status filter")?;
    let filter = TaskFilter {
        group_id: group.map(str::to_owned),
        kind: kind.map(str::to_owned),
        status,
        entity_id: None,
    };

    let tasks = queue.list(&filter, limit, 0).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    for task in &tasks {
        let status_icon = match task.status {
            TaskStatus::Pending => ".",
            TaskStatus::Processing => "*",
            TaskStatus::Completed => "+",
            TaskStatus::Failed => "!",
            TaskStatus::Stopped => "x",
        };
        println!(
            "  [{}] {} {} group={} attempt={} {}%",
            status_icon, task.id, task.kind, task.group_id, task.attempts, task.progress
        );
    }

    Ok(())
}

/// Run the stop command.
pub async fn run_stop(queue: &TaskQueue, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;
    let accepted = queue.stop(task_id).await?;
    if accepted {
        println!("Task {task_id} stopped.");
    } else {
        println!("Task {task_id} was already finished; nothing to stop.");
    }
    Ok(())
}

/// Run the retry command.
pub async fn run_retry(queue: &TaskQueue, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;
    let clone_id = queue.retry(task_id).await?;
    println!("Task {task_id} cloned as {clone_id}.");
    Ok(())
}
