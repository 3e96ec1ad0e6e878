//! Worker pool: a fixed population of identical loops that acquire a
//! group from the scheduler, claim the head of its queue, dispatch to the
//! registered handler under its timeout, and record the outcome.
//!
//! Status moves along the graph
//!
//! ```text
//! pending    -> processing            (claim)
//! pending    -> stopped               (stop before dispatch)
//! processing -> completed             (handler success)
//! processing -> failed                (retries exhausted / permanent)
//! processing -> pending               (retryable failure, stall recovery)
//! processing -> stopped               (cooperative stop)
//! ```
//!
//! and every edge is a compare-and-swap in `engram_db::queries::tasks`, so
//! racing writers resolve to exactly one winner. Handler errors never
//! escape this module; they become task-row fields.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use engram_db::models::{TaskRecord, TaskStatus};
use engram_db::queries::{queue, tasks};

use crate::config::QueueConfig;
use crate::handler::{FailureKind, HandlerContext, HandlerFailure, HandlerRegistry};
use crate::progress::{self, ProgressBus, ProgressEvent, ProgressReporter};
use crate::scheduler::GroupScheduler;
use crate::schema_sync::SchemaSyncSink;

/// Shared state handed to every worker and the sweeper.
pub(crate) struct WorkerContext {
    pub pool: PgPool,
    pub registry: Arc<HandlerRegistry>,
    pub scheduler: Arc<GroupScheduler>,
    pub bus: Arc<ProgressBus>,
    pub schema_sync: Arc<SchemaSyncSink>,
    pub config: QueueConfig,
}

/// One worker loop. Runs until the cancellation token fires; a task in
/// flight at shutdown finishes its current store write and exits at the
/// next acquire.
pub(crate) async fn run_worker(
    ctx: Arc<WorkerContext>,
    worker_id: String,
    cancel: CancellationToken,
) {
    tracing::debug!(worker_id = %worker_id, "worker started");
    loop {
        let group = tokio::select! {
            group = ctx.scheduler.acquire() => group,
            _ = cancel.cancelled() => break,
        };
        service_group(&ctx, &worker_id, &group).await;
    }
    tracing::debug!(worker_id = %worker_id, "worker stopped");
}

/// Claim and run at most one task from a held group, then hand the group
/// back to the scheduler.
async fn service_group(ctx: &WorkerContext, worker_id: &str, group: &str) {
    let outcome: Result<()> = async {
        match queue::claim(&ctx.pool, group, worker_id).await? {
            Some(task_id) => {
                run_claimed(ctx, worker_id, group, task_id).await?;
                // The retry path re-enqueues the entry first, clearing its
                // worker tag, so this ack is a no-op there.
                queue::ack(&ctx.pool, task_id, worker_id).await?;
            }
            None => {}
        }
        Ok(())
    }
    .await;

    if let Err(e) = &outcome {
        // Leave any in-flight entry alone: the sweeper re-enqueues it once
        // the task row goes stale.
        tracing::error!(
            worker_id = %worker_id,
            group_id = %group,
            error = %format!("{e:#}"),
            "failed to service group"
        );
    }

    let remaining = match queue::pending_len(&ctx.pool, group).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(group_id = %group, error = %e, "pending length check failed");
            0
        }
    };
    ctx.scheduler.release(group, remaining > 0);

    if remaining == 0 {
        // An enqueue landing between the length check and the release
        // would find the group still active and be dropped; re-check now
        // that the group has left the active set.
        if let Ok(n) = queue::pending_len(&ctx.pool, group).await {
            if n > 0 {
                ctx.scheduler.notify_group(group);
            }
        }
    }

    if outcome.is_err() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Retry a transient store failure a few times with doubling backoff
/// before giving up on the current operation.
async fn with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(50);
    let mut last_err = None;
    for _ in 0..3 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    op = op_name,
                    error = %format!("{e:#}"),
                    "store operation failed, backing off"
                );
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("store operation failed: {op_name}")))
}

/// Run one claimed task end to end. `Err` means a store-level failure;
/// handler outcomes are always mapped into the task row.
async fn run_claimed(
    ctx: &WorkerContext,
    worker_id: &str,
    group: &str,
    task_id: uuid::Uuid,
) -> Result<()> {
    let Some(record) = tasks::get_task(&ctx.pool, task_id).await? else {
        tracing::warn!(task_id = %task_id, "claimed task row missing");
        return Ok(());
    };

    let rows = tasks::begin_processing(&ctx.pool, task_id, worker_id).await?;
    if rows == 0 {
        // Stopped or resolved while queued; never dispatch it.
        tracing::debug!(
            task_id = %task_id,
            status = %record.status,
            "skipping task no longer pending"
        );
        return Ok(());
    }

    tracing::info!(
        task_id = %task_id,
        kind = %record.kind,
        group_id = %group,
        worker_id = %worker_id,
        attempt = record.attempts,
        "task claimed"
    );

    let Some(handler) = ctx.registry.get(&record.kind) else {
        let rows =
            tasks::fail_task(&ctx.pool, task_id, &format!("unknown task kind: {}", record.kind))
                .await?;
        if rows > 0 {
            tracing::error!(task_id = %task_id, kind = %record.kind, "no handler for task kind");
        }
        progress::publish_snapshot(&ctx.pool, &ctx.bus, task_id).await?;
        return Ok(());
    };

    ctx.bus.publish(ProgressEvent {
        task_id,
        progress: 0,
        message: None,
        status: TaskStatus::Processing,
        timestamp: chrono::Utc::now(),
    });

    let reporter = ProgressReporter::new(
        ctx.pool.clone(),
        Arc::clone(&ctx.bus),
        task_id,
        ctx.config.progress_flush_min_interval,
    );
    let handler_ctx = HandlerContext {
        task_id,
        group_id: group.to_owned(),
        attempt: record.attempts,
    };

    let outcome = match tokio::time::timeout(
        handler.timeout(),
        handler.process(&handler_ctx, &record.payload, &reporter),
    )
    .await
    {
        Ok(result) => result,
        Err(_elapsed) => Err(HandlerFailure::retryable("timeout")),
    };

    match outcome {
        Ok(success) => {
            let rows = with_backoff("complete_task", || {
                tasks::complete_task(
                    &ctx.pool,
                    task_id,
                    success.result.as_deref(),
                    success.entity_id.as_deref(),
                    success.entity_type.as_deref(),
                )
            })
            .await?;
            if rows > 0 {
                tracing::info!(task_id = %task_id, kind = %record.kind, "task completed");
                if let Some(schema) = &success.schema {
                    ctx.schema_sync.sync(schema).await;
                }
            } else {
                tracing::warn!(task_id = %task_id, "completion dropped, task no longer processing");
            }
            progress::publish_snapshot(&ctx.pool, &ctx.bus, task_id).await?;
        }
        Err(failure) => {
            finish_failure(ctx, &record, failure).await?;
        }
    }

    Ok(())
}

/// Map a failed attempt onto the retry policy.
async fn finish_failure(
    ctx: &WorkerContext,
    record: &TaskRecord,
    failure: HandlerFailure,
) -> Result<()> {
    let task_id = record.id;

    match failure.kind {
        FailureKind::Stopped => {
            // A stop request usually moved the row already; this CAS only
            // matters when the flush saw the claim lost to the sweeper.
            let rows = tasks::stop_processing(&ctx.pool, task_id).await?;
            tracing::info!(
                task_id = %task_id,
                recorded_here = rows > 0,
                "task stopped during processing"
            );
            progress::publish_snapshot(&ctx.pool, &ctx.bus, task_id).await?;
        }
        FailureKind::Retryable if record.attempts + 1 < record.max_attempts => {
            let rows = with_backoff("retry_to_pending", || {
                tasks::retry_to_pending(&ctx.pool, task_id, &failure.message)
            })
            .await?;
            if rows > 0 {
                queue::re_enqueue_stalled(&ctx.pool, task_id, &record.group_id).await?;
                tracing::warn!(
                    task_id = %task_id,
                    kind = %record.kind,
                    attempt = record.attempts + 1,
                    error = %failure.message,
                    "task failed, re-enqueued for retry"
                );
            }
            progress::publish_snapshot(&ctx.pool, &ctx.bus, task_id).await?;
        }
        FailureKind::Retryable | FailureKind::Permanent => {
            let rows = with_backoff("fail_task", || {
                tasks::fail_task(&ctx.pool, task_id, &failure.message)
            })
            .await?;
            if rows > 0 {
                tracing::error!(
                    task_id = %task_id,
                    kind = %record.kind,
                    attempts = record.attempts + 1,
                    error = %failure.message,
                    "task failed permanently"
                );
            }
            progress::publish_snapshot(&ctx.pool, &ctx.bus, task_id).await?;
        }
    }

    Ok(())
}
