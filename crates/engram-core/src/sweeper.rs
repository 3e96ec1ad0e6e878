//! Recovery sweeper: the sole recovery path for claims lost to crashed or
//! hung workers.
//!
//! Every interval it scans processing rows whose start time has outlived
//! their handler's timeout plus a grace period, re-enqueues them at the
//! head of their group (or fails them when the retry budget is spent), and
//! refreshes the scheduler's ready set from the durable queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use engram_db::models::TaskRecord;
use engram_db::queries::{queue, tasks};

use crate::progress;
use crate::worker::WorkerContext;

pub(crate) async fn run_sweeper(ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    tracing::debug!(
        interval_secs = ctx.config.recovery_interval.as_secs(),
        "recovery sweeper started"
    );
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ctx.config.recovery_interval) => {}
            _ = cancel.cancelled() => break,
        }
        if let Err(e) = sweep_once(&ctx).await {
            tracing::error!(error = %format!("{e:#}"), "recovery sweep failed");
        }
    }
    tracing::debug!("recovery sweeper stopped");
}

/// One sweep pass: recover stalled tasks, purge queue entries whose task
/// is already terminal, and re-notify every group with pending work.
pub(crate) async fn sweep_once(ctx: &WorkerContext) -> Result<()> {
    let now = Utc::now();

    for kind in ctx.registry.kinds() {
        let Some(handler) = ctx.registry.get(&kind) else {
            continue;
        };
        let window = handler.timeout() + ctx.config.stall_grace;
        let cutoff = now
            - chrono::Duration::from_std(window)
                .with_context(|| format!("stall window overflow for kind {kind}"))?;

        for task in tasks::find_stalled(&ctx.pool, &kind, cutoff).await? {
            recover_stalled(ctx, &task).await?;
        }
    }

    let purged = queue::purge_terminal(&ctx.pool).await?;
    if purged > 0 {
        tracing::debug!(purged, "removed queue entries for terminal tasks");
    }

    // Ready-set refresh: covers producers in other processes, and any
    // wakeup lost between a worker's length check and its release.
    for group in queue::groups_with_pending(&ctx.pool).await? {
        ctx.scheduler.notify_group(&group);
    }

    Ok(())
}

async fn recover_stalled(ctx: &WorkerContext, task: &TaskRecord) -> Result<()> {
    if task.attempts + 1 < task.max_attempts {
        let rows = tasks::retry_to_pending(&ctx.pool, task.id, "stalled").await?;
        if rows > 0 {
            queue::re_enqueue_stalled(&ctx.pool, task.id, &task.group_id).await?;
            ctx.scheduler.notify_group(&task.group_id);
            tracing::warn!(
                task_id = %task.id,
                kind = %task.kind,
                group_id = %task.group_id,
                attempt = task.attempts + 1,
                "stalled task re-enqueued"
            );
            progress::publish_snapshot(&ctx.pool, &ctx.bus, task.id).await?;
        }
    } else {
        let rows = tasks::fail_task(&ctx.pool, task.id, "stalled").await?;
        if rows > 0 {
            queue::remove(&ctx.pool, task.id).await?;
            tracing::error!(
                task_id = %task.id,
                kind = %task.kind,
                attempts = task.attempts + 1,
                "stalled task failed permanently"
            );
            progress::publish_snapshot(&ctx.pool, &ctx.bus, task.id).await?;
        }
    }
    Ok(())
}
