//! Per-task progress fan-out: a broadcast bus for live subscribers plus a
//! throttled reporter handed to handlers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use engram_db::models::{TaskRecord, TaskStatus};
use engram_db::queries::tasks;

/// Capacity of each per-task broadcast channel. Slow subscribers that fall
/// further behind than this see a lag gap and resynchronize on the next
/// event.
const CHANNEL_CAPACITY: usize = 64;

/// A progress observation for one task.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub progress: i32,
    pub message: Option<String>,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Synthesize an event from the task row's current state.
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            progress: record.progress,
            message: record.message.clone(),
            status: record.status,
            timestamp: Utc::now(),
        }
    }
}

/// One-writer, many-reader event channels keyed by task id.
///
/// Channels are created on demand by either side. Publishing the terminal
/// event drops the sender, which closes every subscriber's stream; late
/// subscribers get their baseline from the task row instead.
#[derive(Default)]
pub struct ProgressBus {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, task_id: Uuid) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.lock().expect("progress bus lock poisoned");
        channels
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a task's events. Safe to call at any point in the
    /// task's life; events published before the subscription are not
    /// replayed.
    pub fn subscribe(&self, task_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        self.sender(task_id).subscribe()
    }

    /// Publish a non-terminal event. Dropped silently when nobody listens.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender(event.task_id).send(event);
    }

    /// Publish a terminal event and close the channel.
    pub fn publish_terminal(&self, event: ProgressEvent) {
        let task_id = event.task_id;
        let _ = self.sender(task_id).send(event);
        let mut channels = self.channels.lock().expect("progress bus lock poisoned");
        channels.remove(&task_id);
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock().expect("progress bus lock poisoned");
        f.debug_struct("ProgressBus")
            .field("open_channels", &channels.len())
            .finish()
    }
}

/// Publish the task row's current state onto the bus: terminal rows close
/// the channel, non-terminal rows emit a plain event.
pub(crate) async fn publish_snapshot(
    pool: &PgPool,
    bus: &ProgressBus,
    task_id: Uuid,
) -> anyhow::Result<()> {
    if let Some(record) = tasks::get_task(pool, task_id).await? {
        let event = ProgressEvent::from_record(&record);
        if record.status.is_terminal() {
            bus.publish_terminal(event);
        } else {
            bus.publish(event);
        }
    }
    Ok(())
}

/// Returned by [`ProgressReporter::report`] when a flush finds the task no
/// longer processing under this claim -- stopped by a client, or recovered
/// by the sweeper. The handler must abandon the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStopped;

impl std::fmt::Display for TaskStopped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("task stopped")
    }
}

impl std::error::Error for TaskStopped {}

struct ReporterState {
    last_flush: Option<Instant>,
    last_percent: i32,
}

/// Handed to a handler so it can publish percent-complete without touching
/// the store directly.
///
/// Every report lands on the progress bus; writes to the task row are
/// throttled to at most one per `min_flush_interval`, except the final
/// 100% which always flushes. Percent is clamped monotonic within the
/// attempt. Store failures are logged and swallowed -- progress is
/// best-effort -- but a flush that observes the task no longer processing
/// returns [`TaskStopped`] so the handler can abort cooperatively.
pub struct ProgressReporter {
    pool: PgPool,
    bus: std::sync::Arc<ProgressBus>,
    task_id: Uuid,
    min_flush_interval: Duration,
    state: tokio::sync::Mutex<ReporterState>,
}

impl ProgressReporter {
    pub(crate) fn new(
        pool: PgPool,
        bus: std::sync::Arc<ProgressBus>,
        task_id: Uuid,
        min_flush_interval: Duration,
    ) -> Self {
        Self {
            pool,
            bus,
            task_id,
            min_flush_interval,
            state: tokio::sync::Mutex::new(ReporterState {
                last_flush: None,
                last_percent: 0,
            }),
        }
    }

    /// Report a checkpoint. Percent below the previous report is raised to
    /// it; percent above 100 is capped.
    pub async fn report(&self, percent: i32, message: &str) -> Result<(), TaskStopped> {
        let (percent, flush_due) = {
            let mut state = self.state.lock().await;
            let percent = percent.clamp(0, 100).max(state.last_percent);
            state.last_percent = percent;
            let due = percent >= 100
                || state
                    .last_flush
                    .is_none_or(|t| t.elapsed() >= self.min_flush_interval);
            if due {
                state.last_flush = Some(Instant::now());
            }
            (percent, due)
        };

        self.bus.publish(ProgressEvent {
            task_id: self.task_id,
            progress: percent,
            message: Some(message.to_owned()),
            status: TaskStatus::Processing,
            timestamp: Utc::now(),
        });

        if !flush_due {
            return Ok(());
        }

        match tasks::update_progress(&self.pool, self.task_id, percent, Some(message)).await {
            Ok(rows) if rows > 0 => Ok(()),
            Ok(_) => {
                tracing::debug!(
                    task_id = %self.task_id,
                    "progress flush found task no longer processing"
                );
                Err(TaskStopped)
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    error = %e,
                    "progress flush failed (best-effort)"
                );
                Ok(())
            }
        }
    }
}
