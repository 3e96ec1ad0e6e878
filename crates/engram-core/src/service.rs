//! The `TaskQueue` composition root: the one handle the rest of the
//! process uses to enqueue, inspect, stop, retry, and observe tasks, and
//! to run the worker pool.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_stream::stream;
use futures::Stream;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use engram_db::models::{TaskRecord, TaskStatus};
use engram_db::queries::tasks::{self, TaskFilter};
use engram_db::queries::queue::{self, NewTask};

use crate::config::QueueConfig;
use crate::error::TaskQueueError;
use crate::handler::HandlerRegistry;
use crate::progress::{self, ProgressBus, ProgressEvent};
use crate::scheduler::GroupScheduler;
use crate::schema_sync::{ProjectSchemaCache, SchemaSyncSink};
use crate::sweeper;
use crate::worker::{self, WorkerContext};

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Override the handler's retry budget for this task.
    pub max_attempts: Option<i32>,
    /// Supply the task id instead of generating one. A second enqueue with
    /// the same id is rejected with [`TaskQueueError::DuplicateTask`],
    /// which makes enqueue idempotent for callers that retry requests.
    pub task_id: Option<Uuid>,
}

/// The task queue subsystem.
///
/// Construct once in the composition root and share by reference (or in an
/// `Arc` for the HTTP layer). [`start`](Self::start) spawns the worker
/// pool and the recovery sweeper; producer-only processes skip that by
/// configuring `worker_count = 0`.
pub struct TaskQueue {
    pool: PgPool,
    registry: Arc<HandlerRegistry>,
    scheduler: Arc<GroupScheduler>,
    bus: Arc<ProgressBus>,
    schema_sync: Arc<SchemaSyncSink>,
    config: QueueConfig,
    cancel: CancellationToken,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Build the subsystem. `schema_cache` is shared with the episode
    /// handler so sink writes invalidate the copy handlers read.
    pub fn new(
        pool: PgPool,
        registry: HandlerRegistry,
        schema_cache: Arc<ProjectSchemaCache>,
        config: QueueConfig,
    ) -> Self {
        let schema_sync = Arc::new(SchemaSyncSink::new(pool.clone(), schema_cache));
        Self {
            pool,
            registry: Arc::new(registry),
            scheduler: Arc::new(GroupScheduler::new()),
            bus: Arc::new(ProgressBus::new()),
            schema_sync,
            config,
            cancel: CancellationToken::new(),
            join_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Repair the durable queue from the task rows, seed the scheduler
    /// with every group that has pending work, and spawn the workers and
    /// the sweeper (unless `worker_count` is 0).
    pub async fn start(&self) -> Result<(), TaskQueueError> {
        let repaired = queue::recover(&self.pool)
            .await
            .context("queue recovery failed")?;
        if repaired > 0 {
            tracing::info!(repaired, "rebuilt queue entries from pending tasks");
        }
        for group in queue::groups_with_pending(&self.pool)
            .await
            .context("failed to seed ready groups")?
        {
            self.scheduler.notify_group(&group);
        }

        if self.config.worker_count == 0 {
            tracing::info!("producer-only mode, workers not started");
            return Ok(());
        }

        let ctx = Arc::new(WorkerContext {
            pool: self.pool.clone(),
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            bus: Arc::clone(&self.bus),
            schema_sync: Arc::clone(&self.schema_sync),
            config: self.config.clone(),
        });

        let mut handles = self
            .join_handles
            .lock()
            .expect("task queue handle lock poisoned");
        for i in 0..self.config.worker_count {
            let worker_id = format!("worker-{i}");
            handles.push(tokio::spawn(worker::run_worker(
                Arc::clone(&ctx),
                worker_id,
                self.cancel.child_token(),
            )));
        }
        handles.push(tokio::spawn(sweeper::run_sweeper(
            ctx,
            self.cancel.child_token(),
        )));

        tracing::info!(workers = self.config.worker_count, "task queue started");
        Ok(())
    }

    /// Cancel the workers and the sweeper and wait for them to exit.
    /// In-flight handlers are not interrupted mid-write; their claims are
    /// recovered as stalls on the next start.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = {
            let mut guard = self
                .join_handles
                .lock()
                .expect("task queue handle lock poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("task queue stopped");
    }

    /// Enqueue a task. Fast: one validation read plus one transaction.
    pub async fn enqueue(
        &self,
        kind: &str,
        group_id: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<Uuid, TaskQueueError> {
        let Some(handler) = self.registry.get(kind) else {
            return Err(TaskQueueError::UnknownKind(kind.to_owned()));
        };

        if let Some(limit) = self.config.per_group_pending_limit {
            let depth = queue::pending_len(&self.pool, group_id)
                .await
                .map_err(TaskQueueError::Store)?;
            if depth >= limit {
                return Err(TaskQueueError::QueueFull {
                    group_id: group_id.to_owned(),
                    limit,
                });
            }
        }

        let id = opts.task_id.unwrap_or_else(Uuid::new_v4);
        let new = NewTask {
            id,
            group_id: group_id.to_owned(),
            kind: kind.to_owned(),
            payload,
            max_attempts: opts.max_attempts.unwrap_or_else(|| handler.max_attempts()),
        };

        match queue::enqueue(&self.pool, &new).await {
            Ok(_) => {}
            Err(e) if engram_db::is_unique_violation(&e) => {
                return Err(TaskQueueError::DuplicateTask(id));
            }
            Err(e) => return Err(TaskQueueError::Store(e)),
        }

        self.scheduler.notify_group(group_id);
        tracing::debug!(task_id = %id, kind = %kind, group_id = %group_id, "task enqueued");
        Ok(id)
    }

    /// Fetch a task record.
    pub async fn get(&self, id: Uuid) -> Result<TaskRecord, TaskQueueError> {
        tasks::get_task(&self.pool, id)
            .await
            .map_err(TaskQueueError::Store)?
            .ok_or(TaskQueueError::NotFound(id))
    }

    /// List task records matching the filter, newest first.
    pub async fn list(
        &self,
        filter: &TaskFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, TaskQueueError> {
        tasks::list_tasks(&self.pool, filter, limit, offset)
            .await
            .map_err(TaskQueueError::Store)
    }

    /// Request a stop. Pending tasks go straight to stopped and are never
    /// dispatched; processing tasks are moved to stopped here and the
    /// worker abandons the run at its next progress flush. Returns whether
    /// the request took effect (false when the task was already terminal).
    pub async fn stop(&self, id: Uuid) -> Result<bool, TaskQueueError> {
        let record = self.get(id).await?;
        if record.status.is_terminal() {
            return Ok(false);
        }

        if tasks::stop_pending(&self.pool, id)
            .await
            .map_err(TaskQueueError::Store)?
            > 0
        {
            // If a worker claimed the entry in this window, its own claim
            // CAS loses against the stopped row and it skips dispatch.
            queue::remove_pending(&self.pool, id)
                .await
                .map_err(TaskQueueError::Store)?;
            tracing::info!(task_id = %id, "pending task stopped");
            progress::publish_snapshot(&self.pool, &self.bus, id)
                .await
                .map_err(TaskQueueError::Store)?;
            return Ok(true);
        }

        if tasks::stop_processing(&self.pool, id)
            .await
            .map_err(TaskQueueError::Store)?
            > 0
        {
            // The claiming worker's ack cleans up the queue entry.
            tracing::info!(task_id = %id, "processing task stopped");
            progress::publish_snapshot(&self.pool, &self.bus, id)
                .await
                .map_err(TaskQueueError::Store)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Clone a failed task as a fresh pending one with the same kind,
    /// group, payload, and retry budget. Rejects non-failed tasks.
    pub async fn retry(&self, id: Uuid) -> Result<Uuid, TaskQueueError> {
        let record = self.get(id).await?;
        if record.status != TaskStatus::Failed {
            return Err(TaskQueueError::NotRetryable {
                id,
                status: record.status,
            });
        }

        let clone_id = Uuid::new_v4();
        let new = NewTask {
            id: clone_id,
            group_id: record.group_id.clone(),
            kind: record.kind.clone(),
            payload: record.payload.clone(),
            max_attempts: record.max_attempts,
        };
        queue::enqueue(&self.pool, &new)
            .await
            .map_err(TaskQueueError::Store)?;

        self.scheduler.notify_group(&record.group_id);
        tracing::info!(task_id = %id, clone_id = %clone_id, "failed task cloned for retry");
        Ok(clone_id)
    }

    /// Stream a task's progress: a baseline event synthesized from the
    /// current row, then live bus events, ending after a terminal event.
    /// Subscribing to an already-terminal task yields exactly the baseline.
    ///
    /// Within an attempt the yielded `progress` is non-decreasing; a
    /// pending event marks a retry and resets the floor.
    pub async fn stream_progress(
        &self,
        id: Uuid,
    ) -> Result<impl Stream<Item = ProgressEvent> + Send + 'static + use<>, TaskQueueError> {
        // Subscribe before the snapshot so nothing published in between is
        // missed.
        let rx = self.bus.subscribe(id);
        let record = self.get(id).await?;

        let stream = stream! {
            let baseline = ProgressEvent::from_record(&record);
            let terminal = record.status.is_terminal();
            let mut floor = baseline.progress;
            yield baseline;
            if terminal {
                return;
            }

            let mut events = BroadcastStream::new(rx);
            while let Some(item) = events.next().await {
                // A lagged receiver drops the gap and resyncs on the next
                // event.
                let Ok(event) = item else { continue };

                let is_terminal = event.status.is_terminal();
                if event.status == TaskStatus::Pending {
                    floor = 0;
                } else if event.progress < floor && !is_terminal {
                    continue;
                }
                if event.progress > floor {
                    floor = event.progress;
                }
                yield event;
                if is_terminal {
                    break;
                }
            }
        };

        Ok(stream)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
