//! Progress stream contract: baseline event, monotonic percent within an
//! attempt, exactly one terminal event, and synthetic termination for
//! already-finished tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::PgPool;
use uuid::Uuid;

use engram_core::handler::{
    Handler, HandlerContext, HandlerRegistry, HandlerResult, HandlerSuccess,
};
use engram_core::progress::{ProgressEvent, ProgressReporter};
use engram_core::schema_sync::ProjectSchemaCache;
use engram_core::{EnqueueOptions, QueueConfig, TaskQueue, TaskQueueError};
use engram_db::models::{TaskRecord, TaskStatus};
use engram_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn test_queue(pool: &PgPool, registry: HandlerRegistry, workers: usize) -> Arc<TaskQueue> {
    let schema_cache = Arc::new(ProjectSchemaCache::new(pool.clone()));
    let config = QueueConfig {
        worker_count: workers,
        progress_flush_min_interval: Duration::ZERO,
        ..QueueConfig::default()
    };
    Arc::new(TaskQueue::new(pool.clone(), registry, schema_cache, config))
}

async fn wait_for_status(
    queue: &TaskQueue,
    id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = queue.get(id).await.expect("task should exist");
        if record.status == status {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task {id} to become {status}, last seen {}",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn collect_events(
    queue: &TaskQueue,
    id: Uuid,
    timeout: Duration,
) -> Vec<ProgressEvent> {
    let stream = queue.stream_progress(id).await.expect("stream should open");
    futures::pin_mut!(stream);
    tokio::time::timeout(timeout, async {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("stream should terminate within the timeout")
}

/// Walks through fixed checkpoints with small pauses.
struct StagedHandler;

#[async_trait]
impl Handler for StagedHandler {
    fn kind(&self) -> &str {
        "staged"
    }

    async fn process(
        &self,
        _ctx: &HandlerContext,
        _payload: &[u8],
        progress: &ProgressReporter,
    ) -> HandlerResult {
        for (percent, message) in [(10, "validated"), (30, "extracted"), (60, "persisted")] {
            progress.report(percent, message).await?;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok(HandlerSuccess::default())
    }
}

// ---------------------------------------------------------------------------
// Live subscription
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_yields_baseline_checkpoints_and_terminal() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register(StagedHandler);
    let queue = test_queue(&pool, registry, 1);

    // Enqueue first, subscribe while pending, then start workers so no
    // checkpoint can be missed.
    let id = queue
        .enqueue("staged", "g1", b"{}".to_vec(), EnqueueOptions::default())
        .await
        .unwrap();
    let stream_task = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { collect_events(&queue, id, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.start().await.unwrap();

    let events = stream_task.await.unwrap();
    assert!(
        events.len() >= 2,
        "at least a baseline and a terminal event, got {}",
        events.len()
    );

    let first = &events[0];
    assert_eq!(first.status, TaskStatus::Pending);
    assert_eq!(first.progress, 0);

    let last = events.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(last.progress, 100);

    // P10: progress is non-decreasing within the attempt.
    let mut floor = -1;
    for event in &events {
        assert!(
            event.progress >= floor,
            "progress went backwards: {} after {floor}",
            event.progress
        );
        floor = event.progress;
    }
    assert!(events.iter().all(|e| e.task_id == id));

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn checkpoint_messages_flow_through() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register(StagedHandler);
    let queue = test_queue(&pool, registry, 1);

    let id = queue
        .enqueue("staged", "g1", b"{}".to_vec(), EnqueueOptions::default())
        .await
        .unwrap();
    let stream_task = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { collect_events(&queue, id, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.start().await.unwrap();

    let events = stream_task.await.unwrap();
    let messages: Vec<&str> = events
        .iter()
        .filter_map(|e| e.message.as_deref())
        .collect();
    assert!(messages.contains(&"validated"), "got {messages:?}");
    assert!(messages.contains(&"persisted"), "got {messages:?}");

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Late subscription
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_task_yields_one_synthetic_event() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register(StagedHandler);
    let queue = test_queue(&pool, registry, 1);
    queue.start().await.unwrap();

    let id = queue
        .enqueue("staged", "g1", b"{}".to_vec(), EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&queue, id, TaskStatus::Completed, Duration::from_secs(5)).await;

    let events = collect_events(&queue, id, Duration::from_secs(2)).await;
    assert_eq!(events.len(), 1, "exactly one synthetic terminal event");
    assert_eq!(events[0].status, TaskStatus::Completed);
    assert_eq!(events[0].progress, 100);

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stream_for_unknown_task_is_not_found() {
    let (pool, db_name) = create_test_db().await;

    let queue = test_queue(&pool, HandlerRegistry::new(), 0);
    let err = queue
        .stream_progress(Uuid::new_v4())
        .await
        .err()
        .expect("unknown task should not stream");
    assert!(matches!(err, TaskQueueError::NotFound(_)));

    pool.close().await;
    drop_test_db(&db_name).await;
}
