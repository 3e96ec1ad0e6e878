//! End-to-end worker pool scenarios: happy path, per-group FIFO, fair
//! interleaving, retry exhaustion, timeouts, and the concurrency bound.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use engram_core::handler::{
    Handler, HandlerContext, HandlerFailure, HandlerRegistry, HandlerResult, HandlerSuccess,
};
use engram_core::progress::ProgressReporter;
use engram_core::schema_sync::ProjectSchemaCache;
use engram_core::{EnqueueOptions, QueueConfig, TaskQueue};
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

/// Completes immediately with a fixed result.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn process(
        &self,
        _ctx: &HandlerContext,
        _payload: &[u8],
        _progress: &ProgressReporter,
    ) -> HandlerResult {
        Ok(HandlerSuccess {
            result: Some(b"ok".to_vec()),
            ..HandlerSuccess::default()
        })
    }
}

/// Sleeps, logging its group at start.
struct SleepHandler {
    delay: Duration,
    starts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Handler for SleepHandler {
    fn kind(&self) -> &str {
        "sleep"
    }

    async fn process(
        &self,
        ctx: &HandlerContext,
        _payload: &[u8],
        _progress: &ProgressReporter,
    ) -> HandlerResult {
        self.starts
            .lock()
            .expect("starts lock poisoned")
            .push(ctx.group_id.clone());
        tokio::time::sleep(self.delay).await;
        Ok(HandlerSuccess::default())
    }
}

/// Always fails with a retryable error, counting invocations.
struct BoomHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for BoomHandler {
    fn kind(&self) -> &str {
        "boom"
    }

    async fn process(
        &self,
        _ctx: &HandlerContext,
        _payload: &[u8],
        _progress: &ProgressReporter,
    ) -> HandlerResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(HandlerFailure::retryable("boom"))
    }
}

// ---------------------------------------------------------------------------
// S1: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_completes_quickly() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);
    let queue = test_queue(&pool, registry, 1);
    queue.start().await.unwrap();

    let id = queue
        .enqueue("echo", "g1", b"\"hi\"".to_vec(), EnqueueOptions::default())
        .await
        .unwrap();

    let record = wait_for_status(&queue, id, TaskStatus::Completed, Duration::from_secs(2)).await;
    assert_eq!(record.result.as_deref(), Some(b"ok".as_slice()));
    assert_eq!(record.attempts, 0);
    assert_eq!(record.progress, 100);
    assert!(record.completed_at.is_some());
    assert!(record.worker_id.is_none());

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// S2: per-group FIFO even with spare workers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn group_completions_follow_enqueue_order() {
    let (pool, db_name) = create_test_db().await;

    let starts = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.register(SleepHandler {
        delay: Duration::from_millis(100),
        starts: Arc::clone(&starts),
    });
    let queue = test_queue(&pool, registry, 4);
    queue.start().await.unwrap();

    let mut ids = Vec::new();
    for payload in [b"\"A\"".to_vec(), b"\"B\"".to_vec(), b"\"C\"".to_vec()] {
        ids.push(
            queue
                .enqueue("sleep", "g1", payload, EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let mut completions = Vec::new();
    for id in &ids {
        let record =
            wait_for_status(&queue, *id, TaskStatus::Completed, Duration::from_secs(5)).await;
        completions.push(record.completed_at.expect("completed_at should be set"));
    }

    assert!(
        completions[0] < completions[1] && completions[1] < completions[2],
        "completions must follow enqueue order, got {completions:?}"
    );

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// S3: fair interleaving across groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn groups_share_workers_fairly() {
    let (pool, db_name) = create_test_db().await;

    let starts = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.register(SleepHandler {
        delay: Duration::from_millis(50),
        starts: Arc::clone(&starts),
    });
    let queue = test_queue(&pool, registry, 2);
    queue.start().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(
            queue
                .enqueue("sleep", "g1", b"{}".to_vec(), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }
    for _ in 0..10 {
        ids.push(
            queue
                .enqueue("sleep", "g2", b"{}".to_vec(), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    for id in &ids {
        wait_for_status(&queue, *id, TaskStatus::Completed, Duration::from_secs(15)).await;
    }

    let starts = starts.lock().expect("starts lock poisoned");
    let first_four: HashSet<&str> = starts.iter().take(4).map(String::as_str).collect();
    assert!(
        first_four.contains("g1") && first_four.contains("g2"),
        "both groups must appear in the first four starts, got {:?}",
        &starts[..4.min(starts.len())]
    );

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// S5: retry exhaustion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_exhaust_into_failed() {
    let (pool, db_name) = create_test_db().await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(BoomHandler {
        invocations: Arc::clone(&invocations),
    });
    let queue = test_queue(&pool, registry, 1);
    queue.start().await.unwrap();

    let id = queue
        .enqueue(
            "boom",
            "g1",
            b"{}".to_vec(),
            EnqueueOptions {
                max_attempts: Some(2),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    let record = wait_for_status(&queue, id, TaskStatus::Failed, Duration::from_secs(5)).await;
    assert_eq!(record.attempts, 2);
    assert_eq!(record.error.as_deref(), Some("boom"));
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        2,
        "the task must be claimed exactly twice"
    );

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Never finishes within the test window; short timeout.
struct HangHandler;

#[async_trait]
impl Handler for HangHandler {
    fn kind(&self) -> &str {
        "hang"
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(200)
    }

    async fn process(
        &self,
        _ctx: &HandlerContext,
        _payload: &[u8],
        _progress: &ProgressReporter,
    ) -> HandlerResult {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(HandlerSuccess::default())
    }
}

#[tokio::test]
async fn handler_deadline_fails_the_attempt() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register(HangHandler);
    let queue = test_queue(&pool, registry, 1);
    queue.start().await.unwrap();

    let id = queue
        .enqueue(
            "hang",
            "g1",
            b"{}".to_vec(),
            EnqueueOptions {
                max_attempts: Some(1),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    let record = wait_for_status(&queue, id, TaskStatus::Failed, Duration::from_secs(5)).await;
    assert_eq!(record.error.as_deref(), Some("timeout"));
    assert_eq!(record.attempts, 1);

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Permanent failures skip the retry budget
// ---------------------------------------------------------------------------

/// Fails with a permanent classification on every invocation.
struct RejectHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for RejectHandler {
    fn kind(&self) -> &str {
        "reject"
    }

    async fn process(
        &self,
        _ctx: &HandlerContext,
        _payload: &[u8],
        _progress: &ProgressReporter,
    ) -> HandlerResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(HandlerFailure::permanent("schema mismatch"))
    }
}

#[tokio::test]
async fn permanent_failure_fails_on_first_attempt() {
    let (pool, db_name) = create_test_db().await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(RejectHandler {
        invocations: Arc::clone(&invocations),
    });
    let queue = test_queue(&pool, registry, 1);
    queue.start().await.unwrap();

    let id = queue
        .enqueue("reject", "g1", b"{}".to_vec(), EnqueueOptions::default())
        .await
        .unwrap();

    let record = wait_for_status(&queue, id, TaskStatus::Failed, Duration::from_secs(5)).await;
    assert_eq!(record.attempts, 1, "no retries for a permanent failure");
    assert_eq!(record.error.as_deref(), Some("schema mismatch"));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Unknown kind at dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_kind_at_dispatch_fails_the_task() {
    let (pool, db_name) = create_test_db().await;

    // Enqueue behind the service's back: a producer process may know
    // kinds this worker does not.
    let new = engram_db::queries::queue::NewTask {
        id: Uuid::new_v4(),
        group_id: "g1".to_string(),
        kind: "mystery".to_string(),
        payload: b"{}".to_vec(),
        max_attempts: 3,
    };
    engram_db::queries::queue::enqueue(&pool, &new).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);
    let queue = test_queue(&pool, registry, 1);
    // start() seeds the scheduler from the durable queue.
    queue.start().await.unwrap();

    let record =
        wait_for_status(&queue, new.id, TaskStatus::Failed, Duration::from_secs(5)).await;
    assert_eq!(
        record.error.as_deref(),
        Some("unknown task kind: mystery")
    );

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// A retried task stays ahead of later siblings
// ---------------------------------------------------------------------------

/// Fails the first invocation per task id, then succeeds.
struct FlakyHandler {
    seen: Arc<Mutex<HashSet<Uuid>>>,
}

#[async_trait]
impl Handler for FlakyHandler {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn process(
        &self,
        ctx: &HandlerContext,
        _payload: &[u8],
        _progress: &ProgressReporter,
    ) -> HandlerResult {
        let first_run = self
            .seen
            .lock()
            .expect("seen lock poisoned")
            .insert(ctx.task_id);
        if first_run {
            return Err(HandlerFailure::retryable("flaked"));
        }
        Ok(HandlerSuccess::default())
    }
}

#[tokio::test]
async fn retried_task_completes_before_later_siblings() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register(FlakyHandler {
        seen: Arc::new(Mutex::new(HashSet::new())),
    });
    registry.register(SleepHandler {
        delay: Duration::from_millis(50),
        starts: Arc::new(Mutex::new(Vec::new())),
    });
    let queue = test_queue(&pool, registry, 1);
    queue.start().await.unwrap();

    let flaky = queue
        .enqueue("flaky", "g1", b"{}".to_vec(), EnqueueOptions::default())
        .await
        .unwrap();
    let sibling = queue
        .enqueue("sleep", "g1", b"{}".to_vec(), EnqueueOptions::default())
        .await
        .unwrap();

    let flaky_record =
        wait_for_status(&queue, flaky, TaskStatus::Completed, Duration::from_secs(5)).await;
    let sibling_record =
        wait_for_status(&queue, sibling, TaskStatus::Completed, Duration::from_secs(5)).await;

    assert_eq!(flaky_record.attempts, 1);
    assert!(
        flaky_record.completed_at.unwrap() < sibling_record.completed_at.unwrap(),
        "the retried task must finish ahead of the sibling enqueued after it"
    );

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// P4: processing tasks never exceed the worker count
// ---------------------------------------------------------------------------

/// Tracks its own concurrent executions.
struct ProbeHandler {
    current: Arc<AtomicI64>,
    peak: Arc<AtomicI64>,
}

#[async_trait]
impl Handler for ProbeHandler {
    fn kind(&self) -> &str {
        "probe"
    }

    async fn process(
        &self,
        _ctx: &HandlerContext,
        _payload: &[u8],
        _progress: &ProgressReporter,
    ) -> HandlerResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(HandlerSuccess::default())
    }
}

#[tokio::test]
async fn concurrency_is_bounded_by_worker_count() {
    let (pool, db_name) = create_test_db().await;

    let current = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(ProbeHandler {
        current: Arc::clone(&current),
        peak: Arc::clone(&peak),
    });
    let queue = test_queue(&pool, registry, 2);
    queue.start().await.unwrap();

    // Six distinct groups, so group serialization is not the limiter.
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            queue
                .enqueue(
                    "probe",
                    &format!("g{i}"),
                    b"{}".to_vec(),
                    EnqueueOptions::default(),
                )
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        wait_for_status(&queue, *id, TaskStatus::Completed, Duration::from_secs(10)).await;
    }

    let observed_peak = peak.load(Ordering::SeqCst);
    assert!(
        observed_peak <= 2,
        "at most worker_count handlers may run at once, saw {observed_peak}"
    );
    assert!(observed_peak >= 1);

    queue.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}
