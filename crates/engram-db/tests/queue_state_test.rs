//! Integration tests for the durable queue: FIFO claims, in-flight
//! accounting, head re-enqueue, and cold-start repair.

use sqlx::PgPool;
use uuid::Uuid;

use engram_db::queries::queue::{self, NewTask};
use engram_db::queries::tasks;
use engram_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn enqueue_task(pool: &PgPool, group: &str) -> Uuid {
    let new = NewTask {
        id: Uuid::new_v4(),
        group_id: group.to_string(),
        kind: "echo".to_string(),
        payload: b"{}".to_vec(),
        max_attempts: 3,
    };
    queue::enqueue(pool, &new)
        .await
        .expect("enqueue should succeed");
    new.id
}

// ---------------------------------------------------------------------------
// FIFO claims
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claims_follow_enqueue_order() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    let b = enqueue_task(&pool, "g1").await;
    let c = enqueue_task(&pool, "g1").await;

    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), Some(a));
    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), Some(b));
    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), Some(c));
    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), None);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_is_scoped_to_the_group() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;

    assert_eq!(queue::claim(&pool, "g2", "w0").await.unwrap(), None);
    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), Some(a));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claimed_entry_is_not_pending_anywhere() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    let b = enqueue_task(&pool, "g1").await;

    let first = queue::claim(&pool, "g1", "w0").await.unwrap();
    assert_eq!(first, Some(a));

    // The in-flight id must never be handed out again.
    let second = queue::claim(&pool, "g1", "w1").await.unwrap();
    assert_eq!(second, Some(b));
    assert_eq!(queue::claim(&pool, "g1", "w2").await.unwrap(), None);

    assert_eq!(queue::pending_len(&pool, "g1").await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Ack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_tags_the_entry_with_the_worker() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    let before = queue::get_entry(&pool, a).await.unwrap().unwrap();
    assert!(before.worker_id.is_none());
    assert!(before.claimed_at.is_none());

    queue::claim(&pool, "g1", "w0").await.unwrap();

    let after = queue::get_entry(&pool, a).await.unwrap().unwrap();
    assert_eq!(after.worker_id.as_deref(), Some("w0"));
    assert!(after.claimed_at.is_some());
    assert_eq!(after.group_id, "g1");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ack_requires_matching_worker() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    queue::claim(&pool, "g1", "w0").await.unwrap();

    assert_eq!(queue::ack(&pool, a, "someone-else").await.unwrap(), 0);
    assert_eq!(queue::ack(&pool, a, "w0").await.unwrap(), 1);
    // Ack of an absent entry is a no-op.
    assert_eq!(queue::ack(&pool, a, "w0").await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Re-enqueue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn re_enqueue_goes_to_the_head() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    let b = enqueue_task(&pool, "g1").await;

    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), Some(a));
    assert_eq!(queue::re_enqueue_stalled(&pool, a, "g1").await.unwrap(), 1);

    // The retried task stays ahead of its later-enqueued sibling.
    assert_eq!(queue::claim(&pool, "g1", "w1").await.unwrap(), Some(a));
    assert_eq!(queue::claim(&pool, "g1", "w1").await.unwrap(), Some(b));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn re_enqueue_restores_a_lost_entry() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    queue::claim(&pool, "g1", "w0").await.unwrap();
    queue::ack(&pool, a, "w0").await.unwrap();

    // The entry is gone but the task was never finished; re-enqueue must
    // bring it back.
    assert_eq!(queue::re_enqueue_stalled(&pool, a, "g1").await.unwrap(), 1);
    assert_eq!(queue::claim(&pool, "g1", "w1").await.unwrap(), Some(a));

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Depths and repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn depths_and_group_listing() {
    let (pool, db_name) = create_test_db().await;

    enqueue_task(&pool, "g1").await;
    enqueue_task(&pool, "g1").await;
    let b = enqueue_task(&pool, "g2").await;

    assert_eq!(queue::pending_len(&pool, "g1").await.unwrap(), 2);
    assert_eq!(queue::pending_len(&pool, "g2").await.unwrap(), 1);

    let mut groups = queue::groups_with_pending(&pool).await.unwrap();
    groups.sort();
    assert_eq!(groups, vec!["g1", "g2"]);

    let depths = queue::pending_depths(&pool).await.unwrap();
    assert_eq!(depths[0], ("g1".to_string(), 2));
    assert_eq!(depths[1], ("g2".to_string(), 1));

    // An in-flight entry no longer counts as pending.
    queue::claim(&pool, "g2", "w0").await.unwrap();
    assert_eq!(queue::pending_len(&pool, "g2").await.unwrap(), 0);
    let groups = queue::groups_with_pending(&pool).await.unwrap();
    assert_eq!(groups, vec!["g1"]);
    let _ = b;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recover_rebuilds_missing_entries() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    let b = enqueue_task(&pool, "g1").await;

    // Simulate a lost ordering substrate.
    sqlx::query("DELETE FROM queue_state")
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(queue::pending_len(&pool, "g1").await.unwrap(), 0);

    let repaired = queue::recover(&pool).await.unwrap();
    assert_eq!(repaired, 2);

    // Creation order is preserved.
    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), Some(a));
    assert_eq!(queue::claim(&pool, "g1", "w0").await.unwrap(), Some(b));

    // Idempotent: nothing more to repair.
    assert_eq!(queue::recover(&pool).await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn purge_terminal_drops_finished_entries() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, "g1").await;
    queue::claim(&pool, "g1", "w0").await.unwrap();
    tasks::begin_processing(&pool, a, "w0").await.unwrap();
    tasks::complete_task(&pool, a, None, None, None).await.unwrap();

    // The worker died before acking; the sweeper's purge cleans up.
    assert_eq!(queue::purge_terminal(&pool).await.unwrap(), 1);
    assert_eq!(queue::purge_terminal(&pool).await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Duplicate detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_task_id_is_a_unique_violation() {
    let (pool, db_name) = create_test_db().await;

    let new = NewTask {
        id: Uuid::new_v4(),
        group_id: "g1".to_string(),
        kind: "echo".to_string(),
        payload: b"{}".to_vec(),
        max_attempts: 3,
    };
    queue::enqueue(&pool, &new).await.unwrap();

    let err = queue::enqueue(&pool, &new)
        .await
        .expect_err("second enqueue with the same id should fail");
    assert!(
        engram_db::is_unique_violation(&err),
        "expected unique violation, got: {err:#}"
    );

    // The failed enqueue must not leave a queue entry behind.
    assert_eq!(queue::pending_len(&pool, "g1").await.unwrap(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}
