//! Sanity checks for the schema migrations.

use engram_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename != '_sqlx_migrations' \
         ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "edge_type_maps",
            "edge_types",
            "entity_types",
            "queue_state",
            "tasks",
        ]
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent_per_database() {
    let (pool, db_name) = create_test_db().await;

    // A second run against the same database applies nothing new.
    engram_db::pool::run_migrations(&pool, engram_db::pool::default_migrations_path())
        .await
        .expect("re-running migrations should succeed");

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
