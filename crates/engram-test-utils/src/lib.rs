//! Shared test utilities for engram integration tests.
//!
//! Provides a PostgreSQL instance shared across tests. On first use the
//! instance gets one fully migrated **template database**; each test then
//! clones it with `CREATE DATABASE ... TEMPLATE ...`, which is far cheaper
//! than re-running the migrations per test and guarantees every test sees
//! the same schema.
//!
//! Two modes:
//! - **`ENGRAM_TEST_PG_URL`** set (nextest setup script): use the external
//!   server directly. No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via testcontainers,
//!   shared per binary through a `OnceCell`.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use engram_db::pool;

/// Shared server state: base URL, the migrated template database every
/// test clones, and the optional container handle (kept alive).
struct SharedPg {
    base_url: String,
    template: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

/// Lazily-initialized shared PostgreSQL.
static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

/// Single-connection pool for maintenance statements.
async fn connect_one(url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to {url}: {e}"))
}

async fn init_shared_pg() -> SharedPg {
    // If a setup script already started a server, use that directly.
    let (base_url, container) = if let Ok(url) = std::env::var("ENGRAM_TEST_PG_URL") {
        (url, None)
    } else {
        let container = Postgres::default()
            .with_tag("18")
            .start()
            .await
            .expect("failed to start PostgreSQL container");

        let host = container.get_host().await.expect("failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("failed to get mapped port");

        (
            format!("postgresql://postgres:postgres@{host}:{port}"),
            Some(container),
        )
    };

    // Build the template: create it, migrate it, then disconnect so later
    // `CREATE DATABASE ... TEMPLATE` calls are allowed to copy it
    // (Postgres refuses to copy a database with open connections).
    let template = format!("engram_template_{}", Uuid::new_v4().simple());

    let maint = connect_one(&format!("{base_url}/postgres")).await;
    let stmt = format!("CREATE DATABASE {template}");
    maint
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create template database {template}: {e}"));
    maint.close().await;

    let template_pool = connect_one(&format!("{base_url}/{template}")).await;
    pool::run_migrations(&template_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed on the template database");
    template_pool.close().await;

    SharedPg {
        base_url,
        template,
        _container: container,
    }
}

async fn shared() -> &'static SharedPg {
    SHARED_PG.get_or_init(init_shared_pg).await
}

/// Base URL for the shared PostgreSQL.
///
/// Lazily starts a container and builds the template database on first
/// call (unless `ENGRAM_TEST_PG_URL` is set). The URL points at the
/// server root (no database name appended).
pub async fn pg_url() -> &'static str {
    &shared().await.base_url
}

/// Create a test database as a clone of the migrated template.
///
/// Returns `(pool, db_name)`. The clone carries the full engram schema,
/// including the `_sqlx_migrations` bookkeeping, so re-running migrations
/// against it is a no-op. Call [`drop_test_db`] with the returned
/// `db_name` when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let shared = shared().await;
    let db_name = format!("engram_test_{}", Uuid::new_v4().simple());

    let maint = connect_one(&format!("{}/postgres", shared.base_url)).await;
    let stmt = format!(
        "CREATE DATABASE {db_name} TEMPLATE {template}",
        template = shared.template
    );
    maint
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to clone template into {db_name}: {e}"));
    maint.close().await;

    let test_pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{}/{db_name}", shared.base_url))
        .await
        .unwrap_or_else(|e| panic!("failed to connect to test database {db_name}: {e}"));

    (test_pool, db_name)
}

/// Drop a test database.
///
/// Terminates any connections left behind (a failed test may not have
/// closed its pool) and drops the database. Safe to call even if the
/// database was already dropped.
pub async fn drop_test_db(db_name: &str) {
    let shared = shared().await;
    let maint = connect_one(&format!("{}/postgres", shared.base_url)).await;

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint.execute(stmt.as_str()).await;
    maint.close().await;
}
