use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Tables owned by the engram schema, in migration order.
pub const CORE_TABLES: [&str; 5] = [
    "tasks",
    "queue_state",
    "entity_types",
    "edge_types",
    "edge_type_maps",
];

/// Create a connection pool.
///
/// The worker pool, the recovery sweeper, and the API all share one pool,
/// so `max_connections` should track the process's concurrency: roughly
/// `worker_count` plus a few for a serve/worker process, two for thin
/// CLI commands.
pub async fn create_pool(config: &DbConfig, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.redacted()))?;
    Ok(pool)
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so that no running database is required at
/// compile time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Ensure the target database exists, creating it if necessary.
///
/// Connects to the `postgres` maintenance database and issues
/// `CREATE DATABASE <name>` when the target database is absent. Returns
/// whether the database was created by this call.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.maintenance_url())
        .await
        .with_context(|| {
            format!(
                "failed to connect to the maintenance database for {}",
                config.redacted()
            )
        })?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maint_pool)
            .await
            .context("failed to query pg_database")?;

    let created = if exists {
        info!(db = db_name, "database already exists");
        false
    } else {
        // Database names cannot be parameterised in CREATE DATABASE, so we
        // validate the name to avoid SQL injection, then use string formatting.
        if !db_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("database name {:?} contains invalid characters", db_name);
        }
        let stmt = format!("CREATE DATABASE {db_name}");
        maint_pool
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
        true
    };

    maint_pool.close().await;
    Ok(created)
}

/// Row counts for the engram tables, in [`CORE_TABLES`] order.
///
/// Used by `engram db-init` to confirm the schema landed; a table missing
/// from the database surfaces as an error here rather than a silent gap.
pub async fn core_table_counts(pool: &PgPool) -> Result<Vec<(&'static str, i64)>> {
    let mut counts = Vec::with_capacity(CORE_TABLES.len());
    for table in CORE_TABLES {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((table, count.0));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `engram-db`.
///
/// Resolves relative to this crate's source tree via the compile-time
/// `CARGO_MANIFEST_DIR`, so it is valid for binaries run from a checkout
/// (and for the test harness). A deployment that installs the binary away
/// from the sources ships the `migrations/` directory alongside it and
/// passes that path to [`run_migrations`] explicitly.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
