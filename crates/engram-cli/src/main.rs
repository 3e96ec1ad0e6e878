mod config;
mod serve_cmd;
mod task_cmds;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::PgPool;

use engram_core::graph::{GraphClient, StubGraphClient};
use engram_core::handler::{EpisodeHandler, HandlerRegistry, RebuildCommunityHandler};
use engram_core::schema_sync::ProjectSchemaCache;
use engram_core::{QueueConfig, TaskQueue};
use engram_db::pool;

use config::EngramConfig;

#[derive(Parser)]
#[command(name = "engram", about = "Episode processing queue for the engram memory platform")]
struct Cli {
    /// Database URL (overrides ENGRAM_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an engram config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/engram")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the engram database (create + migrate)
    DbInit,
    /// Run the HTTP API together with the worker pool
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8089)]
        port: u16,
        /// Worker count (0 = API only, consumers run elsewhere)
        #[arg(long, default_value_t = 20)]
        workers: usize,
    },
    /// Run a consumer-only worker process (no HTTP API)
    Worker {
        /// Worker count
        #[arg(long, default_value_t = 20)]
        workers: usize,
    },
    /// Enqueue a task
    Enqueue {
        /// Task kind (e.g. episode, rebuild_community)
        kind: String,
        /// Ordering group (typically a project id)
        #[arg(long)]
        group: String,
        /// JSON payload for the handler
        #[arg(long)]
        payload: String,
        /// Override the handler's retry budget
        #[arg(long)]
        max_attempts: Option<i32>,
        /// Supply the task id for idempotent enqueue
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Show one task, or list recent tasks
    Status {
        /// Task ID (omit to list)
        task_id: Option<String>,
        /// Filter by group
        #[arg(long)]
        group: Option<String>,
        /// Filter by kind
        #[arg(long)]
        kind: Option<String>,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum rows to list
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Request a stop for a pending or processing task
    Stop {
        /// Task ID
        task_id: String,
    },
    /// Clone a failed task as a fresh pending one
    Retry {
        /// Task ID
        task_id: String,
    },
}

/// Build the task queue with the built-in handlers.
///
/// The stub graph client stands in until a real backend is wired in by the
/// hosting deployment.
fn build_queue(db_pool: PgPool, worker_count: usize) -> Arc<TaskQueue> {
    let graph: Arc<dyn GraphClient> = Arc::new(StubGraphClient);
    let schema_cache = Arc::new(ProjectSchemaCache::new(db_pool.clone()));

    let mut registry = HandlerRegistry::new();
    registry.register(EpisodeHandler::new(
        Arc::clone(&graph),
        Arc::clone(&schema_cache),
    ));
    registry.register(RebuildCommunityHandler::new(graph));

    let queue_config = QueueConfig {
        worker_count,
        ..QueueConfig::default()
    };
    Arc::new(TaskQueue::new(db_pool, registry, schema_cache, queue_config))
}

/// Execute the `engram init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `engram db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `engram db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = EngramConfig::resolve(cli_db_url)?;

    println!("Initializing engram database...");

    let created = pool::ensure_database_exists(&resolved.db_config).await?;
    if created {
        println!("Database created.");
    } else {
        println!("Database already exists; applying any pending migrations.");
    }

    let db_pool = pool::create_pool(&resolved.db_config, 2).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::core_table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("engram db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            bind,
            port,
            workers,
        } => {
            let resolved = EngramConfig::resolve(cli.database_url.as_deref())?;
            // Workers, sweeper, and API handlers share the pool.
            let db_pool = pool::create_pool(&resolved.db_config, workers as u32 + 4).await?;
            let queue = build_queue(db_pool.clone(), workers);
            queue.start().await?;
            let result = serve_cmd::run_serve(Arc::clone(&queue), &bind, port).await;
            queue.shutdown().await;
            db_pool.close().await;
            result?;
        }
        Commands::Worker { workers } => {
            let resolved = EngramConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config, workers as u32 + 4).await?;
            let queue = build_queue(db_pool.clone(), workers);
            queue.start().await?;
            tracing::info!("worker process running, Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            queue.shutdown().await;
            db_pool.close().await;
        }
        Commands::Enqueue {
            kind,
            group,
            payload,
            max_attempts,
            task_id,
        } => {
            let resolved = EngramConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config, 2).await?;
            let queue = build_queue(db_pool.clone(), 0);
            let result = task_cmds::run_enqueue(
                &queue,
                &kind,
                &group,
                &payload,
                max_attempts,
                task_id.as_deref(),
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Status {
            task_id,
            group,
            kind,
            status,
            limit,
        } => {
            let resolved = EngramConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config, 2).await?;
            let queue = build_queue(db_pool.clone(), 0);
            let result = task_cmds::run_status(
                &queue,
                task_id.as_deref(),
                group.as_deref(),
                kind.as_deref(),
                status.as_deref(),
                limit,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Stop { task_id } => {
            let resolved = EngramConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config, 2).await?;
            let queue = build_queue(db_pool.clone(), 0);
            let result = task_cmds::run_stop(&queue, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Retry { task_id } => {
            let resolved = EngramConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config, 2).await?;
            let queue = build_queue(db_pool.clone(), 0);
            let result = task_cmds::run_retry(&queue, &task_id).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
