//! Persistence layer for the engram task queue: connection pool, schema
//! migrations, row models, and the SQL query functions for the `tasks`,
//! `queue_state`, and graph-schema tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

/// Check whether an error (possibly wrapped in context layers) is a
/// PostgreSQL unique-constraint violation.
///
/// Used by callers that treat duplicate inserts as a distinct outcome,
/// e.g. idempotent enqueue with a caller-supplied task id.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|db| db.code().as_deref() == Some("23505"))
}
