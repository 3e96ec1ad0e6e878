//! Database query functions for the project-scoped graph-schema tables
//! (`entity_types`, `edge_types`, `edge_type_maps`).
//!
//! Inserts use `ON CONFLICT DO NOTHING` so the schema sync sink is
//! idempotent across retried attempts.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{EdgeType, EdgeTypeMap, EntityType};

/// Insert missing entity labels for a project in one small transaction.
///
/// Returns the number of rows actually inserted (already-present labels
/// are skipped).
pub async fn insert_entity_types(
    pool: &PgPool,
    project_id: &str,
    names: &[String],
) -> Result<u64> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin entity type insert")?;

    let mut inserted = 0;
    for name in names {
        let result = sqlx::query(
            "INSERT INTO entity_types (project_id, name) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(project_id)
        .bind(name)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert entity type {name}"))?;
        inserted += result.rows_affected();
    }

    tx.commit()
        .await
        .context("failed to commit entity type insert")?;

    Ok(inserted)
}

/// Insert missing edge labels for a project in one small transaction.
pub async fn insert_edge_types(pool: &PgPool, project_id: &str, names: &[String]) -> Result<u64> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin edge type insert")?;

    let mut inserted = 0;
    for name in names {
        let result = sqlx::query(
            "INSERT INTO edge_types (project_id, name) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(project_id)
        .bind(name)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert edge type {name}"))?;
        inserted += result.rows_affected();
    }

    tx.commit()
        .await
        .context("failed to commit edge type insert")?;

    Ok(inserted)
}

/// Insert missing (source, edge, target) triples for a project in one
/// small transaction.
pub async fn insert_edge_type_maps(
    pool: &PgPool,
    project_id: &str,
    triples: &[(String, String, String)],
) -> Result<u64> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin edge type map insert")?;

    let mut inserted = 0;
    for (source, edge, target) in triples {
        let result = sqlx::query(
            "INSERT INTO edge_type_maps (project_id, source_type, edge_type, target_type) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT DO NOTHING",
        )
        .bind(project_id)
        .bind(source)
        .bind(edge)
        .bind(target)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert edge type map {source}-{edge}-{target}"))?;
        inserted += result.rows_affected();
    }

    tx.commit()
        .await
        .context("failed to commit edge type map insert")?;

    Ok(inserted)
}

/// List a project's entity labels, alphabetical.
pub async fn list_entity_types(pool: &PgPool, project_id: &str) -> Result<Vec<EntityType>> {
    let rows = sqlx::query_as::<_, EntityType>(
        "SELECT * FROM entity_types WHERE project_id = $1 ORDER BY name",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list entity types")?;

    Ok(rows)
}

/// List a project's edge labels, alphabetical.
pub async fn list_edge_types(pool: &PgPool, project_id: &str) -> Result<Vec<EdgeType>> {
    let rows = sqlx::query_as::<_, EdgeType>(
        "SELECT * FROM edge_types WHERE project_id = $1 ORDER BY name",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list edge types")?;

    Ok(rows)
}

/// List a project's permitted edge triples.
pub async fn list_edge_type_maps(pool: &PgPool, project_id: &str) -> Result<Vec<EdgeTypeMap>> {
    let rows = sqlx::query_as::<_, EdgeTypeMap>(
        "SELECT * FROM edge_type_maps WHERE project_id = $1 \
         ORDER BY source_type, edge_type, target_type",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list edge type maps")?;

    Ok(rows)
}
