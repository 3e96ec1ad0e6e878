//! Schema sync: best-effort materialization of graph-schema rows observed
//! in successful handler output, plus the cached per-project schema read
//! path used by handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use sqlx::PgPool;

use engram_db::queries::graph_schema;

use crate::handler::SchemaAdditions;

/// The entity/edge labels currently allowed for a project.
///
/// Empty vectors mean "no constraint" -- a new project starts with an open
/// schema and narrows as labels accumulate.
#[derive(Debug, Clone, Default)]
pub struct ProjectSchema {
    pub entity_types: Vec<String>,
    pub edge_types: Vec<String>,
    pub edge_maps: Vec<(String, String, String)>,
}

/// Cached per-project schema descriptors.
///
/// Loaded lazily from the graph-schema tables and invalidated whenever the
/// sink writes for a project, so handlers never rebuild the schema on the
/// hot path.
pub struct ProjectSchemaCache {
    pool: PgPool,
    cache: Mutex<HashMap<String, Arc<ProjectSchema>>>,
}

impl ProjectSchemaCache {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get the current schema descriptor for a project, loading and
    /// caching it on first use.
    pub async fn get_project_schema(&self, project_id: &str) -> Result<Arc<ProjectSchema>> {
        {
            let cache = self.cache.lock().expect("schema cache lock poisoned");
            if let Some(schema) = cache.get(project_id) {
                return Ok(Arc::clone(schema));
            }
        }

        // Load outside the lock; a racing loader just does the same work.
        let entity_types = graph_schema::list_entity_types(&self.pool, project_id)
            .await?
            .into_iter()
            .filter(|t| t.status == "enabled")
            .map(|t| t.name)
            .collect();
        let edge_types = graph_schema::list_edge_types(&self.pool, project_id)
            .await?
            .into_iter()
            .filter(|t| t.status == "enabled")
            .map(|t| t.name)
            .collect();
        let edge_maps = graph_schema::list_edge_type_maps(&self.pool, project_id)
            .await?
            .into_iter()
            .filter(|m| m.status == "enabled")
            .map(|m| (m.source_type, m.edge_type, m.target_type))
            .collect();

        let schema = Arc::new(ProjectSchema {
            entity_types,
            edge_types,
            edge_maps,
        });

        let mut cache = self.cache.lock().expect("schema cache lock poisoned");
        cache.insert(project_id.to_owned(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Drop the cached descriptor for a project so the next read reloads.
    pub fn invalidate(&self, project_id: &str) {
        let mut cache = self.cache.lock().expect("schema cache lock poisoned");
        cache.remove(project_id);
    }
}

impl std::fmt::Debug for ProjectSchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.lock().expect("schema cache lock poisoned");
        f.debug_struct("ProjectSchemaCache")
            .field("cached_projects", &cache.len())
            .finish()
    }
}

/// Inserts the schema additions reported by a successful handler.
///
/// Each label kind gets its own small transaction so a failure affecting
/// one kind cannot poison the others, and every failure is a logged
/// warning only -- the user's task already succeeded; schema catch-up is
/// best-effort and idempotent.
pub struct SchemaSyncSink {
    pool: PgPool,
    cache: Arc<ProjectSchemaCache>,
}

impl SchemaSyncSink {
    pub fn new(pool: PgPool, cache: Arc<ProjectSchemaCache>) -> Self {
        Self { pool, cache }
    }

    pub async fn sync(&self, additions: &SchemaAdditions) {
        let project_id = &additions.project_id;

        if !additions.entity_types.is_empty() {
            match graph_schema::insert_entity_types(&self.pool, project_id, &additions.entity_types)
                .await
            {
                Ok(n) if n > 0 => {
                    tracing::debug!(project_id = %project_id, inserted = n, "entity types added")
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(project_id = %project_id, error = %e, "entity type sync failed")
                }
            }
        }

        if !additions.edge_types.is_empty() {
            match graph_schema::insert_edge_types(&self.pool, project_id, &additions.edge_types)
                .await
            {
                Ok(n) if n > 0 => {
                    tracing::debug!(project_id = %project_id, inserted = n, "edge types added")
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(project_id = %project_id, error = %e, "edge type sync failed")
                }
            }
        }

        if !additions.edge_maps.is_empty() {
            match graph_schema::insert_edge_type_maps(&self.pool, project_id, &additions.edge_maps)
                .await
            {
                Ok(n) if n > 0 => {
                    tracing::debug!(project_id = %project_id, inserted = n, "edge type maps added")
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(project_id = %project_id, error = %e, "edge type map sync failed")
                }
            }
        }

        self.cache.invalidate(project_id);
    }
}
