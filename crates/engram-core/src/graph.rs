//! The `GraphClient` trait -- the port to the knowledge-graph backend.
//!
//! Handlers drive extraction and persistence through this trait; the queue
//! itself never touches the graph. The trait is object-safe so it can be
//! shared as `Arc<dyn GraphClient>` across handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema_sync::ProjectSchema;

/// A user-submitted episode awaiting knowledge-graph ingestion.
///
/// This is the JSON shape of the `episode` task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeData {
    pub content: String,
    #[serde(default)]
    pub source_description: Option<String>,
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
    pub tenant_id: String,
    pub project_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
}

/// An entity surfaced by extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    pub name: String,
    pub label: String,
}

/// A relationship surfaced by extraction, with the labels of its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEdge {
    pub name: String,
    pub source_label: String,
    pub target_label: String,
}

/// Errors from the graph backend, split by whether another attempt could
/// succeed. The worker maps `Transient` to the retry policy and
/// `Permanent` straight to a failed task.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("transient graph error: {0}")]
    Transient(String),

    #[error("permanent graph error: {0}")]
    Permanent(String),
}

/// Port to the knowledge-graph extraction pipeline.
///
/// `persist_episode` must be idempotent on `episode_uuid`: the queue uses
/// the task id as the episode identifier, so a retried attempt writes the
/// same episode node.
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Extract entities from an episode, constrained to the project's
    /// allowed labels where the schema is non-empty.
    async fn extract_entities(
        &self,
        episode: &EpisodeData,
        schema: &ProjectSchema,
    ) -> Result<Vec<ExtractedEntity>, GraphError>;

    /// Extract relationships between previously extracted entities.
    async fn extract_edges(
        &self,
        episode: &EpisodeData,
        entities: &[ExtractedEntity],
        schema: &ProjectSchema,
    ) -> Result<Vec<ExtractedEdge>, GraphError>;

    /// Persist the episode node and its extractions.
    async fn persist_episode(
        &self,
        episode_uuid: Uuid,
        episode: &EpisodeData,
        entities: &[ExtractedEntity],
        edges: &[ExtractedEdge],
    ) -> Result<(), GraphError>;

    /// Recompute community clusters for a project. Known-slow.
    async fn rebuild_communities(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<(), GraphError>;
}

// Compile-time assertion: GraphClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn GraphClient) {}
};

/// A no-op graph client for bring-up and tests: extracts nothing and
/// persists nowhere, so the queue machinery can run without a graph
/// backend.
#[derive(Debug, Default)]
pub struct StubGraphClient;

#[async_trait]
impl GraphClient for StubGraphClient {
    async fn extract_entities(
        &self,
        _episode: &EpisodeData,
        _schema: &ProjectSchema,
    ) -> Result<Vec<ExtractedEntity>, GraphError> {
        Ok(Vec::new())
    }

    async fn extract_edges(
        &self,
        _episode: &EpisodeData,
        _entities: &[ExtractedEntity],
        _schema: &ProjectSchema,
    ) -> Result<Vec<ExtractedEdge>, GraphError> {
        Ok(Vec::new())
    }

    async fn persist_episode(
        &self,
        _episode_uuid: Uuid,
        _episode: &EpisodeData,
        _entities: &[ExtractedEntity],
        _edges: &[ExtractedEdge],
    ) -> Result<(), GraphError> {
        Ok(())
    }

    async fn rebuild_communities(
        &self,
        _tenant_id: &str,
        _project_id: &str,
    ) -> Result<(), GraphError> {
        Ok(())
    }
}
