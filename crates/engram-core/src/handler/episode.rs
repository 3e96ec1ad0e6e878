//! The episode handler: drives a submitted episode through the graph
//! client's extraction pipeline and reports the schema labels it saw.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::graph::{EpisodeData, GraphClient, GraphError};
use crate::handler::trait_def::Handler;
use crate::handler::types::{
    HandlerContext, HandlerFailure, HandlerResult, HandlerSuccess, SchemaAdditions,
};
use crate::progress::ProgressReporter;
use crate::schema_sync::ProjectSchemaCache;

/// Task kind served by [`EpisodeHandler`].
pub const EPISODE_KIND: &str = "episode";

/// Ingests one episode: validate, extract entities and edges, persist,
/// and hand the observed labels to the schema sync sink.
///
/// Idempotent on the task id -- it doubles as the episode uuid, so a
/// retried attempt persists the same episode node.
pub struct EpisodeHandler {
    graph: Arc<dyn GraphClient>,
    schemas: Arc<ProjectSchemaCache>,
}

impl EpisodeHandler {
    pub fn new(graph: Arc<dyn GraphClient>, schemas: Arc<ProjectSchemaCache>) -> Self {
        Self { graph, schemas }
    }
}

#[async_trait]
impl Handler for EpisodeHandler {
    fn kind(&self) -> &str {
        EPISODE_KIND
    }

    async fn process(
        &self,
        ctx: &HandlerContext,
        payload: &[u8],
        progress: &ProgressReporter,
    ) -> HandlerResult {
        let episode: EpisodeData = serde_json::from_slice(payload)
            .map_err(|e| HandlerFailure::permanent(format!("malformed episode payload: {e}")))?;
        if episode.content.trim().is_empty() {
            return Err(HandlerFailure::permanent("episode content is empty"));
        }
        progress.report(10, "validated").await?;

        let schema = self
            .schemas
            .get_project_schema(&episode.project_id)
            .await
            .map_err(|e| HandlerFailure::retryable(format!("schema load failed: {e:#}")))?;

        progress.report(20, "extracting entities").await?;
        let entities = self
            .graph
            .extract_entities(&episode, &schema)
            .await
            .map_err(failure_from_graph)?;
        progress.report(30, "entities extracted").await?;

        let edges = self
            .graph
            .extract_edges(&episode, &entities, &schema)
            .await
            .map_err(failure_from_graph)?;
        progress.report(50, "edges extracted").await?;

        // The task id is the episode uuid: reprocessing writes the same node.
        self.graph
            .persist_episode(ctx.task_id, &episode, &entities, &edges)
            .await
            .map_err(failure_from_graph)?;
        progress.report(75, "persisted").await?;

        let additions = schema_additions(&episode.project_id, &entities, &edges);
        let result = serde_json::to_vec(&serde_json::json!({
            "episode_uuid": ctx.task_id,
            "entity_count": entities.len(),
            "edge_count": edges.len(),
        }))
        .map_err(|e| HandlerFailure::permanent(format!("result encoding failed: {e}")))?;

        progress.report(100, "done").await?;

        Ok(HandlerSuccess {
            result: Some(result),
            entity_id: Some(ctx.task_id.to_string()),
            entity_type: Some("episode".to_owned()),
            schema: Some(additions),
        })
    }
}

fn failure_from_graph(err: GraphError) -> HandlerFailure {
    match err {
        GraphError::Transient(message) => HandlerFailure::retryable(message),
        GraphError::Permanent(message) => HandlerFailure::permanent(message),
    }
}

/// Deduplicate the labels observed in one extraction into sorted schema
/// additions.
fn schema_additions(
    project_id: &str,
    entities: &[crate::graph::ExtractedEntity],
    edges: &[crate::graph::ExtractedEdge],
) -> SchemaAdditions {
    let entity_types: BTreeSet<String> = entities.iter().map(|e| e.label.clone()).collect();
    let edge_types: BTreeSet<String> = edges.iter().map(|e| e.name.clone()).collect();
    let edge_maps: BTreeSet<(String, String, String)> = edges
        .iter()
        .map(|e| (e.source_label.clone(), e.name.clone(), e.target_label.clone()))
        .collect();

    SchemaAdditions {
        project_id: project_id.to_owned(),
        entity_types: entity_types.into_iter().collect(),
        edge_types: edge_types.into_iter().collect(),
        edge_maps: edge_maps.into_iter().collect(),
    }
}
