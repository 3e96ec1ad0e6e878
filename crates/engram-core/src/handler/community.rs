//! The rebuild-community handler: a known-slow maintenance job that
//! recomputes a project's community clusters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::graph::{GraphClient, GraphError};
use crate::handler::trait_def::Handler;
use crate::handler::types::{HandlerContext, HandlerFailure, HandlerResult, HandlerSuccess};
use crate::progress::ProgressReporter;

/// Task kind served by [`RebuildCommunityHandler`].
pub const REBUILD_COMMUNITY_KIND: &str = "rebuild_community";

/// JSON shape of the `rebuild_community` task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildCommunityPayload {
    pub tenant_id: String,
    pub project_id: String,
}

/// Rebuilds community clusters. Hours-long runs are expected, so the
/// timeout is raised to an hour and there is no retry -- a second pass is
/// cheaper to request than to replay automatically.
pub struct RebuildCommunityHandler {
    graph: Arc<dyn GraphClient>,
}

impl RebuildCommunityHandler {
    pub fn new(graph: Arc<dyn GraphClient>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Handler for RebuildCommunityHandler {
    fn kind(&self) -> &str {
        REBUILD_COMMUNITY_KIND
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn max_attempts(&self) -> i32 {
        1
    }

    async fn process(
        &self,
        _ctx: &HandlerContext,
        payload: &[u8],
        progress: &ProgressReporter,
    ) -> HandlerResult {
        let request: RebuildCommunityPayload = serde_json::from_slice(payload).map_err(|e| {
            HandlerFailure::permanent(format!("malformed rebuild_community payload: {e}"))
        })?;

        progress.report(50, "rebuilding communities").await?;

        self.graph
            .rebuild_communities(&request.tenant_id, &request.project_id)
            .await
            .map_err(|e| match e {
                GraphError::Transient(message) => HandlerFailure::retryable(message),
                GraphError::Permanent(message) => HandlerFailure::permanent(message),
            })?;

        progress.report(100, "done").await?;

        Ok(HandlerSuccess {
            entity_id: Some(request.project_id),
            entity_type: Some("project".to_owned()),
            ..HandlerSuccess::default()
        })
    }
}
