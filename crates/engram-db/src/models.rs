use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task lifecycle row -- the source of truth for a task's state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRecord {
    pub id: Uuid,
    pub group_id: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i32,
    pub message: Option<String>,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// A durable queue row. `worker_id` NULL means the task is pending in its
/// group's FIFO; non-NULL means it is in-flight under that worker's claim.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueEntry {
    pub task_id: Uuid,
    pub group_id: String,
    pub position: i64,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// A project-scoped entity label row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityType {
    pub id: Uuid,
    pub project_id: String,
    pub name: String,
    pub source: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A project-scoped edge label row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EdgeType {
    pub id: Uuid,
    pub project_id: String,
    pub name: String,
    pub source: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A (source entity, edge, target entity) triple permitted for a project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EdgeTypeMap {
    pub id: Uuid,
    pub project_id: String,
    pub source_type: String,
    pub edge_type: String,
    pub target_type: String,
    pub source: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
