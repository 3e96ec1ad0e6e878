use engram_db::models::TaskStatus;
use uuid::Uuid;

/// Errors surfaced by the public [`TaskQueue`](crate::TaskQueue) API.
///
/// Handler failures never appear here; they are recorded into the task row
/// and reported through status, `error`, and `attempts`.
#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("unknown task kind: {0}")]
    UnknownKind(String),

    #[error("task {0} already exists")]
    DuplicateTask(Uuid),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("task {id} is {status}, only failed tasks can be retried")]
    NotRetryable { id: Uuid, status: TaskStatus },

    #[error("group {group_id} already has {limit} pending tasks")]
    QueueFull { group_id: String, limit: i64 },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
