//! Outcome types exchanged between handlers and the worker pool.

use uuid::Uuid;

use crate::progress::TaskStopped;

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_id: Uuid,
    pub group_id: String,
    /// 0-based index of this attempt.
    pub attempt: i32,
}

/// Graph-schema labels surfaced by a successful handler, to be
/// materialized by the schema sync sink.
#[derive(Debug, Clone, Default)]
pub struct SchemaAdditions {
    pub project_id: String,
    pub entity_types: Vec<String>,
    pub edge_types: Vec<String>,
    /// (source entity label, edge label, target entity label) triples.
    pub edge_maps: Vec<(String, String, String)>,
}

/// A successful handler outcome.
#[derive(Debug, Clone, Default)]
pub struct HandlerSuccess {
    /// Opaque result recorded on the task row.
    pub result: Option<Vec<u8>>,
    /// Optional entity reference for client-side filtering.
    pub entity_id: Option<String>,
    /// Optional entity type for client-side filtering.
    pub entity_type: Option<String>,
    /// Schema labels to sync, if any.
    pub schema: Option<SchemaAdditions>,
}

/// How the worker should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Another attempt could succeed; subject to the retry budget.
    Retryable,
    /// Retrying cannot help; fail the task immediately.
    Permanent,
    /// The run was abandoned after a stop was observed; no attempt is
    /// charged.
    Stopped,
}

/// A failed handler outcome: a classification plus the message recorded
/// into the task row.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn stopped() -> Self {
        Self {
            kind: FailureKind::Stopped,
            message: "stopped".to_owned(),
        }
    }
}

// Lets handlers propagate a stop observed at a progress flush with `?`.
impl From<TaskStopped> for HandlerFailure {
    fn from(_: TaskStopped) -> Self {
        Self::stopped()
    }
}

/// What a handler invocation produces.
pub type HandlerResult = Result<HandlerSuccess, HandlerFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_converts_to_stopped_failure() {
        let failure: HandlerFailure = TaskStopped.into();
        assert_eq!(failure.kind, FailureKind::Stopped);
    }

    #[test]
    fn constructors_carry_classification() {
        assert_eq!(
            HandlerFailure::retryable("boom").kind,
            FailureKind::Retryable
        );
        assert_eq!(
            HandlerFailure::permanent("bad payload").kind,
            FailureKind::Permanent
        );
    }
}
