//! The `Handler` trait -- the strategy interface for task kinds.
//!
//! Each concrete handler (episode ingestion, community rebuild, etc.)
//! implements this trait. The trait is intentionally object-safe so it can
//! be stored as `Box<dyn Handler>` in the [`super::HandlerRegistry`].

use std::time::Duration;

use async_trait::async_trait;

use super::types::{HandlerContext, HandlerResult};
use crate::progress::ProgressReporter;

/// Default handler timeout when an implementation does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default retry budget when an implementation does not override it.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// A named strategy that turns a task payload into a result plus side
/// effects.
///
/// Handlers must be idempotent on the task id: the queue delivers
/// at-least-once, and a retried or recovered attempt re-invokes `process`
/// with the same id and payload.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The task kind this handler serves (the registry key).
    fn kind(&self) -> &str;

    /// Deadline for one invocation. Exceeding it fails the attempt with a
    /// timeout error; the recovery sweeper also derives its stall cutoff
    /// from this value.
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Total attempts allowed before the task fails terminally. Copied
    /// onto the task row at enqueue.
    fn max_attempts(&self) -> i32 {
        DEFAULT_MAX_ATTEMPTS
    }

    /// Run one attempt. Checkpoints go through `progress`, whose
    /// [`report`](ProgressReporter::report) also surfaces a cooperative
    /// stop; propagate it with `?`.
    async fn process(
        &self,
        ctx: &HandlerContext,
        payload: &[u8],
        progress: &ProgressReporter,
    ) -> HandlerResult;
}

// Compile-time assertion: Handler must be object-safe.
// If this line compiles, the trait can be used as `dyn Handler`.
const _: () = {
    fn _assert_object_safe(_: &dyn Handler) {}
};
