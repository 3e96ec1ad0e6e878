use std::time::Duration;

/// Configuration for the task queue subsystem.
///
/// The process wrapper supplies this struct; no environment variables are
/// read here.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of workers. 0 means producer-only mode: the queue accepts
    /// enqueues but starts no workers or sweeper (a separate worker
    /// process runs the consumers).
    pub worker_count: usize,
    /// Cadence of the recovery sweeper.
    pub recovery_interval: Duration,
    /// Minimum interval between progress writes to the task row. The final
    /// 100% flush always goes through.
    pub progress_flush_min_interval: Duration,
    /// Added to a handler's timeout before the sweeper treats a processing
    /// task as stalled, so a task about to time out naturally is not
    /// double-recovered.
    pub stall_grace: Duration,
    /// Optional hard limit on a group's pending queue length; enqueues
    /// beyond it are rejected.
    pub per_group_pending_limit: Option<i64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 20,
            recovery_interval: Duration::from_secs(60),
            progress_flush_min_interval: Duration::from_secs(1),
            stall_grace: Duration::from_secs(30),
            per_group_pending_limit: None,
        }
    }
}
