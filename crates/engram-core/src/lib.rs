//! The asynchronous episode processing subsystem: a durable, recoverable,
//! fairly-scheduled multi-tenant task queue.
//!
//! Tasks are enqueued into per-group FIFOs backed by Postgres, claimed by a
//! fixed pool of workers that dispatch to registered handlers under a
//! per-handler timeout, recovered by a periodic stall sweeper, and observed
//! through a per-task progress bus. Successful episode handlers feed the
//! schema sync sink, which materializes graph-schema rows for the project.
//!
//! Construct a [`TaskQueue`] once in the composition root and share it by
//! reference; there is no global state.

pub mod config;
pub mod error;
pub mod graph;
pub mod handler;
pub mod progress;
pub mod schema_sync;
pub mod scheduler;
pub mod service;
mod sweeper;
mod worker;

pub use config::QueueConfig;
pub use error::TaskQueueError;
pub use service::{EnqueueOptions, TaskQueue};
