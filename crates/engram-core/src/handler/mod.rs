//! Task handlers: the trait, the registry, the built-in implementations,
//! and the outcome types shared between them and the worker pool.

pub mod community;
pub mod episode;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use community::RebuildCommunityHandler;
pub use episode::EpisodeHandler;
pub use registry::HandlerRegistry;
pub use trait_def::Handler;
pub use types::{
    FailureKind, HandlerContext, HandlerFailure, HandlerResult, HandlerSuccess, SchemaAdditions,
};
