//! Handler registry -- a named collection of task-kind strategies.
//!
//! Populated once at startup, then shared immutably with the worker pool
//! and the sweeper (which derives per-kind stall cutoffs from it).

use std::collections::HashMap;

use super::trait_def::Handler;

/// A collection of registered [`Handler`] implementations, keyed by kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the kind it reports.
    ///
    /// If a handler with the same kind is already registered, it is
    /// replaced and the old one is returned.
    pub fn register(&mut self, handler: impl Handler + 'static) -> Option<Box<dyn Handler>> {
        let kind = handler.kind().to_string();
        self.handlers.insert(kind, Box::new(handler))
    }

    /// Look up a handler by kind.
    pub fn get(&self, kind: &str) -> Option<&dyn Handler> {
        self.handlers.get(kind).map(|b| b.as_ref())
    }

    /// The registered kinds, sorted for deterministic iteration.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Return the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Return `true` if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
