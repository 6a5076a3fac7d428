//! Handler registry: task name to handler function.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use taskmesh_core::QueueError;

use crate::handler::{handler_fn, TaskHandler};

/// Maps task names to their handlers. Built once at worker boot; a task
/// whose name has no entry is dead-lettered without consuming retries.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task name. Re-registering a name replaces
    /// the previous handler.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> &mut Self {
        let name = name.into();
        debug!("Registered task handler {}", name);
        self.handlers.insert(name, Arc::new(handler));
        self
    }

    /// Register an async function or closure for a task name.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueueError>> + Send + 'static,
    {
        self.register(name, handler_fn(f))
    }

    /// Look up the handler for a task name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered task names.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
