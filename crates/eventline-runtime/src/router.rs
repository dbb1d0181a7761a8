//! Event router
//!
//! Maps event names to handlers. Registration happens up front, the map is
//! frozen into a `Router` before the broker starts listening, and lookups
//! after that are immutable; a dispatch for an unregistered name is a
//! programming error, not a runtime fault.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::Context;

/// Outcome of one handler invocation
///
/// Failures are application errors; the dispatch wrapper captures them into
/// the failed queue and never lets them escape.
pub type HandlerResult = anyhow::Result<()>;

// ----------------------------------------------------------------------------
// Event Handler Trait
// ----------------------------------------------------------------------------

/// A registered handler for one event name
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one delivery of the event
    async fn handle(&self, ctx: Context, args: Vec<Value>) -> HandlerResult;
}

/// Adapter wrapping an async closure as an `EventHandler`
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Context, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: Context, args: Vec<Value>) -> HandlerResult {
        (self.0)(ctx, args).await
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

/// Mutable name → handler registry used before the broker starts
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl RouterBuilder {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same name wins
    pub fn on(&mut self, event: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.routes.insert(event.into(), handler);
    }

    /// Register an async closure
    pub fn on_fn<F, Fut>(&mut self, event: impl Into<String>, handler: F)
    where
        F: Fn(Context, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on(event, Arc::new(FnHandler(handler)));
    }

    /// Freeze the registry
    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
        }
    }

    /// Number of registered event names
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Immutable name → handler map the broker dispatches against
pub struct Router {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl Router {
    /// Look up the handler for an event name
    pub fn get(&self, event: &str) -> Option<Arc<dyn EventHandler>> {
        self.routes.get(event).cloned()
    }

    /// Whether a handler is registered for `event`
    pub fn has(&self, event: &str) -> bool {
        self.routes.contains_key(event)
    }

    /// All registered event names
    pub fn names(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Number of registered event names
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
