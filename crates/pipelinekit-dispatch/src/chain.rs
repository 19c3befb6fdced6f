use std::sync::Arc;

use pipelinekit_types::{Command, Context, PipelineError};

use crate::handler::Handler;
use crate::middleware::{Middleware, Next};

/// An ordered sequence of middleware terminating in a handler.
///
/// Middleware run in priority order (spec §4.7): lower
/// [`pipelinekit_types::MiddlewarePriority`] values first, ties broken by
/// registration order. Built once per command type and reused across many
/// dispatches — `execute` constructs a fresh [`Next`] continuation per call,
/// so concurrent dispatches through the same chain never interfere.
/// Cheap to clone: both fields are reference-counted, so the dispatcher
/// can clone a snapshot out from behind its registry lock rather than
/// holding that lock across a dispatch.
pub struct MiddlewareChain<C: Command> {
    middlewares: Vec<Arc<dyn Middleware<C>>>,
    handler: Arc<dyn Handler<C>>,
}

// Derived `Clone` would additionally require `C: Clone`, which nothing
// here actually needs — both fields are reference-counted regardless of C.
impl<C: Command> Clone for MiddlewareChain<C> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<C: Command> MiddlewareChain<C> {
    pub fn new(handler: Arc<dyn Handler<C>>) -> Self {
        Self {
            middlewares: Vec::new(),
            handler,
        }
    }

    /// Insert `middleware` at the position its priority dictates, after any
    /// already-registered middleware at the same priority.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware<C>>) {
        let priority = middleware.priority();
        let position = self
            .middlewares
            .partition_point(|existing| existing.priority() <= priority);
        self.middlewares.insert(position, middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    fn build_next(&self, from: usize) -> Next<C> {
        match self.middlewares.get(from) {
            Some(middleware) => Next::middleware(middleware.clone(), self.build_next(from + 1)),
            None => Next::handler(self.handler.clone()),
        }
    }

    pub async fn execute(&self, cmd: C, ctx: Context) -> Result<C::Output, PipelineError> {
        self.build_next(0).run(cmd, ctx).await
    }
}
