use async_trait::async_trait;
use pipelinekit_types::{Command, Context, MiddlewarePriority, PipelineError};

use crate::handler::DynHandler;

/// A step in a [`crate::chain::MiddlewareChain`].
///
/// `handle` receives the remaining chain as `next`: calling `next.run(..)`
/// continues the dispatch, not calling it short-circuits with whatever this
/// middleware returns. `Next` is consumed by value on `run`, so the type
/// system — not a runtime flag — rules out calling it twice or holding on
/// to a stale continuation from a previous dispatch.
#[async_trait]
pub trait Middleware<C: Command>: Send + Sync {
    async fn handle(&self, cmd: C, ctx: Context, next: Next<C>) -> Result<C::Output, PipelineError>;

    fn priority(&self) -> MiddlewarePriority;

    /// Name used in logs and diagnostics; defaults to the concrete type name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

enum NextInner<C: Command> {
    Middleware {
        middleware: std::sync::Arc<dyn Middleware<C>>,
        rest: Box<Next<C>>,
    },
    Handler(std::sync::Arc<dyn DynHandler<C>>),
}

/// The remainder of a middleware chain, handed to the current middleware.
///
/// Owned, not borrowed: a middleware that wants to call it from inside a
/// spawned task or after an `.await` can, since it isn't tied to a
/// reference into the chain's storage. What it can't do is call it more
/// than once — `run` takes `self`, so a second call is a compile error.
pub struct Next<C: Command> {
    inner: NextInner<C>,
}

impl<C: Command> Next<C> {
    pub(crate) fn middleware(middleware: std::sync::Arc<dyn Middleware<C>>, rest: Next<C>) -> Self {
        Self {
            inner: NextInner::Middleware {
                middleware,
                rest: Box::new(rest),
            },
        }
    }

    pub(crate) fn handler(handler: std::sync::Arc<dyn DynHandler<C>>) -> Self {
        Self {
            inner: NextInner::Handler(handler),
        }
    }

    pub async fn run(self, cmd: C, ctx: Context) -> Result<C::Output, PipelineError> {
        match self.inner {
            NextInner::Middleware { middleware, rest } => middleware.handle(cmd, ctx, *rest).await,
            NextInner::Handler(handler) => handler.call(cmd, ctx).await,
        }
    }
}
