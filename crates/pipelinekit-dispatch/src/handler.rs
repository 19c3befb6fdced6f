use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use pipelinekit_types::{Command, Context, PipelineError};

/// The terminal step of a chain: actually performs the command's work.
///
/// Separate from [`crate::middleware::Middleware`] because a handler has no
/// `next` to call — it's where the chain bottoms out.
#[async_trait]
pub trait Handler<C: Command>: Send + Sync {
    async fn call(&self, cmd: C, ctx: Context) -> Result<C::Output, PipelineError>;
}

/// Blanket impl so a plain async closure can be registered as a handler
/// without a wrapper type.
#[async_trait]
impl<C, F, Fut> Handler<C> for F
where
    C: Command,
    F: Fn(C, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<C::Output, PipelineError>> + Send,
{
    async fn call(&self, cmd: C, ctx: Context) -> Result<C::Output, PipelineError> {
        self(cmd, ctx).await
    }
}

/// Internal alias so `middleware.rs` doesn't need to name `Handler` twice;
/// kept distinct in case type-erased dispatch (§ handler.rs in the
/// dispatcher) needs a different bound later.
pub(crate) use Handler as DynHandler;
