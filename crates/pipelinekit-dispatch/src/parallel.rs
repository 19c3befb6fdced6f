use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use pipelinekit_types::{Command, Context, MiddlewarePriority, PipelineError};

use crate::middleware::{Middleware, Next};

/// Read-only check run before the rest of the chain, in parallel with its
/// peers. Never mutates the shared context — see [`ParallelStrategy::PreValidation`].
#[async_trait]
pub trait Validator<C: Command>: Send + Sync {
    async fn validate(&self, cmd: &C, ctx: &Context) -> Result<(), PipelineError>;
}

/// A side effect (logging, auditing, cache warming) run in parallel with
/// its peers, on its own forked context. See [`ParallelStrategy::SideEffectsOnly`]
/// and [`ParallelStrategy::SideEffectsWithMerge`].
#[async_trait]
pub trait SideEffect<C: Command>: Send + Sync {
    async fn run(&self, cmd: &C, ctx: &mut Context) -> Result<(), PipelineError>;
}

/// How a group of concurrently-run middleware relate to the rest of the
/// dispatch, per spec §4.8.
pub enum ParallelStrategy<C: Command> {
    /// Run every validator concurrently on its own forked context; if any
    /// fails, the whole group fails with that error and `next` is never
    /// called. Forked contexts are discarded either way — validators don't
    /// write state that survives them.
    PreValidation(Vec<Arc<dyn Validator<C>>>),
    /// Run every effect concurrently on its own forked context; each
    /// fork's writes are discarded once it completes.
    SideEffectsOnly(Vec<Arc<dyn SideEffect<C>>>),
    /// Like `SideEffectsOnly`, but each fork's writes are folded back into
    /// the shared context afterward, last-writer-wins in registration
    /// order of the effects vector.
    SideEffectsWithMerge(Vec<Arc<dyn SideEffect<C>>>),
}

/// Wraps a group of validators or side effects so they occupy a single slot
/// in a [`crate::chain::MiddlewareChain`] and run concurrently with one
/// another, rather than serially like ordinary middleware.
pub struct ParallelWrapper<C: Command> {
    priority: MiddlewarePriority,
    strategy: ParallelStrategy<C>,
}

impl<C: Command> ParallelWrapper<C> {
    pub fn new(priority: MiddlewarePriority, strategy: ParallelStrategy<C>) -> Self {
        Self { priority, strategy }
    }
}

#[async_trait]
impl<C: Command + Clone> Middleware<C> for ParallelWrapper<C> {
    async fn handle(&self, cmd: C, ctx: Context, next: Next<C>) -> Result<C::Output, PipelineError> {
        match &self.strategy {
            ParallelStrategy::PreValidation(validators) => {
                // FuturesUnordered rather than join_all: the first Err
                // returns through `?` immediately, dropping the set and
                // cancelling every validator still in flight instead of
                // waiting out the slowest one.
                let mut pending: FuturesUnordered<_> = validators
                    .iter()
                    .map(|validator| {
                        let cmd = cmd.clone();
                        let ctx = ctx.clone();
                        async move {
                            let forked = ctx.fork().await;
                            validator.validate(&cmd, &forked).await
                        }
                    })
                    .collect();
                while let Some(outcome) = pending.next().await {
                    outcome?;
                }
                next.run(cmd, ctx).await
            }
            ParallelStrategy::SideEffectsOnly(effects) => {
                join_all(effects.iter().map(|effect| {
                    let cmd = cmd.clone();
                    let ctx = ctx.clone();
                    async move {
                        let mut forked = ctx.fork().await;
                        effect.run(&cmd, &mut forked).await
                    }
                }))
                .await;
                next.run(cmd, ctx).await
            }
            ParallelStrategy::SideEffectsWithMerge(effects) => {
                let forks = join_all(effects.iter().map(|effect| {
                    let cmd = cmd.clone();
                    let ctx = ctx.clone();
                    async move {
                        let mut forked = ctx.fork().await;
                        let _ = effect.run(&cmd, &mut forked).await;
                        forked
                    }
                }))
                .await;
                for fork in &forks {
                    ctx.merge_from(fork).await;
                }
                next.run(cmd, ctx).await
            }
        }
    }

    fn priority(&self) -> MiddlewarePriority {
        self.priority
    }
}
