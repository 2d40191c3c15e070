use async_stream::stream;
use futures::StreamExt;
use ironposh_pool_core::{PipelineCommand, PoolConfig, PoolError};
use tracing::{Instrument, Span, info, instrument};

use crate::{
    ErrorPolicy, InvocationContext, Pipeline, PsItemStream, RunspaceFactory, RunspacePool,
    adapter::{execute, interruptible},
};

/// Runs pipelines on a pool it owns.
pub struct PowerShell<F: RunspaceFactory> {
    pool: RunspacePool<F>,
}

impl<F: RunspaceFactory> PowerShell<F> {
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        let pool = RunspacePool::new(factory, config)?;
        pool.ensure_min_size()?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: RunspacePool<F>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &RunspacePool<F> {
        &self.pool
    }

    pub fn invoke(&self, pipeline: impl Into<Pipeline>, policy: ErrorPolicy) -> PsItemStream {
        self.invoke_with(pipeline, policy, &InvocationContext::default())
    }

    /// Runs `pipeline` on a leased runspace. The lease is taken on the first
    /// poll; the context's cancellation and timeout cover both the lease and
    /// the execution, with the timeout counted from that poll.
    #[instrument(skip_all, fields(policy = ?policy))]
    pub fn invoke_with(
        &self,
        pipeline: impl Into<Pipeline>,
        policy: ErrorPolicy,
        ctx: &InvocationContext,
    ) -> PsItemStream {
        let pipeline = pipeline.into();
        let pool = self.pool.clone();
        let ctx = ctx.clone();
        let span = Span::current();

        let items = Box::pin(stream! {
            let mut interrupt = ctx.interrupt(pipeline.spec.timeout);
            let lease = match pool.lease_until(&mut interrupt).instrument(span.clone()).await {
                Ok(lease) => lease,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut items = interruptible(execute(lease, pipeline), interrupt);
            while let Some(item) = items.next().instrument(span.clone()).await {
                yield item;
            }
        });

        policy.apply(items)
    }

    /// Runs a single command with pass-through error handling.
    pub fn invoke_command(&self, command: impl Into<PipelineCommand>) -> PsItemStream {
        self.invoke(command.into(), ErrorPolicy::PassThrough)
    }

    pub fn close(&self) {
        info!("closing PowerShell pool");
        self.pool.close();
    }
}
