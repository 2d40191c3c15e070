use std::future::Future;

use futures::stream::BoxStream;
use ironposh_pool_core::{
    ConnectionInfo, PipelineSpec, PipelineStateInfo, PoolError, PsItem, RunspaceAvailability,
    RunspaceId, RunspaceStateInfo,
};

// Internal modules
mod adapter;
mod channel;
mod context;
mod policy;
mod pool;
mod powershell;
mod watch;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

#[cfg(test)]
mod tests;

// Public API
pub use adapter::{Pipeline, run_pipeline};
pub use channel::{PipelineData, PipelineInputWriter, PipelineReader, PipelineWriter, pipeline_channel};
pub use context::{InvocationContext, with_timeout};
pub use policy::{ErrorPolicy, ErrorPredicate, PsItemStreamExt};
pub use pool::{LeasedRunspace, PoolStatus, RunspacePool};
pub use powershell::PowerShell;
pub use watch::StateWatch;

pub use ironposh_pool_core as core;
pub use tokio_util::sync::CancellationToken;

/// The ordered result sequence of one pipeline execution.
pub type PsItemStream = BoxStream<'static, Result<PsItem, PoolError>>;

/// A notification stream that first yields the current value, then every change.
pub type StateStream<T> = BoxStream<'static, T>;

/// Creates runspaces for a pool.
pub trait RunspaceFactory: Send + Sync + 'static {
    type Runspace: Runspace;

    fn create(&self, connection: &ConnectionInfo) -> Result<Self::Runspace, PoolError>;
}

/// A connectable remote execution context running at most one pipeline at a time.
pub trait Runspace: Send + Sync + 'static {
    type Execution: PipelineExecution;

    fn id(&self) -> RunspaceId;

    fn state(&self) -> RunspaceStateInfo;

    fn availability(&self) -> RunspaceAvailability;

    fn state_changes(&self) -> StateStream<RunspaceStateInfo>;

    fn availability_changes(&self) -> StateStream<RunspaceAvailability>;

    /// Drives the runspace from `BeforeOpen` to `Opened`. Failures leave it `Broken`.
    fn open(&self) -> impl Future<Output = Result<(), PoolError>> + Send;

    /// Clears per-invocation context so the runspace looks freshly opened.
    fn reset(&self) -> impl Future<Output = Result<(), PoolError>> + Send;

    /// Requests the runspace to close. Never blocks.
    fn close(&self);

    fn create_pipeline(&self, spec: PipelineSpec) -> Result<Self::Execution, PoolError>;
}

/// A single run of a pipeline on a runspace.
///
/// Implementations must write all output and error items to the pipeline
/// channel before publishing a terminal state.
pub trait PipelineExecution: Send + 'static {
    fn id(&self) -> uuid::Uuid;

    fn state(&self) -> PipelineStateInfo;

    fn state_changes(&self) -> StateStream<PipelineStateInfo>;

    /// The merged output/error reader. Can be taken once.
    fn take_reader(&mut self) -> Option<PipelineReader>;

    /// The input writer, if the pipeline accepts input. Dropping it closes input.
    fn take_input(&mut self) -> Option<PipelineInputWriter>;

    fn start(&mut self) -> Result<(), PoolError>;

    /// Requests the pipeline to stop. Never blocks.
    fn request_stop(&self);
}
