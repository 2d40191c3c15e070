use std::time::Duration;

pub mod config;
pub mod control;
pub mod pipeline;
pub mod runspace;
pub mod value;

pub use config::{ConnectionInfo, PoolConfig};
pub use control::{ControlAction, ControlMachine, ControlSnapshot};
pub use pipeline::{Parameter, PipelineCommand, PipelineSpec};
pub use runspace::{
    PipelineStateInfo, PsInvocationState, RunspaceAvailability, RunspaceId, RunspaceState,
    RunspaceStateInfo, is_reusable,
};
pub use value::{ErrorItem, ErrorOrigin, ErrorRecord, PsItem, PsValue};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Runspace pool is closed")]
    PoolClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Runspace broken: {0}")]
    SessionBroken(String),

    #[error("Runspace disconnected: {0}")]
    SessionDisconnected(String),

    #[error("Pipeline failed: {0}")]
    PipelineFailed(String),

    #[error("Remote error: {0}")]
    Remote(ErrorRecord),

    #[error("Dirty pipeline: {0}")]
    DirtyPipeline(String),

    #[error("Failed to reset runspace: {0}")]
    Reset(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Transport-level failures invalidate the runspace they happened on.
    /// Remote application errors never do.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PoolError::SessionBroken(_)
                | PoolError::SessionDisconnected(_)
                | PoolError::Reset(_)
                | PoolError::Io(_)
        )
    }

    /// Lease could not complete, the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Cancelled | PoolError::Timeout(_))
    }
}

impl From<ErrorRecord> for PoolError {
    fn from(record: ErrorRecord) -> Self {
        PoolError::Remote(record)
    }
}
