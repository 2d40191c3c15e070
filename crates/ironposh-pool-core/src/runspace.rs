use std::fmt::Display;

/// Identity of a runspace inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunspaceId(uuid::Uuid);

impl RunspaceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn inner(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for RunspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<uuid::Uuid> for RunspaceId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Display for RunspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a single runspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunspaceState {
    BeforeOpen,
    Opening,
    Connecting,
    Opened,
    Disconnected,
    Broken,
    Closing,
    Closed,
}

impl RunspaceState {
    /// The runspace can never run another pipeline.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RunspaceState::Disconnected
                | RunspaceState::Broken
                | RunspaceState::Closing
                | RunspaceState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunspaceAvailability {
    None,
    Busy,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunspaceStateInfo {
    pub state: RunspaceState,
    pub reason: Option<String>,
}

impl RunspaceStateInfo {
    pub fn new(state: RunspaceState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn with_reason(state: RunspaceState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: Some(reason.into()),
        }
    }

    pub(crate) fn reason_or(&self, fallback: &str) -> String {
        self.reason.clone().unwrap_or_else(|| fallback.to_owned())
    }
}

impl From<RunspaceState> for RunspaceStateInfo {
    fn from(state: RunspaceState) -> Self {
        Self::new(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PsInvocationState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Completed = 4,
    Failed = 5,
    Disconnected = 6,
}

impl PsInvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PsInvocationState::Stopped
                | PsInvocationState::Completed
                | PsInvocationState::Failed
                | PsInvocationState::Disconnected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStateInfo {
    pub state: PsInvocationState,
    pub reason: Option<String>,
}

impl PipelineStateInfo {
    pub fn new(state: PsInvocationState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn with_reason(state: PsInvocationState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: Some(reason.into()),
        }
    }

    pub(crate) fn reason_or(&self, fallback: &str) -> String {
        self.reason.clone().unwrap_or_else(|| fallback.to_owned())
    }
}

impl From<PsInvocationState> for PipelineStateInfo {
    fn from(state: PsInvocationState) -> Self {
        Self::new(state)
    }
}

/// A runspace may go back to the idle set only when it is open and idle, or
/// when it was never opened.
pub fn is_reusable(state: RunspaceState, availability: RunspaceAvailability) -> bool {
    match state {
        RunspaceState::BeforeOpen => true,
        RunspaceState::Opened => availability == RunspaceAvailability::Available,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reusable_states() {
        assert!(is_reusable(
            RunspaceState::BeforeOpen,
            RunspaceAvailability::None
        ));
        assert!(is_reusable(
            RunspaceState::Opened,
            RunspaceAvailability::Available
        ));

        assert!(!is_reusable(RunspaceState::Opened, RunspaceAvailability::Busy));
        assert!(!is_reusable(RunspaceState::Opened, RunspaceAvailability::None));
        assert!(!is_reusable(
            RunspaceState::Opening,
            RunspaceAvailability::None
        ));
        assert!(!is_reusable(
            RunspaceState::Broken,
            RunspaceAvailability::Available
        ));
        assert!(!is_reusable(
            RunspaceState::Closed,
            RunspaceAvailability::None
        ));
    }

    #[test]
    fn test_terminal_invocation_states() {
        let terminal: Vec<_> = [
            PsInvocationState::NotStarted,
            PsInvocationState::Running,
            PsInvocationState::Stopping,
            PsInvocationState::Stopped,
            PsInvocationState::Completed,
            PsInvocationState::Failed,
            PsInvocationState::Disconnected,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();

        assert_eq!(
            terminal,
            vec![
                PsInvocationState::Stopped,
                PsInvocationState::Completed,
                PsInvocationState::Failed,
                PsInvocationState::Disconnected,
            ]
        );
    }
}
