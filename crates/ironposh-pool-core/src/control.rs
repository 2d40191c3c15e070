//! Control plane of a single pipeline execution.
//!
//! The runspace state, runspace availability and pipeline state arrive as
//! three independent event sources. The adapter keeps the latest value of
//! each in a [`ControlSnapshot`] and feeds every change through
//! [`ControlMachine::step`], which is the only place deciding when to open the
//! runspace, start the pipeline, or finish the stream.

use tracing::debug;

use crate::{
    PipelineStateInfo, PoolError, PsInvocationState, RunspaceAvailability, RunspaceState,
    RunspaceStateInfo,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub runspace: RunspaceStateInfo,
    pub availability: RunspaceAvailability,
    pub pipeline: PipelineStateInfo,
}

impl ControlSnapshot {
    pub fn new(
        runspace: RunspaceStateInfo,
        availability: RunspaceAvailability,
        pipeline: PipelineStateInfo,
    ) -> Self {
        Self {
            runspace,
            availability,
            pipeline,
        }
    }
}

#[derive(Debug)]
pub enum ControlAction {
    /// Begin opening the runspace.
    Open,
    /// Start the pipeline on the now available runspace.
    Start,
    /// End the stream gracefully.
    Complete,
    /// End the stream with an error.
    Fail(PoolError),
    /// Nothing to do until the next event.
    Wait,
}

#[derive(Debug, Default)]
pub struct ControlMachine {
    open_requested: bool,
    started: bool,
    finished: bool,
}

impl ControlMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn step(&mut self, snapshot: &ControlSnapshot) -> ControlAction {
        if self.finished {
            return ControlAction::Wait;
        }

        let action = self.decide(snapshot);

        match &action {
            ControlAction::Open => self.open_requested = true,
            ControlAction::Start => self.started = true,
            ControlAction::Complete | ControlAction::Fail(_) => self.finished = true,
            ControlAction::Wait => {}
        }

        debug!(
            runspace = ?snapshot.runspace.state,
            availability = ?snapshot.availability,
            pipeline = ?snapshot.pipeline.state,
            ?action,
            "control step"
        );

        action
    }

    fn decide(&self, snapshot: &ControlSnapshot) -> ControlAction {
        match snapshot.pipeline.state {
            PsInvocationState::Completed | PsInvocationState::Stopped => {
                return ControlAction::Complete;
            }
            PsInvocationState::Failed => {
                return ControlAction::Fail(PoolError::PipelineFailed(
                    snapshot.pipeline.reason_or("pipeline failed"),
                ));
            }
            PsInvocationState::Disconnected => {
                return ControlAction::Fail(PoolError::SessionDisconnected(
                    snapshot.pipeline.reason_or("pipeline disconnected"),
                ));
            }
            PsInvocationState::NotStarted
            | PsInvocationState::Running
            | PsInvocationState::Stopping => {}
        }

        match (snapshot.runspace.state, snapshot.availability) {
            (RunspaceState::Broken, _) => ControlAction::Fail(PoolError::SessionBroken(
                snapshot.runspace.reason_or("runspace broken"),
            )),
            (RunspaceState::Disconnected, _) => ControlAction::Fail(
                PoolError::SessionDisconnected(snapshot.runspace.reason_or("runspace disconnected")),
            ),
            (RunspaceState::Closed, _) => ControlAction::Complete,
            (RunspaceState::BeforeOpen, RunspaceAvailability::None) if !self.open_requested => {
                ControlAction::Open
            }
            (RunspaceState::Opened, RunspaceAvailability::Available)
                if snapshot.pipeline.state == PsInvocationState::NotStarted && !self.started =>
            {
                ControlAction::Start
            }
            _ => ControlAction::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn snapshot(
        runspace: RunspaceState,
        availability: RunspaceAvailability,
        pipeline: PsInvocationState,
    ) -> ControlSnapshot {
        ControlSnapshot::new(runspace.into(), availability, pipeline.into())
    }

    #[test]
    #[traced_test]
    fn test_open_then_start_once() {
        let mut machine = ControlMachine::new();

        let before_open = snapshot(
            RunspaceState::BeforeOpen,
            RunspaceAvailability::None,
            PsInvocationState::NotStarted,
        );
        assert!(matches!(machine.step(&before_open), ControlAction::Open));
        // a repeated event must not open twice
        assert!(matches!(machine.step(&before_open), ControlAction::Wait));

        let opening = snapshot(
            RunspaceState::Opening,
            RunspaceAvailability::None,
            PsInvocationState::NotStarted,
        );
        assert!(matches!(machine.step(&opening), ControlAction::Wait));

        let available = snapshot(
            RunspaceState::Opened,
            RunspaceAvailability::Available,
            PsInvocationState::NotStarted,
        );
        assert!(matches!(machine.step(&available), ControlAction::Start));
        assert!(matches!(machine.step(&available), ControlAction::Wait));
        assert!(machine.started());

        assert!(logs_contain("control step"));
    }

    #[test]
    fn test_start_on_already_open_runspace() {
        let mut machine = ControlMachine::new();
        let available = snapshot(
            RunspaceState::Opened,
            RunspaceAvailability::Available,
            PsInvocationState::NotStarted,
        );
        assert!(matches!(machine.step(&available), ControlAction::Start));
    }

    #[test]
    fn test_busy_runspace_waits() {
        let mut machine = ControlMachine::new();
        let busy = snapshot(
            RunspaceState::Opened,
            RunspaceAvailability::Busy,
            PsInvocationState::NotStarted,
        );
        assert!(matches!(machine.step(&busy), ControlAction::Wait));
    }

    #[test]
    fn test_terminal_pipeline_states() {
        for state in [PsInvocationState::Completed, PsInvocationState::Stopped] {
            let mut machine = ControlMachine::new();
            let s = snapshot(RunspaceState::Opened, RunspaceAvailability::Busy, state);
            assert!(matches!(machine.step(&s), ControlAction::Complete));
            assert!(machine.finished());
        }

        let mut machine = ControlMachine::new();
        let failed = ControlSnapshot::new(
            RunspaceState::Opened.into(),
            RunspaceAvailability::Busy,
            PipelineStateInfo::with_reason(PsInvocationState::Failed, "The term 'Get-Foo' is not recognized"),
        );
        match machine.step(&failed) {
            ControlAction::Fail(PoolError::PipelineFailed(reason)) => {
                assert_eq!(reason, "The term 'Get-Foo' is not recognized");
            }
            other => panic!("expected PipelineFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_state_wins_over_runspace_state() {
        let mut machine = ControlMachine::new();
        let s = snapshot(
            RunspaceState::Broken,
            RunspaceAvailability::None,
            PsInvocationState::Completed,
        );
        assert!(matches!(machine.step(&s), ControlAction::Complete));
    }

    #[test]
    fn test_transport_failures() {
        let mut machine = ControlMachine::new();
        let broken = ControlSnapshot::new(
            RunspaceStateInfo::with_reason(RunspaceState::Broken, "connection reset"),
            RunspaceAvailability::None,
            PsInvocationState::Running.into(),
        );
        assert!(matches!(
            machine.step(&broken),
            ControlAction::Fail(PoolError::SessionBroken(reason)) if reason == "connection reset"
        ));

        let mut machine = ControlMachine::new();
        let disconnected = snapshot(
            RunspaceState::Disconnected,
            RunspaceAvailability::None,
            PsInvocationState::Running,
        );
        assert!(matches!(
            machine.step(&disconnected),
            ControlAction::Fail(PoolError::SessionDisconnected(_))
        ));
    }

    #[test]
    fn test_closed_runspace_completes_gracefully() {
        let mut machine = ControlMachine::new();
        let closed = snapshot(
            RunspaceState::Closed,
            RunspaceAvailability::None,
            PsInvocationState::NotStarted,
        );
        assert!(matches!(machine.step(&closed), ControlAction::Complete));
    }

    #[test]
    fn test_finished_machine_ignores_later_events() {
        let mut machine = ControlMachine::new();
        let completed = snapshot(
            RunspaceState::Opened,
            RunspaceAvailability::Available,
            PsInvocationState::Completed,
        );
        assert!(matches!(machine.step(&completed), ControlAction::Complete));

        let failed = snapshot(
            RunspaceState::Opened,
            RunspaceAvailability::Available,
            PsInvocationState::Failed,
        );
        assert!(matches!(machine.step(&failed), ControlAction::Wait));
    }

    #[test]
    fn test_running_and_stopping_wait() {
        let mut machine = ControlMachine::new();
        for state in [PsInvocationState::Running, PsInvocationState::Stopping] {
            let s = snapshot(RunspaceState::Opened, RunspaceAvailability::Busy, state);
            assert!(matches!(machine.step(&s), ControlAction::Wait));
        }
    }
}
