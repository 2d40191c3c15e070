use async_stream::stream;
use futures::{
    FutureExt, Stream, StreamExt,
    future::{BoxFuture, Fuse},
    stream::{BoxStream, select_all},
};
use ironposh_pool_core::{
    ControlAction, ControlMachine, ControlSnapshot, ErrorRecord, PipelineCommand, PipelineSpec,
    PipelineStateInfo, PoolError, PsItem, PsValue, RunspaceAvailability, RunspaceStateInfo,
};
use tracing::{Instrument, Span, debug, info, instrument, warn};

use crate::{
    ErrorPolicy, InvocationContext, LeasedRunspace, PipelineData, PipelineExecution,
    PipelineInputWriter, PsItemStream, Runspace,
};

/// A pipeline specification plus the optional stream fed to its first command.
pub struct Pipeline {
    pub spec: PipelineSpec,
    input: Option<BoxStream<'static, PsValue>>,
}

impl Pipeline {
    pub fn new(spec: impl Into<PipelineSpec>) -> Self {
        Self {
            spec: spec.into(),
            input: None,
        }
    }

    #[must_use]
    pub fn with_input<S>(mut self, input: S) -> Self
    where
        S: Stream<Item = PsValue> + Send + 'static,
    {
        self.input = Some(input.boxed());
        self
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("spec", &self.spec)
            .field("has_input", &self.input.is_some())
            .finish()
    }
}

impl From<PipelineSpec> for Pipeline {
    fn from(spec: PipelineSpec) -> Self {
        Self::new(spec)
    }
}

impl From<PipelineCommand> for Pipeline {
    fn from(command: PipelineCommand) -> Self {
        Self::new(command)
    }
}

impl From<&str> for Pipeline {
    fn from(script: &str) -> Self {
        Self::new(PipelineCommand::new_script(script))
    }
}

/// Runs `pipeline` on a leased runspace and returns its result stream with
/// `policy` applied.
///
/// The stream opens the runspace if needed, starts the pipeline once the
/// runspace is available, and releases the lease before it ends. Dropping the
/// stream early stops the pipeline and then returns the lease. The timeout is
/// counted from the first poll.
#[instrument(skip_all, fields(runspace = %lease.id(), policy = ?policy))]
pub fn run_pipeline<R: Runspace>(
    lease: LeasedRunspace<R>,
    pipeline: impl Into<Pipeline>,
    policy: ErrorPolicy,
    ctx: &InvocationContext,
) -> PsItemStream {
    let pipeline = pipeline.into();
    let ctx = ctx.clone();
    let span = Span::current();

    let items = Box::pin(stream! {
        let interrupt = ctx.interrupt(pipeline.spec.timeout);
        let mut items = interruptible(execute(lease, pipeline), interrupt);
        while let Some(item) = items.next().instrument(span.clone()).await {
            yield item;
        }
    });

    policy.apply(items)
}

/// Ends `inner` with the interrupt's error as soon as the interrupt fires.
/// `inner` is dropped first so its cleanup runs before the error is seen.
pub(crate) fn interruptible(
    inner: PsItemStream,
    mut interrupt: Fuse<BoxFuture<'static, PoolError>>,
) -> PsItemStream {
    Box::pin(stream! {
        let mut inner = inner.fuse();
        loop {
            let next = futures::select_biased! {
                reason = interrupt => Err(reason),
                item = inner.next() => Ok(item),
            };

            match next {
                Ok(Some(item)) => yield item,
                Ok(None) => break,
                Err(reason) => {
                    drop(inner);
                    warn!(target: "pipeline", error = %reason, "pipeline interrupted");
                    yield Err(reason);
                    break;
                }
            }
        }
    })
}

enum ControlEvent {
    Runspace(RunspaceStateInfo),
    Availability(RunspaceAvailability),
    Pipeline(PipelineStateInfo),
}

enum Step {
    Control(ControlEvent),
    Data(PipelineData),
    InputDone,
    Exhausted,
}

/// Owns everything an execution holds. Dropping it before the pipeline
/// finished closes input, stops the pipeline and only then returns the lease.
struct ExecutionGuard<R: Runspace> {
    lease: Option<LeasedRunspace<R>>,
    execution: R::Execution,
    input_pump: Fuse<BoxFuture<'static, ()>>,
    started: bool,
    finished: bool,
}

impl<R: Runspace> ExecutionGuard<R> {
    fn lease(&self) -> Result<&LeasedRunspace<R>, PoolError> {
        self.lease
            .as_ref()
            .ok_or(PoolError::InvalidState("runspace already released"))
    }

    async fn finish(&mut self, retire: bool) {
        self.finished = true;
        self.input_pump = Fuse::terminated();
        if let Some(mut lease) = self.lease.take() {
            if retire {
                lease.retire();
            }
            lease.release().await;
        }
    }
}

impl<R: Runspace> Drop for ExecutionGuard<R> {
    fn drop(&mut self) {
        self.input_pump = Fuse::terminated();

        if self.started && !self.finished && !self.execution.state().state.is_terminal() {
            debug!(target: "pipeline", pipeline_id = %self.execution.id(), "stopping abandoned pipeline");
            self.execution.request_stop();
        }

        drop(self.lease.take());
    }
}

fn input_pump(
    input: Option<BoxStream<'static, PsValue>>,
    writer: Option<PipelineInputWriter>,
) -> Result<Fuse<BoxFuture<'static, ()>>, PoolError> {
    match (input, writer) {
        (Some(input), Some(writer)) => Ok(input
            .map(Ok)
            .forward(writer)
            .map(|_| ())
            .boxed()
            .fuse()),
        (Some(_), None) => Err(PoolError::InvalidState("pipeline does not accept input")),
        // no input: dropping the writer closes the pipeline's input
        (None, _) => Ok(Fuse::terminated()),
    }
}

/// The unguarded execution stream: open, start, merge data with control
/// events, finish.
pub(crate) fn execute<R: Runspace>(lease: LeasedRunspace<R>, pipeline: Pipeline) -> PsItemStream {
    Box::pin(stream! {
        let Pipeline { spec, input } = pipeline;
        let commands = spec.len();

        let mut execution = match lease.create_pipeline(spec) {
            Ok(execution) => execution,
            Err(e) => {
                warn!(target: "pipeline", error = %e, "failed to create pipeline");
                yield Err(e);
                return;
            }
        };

        let Some(mut reader) = execution.take_reader() else {
            yield Err(PoolError::InvalidState("pipeline reader already taken"));
            return;
        };

        let input_pump = match input_pump(input, execution.take_input()) {
            Ok(pump) => pump,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        info!(
            target: "pipeline",
            pipeline_id = %execution.id(),
            runspace_id = %lease.id(),
            commands,
            "executing pipeline"
        );

        let mut events = select_all([
            lease.state_changes().map(ControlEvent::Runspace).boxed(),
            lease.availability_changes().map(ControlEvent::Availability).boxed(),
            execution.state_changes().map(ControlEvent::Pipeline).boxed(),
        ]);

        let mut snapshot = ControlSnapshot::new(lease.state(), lease.availability(), execution.state());
        let mut machine = ControlMachine::new();

        let mut guard = ExecutionGuard::<R> {
            lease: Some(lease),
            execution,
            input_pump,
            started: false,
            finished: false,
        };

        loop {
            // queued data wins ties, so everything written before a terminal
            // state has been read by the time that state is acted on
            let step = futures::select_biased! {
                data = reader.select_next_some() => Step::Data(data),
                event = events.select_next_some() => Step::Control(event),
                () = &mut guard.input_pump => Step::InputDone,
                complete => Step::Exhausted,
            };

            let event = match step {
                Step::Control(event) => event,
                Step::Data(data) => {
                    yield Ok(PsItem::from(data));
                    continue;
                }
                Step::InputDone => {
                    debug!(target: "pipeline", "pipeline input exhausted");
                    continue;
                }
                Step::Exhausted => {
                    guard.finish(true).await;
                    yield Err(PoolError::InvalidState("execution ended without a terminal state"));
                    return;
                }
            };

            match event {
                ControlEvent::Runspace(info) => snapshot.runspace = info,
                ControlEvent::Availability(availability) => snapshot.availability = availability,
                ControlEvent::Pipeline(info) => snapshot.pipeline = info,
            }

            match machine.step(&snapshot) {
                ControlAction::Wait => {}
                ControlAction::Open => {
                    let opened = match guard.lease() {
                        Ok(lease) => lease.open().await,
                        Err(e) => Err(e),
                    };

                    if let Err(e) = opened {
                        warn!(target: "pipeline", error = %e, "failed to open runspace");
                        guard.finish(true).await;
                        yield Err(e);
                        return;
                    }
                }
                ControlAction::Start => {
                    guard.started = true;
                    if let Err(e) = guard.execution.start() {
                        warn!(target: "pipeline", error = %e, "failed to start pipeline");
                        guard.finish(e.is_transport()).await;
                        yield Err(e);
                        return;
                    }
                }
                ControlAction::Complete => {
                    // anything still queued reached the reader after the
                    // terminal state did
                    let mut unread_errors = 0;
                    while let Some(Some(data)) = reader.next().now_or_never() {
                        if data.is_error() {
                            unread_errors += 1;
                        }
                        yield Ok(PsItem::from(data));
                    }

                    if unread_errors > 0 {
                        warn!(target: "pipeline", unread_errors, "pipeline completed with unread errors");
                        yield Ok(PsItem::Error(ErrorRecord::dirty_pipeline(unread_errors)));
                    }

                    guard.finish(false).await;
                    info!(target: "pipeline", state = ?snapshot.pipeline.state, "pipeline completed");
                    return;
                }
                ControlAction::Fail(e) => {
                    while let Some(Some(data)) = reader.next().now_or_never() {
                        yield Ok(PsItem::from(data));
                    }

                    warn!(target: "pipeline", error = %e, "pipeline failed");
                    guard.finish(e.is_transport()).await;
                    yield Err(e);
                    return;
                }
            }
        }
    })
}
