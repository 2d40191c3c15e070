//! Scriptable in-memory runspaces for exercising the pool and the adapter
//! without a remote host.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use futures::{StreamExt, channel::mpsc};
use ironposh_pool_core::{
    ConnectionInfo, ErrorItem, ErrorRecord, PipelineSpec, PipelineStateInfo, PoolError,
    PsInvocationState, PsValue, RunspaceAvailability, RunspaceId, RunspaceState,
    RunspaceStateInfo,
};

use crate::{
    PipelineData, PipelineExecution, PipelineInputWriter, PipelineReader, PipelineWriter, Runspace,
    RunspaceFactory, StateStream, StateWatch, pipeline_channel,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One thing a mock pipeline does when started, in order.
///
/// Output and errors listed after a terminal state are written only when a
/// subscriber receives that state, so they reach the reader after it.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Output(PsValue),
    Error(ErrorItem),
    State(PipelineStateInfo),
}

impl ScriptStep {
    pub fn output(value: impl Into<PsValue>) -> Self {
        Self::Output(value.into())
    }

    pub fn error(message: &str) -> Self {
        Self::Error(ErrorItem::Record(ErrorRecord::remote(message)))
    }

    pub fn completed() -> Self {
        Self::State(PsInvocationState::Completed.into())
    }

    pub fn failed(reason: &str) -> Self {
        Self::State(PipelineStateInfo::with_reason(PsInvocationState::Failed, reason))
    }
}

#[derive(Debug, Clone)]
struct Behavior {
    script: Vec<ScriptStep>,
    fail_open: Option<String>,
    fail_reset: Option<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            script: vec![ScriptStep::completed()],
            fail_open: None,
            fail_reset: None,
        }
    }
}

#[derive(Clone)]
struct CurrentPipeline {
    state: StateWatch<PipelineStateInfo>,
    writer: PipelineWriter,
}

struct MockInner {
    id: RunspaceId,
    state: StateWatch<RunspaceStateInfo>,
    availability: StateWatch<RunspaceAvailability>,
    behavior: Mutex<Behavior>,
    variables: Mutex<BTreeMap<String, PsValue>>,
    current: Mutex<Option<CurrentPipeline>>,
    input: Mutex<Option<mpsc::Receiver<PsValue>>>,
    opens: AtomicUsize,
    resets: AtomicUsize,
    stops: AtomicUsize,
    pipelines: AtomicUsize,
    closed: AtomicBool,
}

/// A runspace whose pipelines replay a fixed script synchronously on start.
///
/// A script without a terminal state leaves the pipeline running until the
/// test finishes it with [`MockRunspace::finish_current`] or it is stopped.
#[derive(Clone)]
pub struct MockRunspace {
    inner: Arc<MockInner>,
}

impl MockRunspace {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::default())
    }

    /// A runspace that is already open and available.
    pub fn opened() -> Self {
        let runspace = Self::new();
        runspace.inner.state.set(RunspaceState::Opened.into());
        runspace
            .inner
            .availability
            .set(RunspaceAvailability::Available);
        runspace
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            inner: Arc::new(MockInner {
                id: RunspaceId::new(),
                state: StateWatch::new(RunspaceState::BeforeOpen.into()),
                availability: StateWatch::new(RunspaceAvailability::None),
                behavior: Mutex::new(behavior),
                variables: Mutex::new(BTreeMap::new()),
                current: Mutex::new(None),
                input: Mutex::new(None),
                opens: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                pipelines: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_script(&self, script: Vec<ScriptStep>) {
        lock(&self.inner.behavior).script = script;
    }

    pub fn fail_open(&self, reason: &str) {
        lock(&self.inner.behavior).fail_open = Some(reason.to_owned());
    }

    pub fn fail_reset(&self, reason: &str) {
        lock(&self.inner.behavior).fail_reset = Some(reason.to_owned());
    }

    pub fn set_state(&self, state: RunspaceStateInfo) {
        self.inner.state.set(state);
    }

    pub fn set_availability(&self, availability: RunspaceAvailability) {
        self.inner.availability.set(availability);
    }

    /// Per-invocation context that a reset must clear.
    pub fn set_variable(&self, name: &str, value: impl Into<PsValue>) {
        lock(&self.inner.variables).insert(name.to_owned(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<PsValue> {
        lock(&self.inner.variables).get(name).cloned()
    }

    /// Pushes an item into the running pipeline's data channel.
    pub fn write_current(&self, data: PipelineData) -> Result<(), PoolError> {
        match lock(&self.inner.current).as_mut() {
            Some(current) => current.writer.try_write(data),
            None => Err(PoolError::InvalidState("no pipeline")),
        }
    }

    /// Moves the running pipeline to `state`, freeing the runspace first when
    /// the state is terminal.
    pub fn finish_current(&self, state: PipelineStateInfo) {
        let current = lock(&self.inner.current).clone();
        if let Some(current) = current {
            if state.state.is_terminal() {
                self.inner.availability.set(RunspaceAvailability::Available);
            }
            current.state.set(state);
        }
    }

    /// The receiving end of the last pipeline's input.
    pub fn take_input_receiver(&self) -> Option<mpsc::Receiver<PsValue>> {
        lock(&self.inner.input).take()
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.inner.resets.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }

    pub fn pipelines(&self) -> usize {
        self.inner.pipelines.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockRunspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Runspace for MockRunspace {
    type Execution = MockExecution;

    fn id(&self) -> RunspaceId {
        self.inner.id
    }

    fn state(&self) -> RunspaceStateInfo {
        self.inner.state.get()
    }

    fn availability(&self) -> RunspaceAvailability {
        self.inner.availability.get()
    }

    fn state_changes(&self) -> StateStream<RunspaceStateInfo> {
        self.inner.state.subscribe()
    }

    fn availability_changes(&self) -> StateStream<RunspaceAvailability> {
        self.inner.availability.subscribe()
    }

    fn open(&self) -> impl Future<Output = Result<(), PoolError>> + Send {
        let this = self.clone();
        async move {
            this.inner.opens.fetch_add(1, Ordering::SeqCst);
            this.inner.state.set(RunspaceState::Opening.into());

            let fail_open = lock(&this.inner.behavior).fail_open.clone();
            if let Some(reason) = fail_open {
                this.inner
                    .state
                    .set(RunspaceStateInfo::with_reason(RunspaceState::Broken, reason.clone()));
                return Err(PoolError::SessionBroken(reason));
            }

            this.inner.state.set(RunspaceState::Opened.into());
            this.inner.availability.set(RunspaceAvailability::Available);
            Ok(())
        }
    }

    fn reset(&self) -> impl Future<Output = Result<(), PoolError>> + Send {
        let this = self.clone();
        async move {
            this.inner.resets.fetch_add(1, Ordering::SeqCst);
            let fail_reset = lock(&this.inner.behavior).fail_reset.clone();
            if let Some(reason) = fail_reset {
                return Err(PoolError::Reset(reason));
            }
            lock(&this.inner.variables).clear();
            Ok(())
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.availability.set(RunspaceAvailability::None);
        self.inner.state.set(RunspaceState::Closed.into());
    }

    fn create_pipeline(&self, spec: PipelineSpec) -> Result<MockExecution, PoolError> {
        if self.inner.state.get().state.is_finished() {
            return Err(PoolError::InvalidState("runspace is not usable"));
        }

        self.inner.pipelines.fetch_add(1, Ordering::SeqCst);
        let (writer, reader) = pipeline_channel(64);
        let (input_tx, input_rx) = mpsc::channel(8);
        let state = StateWatch::new(PipelineStateInfo::from(PsInvocationState::NotStarted));

        *lock(&self.inner.input) = Some(input_rx);
        *lock(&self.inner.current) = Some(CurrentPipeline {
            state: state.clone(),
            writer: writer.clone(),
        });

        Ok(MockExecution {
            id: uuid::Uuid::new_v4(),
            spec,
            runspace: self.clone(),
            state,
            writer,
            reader: Some(reader),
            input: Some(input_tx),
            late: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

pub struct MockExecution {
    id: uuid::Uuid,
    spec: PipelineSpec,
    runspace: MockRunspace,
    state: StateWatch<PipelineStateInfo>,
    writer: PipelineWriter,
    reader: Option<PipelineReader>,
    input: Option<PipelineInputWriter>,
    late: Arc<Mutex<Vec<PipelineData>>>,
}

impl MockExecution {
    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }
}

impl PipelineExecution for MockExecution {
    fn id(&self) -> uuid::Uuid {
        self.id
    }

    fn state(&self) -> PipelineStateInfo {
        self.state.get()
    }

    fn state_changes(&self) -> StateStream<PipelineStateInfo> {
        let late = Arc::clone(&self.late);
        let mut writer = self.writer.clone();
        self.state
            .subscribe()
            .inspect(move |info| {
                if info.state.is_terminal() {
                    for data in lock(&late).drain(..) {
                        let _ = writer.try_write(data);
                    }
                }
            })
            .boxed()
    }

    fn take_reader(&mut self) -> Option<PipelineReader> {
        self.reader.take()
    }

    fn take_input(&mut self) -> Option<PipelineInputWriter> {
        self.input.take()
    }

    fn start(&mut self) -> Result<(), PoolError> {
        if self.state.get().state != PsInvocationState::NotStarted {
            return Err(PoolError::InvalidState("pipeline already started"));
        }

        let runspace = &self.runspace.inner;
        runspace.availability.set(RunspaceAvailability::Busy);
        self.state.set(PsInvocationState::Running.into());

        let script = lock(&runspace.behavior).script.clone();
        let mut terminal = false;
        for step in script {
            let data = match step {
                ScriptStep::Output(value) => PipelineData::Output(value),
                ScriptStep::Error(item) => PipelineData::Error(item),
                ScriptStep::State(info) => {
                    if info.state.is_terminal() {
                        terminal = true;
                        runspace.availability.set(RunspaceAvailability::Available);
                    }
                    self.state.set(info);
                    continue;
                }
            };

            if terminal {
                lock(&self.late).push(data);
            } else {
                self.writer.try_write(data)?;
            }
        }

        Ok(())
    }

    fn request_stop(&self) {
        self.runspace.inner.stops.fetch_add(1, Ordering::SeqCst);
        if self.state.get().state.is_terminal() {
            return;
        }

        self.state.set(PsInvocationState::Stopping.into());
        self.runspace
            .inner
            .availability
            .set(RunspaceAvailability::Available);
        self.state.set(PsInvocationState::Stopped.into());
    }
}

#[derive(Default)]
struct FactoryInner {
    created: Mutex<Vec<MockRunspace>>,
    template: Mutex<Behavior>,
    fail_create: AtomicBool,
}

/// Creates [`MockRunspace`]s and keeps a handle to each one.
#[derive(Clone, Default)]
pub struct MockFactory {
    inner: Arc<FactoryInner>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every runspace created from now on replays `script`.
    pub fn with_script(self, script: Vec<ScriptStep>) -> Self {
        lock(&self.inner.template).script = script;
        self
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.inner.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<MockRunspace> {
        lock(&self.inner.created).clone()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.inner.created).len()
    }
}

impl RunspaceFactory for MockFactory {
    type Runspace = MockRunspace;

    fn create(&self, _connection: &ConnectionInfo) -> Result<MockRunspace, PoolError> {
        if self.inner.fail_create.load(Ordering::SeqCst) {
            return Err(PoolError::SessionBroken("factory refused".into()));
        }

        let runspace = MockRunspace::with_behavior(lock(&self.inner.template).clone());
        lock(&self.inner.created).push(runspace.clone());
        Ok(runspace)
    }
}
