use std::{
    collections::BTreeMap,
    future::Future,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{StreamExt, channel::mpsc};
use ironposh_pool_async::{
    PipelineExecution, PipelineInputWriter, PipelineReader, PipelineWriter, Runspace,
    RunspaceFactory, StateStream, StateWatch, pipeline_channel,
};
use ironposh_pool_core::{
    ConnectionInfo, ErrorRecord, Parameter, PipelineCommand, PipelineSpec, PipelineStateInfo,
    PoolError, PsInvocationState, PsValue, RunspaceAvailability, RunspaceId, RunspaceState,
    RunspaceStateInfo,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const DATA_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The shell a [`ProcessRunspace`] runs its pipelines in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ShellDialect {
    /// POSIX `sh -c`.
    #[default]
    Sh,
    /// PowerShell 7 `pwsh -Command`.
    Pwsh,
}

impl ShellDialect {
    pub fn program(self) -> &'static str {
        match self {
            Self::Sh => "sh",
            Self::Pwsh => "pwsh",
        }
    }

    pub fn args(self, line: &str) -> Vec<String> {
        match self {
            Self::Sh => vec!["-c".to_owned(), line.to_owned()],
            Self::Pwsh => ["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", line]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Quotes `text` as a single literal word, leaving plain words untouched.
    pub fn quote(self, text: &str) -> String {
        match self {
            Self::Sh => {
                let plain = !text.is_empty()
                    && text
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
                if plain {
                    text.to_owned()
                } else {
                    format!("'{}'", text.replace('\'', r"'\''"))
                }
            }
            Self::Pwsh => {
                let plain = !text.is_empty()
                    && !text.starts_with('-')
                    && text
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || "-_./:\\".contains(c));
                if plain {
                    text.to_owned()
                } else {
                    format!("'{}'", text.replace('\'', "''"))
                }
            }
        }
    }

    pub fn render_value(self, value: &PsValue) -> String {
        match (self, value) {
            (Self::Sh, PsValue::Null) => "''".to_owned(),
            (Self::Pwsh, PsValue::Null) => "$null".to_owned(),
            (Self::Sh, PsValue::Bool(b)) => b.to_string(),
            (Self::Pwsh, PsValue::Bool(true)) => "$true".to_owned(),
            (Self::Pwsh, PsValue::Bool(false)) => "$false".to_owned(),
            (_, PsValue::Int(_) | PsValue::Float(_)) => value.to_string(),
            (_, PsValue::String(s)) => self.quote(s),
            (Self::Sh, PsValue::Array(items)) => items
                .iter()
                .map(|item| self.render_value(item))
                .collect::<Vec<_>>()
                .join(" "),
            (Self::Pwsh, PsValue::Array(items)) if items.is_empty() => "@()".to_owned(),
            (Self::Pwsh, PsValue::Array(items)) => items
                .iter()
                .map(|item| self.render_value(item))
                .collect::<Vec<_>>()
                .join(","),
            (_, PsValue::Object(_)) => self.quote(&value.to_string()),
        }
    }

    fn command_name(self, name: &str) -> String {
        let quoted = self.quote(name);
        match self {
            Self::Pwsh if quoted != name => format!("& {quoted}"),
            _ => quoted,
        }
    }

    /// Renders one stage. Script stages are passed through verbatim, with any
    /// parameters appended.
    pub fn render_command(self, command: &PipelineCommand) -> String {
        let mut parts = vec![if command.is_script {
            command.command_text.clone()
        } else {
            self.command_name(&command.command_text)
        }];

        for parameter in &command.parameters {
            match parameter {
                Parameter::Named { name, value } => {
                    parts.push(format!("-{name}"));
                    parts.push(self.render_value(value));
                }
                Parameter::Positional { value } => parts.push(self.render_value(value)),
                Parameter::Switch { name, value: true } => parts.push(format!("-{name}")),
                Parameter::Switch { name, value: false } => {
                    if self == Self::Pwsh {
                        parts.push(format!("-{name}:$false"));
                    }
                }
            }
        }

        parts.join(" ")
    }

    /// Renders the whole pipeline as one shell line, `a | b | c`.
    pub fn render(self, spec: &PipelineSpec) -> String {
        spec.commands
            .iter()
            .map(|command| self.render_command(command))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn export(self, name: &str, value: &str) -> String {
        match self {
            Self::Sh => format!("export {name}={}; ", self.quote(value)),
            Self::Pwsh => format!("$env:{name} = {}; ", Self::Pwsh.quote(value)),
        }
    }
}

struct RunspaceInner {
    id: RunspaceId,
    connection: ConnectionInfo,
    dialect: ShellDialect,
    state: StateWatch<RunspaceStateInfo>,
    availability: StateWatch<RunspaceAvailability>,
    variables: Mutex<BTreeMap<String, String>>,
    /// The pipeline currently holding the runspace busy.
    active: Mutex<Option<uuid::Uuid>>,
}

/// A runspace backed by shell processes, one per pipeline, either local or
/// reached through `ssh`.
#[derive(Clone)]
pub struct ProcessRunspace {
    inner: Arc<RunspaceInner>,
}

impl ProcessRunspace {
    pub fn new(connection: ConnectionInfo, dialect: ShellDialect) -> Self {
        Self {
            inner: Arc::new(RunspaceInner {
                id: RunspaceId::new(),
                connection,
                dialect,
                state: StateWatch::new(RunspaceState::BeforeOpen.into()),
                availability: StateWatch::new(RunspaceAvailability::None),
                variables: Mutex::new(BTreeMap::new()),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.inner.connection
    }

    pub fn dialect(&self) -> ShellDialect {
        self.inner.dialect
    }

    /// Sets a variable exported to every following pipeline until the next reset.
    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.inner.variables).insert(name.into(), value.into());
    }

    pub fn variables(&self) -> BTreeMap<String, String> {
        lock(&self.inner.variables).clone()
    }

    fn program(&self) -> &'static str {
        match self.inner.connection {
            ConnectionInfo::Local => self.inner.dialect.program(),
            ConnectionInfo::Ssh { .. } => "ssh",
        }
    }

    fn command(&self, line: &str) -> Command {
        let variables = self.variables();
        let dialect = self.inner.dialect;

        let mut command = match &self.inner.connection {
            ConnectionInfo::Local => {
                let mut command = Command::new(dialect.program());
                command.args(dialect.args(line)).envs(&variables);
                command
            }
            ConnectionInfo::Ssh {
                host,
                user_name,
                key_file,
            } => {
                let mut command = Command::new("ssh");
                command.arg("-o").arg("BatchMode=yes");
                if let Some(key_file) = key_file {
                    command.arg("-i").arg(key_file);
                }
                command.arg(format!("{user_name}@{host}"));

                // the environment does not cross ssh, export it in the line
                let exports: String = variables
                    .iter()
                    .map(|(name, value)| dialect.export(name, value))
                    .collect();
                let remote_line = format!("{exports}{line}");
                let remote = std::iter::once(dialect.program().to_owned())
                    .chain(
                        dialect
                            .args(&remote_line)
                            .iter()
                            .map(|arg| ShellDialect::Sh.quote(arg)),
                    )
                    .collect::<Vec<_>>()
                    .join(" ");
                command.arg(remote);
                command
            }
        };

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn claim(&self, pipeline: uuid::Uuid) {
        *lock(&self.inner.active) = Some(pipeline);
        self.inner.availability.set(RunspaceAvailability::Busy);
    }

    /// Frees the runspace if `pipeline` still holds it.
    fn release_busy(&self, pipeline: uuid::Uuid) {
        {
            let mut active = lock(&self.inner.active);
            if *active != Some(pipeline) {
                return;
            }
            *active = None;
        }
        if self.inner.state.get().state == RunspaceState::Opened {
            self.inner.availability.set(RunspaceAvailability::Available);
        }
    }

    fn broken(&self, reason: String) -> PoolError {
        warn!(runspace_id = %self.inner.id, %reason, "runspace broken");
        self.inner
            .state
            .set(RunspaceStateInfo::with_reason(RunspaceState::Broken, reason.clone()));
        self.inner.availability.set(RunspaceAvailability::None);
        PoolError::SessionBroken(reason)
    }
}

impl std::fmt::Debug for ProcessRunspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunspace")
            .field("id", &self.inner.id)
            .field("connection", &self.inner.connection)
            .field("dialect", &self.inner.dialect)
            .field("state", &self.inner.state.get().state)
            .finish()
    }
}

impl Runspace for ProcessRunspace {
    type Execution = ProcessExecution;

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

    /// Starts the shell once; a runspace whose shell cannot start is broken.
    fn open(&self) -> impl Future<Output = Result<(), PoolError>> + Send {
        let this = self.clone();
        async move {
            let inner = &this.inner;
            if inner.state.get().state == RunspaceState::Opened {
                return Ok(());
            }

            inner.state.set(RunspaceState::Opening.into());
            debug!(runspace_id = %inner.id, connection = inner.connection.target(), "opening runspace");

            let mut check = this.command("exit 0");
            check.stdin(Stdio::null());
            match check.output().await {
                Ok(output) if output.status.success() => {
                    inner.state.set(RunspaceState::Opened.into());
                    inner.availability.set(RunspaceAvailability::Available);
                    info!(runspace_id = %inner.id, shell = this.program(), "runspace opened");
                    Ok(())
                }
                Ok(output) => Err(this.broken(format!(
                    "shell check exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ))),
                Err(e) => Err(this.broken(format!("failed to launch {}: {e}", this.program()))),
            }
        }
    }

    fn reset(&self) -> impl Future<Output = Result<(), PoolError>> + Send {
        let this = self.clone();
        async move {
            if this.inner.state.get().state.is_finished() {
                return Err(PoolError::Reset("runspace is no longer open".into()));
            }
            let cleared = std::mem::take(&mut *lock(&this.inner.variables));
            debug!(runspace_id = %this.inner.id, cleared = cleared.len(), "runspace reset");
            Ok(())
        }
    }

    fn close(&self) {
        self.inner.state.set(RunspaceState::Closing.into());
        *lock(&self.inner.active) = None;
        self.inner.availability.set(RunspaceAvailability::None);
        self.inner.state.set(RunspaceState::Closed.into());
        debug!(runspace_id = %self.inner.id, "runspace closed");
    }

    fn create_pipeline(&self, spec: PipelineSpec) -> Result<ProcessExecution, PoolError> {
        if self.inner.state.get().state.is_finished() {
            return Err(PoolError::InvalidState("runspace is not usable"));
        }
        if spec.is_empty() {
            return Err(PoolError::InvalidState("pipeline has no commands"));
        }

        let line = self.inner.dialect.render(&spec);
        let (writer, reader) = pipeline_channel(DATA_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);

        Ok(ProcessExecution {
            id: uuid::Uuid::new_v4(),
            line,
            runspace: self.clone(),
            state: StateWatch::new(PsInvocationState::NotStarted.into()),
            writer,
            reader: Some(reader),
            input_tx: Some(input_tx),
            input_rx: Some(input_rx),
            stop: CancellationToken::new(),
        })
    }
}

/// One shell process running a rendered pipeline.
pub struct ProcessExecution {
    id: uuid::Uuid,
    line: String,
    runspace: ProcessRunspace,
    state: StateWatch<PipelineStateInfo>,
    writer: PipelineWriter,
    reader: Option<PipelineReader>,
    input_tx: Option<PipelineInputWriter>,
    input_rx: Option<mpsc::Receiver<PsValue>>,
    stop: CancellationToken,
}

impl ProcessExecution {
    pub fn command_line(&self) -> &str {
        &self.line
    }
}

impl PipelineExecution for ProcessExecution {
    fn id(&self) -> uuid::Uuid {
        self.id
    }

    fn state(&self) -> PipelineStateInfo {
        self.state.get()
    }

    fn state_changes(&self) -> StateStream<PipelineStateInfo> {
        self.state.subscribe()
    }

    fn take_reader(&mut self) -> Option<PipelineReader> {
        self.reader.take()
    }

    fn take_input(&mut self) -> Option<PipelineInputWriter> {
        self.input_tx.take()
    }

    /// Spawns the process and a tokio task driving it. Must be called from
    /// within a tokio runtime.
    #[instrument(skip(self), fields(pipeline_id = %self.id, line = %self.line))]
    fn start(&mut self) -> Result<(), PoolError> {
        if self.state.get().state != PsInvocationState::NotStarted {
            return Err(PoolError::InvalidState("pipeline already started"));
        }

        let child = self.runspace.command(&self.line).spawn()?;
        self.runspace.claim(self.id);
        self.state.set(PsInvocationState::Running.into());
        info!(pid = child.id(), "pipeline process started");

        let driver = Driver {
            child,
            input: self.input_rx.take(),
            writer: self.writer.clone(),
            state: self.state.clone(),
            runspace: self.runspace.clone(),
            id: self.id,
            stop: self.stop.clone(),
        };
        tokio::spawn(driver.run());
        Ok(())
    }

    fn request_stop(&self) {
        match self.state.get().state {
            PsInvocationState::NotStarted => {
                self.state.set(PsInvocationState::Stopped.into());
            }
            PsInvocationState::Running => {
                debug!(pipeline_id = %self.id, "stopping pipeline process");
                self.state.set(PsInvocationState::Stopping.into());
                self.stop.cancel();
                // the runspace can take a new pipeline while this one is killed
                self.runspace.release_busy(self.id);
            }
            _ => {}
        }
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stopped,
}

struct Driver {
    child: Child,
    input: Option<mpsc::Receiver<PsValue>>,
    writer: PipelineWriter,
    state: StateWatch<PipelineStateInfo>,
    runspace: ProcessRunspace,
    id: uuid::Uuid,
    stop: CancellationToken,
}

impl Driver {
    async fn run(self) {
        let Driver {
            mut child,
            input,
            writer,
            state,
            runspace,
            id,
            stop,
        } = self;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let io = async move {
            // all output is written before the exit status is reported
            let exited = async {
                tokio::join!(
                    read_lines(stdout, writer.clone(), false),
                    read_lines(stderr, writer, true),
                );
                child.wait().await
            };
            tokio::pin!(exited);

            let feed = feed_stdin(stdin, input);
            tokio::pin!(feed);

            // a child that exits without reading its input does not wait for it
            tokio::select! {
                status = &mut exited => return status,
                () = &mut feed => {}
            }
            exited.await
        };

        // dropping `io` on stop kills the child
        let outcome = tokio::select! {
            status = io => Outcome::Exited(status),
            () = stop.cancelled() => Outcome::Stopped,
        };

        let final_state = match outcome {
            Outcome::Exited(Ok(status)) if status.success() => {
                PipelineStateInfo::new(PsInvocationState::Completed)
            }
            Outcome::Exited(Ok(status)) => PipelineStateInfo::with_reason(
                PsInvocationState::Failed,
                format!("process exited with {status}"),
            ),
            Outcome::Exited(Err(e)) => PipelineStateInfo::with_reason(
                PsInvocationState::Failed,
                format!("failed to wait for process: {e}"),
            ),
            Outcome::Stopped => PipelineStateInfo::new(PsInvocationState::Stopped),
        };

        debug!(pipeline_id = %id, state = ?final_state.state, reason = ?final_state.reason, "pipeline process finished");
        runspace.release_busy(id);
        state.set(final_state);
    }
}

async fn feed_stdin(stdin: Option<ChildStdin>, input: Option<mpsc::Receiver<PsValue>>) {
    let (Some(mut stdin), Some(mut input)) = (stdin, input) else {
        return;
    };

    while let Some(value) = input.next().await {
        if let Err(e) = stdin.write_all(format!("{value}\n").as_bytes()).await {
            debug!(error = %e, "process closed its input");
            break;
        }
    }
    // dropping stdin signals end of input
}

async fn read_lines<R>(pipe: Option<R>, mut writer: PipelineWriter, errors: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };

    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let written = if errors {
            writer.write_error(ErrorRecord::remote(line)).await
        } else {
            writer.write_output(line).await
        };
        if written.is_err() {
            break;
        }
    }
}

/// Creates [`ProcessRunspace`]s speaking one shell dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunspaceFactory {
    dialect: ShellDialect,
}

impl ProcessRunspaceFactory {
    pub fn new(dialect: ShellDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> ShellDialect {
        self.dialect
    }
}

impl RunspaceFactory for ProcessRunspaceFactory {
    type Runspace = ProcessRunspace;

    fn create(&self, connection: &ConnectionInfo) -> Result<ProcessRunspace, PoolError> {
        debug!(connection = connection.target(), dialect = ?self.dialect, "creating process runspace");
        Ok(ProcessRunspace::new(connection.clone(), self.dialect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_quoting() {
        assert_eq!(ShellDialect::Sh.quote("disk1.vhdx"), "disk1.vhdx");
        assert_eq!(ShellDialect::Sh.quote("two words"), "'two words'");
        assert_eq!(ShellDialect::Sh.quote("it's"), r"'it'\''s'");
        assert_eq!(ShellDialect::Sh.quote(""), "''");
        assert_eq!(ShellDialect::Sh.quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_pwsh_quoting() {
        assert_eq!(ShellDialect::Pwsh.quote("D:\\vm\\disk.vhdx"), "D:\\vm\\disk.vhdx");
        assert_eq!(ShellDialect::Pwsh.quote("it's"), "'it''s'");
        assert_eq!(ShellDialect::Pwsh.quote("-Force"), "'-Force'");
        assert_eq!(ShellDialect::Pwsh.quote("$env:PATH"), "'$env:PATH'");
    }

    #[test]
    fn test_render_structured_pipeline() {
        let spec = PipelineSpec::new()
            .with_command(
                PipelineCommand::new_command("Get-VHD")
                    .with_named("Path", "D:\\vm\\disk 1.vhdx")
                    .with_switch("Verbose"),
            )
            .with_command(PipelineCommand::new_command("Select-Object").with_positional("Size"));

        assert_eq!(
            ShellDialect::Pwsh.render(&spec),
            "Get-VHD -Path 'D:\\vm\\disk 1.vhdx' -Verbose | Select-Object Size"
        );
    }

    #[test]
    fn test_render_script_stages() {
        let spec = PipelineSpec::new()
            .with_command(PipelineCommand::new_script("printf 'a\\nb\\n'"))
            .with_command(PipelineCommand::new_command("sort").with_switch("r"));
        assert_eq!(ShellDialect::Sh.render(&spec), "printf 'a\\nb\\n' | sort -r");
    }

    #[test]
    fn test_render_values() {
        let pwsh = ShellDialect::Pwsh;
        assert_eq!(pwsh.render_value(&PsValue::Bool(true)), "$true");
        assert_eq!(pwsh.render_value(&PsValue::Null), "$null");
        assert_eq!(pwsh.render_value(&PsValue::from(vec!["a b", "c"])), "'a b',c");
        assert_eq!(pwsh.render_value(&PsValue::Array(vec![])), "@()");

        let sh = ShellDialect::Sh;
        assert_eq!(sh.render_value(&PsValue::Int(-3)), "-3");
        assert_eq!(sh.render_value(&PsValue::from(vec!["a b", "c"])), "'a b' c");
    }

    #[test]
    fn test_switch_false() {
        let command = PipelineCommand::new_command("Remove-Item").with_parameter(Parameter::Switch {
            name: "Recurse".into(),
            value: false,
        });
        assert_eq!(ShellDialect::Pwsh.render_command(&command), "Remove-Item -Recurse:$false");
        assert_eq!(ShellDialect::Sh.render_command(&command), "Remove-Item");
    }

    #[test]
    fn test_pwsh_command_name_with_spaces_is_invoked() {
        let command = PipelineCommand::new_command("C:\\Program Files\\tool.exe");
        assert_eq!(
            ShellDialect::Pwsh.render_command(&command),
            "& 'C:\\Program Files\\tool.exe'"
        );
    }

    #[test]
    fn test_ssh_line_exports_variables() {
        let connection = ConnectionInfo::ssh("hv-01", "admin", None).unwrap();
        let runspace = ProcessRunspace::new(connection, ShellDialect::Sh);
        runspace.set_variable("VM_NAME", "sql 01");

        let command = runspace.command("echo $VM_NAME");
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(command.as_std().get_program(), "ssh");
        assert_eq!(args[..3], ["-o", "BatchMode=yes", "admin@hv-01"]);
        assert_eq!(args[3], r"sh -c 'export VM_NAME='\''sql 01'\''; echo $VM_NAME'");
    }

    #[tokio::test]
    async fn test_reset_clears_variables() {
        let runspace = ProcessRunspace::new(ConnectionInfo::Local, ShellDialect::Sh);
        runspace.set_variable("VM_NAME", "sql-01");
        runspace.reset().await.unwrap();
        assert!(runspace.variables().is_empty());
    }

    #[test]
    fn test_empty_pipeline_is_rejected() {
        let runspace = ProcessRunspace::new(ConnectionInfo::Local, ShellDialect::Sh);
        assert!(matches!(
            runspace.create_pipeline(PipelineSpec::new()),
            Err(PoolError::InvalidState(_))
        ));
    }
}
