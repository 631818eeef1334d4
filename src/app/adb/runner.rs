use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::env::RuntimeEnv;
use crate::app::error::CommandError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// One subprocess invocation: what to run and how long to let it run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    allow_non_zero_exit: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout: Some(DEFAULT_TIMEOUT),
            allow_non_zero_exit: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn allow_non_zero_exit(mut self) -> Self {
        self.allow_non_zero_exit = true;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_arg)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if arg.chars().any(char::is_whitespace) {
        format!("'{}'", arg.replace('\'', "'\\''"))
    } else {
        arg.to_string()
    }
}

/// Receives every command a [`RunContext`] executes, in order.
pub trait CommandObserver: Send + Sync {
    fn command_started(&self, command_line: &str, timeout: Option<Duration>);
    fn command_finished(&self, command_line: &str, elapsed: Duration, result: &CommandResult);
    fn command_failed(&self, command_line: &str, elapsed: Duration, error: &CommandError);
}

/// Everything a command needs besides its own `CommandSpec`.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub env: &'a RuntimeEnv,
    pub cancel: &'a CancellationToken,
    pub observer: Option<&'a dyn CommandObserver>,
}

impl<'a> RunContext<'a> {
    pub fn new(env: &'a RuntimeEnv, cancel: &'a CancellationToken) -> Self {
        Self {
            env,
            cancel,
            observer: None,
        }
    }

    pub fn observed(mut self, observer: &'a dyn CommandObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
        let command_line = spec.command_line();
        if let Some(observer) = self.observer {
            observer.command_started(&command_line, spec.timeout);
        }
        let started = Instant::now();
        let outcome = execute(spec, self.env, self.cancel).await;
        if let Some(observer) = self.observer {
            match &outcome {
                Ok(result) => observer.command_finished(&command_line, started.elapsed(), result),
                Err(err) => observer.command_failed(&command_line, started.elapsed(), err),
            }
        }
        outcome.and_then(|result| check_exit(spec, command_line, result))
    }
}

pub async fn run_command(
    spec: &CommandSpec,
    env: &RuntimeEnv,
    cancel: &CancellationToken,
) -> Result<CommandResult, CommandError> {
    let result = execute(spec, env, cancel).await?;
    check_exit(spec, spec.command_line(), result)
}

fn check_exit(
    spec: &CommandSpec,
    command_line: String,
    result: CommandResult,
) -> Result<CommandResult, CommandError> {
    if result.success() || spec.allow_non_zero_exit {
        return Ok(result);
    }
    Err(CommandError::NonZeroExit {
        command: command_line,
        exit_code: result.exit_code,
        output: result.combined_output(),
    })
}

/// Resolves `program` against `path_var`. Path-like programs must already
/// point at an executable file.
pub fn find_executable(program: &str, path_var: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable_file(candidate).then(|| candidate.to_path_buf());
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(program, Some(path_var), cwd).ok()
}

pub fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

enum Race {
    Exited(std::io::Result<std::process::ExitStatus>, Vec<u8>, Vec<u8>),
    TimedOut,
    Cancelled,
}

/// Runs the process to completion without judging its exit code.
async fn execute(
    spec: &CommandSpec,
    env: &RuntimeEnv,
    cancel: &CancellationToken,
) -> Result<CommandResult, CommandError> {
    let command_line = spec.command_line();
    let mut merged = env.vars().clone();
    merged.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    let path_var = merged.get("PATH").cloned().unwrap_or_default();
    let executable = find_executable(&spec.program, &path_var)
        .ok_or_else(|| CommandError::ExecutableNotFound(spec.program.clone()))?;

    if cancel.is_cancelled() {
        return Err(CommandError::Cancelled {
            command: command_line,
        });
    }

    let mut command = Command::new(&executable);
    command
        .args(&spec.args)
        .env_clear()
        .envs(&merged)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    #[cfg(target_os = "windows")]
    command.creation_flags(0x08000000); // CREATE_NO_WINDOW

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        command: command_line.clone(),
        source,
    })?;

    // Both pipes drain on their own tasks from the moment the child exists;
    // a full stderr buffer must never stall a stdout read or vice versa.
    let mut stdout = ReaderTask::spawn(child.stdout.take());
    let mut stderr = ReaderTask::spawn(child.stderr.take());

    let race = {
        let completion = async {
            let status = child.wait().await;
            let out = stdout.collect().await;
            let err = stderr.collect().await;
            (status, out, err)
        };
        tokio::select! {
            (status, out, err) = completion => Race::Exited(status, out, err),
            _ = sleep_or_pending(spec.timeout) => Race::TimedOut,
            _ = cancel.cancelled() => Race::Cancelled,
        }
    };

    match race {
        Race::Exited(status, out, err) => {
            let status = status.map_err(|source| CommandError::Spawn {
                command: command_line.clone(),
                source,
            })?;
            let result = CommandResult {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code: status.code().unwrap_or(-1),
            };
            debug!(
                command = %command_line,
                exit_code = result.exit_code,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "command finished"
            );
            Ok(result)
        }
        Race::TimedOut => {
            terminate(&mut child, &command_line).await;
            Err(CommandError::TimedOut {
                command: command_line,
                timeout: spec.timeout.unwrap_or_default(),
            })
        }
        Race::Cancelled => {
            terminate(&mut child, &command_line).await;
            Err(CommandError::Cancelled {
                command: command_line,
            })
        }
    }
}

async fn terminate(child: &mut Child, command_line: &str) {
    if let Err(err) = child.start_kill() {
        debug!(command = %command_line, error = %err, "kill after exit");
    }
    if let Err(err) = child.wait().await {
        warn!(command = %command_line, error = %err, "failed to reap terminated command");
    }
}

/// Returns `false` when the token fires before the delay elapses.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

/// Pipe reader that is aborted if nobody collects it.
struct ReaderTask(Option<JoinHandle<Vec<u8>>>);

impl ReaderTask {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self(reader.map(|mut reader| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                if let Err(err) = reader.read_to_end(&mut buffer).await {
                    debug!(error = %err, "pipe read ended early");
                }
                buffer
            })
        }))
    }

    async fn collect(&mut self) -> Vec<u8> {
        match self.0.as_mut() {
            Some(handle) => {
                let buffer = handle.await.unwrap_or_default();
                self.0 = None;
                buffer
            }
            None => Vec::new(),
        }
    }
}

impl Drop for ReaderTask {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
