//! Stage executor
//!
//! Runs one external command as a subprocess and exposes its output as a lazy,
//! ordered line stream. Lines are pumped out of the child's pipes by reader
//! tasks into an unbounded channel, so a slow consumer never fills the child's
//! pipe buffer. Every invocation has an absolute deadline; when it passes the
//! child is killed and the invocation fails with `ExecutionTimeout`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::PipelineError;
use crate::utils::tail_lines;

/// Lines kept in error reasons
pub const TAIL_LINES: usize = 20;

/// Characters kept in error reasons
pub const TAIL_CHARS: usize = 2000;

/// How long to wait for a killed child to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    /// Human readable step name, e.g. `terraform plan`
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl StageCommand {
    pub fn new(
        label: impl Into<String>,
        program: impl Into<String>,
        working_dir: impl AsRef<Path>,
        timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            env: Vec::new(),
            timeout,
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
        self.env.push((key.into(), value.into()));
        self
    }

    /// Whether any argument equals `arg`
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Program and arguments as one line, for logs
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Pipe an output line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    Stdout,
    Stderr,
}

/// Final result of a finished invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub exit_code: i32,
    /// Every line the process wrote, stdout and stderr interleaved in arrival order
    pub output: Vec<String>,
    /// Only the lines written to stdout
    pub stdout: Vec<String>,
    pub elapsed: Duration,
}

impl StageOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Full output joined with newlines
    pub fn text(&self) -> String {
        self.output.join("\n")
    }

    /// Stdout joined with newlines, for machine readable output
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// Bounded tail of the output, suitable for error reasons
    pub fn tail(&self) -> String {
        tail_lines(&self.output, TAIL_LINES, TAIL_CHARS)
    }
}

type ExitFuture = Pin<Box<dyn Future<Output = Result<i32, String>> + Send>>;

/// A running (or replayed) invocation.
///
/// Dropping it before the process exits kills the process.
pub struct StageProcess {
    label: String,
    timeout: Duration,
    started: Instant,
    deadline: Instant,
    lines: mpsc::UnboundedReceiver<(Pipe, String)>,
    exit: Option<ExitFuture>,
    kill: Option<oneshot::Sender<()>>,
    captured: Vec<String>,
    stdout: Vec<String>,
}

impl StageProcess {
    /// Assemble a process from its line channel and exit future
    pub fn from_parts(
        label: impl Into<String>,
        timeout: Duration,
        lines: mpsc::UnboundedReceiver<(Pipe, String)>,
        exit: impl Future<Output = Result<i32, String>> + Send + 'static,
        kill: Option<oneshot::Sender<()>>,
    ) -> Self {
        let started = Instant::now();
        Self {
            label: label.into(),
            timeout,
            started,
            deadline: started + timeout,
            lines,
            exit: Some(Box::pin(exit)),
            kill,
            captured: Vec::new(),
            stdout: Vec::new(),
        }
    }

    /// Replay an already finished process: yields `lines` as stdout, then exits
    /// with `exit_code`
    pub fn completed<I, S>(label: impl Into<String>, lines: I, exit_code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            let _ = tx.send((Pipe::Stdout, line.into()));
        }
        drop(tx);
        Self::from_parts(
            label,
            Duration::from_secs(60),
            rx,
            async move { Ok(exit_code) },
            None,
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Lines yielded so far
    pub fn captured(&self) -> &[String] {
        &self.captured
    }

    /// Next output line, `None` once both pipes are closed
    pub async fn next_line(&mut self) -> Result<Option<String>, PipelineError> {
        match tokio::time::timeout_at(self.deadline, self.lines.recv()).await {
            Ok(Some((pipe, line))) => {
                trace!("[{}] {}", self.label, line);
                if pipe == Pipe::Stdout {
                    self.stdout.push(line.clone());
                }
                self.captured.push(line.clone());
                Ok(Some(line))
            }
            Ok(None) => Ok(None),
            Err(_) => Err(self.expire().await),
        }
    }

    /// Drain the remaining output and wait for the exit code, whatever it is
    pub async fn wait(mut self) -> Result<StageOutput, PipelineError> {
        while self.next_line().await?.is_some() {}

        let Some(exit) = self.exit.take() else {
            return Err(self.timeout_error());
        };

        let exit_code = match tokio::time::timeout_at(self.deadline, exit).await {
            Ok(Ok(code)) => code,
            Ok(Err(reason)) => {
                return Err(PipelineError::ExecutionFailed {
                    step: self.label.clone(),
                    exit_code: -1,
                    tail: reason,
                })
            }
            Err(_) => return Err(self.expire().await),
        };

        let elapsed = self.started.elapsed();
        debug!(
            "{} exited with code {} after {:.1}s",
            self.label,
            exit_code,
            elapsed.as_secs_f64()
        );

        Ok(StageOutput {
            exit_code,
            output: std::mem::take(&mut self.captured),
            stdout: std::mem::take(&mut self.stdout),
            elapsed,
        })
    }

    /// Like `wait`, but a non-zero exit code is an `ExecutionFailed` error
    pub async fn finish(self) -> Result<StageOutput, PipelineError> {
        let label = self.label.clone();
        let output = self.wait().await?;
        if !output.success() {
            return Err(PipelineError::ExecutionFailed {
                step: label,
                exit_code: output.exit_code,
                tail: output.tail(),
            });
        }
        Ok(output)
    }

    async fn expire(&mut self) -> PipelineError {
        warn!("{} exceeded its {:?} timeout, killing it", self.label, self.timeout);
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(exit) = self.exit.take() {
            let _ = tokio::time::timeout(KILL_GRACE, exit).await;
        }
        self.timeout_error()
    }

    fn timeout_error(&self) -> PipelineError {
        PipelineError::ExecutionTimeout {
            step: self.label.clone(),
            timeout: self.timeout,
        }
    }
}

/// Starts stage commands
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Start `command`; fails with `ToolUnavailable` if it cannot be started
    async fn spawn(&self, command: StageCommand) -> Result<StageProcess, PipelineError>;
}

/// Runs stage commands as real subprocesses
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioStageRunner;

#[async_trait]
impl StageRunner for TokioStageRunner {
    async fn spawn(&self, command: StageCommand) -> Result<StageProcess, PipelineError> {
        debug!(
            "Running {} in {}: {}",
            command.label,
            command.working_dir.display(),
            command.command_line()
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::ToolUnavailable {
                program: command.program.clone(),
                reason: e.to_string(),
            })?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Pipe::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Pipe::Stderr, line_tx));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let label = command.label.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                status = child.wait() => status
                    .map(|s| s.code().unwrap_or(-1))
                    .map_err(|e| e.to_string()),
                // Either an explicit kill or the process handle was dropped
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", label, e);
                    }
                    Err(format!("{} was killed", label))
                }
            };
            let _ = exit_tx.send(result);
        });

        let exit = async move {
            exit_rx
                .await
                .unwrap_or_else(|_| Err("exit status lost".to_string()))
        };

        Ok(StageProcess::from_parts(
            command.label,
            command.timeout,
            line_rx,
            exit,
            Some(kill_tx),
        ))
    }
}

/// Pump lines from a pipe until EOF. Keeps reading after the consumer is gone
/// so the child never blocks on a full pipe.
async fn forward_lines<R>(reader: R, pipe: Pipe, tx: mpsc::UnboundedSender<(Pipe, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                let _ = tx.send((pipe, line));
            }
            Err(e) => {
                debug!("Stopped reading subprocess output: {}", e);
                break;
            }
        }
    }
}
