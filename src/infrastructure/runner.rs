//! External process execution
//!
//! Every phase talks to the system through [`CommandRunner`], so the whole
//! pipeline can run against a recording double in tests or a logging double
//! under `--dry-run`.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::CommandError;
use crate::tools::{get_tool_path, tools};

/// A command to run: program, arguments, working directory and optional stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// Create a command for a tool, resolved through `{TOOL}_BIN`
    pub fn new(tool: &str) -> Self {
        Self {
            program: get_tool_path(tool),
            args: Vec::new(),
            current_dir: None,
            stdin: None,
        }
    }

    /// Create a command that runs a tool through sudo
    pub fn sudo(tool: &str) -> Self {
        Self::new(tools::SUDO).arg(get_tool_path(tool))
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

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Feed bytes to the process on stdin
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        if self.stdin.is_some() {
            write!(f, " < (stdin)")?;
        }
        Ok(())
    }
}

/// Exit status of a finished command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
}

impl CommandStatus {
    pub fn success() -> Self {
        Self { code: Some(0) }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run with the console inherited and wait for the exit status
    async fn run(&self, spec: &CommandSpec) -> Result<CommandStatus, CommandError>;

    /// Run and return trimmed stdout; a non-zero exit is an error
    async fn capture(&self, spec: &CommandSpec) -> Result<String, CommandError>;
}

/// Runs commands on the local system
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(spec: &CommandSpec, err: std::io::Error) -> CommandError {
        CommandError::SpawnFailed {
            program: spec.program.clone(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandStatus, CommandError> {
        debug!("Running: {}", spec);
        let mut cmd = Self::command(spec);

        let status = match spec.stdin {
            None => cmd
                .status()
                .await
                .map_err(|e| Self::spawn_error(spec, e))?,
            Some(ref input) => {
                let mut child = cmd
                    .stdin(Stdio::piped())
                    .spawn()
                    .map_err(|e| Self::spawn_error(spec, e))?;

                if let Some(mut stdin) = child.stdin.take() {
                    // A child that exits early closes the pipe; its status tells the story.
                    if let Err(e) = stdin.write_all(input).await {
                        debug!("stdin of {} closed early: {}", spec.program, e);
                    }
                    drop(stdin);
                }

                child.wait().await.map_err(|e| Self::spawn_error(spec, e))?
            }
        };

        Ok(CommandStatus {
            code: status.code(),
        })
    }

    async fn capture(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        debug!("Capturing: {}", spec);
        let output = Self::command(spec)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Self::spawn_error(spec, e))?;

        if !output.status.success() {
            return Err(CommandError::NonZeroExit {
                command: spec.to_string(),
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Logs every mutating command instead of running it
///
/// Read-only queries (`capture`) still go to the system so host checks see
/// the real VM.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    system: SystemRunner,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandStatus, CommandError> {
        match spec.current_dir {
            Some(ref dir) => info!("[dry-run] (in {}) {}", dir.display(), spec),
            None => info!("[dry-run] {}", spec),
        }
        Ok(CommandStatus::success())
    }

    async fn capture(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        self.system.capture(spec).await
    }
}
