//! Type-Safe Command Execution
//!
//! This module provides the ONLY sanctioned way to touch the system. Every
//! stage describes what it wants as an [`Operation`] and hands it to a
//! [`CommandRunner`]. That gives one enforcement point for:
//!
//! - Dry-run: [`ShellRunner`] in `DryRun` mode logs and journals the
//!   operation, performs nothing and reports success
//! - Process group isolation (death pact compliance) for non-interactive
//!   commands, and child registration for all of them
//! - Refusing new work once an interrupt has started the rollback
//! - Uniform error surfacing through [`CommandError`]

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use log::{debug, info};

use crate::error::CommandError;
use crate::plan::ExecutionMode;
use crate::process_guard::{ChildRegistry, CommandProcessGroup, ShutdownFlag};

/// A single system operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Run a program. Interactive programs inherit the terminal and stay in
    /// the foreground process group; the rest are captured and isolated.
    Exec {
        program: String,
        args: Vec<String>,
        interactive: bool,
    },

    /// Run a read-only program and capture its stdout.
    ///
    /// `stand_in` is returned in dry-run mode when the queried object does
    /// not exist until earlier (simulated) operations have run. Queries
    /// without a stand-in probe existing state and run even in dry-run.
    Query {
        program: String,
        args: Vec<String>,
        stand_in: Option<String>,
    },

    /// Write (or append to) a file
    WriteFile {
        path: PathBuf,
        contents: String,
        mode: u32,
        append: bool,
    },

    /// `mkdir -p`
    CreateDir { path: PathBuf },

    /// Remove a file; a missing file is not an error
    RemoveFile { path: PathBuf },
}

impl Operation {
    /// Non-interactive command
    pub fn exec<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exec {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            interactive: false,
        }
    }

    /// Command that needs the operator's terminal (passphrases, passwd)
    pub fn interactive<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exec {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            interactive: true,
        }
    }

    /// Read-only query of state that already exists
    pub fn probe<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Query {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stand_in: None,
        }
    }

    /// Read-only query of state created by earlier operations
    pub fn query<I, S>(program: &str, args: I, stand_in: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Query {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stand_in: Some(stand_in.into()),
        }
    }

    pub fn write_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self::WriteFile {
            path: path.into(),
            contents: contents.into(),
            mode: 0o644,
            append: false,
        }
    }

    pub fn append_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self::WriteFile {
            path: path.into(),
            contents: contents.into(),
            mode: 0o644,
            append: true,
        }
    }

    pub fn write_executable(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self::WriteFile {
            path: path.into(),
            contents: contents.into(),
            mode: 0o700,
            append: false,
        }
    }

    pub fn create_dir(path: impl Into<PathBuf>) -> Self {
        Self::CreateDir { path: path.into() }
    }

    pub fn remove_file(path: impl Into<PathBuf>) -> Self {
        Self::RemoveFile { path: path.into() }
    }

    /// Program name for exec/query operations
    pub fn program(&self) -> Option<&str> {
        match self {
            Self::Exec { program, .. } | Self::Query { program, .. } => Some(program),
            _ => None,
        }
    }

    /// Arguments for exec/query operations
    pub fn args(&self) -> &[String] {
        match self {
            Self::Exec { args, .. } | Self::Query { args, .. } => args,
            _ => &[],
        }
    }

    /// Whether this operation can change system state
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Query { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec { program, args, .. } | Self::Query { program, args, .. } => {
                write!(f, "{}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Self::WriteFile {
                path,
                contents,
                append,
                ..
            } => {
                let verb = if *append { "append" } else { "write" };
                write!(f, "{} {} ({} bytes)", verb, path.display(), contents.len())
            }
            Self::CreateDir { path } => write!(f, "mkdir -p {}", path.display()),
            Self::RemoveFile { path } => write!(f, "rm -f {}", path.display()),
        }
    }
}

/// Output from an executed operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output (empty for interactive commands)
    pub stdout: String,
    /// Whether the operation was only simulated
    pub simulated: bool,
}

impl CommandOutput {
    pub fn simulated(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            simulated: true,
        }
    }
}

/// Executes operations against the system or simulates them.
///
/// Stages never call `std::process::Command` themselves.
pub trait CommandRunner {
    /// Execute one operation, surfacing any failure as a `CommandError`
    fn run(&mut self, op: &Operation) -> Result<CommandOutput, CommandError>;

    /// The mode this runner enforces
    fn mode(&self) -> ExecutionMode;
}

/// The production runner.
#[derive(Debug, Default)]
pub struct ShellRunner {
    mode: ExecutionMode,
    journal: Vec<String>,
    /// None for the runner the signal handler rolls back with
    shutdown: Option<ShutdownFlag>,
}

impl ShellRunner {
    /// Runner for the orchestrator; stops once the global shutdown flag is up
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_shutdown(mode, ShutdownFlag::global())
    }

    pub fn with_shutdown(mode: ExecutionMode, shutdown: ShutdownFlag) -> Self {
        Self {
            mode,
            journal: Vec::new(),
            shutdown: Some(shutdown),
        }
    }

    /// Runner that keeps going during shutdown, for the interrupt rollback
    pub fn for_cleanup(mode: ExecutionMode) -> Self {
        Self {
            mode,
            journal: Vec::new(),
            shutdown: None,
        }
    }

    /// Descriptions of every operation this runner was asked to perform
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    fn simulate(&self, op: &Operation) -> CommandOutput {
        info!("[DRY RUN] {}", op);
        match op {
            Operation::Query {
                stand_in: Some(value),
                ..
            } => CommandOutput::simulated(value.clone()),
            _ => CommandOutput::simulated(String::new()),
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&mut self, op: &Operation) -> Result<CommandOutput, CommandError> {
        if self.shutdown.as_ref().is_some_and(ShutdownFlag::is_triggered) {
            log::warn!("Not starting '{}': shutting down", op);
            return Err(aborted(op.to_string()));
        }
        self.journal.push(op.to_string());

        let probes_existing_state = matches!(op, Operation::Query { stand_in: None, .. });
        if self.mode.is_dry_run() && !probes_existing_state {
            return Ok(self.simulate(op));
        }

        match op {
            Operation::Exec {
                program,
                args,
                interactive: true,
            } => run_interactive(program, args, self.shutdown.as_ref()),
            Operation::Exec { program, args, .. } | Operation::Query { program, args, .. } => {
                run_captured(program, args, self.shutdown.as_ref())
            }
            Operation::WriteFile {
                path,
                contents,
                mode,
                append,
            } => {
                debug!("{}", op);
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(*append)
                    .truncate(!*append)
                    .mode(*mode)
                    .open(path)
                    .map_err(|source| io_error(op, source))?;
                file.write_all(contents.as_bytes())
                    .and_then(|()| file.sync_all())
                    .map_err(|source| io_error(op, source))?;
                Ok(CommandOutput::default())
            }
            Operation::CreateDir { path } => {
                debug!("{}", op);
                fs::create_dir_all(path).map_err(|source| io_error(op, source))?;
                Ok(CommandOutput::default())
            }
            Operation::RemoveFile { path } => {
                debug!("{}", op);
                match fs::remove_file(path) {
                    Ok(()) => Ok(CommandOutput::default()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Ok(CommandOutput::default())
                    }
                    Err(source) => Err(io_error(op, source)),
                }
            }
        }
    }

    fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

fn io_error(op: &Operation, source: std::io::Error) -> CommandError {
    CommandError::Io {
        operation: op.to_string(),
        source,
    }
}

fn aborted(operation: String) -> CommandError {
    CommandError::Aborted { operation }
}

/// Register a freshly spawned child. A child that slipped in after the
/// shutdown flag went up, and so after the handler swept the registry, is
/// killed on the spot.
fn track(
    child: &mut Child,
    program: &str,
    shutdown: Option<&ShutdownFlag>,
) -> Result<u32, CommandError> {
    let pid = child.id();
    ChildRegistry::register_global(pid);
    if shutdown.is_some_and(ShutdownFlag::is_triggered) {
        let _ = child.kill();
        let _ = child.wait();
        ChildRegistry::unregister_global(pid);
        return Err(aborted(program.to_string()));
    }
    Ok(pid)
}

/// Run a captured command in its own process group, registered with the
/// global child registry for the duration of the call.
fn run_captured(
    program: &str,
    args: &[String],
    shutdown: Option<&ShutdownFlag>,
) -> Result<CommandOutput, CommandError> {
    info!("run: {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group()
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;
    let pid = track(&mut child, program, shutdown)?;

    let output = child.wait_with_output();
    ChildRegistry::unregister_global(pid);
    let output = output.map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        Ok(CommandOutput {
            stdout,
            simulated: false,
        })
    } else {
        Err(CommandError::NonZeroExit {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Run a command attached to the operator's terminal.
///
/// The child stays in the foreground process group so it can read the
/// terminal; the registry falls back to signalling its PID directly.
fn run_interactive(
    program: &str,
    args: &[String],
    shutdown: Option<&ShutdownFlag>,
) -> Result<CommandOutput, CommandError> {
    info!("run (interactive): {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .with_parent_death_signal()
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;
    let pid = track(&mut child, program, shutdown)?;

    let status = child.wait();
    ChildRegistry::unregister_global(pid);
    let status = status.map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if status.success() {
        Ok(CommandOutput::default())
    } else {
        Err(CommandError::NonZeroExit {
            program: program.to_string(),
            code: status.code(),
            stderr: String::new(),
        })
    }
}
