//! Error handling module for the installer
//!
//! Provides the error taxonomy using thiserror. Every fatal error reaches
//! `main` as an `InstallError`; cleanup problems never do (they are reported
//! as warnings by the rollback manager).

use std::io;

use thiserror::Error;

use crate::chroot::ChrootStepKind;
use crate::stages::Stage;

/// Environment preconditions that failed before anything was touched.
#[derive(Error, Debug)]
pub enum PreflightError {
    /// The reachability probe to the package host failed
    #[error("network unreachable: cannot connect to {host}: {reason}")]
    NetworkUnreachable { host: String, reason: String },

    /// The disk identifier does not name a block device
    #[error("invalid device {device}: {reason}")]
    InvalidDevice { device: String, reason: String },

    /// Live installs must run as root
    #[error("root privileges required")]
    NotRoot,

    /// External tools the stages call are not on PATH
    #[error("missing required tools: {}", join_names(.0))]
    MissingTools(Vec<String>),
}

/// Failure of a single operation issued through the command runner.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The program ran and exited unsuccessfully (None = killed by signal)
    #[error("{program} exited with {}{}", exit_label(.code), stderr_suffix(.stderr))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A file operation on the target failed
    #[error("{operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    /// Refused because an interrupt is rolling the installation back
    #[error("{operation}: not run, the installer is shutting down")]
    Aborted { operation: String },
}

impl CommandError {
    /// Exit code of the failed program, if it exited normally
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => *code,
            _ => None,
        }
    }
}

fn join_names(names: &[String]) -> String {
    names.join(", ")
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "signal termination".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

/// Main error type for an installation run
#[derive(Error, Debug)]
pub enum InstallError {
    /// Preconditions not met; nothing acquired, no rollback needed
    #[error("preflight check failed: {0}")]
    Preflight(#[from] PreflightError),

    /// A provisioning stage failed
    #[error("stage '{stage}' failed: {cause}")]
    Stage { stage: Stage, cause: String },

    /// A step of the chroot configuration failed
    #[error("chroot configuration failed at {}: {cause}", step_label(.step))]
    ChrootStage {
        step: Option<ChrootStepKind>,
        cause: String,
    },

    /// Reading an interactive answer failed (closed stdin, terminal error)
    #[error("prompt failed: {0}")]
    Prompt(#[from] io::Error),

    /// Configuration or interactive input was rejected
    #[error("configuration error: {0}")]
    Config(String),
}

fn step_label(step: &Option<ChrootStepKind>) -> String {
    match step {
        Some(kind) => format!("step '{}'", kind),
        None => "an unknown step".to_string(),
    }
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Create a stage failure
    pub fn stage(stage: Stage, cause: impl ToString) -> Self {
        Self::Stage {
            stage,
            cause: cause.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Preflight(_) => 2,
            Self::Stage { .. } | Self::ChrootStage { .. } | Self::Prompt(_) | Self::Config(_) => 1,
        }
    }
}
