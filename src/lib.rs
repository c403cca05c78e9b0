//! archcrypt library
//!
//! Staged provisioning of an Arch Linux system onto a LUKS-encrypted LVM
//! layout, with a dry-run mode and exactly-once rollback.

pub mod chroot;
pub mod cli;
pub mod config;
pub mod error;
pub mod installer;
pub mod logging;
pub mod plan;
pub mod preflight;
pub mod process_guard;
pub mod prompt;
pub mod rollback;
pub mod runner;
pub mod stages;

// Re-export main types for convenience
pub use chroot::{ChrootPlan, ChrootSettings, ChrootStep, ChrootStepKind};
pub use config::InstallConfig;
pub use error::{CommandError, InstallError, PreflightError};
pub use installer::Outcome;
pub use plan::{ExecutionMode, InstallPlan, PartitionLayout, partition_path};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ShutdownFlag};
pub use prompt::{ConfirmationGate, LinePrompter, Prompter};
pub use rollback::{CleanupAction, CleanupFailure, RollbackManager, RollbackReport};
pub use runner::{CommandOutput, CommandRunner, Operation, ShellRunner};
pub use stages::{Stage, StageExecutor};
