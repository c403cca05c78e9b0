//! Rollback of acquired resources.
//!
//! Stages register a [`CleanupAction`] *before* acquiring the resource it
//! undoes, so a half-established mount or mapping is still covered. The
//! manager runs the registered actions newest-first (unmount, deactivate,
//! close) exactly once, no matter how many callers ask: the error path, the
//! signal handler and the final teardown after a successful install all go
//! through [`RollbackManager::run_once`].
//!
//! Cleanup is best effort. A failing action is logged as a warning and the
//! remaining actions still run; nothing here ever returns an error.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::CommandError;
use crate::runner::{CommandRunner, Operation};

/// An idempotent undo operation for one acquired resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// `umount -R <path>`
    UnmountTree(PathBuf),
    /// `vgchange -an <vg>` so the mapping underneath can be closed
    DeactivateVolumeGroup(String),
    /// `cryptsetup close <name>`
    CloseMapping(String),
}

impl CleanupAction {
    pub fn operation(&self) -> Operation {
        match self {
            Self::UnmountTree(path) => {
                Operation::exec("umount", ["-R".to_string(), path.display().to_string()])
            }
            Self::DeactivateVolumeGroup(vg) => Operation::exec("vgchange", ["-an", vg.as_str()]),
            Self::CloseMapping(name) => Operation::exec("cryptsetup", ["close", name.as_str()]),
        }
    }

    /// Whether a failure only means the resource was never (or is no
    /// longer) established.
    fn already_released(&self, err: &CommandError) -> bool {
        let CommandError::NonZeroExit { stderr, .. } = err else {
            return false;
        };
        let stderr = stderr.to_lowercase();
        let markers: &[&str] = match self {
            Self::UnmountTree(_) => &["not mounted", "no mount point specified", "no such file"],
            Self::DeactivateVolumeGroup(_) => &["not found", "does not exist"],
            Self::CloseMapping(_) => &["not active", "doesn't exist", "does not exist"],
        };
        markers.iter().any(|m| stderr.contains(m))
    }
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmountTree(path) => write!(f, "unmount {}", path.display()),
            Self::DeactivateVolumeGroup(vg) => write!(f, "deactivate volume group {}", vg),
            Self::CloseMapping(name) => write!(f, "close encrypted mapping {}", name),
        }
    }
}

/// A cleanup action that failed. Reported, never escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub action: CleanupAction,
    pub cause: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not {}: {}", self.action, self.cause)
    }
}

/// What a rollback call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Actions run, in execution order
    pub attempted: Vec<CleanupAction>,
    pub failures: Vec<CleanupFailure>,
    /// True when an earlier call had already performed the rollback
    pub skipped: bool,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct RollbackState {
    actions: Vec<CleanupAction>,
    /// Whether rollback has already been initiated (prevent double-cleanup)
    executed: bool,
}

/// Shared handle to the registered cleanup actions.
///
/// Clones share state, so the signal handler thread and the orchestrator see
/// the same registrations and the same exactly-once guard.
#[derive(Debug, Clone, Default)]
pub struct RollbackManager {
    inner: Arc<Mutex<RollbackState>>,
}

impl RollbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RollbackState> {
        // A poisoned lock still holds valid registrations; cleanup must run anyway
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an action. Registering the same action twice is a no-op.
    pub fn register(&self, action: CleanupAction) {
        let mut state = self.state();
        if !state.actions.contains(&action) {
            log::debug!("Registered cleanup: {}", action);
            state.actions.push(action);
        }
    }

    /// Actions that a rollback would run, in execution order
    pub fn pending(&self) -> Vec<CleanupAction> {
        let state = self.state();
        if state.executed {
            Vec::new()
        } else {
            state.actions.iter().rev().cloned().collect()
        }
    }

    pub fn has_run(&self) -> bool {
        self.state().executed
    }

    /// Run every registered action newest-first, once per process.
    ///
    /// The lock is held for the whole rollback, so a concurrent caller waits
    /// and then observes `skipped`.
    pub fn run_once(&self, runner: &mut dyn CommandRunner) -> RollbackReport {
        let mut state = self.state();
        if state.executed {
            log::debug!("Rollback already performed, skipping");
            return RollbackReport {
                skipped: true,
                ..RollbackReport::default()
            };
        }
        state.executed = true;

        let mut report = RollbackReport::default();
        if state.actions.is_empty() {
            log::debug!("Nothing to roll back");
            return report;
        }

        log::info!("Releasing {} resource(s)...", state.actions.len());
        for action in state.actions.iter().rev() {
            report.attempted.push(action.clone());
            match runner.run(&action.operation()) {
                Ok(_) => log::info!("Cleanup: {}", action),
                Err(e) if action.already_released(&e) => {
                    log::debug!("Cleanup: {} (already released: {})", action, e);
                }
                Err(e) => {
                    let failure = CleanupFailure {
                        action: action.clone(),
                        cause: e.to_string(),
                    };
                    log::warn!("Cleanup failure: {}", failure);
                    report.failures.push(failure);
                }
            }
        }

        report
    }
}
