//! Process lifecycle management for child processes
//!
//! This module ensures that child processes are properly terminated when
//! the installer exits (gracefully or via signal), and that an external
//! interrupt releases the provisioned tree.
//!
//! # Problem Solved
//! Without explicit process group management, if the installer is interrupted
//! while a destructive operation (e.g., `pacstrap`) is running, the child
//! process becomes orphaned and keeps the target mounted.
//!
//! # Solution
//! - Spawn captured children in their own process group with a death signal
//! - Interactive children keep the terminal's group but get the same death
//!   signal
//! - Track every child's PID in a global registry
//! - On SIGINT/SIGTERM/SIGHUP: raise the shutdown flag so no new operation
//!   starts, terminate children (SIGTERM, grace period, SIGKILL), run the
//!   rollback once, exit with `128 + signal`

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::plan::ExecutionMode;
use crate::rollback::RollbackManager;
use crate::runner::{CommandRunner, ShellRunner};

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Global shutdown flag, raised by the signal handler
static SHUTDOWN: OnceLock<ShutdownFlag> = OnceLock::new();

/// How long children get between SIGTERM and SIGKILL on interrupt
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Raised once an interrupt starts tearing the installation down.
///
/// Runners holding the flag refuse every operation after it is raised, so
/// the orchestrator cannot start work while the rollback releases the tree.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// The process-wide flag the signal handler raises
    pub fn global() -> Self {
        SHUTDOWN.get_or_init(ShutdownFlag::default).clone()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running
    pids: HashSet<u32>,
    /// Whether termination has already been initiated (prevent double-cleanup)
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a PID with the global registry, ignoring a poisoned lock
    pub fn register_global(pid: u32) {
        if let Ok(mut registry) = Self::global().lock() {
            registry.register(pid);
        }
    }

    /// Unregister a PID from the global registry, ignoring a poisoned lock
    pub fn unregister_global(pid: u32) {
        if let Ok(mut registry) = Self::global().lock() {
            registry.unregister(pid);
        }
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        log::debug!("Registered child process PID {}", pid);
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        log::debug!("Unregistered child process PID {}", pid);
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child processes
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            log::debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            log::debug!("No child processes to terminate");
            return;
        }

        log::info!("Terminating {} child process(es)...", self.pids.len());

        // Group signals reach the whole tree (pacstrap -> pacman, etc.)
        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                log::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    log::warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if !pids_to_kill.iter().any(|&pid| is_process_alive(pid)) {
                log::info!("All child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                log::warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    log::error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        log::info!("Child process cleanup complete");
    }
}

/// Send a signal to a process
fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group (negative PID)
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state: Z=zombie, X=dead
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

fn signal_name(sig: i32) -> &'static str {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};

    match sig {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        _ => "UNKNOWN",
    }
}

/// React to an external interrupt and return the exit code to use.
///
/// Raises `shutdown` first so the orchestrator stops issuing operations,
/// then stops the registered children and runs the rollback through
/// `runner`. The rollback runs at most once no matter who asks first.
pub fn handle_signal(
    sig: i32,
    shutdown: &ShutdownFlag,
    registry: &Mutex<ChildRegistry>,
    rollback: &RollbackManager,
    runner: &mut dyn CommandRunner,
) -> i32 {
    log::error!("Received {} signal, rolling back...", signal_name(sig));
    shutdown.trigger();

    if let Ok(mut registry) = registry.lock() {
        registry.terminate_all(TERMINATE_GRACE);
    }

    let report = rollback.run_once(runner);
    if !report.is_clean() {
        log::warn!(
            "{} cleanup action(s) failed; the target may still be mounted",
            report.failures.len()
        );
    }

    128 + sig
}

/// Park the calling thread for good once an interrupt is being handled.
///
/// The handler thread ends the process with `128 + signal`; the main thread
/// must not race it to an exit code of its own.
pub fn park_if_shutting_down() {
    if ShutdownFlag::global().is_triggered() {
        loop {
            std::thread::park();
        }
    }
}

/// Install handlers for SIGINT (Ctrl+C), SIGTERM and SIGHUP.
///
/// On the first signal the handler thread runs [`handle_signal`] against
/// the global registry and shutdown flag, then exits with its code. Call
/// this once at program start.
pub fn init_signal_handlers(
    rollback: RollbackManager,
    mode: ExecutionMode,
) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let code = handle_signal(
                sig,
                &ShutdownFlag::global(),
                &ChildRegistry::global(),
                &rollback,
                &mut ShellRunner::for_cleanup(mode),
            );
            std::process::exit(code);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    /// This allows us to kill the entire process tree with a single signal
    fn in_new_process_group(&mut self) -> &mut Self;

    /// Keep the caller's process group (and terminal) but still die with
    /// the installer
    fn with_parent_death_signal(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn with_parent_death_signal(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: prctl is async-signal-safe
        unsafe {
            self.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }

    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe setpgid and prctl
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies with the installer instead of finishing a wipe alone
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
