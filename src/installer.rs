//! Installer module
//!
//! Top-level orchestration: plan summary, destructive confirmation, the
//! stage sequence, rollback on failure, final teardown and the reboot gate.

use std::fmt::Write as _;

use crate::error::Result;
use crate::plan::{InstallPlan, estimate_home_gib};
use crate::prompt::{ConfirmationGate, Prompter};
use crate::rollback::{RollbackManager, RollbackReport};
use crate::runner::{CommandRunner, Operation};
use crate::stages::StageExecutor;

/// How a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every stage and the chroot configuration succeeded
    Completed,
    /// The operator declined the destructive confirmation; nothing was touched
    Declined,
}

/// Run the whole installation for `plan`.
///
/// Preflight is the caller's job. On any failure after the destructive
/// confirmation the registered cleanup runs once before the error is
/// returned; on success it runs as the final teardown.
pub fn run(
    plan: &InstallPlan,
    runner: &mut dyn CommandRunner,
    prompter: &mut dyn Prompter,
    rollback: &RollbackManager,
) -> Result<Outcome> {
    let disk_bytes = probe_disk_size(plan, runner);
    prompter.show(&plan_summary(plan, disk_bytes))?;

    let question = format!(
        "All data on {} will be destroyed. Continue?",
        plan.disk.display()
    );
    if !ConfirmationGate::confirm(prompter, &question)? {
        return Ok(Outcome::Declined);
    }

    log::info!("Starting installation on {} ({})", plan.disk.display(), plan.mode);
    let result = StageExecutor::new(plan, runner, prompter, rollback).run_all();

    if let Err(e) = result {
        log::error!("Installation failed: {}", e);
        report_rollback(&rollback.run_once(runner));
        return Err(e);
    }

    log::info!("Installation complete, releasing the target");
    report_rollback(&rollback.run_once(runner));

    reboot_gate(runner, prompter);
    Ok(Outcome::Completed)
}

/// Human-readable plan shown before the destructive confirmation.
pub fn plan_summary(plan: &InstallPlan, disk_bytes: Option<u64>) -> String {
    let layout = plan.layout();
    let home = match disk_bytes.and_then(|bytes| estimate_home_gib(bytes, plan)) {
        Some(gib) => format!("remaining space (~{} GiB)", gib),
        None => "remaining space".to_string(),
    };

    let mut out = String::new();
    let _ = writeln!(out, "Installation plan ({})", plan.mode);
    let _ = writeln!(out, "  Disk:        {}", plan.disk.display());
    let _ = writeln!(out, "  Layout:      {}", layout);
    let _ = writeln!(out, "  ESP size:    {} MiB", plan.efi_size_mib);
    let _ = writeln!(out, "  Root volume: {} GiB", plan.root_size_gib);
    let _ = writeln!(out, "  Home volume: {}", home);
    let _ = writeln!(out, "  Mirrors:     {}", plan.mirror_countries.join(","));
    let _ = write!(out, "  Packages:    {}", plan.packages.join(" "));
    out
}

/// Disk size in bytes, for the summary only
fn probe_disk_size(plan: &InstallPlan, runner: &mut dyn CommandRunner) -> Option<u64> {
    let op = Operation::probe(
        "lsblk",
        [
            "-b".to_string(),
            "-d".to_string(),
            "-n".to_string(),
            "-o".to_string(),
            "SIZE".to_string(),
            plan.disk.display().to_string(),
        ],
    );
    match runner.run(&op) {
        Ok(output) => output.stdout.trim().parse().ok(),
        Err(e) => {
            log::debug!("Disk size probe failed: {}", e);
            None
        }
    }
}

fn report_rollback(report: &RollbackReport) {
    if report.skipped {
        return;
    }
    if report.is_clean() {
        log::info!("Released {} resource(s)", report.attempted.len());
    } else {
        log::warn!(
            "Rollback incomplete: {} of {} cleanup action(s) failed",
            report.failures.len(),
            report.attempted.len()
        );
    }
}

fn reboot_gate(runner: &mut dyn CommandRunner, prompter: &mut dyn Prompter) {
    match ConfirmationGate::confirm(prompter, "Reboot now?") {
        Ok(true) => {
            if let Err(e) = runner.run(&Operation::exec("reboot", Vec::<String>::new())) {
                log::error!("Reboot failed: {}", e);
            }
        }
        Ok(false) => log::info!("Not rebooting. Remove the installation medium before booting."),
        Err(e) => log::warn!("Could not read reboot answer: {}", e),
    }
}
