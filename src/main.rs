//! archcrypt - Main entry point
//!
//! Parses arguments, sets up logging and the signal handlers, runs preflight
//! and hands over to the installer. Exit codes: 0 on success or when the
//! operator declines, 2 when preflight fails, 1 for any other failure,
//! 128 + signal when interrupted.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::{debug, error, info};

use archcrypt::cli::{Cli, Commands};
use archcrypt::config::{self, InstallConfig};
use archcrypt::error::InstallError;
use archcrypt::installer::{self, Outcome};
use archcrypt::plan::{ExecutionMode, InstallPlan};
use archcrypt::prompt::{LinePrompter, Prompter};
use archcrypt::rollback::RollbackManager;
use archcrypt::runner::ShellRunner;
use archcrypt::{logging, preflight, process_guard};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_file, cli.verbose) {
        eprintln!("warning: {:#}", e);
    }
    info!("archcrypt {} starting up", env!("CARGO_PKG_VERSION"));

    let code = match cli.command() {
        Commands::Validate { config } => validate_config(&config),
        Commands::Install {
            config,
            save_config,
            disk,
        } => {
            let mode = ExecutionMode::from_flag(cli.dry_run);
            match run_install(mode, config.as_deref(), save_config.as_deref(), disk) {
                Ok(code) => code,
                Err(e) => {
                    error!("{:#}", e);
                    eprintln!("✗ {:#}", e);
                    1
                }
            }
        }
    };

    ExitCode::from(code)
}

fn validate_config(path: &Path) -> u8 {
    info!("Validating configuration file: {}", path.display());
    match InstallConfig::load_from_file(path).and_then(|c| c.validate()) {
        Ok(()) => {
            println!("✓ Configuration file is valid: {}", path.display());
            0
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            eprintln!("✗ Configuration validation failed: {:#}", e);
            1
        }
    }
}

fn run_install(
    mode: ExecutionMode,
    config_path: Option<&Path>,
    save_path: Option<&Path>,
    disk: Option<String>,
) -> Result<u8> {
    let mut config = match config_path {
        Some(path) => InstallConfig::load_from_file(path)?,
        None => InstallConfig::default(),
    };
    if let Some(disk) = disk {
        config.disk = disk;
    }
    config
        .validate()
        .map_err(|e| InstallError::config(format!("{:#}", e)))?;

    if let Some(path) = save_path {
        config.save_to_file(path)?;
        info!("Configuration saved to {}", path.display());
        println!("✓ Configuration saved to {}", path.display());
        return Ok(0);
    }

    let mut prompter = LinePrompter::stdio();
    let disk = if config.disk.is_empty() {
        ask_disk(&mut prompter)?
    } else {
        config.disk.clone()
    };
    let plan = InstallPlan::new(config, disk, mode);
    debug!("Resolved plan: {:?}", plan);

    let rollback = RollbackManager::new();
    if let Err(e) = process_guard::init_signal_handlers(rollback.clone(), mode) {
        log::warn!("Failed to initialize signal handlers: {}", e);
    }

    if let Err(e) = preflight::validate(&plan) {
        let err = InstallError::from(e);
        error!("{}", err);
        eprintln!("✗ {}", err);
        return Ok(exit_code(&err));
    }

    let mut runner = ShellRunner::new(mode);
    match installer::run(&plan, &mut runner, &mut prompter, &rollback) {
        Ok(Outcome::Completed) => {
            println!("✓ Installation completed successfully");
            Ok(0)
        }
        Ok(Outcome::Declined) => Ok(0),
        Err(e) => {
            // An interrupt caused this failure; its handler owns the exit
            process_guard::park_if_shutting_down();
            eprintln!("✗ Installation failed: {}", e);
            eprintln!("  Cleanup was attempted; rerunning from the start is safe.");
            Ok(exit_code(&e))
        }
    }
}

fn ask_disk(prompter: &mut dyn Prompter) -> Result<String> {
    loop {
        let answer = prompter.ask("Target disk (e.g. /dev/sda, /dev/nvme0n1)", None)?;
        match config::validate_disk_path(&answer) {
            Ok(()) => return Ok(answer),
            Err(e) => prompter.show(&format!("Invalid input: {}", e))?,
        }
    }
}

fn exit_code(err: &InstallError) -> u8 {
    u8::try_from(err.exit_code()).unwrap_or(1)
}
