use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::DEFAULT_LOG_FILE;

/// archcrypt - Arch Linux installer for a LUKS-encrypted LVM layout
#[derive(Parser, Debug)]
#[command(name = "archcrypt")]
#[command(about = "Install Arch Linux onto a LUKS + LVM disk layout with rollback on failure")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Mutating operations are logged with a [DRY RUN] marker and reported
    /// as successful. Read-only probes of existing state still execute so
    /// the preview is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Verbose output (debug level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Persistent log file (appended to)
    #[arg(long, global = true, default_value = DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the installer (default)
    Install {
        /// Path to configuration file to use
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the resolved configuration to this file and exit
        #[arg(long)]
        save_config: Option<PathBuf>,

        /// Target disk, e.g. /dev/sda or /dev/nvme0n1
        #[arg(short, long)]
        disk: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    /// The subcommand, defaulting to an install with no overrides
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Install {
            config: None,
            save_config: None,
            disk: None,
        })
    }
}
