//! Provisioning Stage Machine
//!
//! The outer install sequence. Stages run strictly in order; each one is a
//! precondition for the next and, in live mode, irreversible.
//!
//! # Stage Flow
//!
//! ```text
//! WipeSignatures -> Partition -> FormatESP -> EncryptSetup -> VolumeManage
//!     -> Filesystem -> Mount -> MirrorConfigure -> BaseInstall
//!     -> FstabGenerate -> ChrootConfigure
//! ```
//!
//! The first failure ends the sequence. There is no retry and no skip; the
//! caller rolls back and exits. Every system touch goes through the
//! [`CommandRunner`], and every resource that needs undoing is registered
//! with the [`RollbackManager`] before it is acquired.

use std::path::{Path, PathBuf};

use strum::{Display, EnumIter};

use crate::chroot::{ChrootPlan, ChrootSettings, ChrootStepKind};
use crate::config;
use crate::error::{CommandError, InstallError, Result};
use crate::plan::{InstallPlan, PartitionLayout};
use crate::prompt::{ConfirmationGate, Prompter};
use crate::rollback::{CleanupAction, RollbackManager};
use crate::runner::{CommandOutput, CommandRunner, Operation};

/// Mirror list rewritten by the mirror stage
pub const MIRRORLIST_PATH: &str = "/etc/pacman.d/mirrorlist";

/// Where the chroot script lives, relative to the new root
pub const CHROOT_SCRIPT: &str = "/root/archcrypt-chroot.sh";

/// Dry-run stand-in for the LUKS partition UUID
pub const DRY_RUN_UUID: &str = "DRY-RUN-UUID";

/// Mountpoints that must appear UUID-keyed in the generated fstab
pub const FSTAB_MOUNTPOINTS: &[&str] = &["/", "/home", "/boot"];

const DRY_RUN_FSTAB: &str = "\
# dry run: simulated genfstab output
UUID=DRY-RUN-ROOT / ext4 rw,relatime 0 1
UUID=DRY-RUN-HOME /home ext4 rw,relatime 0 2
UUID=DRY-RUN-ESP /boot vfat rw,relatime 0 2
";

/// Outer provisioning stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum Stage {
    WipeSignatures = 1,
    Partition = 2,
    #[strum(serialize = "FormatESP")]
    FormatEsp = 3,
    EncryptSetup = 4,
    VolumeManage = 5,
    Filesystem = 6,
    Mount = 7,
    MirrorConfigure = 8,
    BaseInstall = 9,
    FstabGenerate = 10,
    ChrootConfigure = 11,
}

impl Stage {
    /// 1-based position in the sequence
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// The unique entry stage, reached only after the destructive confirmation
    pub const fn first() -> Self {
        Self::WipeSignatures
    }

    /// Next stage, or None after the chroot configuration
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::WipeSignatures => Some(Self::Partition),
            Self::Partition => Some(Self::FormatEsp),
            Self::FormatEsp => Some(Self::EncryptSetup),
            Self::EncryptSetup => Some(Self::VolumeManage),
            Self::VolumeManage => Some(Self::Filesystem),
            Self::Filesystem => Some(Self::Mount),
            Self::Mount => Some(Self::MirrorConfigure),
            Self::MirrorConfigure => Some(Self::BaseInstall),
            Self::BaseInstall => Some(Self::FstabGenerate),
            Self::FstabGenerate => Some(Self::ChrootConfigure),
            Self::ChrootConfigure => None,
        }
    }

    /// Human-readable description for progress output
    pub const fn description(self) -> &'static str {
        match self {
            Self::WipeSignatures => "Erasing old signatures",
            Self::Partition => "Creating partition table",
            Self::FormatEsp => "Formatting EFI system partition",
            Self::EncryptSetup => "Setting up disk encryption",
            Self::VolumeManage => "Creating logical volumes",
            Self::Filesystem => "Creating filesystems",
            Self::Mount => "Mounting target tree",
            Self::MirrorConfigure => "Ranking package mirrors",
            Self::BaseInstall => "Installing base system",
            Self::FstabGenerate => "Generating fstab",
            Self::ChrootConfigure => "Configuring installed system",
        }
    }

    /// All stages in order
    pub const fn all() -> &'static [Self] {
        &[
            Self::WipeSignatures,
            Self::Partition,
            Self::FormatEsp,
            Self::EncryptSetup,
            Self::VolumeManage,
            Self::Filesystem,
            Self::Mount,
            Self::MirrorConfigure,
            Self::BaseInstall,
            Self::FstabGenerate,
            Self::ChrootConfigure,
        ]
    }
}

/// Runs the stage sequence for one plan.
pub struct StageExecutor<'a> {
    plan: &'a InstallPlan,
    layout: PartitionLayout,
    runner: &'a mut dyn CommandRunner,
    prompter: &'a mut dyn Prompter,
    rollback: &'a RollbackManager,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        plan: &'a InstallPlan,
        runner: &'a mut dyn CommandRunner,
        prompter: &'a mut dyn Prompter,
        rollback: &'a RollbackManager,
    ) -> Self {
        Self {
            plan,
            layout: plan.layout(),
            runner,
            prompter,
            rollback,
        }
    }

    /// Run every stage from the first, stopping at the first failure.
    pub fn run_all(&mut self) -> Result<()> {
        let mut current = Some(Stage::first());
        while let Some(stage) = current {
            self.run_stage(stage)?;
            current = stage.next();
        }
        Ok(())
    }

    /// Run a single stage.
    pub fn run_stage(&mut self, stage: Stage) -> Result<()> {
        let _span = tracing::info_span!("stage", name = %stage).entered();
        log::info!(
            "==> [{}/{}] {}",
            stage.order(),
            Stage::all().len(),
            stage.description()
        );

        let result = match stage {
            Stage::WipeSignatures => self.wipe_signatures(),
            Stage::Partition => self.partition(),
            Stage::FormatEsp => self.format_esp(),
            Stage::EncryptSetup => self.encrypt_setup(),
            Stage::VolumeManage => self.volume_manage(),
            Stage::Filesystem => self.filesystem(),
            Stage::Mount => self.mount(),
            Stage::MirrorConfigure => self.mirror_configure(),
            Stage::BaseInstall => self.base_install(),
            Stage::FstabGenerate => self.fstab_generate(),
            Stage::ChrootConfigure => self.chroot_configure(),
        };

        if let Err(ref e) = result {
            log::error!("Stage {} failed: {}", stage, e);
        }
        result
    }

    fn exec(&mut self, stage: Stage, op: Operation) -> Result<CommandOutput> {
        self.runner
            .run(&op)
            .map_err(|e| InstallError::stage(stage, e))
    }

    fn wipe_signatures(&mut self) -> Result<()> {
        let disk = path_arg(&self.plan.disk);
        self.exec(
            Stage::WipeSignatures,
            Operation::exec("sgdisk", ["--zap-all".to_string(), disk.clone()]),
        )?;
        self.exec(
            Stage::WipeSignatures,
            Operation::exec("wipefs", ["--all".to_string(), "--force".to_string(), disk]),
        )?;
        Ok(())
    }

    fn partition(&mut self) -> Result<()> {
        let disk = path_arg(&self.plan.disk);
        // 1 MiB alignment gap before the ESP
        let esp_end = 1 + self.plan.efi_size_mib;

        let args = [
            "--script".to_string(),
            disk.clone(),
            "mklabel".to_string(),
            "gpt".to_string(),
            "mkpart".to_string(),
            "ESP".to_string(),
            "fat32".to_string(),
            "1MiB".to_string(),
            format!("{}MiB", esp_end),
            "set".to_string(),
            "1".to_string(),
            "boot".to_string(),
            "on".to_string(),
            "mkpart".to_string(),
            "primary".to_string(),
            format!("{}MiB", esp_end),
            "100%".to_string(),
        ];
        self.exec(Stage::Partition, Operation::exec("parted", args))?;
        self.exec(Stage::Partition, Operation::exec("partprobe", [disk]))?;
        Ok(())
    }

    fn format_esp(&mut self) -> Result<()> {
        let efi = path_arg(&self.layout.efi_partition);
        self.exec(
            Stage::FormatEsp,
            Operation::exec("mkfs.fat", ["-F32".to_string(), efi]),
        )?;
        Ok(())
    }

    fn encrypt_setup(&mut self) -> Result<()> {
        let crypt = path_arg(&self.layout.crypt_partition);
        let mapping = self.plan.mapping_name.clone();

        self.rollback
            .register(CleanupAction::CloseMapping(mapping.clone()));

        // Passphrase prompts need the terminal
        self.exec(
            Stage::EncryptSetup,
            Operation::interactive(
                "cryptsetup",
                [
                    "luksFormat".to_string(),
                    "--type".to_string(),
                    "luks2".to_string(),
                    "--batch-mode".to_string(),
                    "--verify-passphrase".to_string(),
                    crypt.clone(),
                ],
            ),
        )?;
        self.exec(
            Stage::EncryptSetup,
            Operation::interactive("cryptsetup", ["open".to_string(), crypt, mapping]),
        )?;
        Ok(())
    }

    fn volume_manage(&mut self) -> Result<()> {
        let mapper = path_arg(&self.layout.mapper_device);
        let vg = self.layout.volume_group.clone();

        self.exec(
            Stage::VolumeManage,
            Operation::exec("pvcreate", [mapper.clone()]),
        )?;

        self.rollback
            .register(CleanupAction::DeactivateVolumeGroup(vg.clone()));
        self.exec(
            Stage::VolumeManage,
            Operation::exec("vgcreate", [vg.clone(), mapper]),
        )?;

        self.exec(
            Stage::VolumeManage,
            Operation::exec(
                "lvcreate",
                [
                    "-L".to_string(),
                    format!("{}G", self.plan.root_size_gib),
                    vg.clone(),
                    "-n".to_string(),
                    self.layout.root_volume.clone(),
                ],
            ),
        )?;
        self.exec(
            Stage::VolumeManage,
            Operation::exec(
                "lvcreate",
                [
                    "-l".to_string(),
                    "100%FREE".to_string(),
                    vg,
                    "-n".to_string(),
                    self.layout.home_volume.clone(),
                ],
            ),
        )?;
        Ok(())
    }

    fn filesystem(&mut self) -> Result<()> {
        for device in [self.layout.root_device(), self.layout.home_device()] {
            self.exec(
                Stage::Filesystem,
                Operation::exec("mkfs.ext4", ["-F".to_string(), path_arg(&device)]),
            )?;
        }
        Ok(())
    }

    fn mount(&mut self) -> Result<()> {
        let target = self.plan.target_root.clone();
        self.rollback
            .register(CleanupAction::UnmountTree(target.clone()));

        let mounts = [
            (self.layout.root_device(), target),
            (self.layout.home_device(), self.plan.home_mount()),
            (self.layout.efi_partition.clone(), self.plan.boot_mount()),
        ];
        for (device, mountpoint) in mounts {
            self.exec(Stage::Mount, Operation::create_dir(&mountpoint))?;
            self.exec(
                Stage::Mount,
                Operation::exec("mount", [path_arg(&device), path_arg(&mountpoint)]),
            )?;
        }
        Ok(())
    }

    fn mirror_configure(&mut self) -> Result<()> {
        self.exec(
            Stage::MirrorConfigure,
            Operation::exec(
                "cp",
                [MIRRORLIST_PATH.to_string(), format!("{}.backup", MIRRORLIST_PATH)],
            ),
        )?;

        let args = [
            "--country".to_string(),
            self.plan.mirror_countries.join(","),
            "--latest".to_string(),
            self.plan.mirror_latest.to_string(),
            "--protocol".to_string(),
            "https".to_string(),
            "--sort".to_string(),
            "rate".to_string(),
            "--number".to_string(),
            self.plan.mirror_count.to_string(),
            "--save".to_string(),
            MIRRORLIST_PATH.to_string(),
        ];
        self.exec(Stage::MirrorConfigure, Operation::exec("reflector", args))?;
        Ok(())
    }

    fn base_install(&mut self) -> Result<()> {
        let mut args = vec!["-K".to_string(), path_arg(&self.plan.target_root)];
        args.extend(self.plan.packages.iter().cloned());
        self.exec(Stage::BaseInstall, Operation::exec("pacstrap", args))?;
        Ok(())
    }

    fn fstab_generate(&mut self) -> Result<()> {
        let target = self.plan.target_root.clone();
        let table = self
            .exec(
                Stage::FstabGenerate,
                Operation::query("genfstab", ["-U".to_string(), path_arg(&target)], DRY_RUN_FSTAB),
            )?
            .stdout;

        if !self.runner.mode().is_dry_run() {
            verify_fstab(&table, FSTAB_MOUNTPOINTS)
                .map_err(|e| InstallError::stage(Stage::FstabGenerate, e))?;
        }

        let fstab = target.join("etc/fstab");
        self.prompter.show(&table)?;
        let question = format!("Write this table to {}?", fstab.display());
        if !ConfirmationGate::confirm(self.prompter, &question)? {
            return Err(InstallError::stage(
                Stage::FstabGenerate,
                "fstab not confirmed; the installed system cannot boot without it",
            ));
        }

        self.exec(Stage::FstabGenerate, Operation::append_file(fstab, table))?;
        Ok(())
    }

    fn chroot_configure(&mut self) -> Result<()> {
        let plan = self.plan;
        let timezone = self.ask_valid(
            "Timezone",
            Some(plan.default_timezone.as_str()),
            config::validate_timezone,
        )?;
        let hostname = self.ask_valid("Hostname", None, config::validate_hostname)?;
        let username = self.ask_valid("New username", None, config::validate_username)?;

        let luks_uuid = self.resolve_luks_uuid()?;
        let settings = ChrootSettings {
            timezone,
            locale: self.plan.locale.clone(),
            hostname,
            username,
            user_groups: self.plan.user_groups.clone(),
            admin_group: self.plan.admin_group.clone(),
            user_shell: self.plan.user_shell.clone(),
            luks_uuid,
            mapping_name: self.plan.mapping_name.clone(),
            root_device: self.layout.root_device(),
            disk: self.plan.disk.clone(),
            bootloader_id: self.plan.bootloader_id.clone(),
        };
        let script = ChrootPlan::build(&settings).render_script();

        let host_path = chroot_script_host_path(&self.plan.target_root);
        self.exec(
            Stage::ChrootConfigure,
            Operation::write_executable(&host_path, script),
        )?;

        let outcome = self.runner.run(&Operation::interactive(
            "arch-chroot",
            [path_arg(&self.plan.target_root), CHROOT_SCRIPT.to_string()],
        ));

        // The script is single-use whatever happened
        if let Err(e) = self.runner.run(&Operation::remove_file(&host_path)) {
            log::warn!("Could not remove {}: {}", host_path.display(), e);
        }

        outcome.map(|_| ()).map_err(chroot_failure)
    }

    /// LUKS partition UUID, resolved before the script is generated
    fn resolve_luks_uuid(&mut self) -> Result<String> {
        let crypt = path_arg(&self.layout.crypt_partition);
        let output = self.exec(
            Stage::ChrootConfigure,
            Operation::query(
                "blkid",
                [
                    "-s".to_string(),
                    "UUID".to_string(),
                    "-o".to_string(),
                    "value".to_string(),
                    crypt.clone(),
                ],
                DRY_RUN_UUID,
            ),
        )?;

        let uuid = output.stdout.trim().to_string();
        let well_formed = !uuid.is_empty()
            && uuid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !well_formed {
            return Err(InstallError::stage(
                Stage::ChrootConfigure,
                format!("no usable UUID for {} (got {:?})", crypt, uuid),
            ));
        }
        log::info!("LUKS partition {} has UUID {}", crypt, uuid);
        Ok(uuid)
    }

    /// Ask until the answer passes `validate`
    fn ask_valid(
        &mut self,
        question: &str,
        default: Option<&str>,
        validate: fn(&str) -> anyhow::Result<()>,
    ) -> Result<String> {
        loop {
            let answer = self.prompter.ask(question, default)?;
            match validate(&answer) {
                Ok(()) => return Ok(answer),
                Err(e) => self.prompter.show(&format!("Invalid input: {}", e))?,
            }
        }
    }
}

/// `<target>/root/archcrypt-chroot.sh`
pub fn chroot_script_host_path(target_root: &Path) -> PathBuf {
    target_root.join(CHROOT_SCRIPT.trim_start_matches('/'))
}

/// Check that every mountpoint in `required` has a `UUID=` entry.
pub fn verify_fstab(table: &str, required: &[&str]) -> std::result::Result<(), String> {
    let keyed: Vec<&str> = table
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(source), Some(mountpoint)) if source.starts_with("UUID=") => {
                    Some(mountpoint)
                }
                _ => None,
            }
        })
        .collect();

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|mp| !keyed.contains(mp))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "generated fstab lacks UUID entries for {}",
            missing.join(", ")
        ))
    }
}

fn chroot_failure(err: CommandError) -> InstallError {
    let step = err.exit_code().and_then(ChrootStepKind::from_exit_code);
    InstallError::ChrootStage {
        step,
        cause: err.to_string(),
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
