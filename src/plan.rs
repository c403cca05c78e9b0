//! The immutable install plan and the partition layout derived from it.
//!
//! `InstallPlan` is resolved once at startup and only ever read afterwards.
//! `PartitionLayout` is a pure function of the plan: the same disk always
//! yields the same partition and volume paths, whatever sizes are chosen.

use std::fmt;
use std::path::{Path, PathBuf};

use strum::Display;

use crate::config::InstallConfig;

/// Whether operations touch the real system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum ExecutionMode {
    #[default]
    Live,
    #[strum(serialize = "Dry run")]
    DryRun,
}

impl ExecutionMode {
    pub fn from_flag(dry_run: bool) -> Self {
        if dry_run { Self::DryRun } else { Self::Live }
    }

    #[inline]
    pub fn is_dry_run(self) -> bool {
        matches!(self, Self::DryRun)
    }
}

/// Everything the stages need to know, resolved before the first prompt
/// that can change the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub disk: PathBuf,
    pub mode: ExecutionMode,
    pub efi_size_mib: u32,
    pub root_size_gib: u32,
    pub target_root: PathBuf,
    pub mapping_name: String,
    pub volume_group: String,
    pub root_volume: String,
    pub home_volume: String,
    pub packages: Vec<String>,
    pub mirror_countries: Vec<String>,
    pub mirror_latest: u32,
    pub mirror_count: u32,
    pub locale: String,
    pub default_timezone: String,
    pub user_groups: Vec<String>,
    pub admin_group: String,
    pub user_shell: String,
    pub bootloader_id: String,
    pub probe_host: String,
    pub probe_timeout_secs: u64,
}

impl InstallPlan {
    /// Freeze a validated configuration and the chosen disk into a plan.
    pub fn new(config: InstallConfig, disk: impl Into<PathBuf>, mode: ExecutionMode) -> Self {
        Self {
            disk: disk.into(),
            mode,
            efi_size_mib: config.efi_size_mib,
            root_size_gib: config.root_size_gib,
            target_root: config.target_root,
            mapping_name: config.mapping_name,
            volume_group: config.volume_group,
            root_volume: config.root_volume,
            home_volume: config.home_volume,
            packages: config.packages,
            mirror_countries: config.mirror_countries,
            mirror_latest: config.mirror_latest,
            mirror_count: config.mirror_count,
            locale: config.locale,
            default_timezone: config.default_timezone,
            user_groups: config.user_groups,
            admin_group: config.admin_group,
            user_shell: config.user_shell,
            bootloader_id: config.bootloader_id,
            probe_host: config.probe_host,
            probe_timeout_secs: config.probe_timeout_secs,
        }
    }

    /// Derive the partition and volume layout for this plan
    pub fn layout(&self) -> PartitionLayout {
        PartitionLayout::derive(self)
    }

    /// Mountpoint of the home volume inside the target root
    pub fn home_mount(&self) -> PathBuf {
        self.target_root.join("home")
    }

    /// Mountpoint of the EFI system partition inside the target root
    pub fn boot_mount(&self) -> PathBuf {
        self.target_root.join("boot")
    }
}

/// Device paths every stage after partitioning refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    /// First partition: EFI system partition
    pub efi_partition: PathBuf,
    /// Second partition: LUKS container
    pub crypt_partition: PathBuf,
    /// Decrypted mapping, e.g. `/dev/mapper/cryptlvm`
    pub mapper_device: PathBuf,
    pub volume_group: String,
    pub root_volume: String,
    pub home_volume: String,
}

impl PartitionLayout {
    pub fn derive(plan: &InstallPlan) -> Self {
        Self {
            efi_partition: partition_path(&plan.disk, 1),
            crypt_partition: partition_path(&plan.disk, 2),
            mapper_device: Path::new("/dev/mapper").join(&plan.mapping_name),
            volume_group: plan.volume_group.clone(),
            root_volume: plan.root_volume.clone(),
            home_volume: plan.home_volume.clone(),
        }
    }

    /// `/dev/<vg>/<root>`
    pub fn root_device(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.volume_group, self.root_volume))
    }

    /// `/dev/<vg>/<home>`
    pub fn home_device(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.volume_group, self.home_volume))
    }
}

impl fmt::Display for PartitionLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ESP {} | LUKS {} -> {} | LVM {}/{{{},{}}}",
            self.efi_partition.display(),
            self.crypt_partition.display(),
            self.mapper_device.display(),
            self.volume_group,
            self.root_volume,
            self.home_volume
        )
    }
}

/// Generate a partition device path from a disk path and partition number.
///
/// Handles both `/dev/sdX` → `/dev/sdX1` and `/dev/nvme0n1` → `/dev/nvme0n1p1` patterns.
pub fn partition_path(disk: &Path, partition_num: u32) -> PathBuf {
    let disk_str = disk.display().to_string();

    // NVMe, mmcblk and loop devices use 'p' separator
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, partition_num))
    } else {
        PathBuf::from(format!("{}{}", disk_str, partition_num))
    }
}

/// Approximate space left for the home volume, for display before the
/// destructive confirmation only. Volume sizing never reads this.
pub fn estimate_home_gib(disk_bytes: u64, plan: &InstallPlan) -> Option<u64> {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    // 1 MiB alignment gap + 16 MiB LUKS2 header
    let reserved = u64::from(plan.efi_size_mib) * MIB
        + u64::from(plan.root_size_gib) * GIB
        + 17 * MIB;
    disk_bytes.checked_sub(reserved).map(|rest| rest / GIB)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_for(disk: &str) -> InstallPlan {
        InstallPlan::new(InstallConfig::default(), disk, ExecutionMode::Live)
    }

    #[test]
    fn test_partition_path_sda() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 1), PathBuf::from("/dev/sda1"));
        assert_eq!(partition_path(Path::new("/dev/sda"), 2), PathBuf::from("/dev/sda2"));
    }

    #[test]
    fn test_partition_path_nvme() {
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 2),
            PathBuf::from("/dev/mmcblk0p2")
        );
    }

    #[test]
    fn test_layout_for_vda() {
        let layout = plan_for("/dev/vda").layout();
        assert_eq!(layout.efi_partition, PathBuf::from("/dev/vda1"));
        assert_eq!(layout.crypt_partition, PathBuf::from("/dev/vda2"));
        assert_eq!(layout.mapper_device, PathBuf::from("/dev/mapper/cryptlvm"));
        assert_eq!(layout.root_device(), PathBuf::from("/dev/vg0/root"));
        assert_eq!(layout.home_device(), PathBuf::from("/dev/vg0/home"));
    }

    #[test]
    fn test_layout_ignores_sizes() {
        let mut config = InstallConfig::default();
        config.efi_size_mib = 1024;
        config.root_size_gib = 200;
        let big = InstallPlan::new(config, "/dev/sdb", ExecutionMode::Live);
        assert_eq!(big.layout(), plan_for("/dev/sdb").layout());
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(ExecutionMode::from_flag(true), ExecutionMode::DryRun);
        assert_eq!(ExecutionMode::from_flag(false), ExecutionMode::Live);
        assert!(ExecutionMode::DryRun.is_dry_run());
        assert_eq!(ExecutionMode::DryRun.to_string(), "Dry run");
    }

    #[test]
    fn test_mountpoints_under_target_root() {
        let plan = plan_for("/dev/sda");
        assert_eq!(plan.home_mount(), PathBuf::from("/mnt/home"));
        assert_eq!(plan.boot_mount(), PathBuf::from("/mnt/boot"));
    }

    #[test]
    fn test_estimate_home_gib() {
        let plan = plan_for("/dev/sda");
        let disk = 100 * 1024 * 1024 * 1024_u64;
        // 100 GiB - 40 GiB root - 529 MiB overhead
        assert_eq!(estimate_home_gib(disk, &plan), Some(59));
        assert_eq!(estimate_home_gib(10 * 1024 * 1024 * 1024, &plan), None);
    }
}
