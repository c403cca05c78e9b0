//! Configuration file handling for saving and loading install configurations.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. The resolved configuration is validated once and then frozen
//! into an `InstallPlan`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default package set for a minimal bootable encrypted system
pub const DEFAULT_PACKAGES: &[&str] = &[
    "base",
    "linux",
    "linux-firmware",
    "lvm2",
    "cryptsetup",
    "grub",
    "efibootmgr",
    "networkmanager",
    "sudo",
    "vim",
];

/// Installation configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    // Disk & Storage
    pub disk: String, // Empty means "ask at startup"
    pub efi_size_mib: u32,
    pub root_size_gib: u32,
    pub target_root: PathBuf,
    pub mapping_name: String,
    pub volume_group: String,
    pub root_volume: String,
    pub home_volume: String,

    // Packages & Mirrors
    pub packages: Vec<String>,
    pub mirror_countries: Vec<String>,
    pub mirror_latest: u32,
    pub mirror_count: u32,

    // System
    pub locale: String,
    pub default_timezone: String,
    pub user_groups: Vec<String>,
    /// Group granted sudo rights; must be one of `user_groups`
    pub admin_group: String,
    pub user_shell: String,
    pub bootloader_id: String,

    // Preflight
    pub probe_host: String,
    pub probe_timeout_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            disk: String::new(),
            efi_size_mib: 512,
            root_size_gib: 40,
            target_root: PathBuf::from("/mnt"),
            mapping_name: "cryptlvm".to_string(),
            volume_group: "vg0".to_string(),
            root_volume: "root".to_string(),
            home_volume: "home".to_string(),
            packages: DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect(),
            mirror_countries: vec!["US".to_string(), "CA".to_string()],
            mirror_latest: 20,
            mirror_count: 10,
            locale: "en_US.UTF-8".to_string(),
            default_timezone: "UTC".to_string(),
            user_groups: vec!["wheel".to_string()],
            admin_group: "wheel".to_string(),
            user_shell: "/bin/bash".to_string(),
            bootloader_id: "GRUB".to_string(),
            probe_host: "archlinux.org:443".to_string(),
            probe_timeout_secs: 5,
        }
    }
}

impl InstallConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// An empty `disk` is allowed here; it is prompted for before the plan
    /// is frozen.
    pub fn validate(&self) -> Result<()> {
        if !self.disk.is_empty() {
            validate_disk_path(&self.disk)?;
        }

        if self.efi_size_mib < 100 {
            anyhow::bail!("EFI partition must be at least 100 MiB");
        }
        if self.root_size_gib == 0 {
            anyhow::bail!("Root volume size must be greater than zero");
        }
        if !self.target_root.is_absolute() {
            anyhow::bail!("Target root must be an absolute path");
        }

        for (what, name) in [
            ("Mapping name", &self.mapping_name),
            ("Volume group", &self.volume_group),
            ("Root volume", &self.root_volume),
            ("Home volume", &self.home_volume),
        ] {
            validate_identifier(what, name)?;
        }
        if self.root_volume == self.home_volume {
            anyhow::bail!("Root and home volumes must have different names");
        }

        if self.packages.is_empty() {
            anyhow::bail!("Package set must not be empty");
        }
        if self.mirror_countries.is_empty() {
            anyhow::bail!("At least one mirror country is required");
        }
        if self.mirror_count == 0 || self.mirror_latest < self.mirror_count {
            anyhow::bail!("Mirror count must be between 1 and mirror_latest");
        }

        if !self
            .locale
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'))
        {
            anyhow::bail!("Locale contains invalid characters: {}", self.locale);
        }
        validate_timezone(&self.default_timezone)?;

        for group in &self.user_groups {
            validate_identifier("User group", group)?;
        }
        if !self.user_groups.contains(&self.admin_group) {
            anyhow::bail!(
                "Admin group '{}' must be one of the user groups ({})",
                self.admin_group,
                self.user_groups.join(", ")
            );
        }
        if !self.user_shell.starts_with('/') {
            anyhow::bail!("User shell must be an absolute path");
        }
        validate_identifier("Bootloader id", &self.bootloader_id)?;

        if self.probe_host.trim().is_empty() {
            anyhow::bail!("Probe host must be specified");
        }
        if self.probe_timeout_secs == 0 {
            anyhow::bail!("Probe timeout must be greater than zero");
        }

        Ok(())
    }
}

/// Validate a block device path (`/dev/...`, no whitespace)
pub fn validate_disk_path(disk: &str) -> Result<()> {
    if !disk.starts_with("/dev/") || disk.len() <= "/dev/".len() {
        anyhow::bail!("Invalid disk path '{}': must start with /dev/", disk);
    }
    if disk.chars().any(|c| c.is_whitespace()) {
        anyhow::bail!("Disk path must not contain whitespace");
    }
    Ok(())
}

/// Validate a hostname (1-63 chars, letters/digits/hyphen, no leading or trailing hyphen)
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 63 {
        anyhow::bail!("Hostname must be 1-63 characters long");
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        anyhow::bail!("Hostname must not start or end with a hyphen");
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        anyhow::bail!("Hostname can only contain letters, numbers, and hyphens");
    }
    Ok(())
}

/// Validate a login name (starts with a lowercase letter or underscore, max 32 chars)
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 32 {
        anyhow::bail!("Username must be 1-32 characters long");
    }
    if username == "root" {
        anyhow::bail!("Username must not be root");
    }
    if let Some(first) = username.chars().next() {
        if !(first.is_ascii_lowercase() || first == '_') {
            anyhow::bail!("Username must start with a lowercase letter or underscore");
        }
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        anyhow::bail!("Username can only contain lowercase letters, digits, '_' and '-'");
    }
    Ok(())
}

/// Validate a zoneinfo identifier such as `Europe/Berlin` or `UTC`
pub fn validate_timezone(zone: &str) -> Result<()> {
    if zone.is_empty() {
        anyhow::bail!("Timezone must be specified");
    }
    if zone.starts_with('/') || zone.split('/').any(|part| part.is_empty() || part == "..") {
        anyhow::bail!("Invalid timezone '{}'", zone);
    }
    if !zone
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'))
    {
        anyhow::bail!("Timezone contains invalid characters: {}", zone);
    }
    Ok(())
}

fn validate_identifier(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        anyhow::bail!("{} must be specified", what);
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        anyhow::bail!("{} can only contain letters, numbers, '_' and '-'", what);
    }
    Ok(())
}
