//! Pre-flight checks run before anything touches the disk.
//!
//! - One TCP reachability probe to the package host (no retries)
//! - The target disk must be an existing block device
//! - Live mode only: root privileges and the external tools the stages call
//!
//! A failure here is fatal and needs no rollback: nothing has been acquired.

use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;

use crate::error::PreflightError;
use crate::plan::{ExecutionMode, InstallPlan};

/// External tools the provisioning stages invoke
pub const REQUIRED_TOOLS: &[&str] = &[
    "wipefs",
    "sgdisk",
    "parted",
    "partprobe",
    "mkfs.fat",
    "mkfs.ext4",
    "cryptsetup",
    "pvcreate",
    "vgcreate",
    "lvcreate",
    "vgchange",
    "mount",
    "umount",
    "reflector",
    "pacstrap",
    "genfstab",
    "arch-chroot",
    "blkid",
];

/// Run every check for `plan`, stopping at the first failure.
pub fn validate(plan: &InstallPlan) -> Result<(), PreflightError> {
    if plan.mode == ExecutionMode::Live {
        check_environment()?;
    }
    check_network(&plan.probe_host, Duration::from_secs(plan.probe_timeout_secs))?;
    check_block_device(&plan.disk)?;
    log::info!("Preflight checks passed for {}", plan.disk.display());
    Ok(())
}

/// Single reachability probe: resolve `host` (`name:port`) and open a TCP
/// connection to the first address within `timeout`.
pub fn check_network(host: &str, timeout: Duration) -> Result<(), PreflightError> {
    let unreachable = |reason: String| PreflightError::NetworkUnreachable {
        host: host.to_string(),
        reason,
    };

    let addr = host
        .to_socket_addrs()
        .map_err(|e| unreachable(format!("name resolution failed: {}", e)))?
        .next()
        .ok_or_else(|| unreachable("no addresses resolved".to_string()))?;

    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_stream) => {
            log::info!("Network connectivity confirmed (TCP to {})", host);
            Ok(())
        }
        Err(e) => Err(unreachable(e.to_string())),
    }
}

/// Confirm that `disk` names an existing block device.
pub fn check_block_device(disk: &Path) -> Result<(), PreflightError> {
    let invalid = |reason: &str| PreflightError::InvalidDevice {
        device: disk.display().to_string(),
        reason: reason.to_string(),
    };

    let metadata = std::fs::metadata(disk).map_err(|e| invalid(&e.to_string()))?;
    if !metadata.file_type().is_block_device() {
        return Err(invalid("not a block device"));
    }
    Ok(())
}

/// Root privileges and required tools
fn check_environment() -> Result<(), PreflightError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(PreflightError::NotRoot);
    }

    let missing = missing_tools(REQUIRED_TOOLS);
    if !missing.is_empty() {
        return Err(PreflightError::MissingTools(missing));
    }
    Ok(())
}

/// Names from `tools` that are not executable anywhere on `PATH`
pub fn missing_tools(tools: &[&str]) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| !binary_exists(tool))
        .map(|tool| tool.to_string())
        .collect()
}

fn binary_exists(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        std::fs::metadata(dir.join(name))
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallConfig;
    use std::net::TcpListener;

    #[test]
    fn test_network_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind"); // test: loopback available
        let host = listener.local_addr().expect("addr").to_string(); // test: bound socket
        assert!(check_network(&host, Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_network_probe_fails_when_nothing_listens() {
        // Bind then drop to get a port that is very likely closed
        let host = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind"); // test: loopback available
            listener.local_addr().expect("addr").to_string() // test: bound socket
        };
        let err = check_network(&host, Duration::from_secs(1)).expect_err("closed port"); // test: expected error
        assert!(matches!(err, PreflightError::NetworkUnreachable { .. }));
    }

    #[test]
    fn test_network_probe_rejects_unparseable_host() {
        let err = check_network("no-port-given", Duration::from_secs(1)).expect_err("bad host"); // test: expected error
        assert!(matches!(err, PreflightError::NetworkUnreachable { .. }));
    }

    #[test]
    fn test_missing_device_is_invalid() {
        let err = check_block_device(Path::new("/dev/does-not-exist-xyz")).expect_err("missing"); // test: expected error
        assert!(matches!(err, PreflightError::InvalidDevice { .. }));
    }

    #[test]
    fn test_character_device_is_invalid() {
        let err = check_block_device(Path::new("/dev/null")).expect_err("char device"); // test: expected error
        match err {
            PreflightError::InvalidDevice { reason, .. } => assert_eq!(reason, "not a block device"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_regular_file_is_invalid() {
        let file = tempfile::NamedTempFile::new().expect("temp file"); // test: tempfile creation
        assert!(check_block_device(file.path()).is_err());
    }

    #[test]
    fn test_dry_run_validate_checks_network_before_device() {
        let mut config = InstallConfig::default();
        config.probe_host = "no-port-given".to_string();
        let plan = InstallPlan::new(config, "/dev/null", ExecutionMode::DryRun);
        assert!(matches!(
            validate(&plan),
            Err(PreflightError::NetworkUnreachable { .. })
        ));
    }

    #[test]
    fn test_missing_tools_reports_unknown_binary() {
        let missing = missing_tools(&["sh", "definitely-not-a-real-binary-xyz"]);
        assert_eq!(missing, vec!["definitely-not-a-real-binary-xyz".to_string()]);
    }
}
