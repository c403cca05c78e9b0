//! Property-Based Tests for archcrypt
//!
//! These tests verify:
//! - Partition layout derivation is deterministic and size-independent
//! - A failure at any operation stops the pipeline and rolls back once
//! - Confirmation parsing only accepts an explicit yes

mod common;

use std::path::PathBuf;

use proptest::prelude::*;

use archcrypt::config::InstallConfig;
use archcrypt::error::InstallError;
use archcrypt::installer;
use archcrypt::plan::{ExecutionMode, InstallPlan};
use archcrypt::prompt::parse_yes;
use archcrypt::rollback::RollbackManager;
use archcrypt::runner::Operation;

use common::{RecordingRunner, ScriptedPrompter, cleanup_descriptions, plan};

// =============================================================================
// Partition layout
// =============================================================================

proptest! {
    /// `/dev/sdX` always yields `/dev/sdX1` and `/dev/sdX2`
    #[test]
    fn layout_is_deterministic(
        letter in "[a-z]",
        efi in 100u32..4096,
        root in 1u32..2048,
    ) {
        let disk = format!("/dev/sd{}", letter);
        let mut config = InstallConfig::default();
        config.efi_size_mib = efi;
        config.root_size_gib = root;
        let layout = InstallPlan::new(config, disk.as_str(), ExecutionMode::Live).layout();

        prop_assert_eq!(&layout.efi_partition, &PathBuf::from(format!("{}1", disk)));
        prop_assert_eq!(&layout.crypt_partition, &PathBuf::from(format!("{}2", disk)));
        prop_assert_eq!(layout, plan(&disk, ExecutionMode::DryRun).layout());
    }

    /// Disks whose name ends in a digit get a `p` separator
    #[test]
    fn numbered_disks_use_p_separator(controller in 0u32..8, namespace in 1u32..8) {
        let disk = format!("/dev/nvme{}n{}", controller, namespace);
        let layout = plan(&disk, ExecutionMode::Live).layout();
        prop_assert_eq!(layout.efi_partition, PathBuf::from(format!("{}p1", disk)));
        prop_assert_eq!(layout.crypt_partition, PathBuf::from(format!("{}p2", disk)));
    }
}

// =============================================================================
// Failure at any stage
// =============================================================================

/// Operations of a successful live run
fn reference_run() -> Vec<Operation> {
    let mut runner = RecordingRunner::live();
    installer::run(
        &plan("/dev/vda", ExecutionMode::Live),
        &mut runner,
        &mut ScriptedPrompter::happy_path(),
        &RollbackManager::new(),
    )
    .expect("reference run succeeds"); // test: happy path
    runner.ops
}

/// Indices whose failure is fatal: everything between the disk size probe
/// and the final teardown, except removing the chroot script
fn fatal_indices(reference: &[Operation]) -> Vec<usize> {
    let teardown = reference
        .iter()
        .position(|op| op.program() == Some("umount"))
        .expect("teardown present"); // test: reference contains teardown
    (1..teardown)
        .filter(|&i| !matches!(reference[i], Operation::RemoveFile { .. }))
        .collect()
}

fn position_of(reference: &[Operation], description: &str) -> usize {
    reference
        .iter()
        .position(|op| op.to_string().starts_with(description))
        .unwrap_or_else(|| panic!("missing {}", description))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn failure_at_any_operation_rolls_back_once(pick in any::<prop::sample::Index>()) {
        let reference = reference_run();
        let candidates = fatal_indices(&reference);
        let k = candidates[pick.index(candidates.len())];

        let mut runner = RecordingRunner::failing_at(k);
        let rollback = RollbackManager::new();
        let result = installer::run(
            &plan("/dev/vda", ExecutionMode::Live),
            &mut runner,
            &mut ScriptedPrompter::happy_path(),
            &rollback,
        );

        let stage_failure = matches!(
            result,
            Err(InstallError::Stage { .. }) | Err(InstallError::ChrootStage { .. })
        );
        prop_assert!(stage_failure);
        prop_assert!(rollback.has_run());

        // Identical up to and including the failing operation
        prop_assert_eq!(&runner.ops[..=k], &reference[..=k]);

        // Then only the script removal (after a chroot failure) and cleanup
        let mut expected_tail: Vec<String> = Vec::new();
        if reference[k].program() == Some("arch-chroot") {
            expected_tail.push(reference[k + 1].to_string());
        }
        let [unmount, deactivate, close] = cleanup_descriptions();
        if k >= position_of(&reference, "mkdir -p /mnt") {
            expected_tail.push(unmount.to_string());
        }
        if k >= position_of(&reference, "vgcreate") {
            expected_tail.push(deactivate.to_string());
        }
        if k >= position_of(&reference, "cryptsetup luksFormat") {
            expected_tail.push(close.to_string());
        }

        let tail: Vec<String> = runner.ops[k + 1..].iter().map(|op| op.to_string()).collect();
        prop_assert_eq!(tail, expected_tail);
    }
}

// =============================================================================
// Confirmation parsing
// =============================================================================

proptest! {
    /// Only y / yes (any case, surrounding whitespace) confirm
    #[test]
    fn parse_yes_accepts_only_explicit_yes(answer in "\\PC{0,8}") {
        let normalized = answer.trim().to_ascii_lowercase();
        let expected = normalized == "y" || normalized == "yes";
        prop_assert_eq!(parse_yes(&answer), expected);
    }

    #[test]
    fn parse_yes_ignores_case_and_padding(
        word in prop_oneof![Just("y"), Just("Y"), Just("yes"), Just("YES"), Just("Yes")],
        left in " {0,3}",
        right in "[ \t]{0,3}",
    ) {
        let answer = format!("{}{}{}", left, word, right);
        prop_assert!(parse_yes(&answer));
    }
}
