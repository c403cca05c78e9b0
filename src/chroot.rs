//! Configuration of the installed system from inside the new root.
//!
//! The nine chroot steps are modelled as data: each [`ChrootStep`] is a
//! list of typed [`ChrootCommand`]s. At the boundary the plan is rendered
//! once into a bash script that runs under `arch-chroot`. All values
//! (timezone, hostname, user, the LUKS UUID) are substituted when the script
//! is generated, and every argument is shell-quoted, so the script depends
//! on nothing from the outer process.
//!
//! The script exits with `100 + step number` when a step fails, which
//! [`ChrootStepKind::from_exit_code`] maps back to the failing step.

use std::fmt::Write as _;
use std::path::PathBuf;

use strum::{Display, EnumIter, IntoEnumIterator};

/// Exit code base used by the generated script's ERR trap
pub const STEP_EXIT_BASE: i32 = 100;

/// How often `passwd` may be retried before the Credentials step fails
pub const PASSWORD_ATTEMPTS: u32 = 3;

/// Drop-in holding the elevation rule for the administrative group
pub const SUDOERS_DROP_IN: &str = "/etc/sudoers.d/10-archcrypt";

/// Hooks for the initramfs. `encrypt` and `lvm2` unlock and activate the
/// root before `filesystems` mounts it.
pub const INITRAMFS_HOOKS: &[&str] = &[
    "base",
    "udev",
    "autodetect",
    "microcode",
    "modconf",
    "kms",
    "keyboard",
    "keymap",
    "consolefont",
    "block",
    "encrypt",
    "lvm2",
    "filesystems",
    "fsck",
];

/// The chroot steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ChrootStepKind {
    Timezone,
    Localization,
    Hostname,
    InitImageRebuild,
    Credentials,
    Privilege,
    NetworkService,
    BootloaderInstall,
    FirmwareFallback,
}

impl ChrootStepKind {
    /// 1-based position in the sequence
    pub fn number(self) -> i32 {
        Self::iter().position(|k| k == self).map_or(0, |i| i as i32 + 1)
    }

    /// Map the generated script's exit code back to the failing step
    pub fn from_exit_code(code: i32) -> Option<Self> {
        let index = code.checked_sub(STEP_EXIT_BASE + 1)?;
        Self::iter().nth(usize::try_from(index).ok()?)
    }
}

/// One command inside the new root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChrootCommand {
    /// Run a program with arguments
    Run(Vec<String>),
    /// Replace every line starting with `prefix` by `line`
    ReplaceLine {
        path: String,
        prefix: String,
        line: String,
    },
    /// Overwrite a file with `contents` plus a trailing newline
    WriteFile { path: String, contents: String },
    /// Run an operator-driven command again until it succeeds, at most
    /// `attempts` times. Used for password entry, where a mistyped
    /// confirmation should not fail the step.
    Reprompt { argv: Vec<String>, attempts: u32 },
}

impl ChrootCommand {
    fn run<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Run(argv.into_iter().map(Into::into).collect())
    }

    fn reprompt<I, S>(argv: I, attempts: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Reprompt {
            argv: argv.into_iter().map(Into::into).collect(),
            attempts,
        }
    }

    fn replace_line(path: &str, prefix: impl Into<String>, line: impl Into<String>) -> Self {
        Self::ReplaceLine {
            path: path.to_string(),
            prefix: prefix.into(),
            line: line.into(),
        }
    }

    fn write_file(path: &str, contents: impl Into<String>) -> Self {
        Self::WriteFile {
            path: path.to_string(),
            contents: contents.into(),
        }
    }

    /// Render as one line of bash
    pub fn to_shell(&self) -> String {
        match self {
            Self::Run(argv) => quote_argv(argv),
            Self::ReplaceLine { path, prefix, line } => {
                let expr = format!(
                    "s|^{}.*|{}|",
                    sed_escape_pattern(prefix),
                    sed_escape_replacement(line)
                );
                format!("sed -i {} {}", shell_quote(&expr), shell_quote(path))
            }
            Self::WriteFile { path, contents } => {
                format!(
                    "printf '%s\\n' {} > {}",
                    shell_quote(contents),
                    shell_quote(path)
                )
            }
            // The failing command sits in the `until` condition, where the
            // ERR trap does not fire; `false` in the body does once the
            // attempts are used up.
            Self::Reprompt { argv, attempts } => format!(
                "tries=0; until {}; do tries=$((tries + 1)); \
                 if [ \"$tries\" -ge {} ]; then false; fi; \
                 echo 'Did not take, try again'; done",
                quote_argv(argv),
                (*attempts).max(1)
            ),
        }
    }
}

fn quote_argv(argv: &[String]) -> String {
    argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

/// A step and its commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootStep {
    pub kind: ChrootStepKind,
    pub commands: Vec<ChrootCommand>,
}

/// Everything the chroot steps substitute, fixed before the script exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootSettings {
    pub timezone: String,
    pub locale: String,
    pub hostname: String,
    pub username: String,
    pub user_groups: Vec<String>,
    /// Member of `user_groups` granted elevation by the Privilege step
    pub admin_group: String,
    pub user_shell: String,
    /// UUID of the LUKS partition, resolved by the outer process
    pub luks_uuid: String,
    pub mapping_name: String,
    pub root_device: PathBuf,
    /// Whole disk, for the firmware boot entry
    pub disk: PathBuf,
    pub bootloader_id: String,
}

/// The ordered chroot configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootPlan {
    pub steps: Vec<ChrootStep>,
}

impl ChrootPlan {
    pub fn build(settings: &ChrootSettings) -> Self {
        let steps = ChrootStepKind::iter()
            .map(|kind| ChrootStep {
                kind,
                commands: step_commands(kind, settings),
            })
            .collect();
        Self { steps }
    }

    /// Serialize to the one-shot script executed inside the new root
    pub fn render_script(&self) -> String {
        let total = self.steps.len();
        let mut script = String::new();
        script.push_str("#!/bin/bash\n");
        script.push_str("# Generated by archcrypt. Runs once inside the new root, then is deleted.\n");
        script.push_str("set -euo pipefail\n");
        script.push_str("STEP=0\n");
        let _ = writeln!(script, "trap 'exit $(({} + STEP))' ERR", STEP_EXIT_BASE);

        for step in &self.steps {
            let number = step.kind.number();
            script.push('\n');
            let _ = writeln!(script, "STEP={}", number);
            let _ = writeln!(
                script,
                "echo {}",
                shell_quote(&format!("==> [{}/{}] {}", number, total, step.kind))
            );
            for command in &step.commands {
                script.push_str(&command.to_shell());
                script.push('\n');
            }
        }
        script
    }
}

fn step_commands(kind: ChrootStepKind, s: &ChrootSettings) -> Vec<ChrootCommand> {
    use ChrootCommand as C;

    match kind {
        ChrootStepKind::Timezone => vec![
            C::run([
                "ln".to_string(),
                "-sf".to_string(),
                format!("/usr/share/zoneinfo/{}", s.timezone),
                "/etc/localtime".to_string(),
            ]),
            C::run(["hwclock", "--systohc"]),
        ],
        ChrootStepKind::Localization => {
            let entry = format!("{} {}", s.locale, locale_charset(&s.locale));
            vec![
                C::replace_line("/etc/locale.gen", format!("#{}", entry), entry),
                C::run(["locale-gen"]),
                C::write_file("/etc/locale.conf", format!("LANG={}", s.locale)),
            ]
        }
        ChrootStepKind::Hostname => vec![
            C::write_file("/etc/hostname", s.hostname.clone()),
            C::write_file(
                "/etc/hosts",
                format!(
                    "127.0.0.1 localhost\n::1 localhost\n127.0.1.1 {0}.localdomain {0}",
                    s.hostname
                ),
            ),
        ],
        ChrootStepKind::InitImageRebuild => vec![
            C::replace_line(
                "/etc/mkinitcpio.conf",
                "HOOKS=",
                format!("HOOKS=({})", INITRAMFS_HOOKS.join(" ")),
            ),
            C::run(["mkinitcpio", "-P"]),
        ],
        ChrootStepKind::Credentials => {
            let mut commands: Vec<ChrootCommand> = s
                .user_groups
                .iter()
                .map(|group| C::run(["groupadd", "-f", group.as_str()]))
                .collect();
            commands.extend([
                C::run(["echo", "Set the root password"]),
                C::reprompt(["passwd"], PASSWORD_ATTEMPTS),
                C::run([
                    "useradd".to_string(),
                    "-m".to_string(),
                    "-G".to_string(),
                    s.user_groups.join(","),
                    "-s".to_string(),
                    s.user_shell.clone(),
                    s.username.clone(),
                ]),
                C::run(["echo".to_string(), format!("Set the password for {}", s.username)]),
                C::reprompt(["passwd", s.username.as_str()], PASSWORD_ATTEMPTS),
            ]);
            commands
        }
        ChrootStepKind::Privilege => vec![
            C::write_file(
                SUDOERS_DROP_IN,
                format!("%{} ALL=(ALL:ALL) ALL", s.admin_group),
            ),
            C::run(["chmod", "0440", SUDOERS_DROP_IN]),
            C::run(["visudo", "-c", "-f", SUDOERS_DROP_IN]),
        ],
        ChrootStepKind::NetworkService => vec![C::run(["systemctl", "enable", "NetworkManager"])],
        ChrootStepKind::BootloaderInstall => vec![
            C::replace_line(
                "/etc/default/grub",
                "GRUB_CMDLINE_LINUX=",
                format!(
                    "GRUB_CMDLINE_LINUX=\"cryptdevice=UUID={}:{} root={}\"",
                    s.luks_uuid,
                    s.mapping_name,
                    s.root_device.display()
                ),
            ),
            C::run([
                "grub-install".to_string(),
                "--target=x86_64-efi".to_string(),
                "--efi-directory=/boot".to_string(),
                format!("--bootloader-id={}", s.bootloader_id),
            ]),
            C::run(["grub-mkconfig", "-o", "/boot/grub/grub.cfg"]),
        ],
        ChrootStepKind::FirmwareFallback => vec![
            C::run(["mkdir", "-p", "/boot/EFI/BOOT"]),
            C::run([
                "cp".to_string(),
                format!("/boot/EFI/{}/grubx64.efi", s.bootloader_id),
                "/boot/EFI/BOOT/BOOTX64.EFI".to_string(),
            ]),
            C::run([
                "efibootmgr".to_string(),
                "--create".to_string(),
                "--disk".to_string(),
                s.disk.display().to_string(),
                "--part".to_string(),
                "1".to_string(),
                "--label".to_string(),
                s.bootloader_id.clone(),
                "--loader".to_string(),
                format!("\\EFI\\{}\\grubx64.efi", s.bootloader_id),
            ]),
        ],
    }
}

/// `en_US.UTF-8` -> `UTF-8`; locales without a codeset default to UTF-8
fn locale_charset(locale: &str) -> &str {
    locale
        .split_once('.')
        .map(|(_, charset)| charset.split('@').next().unwrap_or(charset))
        .unwrap_or("UTF-8")
}

/// Quote a word for bash. Safe words are left bare.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Escape a literal for a sed basic regular expression delimited by `|`
fn sed_escape_pattern(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.[]*^$|".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a literal for a sed replacement delimited by `|`
fn sed_escape_replacement(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\&|".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ChrootSettings {
        ChrootSettings {
            timezone: "UTC".to_string(),
            locale: "en_US.UTF-8".to_string(),
            hostname: "testhost".to_string(),
            username: "alice".to_string(),
            user_groups: vec!["wheel".to_string()],
            admin_group: "wheel".to_string(),
            user_shell: "/bin/bash".to_string(),
            luks_uuid: "1234-5678".to_string(),
            mapping_name: "cryptlvm".to_string(),
            root_device: PathBuf::from("/dev/vg0/root"),
            disk: PathBuf::from("/dev/vda"),
            bootloader_id: "GRUB".to_string(),
        }
    }

    #[test]
    fn test_steps_in_order() {
        let plan = ChrootPlan::build(&settings());
        let kinds: Vec<_> = plan.steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, ChrootStepKind::iter().collect::<Vec<_>>());
        assert_eq!(kinds.len(), 9);
        assert_eq!(kinds[0], ChrootStepKind::Timezone);
        assert_eq!(kinds[8], ChrootStepKind::FirmwareFallback);
    }

    #[test]
    fn test_script_embeds_literal_uuid() {
        let script = ChrootPlan::build(&settings()).render_script();
        assert!(script.contains(
            r#"'s|^GRUB_CMDLINE_LINUX=.*|GRUB_CMDLINE_LINUX="cryptdevice=UUID=1234-5678:cryptlvm root=/dev/vg0/root"|'"#
        ));
        assert!(!script.contains("/dev/vda2"));
        assert!(!script.contains("$UUID"));
    }

    #[test]
    fn test_script_header_and_trap() {
        let script = ChrootPlan::build(&settings()).render_script();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("set -euo pipefail\n"));
        assert!(script.contains("trap 'exit $((100 + STEP))' ERR\n"));
        assert!(script.contains("STEP=9\n"));
        assert!(script.contains("echo '==> [3/9] Hostname'\n"));
    }

    #[test]
    fn test_timezone_and_hostname_commands() {
        let script = ChrootPlan::build(&settings()).render_script();
        assert!(script.contains("ln -sf /usr/share/zoneinfo/UTC /etc/localtime\n"));
        assert!(script.contains("hwclock --systohc\n"));
        assert!(script.contains("printf '%s\\n' testhost > /etc/hostname\n"));
    }

    #[test]
    fn test_locale_entry_enabled() {
        let script = ChrootPlan::build(&settings()).render_script();
        assert!(script.contains(r"sed -i 's|^#en_US\.UTF-8 UTF-8.*|en_US.UTF-8 UTF-8|' /etc/locale.gen"));
        assert!(script.contains("printf '%s\\n' LANG=en_US.UTF-8 > /etc/locale.conf\n"));
    }

    #[test]
    fn test_unlock_hooks_precede_filesystems() {
        let pos = |hook: &str| INITRAMFS_HOOKS.iter().position(|h| *h == hook);
        let filesystems = pos("filesystems").expect("filesystems hook"); // test: constant
        assert!(pos("block").expect("block") < pos("encrypt").expect("encrypt")); // test: constant
        assert!(pos("encrypt").expect("encrypt") < pos("lvm2").expect("lvm2")); // test: constant
        assert!(pos("lvm2").expect("lvm2") < filesystems); // test: constant
    }

    #[test]
    fn test_credentials_never_contain_passwords() {
        let plan = ChrootPlan::build(&settings());
        let creds = &plan.steps[ChrootStepKind::Credentials.number() as usize - 1];
        let shell: Vec<String> = creds.commands.iter().map(|c| c.to_shell()).collect();
        assert!(shell.contains(&"groupadd -f wheel".to_string()));
        assert!(shell.contains(&"useradd -m -G wheel -s /bin/bash alice".to_string()));
        assert!(shell.iter().any(|line| line.starts_with("tries=0; until passwd; do")));
        assert!(shell.iter().any(|line| line.starts_with("tries=0; until passwd alice; do")));
        assert!(shell.iter().all(|line| !line.contains("--stdin") && !line.contains("chpasswd")));
    }

    #[test]
    fn test_mistyped_password_is_asked_again() {
        let command = ChrootCommand::reprompt(["passwd", "alice"], 3);
        assert_eq!(
            command.to_shell(),
            "tries=0; until passwd alice; do tries=$((tries + 1)); \
             if [ \"$tries\" -ge 3 ]; then false; fi; \
             echo 'Did not take, try again'; done"
        );
    }

    #[test]
    fn test_admin_group_gets_elevation() {
        let mut s = settings();
        s.user_groups = vec!["sudo".to_string(), "video".to_string()];
        s.admin_group = "sudo".to_string();
        let script = ChrootPlan::build(&s).render_script();

        assert!(script.contains("groupadd -f sudo\n"));
        assert!(script.contains("useradd -m -G sudo,video -s /bin/bash alice\n"));
        assert!(script.contains(
            "printf '%s\\n' '%sudo ALL=(ALL:ALL) ALL' > /etc/sudoers.d/10-archcrypt\n"
        ));
        assert!(script.contains("chmod 0440 /etc/sudoers.d/10-archcrypt\n"));
        assert!(script.contains("visudo -c -f /etc/sudoers.d/10-archcrypt\n"));
        assert!(!script.contains("%wheel"));
    }

    #[test]
    fn test_firmware_fallback_entry() {
        let script = ChrootPlan::build(&settings()).render_script();
        assert!(script.contains("cp /boot/EFI/GRUB/grubx64.efi /boot/EFI/BOOT/BOOTX64.EFI\n"));
        assert!(script.contains(
            r"efibootmgr --create --disk /dev/vda --part 1 --label GRUB --loader '\EFI\GRUB\grubx64.efi'"
        ));
    }

    #[test]
    fn test_step_numbers_and_exit_codes() {
        assert_eq!(ChrootStepKind::Timezone.number(), 1);
        assert_eq!(ChrootStepKind::FirmwareFallback.number(), 9);
        assert_eq!(
            ChrootStepKind::from_exit_code(103),
            Some(ChrootStepKind::Hostname)
        );
        assert_eq!(
            ChrootStepKind::from_exit_code(109),
            Some(ChrootStepKind::FirmwareFallback)
        );
        assert_eq!(ChrootStepKind::from_exit_code(100), None);
        assert_eq!(ChrootStepKind::from_exit_code(110), None);
        assert_eq!(ChrootStepKind::from_exit_code(1), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/dev/vda"), "/dev/vda");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
    }

    #[test]
    fn test_sed_escaping() {
        assert_eq!(sed_escape_pattern("a.b*[c]"), r"a\.b\*\[c\]");
        assert_eq!(sed_escape_replacement("x&y|z"), r"x\&y\|z");
    }

    #[test]
    fn test_locale_charset() {
        assert_eq!(locale_charset("en_US.UTF-8"), "UTF-8");
        assert_eq!(locale_charset("de_DE.ISO-8859-1"), "ISO-8859-1");
        assert_eq!(locale_charset("C"), "UTF-8");
    }
}
