//! Shared fixtures: a recording command runner and a scripted prompter.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use archcrypt::config::InstallConfig;
use archcrypt::error::CommandError;
use archcrypt::plan::{ExecutionMode, InstallPlan};
use archcrypt::prompt::Prompter;
use archcrypt::runner::{CommandOutput, CommandRunner, Operation};

pub const LUKS_UUID: &str = "1234-5678";

/// 100 GiB
pub const DISK_BYTES: &str = "107374182400\n";

pub const FSTAB: &str = "\
# /dev/mapper/vg0-root
UUID=11111111-aaaa-4bbb-8ccc-000000000001 / ext4 rw,relatime 0 1

# /dev/mapper/vg0-home
UUID=11111111-aaaa-4bbb-8ccc-000000000002 /home ext4 rw,relatime 0 2

# /dev/vda1
UUID=ABCD-1234 /boot vfat rw,relatime 0 2
";

/// Records every operation and answers queries with canned output.
///
/// Operations succeed unless `fail_at` names their index or `fail_program`
/// names their program.
pub struct RecordingRunner {
    pub ops: Vec<Operation>,
    mode: ExecutionMode,
    fail_at: Option<usize>,
    fail_program: Option<(&'static str, i32)>,
}

impl RecordingRunner {
    pub fn live() -> Self {
        Self {
            ops: Vec::new(),
            mode: ExecutionMode::Live,
            fail_at: None,
            fail_program: None,
        }
    }

    /// Fail the operation with this index (0-based)
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::live()
        }
    }

    /// Fail every run of `program` with `code`
    pub fn failing_program(program: &'static str, code: i32) -> Self {
        Self {
            fail_program: Some((program, code)),
            ..Self::live()
        }
    }

    /// Display strings of the recorded operations
    pub fn descriptions(&self) -> Vec<String> {
        self.ops.iter().map(|op| op.to_string()).collect()
    }

    /// Contents of every write to `path`, in order
    pub fn writes_to(&self, path: &Path) -> Vec<String> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Operation::WriteFile { path: p, contents, .. } if p == path => {
                    Some(contents.clone())
                }
                _ => None,
            })
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&mut self, op: &Operation) -> Result<CommandOutput, CommandError> {
        let index = self.ops.len();
        self.ops.push(op.clone());

        let program = op.program().unwrap_or_default();
        let forced_code = match self.fail_program {
            Some((p, code)) if p == program => Some(code),
            _ if self.fail_at == Some(index) => Some(1),
            _ => None,
        };
        if let Some(code) = forced_code {
            return Err(CommandError::NonZeroExit {
                program: program.to_string(),
                code: Some(code),
                stderr: "simulated failure".to_string(),
            });
        }

        let stdout = match (op, program) {
            (Operation::Query { .. }, "blkid") => format!("{}\n", LUKS_UUID),
            (Operation::Query { .. }, "genfstab") => FSTAB.to_string(),
            (Operation::Query { .. }, "lsblk") => DISK_BYTES.to_string(),
            _ => String::new(),
        };
        Ok(CommandOutput {
            stdout,
            simulated: false,
        })
    }

    fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

/// Canned operator answers. Running out of answers behaves like a closed
/// stdin.
#[derive(Default)]
pub struct ScriptedPrompter {
    confirms: VecDeque<bool>,
    answers: VecDeque<String>,
    pub questions: Vec<String>,
    pub shown: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new(confirms: &[bool], answers: &[&str]) -> Self {
        Self {
            confirms: confirms.iter().copied().collect(),
            answers: answers.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Yes to install, fstab and reboot-no; UTC / testhost / alice
    pub fn happy_path() -> Self {
        Self::new(&[true, true, false], &["UTC", "testhost", "alice"])
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str, default: Option<&str>) -> io::Result<String> {
        self.questions.push(question.to_string());
        let answer = self.answers.pop_front().ok_or_else(closed)?;
        match (answer.is_empty(), default) {
            (true, Some(d)) => Ok(d.to_string()),
            _ => Ok(answer),
        }
    }

    fn confirm(&mut self, question: &str) -> io::Result<bool> {
        self.questions.push(question.to_string());
        self.confirms.pop_front().ok_or_else(closed)
    }

    fn show(&mut self, text: &str) -> io::Result<()> {
        self.shown.push(text.to_string());
        Ok(())
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer left")
}

pub fn plan(disk: &str, mode: ExecutionMode) -> InstallPlan {
    InstallPlan::new(InstallConfig::default(), disk, mode)
}

/// Cleanup operations as the rollback issues them
pub fn cleanup_descriptions() -> [&'static str; 3] {
    ["umount -R /mnt", "vgchange -an vg0", "cryptsetup close cryptlvm"]
}

// =============================================================================
// Log capture
// =============================================================================

/// Records every log line together with the thread that emitted it, so
/// tests running in parallel only see their own output.
struct CaptureLogger {
    records: Mutex<Vec<(ThreadId, log::Level, String)>>,
}

static CAPTURE: CaptureLogger = CaptureLogger {
    records: Mutex::new(Vec::new()),
};

impl log::Log for CaptureLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Ok(mut records) = self.records.lock() {
            records.push((
                thread::current().id(),
                record.level(),
                format!("{} {}", record.level(), record.args()),
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the capturing logger; safe to call from every test.
pub fn capture_logs() {
    if log::set_logger(&CAPTURE).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}

/// Lines at `level` or more severe emitted by the calling thread
pub fn captured_logs(level: log::Level) -> Vec<String> {
    let me = thread::current().id();
    CAPTURE
        .records
        .lock()
        .map(|records| {
            records
                .iter()
                .filter(|(thread, lvl, _)| *thread == me && *lvl <= level)
                .map(|(_, _, line)| line.clone())
                .collect()
        })
        .unwrap_or_default()
}
