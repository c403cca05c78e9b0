//! Interactive prompts and the confirmation gate.
//!
//! All prompts are blocking line reads. The `Prompter` trait lets the
//! orchestrator run against stdin in production and against canned answers
//! in tests.

use std::io::{self, BufRead, Write};

/// Source of operator answers.
pub trait Prompter {
    /// Ask for a line of text. An empty answer yields `default` when given.
    fn ask(&mut self, question: &str, default: Option<&str>) -> io::Result<String>;

    /// Ask a yes/no question. Empty input means no.
    fn confirm(&mut self, question: &str) -> io::Result<bool>;

    /// Show information to the operator without expecting an answer
    fn show(&mut self, text: &str) -> io::Result<()>;
}

/// Parse a yes/no answer; anything but an explicit yes is no
pub fn parse_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Line-based prompter over any reader/writer pair.
pub struct LinePrompter<R, W> {
    input: R,
    output: W,
}

impl LinePrompter<io::StdinLock<'static>, io::Stdout> {
    /// Prompter bound to the process's stdin/stdout
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> LinePrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Consume the prompter, returning the writer (tests inspect it)
    pub fn into_output(self) -> W {
        self.output
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let read = self.input.read_line(&mut line)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input closed while waiting for an answer",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl<R: BufRead, W: Write> Prompter for LinePrompter<R, W> {
    fn ask(&mut self, question: &str, default: Option<&str>) -> io::Result<String> {
        match default {
            Some(d) => write!(self.output, "{} [{}]: ", question, d)?,
            None => write!(self.output, "{}: ", question)?,
        }
        self.output.flush()?;

        let answer = self.read_line()?.trim().to_string();
        match (answer.is_empty(), default) {
            (true, Some(d)) => Ok(d.to_string()),
            _ => Ok(answer),
        }
    }

    fn confirm(&mut self, question: &str) -> io::Result<bool> {
        write!(self.output, "{} [y/N]: ", question)?;
        self.output.flush()?;
        Ok(parse_yes(&self.read_line()?))
    }

    fn show(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.output, "{}", text)?;
        self.output.flush()
    }
}

/// Synchronous checkpoint before irreversible work.
pub struct ConfirmationGate;

impl ConfirmationGate {
    /// Ask `question`; logs the decision either way.
    pub fn confirm(prompter: &mut dyn Prompter, question: &str) -> io::Result<bool> {
        let approved = prompter.confirm(question)?;
        if approved {
            log::debug!("Confirmed: {}", question);
        } else {
            log::debug!("Declined: {}", question);
        }
        Ok(approved)
    }
}
