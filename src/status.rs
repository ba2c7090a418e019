//! Operator-facing status lines.
//!
//! Each module prints one line that is rewritten as it moves through its
//! phases, ending in `Passed`, `Failed` or `Skipped`. Stages print a header
//! before their first module and a footer summarising the aggregate result.

use std::fmt;
use std::io::{self, Write};

/// Status label shown against a module or package description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Skipped,
    Scanning,
    Downloading,
    Verifying,
    Copying,
    Extracting,
    Patching,
    SettingUp,
    Preparing,
    Compiling,
    Configuring,
    Testing,
    Installing,
    Validating,
    Cleaning,
    Passed,
    Failed,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Skipped => "Skipped",
            Status::Scanning => "Scanning",
            Status::Downloading => "Downloading",
            Status::Verifying => "Verifying",
            Status::Copying => "Copying",
            Status::Extracting => "Extracting",
            Status::Patching => "Patching",
            Status::SettingUp => "Setting up",
            Status::Preparing => "Preparing",
            Status::Compiling => "Compiling",
            Status::Configuring => "Configuring",
            Status::Testing => "Testing",
            Status::Installing => "Installing",
            Status::Validating => "Validating",
            Status::Cleaning => "Cleaning",
            Status::Passed => "Passed",
            Status::Failed => "Failed",
        }
    }

    /// Whether this status ends a module's line.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Passed | Status::Failed | Status::Skipped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sink for status transitions.
pub trait Reporter {
    fn header(&mut self, title: &str);
    fn status(&mut self, status: Status, subject: &str);
    fn footer(&mut self, title: &str, passed: bool);
}

/// Writes status lines to stdout, rewriting the current line in place.
#[derive(Debug, Default)]
pub struct Console;

impl Reporter for Console {
    fn header(&mut self, title: &str) {
        println!("{title}");
    }

    fn status(&mut self, status: Status, subject: &str) {
        let mut out = io::stdout().lock();
        // \r plus erase-line keeps one line per module.
        let _ = write!(out, "\r\x1b[2K * [{status}] {subject}");
        if status.is_terminal() {
            let _ = writeln!(out);
        }
        let _ = out.flush();
    }

    fn footer(&mut self, title: &str, passed: bool) {
        let summary = title.trim_end_matches("...");
        println!("{summary} {}.", if passed { "passed" } else { "failed" });
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct Silent;

impl Reporter for Silent {
    fn header(&mut self, _title: &str) {}
    fn status(&mut self, _status: Status, _subject: &str) {}
    fn footer(&mut self, _title: &str, _passed: bool) {}
}
