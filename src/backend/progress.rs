use std::io::{self, IsTerminal, Stderr, Write};

use crossterm::cursor;
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};

use crate::error::ProcessError;
use crate::process::{self, CancelToken, ToolCommand};

const BAR_WIDTH: usize = 30;

/// How a build-tool step reports to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepMode {
    /// Stream everything live.
    Verbose,
    /// Show nothing unless the step fails.
    Quiet,
    /// Draw a progress bar from `[ NN%]` markers; other lines are shown only on failure.
    Progress(String),
}

impl StepMode {
    pub fn for_build(verbose: bool, label: &str) -> Self {
        if verbose {
            StepMode::Verbose
        } else {
            StepMode::Progress(label.to_string())
        }
    }

    pub fn for_configure(verbose: bool) -> Self {
        if verbose {
            StepMode::Verbose
        } else {
            StepMode::Quiet
        }
    }
}

/// Percentage from a leading `[ NN%]` marker, as printed by CMake's Makefile generator.
pub fn parse_percent(line: &str) -> Option<u8> {
    let rest = line.strip_prefix('[')?;
    let (inside, _) = rest.split_once(']')?;
    let digits = inside.trim_start().strip_suffix('%')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u16 = digits.parse().ok()?;
    (value <= 100).then_some(value as u8)
}

/// Single-line progress bar on stderr. Restores the cursor when dropped.
pub struct ProgressBar {
    label: String,
    out: Stderr,
    enabled: bool,
    drawn: bool,
    last: Option<u8>,
}

impl ProgressBar {
    pub fn new(label: impl Into<String>) -> Self {
        let out = io::stderr();
        let enabled = out.is_terminal();
        Self {
            label: label.into(),
            out,
            enabled,
            drawn: false,
            last: None,
        }
    }

    pub fn update(&mut self, percent: u8) {
        if !self.enabled || self.last == Some(percent) {
            return;
        }
        self.last = Some(percent);
        let filled = BAR_WIDTH * usize::from(percent) / 100;
        let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled));
        let _ = queue!(
            self.out,
            cursor::Hide,
            cursor::MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(format!("{} [{bar}] {percent:>3}%", self.label)),
        );
        let _ = self.out.flush();
        self.drawn = true;
    }

    /// Clear the bar and show the cursor again.
    pub fn finish(&mut self) {
        if !self.drawn {
            return;
        }
        let _ = queue!(
            self.out,
            cursor::MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            cursor::Show,
        );
        let _ = self.out.flush();
        self.drawn = false;
    }
}

impl Drop for ProgressBar {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Lines that were not progress markers, kept for failure reports.
#[derive(Debug, Default)]
pub struct QuietLog {
    lines: Vec<String>,
}

impl QuietLog {
    /// Feed one line; returns the percentage if it was a progress marker.
    pub fn observe(&mut self, line: &str, track_progress: bool) -> Option<u8> {
        if track_progress && let Some(percent) = parse_percent(line) {
            return Some(percent);
        }
        self.lines.push(line.to_string());
        None
    }

    pub fn text(&self) -> String {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }
}

/// Run one build-tool step according to `mode`.
///
/// In the non-verbose modes a failing step's buffered output is carried in
/// [`ProcessError::Failed`] for the caller to show.
pub fn run_step(cmd: &ToolCommand, mode: &StepMode) -> Result<(), ProcessError> {
    let label = match mode {
        StepMode::Verbose => return process::run_inherited(cmd),
        StepMode::Quiet => None,
        StepMode::Progress(label) => Some(label.as_str()),
    };

    let mut bar = label.map(ProgressBar::new);
    let mut log = QuietLog::default();
    let result = process::run_streaming(cmd, &CancelToken::new(), |line| {
        if let Some(percent) = log.observe(line, bar.is_some())
            && let Some(bar) = bar.as_mut()
        {
            bar.update(percent);
        }
    })?;
    if let Some(bar) = bar.as_mut() {
        bar.finish();
    }

    match result.into_output(cmd) {
        Ok(_) => Ok(()),
        Err(ProcessError::Failed { command, code, .. }) => Err(ProcessError::Failed {
            command,
            code,
            output: log.text(),
        }),
        Err(other) => Err(other),
    }
}
