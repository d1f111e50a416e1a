use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::ProcessError;

/// Cooperative cancellation token backed by an `AtomicBool`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Describes a subprocess invocation. Environment entries are added on top of
/// the inherited process environment.
#[derive(Debug, Clone, Default)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub log_path: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-quoted rendering used in logs and error messages.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Outcome of a supervised subprocess.
#[derive(Debug)]
pub struct ProcessResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub log: String,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl ProcessResult {
    /// Convert into the captured log on success, or the matching error.
    pub fn into_output(self, cmd: &ToolCommand) -> Result<String, ProcessError> {
        if self.timed_out {
            return Err(ProcessError::TimedOut {
                command: cmd.display(),
                timeout: cmd.timeout.unwrap_or_default(),
            });
        }
        if self.cancelled {
            return Err(ProcessError::Interrupted {
                command: cmd.display(),
            });
        }
        if !self.success {
            return Err(ProcessError::Failed {
                command: cmd.display(),
                code: self.exit_code,
                output: self.log,
            });
        }
        Ok(self.log)
    }
}

/// Streamed output from a running subprocess.
#[derive(Debug)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    Done(ProcessResult),
}
