use std::io::{BufRead, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::ProcessError;

use super::signal;
use super::types::{CancelToken, OutputLine, ProcessResult, ToolCommand};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn command_for(cmd: &ToolCommand) -> Command {
    let mut command = Command::new(&cmd.program);
    command.args(&cmd.args);
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &cmd.env {
        command.env(key, value);
    }
    command
}

/// Spawn a subprocess and return a channel that streams its output.
///
/// The caller receives [`OutputLine::Stdout`]/[`OutputLine::Stderr`] as they
/// arrive, followed by exactly one [`OutputLine::Done`] carrying the final
/// result. The child is killed when `cancel` fires, when the process receives
/// an interrupt, or when the command's timeout elapses.
pub fn spawn(cmd: ToolCommand, cancel: CancelToken) -> Result<Receiver<OutputLine>, ProcessError> {
    let mut child = command_for(&cmd)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: cmd.display(),
            source,
        })?;

    feed_stdin(&cmd, &mut child);

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        orchestrate(child, stdout, stderr, tx, cancel, cmd.timeout, cmd.log_path);
    });

    Ok(rx)
}

fn feed_stdin(cmd: &ToolCommand, child: &mut Child) {
    if let (Some(input), Some(mut stdin)) = (cmd.stdin.clone(), child.stdin.take()) {
        std::thread::spawn(move || {
            // The child may exit before reading everything; that shows up in
            // its exit status, not here.
            let _ = stdin.write_all(input.as_bytes());
        });
    }
}

fn orchestrate(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    tx: Sender<OutputLine>,
    cancel: CancelToken,
    timeout: Option<Duration>,
    log_path: Option<std::path::PathBuf>,
) {
    let log_buf = Arc::new(Mutex::new(String::new()));

    // --- reader threads ---------------------------------------------------
    let stdout_handle = forward_lines(stdout, tx.clone(), log_buf.clone(), OutputLine::Stdout);
    let stderr_handle = forward_lines(stderr, tx.clone(), log_buf.clone(), OutputLine::Stderr);

    // --- poll loop ---------------------------------------------------------
    let start = Instant::now();
    let mut cancelled = false;
    let mut timed_out = false;

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }

        if cancel.is_cancelled() || signal::interrupted() {
            cancelled = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        if timeout.is_some_and(|limit| start.elapsed() > limit) {
            timed_out = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    // --- finalize ----------------------------------------------------------
    let _ = stdout_handle.join();
    let _ = stderr_handle.join();

    let exit_code = exit_status.and_then(|s| s.code());
    let success = exit_code == Some(0);
    let log = log_buf.lock().map(|b| b.clone()).unwrap_or_default();

    if let Some(path) = log_path {
        let _ = std::fs::write(&path, &log);
    }

    let _ = tx.send(OutputLine::Done(ProcessResult {
        success,
        exit_code,
        log,
        cancelled,
        timed_out,
    }));
}

fn forward_lines<R>(
    source: R,
    tx: Sender<OutputLine>,
    buf: Arc<Mutex<String>>,
    wrap: fn(String) -> OutputLine,
) -> std::thread::JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Ok(mut buf) = buf.lock() {
                buf.push_str(&line);
                buf.push('\n');
            }
            // Receiver may be dropped; ignore send errors.
            let _ = tx.send(wrap(line));
        }
    })
}

/// Run to completion, handing every line to `on_line` as it arrives.
pub fn run_streaming(
    cmd: &ToolCommand,
    cancel: &CancelToken,
    mut on_line: impl FnMut(&str),
) -> Result<ProcessResult, ProcessError> {
    let rx = spawn(cmd.clone(), cancel.clone())?;
    for line in rx {
        match line {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => on_line(&s),
            OutputLine::Done(result) => return Ok(result),
        }
    }
    // The supervisor always sends Done; a closed channel means it panicked.
    Err(ProcessError::Interrupted {
        command: cmd.display(),
    })
}

/// Run to completion and return combined stdout/stderr on success.
pub fn run_captured(cmd: &ToolCommand) -> Result<String, ProcessError> {
    run_streaming(cmd, &CancelToken::new(), |_| {})?.into_output(cmd)
}

/// Run with the terminal attached, for verbose builds and user programs.
///
/// Stdout and stderr are inherited, so nothing is captured; the child is still
/// killed if an interrupt arrives or the timeout elapses. Stdin is inherited
/// unless the command carries its own input.
pub fn run_inherited(cmd: &ToolCommand) -> Result<(), ProcessError> {
    let mut child = command_for(cmd)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        })
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: cmd.display(),
            source,
        })?;
    feed_stdin(cmd, &mut child);

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                return Err(ProcessError::Failed {
                    command: cmd.display(),
                    code: status.code(),
                    output: String::new(),
                });
            }
            Ok(None) => {}
            Err(source) => {
                return Err(ProcessError::Spawn {
                    command: cmd.display(),
                    source,
                });
            }
        }

        if signal::interrupted() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::Interrupted {
                command: cmd.display(),
            });
        }

        if let Some(limit) = cmd.timeout
            && start.elapsed() > limit
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::TimedOut {
                command: cmd.display(),
                timeout: limit,
            });
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
