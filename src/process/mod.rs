// Subprocess supervision: streamed output, timeouts, cancellation and interrupts.

pub mod run;
pub mod signal;
pub mod types;

pub use run::{run_captured, run_inherited, run_streaming, spawn};
pub use signal::{install_interrupt_handler, interrupted};
pub use types::{CancelToken, OutputLine, ProcessResult, ToolCommand};

/// True for regular files with any execute bit set (any file on non-Unix).
pub fn is_executable(path: &std::path::Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
