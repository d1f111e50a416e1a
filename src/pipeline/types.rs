use serde::Serialize;

use crate::backend::Stages;

/// What the operator asked a CI run to do.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Run only this toolchain, even if it is inactive.
    pub toolchain: Option<String>,
    /// Rebuild or re-pull images regardless of cache state.
    pub rebuild: bool,
    pub stages: Stages,
}

/// Per-toolchain entry of a run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolchainReport {
    pub name: String,
    /// Where it ran: `native`, `image <ref>` or `ssh <dest>`.
    pub target: String,
    pub duration_secs: f64,
}

/// Written as JSON by `cxci ci --report <path>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub built: usize,
    pub skipped: usize,
    pub toolchains: Vec<ToolchainReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The guard had already been claimed; nothing was done.
    AlreadyRan,
    Completed(RunSummary),
}
