use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{info, warn};

use crate::backend::Stages;
use crate::config::{ResolvedToolchain, ToolchainConfig};
use crate::error::{ConfigError, OrchestrateError, ResolveError, StepError, ToolchainFailure};
use crate::resolve::ExecutionTarget;

use super::types::{RunOutcome, RunRequest, RunSummary, ToolchainReport};

/// Guard that lets a CI run happen at most once per process.
#[derive(Debug, Default)]
pub struct RunOnce(AtomicBool);

impl RunOnce {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `true` for the first caller only.
    pub fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// The side-effecting half of a CI run, one toolchain at a time.
pub trait ToolchainExecutor {
    /// Create everything the toolchain writes to. Called for every selected
    /// toolchain before the first one is resolved.
    fn prepare(&mut self, toolchain: &ResolvedToolchain) -> Result<(), StepError>;

    fn resolve(
        &mut self,
        toolchain: &ResolvedToolchain,
        rebuild: bool,
    ) -> Result<ExecutionTarget, ResolveError>;

    fn execute(
        &mut self,
        toolchain: &ResolvedToolchain,
        target: &ExecutionTarget,
        stages: Stages,
    ) -> Result<(), StepError>;
}

/// Toolchains chosen for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub toolchains: Vec<ResolvedToolchain>,
    /// Inactive toolchains left out.
    pub skipped: usize,
}

/// Pick the toolchains to run. A named toolchain runs even when inactive;
/// otherwise every active toolchain runs.
pub fn select_toolchains(
    all: Vec<ResolvedToolchain>,
    requested: Option<&str>,
) -> Result<Selection, ConfigError> {
    if let Some(name) = requested {
        let toolchain = all
            .into_iter()
            .find(|tc| tc.name == name)
            .ok_or_else(|| ConfigError::UnknownToolchain(name.to_string()))?;
        if !toolchain.active {
            warn!(toolchain = %name, "toolchain is inactive, running it because it was requested");
        }
        return Ok(Selection {
            toolchains: vec![toolchain],
            skipped: 0,
        });
    }

    let total = all.len();
    let toolchains: Vec<_> = all.into_iter().filter(|tc| tc.active).collect();
    if toolchains.is_empty() {
        return Err(ConfigError::NoActiveToolchains);
    }
    Ok(Selection {
        skipped: total - toolchains.len(),
        toolchains,
    })
}

/// Run the CI pipeline for the selected toolchains, in order, stopping at
/// the first failure.
pub fn run<E>(
    config: &ToolchainConfig,
    request: &RunRequest,
    once: &RunOnce,
    executor: &mut E,
) -> Result<RunOutcome, OrchestrateError>
where
    E: ToolchainExecutor + ?Sized,
{
    if !once.claim() {
        warn!("CI run already performed in this process, skipping");
        return Ok(RunOutcome::AlreadyRan);
    }

    let selection = select_toolchains(config.resolve_toolchains()?, request.toolchain.as_deref())?;
    if selection.skipped > 0 {
        info!("{} toolchain(s) skipped (inactive)", selection.skipped);
    }

    for toolchain in &selection.toolchains {
        executor
            .prepare(toolchain)
            .map_err(|err| ToolchainFailure::from_step(&toolchain.name, err))?;
    }

    let mut summary = RunSummary {
        skipped: selection.skipped,
        ..RunSummary::default()
    };
    for toolchain in &selection.toolchains {
        let started = Instant::now();
        info!(toolchain = %toolchain.name, "building toolchain");

        let target = executor
            .resolve(toolchain, request.rebuild)
            .map_err(|err| ToolchainFailure::from_resolve(&toolchain.name, err))?;
        executor
            .execute(toolchain, &target, request.stages)
            .map_err(|err| ToolchainFailure::from_step(&toolchain.name, err))?;

        let elapsed = started.elapsed();
        info!(
            toolchain = %toolchain.name,
            target = %target.describe(),
            secs = elapsed.as_secs_f64(),
            "toolchain done"
        );
        summary.built += 1;
        summary.toolchains.push(ToolchainReport {
            name: toolchain.name.clone(),
            target: target.describe(),
            duration_secs: elapsed.as_secs_f64(),
        });
    }

    info!(built = summary.built, skipped = summary.skipped, "CI run complete");
    Ok(RunOutcome::Completed(summary))
}
