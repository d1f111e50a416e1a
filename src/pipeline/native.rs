use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::backend::artifacts;
use crate::backend::progress::{StepMode, run_step};
use crate::backend::{PipelinePlan, PlanContext, Step, StepAction};
use crate::error::{Phase, StepError};
use crate::process::{self, ToolCommand};

/// Run a plan's steps directly on the host, in order, stopping at the first
/// failure.
pub fn execute(plan: &PipelinePlan, ctx: &PlanContext<'_>) -> Result<(), StepError> {
    let env = plan.environment(ctx.toolchain);
    let cwd = Path::new(&ctx.source_dir);
    for step in &plan.steps {
        run(step, &env, cwd, ctx.stages.verbose)?;
    }
    Ok(())
}

fn step_mode(step: &Step, verbose: bool) -> StepMode {
    match step.phase {
        Phase::Test | Phase::Bench | Phase::Run => StepMode::Verbose,
        _ if step.progress => StepMode::for_build(verbose, step.phase.as_str()),
        _ => StepMode::for_configure(verbose),
    }
}

fn run(step: &Step, env: &[(String, String)], cwd: &Path, verbose: bool) -> Result<(), StepError> {
    if let Some(marker) = &step.skip_if_exists
        && Path::new(marker).exists()
    {
        debug!(phase = %step.phase, marker = %marker, "skipped, already done");
        return Ok(());
    }

    let fail = |err: anyhow::Error| StepError::new(step.phase, err);
    match &step.action {
        StepAction::Exec { program, args } => {
            let cmd = ToolCommand::new(program.as_str())
                .args(args.iter().cloned())
                .envs(env.iter().cloned())
                .current_dir(cwd);
            debug!(command = %cmd.display(), "exec");
            run_step(&cmd, &step_mode(step, verbose)).map_err(|e| fail(e.into()))
        }
        StepAction::Collect { rules, dest } => {
            let copied = artifacts::collect(rules, cwd, Path::new(dest))
                .with_context(|| format!("failed to copy artifacts into {dest}"))
                .map_err(fail)?;
            info!(count = copied.len(), dest = %dest, "artifacts collected");
            Ok(())
        }
        StepAction::RunMatching {
            dir,
            suffix,
            max_depth,
        } => {
            let mut found: Vec<_> = WalkDir::new(cwd.join(dir))
                .max_depth(*max_depth)
                .follow_links(true)
                .into_iter()
                .filter_map(Result::ok)
                .map(|e| e.into_path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(suffix.as_str()))
                        && process::is_executable(p)
                })
                .collect();
            found.sort();
            for exe in found {
                info!(executable = %exe.display(), "running");
                let cmd = ToolCommand::new(exe.display().to_string())
                    .envs(env.iter().cloned())
                    .current_dir(cwd);
                process::run_inherited(&cmd).map_err(|e| fail(e.into()))?;
            }
            Ok(())
        }
        StepAction::RunFirstExecutable { dir, preferred } => {
            let preferred: Vec<&str> = preferred.iter().map(String::as_str).collect();
            let exe = artifacts::select_executable(&cwd.join(dir), None, &preferred)
                .map_err(fail)?;
            info!(executable = %exe.display(), "running");
            let cmd = ToolCommand::new(exe.display().to_string())
                .envs(env.iter().cloned())
                .current_dir(cwd);
            process::run_inherited(&cmd).map_err(|e| fail(e.into()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::artifacts::ArtifactRules;
    use crate::backend::{Location, Stages};
    use crate::config::ResolvedToolchain;

    fn context<'a>(tc: &'a ResolvedToolchain, root: &Path) -> PlanContext<'a> {
        let dir = |sub: &str| root.join(sub).display().to_string();
        PlanContext {
            toolchain: tc,
            project_name: "demo",
            source_dir: dir(""),
            build_dir: dir("build"),
            deps_dir: dir("deps"),
            output_dir: dir("out"),
            stages: Stages::default(),
            location: Location::Host,
        }
    }

    #[test]
    fn steps_run_in_order_with_toolchain_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut tc = ResolvedToolchain::native("host");
        tc.settings.env.insert("GREETING".into(), "hello".into());
        let ctx = context(&tc, dir.path());
        let plan = PipelinePlan {
            env: vec![("GREETING".into(), "overridden".into())],
            steps: vec![
                Step::exec(Phase::Configure, "sh", ["-c", "mkdir -p build && echo \"$GREETING\" > build/env"]),
                Step::exec(
                    Phase::Build,
                    "sh",
                    ["-c", "printf '#!/bin/sh\\n' > build/app && chmod +x build/app"],
                ),
                Step::collect(ArtifactRules::new("build", 1), ctx.output_dir.clone()),
            ],
        };
        execute(&plan, &ctx).unwrap();
        let env = std::fs::read_to_string(dir.path().join("build/env")).unwrap();
        assert_eq!(env.trim(), "hello");
        assert!(dir.path().join("out/app").is_file());
    }

    #[test]
    fn failure_carries_the_phase_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let tc = ResolvedToolchain::native("host");
        let ctx = context(&tc, dir.path());
        let plan = PipelinePlan {
            env: Vec::new(),
            steps: vec![
                Step::exec(Phase::Build, "sh", ["-c", "exit 4"]),
                Step::exec(Phase::Test, "sh", ["-c", "touch never"]),
            ],
        };
        let err = execute(&plan, &ctx).unwrap_err();
        assert_eq!(err.phase, Phase::Build);
        assert!(!dir.path().join("never").exists());
    }

    #[test]
    fn existing_marker_skips_the_step() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let tc = ResolvedToolchain::native("host");
        let ctx = context(&tc, dir.path());
        let marker = dir.path().join("marker").display().to_string();
        let plan = PipelinePlan {
            env: Vec::new(),
            steps: vec![Step::exec(Phase::Configure, "sh", ["-c", "exit 1"]).unless_exists(marker)],
        };
        execute(&plan, &ctx).unwrap();
    }
}
