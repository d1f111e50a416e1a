//! Integration tests for orchestrated CI runs.
//!
//! The native tests drive `sh` through the real orchestrator, layout and host
//! executor. The docker tests need a running daemon and are marked `#[ignore]`.
//! Run them with: `cargo test -- --ignored`

#![cfg(unix)]

use std::path::Path;

use cxci::backend::artifacts::ArtifactRules;
use cxci::backend::{Location, PipelinePlan, PlanContext, Stages, Step};
use cxci::config::{ResolvedToolchain, ToolchainConfig};
use cxci::error::{OrchestrateError, Phase, ResolveError, StepError};
use cxci::pipeline::{self, CiLayout, RunOnce, RunOutcome, RunRequest, ToolchainExecutor, native};
use cxci::resolve::ExecutionTarget;

/// Write `cxci.yaml` into a fresh project directory.
fn project(yaml: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    std::fs::write(dir.path().join("cxci.yaml"), yaml).expect("failed to write cxci.yaml");
    dir
}

/// Host executor whose plan builds a tiny shell "binary" per toolchain.
struct ShellExecutor {
    layout: CiLayout,
    fail: Option<&'static str>,
}

impl ShellExecutor {
    fn new(root: &Path) -> Self {
        Self {
            layout: CiLayout::new(root, ".bin/ci"),
            fail: None,
        }
    }

    fn plan(&self, toolchain: &ResolvedToolchain, build_dir: &str, output_dir: &str) -> PipelinePlan {
        let exit = if self.fail == Some(toolchain.name.as_str()) { "exit 1" } else { "true" };
        PipelinePlan {
            env: vec![("TC".into(), toolchain.name.clone())],
            steps: vec![
                Step::exec(
                    Phase::Configure,
                    "sh",
                    ["-c".to_string(), format!("touch {build_dir}/configured")],
                )
                .unless_exists(format!("{build_dir}/configured")),
                Step::exec(
                    Phase::Build,
                    "sh",
                    [
                        "-c".to_string(),
                        format!(
                            "{exit} && printf '#!/bin/sh\\necho %s\\n' \"$TC\" > {build_dir}/app && chmod +x {build_dir}/app"
                        ),
                    ],
                ),
                Step::collect(ArtifactRules::new(build_dir, 2), output_dir),
            ],
        }
    }
}

impl ToolchainExecutor for ShellExecutor {
    fn prepare(&mut self, toolchain: &ResolvedToolchain) -> Result<(), StepError> {
        self.layout
            .toolchain(&toolchain.name)
            .prepare(&[])
            .map_err(|e| StepError::new(Phase::Prepare, e))
    }

    fn resolve(&mut self, _: &ResolvedToolchain, _: bool) -> Result<ExecutionTarget, ResolveError> {
        Ok(ExecutionTarget::Native)
    }

    fn execute(
        &mut self,
        toolchain: &ResolvedToolchain,
        _: &ExecutionTarget,
        stages: Stages,
    ) -> Result<(), StepError> {
        let dirs = self.layout.toolchain(&toolchain.name);
        let ctx = PlanContext {
            toolchain,
            project_name: "demo",
            source_dir: self.layout.root().display().to_string(),
            build_dir: dirs.build.display().to_string(),
            deps_dir: dirs.deps.display().to_string(),
            output_dir: dirs.output.display().to_string(),
            stages,
            location: Location::Host,
        };
        let plan = self.plan(toolchain, &ctx.build_dir, &ctx.output_dir);
        native::execute(&plan, &ctx)
    }
}

const TWO_TOOLCHAINS: &str = r#"
toolchains:
  - name: linux-amd64
    active: true
  - name: linux-arm64
    active: false
"#;

#[test]
fn native_run_collects_artifacts_per_toolchain() {
    let dir = project(TWO_TOOLCHAINS);
    let config = ToolchainConfig::load(dir.path()).unwrap();
    let mut executor = ShellExecutor::new(dir.path());

    let outcome = pipeline::run(&config, &RunRequest::default(), &RunOnce::new(), &mut executor).unwrap();
    let RunOutcome::Completed(summary) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(summary.built, 1);
    assert_eq!(summary.skipped, 1);

    let app = dir.path().join(".bin/ci/linux-amd64/app");
    assert!(app.is_file(), "artifact should be collected into the toolchain output");
    assert!(dir.path().join(".cache/ci/linux-amd64/build/configured").is_file());
    assert!(!dir.path().join(".bin/ci/linux-arm64").exists());

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["built"], 1);
    assert_eq!(json["toolchains"][0]["name"], "linux-amd64");
    assert_eq!(json["toolchains"][0]["target"], "native");
}

#[test]
fn failing_toolchain_stops_the_run() {
    let dir = project(
        r#"
toolchains:
  - name: gcc
  - name: clang
  - name: icx
"#,
    );
    let config = ToolchainConfig::load(dir.path()).unwrap();
    let mut executor = ShellExecutor::new(dir.path());
    executor.fail = Some("clang");

    let err = pipeline::run(&config, &RunRequest::default(), &RunOnce::new(), &mut executor).unwrap_err();
    let OrchestrateError::Toolchain(failure) = err else {
        panic!("expected a toolchain failure");
    };
    assert_eq!(failure.toolchain, "clang");
    assert_eq!(failure.phase, Phase::Build);
    assert!(dir.path().join(".bin/ci/gcc/app").is_file());
    // Directories exist for every toolchain, but the third never ran.
    assert!(dir.path().join(".cache/ci/icx/build").is_dir());
    assert!(!dir.path().join(".cache/ci/icx/build/configured").exists());
}

#[test]
fn guard_allows_one_run_per_process() {
    let dir = project(TWO_TOOLCHAINS);
    let config = ToolchainConfig::load(dir.path()).unwrap();
    let once = RunOnce::new();
    let mut executor = ShellExecutor::new(dir.path());

    assert!(matches!(
        pipeline::run(&config, &RunRequest::default(), &once, &mut executor).unwrap(),
        RunOutcome::Completed(_)
    ));
    assert_eq!(
        pipeline::run(&config, &RunRequest::default(), &once, &mut executor).unwrap(),
        RunOutcome::AlreadyRan
    );
}

#[test]
fn invalid_config_fails_before_anything_runs() {
    let dir = project(
        r#"
toolchains:
  - name: linux
    runner: missing
"#,
    );
    let config = ToolchainConfig::load(dir.path()).unwrap();
    let mut executor = ShellExecutor::new(dir.path());
    let err = pipeline::run(&config, &RunRequest::default(), &RunOnce::new(), &mut executor).unwrap_err();
    assert!(matches!(err, OrchestrateError::Config(_)));
    assert!(!dir.path().join(".cache").exists());
}

mod docker {
    use cxci::backend::BackendKind;
    use cxci::docker::{ContainerRuntime, DockerCli};
    use cxci::pipeline::container;
    use cxci::resolve::Resolver;

    use super::*;

    const IMAGE: &str = "ubuntu:24.04";

    #[test]
    #[ignore]
    fn pull_mode_resolves_a_public_image() {
        let dir = project(&format!(
            r#"
runners:
  - name: ubuntu
    type: docker
    image: {IMAGE}
toolchains:
  - name: linux
    runner: ubuntu
"#
        ));
        let config = ToolchainConfig::load(dir.path()).unwrap();
        let toolchain = config.resolve_toolchains().unwrap().remove(0);
        let runtime = DockerCli;
        let resolver = Resolver::new(&runtime, dir.path(), "cxci", BackendKind::CMake);

        let target = resolver.resolve(&toolchain, false).unwrap();
        assert_eq!(target, ExecutionTarget::Image(IMAGE.to_string()));
        assert!(runtime.image_exists(IMAGE));
    }

    #[test]
    #[ignore]
    fn container_script_collects_into_the_output_mount() {
        cxci::docker::ensure_available().expect("docker is required");
        let dir = project("toolchains:\n  - name: linux\n");
        let runtime = DockerCli;
        runtime
            .pull(IMAGE, None, cxci::resolve::PULL_TIMEOUT)
            .expect("failed to pull test image");

        let layout = CiLayout::new(dir.path(), ".bin/ci");
        let dirs = layout.toolchain("linux");
        dirs.prepare(&[]).unwrap();

        let toolchain = ResolvedToolchain::native("linux");
        let ctx = container::context(&toolchain, "demo", Stages::default());
        let plan = PipelinePlan {
            env: Vec::new(),
            steps: vec![
                Step::exec(
                    Phase::Build,
                    "sh",
                    ["-c", "printf '#!/bin/sh\\n' > /tmp/build/app && chmod +x /tmp/build/app"],
                ),
                Step::collect(ArtifactRules::new("/tmp/build", 2), "/output"),
            ],
        };
        let mounts = container::mounts(dir.path(), &dirs);
        container::execute(&runtime, IMAGE, &plan, &ctx, &mounts).unwrap();
        assert!(dirs.output.join("app").is_file());
    }

    #[test]
    #[ignore]
    fn container_failure_reports_the_phase() {
        cxci::docker::ensure_available().expect("docker is required");
        let dir = project("toolchains:\n  - name: linux\n");
        let dirs = CiLayout::new(dir.path(), ".bin/ci").toolchain("linux");
        dirs.prepare(&[]).unwrap();

        let toolchain = ResolvedToolchain::native("linux");
        let ctx = container::context(&toolchain, "demo", Stages::default());
        let plan = PipelinePlan {
            env: Vec::new(),
            steps: vec![Step::exec(Phase::Configure, "sh", ["-c", "exit 3"])],
        };
        let err = container::execute(&DockerCli, IMAGE, &plan, &ctx, &container::mounts(dir.path(), &dirs))
            .unwrap_err();
        assert_eq!(err.phase, Phase::Configure);
    }
}
