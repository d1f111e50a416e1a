use std::path::Path;

use tracing::{debug, info};

use crate::backend::{Location, Mount, PipelinePlan, PlanContext, Stages};
use crate::config::ResolvedToolchain;
use crate::docker::{self, ContainerRuntime};
use crate::error::{Phase, ProcessError, StepError};

use super::layout::ToolchainDirs;
use super::script;

pub const WORKSPACE: &str = "/workspace";
pub const BUILD_DIR: &str = "/tmp/build";
pub const DEPS_DIR: &str = "/tmp/deps";
pub const OUTPUT_DIR: &str = "/output";

/// Paths as the container sees them.
pub fn context<'a>(
    toolchain: &'a ResolvedToolchain,
    project_name: &'a str,
    stages: Stages,
) -> PlanContext<'a> {
    PlanContext {
        toolchain,
        project_name,
        source_dir: WORKSPACE.into(),
        build_dir: BUILD_DIR.into(),
        deps_dir: DEPS_DIR.into(),
        output_dir: OUTPUT_DIR.into(),
        stages,
        location: Location::Container,
    }
}

/// Standard mounts for one toolchain: the source tree read-only, then the
/// writable build, dependency and output directories.
pub fn mounts(root: &Path, dirs: &ToolchainDirs) -> Vec<Mount> {
    let mount = |host: &Path, container: &str, read_only| Mount {
        host: host.to_path_buf(),
        container: container.to_string(),
        read_only,
    };
    vec![
        mount(root, WORKSPACE, true),
        mount(&dirs.build, BUILD_DIR, false),
        mount(&dirs.deps, DEPS_DIR, false),
        mount(&dirs.output, OUTPUT_DIR, false),
    ]
}

/// Arguments for `docker` that run `script` in a throwaway container.
pub fn docker_run_args(
    image: &str,
    platform: Option<&str>,
    user: &[String],
    mounts: &[Mount],
    script: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--rm".into()];
    if let Some(platform) = platform {
        args.extend(["--platform".into(), platform.to_string()]);
    }
    args.extend(user.iter().cloned());
    for mount in mounts {
        args.extend(["-v".into(), mount.volume_arg()]);
    }
    args.extend([
        "-w".into(),
        WORKSPACE.into(),
        "-e".into(),
        "HOME=/tmp".into(),
        image.to_string(),
        "bash".into(),
        "-c".into(),
        script.to_string(),
    ]);
    args
}

/// Map a failed script run back to the phase it was in. Anything that is
/// not a phase code (docker itself failing, a signal) counts as prepare.
pub fn failure_phase(err: &ProcessError) -> Phase {
    err.exit_code()
        .and_then(Phase::from_exit_code)
        .unwrap_or(Phase::Prepare)
}

/// Render `plan` and run it inside `image`.
pub fn execute<R>(
    runtime: &R,
    image: &str,
    plan: &PipelinePlan,
    ctx: &PlanContext<'_>,
    mounts: &[Mount],
) -> Result<(), StepError>
where
    R: ContainerRuntime + ?Sized,
{
    let script = script::render(plan, ctx).map_err(|e| StepError::new(Phase::Prepare, e))?;
    debug!(lines = script.lines().count(), "rendered container script");

    let platform = match &ctx.toolchain.runner {
        crate::config::RunnerSpec::Docker(docker) => docker.platform.as_deref(),
        _ => None,
    };
    let args = docker_run_args(image, platform, &docker::user_args(), mounts, &script);
    info!(%image, toolchain = %ctx.toolchain.name, "starting container");
    runtime
        .run(&args)
        .map_err(|err| StepError::new(failure_phase(&err), err))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::config::{DockerConfig, RunnerSpec};
    use crate::docker::{Builder, ImageBuildRequest};

    #[derive(Default)]
    struct Recorder {
        runs: RefCell<Vec<Vec<String>>>,
        exit: Option<i32>,
    }

    impl ContainerRuntime for Recorder {
        fn image_exists(&self, _: &str) -> bool {
            true
        }
        fn pull(&self, _: &str, _: Option<&str>, _: Duration) -> Result<(), ProcessError> {
            Ok(())
        }
        fn build(&self, _: &ImageBuildRequest, _: Builder) -> Result<(), ProcessError> {
            Ok(())
        }
        fn has_command(&self, _: &str, _: &str, _: Duration) -> bool {
            true
        }
        fn run(&self, args: &[String]) -> Result<(), ProcessError> {
            self.runs.borrow_mut().push(args.to_vec());
            match self.exit {
                None => Ok(()),
                Some(code) => Err(ProcessError::Failed {
                    command: "docker run".into(),
                    code: Some(code),
                    output: String::new(),
                }),
            }
        }
    }

    fn dirs() -> ToolchainDirs {
        ToolchainDirs {
            build: PathBuf::from("/p/.cache/ci/t/build"),
            deps: PathBuf::from("/p/.cache/ci/t/deps"),
            output: PathBuf::from("/p/.bin/ci/t"),
        }
    }

    #[test]
    fn run_args_mount_workspace_read_only() {
        let mounts = mounts(Path::new("/p"), &dirs());
        let user = vec!["--user".to_string(), "1000:1000".to_string()];
        let args = docker_run_args("gcc:14", Some("linux/arm64"), &user, &mounts, "echo hi");
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--platform",
                "linux/arm64",
                "--user",
                "1000:1000",
                "-v",
                "/p:/workspace:ro",
                "-v",
                "/p/.cache/ci/t/build:/tmp/build",
                "-v",
                "/p/.cache/ci/t/deps:/tmp/deps",
                "-v",
                "/p/.bin/ci/t:/output",
                "-w",
                "/workspace",
                "-e",
                "HOME=/tmp",
                "gcc:14",
                "bash",
                "-c",
                "echo hi",
            ]
        );
    }

    #[test]
    fn script_exit_code_selects_the_failed_phase() {
        let runtime = Recorder {
            exit: Some(Phase::Build.exit_code()),
            ..Default::default()
        };
        let mut tc = ResolvedToolchain::native("linux-amd64");
        tc.runner = RunnerSpec::Docker(DockerConfig {
            platform: Some("linux/amd64".into()),
            ..Default::default()
        });
        let ctx = context(&tc, "demo", Stages::default());
        let err = execute(&runtime, "gcc:14", &PipelinePlan::default(), &ctx, &[]).unwrap_err();
        assert_eq!(err.phase, Phase::Build);

        let runs = runtime.runs.borrow();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].windows(2).any(|w| w == ["--platform", "linux/amd64"]));
    }

    #[test]
    fn docker_failure_without_phase_code_is_prepare() {
        let err = ProcessError::Failed {
            command: "docker run".into(),
            code: Some(125),
            output: String::new(),
        };
        assert_eq!(failure_phase(&err), Phase::Prepare);
        let err = ProcessError::Interrupted {
            command: "docker run".into(),
        };
        assert_eq!(failure_phase(&err), Phase::Prepare);
    }
}
