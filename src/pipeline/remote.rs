//! Pipeline execution on an ssh runner.
//!
//! The project is mirrored with `rsync`, the rendered script is fed to
//! `bash -s` over ssh, and the toolchain's output directory is copied back.

use std::path::Path;

use tracing::info;

use crate::backend::{Location, PipelinePlan, PlanContext, Stages};
use crate::config::{ResolvedToolchain, SshTarget};
use crate::error::{Phase, ProcessError, StepError};
use crate::process::{self, ToolCommand};

use super::container::failure_phase;
use super::script;

/// Directories never mirrored to the remote host.
const EXCLUDED: [&str; 3] = [".cache", ".bin", ".git"];

/// Remote checkout directory, relative to the remote user's home unless absolute.
///
/// A leading `~/` is dropped since ssh and rsync both resolve relative paths
/// against the home directory.
pub fn remote_dir(target: &SshTarget, project_name: &str) -> String {
    match target.remote_dir.as_deref() {
        None => format!(".cxci/{project_name}"),
        Some("~") => ".".to_string(),
        Some(dir) => dir.strip_prefix("~/").unwrap_or(dir).to_string(),
    }
}

/// Paths relative to the remote checkout, which is the script's working directory.
pub fn context<'a>(
    toolchain: &'a ResolvedToolchain,
    project_name: &'a str,
    stages: Stages,
) -> PlanContext<'a> {
    let cache = format!(".cache/ci/{}", toolchain.name);
    PlanContext {
        toolchain,
        project_name,
        source_dir: ".".into(),
        build_dir: format!("{cache}/build"),
        deps_dir: format!("{cache}/deps"),
        output_dir: format!(".bin/ci/{}", toolchain.name),
        stages,
        location: Location::Remote,
    }
}

fn ssh_args(target: &SshTarget) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(port) = target.port {
        args.extend(["-p".to_string(), port.to_string()]);
    }
    args.push(target.destination());
    args
}

/// `ssh [-p N] dest <command>`
pub fn ssh_command(target: &SshTarget, command: &str) -> ToolCommand {
    ToolCommand::new("ssh").args(ssh_args(target)).arg(command)
}

/// `rsync` with ssh transport on the target's port.
fn rsync(target: &SshTarget) -> ToolCommand {
    let mut cmd = ToolCommand::new("rsync").arg("-az");
    if let Some(port) = target.port {
        cmd = cmd.args(["-e".to_string(), format!("ssh -p {port}")]);
    }
    cmd
}

/// Mirror the project tree to `dir` on the remote host.
pub fn upload_command(target: &SshTarget, root: &Path, dir: &str) -> ToolCommand {
    let mut cmd = rsync(target).arg("--delete");
    for excluded in EXCLUDED {
        cmd = cmd.args(["--exclude", excluded]);
    }
    cmd.arg(format!("{}/", root.display()))
        .arg(format!("{}:{dir}/", target.destination()))
}

/// Copy `remote_output` (relative to `dir`) back into `local_output`.
pub fn download_command(
    target: &SshTarget,
    dir: &str,
    remote_output: &str,
    local_output: &Path,
) -> ToolCommand {
    rsync(target)
        .arg(format!("{}:{dir}/{remote_output}/", target.destination()))
        .arg(format!("{}/", local_output.display()))
}

/// Sync, run `plan` remotely, then fetch the collected artifacts.
pub fn execute(
    target: &SshTarget,
    root: &Path,
    local_output: &Path,
    plan: &PipelinePlan,
    ctx: &PlanContext<'_>,
) -> Result<(), StepError> {
    let dir = remote_dir(target, ctx.project_name);
    let quoted = shell_words::quote(&dir).into_owned();
    let prepare = |err: ProcessError| StepError::new(Phase::Prepare, err);

    info!(destination = %target.destination(), %dir, "syncing project");
    process::run_captured(&ssh_command(target, &format!("mkdir -p {quoted}"))).map_err(prepare)?;
    process::run_captured(&upload_command(target, root, &dir)).map_err(prepare)?;

    let script = script::render(plan, ctx).map_err(|e| StepError::new(Phase::Prepare, e))?;
    let cmd = ssh_command(target, &format!("cd {quoted} && bash -s")).stdin(script);
    info!(toolchain = %ctx.toolchain.name, "running remote pipeline");
    process::run_inherited(&cmd).map_err(|err| StepError::new(failure_phase(&err), err))?;

    process::run_captured(&download_command(
        target,
        &dir,
        &ctx.output_dir,
        local_output,
    ))
    .map_err(|err| StepError::new(Phase::Collect, err))?;
    Ok(())
}
