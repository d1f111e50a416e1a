use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::error::ProcessError;
use crate::process::{self, ToolCommand};

use super::{Builder, ContainerRuntime, ImageBuildRequest};

/// Verify that the Docker daemon is reachable.
pub fn ensure_available() -> Result<()> {
    let status = Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to invoke `docker`; is it installed and on PATH?")?;

    if !status.success() {
        bail!("docker daemon is not running (exit {})", status);
    }
    Ok(())
}

/// Returns `["--user", "uid:gid"]` on Unix so containers write files
/// as the invoking user. Empty on other platforms.
pub fn user_args() -> Vec<String> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid() and getegid() are simple POSIX getters that always succeed and have no side effects.
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        vec!["--user".into(), format!("{uid}:{gid}")]
    }

    #[cfg(not(unix))]
    {
        Vec::new()
    }
}

/// [`ContainerRuntime`] backed by the `docker` executable.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    fn command(&self) -> ToolCommand {
        ToolCommand::new("docker")
    }
}

impl ContainerRuntime for DockerCli {
    fn image_exists(&self, image: &str) -> bool {
        let cmd = self.command().args(["images", "-q", image]);
        match process::run_captured(&cmd) {
            Ok(out) => !out.trim().is_empty(),
            Err(err) => {
                debug!(%image, error = %err, "image lookup failed");
                false
            }
        }
    }

    fn pull(
        &self,
        image: &str,
        platform: Option<&str>,
        timeout: Duration,
    ) -> Result<(), ProcessError> {
        let mut cmd = self.command().arg("pull");
        if let Some(platform) = platform {
            cmd = cmd.args(["--platform", platform]);
        }
        let cmd = cmd.arg(image).timeout(timeout);
        process::run_captured(&cmd).map(|_| ())
    }

    fn build(&self, request: &ImageBuildRequest, builder: Builder) -> Result<(), ProcessError> {
        let cmd = self.command().args(request.docker_args(builder));
        process::run_inherited(&cmd)
    }

    fn has_command(&self, image: &str, command: &str, timeout: Duration) -> bool {
        let cmd = self
            .command()
            .args(["run", "--rm", "--entrypoint", "which", image, command])
            .timeout(timeout);
        process::run_captured(&cmd).is_ok()
    }

    fn run(&self, args: &[String]) -> Result<(), ProcessError> {
        let cmd = self.command().args(args.iter().cloned());
        process::run_inherited(&cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_available_does_not_panic() {
        // We only assert it doesn't panic; CI may or may not have Docker.
        let _ = ensure_available();
    }

    #[cfg(unix)]
    #[test]
    fn user_args_returns_pair() {
        let args = user_args();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0], "--user");
        assert!(args[1].contains(':'));
    }
}
