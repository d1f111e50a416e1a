// Container runtime boundary: image queries, pull, build and run via the docker CLI.

pub mod engine;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ProcessError;

pub use engine::{DockerCli, ensure_available, user_args};

/// Which image builder to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builder {
    /// `docker buildx build --load`.
    Buildx,
    /// Plain `docker build`, used as the one-time fallback.
    Classic,
}

/// A fully resolved image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildRequest {
    pub tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub platform: Option<String>,
    /// Build arguments, sorted by key.
    pub args: Vec<(String, String)>,
}

impl ImageBuildRequest {
    /// Arguments passed to `docker` for the given builder.
    pub fn docker_args(&self, builder: Builder) -> Vec<String> {
        let mut args: Vec<String> = match builder {
            Builder::Buildx => vec!["buildx".into(), "build".into()],
            Builder::Classic => vec!["build".into()],
        };
        args.extend([
            "-f".into(),
            self.dockerfile.display().to_string(),
            "-t".into(),
            self.tag.clone(),
        ]);
        if let Some(platform) = &self.platform {
            args.extend(["--platform".into(), platform.clone()]);
        }
        for (key, value) in &self.args {
            args.extend(["--build-arg".into(), format!("{key}={value}")]);
        }
        if builder == Builder::Buildx {
            args.push("--load".into());
        }
        args.push(self.context.display().to_string());
        args
    }
}

/// Operations the resolver and the container adapter need from a runtime.
pub trait ContainerRuntime {
    /// Whether `image` is present in the local image store.
    fn image_exists(&self, image: &str) -> bool;

    /// Pull `image`, killing the pull if it outlives `timeout`.
    fn pull(&self, image: &str, platform: Option<&str>, timeout: Duration)
    -> Result<(), ProcessError>;

    fn build(&self, request: &ImageBuildRequest, builder: Builder) -> Result<(), ProcessError>;

    /// Whether `command` resolves inside `image`. Errors and timeouts count as absent.
    fn has_command(&self, image: &str, command: &str, timeout: Duration) -> bool;

    /// `docker run` with the given arguments, output attached to the terminal.
    fn run(&self, args: &[String]) -> Result<(), ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ImageBuildRequest {
        ImageBuildRequest {
            tag: "cxci/linux:0123456789ab".into(),
            dockerfile: PathBuf::from("/p/docker/Dockerfile"),
            context: PathBuf::from("/p/docker"),
            platform: Some("linux/arm64".into()),
            args: vec![("A".into(), "1".into()), ("B".into(), "two words".into())],
        }
    }

    #[test]
    fn buildx_args_load_into_local_store() {
        let args = request().docker_args(Builder::Buildx);
        assert_eq!(&args[..2], ["buildx", "build"]);
        assert!(args.contains(&"--load".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/p/docker"));
        let pos = args.iter().position(|a| a == "--platform").unwrap();
        assert_eq!(args[pos + 1], "linux/arm64");
    }

    #[test]
    fn classic_args_drop_load() {
        let args = request().docker_args(Builder::Classic);
        assert_eq!(args[0], "build");
        assert!(!args.contains(&"--load".to_string()));
        assert!(args.contains(&"B=two words".to_string()));
    }
}
