//! Environment resolution: turns a toolchain's runner into something the
//! execution adapters can run against.
//!
//! Docker runners resolve to an image that is guaranteed to exist locally.
//! Build mode tags images by a content hash of the Dockerfile and its build
//! arguments, so an unchanged Dockerfile is built at most once.

pub mod hash;
pub mod probe;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::BackendKind;
use crate::config::{DockerConfig, DockerMode, PullPolicy, ResolvedToolchain, RunnerSpec, SshTarget};
use crate::docker::{Builder, ContainerRuntime, ImageBuildRequest};
use crate::error::ResolveError;

pub use hash::{content_hash, image_tag};

/// Time limit for `docker pull`.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a toolchain's pipeline will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionTarget {
    Native,
    Image(String),
    Remote(SshTarget),
}

impl ExecutionTarget {
    pub fn describe(&self) -> String {
        match self {
            ExecutionTarget::Native => "native".to_string(),
            ExecutionTarget::Image(image) => format!("image {image}"),
            ExecutionTarget::Remote(target) => format!("ssh {}", target.destination()),
        }
    }
}

pub struct Resolver<'a, R: ContainerRuntime + ?Sized> {
    runtime: &'a R,
    project_root: &'a Path,
    namespace: &'a str,
    backend: BackendKind,
    pull_timeout: Duration,
    probe_timeout: Duration,
}

impl<'a, R: ContainerRuntime + ?Sized> Resolver<'a, R> {
    pub fn new(runtime: &'a R, project_root: &'a Path, namespace: &'a str, backend: BackendKind) -> Self {
        Self {
            runtime,
            project_root,
            namespace,
            backend,
            pull_timeout: PULL_TIMEOUT,
            probe_timeout: probe::PROBE_TIMEOUT,
        }
    }

    pub fn resolve(
        &self,
        toolchain: &ResolvedToolchain,
        rebuild: bool,
    ) -> Result<ExecutionTarget, ResolveError> {
        match &toolchain.runner {
            RunnerSpec::Native => Ok(ExecutionTarget::Native),
            RunnerSpec::Ssh(target) => Ok(ExecutionTarget::Remote(target.clone())),
            RunnerSpec::Docker(docker) => {
                let image = self.resolve_docker(&toolchain.name, docker, rebuild)?;
                if docker.verify_tools {
                    self.verify_tools(&image);
                }
                Ok(ExecutionTarget::Image(image))
            }
        }
    }

    fn resolve_docker(
        &self,
        toolchain: &str,
        docker: &DockerConfig,
        rebuild: bool,
    ) -> Result<String, ResolveError> {
        match docker.mode {
            DockerMode::Pull => {
                let image = configured_image(docker);
                self.resolve_pull(&image, docker, rebuild)?;
                Ok(image)
            }
            DockerMode::Local => {
                let image = configured_image(docker);
                if !self.runtime.image_exists(&image) {
                    return Err(ResolveError::LocalImageMissing { image });
                }
                Ok(image)
            }
            DockerMode::Build => self.resolve_build(toolchain, docker, rebuild),
        }
    }

    fn resolve_pull(&self, image: &str, docker: &DockerConfig, rebuild: bool) -> Result<(), ResolveError> {
        let present = self.runtime.image_exists(image);
        if docker.pull_policy == PullPolicy::Never && !present {
            return Err(ResolveError::NeverPolicyAbsent {
                image: image.to_string(),
            });
        }
        let should_pull = rebuild
            || match docker.pull_policy {
                PullPolicy::Always => true,
                PullPolicy::Never => false,
                PullPolicy::IfNotPresent => !present,
            };

        if !should_pull {
            info!(%image, "using local image");
            return Ok(());
        }

        info!(%image, "pulling image");
        self.runtime
            .pull(image, docker.platform.as_deref(), self.pull_timeout)
            .map_err(|source| ResolveError::Pull {
                image: image.to_string(),
                source,
            })
    }

    fn resolve_build(
        &self,
        toolchain: &str,
        docker: &DockerConfig,
        rebuild: bool,
    ) -> Result<String, ResolveError> {
        let (dockerfile, context) = self.build_paths(docker);
        if !dockerfile.is_file() {
            return Err(ResolveError::DockerfileMissing { path: dockerfile });
        }
        let contents = std::fs::read(&dockerfile).map_err(|source| ResolveError::DockerfileRead {
            path: dockerfile.clone(),
            source,
        })?;

        let args = hash::sorted_args(&docker.build.args);
        let digest = content_hash(&contents, &args);
        let tag = image_tag(self.namespace, toolchain, &digest);

        if !rebuild && self.runtime.image_exists(&tag) {
            info!(image = %tag, "image is up to date");
            return Ok(tag);
        }

        let request = ImageBuildRequest {
            tag: tag.clone(),
            dockerfile,
            context,
            platform: docker.platform.clone(),
            args,
        };

        info!(image = %tag, "building image");
        if let Err(err) = self.runtime.build(&request, Builder::Buildx) {
            if err.is_interrupted() {
                return Err(ResolveError::Build { image: tag, source: err });
            }
            warn!(error = %err, "buildx failed, retrying with docker build");
            self.runtime
                .build(&request, Builder::Classic)
                .map_err(|source| ResolveError::Build {
                    image: tag.clone(),
                    source,
                })?;
        }
        Ok(tag)
    }

    /// Dockerfile and context as absolute paths. The context defaults to the
    /// project root and the Dockerfile to `<context>/Dockerfile`.
    fn build_paths(&self, docker: &DockerConfig) -> (PathBuf, PathBuf) {
        let context = match &docker.build.context {
            Some(dir) => self.project_root.join(dir),
            None => self.project_root.to_path_buf(),
        };
        let dockerfile = match &docker.build.dockerfile {
            Some(file) => self.project_root.join(file),
            None => context.join("Dockerfile"),
        };
        (dockerfile, context)
    }

    fn verify_tools(&self, image: &str) {
        let missing = probe::missing_tools(self.runtime, image, self.backend, self.probe_timeout);
        for tool in missing {
            warn!(%image, %tool, "build tool not found in image");
        }
    }
}

fn configured_image(docker: &DockerConfig) -> String {
    docker.image.clone().unwrap_or_default()
}
