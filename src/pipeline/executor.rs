use std::path::Path;

use tracing::debug;

use crate::backend::{Backend, Location, PlanContext, Stages};
use crate::config::{ResolvedToolchain, RunnerSpec};
use crate::docker::{self, DockerCli};
use crate::error::{Phase, ResolveError, StepError};
use crate::resolve::{ExecutionTarget, Resolver};

use super::layout::CiLayout;
use super::orchestrator::ToolchainExecutor;
use super::{container, native, remote};

/// Runs toolchains for real: docker for containers, ssh for remotes and the
/// backend's plan directly on the host otherwise.
pub struct DefaultExecutor<'a> {
    backend: &'a dyn Backend,
    layout: CiLayout,
    namespace: String,
    runtime: DockerCli,
    docker_checked: bool,
}

impl<'a> DefaultExecutor<'a> {
    pub fn new(backend: &'a dyn Backend, output: &str, namespace: &str) -> Self {
        Self {
            backend,
            layout: CiLayout::new(backend.root(), output),
            namespace: namespace.to_string(),
            runtime: DockerCli,
            docker_checked: false,
        }
    }

    fn root(&self) -> &Path {
        self.layout.root()
    }

    fn native_context<'t>(&'t self, toolchain: &'t ResolvedToolchain, stages: Stages) -> PlanContext<'t> {
        let dirs = self.layout.toolchain(&toolchain.name);
        PlanContext {
            toolchain,
            project_name: self.backend.project_name(),
            source_dir: self.root().display().to_string(),
            build_dir: dirs.build.display().to_string(),
            deps_dir: dirs.deps.display().to_string(),
            output_dir: dirs.output.display().to_string(),
            stages,
            location: Location::Host,
        }
    }
}

impl ToolchainExecutor for DefaultExecutor<'_> {
    fn prepare(&mut self, toolchain: &ResolvedToolchain) -> Result<(), StepError> {
        let dirs = self.layout.toolchain(&toolchain.name);
        let mounts = match toolchain.runner {
            RunnerSpec::Docker(_) => {
                if !self.docker_checked {
                    docker::ensure_available().map_err(|e| StepError::new(Phase::Prepare, e))?;
                    self.docker_checked = true;
                }
                self.backend.container_mounts()
            }
            _ => Vec::new(),
        };
        debug!(toolchain = %toolchain.name, build = %dirs.build.display(), "creating directories");
        dirs.prepare(&mounts)
            .map_err(|e| StepError::new(Phase::Prepare, e))
    }

    fn resolve(
        &mut self,
        toolchain: &ResolvedToolchain,
        rebuild: bool,
    ) -> Result<ExecutionTarget, ResolveError> {
        Resolver::new(&self.runtime, self.root(), &self.namespace, self.backend.kind())
            .resolve(toolchain, rebuild)
    }

    fn execute(
        &mut self,
        toolchain: &ResolvedToolchain,
        target: &ExecutionTarget,
        stages: Stages,
    ) -> Result<(), StepError> {
        let project = self.backend.project_name();
        match target {
            ExecutionTarget::Native => {
                let ctx = self.native_context(toolchain, stages);
                native::execute(&self.backend.ci_plan(&ctx), &ctx)
            }
            ExecutionTarget::Image(image) => {
                let ctx = container::context(toolchain, project, stages);
                let dirs = self.layout.toolchain(&toolchain.name);
                let mut mounts = container::mounts(self.root(), &dirs);
                mounts.extend(self.backend.container_mounts());
                container::execute(&self.runtime, image, &self.backend.ci_plan(&ctx), &ctx, &mounts)
            }
            ExecutionTarget::Remote(ssh) => {
                let ctx = remote::context(toolchain, project, stages);
                let output = self.layout.toolchain(&toolchain.name).output;
                remote::execute(ssh, self.root(), &output, &self.backend.ci_plan(&ctx), &ctx)
            }
        }
    }
}
