//! Build-system adapters behind one contract.
//!
//! A [`Backend`] drives a single build system for the developer commands
//! (build, test, bench, run, dependency management) and describes the CI
//! pipeline for a toolchain as a [`PipelinePlan`]. The plan is executed on the
//! host, rendered into a container script, or sent over ssh by the pipeline
//! adapters.

pub mod artifacts;
pub mod bazel;
pub mod bazel_module;
pub mod cmake;
pub mod deps;
pub mod meson;
pub mod plan;
pub mod progress;
pub mod project;
pub mod variant;
pub mod vcpkg;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::config::UserSettings;
use crate::process::{self, ToolCommand};

pub use plan::{Location, Mount, PipelinePlan, PlanContext, Stages, Step, StepAction};
pub use variant::{BuildVariant, Purpose, VariantDirs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    CMake,
    Bazel,
    Meson,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::CMake => "cmake",
            BackendKind::Bazel => "bazel",
            BackendKind::Meson => "meson",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub variant: BuildVariant,
    pub jobs: Option<usize>,
    pub target: Option<String>,
    /// Remove the variant's cache and output first.
    pub clean: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub variant: BuildVariant,
    pub filter: Option<String>,
    pub jobs: Option<usize>,
    pub clean: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BenchOptions {
    pub target: Option<String>,
    pub jobs: Option<usize>,
    pub args: Vec<String>,
    pub clean: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub build: BuildOptions,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    /// Also drop CI caches, CI outputs and backend-managed state.
    pub all: bool,
}

/// A buildable target reported by the build system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub name: String,
    pub kind: String,
}

/// A declared or searchable third-party package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
}

pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Project root the backend was detected in.
    fn root(&self) -> &Path;

    fn project_name(&self) -> &str;

    /// Configure if needed, build, and collect artifacts into the variant's
    /// output directory.
    fn build(&self, opts: &BuildOptions) -> Result<VariantDirs>;

    fn test(&self, opts: &TestOptions) -> Result<()>;

    fn bench(&self, opts: &BenchOptions) -> Result<()>;

    /// Build, then run the selected executable from the output directory.
    fn run(&self, opts: &RunOptions) -> Result<()> {
        let dirs = self.build(&opts.build)?;
        let exe = artifacts::select_executable(
            &dirs.output,
            opts.build.target.as_deref(),
            &[self.project_name()],
        )?;
        tracing::info!(executable = %exe.display(), "running");
        let cmd = ToolCommand::new(exe.display().to_string())
            .args(opts.args.iter().cloned())
            .current_dir(self.root());
        process::run_inherited(&cmd).with_context(|| format!("{} failed", exe.display()))
    }

    fn clean(&self, opts: &CleanOptions) -> Result<()> {
        clean_dirs(self.root(), opts.all)
    }

    fn list_targets(&self) -> Result<Vec<Target>>;

    fn add_dependency(&self, name: &str, version: Option<&str>) -> Result<()>;

    fn remove_dependency(&self, name: &str) -> Result<()>;

    fn list_dependencies(&self) -> Result<Vec<Dependency>>;

    fn search_dependencies(&self, query: &str) -> Result<Vec<Dependency>>;

    fn dependency_info(&self, name: &str) -> Result<Dependency>;

    /// Steps for one toolchain's CI pipeline, with paths as seen from
    /// `ctx.location`.
    fn ci_plan(&self, ctx: &PlanContext<'_>) -> PipelinePlan;

    /// Extra bind mounts for containerized runs.
    fn container_mounts(&self) -> Vec<Mount> {
        Vec::new()
    }
}

/// Pick the backend for the project at `root`.
pub fn detect(root: &Path, settings: &UserSettings) -> Result<Box<dyn Backend>> {
    let Some(kind) = project::detect_kind(root) else {
        bail!(
            "no supported build system found in {} (expected MODULE.bazel, meson.build, vcpkg.json or CMakeLists.txt)",
            root.display()
        );
    };
    let name = project::project_name(root, kind);
    tracing::debug!(backend = %kind, project = %name, "detected build system");

    let backend: Box<dyn Backend> = match kind {
        BackendKind::CMake => Box::new(cmake::CMakeVcpkg::new(
            root.to_path_buf(),
            name,
            settings.vcpkg_root.clone(),
        )),
        BackendKind::Bazel => Box::new(bazel::Bazel::new(
            root.to_path_buf(),
            name,
            settings.bcr_root.clone(),
        )),
        BackendKind::Meson => Box::new(meson::Meson::new(root.to_path_buf(), name)),
    };
    Ok(backend)
}

/// Remove developer caches and outputs; with `all`, every cxci-managed directory.
pub fn clean_dirs(root: &Path, all: bool) -> Result<()> {
    let dirs: Vec<PathBuf> = if all {
        vec![root.join(".cache"), root.join(".bin")]
    } else {
        vec![root.join(variant::NATIVE_CACHE), root.join(variant::NATIVE_OUTPUT)]
    };
    for dir in dirs {
        variant::remove_dir_if_exists(&dir)
            .with_context(|| format!("failed to remove {}", dir.display()))?;
        tracing::debug!(dir = %dir.display(), "removed");
    }
    Ok(())
}

pub(crate) fn jobs_or_default(jobs: Option<usize>) -> usize {
    jobs.unwrap_or_else(|| crate::config::Jobs::Auto.resolve())
}

/// A tool invocation rooted at the project directory.
pub(crate) fn tool(root: &Path, program: &str) -> ToolCommand {
    ToolCommand::new(program).current_dir(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_requires_a_marker() {
        let dir = tempfile::tempdir().unwrap();
        let err = detect(dir.path(), &UserSettings::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("no supported build system"));
    }

    #[test]
    fn detect_reads_the_project_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meson.build"), "project('widget', 'cpp')\n").unwrap();
        let backend = detect(dir.path(), &UserSettings::default()).unwrap();
        assert_eq!(backend.kind(), BackendKind::Meson);
        assert_eq!(backend.project_name(), "widget");
        assert_eq!(backend.root(), dir.path());
    }

    #[test]
    fn clean_keeps_ci_state_unless_all() {
        let dir = tempfile::tempdir().unwrap();
        for sub in [".cache/native/debug", ".bin/native/debug", ".cache/ci/linux", ".bin/ci/linux"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        clean_dirs(dir.path(), false).unwrap();
        assert!(!dir.path().join(".cache/native").exists());
        assert!(!dir.path().join(".bin/native").exists());
        assert!(dir.path().join(".cache/ci/linux").exists());

        clean_dirs(dir.path(), true).unwrap();
        assert!(!dir.path().join(".cache").exists());
        assert!(!dir.path().join(".bin").exists());
    }
}
