use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::error::Phase;
use crate::process::{self, ToolCommand};

use super::artifacts::{self, ArtifactRules};
use super::plan::{Location, PipelinePlan, PlanContext, Step, StepAction};
use super::progress::{StepMode, run_step};
use super::variant::{BuildVariant, NATIVE_CACHE, Purpose, VariantDirs};
use super::{
    Backend, BackendKind, BenchOptions, BuildOptions, Dependency, Target, TestOptions,
    jobs_or_default, tool, vcpkg,
};

const MARKER: &str = "CMakeCache.txt";
const PRESETS: &str = "CMakePresets.json";
/// vcpkg checkout inside the stock build images.
const CONTAINER_VCPKG_ROOT: &str = "/opt/vcpkg";
const ARTIFACT_DEPTH: usize = 3;

/// Targets CMake generates for every project.
const HOUSEKEEPING_TARGETS: &[&str] = &[
    "all",
    "clean",
    "help",
    "test",
    "edit_cache",
    "rebuild_cache",
    "list_install_components",
];
const DASHBOARD_PREFIXES: &[&str] = &["Experimental", "Nightly", "Continuous"];

/// CMake with vcpkg manifest-mode dependencies.
pub struct CMakeVcpkg {
    root: PathBuf,
    name: String,
    vcpkg_root: Option<PathBuf>,
}

impl CMakeVcpkg {
    pub fn new(root: PathBuf, name: String, vcpkg_root: Option<PathBuf>) -> Self {
        Self {
            root,
            name,
            vcpkg_root,
        }
    }

    fn manifest(&self) -> PathBuf {
        self.root.join(vcpkg::MANIFEST)
    }

    fn has_manifest(&self) -> bool {
        self.manifest().is_file()
    }

    fn vcpkg(&self) -> ToolCommand {
        let program = match &self.vcpkg_root {
            Some(root) if root.join("vcpkg").is_file() => root.join("vcpkg").display().to_string(),
            _ => "vcpkg".to_string(),
        };
        tool(&self.root, &program)
    }

    fn configure_command(&self, dirs: &VariantDirs, variant: &BuildVariant, defines: &[&str]) -> ToolCommand {
        let mut cmd = tool(&self.root, "cmake");
        if self.root.join(PRESETS).is_file() {
            cmd = cmd.arg("--preset=default");
        } else {
            cmd = cmd.args(["-S".to_string(), self.root.display().to_string()]);
            if self.has_manifest()
                && let Some(vcpkg_root) = &self.vcpkg_root
            {
                cmd = cmd.arg(format!(
                    "-DCMAKE_TOOLCHAIN_FILE={}",
                    toolchain_file(&vcpkg_root.display().to_string())
                ));
            }
        }
        cmd = cmd.args(["-B".to_string(), dirs.cache.display().to_string()]);
        if self.has_manifest() {
            cmd = cmd.arg(format!(
                "-DVCPKG_INSTALLED_DIR={}",
                self.root.join(NATIVE_CACHE).join("vcpkg_installed").display()
            ));
        }
        cmd.arg(format!("-DCMAKE_BUILD_TYPE={}", variant.build_type().as_str()))
            .arg("-DCMAKE_EXPORT_COMPILE_COMMANDS=ON")
            .args(flag_defines(&variant.compile_flags(), &variant.link_flags()))
            .args(defines.iter().copied())
    }

    /// Reset if asked, then configure unless the cache already holds a tree.
    fn prepare(&self, dirs: &VariantDirs, variant: &BuildVariant, clean: bool, verbose: bool, defines: &[&str]) -> Result<()> {
        if clean {
            dirs.reset()?;
        }
        dirs.create()
            .with_context(|| format!("failed to create {}", dirs.cache.display()))?;
        if dirs.is_configured(MARKER) {
            debug!(dir = %dirs.cache.display(), "already configured");
            return Ok(());
        }
        info!(variant = %variant.dir_name(), "configuring");
        let cmd = self.configure_command(dirs, variant, defines);
        run_step(&cmd, &StepMode::for_configure(verbose)).context("cmake configure failed")
    }

    fn build_target(&self, dirs: &VariantDirs, target: Option<&str>, jobs: Option<usize>, verbose: bool) -> Result<()> {
        let mut cmd = tool(&self.root, "cmake")
            .args(["--build".to_string(), dirs.cache.display().to_string()])
            .args(["--parallel".to_string(), jobs_or_default(jobs).to_string()]);
        if let Some(target) = target {
            cmd = cmd.args(["--target", target]);
        }
        let label = format!("Building {}", target.unwrap_or(&self.name));
        run_step(&cmd, &StepMode::for_build(verbose, &label)).context("cmake build failed")
    }

    /// A configured build tree to list targets from, configuring a debug tree if none exists.
    fn listing_dir(&self) -> Result<PathBuf> {
        let native = self.root.join(NATIVE_CACHE);
        if let Ok(entries) = std::fs::read_dir(&native) {
            let mut configured: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.join(MARKER).is_file())
                .collect();
            configured.sort();
            if let Some(dir) = configured.into_iter().next() {
                return Ok(dir);
            }
        }
        let variant = BuildVariant::debug();
        let dirs = VariantDirs::native(&self.root, &variant, Purpose::Build);
        self.prepare(&dirs, &variant, false, false, &[])?;
        Ok(dirs.cache)
    }
}

fn toolchain_file(vcpkg_root: &str) -> String {
    format!("{vcpkg_root}/scripts/buildsystems/vcpkg.cmake")
}

fn flag_defines(compile: &[String], link: &[String]) -> Vec<String> {
    let mut defines = Vec::new();
    if !compile.is_empty() {
        let flags = compile.join(" ");
        defines.push(format!("-DCMAKE_C_FLAGS={flags}"));
        defines.push(format!("-DCMAKE_CXX_FLAGS={flags}"));
    }
    if !link.is_empty() {
        let flags = link.join(" ");
        defines.push(format!("-DCMAKE_EXE_LINKER_FLAGS={flags}"));
        defines.push(format!("-DCMAKE_SHARED_LINKER_FLAGS={flags}"));
    }
    defines
}

/// `ninja -t targets all` lines look like `app: CXX_EXECUTABLE_LINKER__app_Debug`.
pub fn parse_ninja_targets(output: &str) -> Vec<Target> {
    output
        .lines()
        .filter_map(|line| {
            let (name, rule) = line.trim().split_once(':')?;
            let name = name.trim();
            let rule = rule.trim().to_ascii_uppercase();
            if name.is_empty() || name.contains('/') || !rule.contains("_LINKER") {
                return None;
            }
            let kind = if rule.contains("EXECUTABLE") {
                "executable"
            } else if rule.contains("SHARED_LIBRARY") || rule.contains("MODULE_LIBRARY") {
                "shared library"
            } else if rule.contains("STATIC_LIBRARY") {
                "static library"
            } else {
                return None;
            };
            Some(Target {
                name: name.to_string(),
                kind: kind.to_string(),
            })
        })
        .collect()
}

/// `cmake --build <dir> --target help` lines look like `... app`.
pub fn parse_help_targets(output: &str) -> Vec<Target> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.trim().strip_prefix("...")?.trim();
            let name = name.split_whitespace().next()?;
            is_user_target(name).then(|| Target {
                name: name.to_string(),
                kind: "target".to_string(),
            })
        })
        .collect()
}

fn is_user_target(name: &str) -> bool {
    !(HOUSEKEEPING_TARGETS.contains(&name)
        || name.starts_with("install")
        || name.starts_with("package")
        || name.contains('/')
        || name.ends_with(".cmake")
        || name.ends_with(".txt")
        || DASHBOARD_PREFIXES.iter().any(|p| name.starts_with(p)))
}

impl Backend for CMakeVcpkg {
    fn kind(&self) -> BackendKind {
        BackendKind::CMake
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn project_name(&self) -> &str {
        &self.name
    }

    fn build(&self, opts: &BuildOptions) -> Result<VariantDirs> {
        let dirs = VariantDirs::native(&self.root, &opts.variant, Purpose::Build);
        self.prepare(&dirs, &opts.variant, opts.clean, opts.verbose, &[])?;
        self.build_target(&dirs, opts.target.as_deref(), opts.jobs, opts.verbose)?;

        let rules = ArtifactRules::new(dirs.cache.display().to_string(), ARTIFACT_DEPTH);
        let copied = artifacts::collect(&rules, &self.root, &dirs.output)
            .context("failed to collect artifacts")?;
        info!(count = copied.len(), output = %dirs.output.display(), "build finished");
        Ok(dirs)
    }

    fn test(&self, opts: &TestOptions) -> Result<()> {
        let dirs = VariantDirs::native(&self.root, &opts.variant, Purpose::Test);
        self.prepare(&dirs, &opts.variant, opts.clean, opts.verbose, &["-DENABLE_TESTING=ON"])?;
        let target = format!("{}_tests", self.name);
        self.build_target(&dirs, Some(&target), opts.jobs, opts.verbose)?;

        let mut cmd = tool(&self.root, "ctest")
            .args(["--test-dir".to_string(), dirs.cache.display().to_string()])
            .arg("--output-on-failure");
        if let Some(filter) = &opts.filter {
            cmd = cmd.args(["-R", filter.as_str()]);
        }
        if let Some(jobs) = opts.jobs {
            cmd = cmd.args(["-j".to_string(), jobs.to_string()]);
        }
        if opts.verbose {
            cmd = cmd.arg("--verbose");
        }
        process::run_inherited(&cmd).context("tests failed")
    }

    fn bench(&self, opts: &BenchOptions) -> Result<()> {
        let variant = BuildVariant::release();
        let dirs = VariantDirs::native(&self.root, &variant, Purpose::Bench);
        self.prepare(&dirs, &variant, opts.clean, opts.verbose, &["-DENABLE_BENCHMARKS=ON"])?;
        let target = opts
            .target
            .clone()
            .unwrap_or_else(|| format!("{}_bench", self.name));
        self.build_target(&dirs, Some(&target), opts.jobs, opts.verbose)?;

        let Some(exe) = [dirs.cache.join("bench").join(&target), dirs.cache.join(&target)]
            .into_iter()
            .find(|p| process::is_executable(p))
        else {
            bail!("benchmark executable '{target}' not found in {}", dirs.cache.display());
        };
        info!(executable = %exe.display(), "running benchmarks");
        let cmd = ToolCommand::new(exe.display().to_string())
            .args(opts.args.iter().cloned())
            .current_dir(&self.root);
        process::run_inherited(&cmd).context("benchmarks failed")
    }

    fn list_targets(&self) -> Result<Vec<Target>> {
        let dir = self.listing_dir()?;
        let dir_arg = dir.display().to_string();
        if dir.join("build.ninja").is_file() {
            let cmd = tool(&self.root, "ninja").args(["-C", dir_arg.as_str(), "-t", "targets", "all"]);
            let output = process::run_captured(&cmd)?;
            return Ok(parse_ninja_targets(&output));
        }
        let cmd = tool(&self.root, "cmake").args(["--build", dir_arg.as_str(), "--target", "help"]);
        let output = process::run_captured(&cmd)?;
        Ok(parse_help_targets(&output))
    }

    fn add_dependency(&self, name: &str, version: Option<&str>) -> Result<()> {
        if !self.has_manifest() {
            bail!(
                "{} not found; run `vcpkg new --application` to create a manifest",
                vcpkg::MANIFEST
            );
        }
        let cmd = self.vcpkg().args(["add", "port", name]);
        process::run_inherited(&cmd).with_context(|| format!("failed to add port {name}"))?;
        if let Some(version) = version {
            vcpkg::set_minimum_version(&self.manifest(), name, version)?;
        }
        Ok(())
    }

    fn remove_dependency(&self, name: &str) -> Result<()> {
        vcpkg::remove_from_manifest(&self.manifest(), name)
    }

    fn list_dependencies(&self) -> Result<Vec<Dependency>> {
        if !self.has_manifest() {
            return Ok(Vec::new());
        }
        vcpkg::list_manifest(&self.manifest())
    }

    fn search_dependencies(&self, query: &str) -> Result<Vec<Dependency>> {
        let output = process::run_captured(&self.vcpkg().args(["search", query]))?;
        Ok(vcpkg::parse_search(&output))
    }

    fn dependency_info(&self, name: &str) -> Result<Dependency> {
        let cmd = self.vcpkg().args(["x-package-info", name, "--x-json"]);
        // vcpkg can exit non-zero while still printing the document.
        let output = match process::run_captured(&cmd) {
            Ok(output) => output,
            Err(crate::error::ProcessError::Failed { output, .. }) => output,
            Err(err) => return Err(err.into()),
        };
        vcpkg::parse_package_info(&output, name)
    }

    fn ci_plan(&self, ctx: &PlanContext<'_>) -> PipelinePlan {
        let tc = ctx.toolchain;
        let settings = &tc.settings;
        let manifest = self.has_manifest();

        let vcpkg_root = settings.env.get("VCPKG_ROOT").cloned().or_else(|| match ctx.location {
            Location::Host => self.vcpkg_root.as_ref().map(|p| p.display().to_string()),
            Location::Container => Some(CONTAINER_VCPKG_ROOT.to_string()),
            Location::Remote => None,
        });

        let mut env = Vec::new();
        let mut steps = Vec::new();
        if manifest {
            let archives = format!("{}/vcpkg-archives", ctx.deps_dir);
            let downloads = format!("{}/vcpkg-downloads", ctx.deps_dir);
            env.push(("VCPKG_DEFAULT_BINARY_CACHE".to_string(), archives.clone()));
            env.push(("VCPKG_DOWNLOADS".to_string(), downloads.clone()));
            if let Some(root) = &vcpkg_root {
                env.push(("VCPKG_ROOT".to_string(), root.clone()));
            }
            steps.push(Step::exec(Phase::Prepare, "mkdir", ["-p".to_string(), archives, downloads]));
        }

        let mut configure = vec![
            "-S".to_string(),
            ctx.source_dir.clone(),
            "-B".to_string(),
            ctx.build_dir.clone(),
            "-G".to_string(),
            "Ninja".to_string(),
            format!("-DCMAKE_BUILD_TYPE={}", settings.build_type.as_str()),
        ];
        match (&tc.compilers.toolchain_file, manifest.then_some(vcpkg_root.as_ref()).flatten()) {
            (Some(file), Some(root)) => {
                configure.push(format!("-DCMAKE_TOOLCHAIN_FILE={}", toolchain_file(root)));
                configure.push(format!("-DVCPKG_CHAINLOAD_TOOLCHAIN_FILE={file}"));
            }
            (Some(file), None) => configure.push(format!("-DCMAKE_TOOLCHAIN_FILE={file}")),
            (None, Some(root)) => configure.push(format!("-DCMAKE_TOOLCHAIN_FILE={}", toolchain_file(root))),
            (None, None) => {}
        }
        if manifest {
            configure.push(format!("-DVCPKG_INSTALLED_DIR={}/vcpkg_installed", ctx.deps_dir));
        }
        if let Some(cc) = &tc.compilers.cc {
            configure.push(format!("-DCMAKE_C_COMPILER={cc}"));
        }
        if let Some(cxx) = &tc.compilers.cxx {
            configure.push(format!("-DCMAKE_CXX_COMPILER={cxx}"));
        }
        configure.extend(flag_defines(&[settings.optimization.flag()], &[]));
        if ctx.stages.test {
            configure.push("-DENABLE_TESTING=ON".to_string());
        }
        if ctx.stages.bench {
            configure.push("-DENABLE_BENCHMARKS=ON".to_string());
        }
        configure.extend(settings.cmake_args.iter().cloned());
        steps.push(
            Step::exec(Phase::Configure, "cmake", configure)
                .unless_exists(format!("{}/{MARKER}", ctx.build_dir)),
        );

        let mut build = vec![
            "--build".to_string(),
            ctx.build_dir.clone(),
            "--parallel".to_string(),
            settings.jobs.resolve().to_string(),
        ];
        if !settings.build_args.is_empty() {
            build.push("--".to_string());
            build.extend(settings.build_args.iter().cloned());
        }
        steps.push(Step::exec(Phase::Build, "cmake", build).with_progress());

        steps.push(Step::collect(
            ArtifactRules::new(ctx.build_dir.clone(), ARTIFACT_DEPTH),
            ctx.output_dir.clone(),
        ));

        if ctx.stages.test {
            let mut args = vec![
                "--test-dir".to_string(),
                ctx.build_dir.clone(),
                "--output-on-failure".to_string(),
            ];
            if ctx.stages.verbose {
                args.push("--verbose".to_string());
            }
            steps.push(Step::exec(Phase::Test, "ctest", args));
        }
        if ctx.stages.bench {
            steps.push(Step::action(
                Phase::Bench,
                StepAction::RunMatching {
                    dir: ctx.build_dir.clone(),
                    suffix: "_bench".to_string(),
                    max_depth: ARTIFACT_DEPTH,
                },
            ));
        }
        if ctx.stages.run {
            steps.push(Step::action(
                Phase::Run,
                StepAction::RunFirstExecutable {
                    dir: ctx.output_dir.clone(),
                    preferred: vec![ctx.project_name.to_string()],
                },
            ));
        }
        PipelinePlan { env, steps }
    }
}
