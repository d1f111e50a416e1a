use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::Phase;
use crate::process::{self, ToolCommand};

use super::artifacts::{self, ArtifactRules};
use super::plan::{Mount, PipelinePlan, PlanContext, Step, StepAction};
use super::progress::{StepMode, run_step};
use super::variant::{BuildVariant, NATIVE_CACHE, Purpose, VariantDirs, remove_dir_if_exists};
use super::{
    Backend, BackendKind, BenchOptions, BuildOptions, Dependency, Target, TestOptions,
    jobs_or_default, tool,
};

const MARKER: &str = "build.ninja";
const SUBPROJECTS: &str = "subprojects";
const ARTIFACT_DEPTH: usize = 3;
const BENCH_SUITE: &str = "benchmark";
/// Suites that belong to vendored test and benchmark frameworks.
const FOREIGN_SUITES: &[&str] = &["google-benchmark", "gtest", "gmock", "catch2", BENCH_SUITE];
const LISTED_TYPES: &[&str] = &["executable", "static library", "shared library", "shared module"];

pub struct Meson {
    root: PathBuf,
    name: String,
}

#[derive(Debug, Deserialize)]
struct IntrospectTarget {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Meson {
    pub fn new(root: PathBuf, name: String) -> Self {
        Self { root, name }
    }

    fn subprojects(&self) -> PathBuf {
        self.root.join(SUBPROJECTS)
    }

    fn setup_command(&self, dirs: &VariantDirs, variant: &BuildVariant) -> ToolCommand {
        let mut cmd = tool(&self.root, "meson")
            .arg("setup")
            .arg(dirs.cache.display().to_string())
            .arg(self.root.display().to_string())
            .arg(format!("--buildtype={}", variant.build_type().meson_name()));
        if let Some(level) = variant.optimization {
            cmd = cmd.arg(format!("--optimization={}", level.meson_value()));
        }
        if let Some(sanitizer) = variant.sanitizer {
            cmd = cmd.arg(format!("-Db_sanitize={}", sanitizer.runtime_name()));
        }
        cmd
    }

    fn prepare(&self, dirs: &VariantDirs, variant: &BuildVariant, clean: bool, verbose: bool) -> Result<()> {
        if clean {
            dirs.reset()?;
        }
        std::fs::create_dir_all(&dirs.output)?;
        if dirs.is_configured(MARKER) {
            debug!(dir = %dirs.cache.display(), "already configured");
            return Ok(());
        }
        // meson refuses to set up into a non-empty directory that is not a build tree.
        remove_dir_if_exists(&dirs.cache)?;
        info!(variant = %variant.dir_name(), "configuring");
        let cmd = self.setup_command(dirs, variant);
        run_step(&cmd, &StepMode::for_configure(verbose)).context("meson setup failed")
    }

    fn compile(&self, dirs: &VariantDirs, target: Option<&str>, jobs: Option<usize>, verbose: bool) -> Result<()> {
        let mut cmd = tool(&self.root, "meson")
            .args(["compile".to_string(), "-C".to_string(), dirs.cache.display().to_string()])
            .args(["-j".to_string(), jobs_or_default(jobs).to_string()]);
        if let Some(target) = target {
            cmd = cmd.arg(target);
        }
        let label = format!("Building {}", target.unwrap_or(&self.name));
        run_step(&cmd, &StepMode::for_build(verbose, &label)).context("meson compile failed")
    }

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
        self.prepare(&dirs, &variant, false, false)?;
        Ok(dirs.cache)
    }
}

fn no_foreign_suites() -> Vec<String> {
    FOREIGN_SUITES
        .iter()
        .flat_map(|suite| ["--no-suite".to_string(), suite.to_string()])
        .collect()
}

/// Targets from `meson introspect --targets` JSON.
pub fn parse_introspection(json: &str) -> Result<Vec<Target>> {
    let targets: Vec<IntrospectTarget> =
        serde_json::from_str(json).context("failed to parse meson target list")?;
    Ok(targets
        .into_iter()
        .filter(|t| LISTED_TYPES.contains(&t.kind.as_str()))
        .map(|t| Target {
            name: t.name,
            kind: t.kind,
        })
        .collect())
}

/// `wrapdb_version` from a `.wrap` file, when present.
pub fn wrap_version(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "wrapdb_version").then(|| value.trim().to_string())
    })
}

/// Newest version from `meson wrap info <name>`. Versions are listed newest first.
pub fn parse_wrap_info(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.starts_with(char::is_whitespace))
        .find_map(|line| line.split_whitespace().next())
        .map(str::to_string)
}

impl Backend for Meson {
    fn kind(&self) -> BackendKind {
        BackendKind::Meson
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn project_name(&self) -> &str {
        &self.name
    }

    fn build(&self, opts: &BuildOptions) -> Result<VariantDirs> {
        let dirs = VariantDirs::native(&self.root, &opts.variant, Purpose::Build);
        self.prepare(&dirs, &opts.variant, opts.clean, opts.verbose)?;
        self.compile(&dirs, opts.target.as_deref(), opts.jobs, opts.verbose)?;

        let rules = ArtifactRules::new(dirs.cache.display().to_string(), ARTIFACT_DEPTH);
        let copied = artifacts::collect(&rules, &self.root, &dirs.output)
            .context("failed to collect artifacts")?;
        info!(count = copied.len(), output = %dirs.output.display(), "build finished");
        Ok(dirs)
    }

    fn test(&self, opts: &TestOptions) -> Result<()> {
        let dirs = VariantDirs::native(&self.root, &opts.variant, Purpose::Test);
        self.prepare(&dirs, &opts.variant, opts.clean, opts.verbose)?;
        self.compile(&dirs, None, opts.jobs, opts.verbose)?;

        let mut cmd = tool(&self.root, "meson")
            .args(["test".to_string(), "-C".to_string(), dirs.cache.display().to_string()])
            .args(no_foreign_suites())
            .arg(if opts.verbose { "-v" } else { "--quiet" });
        if let Some(filter) = &opts.filter {
            cmd = cmd.arg(filter.as_str());
        }
        process::run_inherited(&cmd).context("tests failed")
    }

    fn bench(&self, opts: &BenchOptions) -> Result<()> {
        let variant = BuildVariant::release();
        let dirs = VariantDirs::native(&self.root, &variant, Purpose::Bench);
        self.prepare(&dirs, &variant, opts.clean, opts.verbose)?;
        self.compile(&dirs, opts.target.as_deref(), opts.jobs, opts.verbose)?;

        let cmd = match &opts.target {
            Some(target) => {
                let Some(exe) = [dirs.cache.join("bench").join(target), dirs.cache.join(target)]
                    .into_iter()
                    .find(|p| process::is_executable(p))
                else {
                    bail!("benchmark executable '{target}' not found in {}", dirs.cache.display());
                };
                ToolCommand::new(exe.display().to_string())
                    .args(opts.args.iter().cloned())
                    .current_dir(&self.root)
            }
            None => tool(&self.root, "meson")
                .args(["test".to_string(), "-C".to_string(), dirs.cache.display().to_string()])
                .args(["--suite", BENCH_SUITE, "-v"]),
        };
        process::run_inherited(&cmd).context("benchmarks failed")
    }

    fn list_targets(&self) -> Result<Vec<Target>> {
        let dir = self.listing_dir()?;
        let cmd = tool(&self.root, "meson")
            .args(["introspect", "--targets"])
            .arg(dir.display().to_string());
        let output = process::run_captured(&cmd).context("meson introspect failed")?;
        parse_introspection(&output)
    }

    fn add_dependency(&self, name: &str, version: Option<&str>) -> Result<()> {
        if let Some(version) = version {
            warn!(version = %version, "WrapDB installs the latest wrap; ignoring the requested version");
        }
        std::fs::create_dir_all(self.subprojects())?;
        let cmd = tool(&self.root, "meson").args(["wrap", "install", name]);
        process::run_inherited(&cmd).with_context(|| format!("failed to install wrap for {name}"))
    }

    fn remove_dependency(&self, name: &str) -> Result<()> {
        let wrap = self.subprojects().join(format!("{name}.wrap"));
        if !wrap.is_file() {
            bail!("wrap file not found: {}", wrap.display());
        }
        std::fs::remove_file(&wrap).with_context(|| format!("failed to remove {}", wrap.display()))?;
        remove_dir_if_exists(&self.subprojects().join(name))?;
        Ok(())
    }

    fn list_dependencies(&self) -> Result<Vec<Dependency>> {
        let Ok(entries) = std::fs::read_dir(self.subprojects()) else {
            return Ok(Vec::new());
        };
        let mut deps: Vec<Dependency> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "wrap"))
            .filter_map(|path| {
                let name = path.file_stem()?.to_str()?.to_string();
                let version = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|contents| wrap_version(&contents));
                Some(Dependency {
                    name,
                    version,
                    description: None,
                })
            })
            .collect();
        deps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(deps)
    }

    fn search_dependencies(&self, query: &str) -> Result<Vec<Dependency>> {
        let cmd = tool(&self.root, "meson").args(["wrap", "search", query]);
        let output = process::run_captured(&cmd).context("meson wrap search failed")?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|name| Dependency {
                name: name.to_string(),
                version: None,
                description: None,
            })
            .collect())
    }

    fn dependency_info(&self, name: &str) -> Result<Dependency> {
        let cmd = tool(&self.root, "meson").args(["wrap", "info", name]);
        let output = process::run_captured(&cmd).with_context(|| format!("wrap '{name}' not found"))?;
        Ok(Dependency {
            name: name.to_string(),
            version: parse_wrap_info(&output),
            description: None,
        })
    }

    fn ci_plan(&self, ctx: &PlanContext<'_>) -> PipelinePlan {
        let tc = ctx.toolchain;
        let settings = &tc.settings;

        let mut env = Vec::new();
        if let Some(cc) = &tc.compilers.cc {
            env.push(("CC".to_string(), cc.clone()));
        }
        if let Some(cxx) = &tc.compilers.cxx {
            env.push(("CXX".to_string(), cxx.clone()));
        }

        let mut setup = vec![
            "setup".to_string(),
            ctx.build_dir.clone(),
            ctx.source_dir.clone(),
            format!("--buildtype={}", settings.build_type.meson_name()),
        ];
        setup.push(format!("--optimization={}", settings.optimization.meson_value()));
        if let Some(file) = &tc.compilers.toolchain_file {
            setup.push(format!("--cross-file={file}"));
        }
        setup.extend(settings.meson_args.iter().cloned());

        let mut compile = vec![
            "compile".to_string(),
            "-C".to_string(),
            ctx.build_dir.clone(),
            "-j".to_string(),
            settings.jobs.resolve().to_string(),
        ];
        compile.extend(settings.build_args.iter().cloned());

        let mut steps = vec![
            Step::exec(Phase::Configure, "meson", setup)
                .unless_exists(format!("{}/{MARKER}", ctx.build_dir)),
            Step::exec(Phase::Build, "meson", compile).with_progress(),
            Step::collect(
                ArtifactRules::new(ctx.build_dir.clone(), ARTIFACT_DEPTH),
                ctx.output_dir.clone(),
            ),
        ];
        let verbosity = if ctx.stages.verbose { "-v" } else { "--quiet" };
        if ctx.stages.test {
            let mut args = vec!["test".to_string(), "-C".to_string(), ctx.build_dir.clone()];
            args.extend(no_foreign_suites());
            args.push(verbosity.to_string());
            steps.push(Step::exec(Phase::Test, "meson", args));
        }
        if ctx.stages.bench {
            let args = vec![
                "test".to_string(),
                "-C".to_string(),
                ctx.build_dir.clone(),
                "--suite".to_string(),
                BENCH_SUITE.to_string(),
                "-v".to_string(),
            ];
            steps.push(Step::exec(Phase::Bench, "meson", args));
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

    /// Wraps download into `subprojects/`, which must stay writable under the
    /// read-only workspace mount.
    fn container_mounts(&self) -> Vec<Mount> {
        let subprojects = self.subprojects();
        if !subprojects.is_dir() {
            return Vec::new();
        }
        vec![Mount {
            host: subprojects,
            container: format!("/workspace/{SUBPROJECTS}"),
            read_only: false,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::plan::{Location, Stages};
    use crate::config::{BuildType, ResolvedToolchain};

    #[test]
    fn introspection_keeps_binaries_and_libraries() {
        let json = r#"[
            {"name": "app", "type": "executable", "id": "app@exe"},
            {"name": "core", "type": "static library"},
            {"name": "gen", "type": "custom"},
            {"name": "docs", "type": "run"}
        ]"#;
        let names: Vec<String> = parse_introspection(json)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["app", "core"]);
        assert!(parse_introspection("not json").is_err());
    }

    #[test]
    fn wrap_metadata_parsing() {
        let wrap = "[wrap-file]\ndirectory = fmt-10.2.1\nwrapdb_version = 10.2.1-1\n";
        assert_eq!(wrap_version(wrap).as_deref(), Some("10.2.1-1"));
        assert_eq!(wrap_version("[wrap-git]\nurl = x\n"), None);
        let info = "Dependency fmt has versions:\n  10.2.1 1\n  10.1.1 1\n";
        assert_eq!(parse_wrap_info(info).as_deref(), Some("10.2.1"));
    }

    #[test]
    fn wrap_dependencies_are_listed_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let meson = Meson::new(dir.path().to_path_buf(), "demo".into());
        let sub = dir.path().join(SUBPROJECTS);
        std::fs::create_dir_all(sub.join("fmt-10.2.1")).unwrap();
        std::fs::create_dir_all(sub.join("zlib")).unwrap();
        std::fs::write(sub.join("zlib.wrap"), "[wrap-file]\nwrapdb_version = 1.3.1-1\n").unwrap();
        std::fs::write(sub.join("fmt.wrap"), "[wrap-file]\n").unwrap();

        let names: Vec<String> = meson
            .list_dependencies()
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["fmt", "zlib"]);

        meson.remove_dependency("zlib").unwrap();
        assert!(!sub.join("zlib.wrap").exists());
        assert!(!sub.join("zlib").exists());
        assert!(meson.remove_dependency("zlib").is_err());
    }

    #[test]
    fn ci_plan_maps_build_settings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(SUBPROJECTS)).unwrap();
        let meson = Meson::new(dir.path().to_path_buf(), "demo".into());
        let mut tc = ResolvedToolchain::native("linux");
        tc.settings.build_type = BuildType::RelWithDebInfo;
        tc.compilers.cc = Some("gcc-13".into());
        let ctx = PlanContext {
            toolchain: &tc,
            project_name: "demo",
            source_dir: "/workspace".into(),
            build_dir: "/tmp/build".into(),
            deps_dir: "/tmp/deps".into(),
            output_dir: "/output".into(),
            stages: Stages {
                test: true,
                ..Stages::default()
            },
            location: Location::Container,
        };
        let plan = meson.ci_plan(&ctx);
        assert_eq!(plan.env, vec![("CC".to_string(), "gcc-13".to_string())]);
        let StepAction::Exec { args, .. } = &plan.steps[0].action else {
            panic!("expected exec step");
        };
        assert_eq!(&args[..4], ["setup", "/tmp/build", "/workspace", "--buildtype=debugoptimized"]);
        assert_eq!(args[4], "--optimization=2");
        assert_eq!(plan.steps[0].skip_if_exists.as_deref(), Some("/tmp/build/build.ninja"));
        let StepAction::Exec { args, .. } = &plan.steps[3].action else {
            panic!("expected exec step");
        };
        assert!(args.windows(2).any(|w| w == ["--no-suite", "gtest"]));

        let mounts = meson.container_mounts();
        assert_eq!(mounts[0].container, "/workspace/subprojects");
    }
}
