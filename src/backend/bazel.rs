use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::Phase;
use crate::process::{self, ToolCommand};

use super::artifacts::{self, ArtifactRules};
use super::plan::{Location, Mount, PipelinePlan, PlanContext, Step, StepAction};
use super::progress::{StepMode, run_step};
use super::variant::{BuildVariant, Purpose, VariantDirs};
use super::{
    Backend, BackendKind, BenchOptions, BuildOptions, CleanOptions, Dependency, Target,
    TestOptions, bazel_module, clean_dirs, jobs_or_default, tool,
};

/// Repository cache shared by every toolchain. Downloads are content-addressed.
const REPO_CACHE: &str = ".cache/bazel-repo";
const CONTAINER_REPO_CACHE: &str = "/tmp/bazel-repo";
const ARTIFACT_DEPTH: usize = 4;

pub struct Bazel {
    root: PathBuf,
    name: String,
    /// Local Bazel Central Registry checkout.
    bcr_root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModuleMetadata {
    homepage: Option<String>,
    versions: Vec<String>,
}

impl Bazel {
    pub fn new(root: PathBuf, name: String, bcr_root: Option<PathBuf>) -> Self {
        Self {
            root,
            name,
            bcr_root,
        }
    }

    fn module_file(&self) -> PathBuf {
        self.root.join(bazel_module::MODULE_FILE)
    }

    fn read_module(&self) -> Result<String> {
        let path = self.module_file();
        std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn write_module(&self, contents: &str) -> Result<()> {
        let path = self.module_file();
        std::fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))
    }

    fn modules_dir(&self) -> Result<PathBuf> {
        let Some(bcr) = &self.bcr_root else {
            bail!("no Bazel Central Registry checkout configured (set bcr_root or CXCI_BCR_ROOT)");
        };
        let modules = bcr.join("modules");
        if !modules.is_dir() {
            bail!("{} is not a registry checkout", bcr.display());
        }
        Ok(modules)
    }

    fn metadata(&self, modules: &Path, name: &str) -> Result<ModuleMetadata> {
        let path = modules.join(name).join("metadata.json");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("module '{name}' not found in the registry"))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn bazel(&self, command: &str, variant: &BuildVariant, dirs: &VariantDirs, jobs: Option<usize>) -> ToolCommand {
        tool(&self.root, "bazel")
            .arg(command)
            .args(variant_flags(variant))
            .arg(format!("--symlink_prefix={}/bazel-", dirs.cache.display()))
            .arg(format!("--repository_cache={}", self.root.join(REPO_CACHE).display()))
            .arg(format!("--jobs={}", jobs_or_default(jobs)))
    }

    fn first_bench_target(&self) -> Result<String> {
        let cmd = tool(&self.root, "bazel").args(["query", "kind(cc_binary, //bench:*)"]);
        let output = process::run_captured(&cmd).context("failed to query benchmark targets")?;
        output
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("//"))
            .map(str::to_string)
            .context("no benchmark targets found in //bench; pass a target")
    }
}

/// `-c dbg|opt` plus explicit level and sanitizer flags.
fn variant_flags(variant: &BuildVariant) -> Vec<String> {
    let mode = if variant.build_type().is_debug() { "dbg" } else { "opt" };
    let mut flags = vec!["-c".to_string(), mode.to_string()];
    flags.extend(variant.compile_flags().into_iter().map(|f| format!("--copt={f}")));
    flags.extend(variant.link_flags().into_iter().map(|f| format!("--linkopt={f}")));
    flags
}

/// `bazel query --output label_kind` lines look like `cc_binary rule //app:main`.
pub fn parse_label_kinds(output: &str) -> Vec<Target> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let kind = fields.next()?;
            let _rule = fields.next()?;
            let label = fields.next()?;
            kind.starts_with("cc_").then(|| Target {
                name: label.to_string(),
                kind: kind.to_string(),
            })
        })
        .collect()
}

impl Backend for Bazel {
    fn kind(&self) -> BackendKind {
        BackendKind::Bazel
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn project_name(&self) -> &str {
        &self.name
    }

    fn build(&self, opts: &BuildOptions) -> Result<VariantDirs> {
        let dirs = VariantDirs::native(&self.root, &opts.variant, Purpose::Build);
        if opts.clean {
            dirs.reset()?;
        }
        dirs.create()?;

        let target = opts.target.as_deref().unwrap_or("//...");
        let cmd = self.bazel("build", &opts.variant, &dirs, opts.jobs).arg(target);
        let label = format!("Building {target}");
        run_step(&cmd, &StepMode::for_build(opts.verbose, &label)).context("bazel build failed")?;

        let mut rules = ArtifactRules::new(dirs.cache.join("bazel-bin").display().to_string(), ARTIFACT_DEPTH);
        rules.follow_links = true;
        let copied = artifacts::collect(&rules, &self.root, &dirs.output)
            .context("failed to collect artifacts")?;
        info!(count = copied.len(), output = %dirs.output.display(), "build finished");
        Ok(dirs)
    }

    fn test(&self, opts: &TestOptions) -> Result<()> {
        let dirs = VariantDirs::native(&self.root, &opts.variant, Purpose::Test);
        if opts.clean {
            dirs.reset()?;
        }
        dirs.create()?;

        let output = if opts.verbose { "all" } else { "errors" };
        let mut cmd = self
            .bazel("test", &opts.variant, &dirs, opts.jobs)
            .arg(format!("--test_output={output}"));
        if let Some(filter) = &opts.filter {
            cmd = cmd.arg(format!("--test_filter={filter}"));
        }
        process::run_inherited(&cmd.arg("//...")).context("tests failed")
    }

    fn bench(&self, opts: &BenchOptions) -> Result<()> {
        let variant = BuildVariant::release();
        let dirs = VariantDirs::native(&self.root, &variant, Purpose::Bench);
        if opts.clean {
            dirs.reset()?;
        }
        dirs.create()?;

        let target = match &opts.target {
            Some(target) => target.clone(),
            None => self.first_bench_target()?,
        };
        info!(target = %target, "running benchmarks");
        let mut cmd = self.bazel("run", &variant, &dirs, opts.jobs).arg(&target);
        if !opts.args.is_empty() {
            cmd = cmd.arg("--").args(opts.args.iter().cloned());
        }
        process::run_inherited(&cmd).context("benchmarks failed")
    }

    fn clean(&self, opts: &CleanOptions) -> Result<()> {
        let mut cmd = tool(&self.root, "bazel").arg("clean");
        if opts.all {
            cmd = cmd.arg("--expunge");
        }
        if let Err(err) = process::run_captured(&cmd) {
            warn!(error = %err, "bazel clean failed");
        }
        clean_dirs(&self.root, opts.all)
    }

    fn list_targets(&self) -> Result<Vec<Target>> {
        let cmd = tool(&self.root, "bazel").args(["query", "//...", "--output", "label_kind"]);
        let output = process::run_captured(&cmd).context("bazel query failed")?;
        Ok(parse_label_kinds(&output))
    }

    fn add_dependency(&self, name: &str, version: Option<&str>) -> Result<()> {
        let version = match version {
            Some(version) => version.to_string(),
            None => {
                let modules = self.modules_dir()?;
                self.metadata(&modules, name)?
                    .versions
                    .pop()
                    .with_context(|| format!("module '{name}' has no published versions"))?
            }
        };
        let updated = bazel_module::upsert(&self.read_module()?, name, &version);
        self.write_module(&updated)?;
        info!(module = %name, version = %version, "added to MODULE.bazel");
        Ok(())
    }

    fn remove_dependency(&self, name: &str) -> Result<()> {
        let Some(updated) = bazel_module::remove(&self.read_module()?, name) else {
            bail!("dependency '{name}' is not declared in {}", bazel_module::MODULE_FILE);
        };
        self.write_module(&updated)
    }

    fn list_dependencies(&self) -> Result<Vec<Dependency>> {
        Ok(bazel_module::list(&self.read_module()?))
    }

    fn search_dependencies(&self, query: &str) -> Result<Vec<Dependency>> {
        let modules = self.modules_dir()?;
        let query = query.to_ascii_lowercase();
        let mut names: Vec<String> = std::fs::read_dir(&modules)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| name.to_ascii_lowercase().contains(&query))
            .collect();
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| {
                let metadata = self.metadata(&modules, &name).unwrap_or_default();
                Dependency {
                    version: metadata.versions.last().cloned(),
                    description: metadata.homepage,
                    name,
                }
            })
            .collect())
    }

    fn dependency_info(&self, name: &str) -> Result<Dependency> {
        let modules = self.modules_dir()?;
        let mut metadata = self.metadata(&modules, name)?;
        Ok(Dependency {
            name: name.to_string(),
            version: metadata.versions.pop(),
            description: metadata.homepage,
        })
    }

    fn ci_plan(&self, ctx: &PlanContext<'_>) -> PipelinePlan {
        let tc = ctx.toolchain;
        let settings = &tc.settings;
        let repo_cache = match ctx.location {
            Location::Host => self.root.join(REPO_CACHE).display().to_string(),
            Location::Container => CONTAINER_REPO_CACHE.to_string(),
            Location::Remote => REPO_CACHE.to_string(),
        };

        let mut env = Vec::new();
        if let Some(cc) = &tc.compilers.cc {
            env.push(("CC".to_string(), cc.clone()));
        }
        if let Some(cxx) = &tc.compilers.cxx {
            env.push(("CXX".to_string(), cxx.clone()));
        }
        if ctx.location == Location::Container {
            // Bazel refuses to start without a user name.
            env.push(("USER".to_string(), "cxci".to_string()));
        }

        let mode = if settings.build_type.is_debug() { "dbg" } else { "opt" };
        let mut common = vec![
            "-c".to_string(),
            mode.to_string(),
            format!("--symlink_prefix={}/bazel-", ctx.build_dir),
            format!("--repository_cache={repo_cache}"),
            format!("--jobs={}", settings.jobs.resolve()),
        ];
        common.push(format!("--copt={}", settings.optimization.flag()));
        if ctx.location == Location::Container {
            // The workspace is mounted read-only.
            common.push("--lockfile_mode=off".to_string());
        }
        common.extend(settings.bazel_args.iter().cloned());

        let startup = format!("--output_user_root={}/output_user_root", ctx.build_dir);
        let invoke = |command: &str, extra: &[&str]| {
            let mut args = vec![startup.clone(), command.to_string()];
            args.extend(common.iter().cloned());
            args.extend(settings.build_args.iter().cloned());
            args.extend(extra.iter().map(|s| s.to_string()));
            args
        };

        let bin = format!("{}/bazel-bin", ctx.build_dir);
        let mut rules = ArtifactRules::new(bin.clone(), ARTIFACT_DEPTH);
        rules.follow_links = true;

        let mut steps = vec![
            Step::exec(Phase::Build, "bazel", invoke("build", &["//..."])),
            Step::collect(rules, ctx.output_dir.clone()),
        ];
        if ctx.stages.test {
            let output = if ctx.stages.verbose { "--test_output=all" } else { "--test_output=errors" };
            steps.push(Step::exec(Phase::Test, "bazel", invoke("test", &[output, "//..."])));
        }
        if ctx.stages.bench {
            steps.push(Step::action(
                Phase::Bench,
                StepAction::RunMatching {
                    dir: bin,
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

    fn container_mounts(&self) -> Vec<Mount> {
        vec![Mount {
            host: self.root.join(REPO_CACHE),
            container: CONTAINER_REPO_CACHE.to_string(),
            read_only: false,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::plan::Stages;
    use crate::config::{OptLevel, ResolvedToolchain, Sanitizer};

    fn registry(dir: &Path) -> PathBuf {
        let bcr = dir.join("bcr");
        for (name, metadata) in [
            ("fmt", r#"{"homepage": "https://fmt.dev", "versions": ["9.1.0", "10.2.1"]}"#),
            ("zlib", r#"{"homepage": "https://zlib.net", "versions": ["1.3.1"]}"#),
        ] {
            let module = bcr.join("modules").join(name);
            std::fs::create_dir_all(&module).unwrap();
            std::fs::write(module.join("metadata.json"), metadata).unwrap();
        }
        bcr
    }

    fn backend(dir: &Path) -> Bazel {
        std::fs::write(dir.join("MODULE.bazel"), "module(name = \"demo\")\n").unwrap();
        Bazel::new(dir.to_path_buf(), "demo".into(), Some(registry(dir)))
    }

    #[test]
    fn variant_flags_map_level_and_sanitizer() {
        let variant = BuildVariant {
            release: true,
            optimization: Some(OptLevel::O3),
            sanitizer: Some(Sanitizer::Asan),
        };
        assert_eq!(
            variant_flags(&variant),
            vec![
                "-c",
                "opt",
                "--copt=-O3",
                "--copt=-fsanitize=address",
                "--copt=-fno-omit-frame-pointer",
                "--linkopt=-fsanitize=address",
            ]
        );
        assert_eq!(&variant_flags(&BuildVariant::debug())[..2], ["-c", "dbg"]);
    }

    #[test]
    fn label_kind_listing_keeps_cc_rules() {
        let output = "cc_binary rule //app:main\n\
                      cc_library rule //lib:core\n\
                      filegroup rule //:docs\n\
                      source file //app:main.cc\n";
        let names: Vec<String> = parse_label_kinds(output).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["//app:main", "//lib:core"]);
    }

    #[test]
    fn add_without_version_uses_latest_registry_version() {
        let dir = tempfile::tempdir().unwrap();
        let bazel = backend(dir.path());
        bazel.add_dependency("fmt", None).unwrap();
        let deps = bazel.list_dependencies().unwrap();
        assert_eq!(deps[0].name, "fmt");
        assert_eq!(deps[0].version.as_deref(), Some("10.2.1"));

        bazel.add_dependency("fmt", Some("9.1.0")).unwrap();
        assert_eq!(bazel.list_dependencies().unwrap()[0].version.as_deref(), Some("9.1.0"));

        bazel.remove_dependency("fmt").unwrap();
        assert!(bazel.list_dependencies().unwrap().is_empty());
        assert!(bazel.remove_dependency("fmt").is_err());
    }

    #[test]
    fn search_and_info_read_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let bazel = backend(dir.path());
        let found = bazel.search_dependencies("FM").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].description.as_deref(), Some("https://fmt.dev"));
        let info = bazel.dependency_info("zlib").unwrap();
        assert_eq!(info.version.as_deref(), Some("1.3.1"));
        assert!(bazel.dependency_info("boost").is_err());
    }

    #[test]
    fn container_plan_keeps_outputs_in_the_build_mount() {
        let dir = tempfile::tempdir().unwrap();
        let bazel = backend(dir.path());
        let tc = ResolvedToolchain::native("linux");
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
        let plan = bazel.ci_plan(&ctx);
        let StepAction::Exec { program, args } = &plan.steps[0].action else {
            panic!("expected exec step");
        };
        assert_eq!(program, "bazel");
        assert_eq!(args[0], "--output_user_root=/tmp/build/output_user_root");
        assert_eq!(args[1], "build");
        assert!(args.contains(&"--symlink_prefix=/tmp/build/bazel-".to_string()));
        assert!(args.contains(&"--repository_cache=/tmp/bazel-repo".to_string()));
        assert!(args.contains(&"--lockfile_mode=off".to_string()));
        assert_eq!(plan.steps[1].phase, Phase::Collect);
        assert_eq!(plan.steps[2].phase, Phase::Test);

        let mounts = bazel.container_mounts();
        assert_eq!(mounts[0].container, "/tmp/bazel-repo");
    }
}
