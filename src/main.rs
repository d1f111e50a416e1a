use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use crossterm::{cursor, execute};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cxci::backend::{
    self, Backend, BenchOptions, BuildOptions, BuildVariant, CleanOptions, RunOptions, Stages,
    TestOptions, deps,
};
use cxci::config::{OptLevel, RunnerSpec, Sanitizer, ToolchainConfig, UserSettings};
use cxci::error::{ConfigError, OrchestrateError, ProcessError, ResolveError};
use cxci::pipeline::{self, DefaultExecutor, RunOnce, RunOutcome, RunRequest};
use cxci::process;

#[derive(Parser)]
#[command(name = "cxci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build C/C++ projects across toolchains with CMake, Bazel or Meson", long_about = None)]
struct Cli {
    /// Stream full tool output and enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project directory (default: nearest ancestor with a project marker)
    #[arg(short = 'C', long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct VariantArgs {
    /// Build with optimizations
    #[arg(short, long)]
    release: bool,

    /// Optimization level: 0, 1, 2, 3, s or fast
    #[arg(short = 'O', long = "opt")]
    optimization: Option<OptLevel>,

    /// Sanitizer: asan, tsan, msan or ubsan
    #[arg(long)]
    sanitizer: Option<Sanitizer>,

    /// Parallel jobs (default: CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Remove the variant's cache and output first
    #[arg(long)]
    clean: bool,
}

impl VariantArgs {
    fn variant(&self) -> BuildVariant {
        BuildVariant {
            release: self.release,
            optimization: self.optimization,
            sanitizer: self.sanitizer,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build every active toolchain from cxci.yaml
    Ci(CiArgs),

    /// Build the project natively, or one configured toolchain
    Build {
        #[command(flatten)]
        variant: VariantArgs,

        /// Target to build
        #[arg(short, long)]
        target: Option<String>,

        /// Build this toolchain through the CI pipeline instead
        #[arg(long)]
        toolchain: Option<String>,

        /// Rebuild or re-pull the toolchain's image
        #[arg(long, requires = "toolchain")]
        rebuild: bool,
    },

    /// Build and run the tests
    Test {
        #[command(flatten)]
        variant: VariantArgs,

        /// Only run tests matching this filter
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Build and run an executable
    Run {
        #[command(flatten)]
        variant: VariantArgs,

        /// Executable to run (default: the project's main binary)
        #[arg(short, long)]
        target: Option<String>,

        /// Arguments passed to the executable
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Build in release mode and run a benchmark
    Bench {
        /// Benchmark target (default: <project>_bench)
        #[arg(short, long)]
        target: Option<String>,

        #[arg(short, long)]
        jobs: Option<usize>,

        #[arg(long)]
        clean: bool,

        /// Arguments passed to the benchmark
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Remove native build caches and outputs
    Clean {
        /// Also remove CI caches, CI outputs and build-system state
        #[arg(long)]
        all: bool,
    },

    /// List buildable targets
    Targets {
        #[arg(long)]
        json: bool,
    },

    /// List configured toolchains
    Toolchains,

    /// Add dependencies, as NAME or NAME@VERSION
    Add {
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Remove dependencies
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// List declared dependencies
    Deps {
        #[arg(long)]
        json: bool,
    },

    /// Search the package registry
    Search { query: String },

    /// Show details about a package
    Info { name: String },
}

#[derive(Args, Clone, Default)]
struct CiArgs {
    /// Only build this toolchain (runs even if inactive)
    #[arg(short, long)]
    toolchain: Option<String>,

    /// Rebuild or re-pull toolchain images
    #[arg(long)]
    rebuild: bool,

    /// Run the tests after building
    #[arg(long)]
    test: bool,

    /// Run the benchmarks after building
    #[arg(long)]
    bench: bool,

    /// Run the main executable after building
    #[arg(long)]
    run: bool,

    /// Write a JSON run summary to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

/// Exit status for configuration problems.
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Ensure the cursor is visible again if a progress bar was drawing.
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = execute!(io::stderr(), cursor::Show);
        original_hook(info);
    }));
    process::install_interrupt_handler();

    let once = RunOnce::new();
    match dispatch(cli, &once) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(report_error(&err)),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("CXCI_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .try_init()
        .ok();
}

/// Print the error and pick the exit status.
fn report_error(err: &anyhow::Error) -> u8 {
    let interrupted = process::interrupted()
        || err
            .chain()
            .any(|cause| cause.downcast_ref::<ProcessError>().is_some_and(ProcessError::is_interrupted));
    if interrupted {
        eprintln!("interrupted");
        return EXIT_INTERRUPTED;
    }

    let config = err.downcast_ref::<ConfigError>().or_else(|| {
        match err.downcast_ref::<OrchestrateError>() {
            Some(OrchestrateError::Config(config)) => Some(config),
            _ => None,
        }
    });
    if let Some(config) = config {
        eprintln!("configuration error: {config}");
        if let Some(source) = std::error::Error::source(config) {
            eprintln!("  caused by: {source}");
        }
        if let Some(hint) = config.hint() {
            eprintln!("  hint: {hint}");
        }
        return EXIT_CONFIG;
    }

    eprintln!("✗ {err}");
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    if let Some(hint) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ResolveError>())
        .and_then(ResolveError::hint)
    {
        eprintln!("  hint: {hint}");
    }
    if let Some(ProcessError::Failed { output, .. }) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProcessError>())
        && !output.trim().is_empty()
    {
        eprintln!("{}", output.trim_end());
    }
    1
}

struct Project {
    root: PathBuf,
    settings: UserSettings,
}

impl Project {
    fn locate(dir: Option<PathBuf>) -> Result<Self> {
        let start = match dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to read the current directory")?,
        };
        let root = cxci::config::find_project_root(&start).unwrap_or(start);
        let settings = UserSettings::load().context("failed to load user settings")?;
        Ok(Self { root, settings })
    }

    fn backend(&self) -> Result<Box<dyn Backend>> {
        backend::detect(&self.root, &self.settings)
    }

    fn config(&self) -> Result<ToolchainConfig, ConfigError> {
        ToolchainConfig::load(&self.root)
    }
}

fn dispatch(cli: Cli, once: &RunOnce) -> Result<()> {
    let project = Project::locate(cli.dir)?;
    let verbose = cli.verbose;

    match cli.command {
        Commands::Ci(args) => run_ci(&project, args, verbose, once),
        Commands::Build {
            toolchain: Some(toolchain),
            rebuild,
            ..
        } => {
            let args = CiArgs {
                toolchain: Some(toolchain),
                rebuild,
                ..CiArgs::default()
            };
            run_ci(&project, args, verbose, once)
        }
        Commands::Build {
            variant, target, ..
        } => {
            let dirs = project.backend()?.build(&BuildOptions {
                variant: variant.variant(),
                jobs: variant.jobs,
                target,
                clean: variant.clean,
                verbose,
            })?;
            println!("✓ Built into {}", dirs.output.display());
            Ok(())
        }
        Commands::Test { variant, filter } => project.backend()?.test(&TestOptions {
            variant: variant.variant(),
            filter,
            jobs: variant.jobs,
            clean: variant.clean,
            verbose,
        }),
        Commands::Run {
            variant,
            target,
            args,
        } => project.backend()?.run(&RunOptions {
            build: BuildOptions {
                variant: variant.variant(),
                jobs: variant.jobs,
                target,
                clean: variant.clean,
                verbose,
            },
            args,
        }),
        Commands::Bench {
            target,
            jobs,
            clean,
            args,
        } => project.backend()?.bench(&BenchOptions {
            target,
            jobs,
            args,
            clean,
            verbose,
        }),
        Commands::Clean { all } => {
            project.backend()?.clean(&CleanOptions { all })?;
            println!("✓ Cleaned");
            Ok(())
        }
        Commands::Targets { json } => {
            let targets = project.backend()?.list_targets()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&targets)?);
            } else if targets.is_empty() {
                tracing::warn!("no targets found; build the project first");
            } else {
                for target in targets {
                    println!("{:<40} {}", target.name, target.kind);
                }
            }
            Ok(())
        }
        Commands::Toolchains => list_toolchains(&project),
        Commands::Add { packages } => {
            let backend = project.backend()?;
            for package in &packages {
                let (name, version) = split_package(package);
                backend
                    .add_dependency(name, version)
                    .with_context(|| format!("failed to add {name}"))?;
                println!("✓ Added {package}");
            }
            Ok(())
        }
        Commands::Remove { packages } => {
            let report = deps::remove_dependencies(project.backend()?.as_ref(), &packages);
            if !report.is_success() {
                bail!(
                    "{} of {} dependencies could not be removed",
                    report.failed.len(),
                    packages.len()
                );
            }
            Ok(())
        }
        Commands::Deps { json } => {
            let deps = project.backend()?.list_dependencies()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&deps)?);
            } else if deps.is_empty() {
                println!("No dependencies declared.");
            } else {
                for dep in deps {
                    println!("{:<30} {}", dep.name, dep.version.as_deref().unwrap_or("*"));
                }
            }
            Ok(())
        }
        Commands::Search { query } => {
            let results = project.backend()?.search_dependencies(&query)?;
            if results.is_empty() {
                println!("No packages match '{query}'.");
            }
            for dep in results {
                println!(
                    "{:<30} {:<12} {}",
                    dep.name,
                    dep.version.as_deref().unwrap_or(""),
                    dep.description.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Info { name } => {
            let dep = project.backend()?.dependency_info(&name)?;
            println!("{}", dep.name);
            if let Some(version) = &dep.version {
                println!("  version: {version}");
            }
            if let Some(description) = &dep.description {
                println!("  {description}");
            }
            Ok(())
        }
    }
}

/// `fmt@10.2.1` → (`fmt`, `Some("10.2.1")`).
fn split_package(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('@') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        Some((name, _)) => (name, None),
        None => (spec, None),
    }
}

fn run_ci(project: &Project, args: CiArgs, verbose: bool, once: &RunOnce) -> Result<()> {
    let config = project.config()?;
    let backend = project.backend()?;
    let request = RunRequest {
        toolchain: args.toolchain,
        rebuild: args.rebuild,
        stages: Stages {
            test: args.test,
            bench: args.bench,
            run: args.run,
            verbose,
        },
    };

    let mut executor = DefaultExecutor::new(backend.as_ref(), &config.output, &config.image_namespace);
    let summary = match pipeline::run(&config, &request, once, &mut executor)? {
        RunOutcome::AlreadyRan => return Ok(()),
        RunOutcome::Completed(summary) => summary,
    };

    for toolchain in &summary.toolchains {
        println!(
            "✓ {:<24} {:<40} {:.1}s",
            toolchain.name, toolchain.target, toolchain.duration_secs
        );
    }
    if let Some(path) = args.report {
        write_report(&path, &summary)?;
    }
    Ok(())
}

fn write_report(path: &Path, summary: &pipeline::RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn list_toolchains(project: &Project) -> Result<()> {
    let config = project.config()?;
    for toolchain in config.resolve_toolchains()? {
        let runner = match &toolchain.runner {
            RunnerSpec::Native => "native".to_string(),
            RunnerSpec::Docker(docker) => format!(
                "docker {} {}",
                docker.mode.as_str(),
                docker.image.as_deref().unwrap_or("<built>")
            ),
            RunnerSpec::Ssh(target) => format!("ssh {}", target.destination()),
        };
        let state = if toolchain.active { "" } else { " (inactive)" };
        println!("{:<24} {runner}{state}", toolchain.name);
    }
    Ok(())
}
