//! Error taxonomy shared by the resolver, the execution adapters and the
//! orchestrator.
//!
//! Configuration errors are raised before any subprocess runs. Resolution and
//! step errors are wrapped in [`ToolchainFailure`] so the final message names
//! the toolchain and the phase that failed.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Pipeline phase a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Resolve,
    Configure,
    Build,
    Collect,
    Test,
    Bench,
    Run,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Resolve => "resolve",
            Phase::Configure => "configure",
            Phase::Build => "build",
            Phase::Collect => "collect",
            Phase::Test => "test",
            Phase::Bench => "bench",
            Phase::Run => "run",
        }
    }

    /// Exit status a generated pipeline script uses when this phase fails.
    pub fn exit_code(self) -> i32 {
        match self {
            Phase::Prepare => 70,
            Phase::Resolve => 70,
            Phase::Configure => 71,
            Phase::Build => 72,
            Phase::Collect => 73,
            Phase::Test => 74,
            Phase::Bench => 75,
            Phase::Run => 76,
        }
    }

    /// Inverse of [`Phase::exit_code`] for the codes a script can emit.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            70 => Some(Phase::Prepare),
            71 => Some(Phase::Configure),
            72 => Some(Phase::Build),
            73 => Some(Phase::Collect),
            74 => Some(Phase::Test),
            75 => Some(Phase::Bench),
            76 => Some(Phase::Run),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Problems with `cxci.yaml` found before anything is executed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration found at {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate {kind} name '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("toolchain '{toolchain}' references unknown runner '{runner}'")]
    UnknownRunner { toolchain: String, runner: String },

    #[error("toolchain '{0}' not found")]
    UnknownToolchain(String),

    #[error("no active toolchains defined")]
    NoActiveToolchains,

    #[error("toolchain '{toolchain}' runs on a docker runner without docker configuration")]
    MissingDockerConfig { toolchain: String },

    #[error("toolchain '{toolchain}' uses docker {mode} mode without an image")]
    MissingImage {
        toolchain: String,
        mode: &'static str,
    },

    #[error("toolchain '{toolchain}' uses docker build mode without a dockerfile or context")]
    MissingBuildSource { toolchain: String },

    #[error("runner '{runner}' is an ssh runner without a host")]
    MissingHost { runner: String },
}

impl ConfigError {
    /// A corrective hint shown under the error message.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ConfigError::NotFound { .. } => {
                Some("create cxci.yaml at the project root with `runners` and `toolchains`")
            }
            ConfigError::Read { .. } => None,
            ConfigError::Parse { .. } => Some("check the YAML syntax and field names"),
            ConfigError::Duplicate { .. } => Some("runner and toolchain names must be unique"),
            ConfigError::UnknownRunner { .. } => Some(
                "define the runner under `runners`, or drop the `runner` field to build natively",
            ),
            ConfigError::UnknownToolchain(_) => {
                Some("run `cxci toolchains` to list the configured toolchains")
            }
            ConfigError::NoActiveToolchains => {
                Some("set `active: true` on a toolchain or select one with --toolchain")
            }
            ConfigError::MissingDockerConfig { .. } => {
                Some("set `image` on the runner or add a `docker` block to the toolchain")
            }
            ConfigError::MissingImage { .. } => Some("set `docker.image` or the runner's `image`"),
            ConfigError::MissingBuildSource { .. } => {
                Some("set `docker.build.dockerfile` or `docker.build.context`")
            }
            ConfigError::MissingHost { .. } => Some("set `host` on the ssh runner"),
        }
    }
}

/// Failure of a supervised subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` {}", describe_exit(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` was interrupted")]
    Interrupted { command: String },
}

impl ProcessError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Failed { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProcessError::Interrupted { .. })
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

/// Environment resolution failures. Fatal to the current toolchain.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("image {image} is not present locally and the pull policy is 'never'")]
    NeverPolicyAbsent { image: String },

    #[error("local image {image} not found")]
    LocalImageMissing { image: String },

    #[error("failed to pull image {image}")]
    Pull {
        image: String,
        #[source]
        source: ProcessError,
    },

    #[error("dockerfile not found: {}", .path.display())]
    DockerfileMissing { path: PathBuf },

    #[error("failed to read dockerfile {}", .path.display())]
    DockerfileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build image {image}")]
    Build {
        image: String,
        #[source]
        source: ProcessError,
    },
}

impl ResolveError {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ResolveError::NeverPolicyAbsent { .. } => {
                Some("pull the image manually or change `pull_policy`")
            }
            ResolveError::LocalImageMissing { .. } => {
                Some("use 'docker pull' or 'docker build' to create it first")
            }
            ResolveError::DockerfileMissing { .. } => {
                Some("paths in `docker.build` are relative to the project root")
            }
            _ => None,
        }
    }
}

/// A failed pipeline step, tagged with its phase.
#[derive(Debug, Error)]
#[error("{phase} step failed")]
pub struct StepError {
    pub phase: Phase,
    #[source]
    pub source: anyhow::Error,
}

impl StepError {
    pub fn new(phase: Phase, source: impl Into<anyhow::Error>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }
}

/// The first failure of an orchestrated run, annotated with where it happened.
#[derive(Debug, Error)]
#[error("toolchain '{toolchain}' failed during {phase}")]
pub struct ToolchainFailure {
    pub toolchain: String,
    pub phase: Phase,
    #[source]
    pub source: anyhow::Error,
}

impl ToolchainFailure {
    pub fn from_step(toolchain: &str, err: StepError) -> Self {
        Self {
            toolchain: toolchain.to_string(),
            phase: err.phase,
            source: err.source,
        }
    }

    pub fn from_resolve(toolchain: &str, err: ResolveError) -> Self {
        Self {
            toolchain: toolchain.to_string(),
            phase: Phase::Resolve,
            source: err.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainFailure),
}
