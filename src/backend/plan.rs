use std::path::PathBuf;

use crate::config::ResolvedToolchain;
use crate::error::Phase;

use super::artifacts::ArtifactRules;

/// Where a pipeline plan will execute. Decides tool paths such as the vcpkg root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Host,
    Container,
    Remote,
}

/// Optional pipeline stages requested by the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stages {
    pub test: bool,
    pub bench: bool,
    pub run: bool,
    pub verbose: bool,
}

/// Everything a backend needs to lay out a toolchain pipeline. Paths are as
/// seen from where the plan runs.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub toolchain: &'a ResolvedToolchain,
    pub project_name: &'a str,
    pub source_dir: String,
    pub build_dir: String,
    pub deps_dir: String,
    pub output_dir: String,
    pub stages: Stages,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Exec {
        program: String,
        args: Vec<String>,
    },
    /// Copy artifacts into `dest`.
    Collect { rules: ArtifactRules, dest: String },
    /// Run every executable under `dir` whose name ends with `suffix`.
    RunMatching {
        dir: String,
        suffix: String,
        max_depth: usize,
    },
    /// Run the first executable found in `dir`, trying `preferred` names first.
    RunFirstExecutable { dir: String, preferred: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub phase: Phase,
    pub action: StepAction,
    /// Skip the step when this path already exists (configure markers).
    pub skip_if_exists: Option<String>,
    /// Parse `[ NN%]` progress markers instead of buffering everything.
    pub progress: bool,
}

impl Step {
    pub fn exec<I, S>(phase: Phase, program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phase,
            action: StepAction::Exec {
                program: program.to_string(),
                args: args.into_iter().map(Into::into).collect(),
            },
            skip_if_exists: None,
            progress: false,
        }
    }

    pub fn unless_exists(mut self, marker: impl Into<String>) -> Self {
        self.skip_if_exists = Some(marker.into());
        self
    }

    pub fn with_progress(mut self) -> Self {
        self.progress = true;
        self
    }

    pub fn collect(rules: ArtifactRules, dest: impl Into<String>) -> Self {
        Self {
            phase: Phase::Collect,
            action: StepAction::Collect {
                rules,
                dest: dest.into(),
            },
            skip_if_exists: None,
            progress: false,
        }
    }

    pub fn action(phase: Phase, action: StepAction) -> Self {
        Self {
            phase,
            action,
            skip_if_exists: None,
            progress: false,
        }
    }
}

/// Backend-specific pipeline for one toolchain, independent of where it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelinePlan {
    /// Environment set by the backend; toolchain overrides are applied after.
    pub env: Vec<(String, String)>,
    pub steps: Vec<Step>,
}

impl PipelinePlan {
    /// Backend environment followed by the toolchain's overrides.
    pub fn environment(&self, toolchain: &ResolvedToolchain) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .filter(|(key, _)| !toolchain.settings.env.contains_key(key))
            .cloned()
            .collect();
        env.extend(
            toolchain
                .settings
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }
}

/// A bind mount for containerized runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}
