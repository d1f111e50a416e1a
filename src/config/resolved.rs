use std::collections::{BTreeMap, HashSet};

use crate::error::ConfigError;

use super::types::{
    BuildType, CompilerOverrides, DockerConfig, DockerMode, Jobs, OptLevel, Runner, RunnerKind,
    Toolchain, ToolchainConfig,
};

/// Connection details for an ssh runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub remote_dir: Option<String>,
}

impl SshTarget {
    /// `user@host`, or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerSpec {
    Native,
    Docker(DockerConfig),
    Ssh(SshTarget),
}

/// Build settings after toolchain values are layered over the project defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSettings {
    pub build_type: BuildType,
    pub optimization: OptLevel,
    pub jobs: Jobs,
    pub cmake_args: Vec<String>,
    pub build_args: Vec<String>,
    pub meson_args: Vec<String>,
    pub bazel_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            build_type: BuildType::Release,
            optimization: OptLevel::default(),
            jobs: Jobs::Auto,
            cmake_args: Vec::new(),
            build_args: Vec::new(),
            meson_args: Vec::new(),
            bazel_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// A validated toolchain with its runner inlined.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedToolchain {
    pub name: String,
    pub active: bool,
    pub runner_name: Option<String>,
    pub runner: RunnerSpec,
    pub compilers: CompilerOverrides,
    pub settings: BuildSettings,
}

impl ResolvedToolchain {
    /// A native toolchain with default settings.
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            runner_name: None,
            runner: RunnerSpec::Native,
            compilers: CompilerOverrides::default(),
            settings: BuildSettings::default(),
        }
    }
}

impl ToolchainConfig {
    /// Check names and references without resolving anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for runner in &self.runners {
            if !seen.insert(runner.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "runner",
                    name: runner.name.clone(),
                });
            }
            if runner.kind == RunnerKind::Ssh
                && runner.host.as_deref().is_none_or(|h| h.trim().is_empty())
            {
                return Err(ConfigError::MissingHost {
                    runner: runner.name.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for toolchain in &self.toolchains {
            if !seen.insert(toolchain.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "toolchain",
                    name: toolchain.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate and flatten every toolchain, active or not.
    pub fn resolve_toolchains(&self) -> Result<Vec<ResolvedToolchain>, ConfigError> {
        self.validate()?;
        self.toolchains
            .iter()
            .map(|toolchain| self.resolve_toolchain(toolchain))
            .collect()
    }

    fn find_runner(&self, name: &str) -> Option<&Runner> {
        self.runners.iter().find(|r| r.name == name)
    }

    fn resolve_toolchain(&self, toolchain: &Toolchain) -> Result<ResolvedToolchain, ConfigError> {
        let runner = match &toolchain.runner {
            Some(name) => Some(self.find_runner(name).ok_or_else(|| {
                ConfigError::UnknownRunner {
                    toolchain: toolchain.name.clone(),
                    runner: name.clone(),
                }
            })?),
            None => None,
        };

        let spec = runner_spec(toolchain, runner)?;
        let compilers = runner.map(|r| r.compilers.clone()).unwrap_or_default();

        Ok(ResolvedToolchain {
            name: toolchain.name.clone(),
            active: toolchain.is_active(),
            runner_name: toolchain.runner.clone(),
            runner: spec,
            compilers,
            settings: self.settings_for(toolchain),
        })
    }

    fn settings_for(&self, toolchain: &Toolchain) -> BuildSettings {
        let defaults = &self.build;
        let pick = |own: &Vec<String>, global: &Vec<String>| {
            if own.is_empty() {
                global.clone()
            } else {
                own.clone()
            }
        };
        BuildSettings {
            build_type: toolchain
                .build_type
                .or(defaults.build_type)
                .unwrap_or_default(),
            optimization: toolchain
                .optimization
                .or(defaults.optimization)
                .unwrap_or_default(),
            jobs: toolchain.jobs.or(defaults.jobs).unwrap_or_default(),
            cmake_args: pick(&toolchain.cmake_args, &defaults.cmake_args),
            build_args: pick(&toolchain.build_args, &defaults.build_args),
            meson_args: pick(&toolchain.meson_args, &defaults.meson_args),
            bazel_args: pick(&toolchain.bazel_args, &defaults.bazel_args),
            env: toolchain.env.clone(),
        }
    }
}

fn runner_spec(toolchain: &Toolchain, runner: Option<&Runner>) -> Result<RunnerSpec, ConfigError> {
    let kind = match runner {
        Some(r) => r.kind,
        None if toolchain.docker.is_some() => RunnerKind::Docker,
        None => RunnerKind::Native,
    };

    match kind {
        RunnerKind::Native => Ok(RunnerSpec::Native),
        RunnerKind::Ssh => {
            let runner = runner.ok_or_else(|| ConfigError::MissingDockerConfig {
                toolchain: toolchain.name.clone(),
            })?;
            let host = runner.host.clone().ok_or_else(|| ConfigError::MissingHost {
                runner: runner.name.clone(),
            })?;
            Ok(RunnerSpec::Ssh(SshTarget {
                host,
                user: runner.user.clone(),
                port: runner.port,
                remote_dir: runner.remote_dir.clone(),
            }))
        }
        RunnerKind::Docker => {
            let docker = docker_config(toolchain, runner)?;
            Ok(RunnerSpec::Docker(docker))
        }
    }
}

/// Toolchain-level docker settings replace the runner's; the runner's `image`
/// fills in a missing image either way.
fn docker_config(toolchain: &Toolchain, runner: Option<&Runner>) -> Result<DockerConfig, ConfigError> {
    let runner_image = runner.and_then(|r| r.image.clone());
    let mut docker = match (&toolchain.docker, runner.and_then(|r| r.docker.as_ref())) {
        (Some(own), _) => own.clone(),
        (None, Some(shared)) => shared.clone(),
        (None, None) if runner_image.is_some() => DockerConfig::default(),
        (None, None) => {
            return Err(ConfigError::MissingDockerConfig {
                toolchain: toolchain.name.clone(),
            });
        }
    };
    if docker.image.is_none() {
        docker.image = runner_image;
    }

    match docker.mode {
        DockerMode::Pull | DockerMode::Local => {
            if docker.image.as_deref().is_none_or(|i| i.trim().is_empty()) {
                return Err(ConfigError::MissingImage {
                    toolchain: toolchain.name.clone(),
                    mode: docker.mode.as_str(),
                });
            }
        }
        DockerMode::Build => {
            if docker.build.dockerfile.is_none() && docker.build.context.is_none() {
                return Err(ConfigError::MissingBuildSource {
                    toolchain: toolchain.name.clone(),
                });
            }
        }
    }
    Ok(docker)
}
