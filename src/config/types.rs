use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildType {
    #[default]
    Release,
    Debug,
    RelWithDebInfo,
    MinSizeRel,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Release => "Release",
            BuildType::Debug => "Debug",
            BuildType::RelWithDebInfo => "RelWithDebInfo",
            BuildType::MinSizeRel => "MinSizeRel",
        }
    }

    /// Meson's spelling of the same build type.
    pub fn meson_name(&self) -> &'static str {
        match self {
            BuildType::Release => "release",
            BuildType::Debug => "debug",
            BuildType::RelWithDebInfo => "debugoptimized",
            BuildType::MinSizeRel => "minsize",
        }
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, BuildType::Debug)
    }
}

/// Explicit compiler optimization level (`-O0` .. `-Ofast`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum OptLevel {
    O0,
    O1,
    #[default]
    O2,
    O3,
    Os,
    Ofast,
}

impl OptLevel {
    pub const ALL: [OptLevel; 6] = [
        OptLevel::O0,
        OptLevel::O1,
        OptLevel::O2,
        OptLevel::O3,
        OptLevel::Os,
        OptLevel::Ofast,
    ];

    /// Suffix after `-O`: `0`, `1`, `2`, `3`, `s`, `fast`.
    pub fn suffix(&self) -> &'static str {
        match self {
            OptLevel::O0 => "0",
            OptLevel::O1 => "1",
            OptLevel::O2 => "2",
            OptLevel::O3 => "3",
            OptLevel::Os => "s",
            OptLevel::Ofast => "fast",
        }
    }

    pub fn flag(&self) -> String {
        format!("-O{}", self.suffix())
    }

    /// CMake build type implied by this level.
    pub fn build_type(&self) -> BuildType {
        match self {
            OptLevel::O0 => BuildType::Debug,
            OptLevel::O1 => BuildType::RelWithDebInfo,
            OptLevel::O2 | OptLevel::O3 | OptLevel::Ofast => BuildType::Release,
            OptLevel::Os => BuildType::MinSizeRel,
        }
    }

    /// Value for Meson's `--optimization` option.
    pub fn meson_value(&self) -> &'static str {
        match self {
            OptLevel::Ofast => "3",
            other => other.suffix(),
        }
    }
}

impl FromStr for OptLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("-O").or_else(|| s.strip_prefix('O')).unwrap_or(s);
        match s {
            "0" => Ok(OptLevel::O0),
            "1" => Ok(OptLevel::O1),
            "2" => Ok(OptLevel::O2),
            "3" => Ok(OptLevel::O3),
            "s" => Ok(OptLevel::Os),
            "fast" => Ok(OptLevel::Ofast),
            other => Err(format!(
                "invalid optimization level '{other}' (expected 0, 1, 2, 3, s or fast)"
            )),
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl Serialize for OptLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.suffix())
    }
}

impl<'de> Deserialize<'de> for OptLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OptVisitor;

        impl<'de> Visitor<'de> for OptVisitor {
            type Value = OptLevel;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an optimization level: 0, 1, 2, 3, s or fast")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<OptLevel, E> {
                value.to_string().parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<OptLevel, E> {
                value.to_string().parse().map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<OptLevel, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(OptVisitor)
    }
}

/// Runtime sanitizer. A build carries at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sanitizer {
    Asan,
    Tsan,
    Msan,
    Ubsan,
}

impl Sanitizer {
    pub const ALL: [Sanitizer; 4] = [
        Sanitizer::Asan,
        Sanitizer::Tsan,
        Sanitizer::Msan,
        Sanitizer::Ubsan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sanitizer::Asan => "asan",
            Sanitizer::Tsan => "tsan",
            Sanitizer::Msan => "msan",
            Sanitizer::Ubsan => "ubsan",
        }
    }

    /// Name understood by `-fsanitize=` and Meson's `b_sanitize`.
    pub fn runtime_name(&self) -> &'static str {
        match self {
            Sanitizer::Asan => "address",
            Sanitizer::Tsan => "thread",
            Sanitizer::Msan => "memory",
            Sanitizer::Ubsan => "undefined",
        }
    }

    pub fn compile_flags(&self) -> Vec<String> {
        let mut flags = vec![format!("-fsanitize={}", self.runtime_name())];
        if matches!(self, Sanitizer::Asan | Sanitizer::Msan) {
            flags.push("-fno-omit-frame-pointer".to_string());
        }
        flags
    }

    /// ubsan needs no extra link flag with the toolchains we target.
    pub fn link_flags(&self) -> Vec<String> {
        match self {
            Sanitizer::Ubsan => Vec::new(),
            other => vec![format!("-fsanitize={}", other.runtime_name())],
        }
    }
}

impl FromStr for Sanitizer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asan" | "address" => Ok(Sanitizer::Asan),
            "tsan" | "thread" => Ok(Sanitizer::Tsan),
            "msan" | "memory" => Ok(Sanitizer::Msan),
            "ubsan" | "undefined" => Ok(Sanitizer::Ubsan),
            other => Err(format!(
                "unknown sanitizer '{other}' (expected asan, tsan, msan or ubsan)"
            )),
        }
    }
}

impl fmt::Display for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jobs {
    #[default]
    Auto,
    Fixed(usize),
}

impl Jobs {
    pub fn resolve(self) -> usize {
        match self {
            Jobs::Fixed(n) => n,
            Jobs::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl Serialize for Jobs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Jobs::Auto => serializer.serialize_str("auto"),
            Jobs::Fixed(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Jobs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct JobsVisitor;

        impl<'de> Visitor<'de> for JobsVisitor {
            type Value = Jobs;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"auto\" or a positive integer")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Jobs, E> {
                if value == 0 {
                    return Err(E::custom("jobs must be a positive integer"));
                }
                Ok(Jobs::Fixed(value as usize))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Jobs, E> {
                if value <= 0 {
                    return Err(E::custom("jobs must be a positive integer"));
                }
                Ok(Jobs::Fixed(value as usize))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Jobs, E> {
                if value.eq_ignore_ascii_case("auto") {
                    Ok(Jobs::Auto)
                } else {
                    Err(E::custom("jobs must be \"auto\" or a positive integer"))
                }
            }
        }

        deserializer.deserialize_any(JobsVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Native,
    Docker,
    Ssh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerMode {
    #[default]
    Pull,
    Local,
    Build,
}

impl DockerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DockerMode::Pull => "pull",
            DockerMode::Local => "local",
            DockerMode::Build => "build",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

/// Inputs for `docker` build mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageBuild {
    pub dockerfile: Option<String>,
    pub context: Option<String>,
    pub args: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub mode: DockerMode,
    pub image: Option<String>,
    pub platform: Option<String>,
    pub pull_policy: PullPolicy,
    pub build: ImageBuild,
    /// Probe the resolved image for the backend's build tools.
    pub verify_tools: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOverrides {
    pub cc: Option<String>,
    pub cxx: Option<String>,
    pub toolchain_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: RunnerKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub docker: Option<DockerConfig>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub remote_dir: Option<String>,
    #[serde(flatten)]
    pub compilers: CompilerOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    pub name: String,
    pub runner: Option<String>,
    pub active: Option<bool>,
    pub build_type: Option<BuildType>,
    pub optimization: Option<OptLevel>,
    pub jobs: Option<Jobs>,
    pub cmake_args: Vec<String>,
    pub build_args: Vec<String>,
    pub meson_args: Vec<String>,
    pub bazel_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub docker: Option<DockerConfig>,
}

impl Toolchain {
    pub fn is_active(&self) -> bool {
        self.active.unwrap_or(true)
    }
}

/// Project-wide defaults that toolchains inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildDefaults {
    pub build_type: Option<BuildType>,
    pub optimization: Option<OptLevel>,
    pub jobs: Option<Jobs>,
    pub cmake_args: Vec<String>,
    pub build_args: Vec<String>,
    pub meson_args: Vec<String>,
    pub bazel_args: Vec<String>,
}

/// Contents of `cxci.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub output: String,
    pub image_namespace: String,
    pub build: BuildDefaults,
    pub runners: Vec<Runner>,
    pub toolchains: Vec<Toolchain>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            output: ".bin/ci".to_string(),
            image_namespace: "cxci".to_string(),
            build: BuildDefaults::default(),
            runners: Vec::new(),
            toolchains: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_level_accepts_numbers_and_names() {
        let levels: Vec<OptLevel> =
            serde_yaml::from_str("[0, 3, \"s\", fast, \"-O2\", O1]").unwrap();
        assert_eq!(
            levels,
            vec![
                OptLevel::O0,
                OptLevel::O3,
                OptLevel::Os,
                OptLevel::Ofast,
                OptLevel::O2,
                OptLevel::O1
            ]
        );
    }

    #[test]
    fn opt_level_rejects_unknown_values() {
        assert!(serde_yaml::from_str::<OptLevel>("4").is_err());
        assert!("g".parse::<OptLevel>().is_err());
    }

    #[test]
    fn opt_level_maps_to_build_type() {
        assert_eq!(OptLevel::O0.build_type(), BuildType::Debug);
        assert_eq!(OptLevel::O1.build_type(), BuildType::RelWithDebInfo);
        assert_eq!(OptLevel::Os.build_type(), BuildType::MinSizeRel);
        assert_eq!(OptLevel::Ofast.build_type(), BuildType::Release);
        assert_eq!(OptLevel::Ofast.flag(), "-Ofast");
    }

    #[test]
    fn sanitizer_flags() {
        assert_eq!(
            Sanitizer::Asan.compile_flags(),
            vec!["-fsanitize=address", "-fno-omit-frame-pointer"]
        );
        assert_eq!(Sanitizer::Tsan.link_flags(), vec!["-fsanitize=thread"]);
        assert!(Sanitizer::Ubsan.link_flags().is_empty());
        assert_eq!("address".parse::<Sanitizer>(), Ok(Sanitizer::Asan));
    }

    #[test]
    fn pull_policy_uses_camel_case() {
        let policy: PullPolicy = serde_yaml::from_str("ifNotPresent").unwrap();
        assert_eq!(policy, PullPolicy::IfNotPresent);
        assert!(serde_yaml::from_str::<PullPolicy>("sometimes").is_err());
    }

    #[test]
    fn jobs_rejects_zero() {
        assert!(serde_yaml::from_str::<Jobs>("0").is_err());
        assert_eq!(serde_yaml::from_str::<Jobs>("auto").unwrap(), Jobs::Auto);
        assert_eq!(serde_yaml::from_str::<Jobs>("8").unwrap(), Jobs::Fixed(8));
    }

    #[test]
    fn toolchain_is_active_by_default() {
        let tc: Toolchain = serde_yaml::from_str("name: linux").unwrap();
        assert!(tc.is_active());
        let tc: Toolchain = serde_yaml::from_str("name: linux\nactive: false").unwrap();
        assert!(!tc.is_active());
    }

    #[test]
    fn runner_reads_compiler_overrides_inline() {
        let yaml = "name: clang\ntype: docker\nimage: silkeh/clang:17\ncc: clang\ncxx: clang++\n";
        let runner: Runner = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(runner.kind, RunnerKind::Docker);
        assert_eq!(runner.compilers.cc.as_deref(), Some("clang"));
        assert_eq!(runner.compilers.cxx.as_deref(), Some("clang++"));
    }
}
