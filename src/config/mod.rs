mod loader;
mod resolved;
mod types;

pub use loader::{CONFIG_FILE, UserSettings, find_project_root};
pub use resolved::{BuildSettings, ResolvedToolchain, RunnerSpec, SshTarget};
pub use types::{
    BuildDefaults, BuildType, CompilerOverrides, DockerConfig, DockerMode, ImageBuild, Jobs,
    OptLevel, PullPolicy, Runner, RunnerKind, Sanitizer, Toolchain, ToolchainConfig,
};
