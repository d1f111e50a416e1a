//! CI runs: toolchain selection, directory layout and the three ways a
//! toolchain's pipeline can execute.

pub mod container;
mod executor;
pub mod layout;
pub mod native;
pub mod orchestrator;
pub mod remote;
pub mod script;
mod types;

pub use executor::DefaultExecutor;
pub use layout::{CiLayout, ToolchainDirs};
pub use orchestrator::{RunOnce, Selection, ToolchainExecutor, run, select_toolchains};
pub use types::{RunOutcome, RunRequest, RunSummary, ToolchainReport};
