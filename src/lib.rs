//! Cross-toolchain build orchestration for CMake, Bazel and Meson projects.
//!
//! A project's `cxci.yaml` names build toolchains and the runners they execute
//! on (the host, a container image, or an ssh host). [`pipeline::run`] resolves
//! each toolchain's environment, runs the backend's pipeline there and
//! collects the artifacts under `.bin/ci/<toolchain>`.

pub mod backend;
pub mod config;
pub mod docker;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod resolve;
