use std::time::Duration;

use crate::backend::BackendKind;
use crate::docker::ContainerRuntime;

/// Per-probe time limit.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

const C_COMPILERS: &[&str] = &["cc", "gcc", "clang"];
const CXX_COMPILERS: &[&str] = &["c++", "g++", "clang++"];
const CMAKE: &[&str] = &["cmake"];
const MAKE_TOOLS: &[&str] = &["ninja", "make"];
const BAZEL: &[&str] = &["bazel", "bazelisk"];
const MESON: &[&str] = &["meson"];
const NINJA: &[&str] = &["ninja"];

/// Tools a backend needs, each satisfied by any one of its alternatives.
pub fn required_tools(kind: BackendKind) -> Vec<&'static [&'static str]> {
    match kind {
        BackendKind::CMake => vec![CMAKE, MAKE_TOOLS, C_COMPILERS, CXX_COMPILERS],
        BackendKind::Bazel => vec![BAZEL, C_COMPILERS],
        BackendKind::Meson => vec![MESON, NINJA, C_COMPILERS, CXX_COMPILERS],
    }
}

/// Probe `image` for each required tool, one bounded probe at a time.
///
/// Returns the unmet requirements as `a|b` strings.
pub fn missing_tools<R>(runtime: &R, image: &str, kind: BackendKind, timeout: Duration) -> Vec<String>
where
    R: ContainerRuntime + ?Sized,
{
    required_tools(kind)
        .into_iter()
        .filter(|alternatives| {
            !alternatives
                .iter()
                .any(|tool| runtime.has_command(image, tool, timeout))
        })
        .map(|alternatives| alternatives.join("|"))
        .collect()
}
