use std::path::Path;

use super::BackendKind;

/// Detect the build system from marker files in `root`.
///
/// Bazel and Meson markers win over CMake because such projects often keep a
/// `CMakeLists.txt` around for IDEs.
pub fn detect_kind(root: &Path) -> Option<BackendKind> {
    if root.join("MODULE.bazel").is_file() {
        Some(BackendKind::Bazel)
    } else if root.join("meson.build").is_file() {
        Some(BackendKind::Meson)
    } else if root.join("vcpkg.json").is_file() || root.join("CMakeLists.txt").is_file() {
        Some(BackendKind::CMake)
    } else {
        None
    }
}

/// Project name as declared in the build files, falling back to the directory name.
pub fn project_name(root: &Path, kind: BackendKind) -> String {
    let declared = match kind {
        BackendKind::CMake => read(root, "CMakeLists.txt").and_then(|s| cmake_project_name(&s)),
        BackendKind::Meson => read(root, "meson.build").and_then(|s| meson_project_name(&s)),
        BackendKind::Bazel => read(root, "MODULE.bazel").and_then(|s| bazel_module_name(&s)),
    };
    declared
        .or_else(|| {
            root.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "app".to_string())
}

fn read(root: &Path, file: &str) -> Option<String> {
    std::fs::read_to_string(root.join(file)).ok()
}

/// Argument list of the first `<func>(` call, skipping `#` comment lines.
fn call_args<'a>(source: &'a str, func: &str) -> Option<&'a str> {
    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') {
            let lower = line.to_ascii_lowercase();
            if let Some(pos) = find_call(&lower, func) {
                let start = offset + pos;
                let open = source[start..].find('(')? + start + 1;
                let close = source[open..].find(')')? + open;
                return Some(&source[open..close]);
            }
        }
        offset += line.len();
    }
    None
}

fn find_call(line: &str, func: &str) -> Option<usize> {
    let mut search = 0;
    while let Some(found) = line[search..].find(func) {
        let pos = search + found;
        let before_ok = pos == 0
            || !line[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        let after = line[pos + func.len()..].trim_start();
        if before_ok && after.starts_with('(') {
            return Some(pos);
        }
        search = pos + func.len();
    }
    None
}

/// `project(name ...)` in CMakeLists.txt.
pub fn cmake_project_name(source: &str) -> Option<String> {
    let args = call_args(source, "project")?;
    let name = args.split_whitespace().next()?;
    let name = name.trim_matches('"');
    (!name.is_empty()).then(|| name.to_string())
}

/// `project('name', ...)` in meson.build.
pub fn meson_project_name(source: &str) -> Option<String> {
    let args = call_args(source, "project")?;
    first_quoted(args)
}

/// `module(name = "name", ...)` in MODULE.bazel.
pub fn bazel_module_name(source: &str) -> Option<String> {
    let args = call_args(source, "module")?;
    keyword_string(args, "name")
}

pub(crate) fn first_quoted(text: &str) -> Option<String> {
    let start = text.find(['\'', '"'])?;
    let quote = text[start..].chars().next()?;
    let rest = &text[start + 1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string())
}

/// Value of `key = "value"` inside a Starlark argument list.
pub(crate) fn keyword_string(args: &str, key: &str) -> Option<String> {
    args.split(',').find_map(|part| {
        let (k, v) = part.split_once('=')?;
        if k.trim() == key {
            first_quoted(v)
        } else {
            None
        }
    })
}
