use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::process;

/// File suffixes that are build-system bookkeeping, never artifacts.
pub const EXCLUDED_SUFFIXES: &[&str] = &[
    ".o", ".obj", ".cmake", ".ninja", ".make", ".txt", ".json", ".d", ".log", ".rsp",
];

/// Directories inside a build tree that never hold final artifacts.
const SKIPPED_DIRS: &[&str] = &[
    "CMakeFiles",
    "_deps",
    "_objs",
    "vcpkg_installed",
    "Testing",
    "meson-private",
    "meson-info",
    "meson-logs",
];

/// Where and how deep to look for artifacts after a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRules {
    pub roots: Vec<String>,
    pub max_depth: usize,
    pub follow_links: bool,
    /// Keep `*_test`/`*_tests` binaries.
    pub include_tests: bool,
}

impl ArtifactRules {
    pub fn new(root: impl Into<String>, max_depth: usize) -> Self {
        Self {
            roots: vec![root.into()],
            max_depth,
            follow_links: false,
            include_tests: false,
        }
    }
}

/// Name-level filter shared by the host scan and the generated `find` command.
pub fn is_candidate_name(name: &str, include_tests: bool) -> bool {
    if name.starts_with("CMake") || name.starts_with('.') {
        return false;
    }
    if EXCLUDED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        return false;
    }
    if !include_tests && is_test_name(name) {
        return false;
    }
    true
}

fn is_test_name(name: &str) -> bool {
    name.ends_with("_test") || name.ends_with("_tests")
}

/// `lib*.a`, `lib*.so[.N...]`, `lib*.dylib`.
pub fn is_library_name(name: &str) -> bool {
    name.starts_with("lib")
        && (name.ends_with(".a") || name.ends_with(".dylib") || name.contains(".so"))
}

fn is_library_file(name: &str) -> bool {
    is_library_name(name)
        || name.ends_with(".so")
        || name.ends_with(".dll")
        || name.ends_with(".lib")
}

fn skip_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| {
                name.starts_with('.') || name.ends_with(".runfiles") || SKIPPED_DIRS.contains(&name)
            })
}

/// Files under `rules.roots` that look like artifacts. Relative roots are
/// resolved against `base`. Results are sorted by path.
///
/// Artifacts land in one flat directory, so only one file per name is kept:
/// the shallowest, then the first by path. Dropped duplicates are logged.
pub fn scan(rules: &ArtifactRules, base: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    for root in &rules.roots {
        let root = base.join(root);
        if !root.is_dir() {
            debug!(root = %root.display(), "artifact root does not exist");
            continue;
        }
        let walker = WalkDir::new(&root)
            .max_depth(rules.max_depth)
            .follow_links(rules.follow_links)
            .into_iter()
            .filter_entry(|e| !skip_dir(e));

        for entry in walker.filter_map(Result::ok) {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !is_candidate_name(name, rules.include_tests) {
                continue;
            }
            if !std::fs::metadata(path).is_ok_and(|m| m.is_file()) {
                continue;
            }
            if is_library_name(name) || process::is_executable(path) {
                found.push(path.to_path_buf());
            }
        }
    }
    found.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });
    let mut names = HashSet::new();
    found.retain(|path| {
        let keep = names.insert(path.file_name().map(|n| n.to_os_string()));
        if !keep {
            warn!(path = %path.display(), "skipping artifact with a duplicate name");
        }
        keep
    });
    found.sort();
    found
}

/// Copy every artifact into `dest`. Finding nothing is not an error.
pub fn collect(rules: &ArtifactRules, base: &Path, dest: &Path) -> io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;
    let mut copied = Vec::new();
    for src in scan(rules, base) {
        let Some(name) = src.file_name() else {
            continue;
        };
        let target = dest.join(name);
        copy_and_sign(&src, &target)?;
        copied.push(target);
    }
    if copied.is_empty() {
        warn!(dest = %dest.display(), "no artifacts found");
    }
    Ok(copied)
}

/// Copy `src` over `dest` and ad-hoc sign executables on macOS.
///
/// The destination is removed first so a running binary is never truncated in
/// place. Signing is best-effort.
pub fn copy_and_sign(src: &Path, dest: &Path) -> io::Result<()> {
    match std::fs::remove_file(dest) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
        _ => {}
    }
    std::fs::copy(src, dest)?;

    if cfg!(target_os = "macos") && process::is_executable(dest) {
        let cmd = process::ToolCommand::new("codesign")
            .args(["-s", "-", "--force"])
            .arg(dest.display().to_string());
        if let Err(err) = process::run_captured(&cmd) {
            debug!(path = %dest.display(), error = %err, "codesign failed");
        }
    }
    Ok(())
}

/// Executables directly inside `dir`, excluding libraries and test binaries.
pub fn find_executables(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| is_candidate_name(name, false) && !is_library_file(name))
                && process::is_executable(path)
        })
        .collect();
    found.sort();
    found
}

/// Pick the executable to run from `dir`: the requested target, then the
/// first preferred name that exists, then the first executable found.
pub fn select_executable(dir: &Path, target: Option<&str>, preferred: &[&str]) -> Result<PathBuf> {
    if let Some(target) = target {
        let path = dir.join(target);
        if process::is_executable(&path) {
            return Ok(path);
        }
        bail!("target '{target}' not found in {}", dir.display());
    }
    for name in preferred {
        let path = dir.join(name);
        if process::is_executable(&path) {
            return Ok(path);
        }
    }
    let candidates = find_executables(dir);
    match candidates.as_slice() {
        [] => bail!("no executables found in {}", dir.display()),
        [only] => Ok(only.clone()),
        [first, ..] => {
            warn!(
                count = candidates.len(),
                selected = %first.display(),
                "several executables found; pass a target to choose"
            );
            Ok(first.clone())
        }
    }
}

/// Shell `find` invocation that copies the same set of files into `dest`.
pub fn find_command(rules: &ArtifactRules, dest: &str) -> String {
    let mut parts: Vec<String> = vec!["find".into()];
    if rules.follow_links {
        parts.push("-L".into());
    }
    parts.extend(rules.roots.iter().map(|r| shell_words::quote(r).into_owned()));
    parts.push("-maxdepth".into());
    parts.push(rules.max_depth.to_string());
    for dir in SKIPPED_DIRS {
        parts.push(format!("-name {} -prune -o", shell_words::quote(dir)));
    }
    parts.push("-name '*.runfiles' -prune -o".into());
    parts.push("-type f".into());
    parts.push(
        "\\( -perm /111 -o -name 'lib*.a' -o -name 'lib*.so*' -o -name 'lib*.dylib' \\)".into(),
    );
    parts.push("! -name 'CMake*'".into());
    for suffix in EXCLUDED_SUFFIXES {
        parts.push(format!("! -name {}", shell_words::quote(&format!("*{suffix}"))));
    }
    if !rules.include_tests {
        parts.push("! -name '*_test' ! -name '*_tests'".into());
    }
    parts.push(format!("-exec cp -f {{}} {}/ \\;", shell_words::quote(dest)));
    parts.join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn touch(path: &Path, mode: u32) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"bin").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn name_filter() {
        assert!(is_candidate_name("app", false));
        assert!(is_candidate_name("libcore.a", false));
        assert!(!is_candidate_name("main.cpp.o", false));
        assert!(!is_candidate_name("build.ninja", false));
        assert!(!is_candidate_name("CMakeCache.txt", false));
        assert!(!is_candidate_name("compile_commands.json", false));
        assert!(!is_candidate_name("app_tests", false));
        assert!(is_candidate_name("app_tests", true));
    }

    #[test]
    fn library_names() {
        assert!(is_library_name("libfoo.a"));
        assert!(is_library_name("libfoo.so.1.2"));
        assert!(is_library_name("libfoo.dylib"));
        assert!(!is_library_name("foo.a"));
    }

    #[test]
    fn scan_keeps_executables_and_libraries_only() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        touch(&build.join("app"), 0o755);
        touch(&build.join("libcore.a"), 0o644);
        touch(&build.join("notes.md"), 0o644);
        touch(&build.join("rules.ninja"), 0o755);
        touch(&build.join("CMakeFiles/app.dir/main.o"), 0o644);
        touch(&build.join("CMakeFiles/feature_tests.bin"), 0o755);
        touch(&build.join("bench/app_bench"), 0o755);
        touch(&build.join("deep/er/tool"), 0o755);

        let rules = ArtifactRules::new("build", 2);
        let names: Vec<String> = scan(&rules, dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["app", "app_bench", "libcore.a"]);
    }

    #[test]
    fn duplicate_names_keep_the_shallowest_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("build/b/app"), 0o755);
        touch(&dir.path().join("build/a/app"), 0o755);
        touch(&dir.path().join("build/tools/x/app"), 0o755);
        touch(&dir.path().join("build/a/lib/libcore.a"), 0o644);
        touch(&dir.path().join("build/libcore.a"), 0o644);

        let found = scan(&ArtifactRules::new("build", 3), dir.path());
        let relative: Vec<PathBuf> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            relative,
            vec![PathBuf::from("build/a/app"), PathBuf::from("build/libcore.a")]
        );
    }

    #[test]
    fn collect_copies_into_destination() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("build/app"), 0o755);
        let dest = dir.path().join("out");
        let copied = collect(&ArtifactRules::new("build", 1), dir.path(), &dest).unwrap();
        assert_eq!(copied, vec![dest.join("app")]);
        assert!(process::is_executable(&dest.join("app")));
        // Re-collecting replaces the previous copy.
        collect(&ArtifactRules::new("build", 1), dir.path(), &dest).unwrap();
    }

    #[test]
    fn collect_with_no_matches_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let copied = collect(&ArtifactRules::new("missing", 1), dir.path(), &dir.path().join("out"))
            .unwrap();
        assert!(copied.is_empty());
    }

    #[test]
    fn select_prefers_target_then_names() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("alpha"), 0o755);
        touch(&dir.path().join("demo"), 0o755);
        touch(&dir.path().join("libdemo.so"), 0o755);

        let chosen = select_executable(dir.path(), None, &["demo"]).unwrap();
        assert_eq!(chosen, dir.path().join("demo"));
        let chosen = select_executable(dir.path(), None, &["missing"]).unwrap();
        assert_eq!(chosen, dir.path().join("alpha"));
        assert!(select_executable(dir.path(), Some("nope"), &[]).is_err());
    }

    #[test]
    fn find_command_quotes_paths() {
        let rules = ArtifactRules::new("/tmp/build dir", 2);
        let cmd = find_command(&rules, "/output");
        assert!(cmd.starts_with("find '/tmp/build dir' -maxdepth 2"));
        assert!(cmd.contains("! -name '*_test'"));
        assert!(cmd.ends_with("-exec cp -f {} /output/ \\;"));
    }
}
