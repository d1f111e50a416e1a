use std::io;
use std::path::{Path, PathBuf};

use crate::config::{BuildType, OptLevel, Sanitizer};

/// Cache root for developer builds.
pub const NATIVE_CACHE: &str = ".cache/native";
/// Output root for developer builds.
pub const NATIVE_OUTPUT: &str = ".bin/native";
/// Cache root for orchestrated toolchain builds.
pub const CI_CACHE: &str = ".cache/ci";

/// Identity of a build's cache and output directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BuildVariant {
    pub release: bool,
    pub optimization: Option<OptLevel>,
    pub sanitizer: Option<Sanitizer>,
}

impl BuildVariant {
    pub fn debug() -> Self {
        Self::default()
    }

    pub fn release() -> Self {
        Self {
            release: true,
            ..Self::default()
        }
    }

    /// Directory name: `{debug|release}[-O<level>][-<sanitizer>]`.
    ///
    /// Every component comes from a closed set and the three slots never share
    /// spellings, so distinct variants always get distinct names.
    pub fn dir_name(&self) -> String {
        let mut name = String::from(if self.release { "release" } else { "debug" });
        if let Some(level) = self.optimization {
            name.push_str("-O");
            name.push_str(level.suffix());
        }
        if let Some(sanitizer) = self.sanitizer {
            name.push('-');
            name.push_str(sanitizer.as_str());
        }
        name
    }

    /// An explicit level wins; otherwise the release flag decides.
    pub fn build_type(&self) -> BuildType {
        match self.optimization {
            Some(level) => level.build_type(),
            None if self.release => BuildType::Release,
            None => BuildType::Debug,
        }
    }

    pub fn compile_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(level) = self.optimization {
            flags.push(level.flag());
        }
        if let Some(sanitizer) = self.sanitizer {
            flags.extend(sanitizer.compile_flags());
        }
        flags
    }

    pub fn link_flags(&self) -> Vec<String> {
        self.sanitizer.map(|s| s.link_flags()).unwrap_or_default()
    }
}

/// What a variant directory is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Build,
    Test,
    Bench,
}

impl Purpose {
    fn prefix(self) -> &'static str {
        match self {
            Purpose::Build => "",
            Purpose::Test => "test-",
            Purpose::Bench => "bench-",
        }
    }
}

/// Cache (intermediate tree) and output (collected artifacts) directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDirs {
    pub cache: PathBuf,
    pub output: PathBuf,
}

impl VariantDirs {
    pub fn native(root: &Path, variant: &BuildVariant, purpose: Purpose) -> Self {
        let name = format!("{}{}", purpose.prefix(), variant.dir_name());
        Self {
            cache: root.join(NATIVE_CACHE).join(&name),
            output: root.join(NATIVE_OUTPUT).join(&name),
        }
    }

    /// Remove both directories. Missing directories are fine.
    pub fn reset(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.cache)?;
        remove_dir_if_exists(&self.output)
    }

    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.cache)?;
        std::fs::create_dir_all(&self.output)
    }

    /// Whether the cache already holds a configured tree.
    pub fn is_configured(&self, marker: &str) -> bool {
        self.cache.join(marker).exists()
    }
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn all_variants() -> Vec<BuildVariant> {
        let mut variants = Vec::new();
        for release in [false, true] {
            for optimization in std::iter::once(None).chain(OptLevel::ALL.map(Some)) {
                for sanitizer in std::iter::once(None).chain(Sanitizer::ALL.map(Some)) {
                    variants.push(BuildVariant {
                        release,
                        optimization,
                        sanitizer,
                    });
                }
            }
        }
        variants
    }

    #[test]
    fn distinct_variants_get_distinct_names() {
        let variants = all_variants();
        let names: HashSet<String> = variants.iter().map(BuildVariant::dir_name).collect();
        assert_eq!(names.len(), variants.len());
    }

    #[test]
    fn names_are_stable() {
        for variant in all_variants() {
            assert_eq!(variant.dir_name(), variant.dir_name());
        }
        assert_eq!(BuildVariant::debug().dir_name(), "debug");
        assert_eq!(BuildVariant::release().dir_name(), "release");
        let v = BuildVariant {
            release: true,
            optimization: Some(OptLevel::O2),
            sanitizer: Some(Sanitizer::Asan),
        };
        assert_eq!(v.dir_name(), "release-O2-asan");
    }

    #[test]
    fn sanitizer_and_release_builds_do_not_share_dirs() {
        let root = Path::new("/p");
        let release = VariantDirs::native(root, &BuildVariant::release(), Purpose::Build);
        let asan = VariantDirs::native(
            root,
            &BuildVariant {
                release: true,
                sanitizer: Some(Sanitizer::Asan),
                ..BuildVariant::default()
            },
            Purpose::Build,
        );
        assert_ne!(release.cache, asan.cache);
        assert_ne!(release.output, asan.output);
        assert_eq!(release.cache, Path::new("/p/.cache/native/release"));
        assert_eq!(release.output, Path::new("/p/.bin/native/release"));
    }

    #[test]
    fn purposes_are_namespaced() {
        let root = Path::new("/p");
        let v = BuildVariant::debug();
        let build = VariantDirs::native(root, &v, Purpose::Build);
        let test = VariantDirs::native(root, &v, Purpose::Test);
        let bench = VariantDirs::native(root, &v, Purpose::Bench);
        assert_eq!(test.cache, Path::new("/p/.cache/native/test-debug"));
        assert_ne!(build.cache, test.cache);
        assert_ne!(test.cache, bench.cache);
    }

    #[test]
    fn build_type_follows_level_then_release_flag() {
        assert_eq!(BuildVariant::debug().build_type(), BuildType::Debug);
        assert_eq!(BuildVariant::release().build_type(), BuildType::Release);
        let v = BuildVariant {
            release: true,
            optimization: Some(OptLevel::O1),
            sanitizer: None,
        };
        assert_eq!(v.build_type(), BuildType::RelWithDebInfo);
        assert_eq!(v.compile_flags(), vec!["-O1"]);
    }

    #[test]
    fn reset_removes_both_directories() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = VariantDirs::native(dir.path(), &BuildVariant::debug(), Purpose::Build);
        dirs.create().unwrap();
        std::fs::write(dirs.cache.join("CMakeCache.txt"), "").unwrap();
        assert!(dirs.is_configured("CMakeCache.txt"));
        dirs.reset().unwrap();
        assert!(!dirs.cache.exists());
        assert!(!dirs.output.exists());
        // Idempotent.
        dirs.reset().unwrap();
    }
}
