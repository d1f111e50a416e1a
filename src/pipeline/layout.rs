use std::io;
use std::path::{Path, PathBuf};

use crate::backend::Mount;
use crate::backend::variant::CI_CACHE;

/// Host directories used by CI runs of one project.
#[derive(Debug, Clone)]
pub struct CiLayout {
    root: PathBuf,
    output: PathBuf,
}

/// Per-toolchain directories. `output` is where collected artifacts land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainDirs {
    pub build: PathBuf,
    pub deps: PathBuf,
    pub output: PathBuf,
}

impl CiLayout {
    /// `output` is relative to `root` unless absolute.
    pub fn new(root: &Path, output: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            output: root.join(output),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn toolchain(&self, name: &str) -> ToolchainDirs {
        let cache = self.root.join(CI_CACHE).join(name);
        ToolchainDirs {
            build: cache.join("build"),
            deps: cache.join("deps"),
            output: self.output.join(name),
        }
    }
}

impl ToolchainDirs {
    /// Create every directory a run writes to, including the host side of
    /// extra mounts. Docker would otherwise create them as root.
    pub fn prepare(&self, mounts: &[Mount]) -> io::Result<()> {
        for dir in [&self.build, &self.deps, &self.output] {
            std::fs::create_dir_all(dir)?;
        }
        for mount in mounts {
            std::fs::create_dir_all(&mount.host)?;
        }
        Ok(())
    }
}
