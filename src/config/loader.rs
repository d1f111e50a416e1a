use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

use super::types::ToolchainConfig;

pub const CONFIG_FILE: &str = "cxci.yaml";

/// Files that mark the root of a buildable project.
const ROOT_MARKERS: [&str; 4] = [CONFIG_FILE, "CMakeLists.txt", "MODULE.bazel", "meson.build"];

impl ToolchainConfig {
    /// Load `cxci.yaml` from the given project root.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Err(ConfigError::NotFound { path });
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }
}

/// Walk up from `start` to the first directory containing a project marker.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| ROOT_MARKERS.iter().any(|marker| dir.join(marker).is_file()))
        .map(Path::to_path_buf)
}

/// Per-user settings from `~/.config/cxci/config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub vcpkg_root: Option<PathBuf>,
    /// Local checkout of the Bazel Central Registry.
    pub bcr_root: Option<PathBuf>,
}

impl UserSettings {
    /// Load the settings file (missing is fine) and apply env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut settings = match settings_path() {
            Some(path) if path.is_file() => {
                let contents = std::fs::read_to_string(&path)?;
                serde_yaml::from_str(&contents)?
            }
            _ => UserSettings::default(),
        };
        settings.apply_env(|key| std::env::var_os(key));
        Ok(settings)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<std::ffi::OsString>) {
        if let Some(root) = lookup("VCPKG_ROOT").filter(|v| !v.is_empty()) {
            self.vcpkg_root = Some(PathBuf::from(root));
        }
        if let Some(root) = lookup("CXCI_BCR_ROOT").filter(|v| !v.is_empty()) {
            self.bcr_root = Some(PathBuf::from(root));
        }
    }
}

fn settings_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(std::env::var_os("HOME")?).join(".config"),
    };
    Some(base.join("cxci").join("config.yaml"))
}
