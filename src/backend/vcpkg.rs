// vcpkg manifest editing and CLI output parsing.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use super::Dependency;

pub const MANIFEST: &str = "vcpkg.json";

/// Keys vcpkg uses for a port's version, in lookup order.
const VERSION_KEYS: [&str; 4] = ["version-semver", "version", "version-date", "version-string"];

fn dependency_name(entry: &Value) -> Option<&str> {
    match entry {
        Value::String(name) => Some(name),
        Value::Object(map) => map.get("name").and_then(Value::as_str),
        _ => None,
    }
}

fn version_of(object: &serde_json::Map<String, Value>) -> Option<String> {
    VERSION_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn description_of(object: &serde_json::Map<String, Value>) -> Option<String> {
    match object.get("description")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(lines) => Some(
            lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

fn read_manifest(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Dependencies declared in `vcpkg.json`. Entries may be strings or objects.
pub fn list_manifest(path: &Path) -> Result<Vec<Dependency>> {
    let manifest = read_manifest(path)?;
    let Some(deps) = manifest.get("dependencies").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    Ok(deps
        .iter()
        .filter_map(|entry| {
            let name = dependency_name(entry)?;
            let version = entry
                .get("version>=")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(Dependency {
                name: name.to_string(),
                version,
                description: None,
            })
        })
        .collect())
}

/// Drop `name` from the manifest's `dependencies` array, keeping key order
/// and the remaining entries untouched.
pub fn remove_from_manifest(path: &Path, name: &str) -> Result<()> {
    let mut manifest = read_manifest(path)?;
    let Some(deps) = manifest
        .get_mut("dependencies")
        .and_then(Value::as_array_mut)
    else {
        bail!("{} has no dependencies", path.display());
    };

    let before = deps.len();
    deps.retain(|entry| dependency_name(entry) != Some(name));
    if deps.len() == before {
        bail!("dependency '{name}' is not listed in {}", path.display());
    }

    let mut text = serde_json::to_string_pretty(&manifest)?;
    text.push('\n');
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Pin `name` to `version>=` in the manifest. A plain string entry becomes an
/// object entry.
pub fn set_minimum_version(path: &Path, name: &str, version: &str) -> Result<()> {
    let mut manifest = read_manifest(path)?;
    let Some(entry) = manifest
        .get_mut("dependencies")
        .and_then(Value::as_array_mut)
        .and_then(|deps| deps.iter_mut().find(|e| dependency_name(e) == Some(name)))
    else {
        bail!("dependency '{name}' is not listed in {}", path.display());
    };

    if !entry.is_object() {
        *entry = serde_json::json!({ "name": name });
    }
    if let Some(object) = entry.as_object_mut() {
        object.insert("version>=".to_string(), Value::String(version.to_string()));
    }

    let mut text = serde_json::to_string_pretty(&manifest)?;
    text.push('\n');
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Parse `vcpkg search` output: `name  version  description...` per line.
pub fn parse_search(output: &str) -> Vec<Dependency> {
    output
        .lines()
        .filter(|line| {
            let line = line.trim();
            !line.is_empty()
                && !line.starts_with("The result may be outdated")
                && !line.starts_with("If your port")
        })
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let version = fields.next()?;
            let description = fields.collect::<Vec<_>>().join(" ");
            Some(Dependency {
                name: name.to_string(),
                version: Some(version.to_string()),
                description: (!description.is_empty()).then_some(description),
            })
        })
        .collect()
}

/// Parse `vcpkg x-package-info <name> --x-json`. vcpkg may print log lines
/// before the JSON document.
pub fn parse_package_info(output: &str, name: &str) -> Result<Dependency> {
    let start = output
        .find('{')
        .context("vcpkg returned no package information")?;
    let doc: Value =
        serde_json::from_str(&output[start..]).context("failed to parse vcpkg package info")?;
    let Some(info) = doc
        .get("results")
        .and_then(|r| r.get(name))
        .and_then(Value::as_object)
    else {
        bail!("package '{name}' not found");
    };
    Ok(Dependency {
        name: name.to_string(),
        version: version_of(info),
        description: description_of(info),
    })
}
