//! Workspace and package manifest parsing.
//!
//! Only the parts of `Cargo.toml` that matter for orchestration are read:
//! workspace membership, `[workspace.dependencies]`, and each package's
//! name and dependency tables (normal, dev, build and target-specific).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::ResolutionError;

/// Dependency tables merged into a package's declared dependencies.
const DEPENDENCY_TABLES: &[&str] = &["dependencies", "dev-dependencies", "build-dependencies"];

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Real package name (after `package = "..."` renames).
    pub package: String,
    /// Version requirement, if any.
    pub version: Option<String>,
    /// Path dependency, relative to the declaring manifest.
    pub path: Option<PathBuf>,
    /// Whether the entry defers to `[workspace.dependencies]`.
    pub workspace: bool,
    /// Explicitly requested features.
    pub features: BTreeSet<String>,
    /// Whether default features are enabled.
    pub default_features: bool,
    /// Whether the dependency is optional.
    pub optional: bool,
}

impl DependencySpec {
    fn named(package: &str) -> Self {
        Self {
            package: package.to_string(),
            version: None,
            path: None,
            workspace: false,
            features: BTreeSet::new(),
            default_features: true,
            optional: false,
        }
    }

    /// Parse a dependency entry keyed by `key`.
    pub fn parse(key: &str, value: &Value) -> Result<Self, String> {
        match value {
            Value::String(version) => {
                let mut spec = Self::named(key);
                spec.version = Some(version.clone());
                Ok(spec)
            }
            Value::Table(table) => {
                let package = match table.get("package") {
                    Some(Value::String(name)) => name.as_str(),
                    Some(_) => return Err(format!("dependency '{}': package must be a string", key)),
                    None => key,
                };
                let mut spec = Self::named(package);
                spec.version = table
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                spec.path = table.get("path").and_then(Value::as_str).map(PathBuf::from);
                spec.workspace = table
                    .get("workspace")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                spec.optional = table
                    .get("optional")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                spec.default_features = table
                    .get("default-features")
                    .or_else(|| table.get("default_features"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if let Some(features) = table.get("features") {
                    let list = features
                        .as_array()
                        .ok_or_else(|| format!("dependency '{}': features must be an array", key))?;
                    for feature in list {
                        let name = feature.as_str().ok_or_else(|| {
                            format!("dependency '{}': feature names must be strings", key)
                        })?;
                        spec.features.insert(name.to_string());
                    }
                }
                Ok(spec)
            }
            _ => Err(format!(
                "dependency '{}' must be a version string or a table",
                key
            )),
        }
    }

    /// Merge another declaration of the same dependency (e.g. from
    /// `[dependencies]` and `[dev-dependencies]`).
    pub(crate) fn merge(&mut self, other: &DependencySpec) {
        self.features.extend(other.features.iter().cloned());
        self.default_features |= other.default_features;
        self.optional &= other.optional;
        self.workspace |= other.workspace;
        if self.version.is_none() {
            self.version = other.version.clone();
        }
        if self.path.is_none() {
            self.path = other.path.clone();
        }
    }
}

/// Root workspace manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct RootManifest {
    /// Member patterns, as written (may contain wildcards).
    pub members: Vec<String>,
    /// Excluded member paths.
    pub exclude: Vec<String>,
    /// `[workspace.dependencies]` keyed by dependency key.
    pub dependencies: BTreeMap<String, DependencySpec>,
    /// Parsed document, kept for canonical hashing.
    document: Value,
}

impl RootManifest {
    /// Parse root manifest content.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ResolutionError> {
        let invalid = |reason: String| ResolutionError::InvalidManifest {
            path: path.to_path_buf(),
            reason,
        };

        let document: Value = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        let workspace = document
            .get("workspace")
            .and_then(Value::as_table)
            .ok_or_else(|| invalid("missing [workspace] table".to_string()))?;

        let members = string_array(workspace.get("members")).map_err(|e| invalid(e))?;
        let exclude = string_array(workspace.get("exclude")).map_err(|e| invalid(e))?;

        let mut dependencies = BTreeMap::new();
        if let Some(table) = workspace.get("dependencies").and_then(Value::as_table) {
            for (key, value) in table {
                let spec = DependencySpec::parse(key, value).map_err(|e| invalid(e))?;
                dependencies.insert(key.clone(), spec);
            }
        }

        Ok(RootManifest {
            members,
            exclude,
            dependencies,
            document,
        })
    }

    /// Canonical byte form (keys sorted, formatting and comments dropped).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.document).unwrap_or_default()
    }
}

/// A member package manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageManifest {
    /// Package name.
    pub name: String,
    /// Declared dependencies keyed by dependency key, merged across tables.
    pub dependencies: BTreeMap<String, DependencySpec>,
    /// `[features]` table. Entries like `"serde/rc"` turn on dependency
    /// features, so they take part in the dependency fingerprint.
    pub features: BTreeMap<String, Vec<String>>,
}

impl PackageManifest {
    /// Parse package manifest content.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ResolutionError> {
        let invalid = |reason: String| ResolutionError::InvalidManifest {
            path: path.to_path_buf(),
            reason,
        };

        let document: Value = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        let name = document
            .get("package")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing package.name".to_string()))?
            .to_string();

        let mut dependencies: BTreeMap<String, DependencySpec> = BTreeMap::new();
        let mut tables: Vec<&toml::map::Map<String, Value>> = Vec::new();
        for table in DEPENDENCY_TABLES {
            if let Some(t) = document.get(*table).and_then(Value::as_table) {
                tables.push(t);
            }
        }
        if let Some(targets) = document.get("target").and_then(Value::as_table) {
            for target in targets.values() {
                for table in DEPENDENCY_TABLES {
                    if let Some(t) = target.get(*table).and_then(Value::as_table) {
                        tables.push(t);
                    }
                }
            }
        }

        for table in tables {
            for (key, value) in table {
                let spec = DependencySpec::parse(key, value).map_err(|e| invalid(e))?;
                dependencies
                    .entry(key.clone())
                    .and_modify(|existing| existing.merge(&spec))
                    .or_insert(spec);
            }
        }

        let mut features = BTreeMap::new();
        if let Some(table) = document.get("features").and_then(Value::as_table) {
            for (feature, enables) in table {
                let enables = string_array(Some(enables))
                    .map_err(|e| invalid(format!("feature '{}': {}", feature, e)))?;
                features.insert(feature.clone(), enables);
            }
        }

        Ok(PackageManifest {
            name,
            dependencies,
            features,
        })
    }

    /// Resolve `workspace = true` entries against the root manifest.
    ///
    /// Features requested by the member are added to the workspace entry's
    /// features; default features follow the workspace entry.
    pub fn resolve_workspace_dependencies(
        &self,
        root: &RootManifest,
    ) -> Result<BTreeMap<String, DependencySpec>, ResolutionError> {
        let mut resolved = BTreeMap::new();
        for (key, spec) in &self.dependencies {
            if !spec.workspace {
                resolved.insert(key.clone(), spec.clone());
                continue;
            }
            let base = root.dependencies.get(key).ok_or_else(|| {
                ResolutionError::UndeclaredWorkspaceDependency {
                    package: self.name.clone(),
                    dependency: key.clone(),
                }
            })?;
            let mut merged = base.clone();
            merged.features.extend(spec.features.iter().cloned());
            merged.optional = spec.optional;
            merged.workspace = true;
            resolved.insert(key.clone(), merged);
        }
        Ok(resolved)
    }
}

fn string_array(value: Option<&Value>) -> Result<Vec<String>, String> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| "expected an array of strings".to_string())
            })
            .collect(),
        Some(_) => Err("expected an array of strings".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = r#"
[workspace]
resolver = "2"
members = ["crates/*"]
exclude = ["crates/scratch"]

[workspace.dependencies]
serde = { version = "1.0", features = ["derive"] }
crossbeam = "0.8"
eframe = { version = "0.29", default-features = false }
"#;

    const MEMBER: &str = r#"
[package]
name = "library"
version = "0.1.0"

[dependencies]
serde = { workspace = true, features = ["rc"] }
crossbeam.workspace = true
nats = "0.25"
img = { package = "image", version = "0.25", features = ["png"] }

[dev-dependencies]
nats = { version = "0.25", features = ["tls"] }

[target.'cfg(unix)'.dependencies]
libc = "0.2"

[features]
default = []
shared-rc = ["serde/rc"]
"#;

    fn root() -> RootManifest {
        RootManifest::parse(ROOT, Path::new("Cargo.toml")).unwrap()
    }

    #[test]
    fn test_parse_root() {
        let root = root();
        assert_eq!(root.members, vec!["crates/*"]);
        assert_eq!(root.exclude, vec!["crates/scratch"]);
        assert_eq!(root.dependencies.len(), 3);
        assert!(!root.dependencies["eframe"].default_features);
    }

    #[test]
    fn test_root_requires_workspace_table() {
        let err = RootManifest::parse("[package]\nname = \"x\"", Path::new("Cargo.toml"))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidManifest { .. }));
    }

    #[test]
    fn test_parse_member_merges_tables() {
        let pkg = PackageManifest::parse(MEMBER, Path::new("crates/library/Cargo.toml")).unwrap();
        assert_eq!(pkg.name, "library");
        assert_eq!(pkg.dependencies.len(), 5);
        assert!(pkg.dependencies["nats"].features.contains("tls"));
        assert_eq!(pkg.dependencies["img"].package, "image");
        assert!(pkg.dependencies.contains_key("libc"));
        assert_eq!(pkg.features["shared-rc"], vec!["serde/rc"]);
        assert!(pkg.features["default"].is_empty());
    }

    #[test]
    fn test_resolve_workspace_dependencies() {
        let pkg = PackageManifest::parse(MEMBER, Path::new("crates/library/Cargo.toml")).unwrap();
        let resolved = pkg.resolve_workspace_dependencies(&root()).unwrap();
        let serde = &resolved["serde"];
        assert_eq!(serde.version.as_deref(), Some("1.0"));
        assert!(serde.features.contains("derive"));
        assert!(serde.features.contains("rc"));
    }

    #[test]
    fn test_undeclared_workspace_dependency() {
        let member = "[package]\nname = \"p\"\n[dependencies]\njack.workspace = true\n";
        let pkg = PackageManifest::parse(member, Path::new("Cargo.toml")).unwrap();
        let err = pkg.resolve_workspace_dependencies(&root()).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::UndeclaredWorkspaceDependency { .. }
        ));
    }

    #[test]
    fn test_canonical_bytes_ignore_comments() {
        let commented = format!("# shared deps\n{}", ROOT);
        let a = root();
        let b = RootManifest::parse(&commented, Path::new("Cargo.toml")).unwrap();
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_invalid_features_rejected() {
        let member = "[package]\nname = \"p\"\n[dependencies]\nx = { version = \"1\", features = \"a\" }\n";
        assert!(PackageManifest::parse(member, Path::new("Cargo.toml")).is_err());
    }
}
