//! Lock artifact parsing and canonical hashing.
//!
//! The lock artifact (`Cargo.lock`) pins the exact version and checksum of
//! every transitive dependency. It is parsed and re-serialized before
//! hashing so whitespace or comment edits do not produce a new cache key.

use crate::error::ResolutionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// A pinned package entry in the lock artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockedPackage {
    /// Package name.
    pub name: String,
    /// Exact version.
    pub version: String,
    /// Source (registry or git URL); `None` for workspace members and path deps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Content checksum for registry sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Dependency references (`name` or `name version`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl LockedPackage {
    /// Whether this entry comes from a registry or git source.
    pub fn is_external(&self) -> bool {
        self.source.is_some()
    }
}

/// Raw on-disk layout.
#[derive(Debug, Deserialize)]
struct RawLock {
    version: Option<u32>,
    #[serde(default, rename = "package")]
    packages: Vec<LockedPackage>,
}

/// Parsed lock artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockArtifact {
    /// Lock format version.
    pub version: Option<u32>,
    /// Entries sorted by (name, version, source).
    pub packages: Vec<LockedPackage>,
}

impl LockArtifact {
    /// Parse lock content.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ResolutionError> {
        let raw: RawLock = toml::from_str(content).map_err(|e| ResolutionError::InvalidLock {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut packages = raw.packages;
        for pkg in &mut packages {
            pkg.dependencies.sort();
        }
        packages.sort();

        debug!(entries = packages.len(), "Parsed lock artifact");
        Ok(LockArtifact {
            version: raw.version,
            packages,
        })
    }

    /// Read and parse the lock at `path`; a missing file is a resolution error.
    pub fn load(path: &Path) -> Result<Self, ResolutionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResolutionError::MissingLock(path.to_path_buf())
            } else {
                ResolutionError::InvalidLock {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })?;
        Self::parse(&content, path)
    }

    /// Whether any entry is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.name == name)
    }

    /// All entries named `name` (several versions may be pinned).
    pub fn entries_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a LockedPackage> {
        self.packages.iter().filter(move |p| p.name == name)
    }

    /// Entries from registry or git sources.
    pub fn external_packages(&self) -> impl Iterator<Item = &LockedPackage> {
        self.packages.iter().filter(|p| p.is_external())
    }

    /// Distinct entry names.
    pub fn names(&self) -> BTreeSet<&str> {
        self.packages.iter().map(|p| p.name.as_str()).collect()
    }

    /// Canonical byte form used for hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Serializing owned strings and vectors cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const LOCK: &str = r#"
# This file is automatically @generated by Cargo.
version = 3

[[package]]
name = "serde"
version = "1.0.197"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "3fb1c873e1b9b056a4dc4c0c198b24c3ffa059243875552b2bd0933b1aee4ce2"

[[package]]
name = "alpha"
version = "0.1.0"
dependencies = [
 "serde",
 "common",
]

[[package]]
name = "common"
version = "0.1.0"
"#;

    fn path() -> PathBuf {
        PathBuf::from("Cargo.lock")
    }

    #[test]
    fn test_parse_lock_sorted() {
        let lock = LockArtifact::parse(LOCK, &path()).unwrap();
        assert_eq!(lock.version, Some(3));
        let names: Vec<_> = lock.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "common", "serde"]);
        assert_eq!(lock.packages[0].dependencies, vec!["common", "serde"]);
    }

    #[test]
    fn test_contains_and_external() {
        let lock = LockArtifact::parse(LOCK, &path()).unwrap();
        assert!(lock.contains("serde"));
        assert!(!lock.contains("tokio"));
        let external: Vec<_> = lock.external_packages().map(|p| &p.name).collect();
        assert_eq!(external, vec!["serde"]);
    }

    #[test]
    fn test_canonical_ignores_formatting() {
        let reformatted = LOCK.replace("# This file is automatically @generated by Cargo.\n", "")
            .replace(" \"serde\",\n \"common\",\n", " \"common\",\n \"serde\",\n");
        let a = LockArtifact::parse(LOCK, &path()).unwrap();
        let b = LockArtifact::parse(&reformatted, &path()).unwrap();
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_canonical_changes_with_pin() {
        let bumped = LOCK.replace("1.0.197", "1.0.198");
        let a = LockArtifact::parse(LOCK, &path()).unwrap();
        let b = LockArtifact::parse(&bumped, &path()).unwrap();
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_missing_lock_is_resolution_error() {
        let err = LockArtifact::load(Path::new("/definitely/missing/Cargo.lock")).unwrap_err();
        assert!(matches!(err, ResolutionError::MissingLock(_)));
    }

    #[test]
    fn test_invalid_lock() {
        let err = LockArtifact::parse("[[package]]\nname = 1", &path()).unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidLock { .. }));
    }
}
