//! `depot.toml` configuration with environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DepotError, Result};
use crate::workspace::WorkspaceConfig;
use depot_env::EnvironmentConfig;

/// Configuration file name, looked up at the workspace root.
pub const CONFIG_FILE: &str = "depot.toml";

/// Store location override.
pub const ENV_STORE: &str = "DEPOT_STORE";
/// Test shard count override.
pub const ENV_TEST_SHARDS: &str = "DEPOT_TEST_SHARDS";
/// Advisory snapshot directory override.
pub const ENV_ADVISORY_DB: &str = "DEPOT_ADVISORY_DB";
/// License snapshot file override.
pub const ENV_LICENSE_SNAPSHOT: &str = "DEPOT_LICENSE_SNAPSHOT";

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store root; relative paths are resolved against the workspace root.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".depot/store"),
        }
    }
}

/// `[checks]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    /// Number of test shards.
    pub test_shards: u32,
    /// Per-command timeout in seconds.
    pub timeout_secs: u64,
    /// Advisory snapshot directory (RustSec layout).
    pub advisory_db: PathBuf,
    /// License snapshot file (TOML, `name` or `name@version` to SPDX).
    pub license_snapshot: PathBuf,
    /// SPDX identifiers accepted by the license policy.
    pub allowed_licenses: Vec<String>,
    /// Advisory ids that never fail the security audit.
    pub ignore_advisories: Vec<String>,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            test_shards: 1,
            timeout_secs: 1800,
            advisory_db: PathBuf::from(".depot/advisory-db"),
            license_snapshot: PathBuf::from("licenses.toml"),
            allowed_licenses: [
                "MIT",
                "Apache-2.0",
                "Apache-2.0 WITH LLVM-exception",
                "BSD-2-Clause",
                "BSD-3-Clause",
                "ISC",
                "Unicode-DFS-2016",
                "Unicode-3.0",
                "Zlib",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ignore_advisories: Vec::new(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    pub workspace: WorkspaceConfig,
    pub store: StoreConfig,
    pub checks: ChecksConfig,
    pub environment: EnvironmentConfig,
}

impl DepotConfig {
    /// Parse configuration content.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DepotError::Config(e.to_string()))
    }

    /// Load `depot.toml` from `root` if present (defaults otherwise), then
    /// apply environment overrides.
    pub fn discover(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            debug!(path = %path.display(), "Loading configuration");
            Self::parse(&std::fs::read_to_string(&path)?)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(store) = lookup(ENV_STORE) {
            self.store.root = PathBuf::from(store);
        }
        if let Some(shards) = lookup(ENV_TEST_SHARDS) {
            self.checks.test_shards = shards.trim().parse().map_err(|_| {
                DepotError::Config(format!(
                    "{} must be a positive integer, got '{}'",
                    ENV_TEST_SHARDS, shards
                ))
            })?;
        }
        if let Some(db) = lookup(ENV_ADVISORY_DB) {
            self.checks.advisory_db = PathBuf::from(db);
        }
        if let Some(snapshot) = lookup(ENV_LICENSE_SNAPSHOT) {
            self.checks.license_snapshot = PathBuf::from(snapshot);
        }
        self.validate()
    }

    /// Reject values no run could use.
    pub fn validate(&self) -> Result<()> {
        if self.checks.test_shards == 0 {
            return Err(DepotError::Config(
                "checks.test_shards must be at least 1".to_string(),
            ));
        }
        if self.checks.timeout_secs == 0 {
            return Err(DepotError::Config(
                "checks.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Store root resolved against `workspace_root`.
    pub fn store_root(&self, workspace_root: &Path) -> PathBuf {
        resolve(workspace_root, &self.store.root)
    }

    /// Advisory snapshot directory resolved against `workspace_root`.
    pub fn advisory_db(&self, workspace_root: &Path) -> PathBuf {
        resolve(workspace_root, &self.checks.advisory_db)
    }

    /// License snapshot file resolved against `workspace_root`.
    pub fn license_snapshot(&self, workspace_root: &Path) -> PathBuf {
        resolve(workspace_root, &self.checks.license_snapshot)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DepotConfig::default();
        assert_eq!(config.store.root, PathBuf::from(".depot/store"));
        assert_eq!(config.checks.test_shards, 1);
        assert_eq!(
            config.workspace.aggregation,
            Some(PathBuf::from("crates/workspace-hack"))
        );
        assert!(config.checks.allowed_licenses.contains(&"MIT".to_string()));
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = DepotConfig::parse(
            r#"
[checks]
test_shards = 4
ignore_advisories = ["RUSTSEC-2020-0071"]

[environment]
native_libraries = ["jack", "asound"]
"#,
        )
        .unwrap();
        assert_eq!(config.checks.test_shards, 4);
        assert_eq!(config.checks.timeout_secs, 1800);
        assert_eq!(config.environment.native_libraries, vec!["jack", "asound"]);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let err = DepotConfig::parse("[checks]\ntest_shards = \"many\"").unwrap_err();
        assert!(matches!(err, DepotError::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_STORE, "/var/cache/depot"),
            (ENV_TEST_SHARDS, "3"),
            (ENV_ADVISORY_DB, "/srv/advisory-db"),
        ]
        .into_iter()
        .collect();
        let mut config = DepotConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(
            config.store_root(Path::new("/ws")),
            PathBuf::from("/var/cache/depot")
        );
        assert_eq!(config.checks.test_shards, 3);
        assert_eq!(
            config.advisory_db(Path::new("/ws")),
            PathBuf::from("/srv/advisory-db")
        );
        assert_eq!(
            config.license_snapshot(Path::new("/ws")),
            PathBuf::from("/ws/licenses.toml")
        );
    }

    #[test]
    fn test_zero_shards_rejected() {
        let mut config = DepotConfig::default();
        let err = config
            .apply_overrides(|k| (k == ENV_TEST_SHARDS).then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, DepotError::Config(_)));
    }

    #[test]
    fn test_discover_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[store]\nroot = \"cache\"\n",
        )
        .unwrap();
        let config = DepotConfig::discover(dir.path()).unwrap();
        // DEPOT_STORE may be set by the host; only assert when it is not.
        if std::env::var(ENV_STORE).is_err() {
            assert_eq!(config.store_root(dir.path()), dir.path().join("cache"));
        }
    }
}
