//! Workspace descriptor: packages, shared files, manifest and lock.
//!
//! A [`Workspace`] is loaded once per run and is immutable afterwards.
//! Packages are ordered by name so every derived hash is stable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ResolutionError, Result};
use crate::lockfile::LockArtifact;
use crate::manifest::{DependencySpec, PackageManifest, RootManifest};

/// Root manifest file name.
pub const MANIFEST_FILE: &str = "Cargo.toml";

/// Lock artifact file name.
pub const LOCK_FILE: &str = "Cargo.lock";

/// Workspace layout configuration (`[workspace]` in `depot.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Shared common-code package roots included in every source set.
    pub shared: Vec<PathBuf>,
    /// Root of the aggregation (dependency dedup) package.
    pub aggregation: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            shared: vec![PathBuf::from("crates/common")],
            aggregation: Some(PathBuf::from("crates/workspace-hack")),
        }
    }
}

/// One independently buildable unit of the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Package name.
    pub name: String,
    /// Root directory relative to the workspace root.
    pub root: PathBuf,
    /// Declared dependencies with workspace inheritance resolved.
    pub dependencies: BTreeMap<String, DependencySpec>,
    /// `[features]` table of the member manifest.
    #[serde(default)]
    pub features: BTreeMap<String, Vec<String>>,
}

impl Package {
    /// Real names of every declared dependency.
    pub fn dependency_names(&self) -> BTreeSet<&str> {
        self.dependencies
            .values()
            .map(|d| d.package.as_str())
            .collect()
    }
}

/// Loaded workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    manifest: RootManifest,
    lock: LockArtifact,
    packages: Vec<Package>,
    shared: Vec<PathBuf>,
    aggregation: Option<PathBuf>,
}

/// Loads [`Workspace`]s from disk.
pub struct WorkspaceDescriptor;

impl WorkspaceDescriptor {
    /// Load the workspace rooted at `root`.
    ///
    /// Reads the root manifest, expands member patterns, parses each member
    /// manifest and the lock artifact. A missing lock is a resolution error.
    pub fn load(root: &Path, config: &WorkspaceConfig) -> Result<Workspace> {
        let root = root.to_path_buf();
        info!(root = %root.display(), "Loading workspace");

        let manifest_path = root.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            ResolutionError::InvalidManifest {
                path: manifest_path.clone(),
                reason: e.to_string(),
            }
        })?;
        let manifest = RootManifest::parse(&content, &manifest_path)?;
        let lock = LockArtifact::load(&root.join(LOCK_FILE))?;

        let member_dirs = expand_members(&root, &manifest)?;
        let mut packages: Vec<Package> = Vec::with_capacity(member_dirs.len());
        for dir in member_dirs {
            let path = root.join(&dir).join(MANIFEST_FILE);
            let content = std::fs::read_to_string(&path).map_err(|e| {
                ResolutionError::InvalidManifest {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;
            let parsed = PackageManifest::parse(&content, &path)?;
            let dependencies = parsed.resolve_workspace_dependencies(&manifest)?;

            if packages.iter().any(|p| p.name == parsed.name) {
                return Err(ResolutionError::DuplicatePackage { name: parsed.name }.into());
            }
            debug!(package = %parsed.name, root = %dir.display(), "Found member");
            packages.push(Package {
                name: parsed.name,
                root: dir,
                dependencies,
                features: parsed.features,
            });
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));

        let mut shared = Vec::new();
        for path in config.shared.iter().chain(config.aggregation.iter()) {
            if root.join(path).is_dir() {
                if !shared.contains(path) {
                    shared.push(path.clone());
                }
            } else {
                warn!(path = %path.display(), "Configured shared path does not exist, skipping");
            }
        }
        shared.sort();

        let aggregation = config
            .aggregation
            .clone()
            .filter(|p| root.join(p).join(MANIFEST_FILE).is_file());

        info!(
            packages = packages.len(),
            shared = shared.len(),
            lock_entries = lock.packages.len(),
            "Workspace loaded"
        );

        Ok(Workspace {
            root,
            manifest,
            lock,
            packages,
            shared,
            aggregation,
        })
    }
}

impl Workspace {
    /// Absolute workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root manifest.
    pub fn manifest(&self) -> &RootManifest {
        &self.manifest
    }

    /// Lock artifact.
    pub fn lock(&self) -> &LockArtifact {
        &self.lock
    }

    /// All member packages, ordered by name.
    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    /// Look up a member by name.
    pub fn package(&self, name: &str) -> std::result::Result<&Package, ResolutionError> {
        self.packages
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ResolutionError::UnknownPackage {
                package: name.to_string(),
            })
    }

    /// Shared common-code package roots (relative), sorted.
    pub fn shared_paths(&self) -> &[PathBuf] {
        &self.shared
    }

    /// Files always shared by every source set: manifest and lock.
    pub fn shared_files(&self) -> [PathBuf; 2] {
        [PathBuf::from(MANIFEST_FILE), PathBuf::from(LOCK_FILE)]
    }

    /// Aggregation package root, when it exists.
    pub fn aggregation_root(&self) -> Option<&Path> {
        self.aggregation.as_deref()
    }

    /// Whether `package` lives under a shared path.
    pub fn is_shared(&self, package: &Package) -> bool {
        self.shared.iter().any(|s| package.root.starts_with(s))
    }

    /// Packages that produce their own artifact (shared packages excluded).
    pub fn buildable(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter().filter(move |p| !self.is_shared(p))
    }

    /// External dependencies of every member, keyed by real package name.
    ///
    /// Declarations of the same package are merged (features unioned).
    /// A package required under two different version requirements keeps
    /// one entry per requirement, the later ones keyed `name@requirement`.
    pub fn bundle_dependencies(&self) -> BTreeMap<String, DependencySpec> {
        let mut union: BTreeMap<String, DependencySpec> = BTreeMap::new();
        for spec in self
            .packages
            .iter()
            .flat_map(|p| p.dependencies.values())
            .filter(|d| d.path.is_none())
        {
            let key = match union.get(&spec.package) {
                Some(existing) if existing.version != spec.version => format!(
                    "{}@{}",
                    spec.package,
                    spec.version.as_deref().unwrap_or("*")
                ),
                _ => spec.package.clone(),
            };
            union
                .entry(key)
                .and_modify(|existing| existing.merge(spec))
                .or_insert_with(|| DependencySpec {
                    workspace: false,
                    ..spec.clone()
                });
        }
        union
    }

    /// Canonical bytes of every member's dependency-relevant manifest
    /// content: resolved dependency tables and `[features]`.
    ///
    /// Package names, versions, targets and source code are left out.
    pub fn dependency_fingerprint(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct MemberDependencies<'a> {
            root: &'a Path,
            dependencies: &'a BTreeMap<String, DependencySpec>,
            features: &'a BTreeMap<String, Vec<String>>,
        }
        let members: Vec<MemberDependencies<'_>> = self
            .packages
            .iter()
            .map(|p| MemberDependencies {
                root: &p.root,
                dependencies: &p.dependencies,
                features: &p.features,
            })
            .collect();
        serde_json::to_vec(&members).unwrap_or_default()
    }

    /// Verify every declared dependency is pinned in the lock artifact and
    /// that each registry requirement accepts a pinned version.
    ///
    /// Fails closed on the first offending (package, dependency) pair.
    pub fn validate_lock(&self) -> std::result::Result<(), ResolutionError> {
        let pinned = self.lock.names();
        for package in &self.packages {
            for spec in package.dependencies.values() {
                let dependency = spec.package.as_str();
                if !pinned.contains(dependency) {
                    warn!(
                        package = %package.name,
                        dependency = %dependency,
                        "Dependency is not pinned in the lock artifact"
                    );
                    return Err(ResolutionError::UnlockedDependency {
                        package: package.name.clone(),
                        dependency: dependency.to_string(),
                    });
                }
                if spec.path.is_none() {
                    if let Some(requirement) = &spec.version {
                        self.check_requirement(package, dependency, requirement)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_requirement(
        &self,
        package: &Package,
        dependency: &str,
        requirement: &str,
    ) -> std::result::Result<(), ResolutionError> {
        let req = VersionReq::parse(requirement).map_err(|e| ResolutionError::InvalidManifest {
            path: package.root.join(MANIFEST_FILE),
            reason: format!("dependency '{}': {}", dependency, e),
        })?;
        let versions: Vec<&str> = self
            .lock
            .entries_named(dependency)
            .map(|entry| entry.version.as_str())
            .collect();
        let satisfied = versions
            .iter()
            .filter_map(|v| Version::parse(v).ok())
            .any(|v| req.matches(&v));
        if satisfied {
            return Ok(());
        }
        warn!(
            package = %package.name,
            dependency = %dependency,
            requirement = %requirement,
            "Requirement does not match the pinned version"
        );
        Err(ResolutionError::VersionMismatch {
            package: package.name.clone(),
            dependency: dependency.to_string(),
            requirement: requirement.to_string(),
            pinned: versions.join(", "),
        })
    }
}

fn compile_glob(pattern: &str, manifest: &Path) -> std::result::Result<GlobMatcher, ResolutionError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| ResolutionError::InvalidManifest {
            path: manifest.to_path_buf(),
            reason: format!("invalid member pattern '{}': {}", pattern, e),
        })
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Expand member patterns to sorted, deduplicated member directories.
fn expand_members(root: &Path, manifest: &RootManifest) -> Result<Vec<PathBuf>> {
    let manifest_path = root.join(MANIFEST_FILE);
    let excludes = manifest
        .exclude
        .iter()
        .map(|p| compile_glob(p, &manifest_path))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut found = BTreeSet::new();
    for pattern in &manifest.members {
        let pattern = pattern.trim_end_matches('/');
        if !is_glob(pattern) {
            let dir = PathBuf::from(pattern);
            if !root.join(&dir).join(MANIFEST_FILE).is_file() {
                return Err(ResolutionError::InvalidManifest {
                    path: manifest_path,
                    reason: format!("member '{}' has no {}", pattern, MANIFEST_FILE),
                }
                .into());
            }
            found.insert(dir);
            continue;
        }

        let matcher = compile_glob(pattern, &manifest_path)?;
        let depth = Path::new(pattern).components().count();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored_name(&e.file_name().to_string_lossy()));
        for entry in walker {
            let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let relative = match entry.path().strip_prefix(root) {
                Ok(r) => r.to_path_buf(),
                Err(_) => continue,
            };
            if matcher.is_match(&relative) && entry.path().join(MANIFEST_FILE).is_file() {
                found.insert(relative);
            }
        }
    }

    Ok(found
        .into_iter()
        .filter(|dir| !excludes.iter().any(|m| m.is_match(dir)))
        .collect())
}

/// Names skipped by every workspace walk.
pub(crate) fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || name == "target"
}
