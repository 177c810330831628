//! Per-package source file sets.
//!
//! A package's build sees its own subtree, the root manifest, the lock and
//! the shared common-code packages. Nothing else from the workspace is
//! staged, so edits to a sibling package cannot change its inputs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::cas::{Digest, DigestBuilder};
use crate::error::{DepotError, Result};
use crate::workspace::{is_ignored_name, Package, Workspace};

/// Sorted, deduplicated relative file paths for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileSet {
    /// Package name, or `None` for the whole-workspace set.
    pub package: Option<String>,
    /// Relative paths, lexicographically sorted.
    pub files: Vec<PathBuf>,
}

impl SourceFileSet {
    /// Number of files in the set.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Whether `path` is in the set.
    pub fn contains(&self, path: &Path) -> bool {
        self.files.binary_search_by(|p| p.as_path().cmp(path)).is_ok()
    }

    /// Content digest over every (path, bytes) pair in order.
    pub fn digest(&self, root: &Path) -> Result<Digest> {
        let mut builder = DigestBuilder::new("source-set");
        for file in &self.files {
            let bytes = std::fs::read(root.join(file))?;
            builder.update_field("path", portable(file).as_bytes());
            builder.update_field("content", &bytes);
        }
        Ok(builder.finish())
    }

    /// Copy the set from `root` into `dest`, preserving relative paths.
    pub fn stage(&self, root: &Path, dest: &Path) -> Result<()> {
        for file in &self.files {
            let target = dest.join(file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(root.join(file), &target)?;
        }
        debug!(files = self.files.len(), dest = %dest.display(), "Staged source set");
        Ok(())
    }
}

/// Computes [`SourceFileSet`]s from a loaded workspace.
pub struct SourceFileSetResolver<'a> {
    workspace: &'a Workspace,
}

impl<'a> SourceFileSetResolver<'a> {
    pub fn new(workspace: &'a Workspace) -> Self {
        Self { workspace }
    }

    /// Source set for the member named `package`.
    pub fn resolve(&self, package: &str) -> Result<SourceFileSet> {
        let package = self.workspace.package(package)?;
        self.resolve_package(package)
    }

    /// Source set for an already looked-up member.
    pub fn resolve_package(&self, package: &Package) -> Result<SourceFileSet> {
        let root = self.workspace.root();
        let mut files = BTreeSet::new();

        walk_into(root, &package.root, &mut files)?;
        for shared in self.workspace.shared_files() {
            if root.join(&shared).is_file() {
                files.insert(shared);
            }
        }
        for shared in self.workspace.shared_paths() {
            walk_into(root, shared, &mut files)?;
        }

        debug!(package = %package.name, files = files.len(), "Resolved source set");
        Ok(SourceFileSet {
            package: Some(package.name.clone()),
            files: files.into_iter().collect(),
        })
    }

    /// Whole-workspace source set used by checks.
    pub fn resolve_workspace(&self) -> Result<SourceFileSet> {
        let root = self.workspace.root();
        let mut files = BTreeSet::new();
        for shared in self.workspace.shared_files() {
            if root.join(&shared).is_file() {
                files.insert(shared);
            }
        }
        for package in self.workspace.packages() {
            walk_into(root, &package.root, &mut files)?;
        }
        for shared in self.workspace.shared_paths() {
            walk_into(root, shared, &mut files)?;
        }
        Ok(SourceFileSet {
            package: None,
            files: files.into_iter().collect(),
        })
    }
}

/// Collect every regular file under `root/subtree` as a root-relative path.
fn walk_into(root: &Path, subtree: &Path, files: &mut BTreeSet<PathBuf>) -> Result<()> {
    let start = root.join(subtree);
    if !start.exists() {
        return Ok(());
    }
    let walker = WalkDir::new(&start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored_name(&e.file_name().to_string_lossy()));
    for entry in walker {
        let entry = entry.map_err(|e| DepotError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.insert(relative.to_path_buf());
        }
    }
    Ok(())
}

/// Path with `/` separators so digests agree across platforms.
fn portable(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
