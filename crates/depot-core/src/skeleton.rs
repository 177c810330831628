//! Dependency-only copy of the workspace.
//!
//! The dependency bundle is compiled in a skeleton of the real workspace:
//! the root manifest, the lock and every member manifest are copied
//! verbatim, and every target root is replaced by an empty stub. Cargo
//! resolves exactly what the real workspace resolves (member features and
//! the aggregation package included), the lock stays valid for `--locked`,
//! and no package source can leak into the bundle.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use toml::Value;
use tracing::debug;

use crate::error::{ResolutionError, Result};
use crate::workspace::{Package, Workspace, LOCK_FILE, MANIFEST_FILE};

/// Workspace-level files cargo reads besides the manifests.
const TOOLCHAIN_FILES: &[&str] = &[
    ".cargo/config.toml",
    ".cargo/config",
    "rust-toolchain.toml",
    "rust-toolchain",
];

/// Directories cargo scans for auto-discovered targets.
const TARGET_DIRS: &[&str] = &["src/bin", "tests", "benches", "examples"];

/// Explicit target tables whose `path` keys name target roots.
const TARGET_TABLES: &[&str] = &["bin", "test", "bench", "example"];

const LIB_STUB: &str = "";
const MAIN_STUB: &str = "fn main() {}\n";

/// Files written into a skeleton directory, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySkeleton {
    /// Copied manifests, lock and toolchain files.
    pub copied: Vec<PathBuf>,
    /// Stubbed target roots.
    pub stubs: Vec<PathBuf>,
}

impl DependencySkeleton {
    /// Write the skeleton of `workspace` into `dest`.
    pub fn write(workspace: &Workspace, dest: &Path) -> Result<Self> {
        let root = workspace.root();
        let mut copied = BTreeSet::new();
        let mut stubs = BTreeSet::new();

        for file in [MANIFEST_FILE, LOCK_FILE].iter().chain(TOOLCHAIN_FILES) {
            if root.join(file).is_file() {
                copied.insert(PathBuf::from(file));
            }
        }

        for package in workspace.packages() {
            copied.insert(package.root.join(MANIFEST_FILE));
            for (path, stub) in target_roots(root, package)? {
                stubs.insert((package.root.join(path), stub));
            }
        }

        for file in &copied {
            let target = dest.join(file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(root.join(file), &target)?;
        }
        for (file, stub) in &stubs {
            let target = dest.join(file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, stub)?;
        }

        debug!(
            copied = copied.len(),
            stubs = stubs.len(),
            dest = %dest.display(),
            "Wrote dependency skeleton"
        );
        Ok(Self {
            copied: copied.into_iter().collect(),
            stubs: stubs.into_iter().map(|(path, _)| path).collect(),
        })
    }
}

/// Target root files of `package` (relative to its root) and their stubs.
fn target_roots(root: &Path, package: &Package) -> Result<BTreeSet<(PathBuf, &'static str)>> {
    let package_root = root.join(&package.root);
    let manifest_path = package_root.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path)?;
    let document: Value =
        toml::from_str(&content).map_err(|e| ResolutionError::InvalidManifest {
            path: manifest_path.clone(),
            reason: e.to_string(),
        })?;

    let mut roots = BTreeSet::new();

    match document.get("lib").and_then(|l| l.get("path")).and_then(Value::as_str) {
        Some(path) => {
            roots.insert((PathBuf::from(path), LIB_STUB));
        }
        None if package_root.join("src/lib.rs").is_file() => {
            roots.insert((PathBuf::from("src/lib.rs"), LIB_STUB));
        }
        None => {}
    }

    if package_root.join("src/main.rs").is_file() {
        roots.insert((PathBuf::from("src/main.rs"), MAIN_STUB));
    }
    for dir in TARGET_DIRS {
        for path in discover(&package_root, Path::new(dir))? {
            roots.insert((path, MAIN_STUB));
        }
    }
    for table in TARGET_TABLES {
        let targets = document.get(*table).and_then(Value::as_array);
        for target in targets.into_iter().flatten() {
            if let Some(path) = target.get("path").and_then(Value::as_str) {
                roots.insert((PathBuf::from(path), MAIN_STUB));
            }
        }
    }

    // `build = false` disables the script; a string overrides `build.rs`.
    match document.get("package").and_then(|p| p.get("build")) {
        Some(Value::String(path)) => {
            roots.insert((PathBuf::from(path), MAIN_STUB));
        }
        Some(Value::Boolean(false)) => {}
        _ => {
            if package_root.join("build.rs").is_file() {
                roots.insert((PathBuf::from("build.rs"), MAIN_STUB));
            }
        }
    }

    Ok(roots)
}

/// `dir/*.rs` and `dir/*/main.rs` under `package_root`, as relative paths.
fn discover(package_root: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(package_root.join(dir)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = PathBuf::from(entry.file_name());
        if entry.file_type()?.is_dir() {
            if entry.path().join("main.rs").is_file() {
                found.push(dir.join(name).join("main.rs"));
            }
        } else if name.extension().is_some_and(|ext| ext == "rs") {
            found.push(dir.join(name));
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::WorkspaceFixture;

    fn read(dir: &Path, relative: &str) -> String {
        std::fs::read_to_string(dir.join(relative)).unwrap()
    }

    #[test]
    fn test_skeleton_keeps_manifests_and_lock_verbatim() {
        let fixture = WorkspaceFixture::new();
        let dest = tempfile::tempdir().unwrap();
        let skeleton = DependencySkeleton::write(&fixture.load(), dest.path()).unwrap();

        for file in ["Cargo.toml", "Cargo.lock", "crates/workspace-hack/Cargo.toml"] {
            assert_eq!(read(dest.path(), file), fixture.read(file), "{}", file);
        }
        for file in &skeleton.copied {
            if file.extension().is_some_and(|ext| ext == "toml") {
                let parsed: std::result::Result<toml::Table, _> =
                    read(dest.path(), &file.to_string_lossy()).parse();
                assert!(parsed.is_ok(), "{} is not a TOML document", file.display());
            }
        }
        assert_eq!(skeleton.copied.len(), 2 + 5);
    }

    #[test]
    fn test_skeleton_stubs_every_target_root() {
        let fixture = WorkspaceFixture::new();
        let dest = tempfile::tempdir().unwrap();
        let skeleton = DependencySkeleton::write(&fixture.load(), dest.path()).unwrap();

        assert!(skeleton.stubs.contains(&PathBuf::from("crates/gamma/src/main.rs")));
        assert_eq!(read(dest.path(), "crates/gamma/src/main.rs"), MAIN_STUB);
        assert_eq!(read(dest.path(), "crates/alpha/src/lib.rs"), "");
        assert_eq!(read(dest.path(), "crates/common/src/lib.rs"), "");
    }

    #[test]
    fn test_skeleton_follows_explicit_target_paths() {
        let fixture = WorkspaceFixture::new();
        fixture.write(
            "crates/delta/Cargo.toml",
            "[package]\nname = \"delta\"\nversion = \"0.1.0\"\nbuild = \"gen/build.rs\"\n\n\
             [lib]\npath = \"lib/delta.rs\"\n\n\
             [[bin]]\nname = \"delta-tool\"\npath = \"tools/run.rs\"\n",
        );
        fixture.write("crates/delta/lib/delta.rs", "pub fn delta() {}\n");
        fixture.write("crates/delta/tools/run.rs", "fn main() { delta::delta() }\n");
        fixture.write("crates/delta/gen/build.rs", "fn main() { println!(\"gen\") }\n");
        fixture.write("crates/delta/tests/smoke.rs", "#[test]\nfn smoke() {}\n");

        let dest = tempfile::tempdir().unwrap();
        DependencySkeleton::write(&fixture.load(), dest.path()).unwrap();

        assert_eq!(read(dest.path(), "crates/delta/lib/delta.rs"), LIB_STUB);
        assert_eq!(read(dest.path(), "crates/delta/tools/run.rs"), MAIN_STUB);
        assert_eq!(read(dest.path(), "crates/delta/gen/build.rs"), MAIN_STUB);
        assert_eq!(read(dest.path(), "crates/delta/tests/smoke.rs"), MAIN_STUB);
        assert!(!dest.path().join("crates/delta/build.rs").exists());
    }

    #[test]
    fn test_skeleton_leaks_no_package_source() {
        let fixture = WorkspaceFixture::new();
        let dest = tempfile::tempdir().unwrap();
        DependencySkeleton::write(&fixture.load(), dest.path()).unwrap();

        let leaked = walkdir::WalkDir::new(dest.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .any(|e| std::fs::read_to_string(e.path()).unwrap().contains("common::shared"));
        assert!(!leaked);
    }
}
