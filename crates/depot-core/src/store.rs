//! Content-addressed artifact store.
//!
//! Layout under the store root:
//!
//! - `artifacts/<hex key>/` published entries, each with a `manifest.json`
//! - `packages/<name>.json` pointers to a package's current artifact
//! - `objects/` CAS blobs for diagnostic logs
//! - `tmp/` staging directories
//!
//! Entries become visible only through an atomic rename of a complete
//! staging directory and are never modified afterwards. When two writers
//! publish the same key, the first rename wins and the second discards its
//! staging copy.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cas::fs::FsCasStore;
use crate::cas::{CasError, Digest};
use crate::error::{DepotError, Result};

/// Manifest file written into every published entry.
pub const MANIFEST_NAME: &str = "manifest.json";

/// What a published entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Compiled external dependencies for one cache key.
    DependencyBundle,
    /// One package's build output.
    Package,
    /// A passing check's report.
    CheckReport,
}

/// One file inside a published entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

/// Metadata describing a published entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub key: Digest,
    pub kind: ArtifactKind,
    /// Human-readable label (package name, check name, cache key).
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ArtifactFile>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A published entry on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedArtifact {
    pub manifest: ArtifactManifest,
    pub path: PathBuf,
}

/// Package name to artifact pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PackagePointer {
    package: String,
    key: Digest,
    updated_at: DateTime<Utc>,
}

/// Filesystem artifact store.
pub struct ArtifactStore {
    root: PathBuf,
    blobs: FsCasStore,
}

impl ArtifactStore {
    /// Open (creating if needed) a store at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["artifacts", "packages", "tmp"] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        let blobs = FsCasStore::new(root.join("objects"))?;
        debug!(root = %root.display(), "Opened artifact store");
        Ok(Self { root, blobs })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blob store for diagnostic logs.
    pub fn blobs(&self) -> &FsCasStore {
        &self.blobs
    }

    fn artifact_dir(&self, key: &Digest) -> PathBuf {
        self.root.join("artifacts").join(key.to_hex())
    }

    /// Fresh staging directory on the same filesystem as the store.
    pub fn staging_dir(&self) -> Result<TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(self.root.join("tmp"))?)
    }

    /// Publish the contents of `staging` under `key`.
    ///
    /// Returns the entry that is visible after the call, which is the
    /// existing one when another writer published `key` first.
    pub fn publish(
        &self,
        key: &Digest,
        kind: ArtifactKind,
        label: &str,
        staging: TempDir,
        metadata: serde_json::Value,
    ) -> Result<PublishedArtifact> {
        if let Some(existing) = self.lookup(key)? {
            debug!(key = %key.short(), "Artifact already published");
            return Ok(existing);
        }

        let files = collect_files(staging.path())?;
        let manifest = ArtifactManifest {
            key: *key,
            kind,
            label: label.to_string(),
            created_at: Utc::now(),
            files,
            metadata,
        };
        std::fs::write(
            staging.path().join(MANIFEST_NAME),
            serde_json::to_vec_pretty(&manifest)?,
        )?;

        let staged = staging.into_path();
        let target = self.artifact_dir(key);
        match std::fs::rename(&staged, &target) {
            Ok(()) => {
                info!(
                    key = %key.short(),
                    kind = ?kind,
                    label = %label,
                    files = manifest.files.len(),
                    "Published artifact"
                );
                Ok(PublishedArtifact {
                    manifest,
                    path: target,
                })
            }
            Err(err) => {
                let _ = std::fs::remove_dir_all(&staged);
                match self.lookup(key)? {
                    Some(existing) => {
                        debug!(key = %key.short(), "Lost publication race, using existing entry");
                        Ok(existing)
                    }
                    None => Err(DepotError::Io(err)),
                }
            }
        }
    }

    /// Published entry for `key`, if any.
    pub fn lookup(&self, key: &Digest) -> Result<Option<PublishedArtifact>> {
        let dir = self.artifact_dir(key);
        let manifest_path = dir.join(MANIFEST_NAME);
        let bytes = match std::fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if dir.exists() {
                    return Err(CasError::Corrupt {
                        key: key.to_hex(),
                        reason: "published entry has no manifest".to_string(),
                    }
                    .into());
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: ArtifactManifest =
            serde_json::from_slice(&bytes).map_err(|e| CasError::Corrupt {
                key: key.to_hex(),
                reason: e.to_string(),
            })?;
        if manifest.key != *key {
            return Err(CasError::Corrupt {
                key: key.to_hex(),
                reason: format!("manifest records key {}", manifest.key.short()),
            }
            .into());
        }
        Ok(Some(PublishedArtifact {
            manifest,
            path: dir,
        }))
    }

    /// Re-hash every file of a published entry.
    pub fn verify(&self, artifact: &PublishedArtifact) -> Result<()> {
        for file in &artifact.manifest.files {
            let bytes = std::fs::read(artifact.path.join(&file.path))?;
            if Digest::compute(&bytes) != file.digest {
                return Err(CasError::Corrupt {
                    key: artifact.manifest.key.to_hex(),
                    reason: format!("{} does not match its recorded digest", file.path.display()),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Copy the files of the entry published under `key` into `dest`.
    ///
    /// Consumers that need a writable view of an entry (for example a
    /// compiler target directory) work on such a copy, never on the entry.
    pub fn checkout(&self, key: &Digest, dest: &Path) -> Result<PublishedArtifact> {
        let artifact = self.lookup(key)?.ok_or(CasError::NotFound(*key))?;
        for file in &artifact.manifest.files {
            let target = dest.join(&file.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(artifact.path.join(&file.path), &target)?;
        }
        Ok(artifact)
    }

    /// Record `key` as the current artifact of `package`.
    pub fn record_package(&self, package: &str, key: &Digest) -> Result<()> {
        let pointer = PackagePointer {
            package: package.to_string(),
            key: *key,
            updated_at: Utc::now(),
        };
        let dir = self.root.join("packages");
        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, &pointer)?;
        tmp.persist(dir.join(format!("{}.json", package)))
            .map_err(|e| DepotError::Io(e.error))?;
        Ok(())
    }

    /// Current artifact of `package`, if one was recorded.
    pub fn package_artifact(&self, package: &str) -> Result<Option<PublishedArtifact>> {
        let path = self.root.join("packages").join(format!("{}.json", package));
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let pointer: PackagePointer = serde_json::from_slice(&bytes)?;
        self.lookup(&pointer.key)
    }
}

/// Hash every regular file under `dir`, sorted by relative path.
fn collect_files(dir: &Path) -> Result<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| DepotError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(dir) {
            Ok(r) => r.to_path_buf(),
            Err(_) => continue,
        };
        if relative == Path::new(MANIFEST_NAME) {
            continue;
        }
        let bytes = std::fs::read(entry.path())?;
        files.push(ArtifactFile {
            path: relative,
            digest: Digest::compute(&bytes),
            size: bytes.len() as u64,
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn stage(store: &ArtifactStore, content: &str) -> TempDir {
        let staging = store.staging_dir().unwrap();
        std::fs::create_dir_all(staging.path().join("lib")).unwrap();
        std::fs::write(staging.path().join("lib/libalpha.rlib"), content).unwrap();
        staging
    }

    #[test]
    fn test_publish_and_lookup() {
        let (_dir, store) = store();
        let key = Digest::compute(b"alpha");
        let published = store
            .publish(
                &key,
                ArtifactKind::Package,
                "alpha",
                stage(&store, "rlib"),
                serde_json::json!({"package": "alpha"}),
            )
            .unwrap();

        assert!(published.path.join("lib/libalpha.rlib").is_file());
        assert_eq!(published.manifest.files.len(), 1);

        let found = store.lookup(&key).unwrap().unwrap();
        assert_eq!(found.manifest, published.manifest);
        store.verify(&found).unwrap();
    }

    #[test]
    fn test_lookup_missing() {
        let (_dir, store) = store();
        assert!(store.lookup(&Digest::compute(b"none")).unwrap().is_none());
    }

    #[test]
    fn test_first_writer_wins() {
        let (_dir, store) = store();
        let key = Digest::compute(b"dup");
        let first = store
            .publish(&key, ArtifactKind::Package, "a", stage(&store, "first"), serde_json::Value::Null)
            .unwrap();
        let second = store
            .publish(&key, ArtifactKind::Package, "a", stage(&store, "second"), serde_json::Value::Null)
            .unwrap();
        assert_eq!(first.manifest, second.manifest);
        let content = std::fs::read_to_string(second.path.join("lib/libalpha.rlib")).unwrap();
        assert_eq!(content, "first");
    }

    #[test]
    fn test_staging_never_visible() {
        let (_dir, store) = store();
        let staging = stage(&store, "partial");
        drop(staging);
        let entries: Vec<_> = std::fs::read_dir(store.root().join("artifacts"))
            .unwrap()
            .collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_package_pointer() {
        let (_dir, store) = store();
        assert!(store.package_artifact("alpha").unwrap().is_none());
        let key = Digest::compute(b"alpha-v1");
        store
            .publish(&key, ArtifactKind::Package, "alpha", stage(&store, "v1"), serde_json::Value::Null)
            .unwrap();
        store.record_package("alpha", &key).unwrap();
        let current = store.package_artifact("alpha").unwrap().unwrap();
        assert_eq!(current.manifest.key, key);
    }

    #[test]
    fn test_checkout_copies_files() {
        let (_dir, store) = store();
        let key = Digest::compute(b"bundle");
        store
            .publish(&key, ArtifactKind::DependencyBundle, "deps", stage(&store, "deps"), serde_json::Value::Null)
            .unwrap();
        let dest = tempfile::tempdir().unwrap();
        store.checkout(&key, dest.path()).unwrap();
        assert!(dest.path().join("lib/libalpha.rlib").is_file());
        assert!(!dest.path().join(MANIFEST_NAME).exists());

        let missing = Digest::compute(b"missing");
        assert!(matches!(
            store.checkout(&missing, dest.path()),
            Err(DepotError::Store(CasError::NotFound(_)))
        ));
    }

    #[test]
    fn test_tampered_file_fails_verify() {
        let (_dir, store) = store();
        let key = Digest::compute(b"tamper");
        let published = store
            .publish(&key, ArtifactKind::Package, "a", stage(&store, "ok"), serde_json::Value::Null)
            .unwrap();
        std::fs::write(published.path.join("lib/libalpha.rlib"), "evil").unwrap();
        assert!(matches!(
            store.verify(&published),
            Err(DepotError::Store(CasError::Corrupt { .. }))
        ));
    }
}
