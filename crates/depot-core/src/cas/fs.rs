use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CasError, CasStore, Digest, Result};

/// Filesystem blob store with git-style 2-char sharding.
///
/// Layout: `<root>/<first 2 hex chars>/<remaining hex chars>`. Used for
/// diagnostic logs and reports that outlive a single run.
pub struct FsCasStore {
    blobs_dir: PathBuf,
}

impl FsCasStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let blobs_dir = root.as_ref().to_path_buf();
        fs::create_dir_all(&blobs_dir)?;
        Ok(Self { blobs_dir })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.blobs_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Store UTF-8 text, returning its digest.
    pub fn put_text(&self, text: &str) -> Result<Digest> {
        self.put(text.as_bytes())
    }
}

impl CasStore for FsCasStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let path = self.blob_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        let shard_dir = self.blobs_dir.join(&digest.to_hex()[..2]);
        fs::create_dir_all(&shard_dir)?;

        // Write to a temp file in the shard, then rename into place.
        let mut tmp = NamedTempFile::new_in(&shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound(*digest)
            } else {
                CasError::Io(e)
            }
        })?;

        if Digest::compute(&data) != *digest {
            return Err(CasError::Corrupt {
                key: digest.to_hex(),
                reason: "blob content does not match its address".to_string(),
            });
        }
        Ok(data)
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_path(digest).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCasStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn text_roundtrip() {
        let (_dir, store) = make_store();
        let digest = store.put_text("error[E0308]: mismatched types").unwrap();
        assert_eq!(
            store.get(&digest).unwrap(),
            b"error[E0308]: mismatched types"
        );
    }

    #[test]
    fn duplicate_put_stores_once() {
        let (dir, store) = make_store();
        let d1 = store.put(b"same log").unwrap();
        let d2 = store.put(b"same log").unwrap();
        assert_eq!(d1, d2);

        let hex = d1.to_hex();
        let shard = dir.path().join("blobs").join(&hex[..2]);
        let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn get_missing_returns_not_found() {
        let (_dir, store) = make_store();
        let fake = Digest::compute(b"never stored");
        match store.get(&fake) {
            Err(CasError::NotFound(d)) => assert_eq!(d, fake),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(!store.exists(&fake).unwrap());
    }

    #[test]
    fn tampered_blob_is_corrupt() {
        let (dir, store) = make_store();
        let digest = store.put(b"original").unwrap();
        let hex = digest.to_hex();
        let path = dir.path().join("blobs").join(&hex[..2]).join(&hex[2..]);
        std::fs::write(&path, b"tampered").unwrap();

        assert!(matches!(store.get(&digest), Err(CasError::Corrupt { .. })));
    }
}
