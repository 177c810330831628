//! Dependency cache keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cas::{Digest, DigestBuilder};
use crate::workspace::Workspace;

/// Hash of the canonical root manifest, the members' dependency
/// fingerprint and the canonical lock artifact.
///
/// Package source code is not an input: editing a package never produces a
/// new key, while any change to pinned or requested dependencies always does.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(Digest);

impl CacheKey {
    /// Key from raw canonical bytes.
    pub fn from_canonical(manifest: &[u8], members: &[u8], lock: &[u8]) -> Self {
        CacheKey(
            DigestBuilder::new("dependency-cache")
                .field("manifest", manifest)
                .field("members", members)
                .field("lock", lock)
                .finish(),
        )
    }

    /// Key for a loaded workspace.
    pub fn for_workspace(workspace: &Workspace) -> Self {
        Self::from_canonical(
            &workspace.manifest().canonical_bytes(),
            &workspace.dependency_fingerprint(),
            &workspace.lock().canonical_bytes(),
        )
    }

    /// Underlying digest.
    pub fn digest(&self) -> &Digest {
        &self.0
    }

    /// Full hex form.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl From<Digest> for CacheKey {
    fn from(digest: Digest) -> Self {
        CacheKey(digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::WorkspaceFixture;

    #[test]
    fn test_package_edit_keeps_key() {
        let fixture = WorkspaceFixture::new();
        let before = CacheKey::for_workspace(&fixture.load());
        fixture.write("crates/alpha/src/lib.rs", "pub fn edited() {}\n");
        let after = CacheKey::for_workspace(&fixture.load());
        assert_eq!(before, after);
    }

    #[test]
    fn test_lock_change_changes_key() {
        let fixture = WorkspaceFixture::new();
        let before = CacheKey::for_workspace(&fixture.load());
        fixture.bump_lock("serde", "1.0.197", "1.0.198");
        let after = CacheKey::for_workspace(&fixture.load());
        assert_ne!(before, after);
    }

    #[test]
    fn test_lock_reformat_keeps_key() {
        let fixture = WorkspaceFixture::new();
        let before = CacheKey::for_workspace(&fixture.load());
        let lock = fixture.read("Cargo.lock");
        fixture.write("Cargo.lock", &format!("# regenerated\n\n{}", lock));
        let after = CacheKey::for_workspace(&fixture.load());
        assert_eq!(before, after);
    }

    #[test]
    fn test_inputs_are_not_interchangeable() {
        let a = CacheKey::from_canonical(b"x", b"", b"y");
        let b = CacheKey::from_canonical(b"y", b"", b"x");
        let c = CacheKey::from_canonical(b"x", b"y", b"");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_member_dependency_changes_key() {
        let fixture = WorkspaceFixture::new();
        let before = CacheKey::for_workspace(&fixture.load());
        fixture.add_dependency("beta", "log = \"0.4\"");
        let after = CacheKey::for_workspace(&fixture.load());
        assert_ne!(before, after);
    }

    #[test]
    fn test_member_feature_changes_key() {
        let fixture = WorkspaceFixture::new();
        let before = CacheKey::for_workspace(&fixture.load());
        let manifest = fixture.read("crates/gamma/Cargo.toml");
        fixture.write(
            "crates/gamma/Cargo.toml",
            &format!("{}\n[features]\nrc = [\"serde/rc\"]\n", manifest),
        );
        let after = CacheKey::for_workspace(&fixture.load());
        assert_ne!(before, after);
    }

    #[test]
    fn test_member_metadata_edit_keeps_key() {
        let fixture = WorkspaceFixture::new();
        let before = CacheKey::for_workspace(&fixture.load());
        let manifest = fixture.read("crates/gamma/Cargo.toml");
        fixture.write(
            "crates/gamma/Cargo.toml",
            &manifest.replace("version = \"0.1.0\"", "version = \"0.2.0\""),
        );
        let after = CacheKey::for_workspace(&fixture.load());
        assert_eq!(before, after);
    }
}
