pub mod fs;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

/// SHA-256 digest used as a content address and as task input hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> String {
        self.to_hex().chars().take(12).collect()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = CasError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CasError::InvalidDigest(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(CasError::InvalidDigest(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Incremental digest over labelled fields.
///
/// Every field is written as `label \0 len \0 bytes \0` under a domain tag,
/// so distinct field sequences can never collide by concatenation.
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    /// Start a digest in the namespace `domain`.
    pub fn new(domain: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"depot:");
        hasher.update(domain.as_bytes());
        hasher.update(b"\0");
        Self { hasher }
    }

    /// Append one labelled field.
    pub fn field(mut self, label: &str, data: &[u8]) -> Self {
        self.update_field(label, data);
        self
    }

    /// Append one labelled field in place.
    pub fn update_field(&mut self, label: &str, data: &[u8]) {
        self.hasher.update(label.as_bytes());
        self.hasher.update(b"\0");
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(b"\0");
        self.hasher.update(data);
        self.hasher.update(b"\0");
    }

    /// Finish and return the digest.
    pub fn finish(self) -> Digest {
        let hash = self.hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Digest(bytes)
    }
}

/// Errors from CAS operations.
#[derive(Debug, Error)]
pub enum CasError {
    #[error("blob not found: {0}")]
    NotFound(Digest),

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("corrupt store entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Content-addressed blob store interface.
pub trait CasStore: Send + Sync {
    /// Store `data` and return its digest. Deduplicates automatically.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Retrieve the blob for `digest`.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Check whether `digest` exists without reading the blob.
    fn exists(&self, digest: &Digest) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_fromstr_roundtrip() {
        let d = Digest::compute(b"hello world");
        let hex = d.to_string();
        assert_eq!(hex.len(), 64);
        let parsed: Digest = hex.parse().unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn digest_fromstr_invalid_hex() {
        assert!("not-valid-hex".parse::<Digest>().is_err());
    }

    #[test]
    fn digest_fromstr_wrong_length() {
        assert!("abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn builder_deterministic() {
        let a = DigestBuilder::new("t").field("x", b"1").field("y", b"2").finish();
        let b = DigestBuilder::new("t").field("x", b"1").field("y", b"2").finish();
        assert_eq!(a, b);
    }

    #[test]
    fn builder_field_boundaries_matter() {
        let a = DigestBuilder::new("t").field("x", b"ab").field("x", b"c").finish();
        let b = DigestBuilder::new("t").field("x", b"a").field("x", b"bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn builder_domain_separates() {
        let a = DigestBuilder::new("package-build").field("x", b"1").finish();
        let b = DigestBuilder::new("check").field("x", b"1").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn short_is_prefix() {
        let d = Digest::compute(b"short");
        assert!(d.to_hex().starts_with(&d.short()));
        assert_eq!(d.short().len(), 12);
    }
}
