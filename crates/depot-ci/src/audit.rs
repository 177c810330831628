//! Security audit against an advisory snapshot.
//!
//! The snapshot uses the RustSec advisory-db layout: one file per advisory
//! under `crates/<package>/`, either Markdown with a fenced TOML front
//! matter block or plain TOML. Only the `[advisory]` and `[versions]`
//! tables are read.
//!
//! Informational advisories (`unmaintained`, `unsound`, `notice`) are
//! reported as warnings and never fail the audit.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use depot_core::{Digest, DigestBuilder, LockArtifact};

#[derive(Debug, Deserialize)]
struct RawAdvisoryFile {
    advisory: RawAdvisory,
    #[serde(default)]
    versions: RawVersions,
}

#[derive(Debug, Deserialize)]
struct RawAdvisory {
    id: String,
    package: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    withdrawn: Option<toml::Value>,
    #[serde(default)]
    informational: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVersions {
    #[serde(default)]
    patched: Vec<String>,
    #[serde(default)]
    unaffected: Vec<String>,
}

/// One parsed advisory.
#[derive(Debug, Clone)]
pub struct Advisory {
    pub id: String,
    pub package: String,
    pub title: Option<String>,
    pub withdrawn: bool,
    /// Informational category, e.g. `unmaintained`.
    pub informational: Option<String>,
    pub patched: Vec<VersionReq>,
    pub unaffected: Vec<VersionReq>,
}

impl Advisory {
    /// Parse advisory file content (Markdown front matter or TOML).
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let (toml_src, title) = split_front_matter(content);
        let raw: RawAdvisoryFile = toml::from_str(toml_src).context("invalid advisory TOML")?;
        let parse_reqs = |reqs: &[String]| -> anyhow::Result<Vec<VersionReq>> {
            reqs.iter()
                .map(|r| {
                    VersionReq::parse(r)
                        .with_context(|| format!("advisory {}: invalid requirement '{}'", raw.advisory.id, r))
                })
                .collect()
        };
        Ok(Advisory {
            patched: parse_reqs(&raw.versions.patched)?,
            unaffected: parse_reqs(&raw.versions.unaffected)?,
            withdrawn: raw.advisory.withdrawn.is_some(),
            informational: raw.advisory.informational,
            title: raw.advisory.title.or(title),
            id: raw.advisory.id,
            package: raw.advisory.package,
        })
    }

    /// Whether this advisory is a notice rather than a vulnerability.
    pub fn is_informational(&self) -> bool {
        self.informational.is_some()
    }

    /// Whether `version` falls in this advisory's affected range.
    pub fn affects(&self, version: &Version) -> bool {
        !self.withdrawn
            && !self.patched.iter().any(|r| r.matches(version))
            && !self.unaffected.iter().any(|r| r.matches(version))
    }
}

/// Extract the TOML block and the first Markdown heading.
fn split_front_matter(content: &str) -> (&str, Option<String>) {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("```toml") else {
        return (content, None);
    };
    let Some(end) = rest.find("```") else {
        return (rest, None);
    };
    let title = rest[end + 3..]
        .lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string());
    (&rest[..end], title)
}

/// A pinned package matched by an advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub advisory: String,
    pub package: String,
    pub version: String,
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub informational: Option<String>,
}

impl std::fmt::Display for Vulnerability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.advisory, self.package, self.version)?;
        if let Some(kind) = &self.informational {
            write!(f, " ({})", kind)?;
        }
        if let Some(title) = &self.title {
            write!(f, ": {}", title)?;
        }
        Ok(())
    }
}

/// Matches of one audit run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFindings {
    /// Failing matches.
    pub vulnerabilities: Vec<Vulnerability>,
    /// Informational matches.
    pub warnings: Vec<Vulnerability>,
}

/// Loaded advisory snapshot.
#[derive(Debug, Clone)]
pub struct AdvisoryDatabase {
    root: PathBuf,
    advisories: Vec<Advisory>,
}

impl AdvisoryDatabase {
    /// Load every advisory under `root`. A missing snapshot is an error:
    /// an audit without data must never pass.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        if !root.is_dir() {
            bail!("advisory snapshot not found at {}", root.display());
        }
        let mut advisories = Vec::new();
        for path in advisory_files(root) {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let advisory =
                Advisory::parse(&content).with_context(|| format!("in {}", path.display()))?;
            advisories.push(advisory);
        }
        if advisories.is_empty() {
            bail!("advisory snapshot at {} contains no advisories", root.display());
        }
        debug!(root = %root.display(), advisories = advisories.len(), "Loaded advisory snapshot");
        Ok(Self {
            root: root.to_path_buf(),
            advisories,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.advisories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advisories.is_empty()
    }

    /// Advisories for `package`.
    pub fn for_package<'a>(&'a self, package: &'a str) -> impl Iterator<Item = &'a Advisory> {
        self.advisories.iter().filter(move |a| a.package == package)
    }

    /// Registry entries of `lock` matched by an advisory, skipping ignored
    /// advisory ids. Informational matches land in `warnings`.
    pub fn audit(&self, lock: &LockArtifact, ignore: &[String]) -> AuditFindings {
        let ignore: BTreeSet<&str> = ignore.iter().map(String::as_str).collect();
        let mut found = AuditFindings::default();
        for pkg in lock.external_packages() {
            if !pkg.source.as_deref().is_some_and(|s| s.starts_with("registry+")) {
                continue;
            }
            let version = match Version::parse(&pkg.version) {
                Ok(v) => v,
                Err(e) => {
                    warn!(package = %pkg.name, version = %pkg.version, error = %e, "Unparsable pinned version");
                    continue;
                }
            };
            for advisory in self.for_package(&pkg.name) {
                if ignore.contains(advisory.id.as_str()) {
                    debug!(advisory = %advisory.id, "Ignoring advisory");
                    continue;
                }
                if !advisory.affects(&version) {
                    continue;
                }
                let matched = Vulnerability {
                    advisory: advisory.id.clone(),
                    package: pkg.name.clone(),
                    version: pkg.version.clone(),
                    title: advisory.title.clone(),
                    informational: advisory.informational.clone(),
                };
                if advisory.is_informational() {
                    warn!(advisory = %advisory.id, package = %pkg.name, "Informational advisory");
                    found.warnings.push(matched);
                } else {
                    found.vulnerabilities.push(matched);
                }
            }
        }
        for list in [&mut found.vulnerabilities, &mut found.warnings] {
            list.sort_by(|a, b| (&a.package, &a.advisory).cmp(&(&b.package, &b.advisory)));
        }
        found
    }
}

fn advisory_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let in_crates = p
                .strip_prefix(root)
                .map(|r| r.starts_with("crates"))
                .unwrap_or(false);
            let ext = p.extension().and_then(|e| e.to_str());
            in_crates && matches!(ext, Some("md") | Some("toml"))
        })
        .collect();
    files.sort();
    files
}

/// Digest of the snapshot's advisory files, for check keys.
pub fn snapshot_digest(root: &Path) -> Option<Digest> {
    if !root.is_dir() {
        return None;
    }
    let mut builder = DigestBuilder::new("advisory-snapshot");
    for path in advisory_files(root) {
        let bytes = std::fs::read(&path).ok()?;
        let relative = path.strip_prefix(root).unwrap_or(&path);
        builder.update_field("path", relative.to_string_lossy().as_bytes());
        builder.update_field("content", &bytes);
    }
    Some(builder.finish())
}
