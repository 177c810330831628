//! Package build tasks.
//!
//! A package build stages the package's source set into an empty directory,
//! gives the backend a private copy of the dependency bundle as its target
//! directory, and publishes the outputs under a [`BuildKey`](build_key).
//! Tests are never run here.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{BuildBackend, PackageBuildRequest};
use crate::cache_key::CacheKey;
use crate::cas::{Digest, DigestBuilder};
use crate::dep_cache::CacheEntry;
use crate::error::{DepotError, Result};
use crate::obs;
use crate::source_set::SourceFileSetResolver;
use crate::store::{ArtifactKind, ArtifactStore, PublishedArtifact};
use crate::workspace::Workspace;
use depot_env::EnvironmentDescriptor;

/// `H("package-build", name, source digest, cache key)`.
pub fn build_key(package: &str, sources: &Digest, cache_key: &CacheKey) -> Digest {
    DigestBuilder::new("package-build")
        .field("package", package.as_bytes())
        .field("sources", sources.as_bytes())
        .field("cache", cache_key.digest().as_bytes())
        .finish()
}

/// A successful package build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub package: String,
    pub key: Digest,
    pub artifact: PublishedArtifact,
    /// Served from the store without invoking the backend.
    pub cached: bool,
    pub duration_ms: u64,
}

impl BuildOutcome {
    /// Path of the package's executable, when it produced one.
    pub fn executable(&self) -> Option<PathBuf> {
        let candidates = [self.package.clone(), format!("{}.exe", self.package)];
        candidates
            .iter()
            .map(|name| self.artifact.path.join(name))
            .find(|path| path.is_file())
    }
}

/// Summary of a build for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub package: String,
    pub key: String,
    pub cached: bool,
    pub files: usize,
}

impl From<&BuildOutcome> for BuildSummary {
    fn from(outcome: &BuildOutcome) -> Self {
        Self {
            package: outcome.package.clone(),
            key: outcome.key.to_hex(),
            cached: outcome.cached,
            files: outcome.artifact.manifest.files.len(),
        }
    }
}

/// Runs package builds against a store and backend.
pub struct PackageBuilder {
    store: Arc<ArtifactStore>,
    backend: Arc<dyn BuildBackend>,
    env: EnvironmentDescriptor,
}

impl PackageBuilder {
    pub fn new(
        store: Arc<ArtifactStore>,
        backend: Arc<dyn BuildBackend>,
        env: EnvironmentDescriptor,
    ) -> Self {
        Self {
            store,
            backend,
            env,
        }
    }

    /// Build `package` against `cache`.
    ///
    /// A published build key is served from the store. Compile failures are
    /// [`DepotError::Build`]; missing native libraries are attributed to
    /// provisioning as [`DepotError::Environment`]. The dependency bundle is
    /// never modified.
    pub async fn build(
        &self,
        workspace: &Workspace,
        package: &str,
        cache: &CacheEntry,
    ) -> Result<BuildOutcome> {
        let start = Instant::now();
        let pkg = workspace.package(package)?;
        let sources = SourceFileSetResolver::new(workspace).resolve_package(pkg)?;
        let source_digest = sources.digest(workspace.root())?;
        let key = build_key(&pkg.name, &source_digest, &cache.key);
        let task = format!("build:{}", pkg.name);

        if let Some(artifact) = self.store.lookup(&key)? {
            obs::emit_cache_hit("package", &key.short());
            self.store.record_package(&pkg.name, &key)?;
            let duration_ms = start.elapsed().as_millis() as u64;
            obs::emit_task_finished(&task, "passed", true, duration_ms);
            return Ok(BuildOutcome {
                package: pkg.name.clone(),
                key,
                artifact,
                cached: true,
                duration_ms,
            });
        }

        obs::emit_task_started(&task, &key.short());
        let source_dir = self.store.staging_dir()?;
        sources.stage(workspace.root(), source_dir.path())?;
        let target_dir = self.store.staging_dir()?;
        self.store.checkout(cache.key.digest(), target_dir.path())?;
        let output_dir = self.store.staging_dir()?;

        let request = PackageBuildRequest {
            package: pkg.name.clone(),
            source_dir: source_dir.path().to_path_buf(),
            target_dir: target_dir.path().to_path_buf(),
            output_dir: output_dir.path().to_path_buf(),
            env: self.env.process_env_vars(),
        };
        let outcome = self.backend.build_package(&request).await?;
        if !outcome.success {
            let log = self.store.blobs().put_text(&outcome.diagnostics)?;
            let err = classify_failure(&pkg.name, &outcome.diagnostics);
            obs::emit_task_failed(&task, &format!("{:?}", err.category()), &log.short());
            obs::emit_task_finished(&task, "failed", false, start.elapsed().as_millis() as u64);
            return Err(err);
        }

        let artifact = self.store.publish(
            &key,
            ArtifactKind::Package,
            &pkg.name,
            output_dir,
            serde_json::json!({
                "package": pkg.name,
                "sources": source_digest.to_hex(),
                "source_files": sources.len(),
                "cache_key": cache.key.to_hex(),
                "backend": self.backend.name(),
            }),
        )?;
        self.store.record_package(&pkg.name, &key)?;

        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_cache_built("package", &key.short(), duration_ms);
        obs::emit_task_finished(&task, "passed", false, duration_ms);
        info!(package = %pkg.name, key = %key.short(), "Package built");
        Ok(BuildOutcome {
            package: pkg.name.clone(),
            key,
            artifact,
            cached: false,
            duration_ms,
        })
    }
}

fn native_library_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"cannot find -l([\w.+-]+)",
            r"unable to find library -l([\w.+-]+)",
            r"library not found for -l([\w.+-]+)",
            r"error while loading shared libraries: ([\w.+-]+)",
            r"The system library `([\w.+-]+)` required by crate",
            r"Package ([\w.+-]+) was not found in the pkg-config search path",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Missing native libraries named in compiler or linker output.
pub fn missing_native_libraries(diagnostics: &str) -> Vec<String> {
    let mut missing: Vec<String> = native_library_patterns()
        .iter()
        .flat_map(|re| re.captures_iter(diagnostics))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

/// Map failed build output to a build or environment error.
pub fn classify_failure(package: &str, diagnostics: &str) -> DepotError {
    let missing = missing_native_libraries(diagnostics);
    if missing.is_empty() {
        DepotError::Build {
            package: package.to_string(),
            diagnostics: diagnostics.to_string(),
        }
    } else {
        warn!(package = %package, libraries = ?missing, "Build failed on missing native libraries");
        DepotError::Environment {
            task: format!("build:{}", package),
            detail: format!("missing native libraries: {}", missing.join(", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dep_cache::DependencyArtifactCache;
    use crate::fakes::{FakeBackend, WorkspaceFixture};
    use depot_env::Platform;

    struct Harness {
        fixture: WorkspaceFixture,
        backend: Arc<FakeBackend>,
        cache: DependencyArtifactCache,
        builder: PackageBuilder,
        store: Arc<ArtifactStore>,
    }

    fn harness() -> Harness {
        let fixture = WorkspaceFixture::new();
        let backend = Arc::new(FakeBackend::new());
        let store = Arc::new(ArtifactStore::open(fixture.store_root()).unwrap());
        let env = EnvironmentDescriptor::empty(Platform::current());
        let cache = DependencyArtifactCache::new(store.clone(), backend.clone(), env.clone());
        let builder = PackageBuilder::new(store.clone(), backend.clone(), env);
        Harness {
            fixture,
            backend,
            cache,
            builder,
            store,
        }
    }

    #[tokio::test]
    async fn test_build_publishes_and_records() {
        let h = harness();
        let ws = h.fixture.load();
        let entry = h.cache.ensure(&ws).await.unwrap();
        let outcome = h.builder.build(&ws, "alpha", &entry).await.unwrap();

        assert!(!outcome.cached);
        assert_eq!(h.backend.package_builds("alpha"), 1);
        let current = h.store.package_artifact("alpha").unwrap().unwrap();
        assert_eq!(current.manifest.key, outcome.key);
    }

    #[tokio::test]
    async fn test_rebuild_is_served_from_store() {
        let h = harness();
        let ws = h.fixture.load();
        let entry = h.cache.ensure(&ws).await.unwrap();
        let first = h.builder.build(&ws, "alpha", &entry).await.unwrap();
        let second = h.builder.build(&ws, "alpha", &entry).await.unwrap();

        assert!(second.cached);
        assert_eq!(first.key, second.key);
        assert_eq!(first.artifact.manifest, second.artifact.manifest);
        assert_eq!(h.backend.package_builds("alpha"), 1);
    }

    #[tokio::test]
    async fn test_backend_sees_only_source_set() {
        let h = harness();
        let ws = h.fixture.load();
        let entry = h.cache.ensure(&ws).await.unwrap();
        h.builder.build(&ws, "beta", &entry).await.unwrap();

        let seen = h.backend.staged_files("beta");
        assert!(seen.contains(&PathBuf::from("crates/beta/src/lib.rs")));
        assert!(seen.contains(&PathBuf::from("crates/common/src/lib.rs")));
        assert!(!seen.iter().any(|p| p.starts_with("crates/alpha")));
    }

    #[tokio::test]
    async fn test_compile_error_leaves_cache_untouched() {
        let h = harness();
        let ws = h.fixture.load();
        let entry = h.cache.ensure(&ws).await.unwrap();
        let before = h.store.lookup(entry.key.digest()).unwrap().unwrap();

        h.backend.fail_package("gamma", "error[E0308]: mismatched types");
        let err = h.builder.build(&ws, "gamma", &entry).await.unwrap_err();
        assert!(matches!(err, DepotError::Build { .. }));

        let after = h.store.lookup(entry.key.digest()).unwrap().unwrap();
        assert_eq!(before.manifest, after.manifest);
        h.store.verify(&after).unwrap();
        assert!(h.store.package_artifact("gamma").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_native_library_is_environment_error() {
        let h = harness();
        let ws = h.fixture.load();
        let entry = h.cache.ensure(&ws).await.unwrap();
        h.backend
            .fail_package("alpha", "  = note: /usr/bin/ld: cannot find -ljack: No such file");
        let err = h.builder.build(&ws, "alpha", &entry).await.unwrap_err();
        match err {
            DepotError::Environment { task, detail } => {
                assert_eq!(task, "build:alpha");
                assert!(detail.contains("jack"));
            }
            other => panic!("expected Environment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_package() {
        let h = harness();
        let ws = h.fixture.load();
        let entry = h.cache.ensure(&ws).await.unwrap();
        let err = h.builder.build(&ws, "ghost", &entry).await.unwrap_err();
        assert!(matches!(err, DepotError::Resolution(_)));
    }

    #[test]
    fn test_build_key_depends_on_every_input() {
        let sources = Digest::compute(b"sources");
        let cache = CacheKey::from_canonical(b"m", b"", b"l");
        let base = build_key("alpha", &sources, &cache);
        assert_eq!(base, build_key("alpha", &sources, &cache));
        assert_ne!(base, build_key("beta", &sources, &cache));
        assert_ne!(base, build_key("alpha", &Digest::compute(b"other"), &cache));
        assert_ne!(
            base,
            build_key("alpha", &sources, &CacheKey::from_canonical(b"m", b"", b"l2"))
        );
    }

    #[test]
    fn test_missing_native_libraries_parsing() {
        let out = "error while loading shared libraries: libasound.so.2: cannot open\n\
                   The system library `xkbcommon` required by crate `smithay-client-toolkit` was not found.";
        assert_eq!(
            missing_native_libraries(out),
            vec!["libasound.so.2".to_string(), "xkbcommon".to_string()]
        );
        assert!(missing_native_libraries("error[E0425]: cannot find value").is_empty());
    }
}
