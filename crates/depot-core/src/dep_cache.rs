//! Dependency artifact cache.
//!
//! External dependencies are compiled once per [`CacheKey`] and published as
//! an immutable bundle. Every package build and check receives a
//! [`CacheEntry`] handle for the current key.
//!
//! In-process callers for the same key share one memoized cell, so a second
//! caller waits for the first build instead of starting its own. Across
//! processes the store's atomic publication decides the winner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backend::{BuildBackend, DependencyBuildRequest};
use crate::cache_key::CacheKey;
use crate::error::{DepotError, Result};
use crate::obs;
use crate::skeleton::DependencySkeleton;
use crate::store::{ArtifactKind, ArtifactStore};
use crate::workspace::Workspace;
use depot_env::EnvironmentDescriptor;

/// Handle to a published dependency bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Published bundle directory. Read-only for consumers.
    pub path: PathBuf,
    /// Whether the entry existed before this call.
    pub reused: bool,
}

/// Builds and memoizes dependency bundles.
pub struct DependencyArtifactCache {
    store: Arc<ArtifactStore>,
    backend: Arc<dyn BuildBackend>,
    env: EnvironmentDescriptor,
    cells: Mutex<HashMap<CacheKey, Arc<OnceCell<CacheEntry>>>>,
    compilations: AtomicUsize,
}

impl DependencyArtifactCache {
    pub fn new(
        store: Arc<ArtifactStore>,
        backend: Arc<dyn BuildBackend>,
        env: EnvironmentDescriptor,
    ) -> Self {
        Self {
            store,
            backend,
            env,
            cells: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Number of dependency compilations started by this instance.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Published entry for the workspace's key, if any, without building.
    pub fn lookup(&self, workspace: &Workspace) -> Result<Option<CacheEntry>> {
        let key = CacheKey::for_workspace(workspace);
        Ok(self.store.lookup(key.digest())?.map(|artifact| CacheEntry {
            key,
            path: artifact.path,
            reused: true,
        }))
    }

    /// Return the entry for the workspace's current key, building it if no
    /// entry is published yet.
    ///
    /// Fails closed: the lock is validated before anything is built, so a
    /// dependency missing from the lock is a resolution error and never an
    /// implicit fetch.
    pub async fn ensure(&self, workspace: &Workspace) -> Result<CacheEntry> {
        workspace.validate_lock()?;
        let key = CacheKey::for_workspace(workspace);

        let cell = {
            let mut cells = self
                .cells
                .lock()
                .map_err(|_| DepotError::Process("dependency cache lock poisoned".to_string()))?;
            cells.entry(key).or_default().clone()
        };

        let initialized_here = AtomicBool::new(false);
        let entry = cell
            .get_or_try_init(|| async {
                initialized_here.store(true, Ordering::SeqCst);
                self.materialize(workspace, key).await
            })
            .await?;

        if initialized_here.load(Ordering::SeqCst) {
            Ok(entry.clone())
        } else {
            obs::emit_cache_hit("dependency_bundle", &key.short());
            Ok(CacheEntry {
                reused: true,
                ..entry.clone()
            })
        }
    }

    async fn materialize(&self, workspace: &Workspace, key: CacheKey) -> Result<CacheEntry> {
        if let Some(artifact) = self.store.lookup(key.digest())? {
            obs::emit_cache_hit("dependency_bundle", &key.short());
            return Ok(CacheEntry {
                key,
                path: artifact.path,
                reused: true,
            });
        }

        let start = Instant::now();
        let skeleton = self.store.staging_dir()?;
        DependencySkeleton::write(workspace, skeleton.path())?;
        let staging = self.store.staging_dir()?;
        let request = DependencyBuildRequest {
            key,
            dependencies: workspace.bundle_dependencies(),
            source_dir: skeleton.path().to_path_buf(),
            output_dir: staging.path().to_path_buf(),
            env: self.env.process_env_vars(),
        };
        let dependency_count = request.dependencies.len();

        self.compilations.fetch_add(1, Ordering::SeqCst);
        obs::emit_task_started("dependency-cache", &key.short());
        let outcome = match self.backend.build_dependencies(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(DepotError::CacheBuild {
                    key: key.to_hex(),
                    diagnostics: err.to_string(),
                })
            }
        };

        if !outcome.success {
            let log = self.store.blobs().put_text(&outcome.diagnostics)?;
            warn!(key = %key.short(), log = %log.short(), "Dependency bundle build failed");
            return Err(DepotError::CacheBuild {
                key: key.to_hex(),
                diagnostics: outcome.diagnostics,
            });
        }

        let published = self.store.publish(
            key.digest(),
            ArtifactKind::DependencyBundle,
            &key.short(),
            staging,
            serde_json::json!({
                "backend": self.backend.name(),
                "dependencies": dependency_count,
                "lock_entries": workspace.lock().packages.len(),
                "environment": self.env.digest().ok(),
            }),
        )?;

        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_cache_built("dependency_bundle", &key.short(), duration_ms);
        info!(key = %key.short(), path = %published.path.display(), "Dependency bundle ready");
        Ok(CacheEntry {
            key,
            path: published.path,
            reused: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeBackend, WorkspaceFixture};
    use depot_env::Platform;

    fn cache(fixture: &WorkspaceFixture, backend: Arc<FakeBackend>) -> DependencyArtifactCache {
        let store = Arc::new(ArtifactStore::open(fixture.store_root()).unwrap());
        DependencyArtifactCache::new(store, backend, EnvironmentDescriptor::empty(Platform::current()))
    }

    #[tokio::test]
    async fn test_builds_once_per_key() {
        let fixture = WorkspaceFixture::new();
        let backend = Arc::new(FakeBackend::new());
        let cache = cache(&fixture, backend.clone());
        let ws = fixture.load();

        let first = cache.ensure(&ws).await.unwrap();
        let second = cache.ensure(&ws).await.unwrap();
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.key, second.key);
        assert_eq!(first.path, second.path);
        assert_eq!(cache.compilations(), 1);
        assert_eq!(backend.dependency_builds(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_build() {
        let fixture = WorkspaceFixture::new();
        let backend = Arc::new(FakeBackend::new().with_delay_ms(50));
        let cache = cache(&fixture, backend.clone());
        let ws = fixture.load();

        let results = ensure_three(&cache, &ws).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(backend.dependency_builds(), 1);
    }

    async fn ensure_three(
        cache: &DependencyArtifactCache,
        ws: &Workspace,
    ) -> Vec<Result<CacheEntry>> {
        let (a, b, c) = tokio::join!(cache.ensure(ws), cache.ensure(ws), cache.ensure(ws));
        vec![a, b, c]
    }

    #[tokio::test]
    async fn test_reuses_entry_across_instances() {
        let fixture = WorkspaceFixture::new();
        let backend = Arc::new(FakeBackend::new());
        let ws = fixture.load();
        cache(&fixture, backend.clone()).ensure(&ws).await.unwrap();

        let fresh = cache(&fixture, backend.clone());
        let entry = fresh.ensure(&ws).await.unwrap();
        assert!(entry.reused);
        assert_eq!(fresh.compilations(), 0);
        assert_eq!(backend.dependency_builds(), 1);
    }

    #[tokio::test]
    async fn test_failure_publishes_nothing_and_retry_rebuilds() {
        let fixture = WorkspaceFixture::new();
        let backend = Arc::new(FakeBackend::new());
        backend.fail_dependencies(true);
        let cache = cache(&fixture, backend.clone());
        let ws = fixture.load();

        let err = cache.ensure(&ws).await.unwrap_err();
        assert!(matches!(err, DepotError::CacheBuild { .. }));
        assert!(err.is_fatal());
        assert!(cache.lookup(&ws).unwrap().is_none());

        backend.fail_dependencies(false);
        let entry = cache.ensure(&ws).await.unwrap();
        assert!(!entry.reused);
        assert_eq!(backend.dependency_builds(), 2);
    }

    #[tokio::test]
    async fn test_unlocked_dependency_fails_before_build() {
        let fixture = WorkspaceFixture::new();
        fixture.add_dependency("alpha", "left-pad = \"1.0\"");
        let backend = Arc::new(FakeBackend::new());
        let cache = cache(&fixture, backend.clone());

        let err = cache.ensure(&fixture.load()).await.unwrap_err();
        assert!(matches!(err, DepotError::Resolution(_)));
        assert_eq!(backend.dependency_builds(), 0);
        assert_eq!(cache.compilations(), 0);
    }

    #[tokio::test]
    async fn test_bundle_covers_member_dependencies() {
        let fixture = WorkspaceFixture::new();
        fixture.add_dependency("beta", "log = \"0.4\"");
        let backend = Arc::new(FakeBackend::new());
        let cache = cache(&fixture, backend.clone());

        let entry = cache.ensure(&fixture.load()).await.unwrap();
        let deps = entry.path.join("target/release/deps");
        for lib in ["libcrossbeam.rlib", "liblog.rlib", "libserde.rlib"] {
            assert!(deps.join(lib).is_file(), "{} missing from bundle", lib);
        }
        assert!(!deps.join("libcommon.rlib").exists());

        let skeleton = backend.skeleton_files();
        assert!(skeleton.contains(&PathBuf::from("Cargo.lock")));
        assert!(skeleton.contains(&PathBuf::from("crates/beta/Cargo.toml")));
        assert!(skeleton.contains(&PathBuf::from("crates/workspace-hack/Cargo.toml")));
    }

    #[tokio::test]
    async fn test_requirement_outside_pin_fails_before_build() {
        let fixture = WorkspaceFixture::new();
        fixture.add_dependency("beta", "log = \"0.3\"");
        let backend = Arc::new(FakeBackend::new());
        let cache = cache(&fixture, backend.clone());

        let err = cache.ensure(&fixture.load()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("pins 0.4.21"));
        assert_eq!(backend.dependency_builds(), 0);
    }

    #[tokio::test]
    async fn test_lock_change_builds_new_entry() {
        let fixture = WorkspaceFixture::new();
        let backend = Arc::new(FakeBackend::new());
        let cache = cache(&fixture, backend.clone());

        let before = cache.ensure(&fixture.load()).await.unwrap();
        fixture.bump_lock("serde", "1.0.197", "1.0.198");
        let after = cache.ensure(&fixture.load()).await.unwrap();

        assert_ne!(before.key, after.key);
        assert!(!after.reused);
        assert_eq!(backend.dependency_builds(), 2);
        assert!(before.path.exists());
    }
}
