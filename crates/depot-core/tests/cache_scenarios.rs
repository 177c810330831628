//! Integration tests for the dependency cache and package builds.

use std::sync::Arc;

use depot_core::fakes::{FakeBackend, WorkspaceFixture};
use depot_core::{
    ArtifactStore, CacheKey, DependencyArtifactCache, DepotError, PackageBuilder,
    SourceFileSetResolver,
};
use depot_env::{EnvironmentDescriptor, Platform};

struct Env {
    fixture: WorkspaceFixture,
    backend: Arc<FakeBackend>,
    store: Arc<ArtifactStore>,
    cache: DependencyArtifactCache,
    builder: PackageBuilder,
}

fn setup() -> Env {
    let fixture = WorkspaceFixture::new();
    let backend = Arc::new(FakeBackend::new());
    let store = Arc::new(ArtifactStore::open(fixture.store_root()).expect("open store"));
    let env = EnvironmentDescriptor::empty(Platform::current());
    let cache = DependencyArtifactCache::new(store.clone(), backend.clone(), env.clone());
    let builder = PackageBuilder::new(store.clone(), backend.clone(), env);
    Env {
        fixture,
        backend,
        store,
        cache,
        builder,
    }
}

/// Building a second package reuses the cache: zero extra dependency builds.
#[tokio::test]
async fn test_second_package_reuses_dependency_cache() {
    let env = setup();
    let ws = env.fixture.load();

    let entry = env.cache.ensure(&ws).await.expect("cache");
    env.builder.build(&ws, "alpha", &entry).await.expect("alpha");
    assert_eq!(env.backend.dependency_builds(), 1);

    let entry = env.cache.ensure(&ws).await.expect("cache again");
    assert!(entry.reused);
    env.builder.build(&ws, "beta", &entry).await.expect("beta");

    assert_eq!(env.backend.dependency_builds(), 1, "no additional dependency compilation");
    assert_eq!(env.cache.compilations(), 1);
}

/// A lock change yields a new key whose entry is built before the package.
#[tokio::test]
async fn test_lock_change_rebuilds_before_package() {
    let env = setup();
    let ws = env.fixture.load();
    let old = env.cache.ensure(&ws).await.expect("cache");
    env.builder.build(&ws, "alpha", &old).await.expect("alpha");

    env.fixture.bump_lock("crossbeam", "0.8.4", "0.8.5");
    let ws = env.fixture.load();
    assert!(env.cache.lookup(&ws).expect("lookup").is_none());

    let new = env.cache.ensure(&ws).await.expect("new cache");
    assert_ne!(old.key, new.key);
    assert!(!new.reused);
    assert_eq!(env.backend.dependency_builds(), 2);

    let rebuilt = env.builder.build(&ws, "alpha", &new).await.expect("alpha rebuild");
    assert!(!rebuilt.cached, "new cache key means a new build key");
    assert_eq!(env.backend.package_builds("alpha"), 2);
}

/// Editing one package never changes another package's inputs or output.
#[tokio::test]
async fn test_isolation_between_packages() {
    let env = setup();
    let ws = env.fixture.load();
    let entry = env.cache.ensure(&ws).await.expect("cache");
    let alpha = env.builder.build(&ws, "alpha", &entry).await.expect("alpha");

    env.fixture.write("crates/beta/src/lib.rs", "pub fn beta() -> u32 { 99 }\n");
    let ws = env.fixture.load();
    assert_eq!(CacheKey::for_workspace(&ws), entry.key);

    let again = env.builder.build(&ws, "alpha", &entry).await.expect("alpha again");
    assert!(again.cached);
    assert_eq!(alpha.key, again.key);
    assert_eq!(env.backend.package_builds("alpha"), 1);
}

/// Identical inputs in two fresh stores produce identical outputs.
#[tokio::test]
async fn test_builds_are_deterministic() {
    let first = setup();
    let second = setup();

    let mut digests = Vec::new();
    for env in [&first, &second] {
        let ws = env.fixture.load();
        let entry = env.cache.ensure(&ws).await.expect("cache");
        let outcome = env.builder.build(&ws, "gamma", &entry).await.expect("gamma");
        let files: Vec<_> = outcome
            .artifact
            .manifest
            .files
            .iter()
            .map(|f| (f.path.clone(), f.digest))
            .collect();
        digests.push((outcome.key, files));
    }
    assert_eq!(digests[0], digests[1]);
}

/// A dependency absent from the lock fails before any compilation.
#[tokio::test]
async fn test_fail_closed_on_unpinned_dependency() {
    let env = setup();
    env.fixture.add_dependency("gamma", "regex = \"1\"");
    let ws = env.fixture.load();

    let err = env.cache.ensure(&ws).await.expect_err("must fail closed");
    assert!(err.is_fatal());
    assert!(matches!(err, DepotError::Resolution(_)));
    assert_eq!(env.backend.dependency_builds(), 0);
    assert_eq!(env.backend.total_package_builds(), 0);
}

/// The package's current artifact is always the latest successful build.
#[tokio::test]
async fn test_store_pointer_tracks_latest_build() {
    let env = setup();
    let ws = env.fixture.load();
    let entry = env.cache.ensure(&ws).await.expect("cache");
    let v1 = env.builder.build(&ws, "gamma", &entry).await.expect("v1");

    env.fixture.write("crates/gamma/src/lib.rs", "pub fn gamma() { let _ = 1; }\n");
    let ws = env.fixture.load();
    let v2 = env.builder.build(&ws, "gamma", &entry).await.expect("v2");
    assert_ne!(v1.key, v2.key);

    let current = env
        .store
        .package_artifact("gamma")
        .expect("pointer")
        .expect("recorded");
    assert_eq!(current.manifest.key, v2.key);
    assert!(v2.executable().is_some());
}

/// Shared common code is part of every package's source set.
#[test]
fn test_shared_code_in_every_source_set() {
    let fixture = WorkspaceFixture::new();
    let ws = fixture.load();
    let resolver = SourceFileSetResolver::new(&ws);
    for package in ws.buildable() {
        let set = resolver.resolve_package(package).expect("resolve");
        assert!(set.contains(std::path::Path::new("crates/common/src/lib.rs")));
        assert!(set.contains(std::path::Path::new("Cargo.lock")));
    }
}
