//! Depot Core Library
//!
//! Workspace model, dependency artifact cache, package builds and the
//! artifact store. Checks and run orchestration live in `depot-ci`.

pub mod backend;
pub mod build;
pub mod cache_key;
pub mod cas;
pub mod config;
pub mod dep_cache;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod graph;
pub mod lockfile;
pub mod manifest;
pub mod obs;
pub mod skeleton;
pub mod source_set;
pub mod store;
pub mod telemetry;
pub mod workspace;

pub use backend::{
    BackendOutcome, BuildBackend, CargoBackend, DependencyBuildRequest, PackageBuildRequest,
    BUILD_PROFILE,
};
pub use build::{build_key, classify_failure, BuildOutcome, BuildSummary, PackageBuilder};
pub use cache_key::CacheKey;
pub use cas::fs::FsCasStore;
pub use cas::{CasError, CasStore, Digest, DigestBuilder};
pub use config::{ChecksConfig, DepotConfig, StoreConfig};
pub use dep_cache::{CacheEntry, DependencyArtifactCache};
pub use error::{DepotError, ErrorCategory, ResolutionError, Result};
pub use exec::{run_command, CommandOutput, CommandSpec};
pub use graph::{GraphError, TaskGraph, TaskId, TaskKind, TaskNode};
pub use lockfile::{LockArtifact, LockedPackage};
pub use manifest::{DependencySpec, PackageManifest, RootManifest};
pub use skeleton::DependencySkeleton;
pub use source_set::{SourceFileSet, SourceFileSetResolver};
pub use store::{ArtifactKind, ArtifactManifest, ArtifactStore, PublishedArtifact};
pub use telemetry::init_tracing;
pub use workspace::{Package, Workspace, WorkspaceConfig, WorkspaceDescriptor};
