//! Fakes for tests (testing only)
//!
//! `FakeBackend` stands in for cargo and counts every compilation.
//! `WorkspaceFixture` writes a small workspace into a temporary directory:
//! three packages (`alpha`, `beta`, `gamma`), a shared `common` package and
//! the `workspace-hack` aggregation package.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::backend::{BackendOutcome, BuildBackend, DependencyBuildRequest, PackageBuildRequest};
use crate::cas::DigestBuilder;
use crate::error::Result;
use crate::workspace::{Workspace, WorkspaceConfig, WorkspaceDescriptor};

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BackendState {
    dependency_builds: usize,
    package_builds: HashMap<String, usize>,
    fail_dependencies: bool,
    failing_packages: HashMap<String, String>,
    staged: HashMap<String, Vec<PathBuf>>,
    skeleton: Vec<PathBuf>,
}

/// In-memory build backend with failure injection.
///
/// Outputs are derived from the staged inputs only, so identical inputs
/// always produce byte-identical outputs.
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
    delay: Option<Duration>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every dependency build.
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    pub fn dependency_builds(&self) -> usize {
        self.state.lock().unwrap().dependency_builds
    }

    pub fn package_builds(&self, package: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .package_builds
            .get(package)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_package_builds(&self) -> usize {
        self.state.lock().unwrap().package_builds.values().sum()
    }

    pub fn fail_dependencies(&self, fail: bool) {
        self.state.lock().unwrap().fail_dependencies = fail;
    }

    /// Make builds of `package` fail with `diagnostics`.
    pub fn fail_package(&self, package: &str, diagnostics: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_packages
            .insert(package.to_string(), diagnostics.to_string());
    }

    /// Relative files of the skeleton the last dependency build saw.
    pub fn skeleton_files(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().skeleton.clone()
    }

    /// Relative files the last build of `package` could see.
    pub fn staged_files(&self, package: &str) -> Vec<PathBuf> {
        self.state
            .lock()
            .unwrap()
            .staged
            .get(package)
            .cloned()
            .unwrap_or_default()
    }
}

fn relative_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

#[async_trait]
impl BuildBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn build_dependencies(&self, request: &DependencyBuildRequest) -> Result<BackendOutcome> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.dependency_builds += 1;
            state.skeleton = relative_files(&request.source_dir);
            state.fail_dependencies
        };
        if fail {
            return Ok(BackendOutcome::failed(
                "error: failed to compile `serde v1.0.197`",
            ));
        }

        let deps = request.output_dir.join("target/release/deps");
        std::fs::create_dir_all(&deps)?;
        for (key, spec) in &request.dependencies {
            let content = format!("{}:{:?}:{}", spec.package, spec.version, request.key);
            std::fs::write(deps.join(format!("lib{}.rlib", key.replace('-', "_"))), content)?;
        }
        Ok(BackendOutcome::ok())
    }

    async fn build_package(&self, request: &PackageBuildRequest) -> Result<BackendOutcome> {
        let staged = relative_files(&request.source_dir);
        let failure = {
            let mut state = self.state.lock().unwrap();
            *state
                .package_builds
                .entry(request.package.clone())
                .or_default() += 1;
            state.staged.insert(request.package.clone(), staged.clone());
            state.failing_packages.get(&request.package).cloned()
        };
        if let Some(diagnostics) = failure {
            return Ok(BackendOutcome::failed(diagnostics));
        }

        let mut builder = DigestBuilder::new("fake-output");
        for file in &staged {
            builder.update_field("path", file.to_string_lossy().as_bytes());
            builder.update_field("content", &std::fs::read(request.source_dir.join(file))?);
        }
        for file in relative_files(&request.target_dir) {
            builder.update_field("dep", file.to_string_lossy().as_bytes());
        }
        let digest = builder.finish();

        let crate_name = request.package.replace('-', "_");
        std::fs::write(
            request.output_dir.join(format!("lib{}.rlib", crate_name)),
            digest.to_hex(),
        )?;
        let main = Path::new("crates").join(&request.package).join("src/main.rs");
        if staged.contains(&main) {
            std::fs::write(
                request.output_dir.join(&request.package),
                format!("#!/bin/sh\necho {}\n", request.package),
            )?;
        }
        Ok(BackendOutcome::ok())
    }
}

// ---------------------------------------------------------------------------
// WorkspaceFixture
// ---------------------------------------------------------------------------

const ROOT_MANIFEST: &str = r#"[workspace]
resolver = "2"
members = ["crates/*"]
exclude = ["crates/scratch"]

[workspace.dependencies]
serde = { version = "1.0", features = ["derive"] }
crossbeam = "0.8"
"#;

const LOCK: &str = r#"# This file is automatically @generated by Cargo.
# It is not intended for manual editing.
version = 3

[[package]]
name = "alpha"
version = "0.1.0"
dependencies = [
 "common",
 "serde",
]

[[package]]
name = "beta"
version = "0.1.0"
dependencies = [
 "common",
 "crossbeam",
]

[[package]]
name = "common"
version = "0.1.0"
dependencies = [
 "serde",
]

[[package]]
name = "crossbeam"
version = "0.8.4"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "1137cd7e7fc0fb5d3c5a8678be38ec56e819125d8d7907411fe24ccb943faca8"

[[package]]
name = "gamma"
version = "0.1.0"
dependencies = [
 "serde",
]

[[package]]
name = "log"
version = "0.4.21"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "90ed8c1e510134f979dbc4f070f87d4313098b704861a105fe34231c70a3901c"

[[package]]
name = "serde"
version = "1.0.197"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "3fb1c873e1b9b056a4dc4c0c198b24c3ffa059243875552b2bd0933b1aee4ce2"

[[package]]
name = "workspace-hack"
version = "0.1.0"
dependencies = [
 "crossbeam",
 "serde",
]
"#;

/// Temporary workspace on disk plus a separate store directory.
pub struct WorkspaceFixture {
    root: TempDir,
    store: TempDir,
}

impl Default for WorkspaceFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceFixture {
    pub fn new() -> Self {
        let fixture = Self {
            root: tempfile::tempdir().unwrap(),
            store: tempfile::tempdir().unwrap(),
        };
        fixture.write("Cargo.toml", ROOT_MANIFEST);
        fixture.write("Cargo.lock", LOCK);

        fixture.package(
            "common",
            "serde.workspace = true\n",
            "pub fn shared() -> u32 { 7 }\n",
        );
        fixture.package(
            "workspace-hack",
            "serde = { version = \"1.0\", features = [\"derive\"] }\ncrossbeam = \"0.8\"\n",
            "",
        );
        fixture.package(
            "alpha",
            "serde.workspace = true\ncommon = { path = \"../common\" }\n",
            "pub fn alpha() -> u32 { common::shared() }\n",
        );
        fixture.package(
            "beta",
            "crossbeam.workspace = true\ncommon = { path = \"../common\" }\n",
            "pub fn beta() -> u32 { common::shared() + 1 }\n",
        );
        fixture.package("gamma", "serde.workspace = true\n", "pub fn gamma() {}\n");
        fixture.write("crates/gamma/src/main.rs", "fn main() { gamma::gamma() }\n");
        fixture
    }

    /// Write `crates/<name>` with a manifest whose last table is
    /// `[dependencies]`, so [`add_dependency`](Self::add_dependency) can append.
    fn package(&self, name: &str, dependencies: &str, lib: &str) {
        self.write(
            &format!("crates/{}/Cargo.toml", name),
            &format!(
                "[package]\nname = \"{}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[dependencies]\n{}",
                name, dependencies
            ),
        );
        self.write(&format!("crates/{}/src/lib.rs", name), lib);
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Store directory, outside the workspace tree.
    pub fn store_root(&self) -> PathBuf {
        self.store.path().join("store")
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.root.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.root.path().join(relative)).unwrap()
    }

    /// Append a `[dependencies]` line to `package`'s manifest.
    pub fn add_dependency(&self, package: &str, line: &str) {
        let relative = format!("crates/{}/Cargo.toml", package);
        let mut manifest = self.read(&relative);
        manifest.push_str(line);
        manifest.push('\n');
        self.write(&relative, &manifest);
    }

    /// Change the pinned version of `name` in the lock.
    pub fn bump_lock(&self, name: &str, from: &str, to: &str) {
        let lock = self.read("Cargo.lock");
        let needle = format!("name = \"{}\"\nversion = \"{}\"", name, from);
        assert!(lock.contains(&needle), "{} {} not pinned", name, from);
        let replacement = format!("name = \"{}\"\nversion = \"{}\"", name, to);
        self.write("Cargo.lock", &lock.replace(&needle, &replacement));
    }

    /// Load with the default workspace configuration.
    pub fn load(&self) -> Workspace {
        WorkspaceDescriptor::load(self.root(), &WorkspaceConfig::default()).unwrap()
    }
}
