//! Build backends.
//!
//! A backend turns a pinned dependency set into a dependency bundle, and a
//! staged package source tree plus a bundle into package outputs. The
//! orchestration above it owns keys, staging and publication.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache_key::CacheKey;
use crate::error::{DepotError, Result};
use crate::exec::{run_command, CommandSpec};
use crate::manifest::DependencySpec;

/// Profile the dependency bundle, package builds and checks compile in.
///
/// Checks point cargo at a copy of the bundle, so they only reuse its
/// artifacts when they run in this same profile.
pub const BUILD_PROFILE: &str = "release";

/// Inputs for building the dependency bundle of one cache key.
#[derive(Debug, Clone)]
pub struct DependencyBuildRequest {
    pub key: CacheKey,
    /// External dependencies of every member, merged by package name.
    pub dependencies: BTreeMap<String, DependencySpec>,
    /// Dependency skeleton of the workspace (see [`crate::skeleton`]).
    pub source_dir: PathBuf,
    /// Empty directory the bundle is written into.
    pub output_dir: PathBuf,
    /// Provisioned environment variables.
    pub env: BTreeMap<String, String>,
}

/// Inputs for building one package.
#[derive(Debug, Clone)]
pub struct PackageBuildRequest {
    pub package: String,
    /// Staged source set (a workspace root containing only that set).
    pub source_dir: PathBuf,
    /// Private copy of the dependency bundle, used as the target directory.
    pub target_dir: PathBuf,
    /// Empty directory for the package outputs.
    pub output_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Result of a backend invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOutcome {
    pub success: bool,
    /// Compiler output, kept for reports on failure.
    pub diagnostics: String,
}

impl BackendOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            diagnostics: String::new(),
        }
    }

    pub fn failed(diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Compiles dependency bundles and packages.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Backend name, recorded in artifact metadata.
    fn name(&self) -> &str;

    /// Compile every external dependency into `request.output_dir`.
    async fn build_dependencies(&self, request: &DependencyBuildRequest) -> Result<BackendOutcome>;

    /// Compile one package into `request.output_dir`. Never runs tests.
    async fn build_package(&self, request: &PackageBuildRequest) -> Result<BackendOutcome>;
}

/// Backend driving `cargo`.
///
/// The bundle is compiled in the workspace skeleton: sources are fetched
/// once against the lock (`--locked`), then every build runs `--frozen`
/// or `--offline`, so nothing is re-resolved or downloaded mid-build.
pub struct CargoBackend {
    cargo: String,
    profile: String,
    timeout_secs: u64,
}

impl Default for CargoBackend {
    fn default() -> Self {
        Self {
            cargo: "cargo".to_string(),
            profile: BUILD_PROFILE.to_string(),
            timeout_secs: 0,
        }
    }
}

impl CargoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn command(&self, name: &str, args: &[&str], env: &BTreeMap<String, String>) -> CommandSpec {
        CommandSpec {
            name: name.to_string(),
            program: self.cargo.clone(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: env.clone(),
            cwd: None,
            timeout_secs: self.timeout_secs,
        }
    }

    fn profile_dir(&self) -> &str {
        if self.profile == "dev" {
            "debug"
        } else {
            &self.profile
        }
    }

    /// Commands that compile a bundle, in order.
    ///
    /// Check-mode metadata is built next to the full artifacts because lint
    /// and doc tasks only consume the former.
    pub fn dependency_commands(&self, request: &DependencyBuildRequest) -> Vec<CommandSpec> {
        let target = path_arg(&request.output_dir.join("target"));
        let compile = |name: &str, subcommand: &str| {
            self.command(
                name,
                &[
                    subcommand,
                    "--frozen",
                    "--workspace",
                    "--all-targets",
                    "--profile",
                    self.profile.as_str(),
                    "--target-dir",
                    target.as_str(),
                ],
                &request.env,
            )
            .with_cwd(&request.source_dir)
        };
        vec![
            self.command("dependency-fetch", &["fetch", "--locked"], &request.env)
                .with_cwd(&request.source_dir),
            compile("dependency-check", "check"),
            compile("dependency-bundle", "build"),
        ]
    }

    /// Command that compiles one staged package.
    ///
    /// The staged tree omits sibling members, so cargo prunes them from its
    /// copy of the lock and `--locked` would refuse. `--offline` still
    /// forbids any fetch, and requirements are matched against the pins
    /// before the run starts.
    pub fn package_command(&self, request: &PackageBuildRequest) -> CommandSpec {
        let target = path_arg(&request.target_dir.join("target"));
        self.command(
            &format!("build-{}", request.package),
            &[
                "build",
                "--offline",
                "--profile",
                self.profile.as_str(),
                "--package",
                request.package.as_str(),
                "--target-dir",
                target.as_str(),
            ],
            &request.env,
        )
        .with_cwd(&request.source_dir)
    }
}

#[async_trait]
impl BuildBackend for CargoBackend {
    fn name(&self) -> &str {
        "cargo"
    }

    async fn build_dependencies(&self, request: &DependencyBuildRequest) -> Result<BackendOutcome> {
        info!(key = %request.key.short(), deps = request.dependencies.len(), "Compiling dependency bundle");
        let mut diagnostics = String::new();
        for spec in self.dependency_commands(request) {
            let output = run_command(&spec).await?;
            diagnostics.push_str(&output.combined());
            if !output.success {
                debug!(step = %spec.name, "Dependency bundle step failed");
                return Ok(BackendOutcome::failed(diagnostics));
            }
        }
        Ok(BackendOutcome {
            success: true,
            diagnostics,
        })
    }

    async fn build_package(&self, request: &PackageBuildRequest) -> Result<BackendOutcome> {
        let target = request.target_dir.join("target");
        let output = run_command(&self.package_command(request)).await?;
        if !output.success {
            return Ok(BackendOutcome::failed(output.combined()));
        }

        let produced = collect_outputs(&target.join(self.profile_dir()), &request.package)?;
        if produced.is_empty() {
            return Err(DepotError::Build {
                package: request.package.clone(),
                diagnostics: "compiler reported success but produced no outputs".to_string(),
            });
        }
        for file in &produced {
            if let Some(name) = file.file_name() {
                std::fs::copy(file, request.output_dir.join(name))?;
            }
        }
        debug!(package = %request.package, outputs = produced.len(), "Collected package outputs");
        Ok(BackendOutcome {
            success: true,
            diagnostics: output.combined(),
        })
    }
}

/// Top-level output files belonging to `package` in a profile directory.
fn collect_outputs(profile_dir: &Path, package: &str) -> Result<Vec<PathBuf>> {
    let crate_name = package.replace('-', "_");
    let lib_prefix = format!("lib{}.", crate_name);
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(profile_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let stem = name.split('.').next().unwrap_or_default();
        let is_bin = stem == package && !name.ends_with(".d");
        let is_lib = name.starts_with(&lib_prefix) && !name.ends_with(".d");
        if is_bin || is_lib {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn dependency_request() -> DependencyBuildRequest {
        let mut dependencies = BTreeMap::new();
        let serde = DependencySpec {
            package: "serde".to_string(),
            version: Some("1.0".to_string()),
            path: None,
            workspace: false,
            features: ["derive".to_string()].into_iter().collect::<BTreeSet<_>>(),
            default_features: true,
            optional: false,
        };
        dependencies.insert("serde".to_string(), serde);
        DependencyBuildRequest {
            key: CacheKey::from_canonical(b"m", b"", b"l"),
            dependencies,
            source_dir: PathBuf::from("/work/skeleton"),
            output_dir: PathBuf::from("/work/bundle"),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_dependency_commands_fetch_locked_then_build_frozen() {
        let commands = CargoBackend::new().dependency_commands(&dependency_request());
        let names: Vec<_> = commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["dependency-fetch", "dependency-check", "dependency-bundle"]
        );

        assert_eq!(commands[0].args, vec!["fetch", "--locked"]);
        for compile in &commands[1..] {
            assert!(compile.args.contains(&"--frozen".to_string()));
            assert!(compile.args.contains(&"--workspace".to_string()));
            assert!(compile.display().contains("--target-dir /work/bundle/target"));
        }
        assert!(commands
            .iter()
            .all(|c| c.cwd.as_deref() == Some(Path::new("/work/skeleton"))));
    }

    #[test]
    fn test_bundle_and_package_share_profile() {
        let backend = CargoBackend::new();
        let bundle = backend.dependency_commands(&dependency_request());
        let package = backend.package_command(&PackageBuildRequest {
            package: "alpha".to_string(),
            source_dir: PathBuf::from("/work/staged"),
            target_dir: PathBuf::from("/work/target-copy"),
            output_dir: PathBuf::from("/work/out"),
            env: BTreeMap::new(),
        });

        let expected = format!("--profile {}", BUILD_PROFILE);
        assert!(bundle[2].display().contains(&expected));
        assert!(package.display().contains(&expected));
        assert!(package.args.contains(&"--offline".to_string()));
        assert_eq!(package.cwd.as_deref(), Some(Path::new("/work/staged")));
    }

    #[test]
    fn test_collect_outputs_filters_by_package() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "libmy_server.rlib",
            "libmy_server.d",
            "my-server",
            "my-server.d",
            "libother.rlib",
        ] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let found = collect_outputs(dir.path(), "my-server").unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["libmy_server.rlib", "my-server"]);
    }

    #[test]
    fn test_collect_outputs_missing_dir() {
        let found = collect_outputs(Path::new("/definitely/missing"), "x").unwrap();
        assert!(found.is_empty());
    }
}
