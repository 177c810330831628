//! Error taxonomy for depot.
//!
//! Resolution and cache-build errors are fatal to a run; build and check
//! failures are scoped to their task and collected into the run report.
//! Environment errors are attributed to native library provisioning.

use std::path::PathBuf;

use crate::cas::CasError;

/// Workspace membership or lock consistency violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("package '{package}' is not a member of the workspace")]
    UnknownPackage { package: String },

    #[error("package '{package}' declares dependency '{dependency}' which is not pinned in the lock artifact")]
    UnlockedDependency { package: String, dependency: String },

    #[error("package '{package}' requires {dependency} {requirement} but the lock artifact pins {pinned}")]
    VersionMismatch {
        package: String,
        dependency: String,
        requirement: String,
        pinned: String,
    },

    #[error("workspace dependency '{dependency}' is referenced by '{package}' but not declared in [workspace.dependencies]")]
    UndeclaredWorkspaceDependency { package: String, dependency: String },

    #[error("duplicate package name '{name}' in workspace")]
    DuplicatePackage { name: String },

    #[error("lock artifact not found at {0}")]
    MissingLock(PathBuf),

    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("invalid lock artifact {path}: {reason}")]
    InvalidLock { path: PathBuf, reason: String },
}

/// Coarse classification used for reporting and exit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Resolution,
    CacheBuild,
    Build,
    Check,
    Environment,
    Infrastructure,
}

/// Depot errors.
#[derive(Debug, thiserror::Error)]
pub enum DepotError {
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("dependency cache build failed for key {key}: {diagnostics}")]
    CacheBuild { key: String, diagnostics: String },

    #[error("build of '{package}' failed: {diagnostics}")]
    Build { package: String, diagnostics: String },

    #[error("check '{check}' failed with {} finding(s)", findings.len())]
    CheckFailure { check: String, findings: Vec<String> },

    #[error("environment error (native library provisioning) for '{task}': {detail}")]
    Environment { task: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] CasError),

    #[error("process error: {0}")]
    Process(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DepotError {
    /// Classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DepotError::Resolution(_) => ErrorCategory::Resolution,
            DepotError::CacheBuild { .. } => ErrorCategory::CacheBuild,
            DepotError::Build { .. } => ErrorCategory::Build,
            DepotError::CheckFailure { .. } => ErrorCategory::Check,
            DepotError::Environment { .. } => ErrorCategory::Environment,
            DepotError::Config(_)
            | DepotError::Store(_)
            | DepotError::Process(_)
            | DepotError::Serialization(_)
            | DepotError::Io(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Fatal errors halt the whole run: no task can proceed without a
    /// consistent dependency graph and a published dependency cache.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Resolution | ErrorCategory::CacheBuild
        )
    }
}

impl From<depot_env::EnvError> for DepotError {
    fn from(err: depot_env::EnvError) -> Self {
        DepotError::Environment {
            task: "environment".to_string(),
            detail: err.to_string(),
        }
    }
}

/// Result type for depot operations.
pub type Result<T> = std::result::Result<T, DepotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let resolution: DepotError = ResolutionError::UnknownPackage {
            package: "ghost".to_string(),
        }
        .into();
        assert!(resolution.is_fatal());

        let cache = DepotError::CacheBuild {
            key: "abc".to_string(),
            diagnostics: "linker failed".to_string(),
        };
        assert!(cache.is_fatal());

        let build = DepotError::Build {
            package: "player".to_string(),
            diagnostics: "E0308".to_string(),
        };
        assert!(!build.is_fatal());
        assert_eq!(build.category(), ErrorCategory::Build);

        let env = DepotError::Environment {
            task: "player".to_string(),
            detail: "libjack missing".to_string(),
        };
        assert!(!env.is_fatal());
        assert_eq!(env.category(), ErrorCategory::Environment);
    }

    #[test]
    fn test_unlocked_dependency_message_names_both() {
        let err = ResolutionError::UnlockedDependency {
            package: "library".to_string(),
            dependency: "metaflac".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("library"));
        assert!(msg.contains("metaflac"));
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let err: DepotError = ResolutionError::VersionMismatch {
            package: "library".to_string(),
            dependency: "serde".to_string(),
            requirement: "1.1".to_string(),
            pinned: "1.0.197".to_string(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("pins 1.0.197"));
    }

    #[test]
    fn test_env_error_maps_to_environment() {
        let err: DepotError = depot_env::EnvError::LibrariesMissing {
            missing: vec!["jack".to_string()],
            searched: vec![],
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::Environment);
        assert!(err.to_string().contains("jack"));
    }
}
