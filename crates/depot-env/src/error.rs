//! Error types for depot-env.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while describing the provisioned environment.
#[derive(Error, Debug)]
pub enum EnvError {
    /// One or more native libraries could not be located under any prefix.
    #[error("native libraries not provisioned: {} (searched {})", missing.join(", "), display_paths(searched))]
    LibrariesMissing {
        missing: Vec<String>,
        searched: Vec<PathBuf>,
    },

    /// A provider prefix does not exist.
    #[error("provider prefix not found: {0}")]
    PrefixNotFound(PathBuf),

    /// Library name is not usable as a link name.
    #[error("invalid native library name: {0:?}")]
    InvalidLibraryName(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no prefixes".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
