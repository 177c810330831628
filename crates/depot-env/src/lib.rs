//! Depot-Env: native library provisioning description for depot.
//!
//! This crate provides the environment layer for depot. It does not
//! install anything: native audio, windowing and GUI libraries are
//! supplied by the host. It locates them, derives the library search
//! path and the platform runtime library path variable, and reports
//! missing libraries as a provisioning problem rather than a build bug.

pub mod error;
pub mod platform;
pub mod provision;

pub use error::EnvError;
pub use platform::{OsFamily, Platform};
pub use provision::{
    provision, EnvironmentConfig, EnvironmentDescriptor, ResolvedLibrary, LIBRARY_PATH_VAR,
};

use std::process::Command;

/// Result type for environment operations.
pub type Result<T> = std::result::Result<T, EnvError>;

/// Check if a tool is available on `PATH`.
pub fn is_tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check if cargo is available.
pub fn is_cargo_available() -> bool {
    is_tool_available("cargo")
}
