//! Environment descriptor assembly.
//!
//! Native libraries are supplied by the host (a Nix profile, a distro
//! package set, a vendored sysroot). This module only *describes* them:
//! it locates each required library under the configured provider
//! prefixes and derives the link-time search path plus the runtime
//! library path variable the dynamic loader reads.

use crate::error::EnvError;
use crate::platform::Platform;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Link-time library search path variable read by the linker driver.
pub const LIBRARY_PATH_VAR: &str = "LIBRARY_PATH";

/// Library subdirectories searched under every prefix.
const LIBRARY_SUBDIRS: &[&str] = &["lib", "lib64"];

/// Environment provisioning configuration (`[environment]` in `depot.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Link names of native libraries required at build or run time
    /// (e.g. `jack`, `asound`, `xkbcommon`, `GL`).
    pub native_libraries: Vec<String>,
    /// Provider prefixes holding `lib/` or `lib64/` directories.
    pub prefixes: Vec<PathBuf>,
    /// Extra variables injected verbatim into every task environment.
    pub extra_vars: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    /// Create a config requiring `libraries` from `prefixes`.
    pub fn new(libraries: &[&str], prefixes: &[PathBuf]) -> Self {
        EnvironmentConfig {
            native_libraries: libraries.iter().map(|l| l.to_string()).collect(),
            prefixes: prefixes.to_vec(),
            extra_vars: BTreeMap::new(),
        }
    }
}

/// A native library located under a provider prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLibrary {
    /// Link name.
    pub name: String,
    /// Directory containing the library file.
    pub dir: PathBuf,
    /// File that satisfied the lookup.
    pub file: PathBuf,
}

/// Reproducible description of the build/run environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Host platform.
    pub platform: Platform,
    /// Libraries in configuration order.
    pub libraries: Vec<ResolvedLibrary>,
    /// Deduplicated library directories, in first-seen order.
    pub library_path: Vec<PathBuf>,
    /// Runtime library path variable for this platform.
    pub runtime_path_var: String,
    /// Extra configured variables.
    pub extra_vars: BTreeMap<String, String>,
}

impl EnvironmentDescriptor {
    /// Descriptor with no native requirements.
    pub fn empty(platform: Platform) -> Self {
        EnvironmentDescriptor {
            runtime_path_var: platform.runtime_path_var().to_string(),
            platform,
            libraries: Vec::new(),
            library_path: Vec::new(),
            extra_vars: BTreeMap::new(),
        }
    }

    /// Search path joined with the platform separator.
    pub fn joined_library_path(&self) -> String {
        let sep = self.platform.path_separator().to_string();
        self.library_path
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(&sep)
    }

    /// Variables to set for a task.
    ///
    /// The runtime path is injected in front of `existing_runtime_path`
    /// (the caller's current value of the runtime variable, if any).
    pub fn env_vars(&self, existing_runtime_path: Option<&str>) -> BTreeMap<String, String> {
        let mut vars = self.extra_vars.clone();
        if self.library_path.is_empty() {
            return vars;
        }

        let joined = self.joined_library_path();
        vars.insert(LIBRARY_PATH_VAR.to_string(), joined.clone());

        let runtime = match existing_runtime_path {
            Some(existing) if !existing.is_empty() => {
                format!("{}{}{}", joined, self.platform.path_separator(), existing)
            }
            _ => joined,
        };
        vars.insert(self.runtime_path_var.clone(), runtime);
        vars
    }

    /// Variables for the current process environment.
    pub fn process_env_vars(&self) -> BTreeMap<String, String> {
        let existing = std::env::var(&self.runtime_path_var).ok();
        self.env_vars(existing.as_deref())
    }

    /// Render `export` lines for a POSIX shell.
    pub fn to_shell_exports(&self) -> String {
        self.process_env_vars()
            .iter()
            .map(|(k, v)| format!("export {}={}\n", k, shell_quote(v)))
            .collect()
    }

    /// Content digest of the descriptor (stable for identical provisioning).
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self).map_err(|e| {
            EnvError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Assemble the environment descriptor for `platform`.
///
/// Every configured library must be found under one of the prefixes;
/// otherwise all missing names are reported at once.
pub fn provision(config: &EnvironmentConfig, platform: &Platform) -> Result<EnvironmentDescriptor> {
    info!(
        libraries = config.native_libraries.len(),
        prefixes = config.prefixes.len(),
        "Assembling environment descriptor"
    );

    for prefix in &config.prefixes {
        if !prefix.is_dir() {
            return Err(EnvError::PrefixNotFound(prefix.clone()));
        }
    }

    let mut descriptor = EnvironmentDescriptor::empty(platform.clone());
    descriptor.extra_vars = config.extra_vars.clone();

    let mut missing = Vec::new();
    for name in &config.native_libraries {
        validate_library_name(name)?;
        match locate_library(name, &config.prefixes, platform)? {
            Some(found) => {
                debug!(library = %name, dir = %found.dir.display(), "Resolved native library");
                if !descriptor.library_path.contains(&found.dir) {
                    descriptor.library_path.push(found.dir.clone());
                }
                descriptor.libraries.push(found);
            }
            None => {
                warn!(library = %name, "Native library not provisioned");
                missing.push(name.clone());
            }
        }
    }

    if !missing.is_empty() {
        return Err(EnvError::LibrariesMissing {
            missing,
            searched: config.prefixes.clone(),
        });
    }

    Ok(descriptor)
}

fn validate_library_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'));
    if valid {
        Ok(())
    } else {
        Err(EnvError::InvalidLibraryName(name.to_string()))
    }
}

/// Find `name` under the prefixes, preferring earlier prefixes.
///
/// Versioned shared objects (`libfoo.so.1`) satisfy the lookup too.
fn locate_library(
    name: &str,
    prefixes: &[PathBuf],
    platform: &Platform,
) -> Result<Option<ResolvedLibrary>> {
    let candidates = platform.library_file_names(name);
    let versioned = format!("lib{}.so.", name);

    for prefix in prefixes {
        for sub in LIBRARY_SUBDIRS {
            let dir = prefix.join(sub);
            if !dir.is_dir() {
                continue;
            }

            for candidate in &candidates {
                let file = dir.join(candidate);
                if file.exists() {
                    return Ok(Some(ResolvedLibrary {
                        name: name.to_string(),
                        dir,
                        file,
                    }));
                }
            }

            if let Some(file) = find_versioned(&dir, &versioned)? {
                return Ok(Some(ResolvedLibrary {
                    name: name.to_string(),
                    dir,
                    file,
                }));
            }
        }
    }

    Ok(None)
}

fn find_versioned(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(prefix))
                .unwrap_or(false)
        })
        .collect();

    // Sort for deterministic ordering
    matches.sort();
    Ok(matches.into_iter().next())
}
