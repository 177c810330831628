//! Host platform detection.
//!
//! Decides which dynamic-library runtime path variable the host loader
//! reads and which optional tooling (coverage instrumentation) is supported.

use serde::{Deserialize, Serialize};

/// Operating system family of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

/// Host platform (operating system + CPU architecture).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system family.
    pub os: OsFamily,
    /// Architecture as reported by `std::env::consts::ARCH`.
    pub arch: String,
}

impl Platform {
    /// Create a platform description.
    pub fn new(os: OsFamily, arch: &str) -> Self {
        Platform {
            os,
            arch: arch.to_string(),
        }
    }

    /// Detect the platform this process runs on.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        };
        Platform::new(os, std::env::consts::ARCH)
    }

    /// Variable the dynamic loader consults for runtime library lookup.
    pub fn runtime_path_var(&self) -> &'static str {
        match self.os {
            OsFamily::MacOs => "DYLD_LIBRARY_PATH",
            OsFamily::Windows => "PATH",
            OsFamily::Linux | OsFamily::Other => "LD_LIBRARY_PATH",
        }
    }

    /// Separator used when joining search path entries.
    pub fn path_separator(&self) -> char {
        match self.os {
            OsFamily::Windows => ';',
            _ => ':',
        }
    }

    /// File name candidates for a shared or static library with link name `name`.
    pub fn library_file_names(&self, name: &str) -> Vec<String> {
        match self.os {
            OsFamily::MacOs => vec![format!("lib{}.dylib", name), format!("lib{}.a", name)],
            OsFamily::Windows => vec![format!("{}.dll", name), format!("{}.lib", name)],
            OsFamily::Linux | OsFamily::Other => {
                vec![format!("lib{}.so", name), format!("lib{}.a", name)]
            }
        }
    }

    /// Whether instrumented coverage runs are supported on this platform.
    ///
    /// The coverage tool only ships for x86_64 Linux.
    pub fn supports_coverage(&self) -> bool {
        self.os == OsFamily::Linux && self.arch == "x86_64"
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let os = match self.os {
            OsFamily::Linux => "linux",
            OsFamily::MacOs => "darwin",
            OsFamily::Windows => "windows",
            OsFamily::Other => "unknown",
        };
        write!(f, "{}-{}", self.arch, os)
    }
}
