//! Check kinds and test partitions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use depot_core::BUILD_PROFILE;
use serde::{Deserialize, Serialize};

/// Quality checks over the whole workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    /// cargo fmt --all -- --check
    Format,

    /// cargo clippy --workspace --all-targets -- --deny warnings
    Lint,

    /// cargo doc --workspace --no-deps, warnings denied
    Doc,

    /// Lock artifact against an advisory snapshot
    SecurityAudit,

    /// Registry dependency licenses against the allow-list
    LicenseAudit,

    /// Aggregation manifest covers every package's dependency features
    DedupConsistency,

    /// cargo nextest run, one task per partition
    Test,

    /// cargo tarpaulin, x86_64 Linux only
    Coverage,
}

impl CheckKind {
    /// Every kind, in run order.
    pub const ALL: [CheckKind; 8] = [
        CheckKind::Format,
        CheckKind::Lint,
        CheckKind::Doc,
        CheckKind::SecurityAudit,
        CheckKind::LicenseAudit,
        CheckKind::DedupConsistency,
        CheckKind::Test,
        CheckKind::Coverage,
    ];

    /// Kinds evaluated in-process without cargo.
    pub const AUDITS: [CheckKind; 3] = [
        CheckKind::SecurityAudit,
        CheckKind::LicenseAudit,
        CheckKind::DedupConsistency,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::Format => "format",
            CheckKind::Lint => "lint",
            CheckKind::Doc => "doc",
            CheckKind::SecurityAudit => "security-audit",
            CheckKind::LicenseAudit => "license-audit",
            CheckKind::DedupConsistency => "dedup-consistency",
            CheckKind::Test => "test",
            CheckKind::Coverage => "coverage",
        }
    }

    /// Evaluated in-process rather than by an external tool.
    pub fn is_native(&self) -> bool {
        Self::AUDITS.contains(self)
    }

    /// Needs the compiled dependency bundle for the current cache key.
    pub fn needs_dependency_artifacts(&self) -> bool {
        matches!(
            self,
            CheckKind::Lint | CheckKind::Doc | CheckKind::Test | CheckKind::Coverage
        )
    }

    /// Whether the check is split into partitions.
    pub fn is_partitioned(&self) -> bool {
        matches!(self, CheckKind::Test)
    }

    /// Command for external checks; `None` for native ones.
    ///
    /// Every compiling check runs `--frozen` in the dependency bundle's
    /// profile so it links against the bundle's artifacts. Coverage still
    /// recompiles because instrumentation changes the compiler flags.
    pub fn command(&self, partition: Option<TestPartition>) -> Option<Vec<String>> {
        let argv: Vec<&str> = match self {
            CheckKind::Format => vec!["cargo", "fmt", "--all", "--", "--check"],
            CheckKind::Lint => vec![
                "cargo",
                "clippy",
                "--frozen",
                "--workspace",
                "--all-targets",
                "--profile",
                BUILD_PROFILE,
                "--",
                "--deny",
                "warnings",
            ],
            CheckKind::Doc => vec![
                "cargo",
                "doc",
                "--frozen",
                "--workspace",
                "--no-deps",
                "--profile",
                BUILD_PROFILE,
            ],
            CheckKind::Test => {
                let partition = partition.unwrap_or_default().nextest_arg();
                let argv = [
                    "cargo",
                    "nextest",
                    "run",
                    "--frozen",
                    "--workspace",
                    "--no-fail-fast",
                    "--cargo-profile",
                    BUILD_PROFILE,
                    "--partition",
                    partition.as_str(),
                ];
                return Some(argv.iter().map(|s| s.to_string()).collect());
            }
            CheckKind::Coverage => vec![
                "cargo",
                "tarpaulin",
                "--frozen",
                "--workspace",
                "--skip-clean",
                "--profile",
                BUILD_PROFILE,
                "--out",
                "Xml",
            ],
            CheckKind::SecurityAudit | CheckKind::LicenseAudit | CheckKind::DedupConsistency => {
                return None
            }
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }

    /// Extra environment for external checks.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if *self == CheckKind::Doc {
            env.insert("RUSTDOCFLAGS".to_string(), "--deny warnings".to_string());
        }
        env
    }

    /// Auto-fix command, if the check has one.
    pub fn fix_command(&self) -> Option<Vec<String>> {
        match self {
            CheckKind::Format => Some(vec![
                "cargo".to_string(),
                "fmt".to_string(),
                "--all".to_string(),
            ]),
            _ => None,
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckKind::ALL
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or_else(|| {
                let names: Vec<_> = CheckKind::ALL.iter().map(|k| k.name()).collect();
                format!("unknown check '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

/// Count-based test partition `index/count` (1-based).
///
/// Test number `n` (0-based, in the runner's listing order) belongs to
/// partition `n % count + 1`, so the partitions of one count cover every
/// test exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestPartition {
    pub index: u32,
    pub count: u32,
}

impl Default for TestPartition {
    fn default() -> Self {
        Self { index: 1, count: 1 }
    }
}

impl TestPartition {
    pub fn new(index: u32, count: u32) -> Result<Self, String> {
        if count == 0 || index == 0 || index > count {
            return Err(format!("invalid test partition {}/{}", index, count));
        }
        Ok(Self { index, count })
    }

    /// All partitions for `count` shards.
    pub fn all(count: u32) -> Vec<Self> {
        (1..=count.max(1))
            .map(|index| Self {
                index,
                count: count.max(1),
            })
            .collect()
    }

    /// Whether test number `ordinal` runs in this partition.
    pub fn owns(&self, ordinal: usize) -> bool {
        ordinal % self.count as usize == (self.index - 1) as usize
    }

    /// `count:i/N` form understood by cargo-nextest.
    pub fn nextest_arg(&self) -> String {
        format!("count:{}/{}", self.index, self.count)
    }
}

impl fmt::Display for TestPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}
