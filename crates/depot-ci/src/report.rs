//! Run reports and the pass/fail verdict.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runner::{CheckOutcome, CheckResult};
use depot_core::{BuildOutcome, DepotError, ErrorCategory};

/// How one package build ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildStatus {
    Built {
        key: String,
        cached: bool,
        artifact: PathBuf,
        executable: Option<PathBuf>,
    },
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

/// One package build in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub package: String,
    #[serde(flatten)]
    pub status: BuildStatus,
    pub duration_ms: u64,
}

impl BuildRecord {
    pub fn built(outcome: &BuildOutcome) -> Self {
        Self {
            package: outcome.package.clone(),
            status: BuildStatus::Built {
                key: outcome.key.to_hex(),
                cached: outcome.cached,
                artifact: outcome.artifact.path.clone(),
                executable: outcome.executable(),
            },
            duration_ms: outcome.duration_ms,
        }
    }

    pub fn failed(package: &str, err: &DepotError, duration_ms: u64) -> Self {
        Self {
            package: package.to_string(),
            status: BuildStatus::Failed {
                category: err.category(),
                message: err.to_string(),
            },
            duration_ms,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self.status, BuildStatus::Built { .. })
    }
}

/// Pass/fail verdict over a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    /// One line per failed task: `build:alpha: ...`, `check:lint: ...`.
    pub violations: Vec<String>,
    pub message: String,
}

/// Everything a run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub cache_key: String,
    /// Whether the dependency bundle was reused; `None` when the run did
    /// not need one.
    pub cache_reused: Option<bool>,
    pub builds: Vec<BuildRecord>,
    pub checks: Vec<CheckResult>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn build(&self, package: &str) -> Option<&BuildRecord> {
        self.builds.iter().find(|b| b.package == package)
    }

    pub fn check(&self, label: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.label == label)
    }

    pub fn failed_tasks(&self) -> usize {
        self.builds.iter().filter(|b| !b.is_built()).count()
            + self.checks.iter().filter(|c| c.outcome.is_failed()).count()
    }

    /// Failed builds and failed checks; skipped checks do not count.
    pub fn verdict(&self) -> Verdict {
        let mut violations = Vec::new();
        for build in &self.builds {
            if let BuildStatus::Failed { message, .. } = &build.status {
                violations.push(format!("build:{}: {}", build.package, message));
            }
        }
        for check in &self.checks {
            if let CheckOutcome::Failed { findings } = &check.outcome {
                violations.push(format!("check:{}: {}", check.label, findings.join("; ")));
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!(
                "All {} task(s) passed",
                self.builds.len() + self.checks.len()
            )
        } else {
            format!("Run failed with {} failed task(s)", violations.len())
        };
        Verdict {
            passed,
            violations,
            message,
        }
    }

    pub fn success(&self) -> bool {
        self.failed_tasks() == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let reuse = match self.cache_reused {
            Some(true) => "reused",
            Some(false) => "built",
            None => "not needed",
        };
        let _ = writeln!(
            out,
            "run {}  dependency cache {} ({})",
            self.run_id,
            &self.cache_key[..self.cache_key.len().min(12)],
            reuse
        );
        for build in &self.builds {
            match &build.status {
                BuildStatus::Built { cached, artifact, .. } => {
                    let _ = writeln!(
                        out,
                        "  ok      build:{}{}  {}",
                        build.package,
                        if *cached { " (cached)" } else { "" },
                        artifact.display()
                    );
                }
                BuildStatus::Failed { category, message } => {
                    let _ = writeln!(out, "  FAILED  build:{}  [{:?}] {}", build.package, category, message);
                }
            }
        }
        for check in &self.checks {
            match &check.outcome {
                CheckOutcome::Passed => {
                    let _ = writeln!(
                        out,
                        "  ok      check:{}{}",
                        check.label,
                        if check.cached { " (cached)" } else { "" }
                    );
                }
                CheckOutcome::Skipped { reason } => {
                    let _ = writeln!(out, "  skipped check:{}  {}", check.label, reason);
                }
                CheckOutcome::Failed { findings } => {
                    let _ = writeln!(out, "  FAILED  check:{}", check.label);
                    for finding in findings {
                        let _ = writeln!(out, "          {}", finding);
                    }
                }
            }
        }
        let verdict = self.verdict();
        let _ = writeln!(out, "{} in {} ms", verdict.message, self.duration_ms);
        out
    }
}
