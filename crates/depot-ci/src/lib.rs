//! Depot CI - quality checks and run orchestration
//!
//! Provides the check side of depot:
//! - Check kinds and test partitions (format, lint, doc, audits, tests, coverage)
//! - Native audits over the lock artifact and the aggregation manifest
//! - A check runner that publishes passing results under their check key
//! - The orchestrator that runs builds and checks against one dependency bundle

pub mod audit;
pub mod check;
pub mod dedup;
pub mod fakes;
pub mod license;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod spec;

// Re-export key types
pub use audit::{Advisory, AdvisoryDatabase, AuditFindings, Vulnerability};
pub use check::{CheckKind, TestPartition};
pub use license::{LicenseExpr, LicensePolicy, LicenseSnapshot};
pub use pipeline::{select_checks, Orchestrator, RunRequest};
pub use report::{BuildRecord, BuildStatus, RunReport, Verdict};
pub use runner::{
    apply_fix, CargoCheckExecutor, CheckContext, CheckExecution, CheckExecutor, CheckOutcome,
    CheckResult, CheckRunner, CheckSettings,
};
pub use spec::CheckSpec;
