//! Check execution and result publication.
//!
//! A [`CheckRunner`] turns a [`CheckSpec`] into a [`CheckResult`]. It never
//! returns an error: whatever goes wrong inside a check is that check's
//! failure and must not stop sibling checks or builds. Passing results are
//! published under their check key and served from the store afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{self, AdvisoryDatabase};
use crate::check::{CheckKind, TestPartition};
use crate::dedup;
use crate::license::{self, LicensePolicy, LicenseSnapshot};
use crate::spec::CheckSpec;
use depot_core::obs;
use depot_core::{
    run_command, ArtifactKind, ArtifactStore, CacheEntry, CacheKey, CommandOutput, CommandSpec,
    DepotConfig, Digest, DigestBuilder, SourceFileSet, Workspace,
};
use depot_env::Platform;

/// File name of the report inside a published check entry.
pub const REPORT_NAME: &str = "report.json";

/// File name of a coverage report inside a published check entry.
pub const COVERAGE_REPORT: &str = "cobertura.xml";

/// How a check ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed { findings: Vec<String> },
    Skipped { reason: String },
}

impl CheckOutcome {
    pub fn failed(finding: impl Into<String>) -> Self {
        CheckOutcome::Failed {
            findings: vec![finding.into()],
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, CheckOutcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CheckOutcome::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CheckOutcome::Passed => "passed",
            CheckOutcome::Failed { .. } => "failed",
            CheckOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// What an executor produced for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckExecution {
    pub outcome: CheckOutcome,
    /// Raw tool output or a native check's summary.
    pub diagnostics: String,
    /// Report artifact, such as coverage XML.
    pub report: Option<String>,
}

impl CheckExecution {
    pub fn passed(diagnostics: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Passed,
            diagnostics: diagnostics.into(),
            report: None,
        }
    }

    /// Passed when `findings` is empty, failed with them otherwise.
    pub fn from_findings(findings: Vec<String>, diagnostics: impl Into<String>) -> Self {
        let outcome = if findings.is_empty() {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed { findings }
        };
        Self {
            outcome,
            diagnostics: diagnostics.into(),
            report: None,
        }
    }
}

/// Check settings resolved against the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSettings {
    pub advisory_db: PathBuf,
    pub license_snapshot: PathBuf,
    pub allowed_licenses: Vec<String>,
    pub ignore_advisories: Vec<String>,
    pub timeout_secs: u64,
}

impl CheckSettings {
    pub fn from_config(config: &DepotConfig, workspace_root: &Path) -> Self {
        Self {
            advisory_db: config.advisory_db(workspace_root),
            license_snapshot: config.license_snapshot(workspace_root),
            allowed_licenses: config.checks.allowed_licenses.clone(),
            ignore_advisories: config.checks.ignore_advisories.clone(),
            timeout_secs: config.checks.timeout_secs,
        }
    }
}

/// Inputs shared by every check of one run.
pub struct CheckContext<'a> {
    pub workspace: &'a Workspace,
    pub cache_key: CacheKey,
    /// Dependency bundle, present when any planned check needs it.
    pub cache: Option<CacheEntry>,
    /// Full workspace source set.
    pub sources: SourceFileSet,
    pub source_digest: Digest,
    pub platform: Platform,
    /// Provisioned environment for external tools.
    pub env: BTreeMap<String, String>,
    pub settings: CheckSettings,
}

impl CheckContext<'_> {
    /// Digest of external data a check reads beyond the workspace, folded
    /// into its key so a new snapshot or policy invalidates old results.
    pub fn auxiliary_digest(&self, kind: CheckKind) -> Option<Digest> {
        match kind {
            CheckKind::SecurityAudit => {
                let snapshot = audit::snapshot_digest(&self.settings.advisory_db)?;
                let mut builder = DigestBuilder::new("security-audit-inputs")
                    .field("snapshot", snapshot.as_bytes());
                for id in &self.settings.ignore_advisories {
                    builder.update_field("ignore", id.as_bytes());
                }
                Some(builder.finish())
            }
            CheckKind::LicenseAudit => {
                let bytes = std::fs::read(&self.settings.license_snapshot).ok()?;
                let mut builder =
                    DigestBuilder::new("license-audit-inputs").field("snapshot", &bytes);
                for id in &self.settings.allowed_licenses {
                    builder.update_field("allow", id.as_bytes());
                }
                Some(builder.finish())
            }
            _ => None,
        }
    }

    /// Check key for `spec` under this context.
    pub fn key_for(&self, spec: &CheckSpec) -> Digest {
        let auxiliary = self.auxiliary_digest(spec.kind);
        spec.key(&self.cache_key, &self.source_digest, auxiliary.as_ref())
    }
}

/// Runs one check. Implementations report findings through
/// [`CheckExecution`]; an `Err` means the check could not run at all.
#[async_trait]
pub trait CheckExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &CheckSpec,
        ctx: &CheckContext<'_>,
    ) -> anyhow::Result<CheckExecution>;
}

/// Evaluate a native check in-process. `None` for external kinds.
pub fn run_native(kind: CheckKind, ctx: &CheckContext<'_>) -> Option<anyhow::Result<CheckExecution>> {
    if !kind.is_native() {
        return None;
    }
    let result = match kind {
        CheckKind::SecurityAudit => security_audit(ctx),
        CheckKind::LicenseAudit => license_audit(ctx),
        CheckKind::DedupConsistency => dedup::check_consistency(ctx.workspace).map(|findings| {
            let summary = format!(
                "{} external dependencies checked against the aggregation manifest",
                dedup::required_union(ctx.workspace).len()
            );
            CheckExecution::from_findings(findings, summary)
        }),
        _ => return None,
    };
    Some(result)
}

fn security_audit(ctx: &CheckContext<'_>) -> anyhow::Result<CheckExecution> {
    let db = match AdvisoryDatabase::load(&ctx.settings.advisory_db) {
        Ok(db) => db,
        Err(e) => {
            return Ok(CheckExecution {
                outcome: CheckOutcome::failed(format!("{:#}", e)),
                diagnostics: String::new(),
                report: None,
            })
        }
    };
    let found = db.audit(ctx.workspace.lock(), &ctx.settings.ignore_advisories);
    let mut summary = format!(
        "{} advisories, {} pinned packages scanned",
        db.len(),
        ctx.workspace.lock().external_packages().count()
    );
    for notice in &found.warnings {
        summary.push_str(&format!("\nwarning: {}", notice));
    }
    Ok(CheckExecution::from_findings(
        found.vulnerabilities.iter().map(ToString::to_string).collect(),
        summary,
    ))
}

fn license_audit(ctx: &CheckContext<'_>) -> anyhow::Result<CheckExecution> {
    let snapshot = match LicenseSnapshot::load(&ctx.settings.license_snapshot) {
        Ok(s) => s,
        Err(e) => {
            return Ok(CheckExecution {
                outcome: CheckOutcome::failed(format!("{:#}", e)),
                diagnostics: String::new(),
                report: None,
            })
        }
    };
    let policy = LicensePolicy::new(ctx.settings.allowed_licenses.iter().cloned());
    let findings = license::audit_licenses(ctx.workspace.lock(), &snapshot, &policy);
    let summary = format!(
        "{} registry packages checked against {} allowed licenses",
        ctx.workspace.lock().external_packages().count(),
        ctx.settings.allowed_licenses.len()
    );
    Ok(CheckExecution::from_findings(findings, summary))
}

/// Executor running native checks in-process and everything else through
/// cargo inside a staged copy of the workspace.
pub struct CargoCheckExecutor {
    store: Arc<ArtifactStore>,
}

impl CargoCheckExecutor {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self { store }
    }

    async fn run_tool(
        &self,
        spec: &CheckSpec,
        ctx: &CheckContext<'_>,
    ) -> anyhow::Result<CheckExecution> {
        let argv = spec
            .kind
            .command(spec.partition)
            .with_context(|| format!("{} has no command", spec.kind))?;
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();

        let workdir = self.store.staging_dir()?;
        ctx.sources.stage(ctx.workspace.root(), workdir.path())?;

        let mut env = ctx.env.clone();
        env.extend(spec.kind.env());
        let target = self.store.staging_dir()?;
        if spec.kind.needs_dependency_artifacts() {
            let cache = ctx
                .cache
                .as_ref()
                .context("dependency bundle not available for this run")?;
            self.store.checkout(cache.key.digest(), target.path())?;
            env.insert(
                "CARGO_TARGET_DIR".to_string(),
                target.path().join("target").to_string_lossy().to_string(),
            );
        }

        let command = CommandSpec::from_argv(&spec.label(), &argv)?
            .with_env(env)
            .with_cwd(workdir.path())
            .with_timeout(ctx.settings.timeout_secs);
        let output = run_command(&command).await?;

        let report = if spec.kind == CheckKind::Coverage && output.success {
            std::fs::read_to_string(workdir.path().join(COVERAGE_REPORT)).ok()
        } else {
            None
        };
        Ok(CheckExecution {
            outcome: tool_outcome(spec.kind, &output, workdir.path()),
            diagnostics: output.combined(),
            report,
        })
    }
}

#[async_trait]
impl CheckExecutor for CargoCheckExecutor {
    async fn execute(
        &self,
        spec: &CheckSpec,
        ctx: &CheckContext<'_>,
    ) -> anyhow::Result<CheckExecution> {
        match run_native(spec.kind, ctx) {
            Some(result) => result,
            None => self.run_tool(spec, ctx).await,
        }
    }
}

fn tool_outcome(kind: CheckKind, output: &CommandOutput, workdir: &Path) -> CheckOutcome {
    if output.success {
        return CheckOutcome::Passed;
    }
    let mut findings = parse_findings(kind, &output.combined(), workdir);
    if findings.is_empty() {
        findings.push(format!("{} exited with code {}", kind, output.exit_code));
    }
    CheckOutcome::Failed { findings }
}

struct Patterns {
    format: Regex,
    diagnostic: Regex,
    test: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                format: Regex::new(r"(?m)^Diff in (\S+?)(?::\d+:| at line \d+:)").ok()?,
                diagnostic: Regex::new(r"(?m)^(error|warning)(\[[^\]]+\])?: (.+)$").ok()?,
                test: Regex::new(r"(?m)^\s*FAIL \[[^\]]*\] (.+?)\s*$").ok()?,
            })
        })
        .as_ref()
}

/// Findings from a failed tool's output: non-conforming files for format,
/// compiler diagnostics for lint and doc, failing tests for test runs.
pub fn parse_findings(kind: CheckKind, output: &str, workdir: &Path) -> Vec<String> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    let mut findings = Vec::new();
    let mut push = |finding: String| {
        if seen.insert(finding.clone()) {
            findings.push(finding);
        }
    };

    match kind {
        CheckKind::Format => {
            for cap in p.format.captures_iter(output) {
                let path = Path::new(&cap[1]);
                let relative = path.strip_prefix(workdir).unwrap_or(path);
                push(relative.to_string_lossy().to_string());
            }
        }
        CheckKind::Lint | CheckKind::Doc => {
            for cap in p.diagnostic.captures_iter(output) {
                let message = &cap[3];
                if message.starts_with("could not compile") || message.contains(" generated ") {
                    continue;
                }
                push(format!("{}{}: {}", &cap[1], cap.get(2).map_or("", |m| m.as_str()), message));
            }
        }
        CheckKind::Test | CheckKind::Coverage => {
            for cap in p.test.captures_iter(output) {
                push(cap[1].to_string());
            }
        }
        _ => {}
    }
    findings
}

/// Result of one check task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub label: String,
    pub kind: CheckKind,
    pub partition: Option<TestPartition>,
    pub key: String,
    pub outcome: CheckOutcome,
    #[serde(default)]
    pub diagnostics: String,
    /// Digest of the stored diagnostics log for failures.
    pub log: Option<String>,
    /// Served from a previously published result.
    pub cached: bool,
    pub duration_ms: u64,
}

/// Runs checks through an executor and publishes passing results.
pub struct CheckRunner {
    store: Arc<ArtifactStore>,
    executor: Arc<dyn CheckExecutor>,
}

impl CheckRunner {
    pub fn new(store: Arc<ArtifactStore>, executor: Arc<dyn CheckExecutor>) -> Self {
        Self { store, executor }
    }

    /// Run `spec`, reusing a published passing result for the same key.
    pub async fn run(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckResult {
        let start = Instant::now();
        let label = spec.label();
        let task = format!("check:{}", label);
        let key = ctx.key_for(spec);
        let mut result = CheckResult {
            label,
            kind: spec.kind,
            partition: spec.partition,
            key: key.to_hex(),
            outcome: CheckOutcome::Passed,
            diagnostics: String::new(),
            log: None,
            cached: false,
            duration_ms: 0,
        };

        match self.store.lookup(&key) {
            Ok(Some(artifact)) => {
                obs::emit_cache_hit("check_report", &key.short());
                result.diagnostics = artifact.manifest.metadata["diagnostics"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                result.cached = true;
                result.duration_ms = start.elapsed().as_millis() as u64;
                obs::emit_task_finished(&task, "passed", true, result.duration_ms);
                return result;
            }
            Ok(None) => {}
            Err(e) => warn!(task = %task, error = %e, "Ignoring unreadable check entry"),
        }

        if spec.kind == CheckKind::Coverage && !ctx.platform.supports_coverage() {
            result.outcome = CheckOutcome::Skipped {
                reason: format!("coverage is not supported on {}", ctx.platform),
            };
            info!(task = %task, platform = %ctx.platform, "Skipping check");
            obs::emit_task_finished(&task, "skipped", false, 0);
            return result;
        }

        obs::emit_task_started(&task, &key.short());
        let execution = match self.executor.execute(spec, ctx).await {
            Ok(execution) => execution,
            Err(e) => CheckExecution {
                outcome: CheckOutcome::failed(format!("{:#}", e)),
                diagnostics: format!("{:?}", e),
                report: None,
            },
        };
        result.outcome = execution.outcome.clone();
        result.diagnostics = execution.diagnostics.clone();
        result.duration_ms = start.elapsed().as_millis() as u64;

        match &result.outcome {
            CheckOutcome::Passed => {
                if let Err(e) = self.publish(&key, &result, execution.report.as_deref()) {
                    warn!(task = %task, error = %e, "Failed to publish check result");
                }
            }
            CheckOutcome::Failed { findings } => {
                let log = self
                    .store
                    .blobs()
                    .put_text(&result.diagnostics)
                    .map(|d| d.short())
                    .unwrap_or_default();
                obs::emit_task_failed(&task, "CheckFailure", &log);
                debug!(task = %task, findings = findings.len(), "Check failed");
                result.log = Some(log);
            }
            CheckOutcome::Skipped { .. } => {}
        }
        obs::emit_task_finished(&task, result.outcome.name(), false, result.duration_ms);
        result
    }

    /// Failed result for a check that cannot start, e.g. because the
    /// environment it compiles in was not provisioned. Never published.
    pub fn blocked(&self, spec: &CheckSpec, ctx: &CheckContext<'_>, reason: &str) -> CheckResult {
        let label = spec.label();
        let task = format!("check:{}", label);
        let log = self
            .store
            .blobs()
            .put_text(reason)
            .map(|d| d.short())
            .unwrap_or_default();
        obs::emit_task_failed(&task, "Environment", &log);
        obs::emit_task_finished(&task, "failed", false, 0);
        CheckResult {
            label,
            kind: spec.kind,
            partition: spec.partition,
            key: ctx.key_for(spec).to_hex(),
            outcome: CheckOutcome::failed(reason),
            diagnostics: reason.to_string(),
            log: Some(log),
            cached: false,
            duration_ms: 0,
        }
    }

    fn publish(&self, key: &Digest, result: &CheckResult, report: Option<&str>) -> depot_core::Result<()> {
        let staging = self.store.staging_dir()?;
        std::fs::write(
            staging.path().join(REPORT_NAME),
            serde_json::to_vec_pretty(result)?,
        )?;
        if let Some(report) = report {
            std::fs::write(staging.path().join(COVERAGE_REPORT), report)?;
        }
        self.store.publish(
            key,
            ArtifactKind::CheckReport,
            &result.label,
            staging,
            serde_json::json!({
                "check": result.kind.name(),
                "partition": result.partition.map(|p| p.to_string()),
                "diagnostics": result.diagnostics,
            }),
        )?;
        Ok(())
    }
}

/// Apply `kind`'s fix command to the live workspace at `root`.
pub async fn apply_fix(
    kind: CheckKind,
    root: &Path,
    env: BTreeMap<String, String>,
) -> anyhow::Result<CommandOutput> {
    let argv = kind
        .fix_command()
        .with_context(|| format!("{} has no fix command", kind))?;
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    let command = CommandSpec::from_argv(&format!("fix:{}", kind), &argv)?
        .with_env(env)
        .with_cwd(root);
    Ok(run_command(&command).await?)
}
