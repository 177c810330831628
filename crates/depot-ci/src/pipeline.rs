//! Build and check orchestration.
//!
//! A run validates the workspace, plans a [`TaskGraph`] and executes it
//! level by level: the dependency bundle first (only when some task
//! consumes it), then every package build and check, each level fully
//! concurrent. Resolution and dependency-cache failures abort the run;
//! build and check failures are collected into the [`RunReport`].
//!
//! A failed environment provisioning does not abort anything up front.
//! It is reported against the tasks that compile or link, while formatting
//! and the audits still run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::check::CheckKind;
use crate::report::{BuildRecord, RunReport};
use crate::runner::{
    CargoCheckExecutor, CheckContext, CheckExecutor, CheckResult, CheckRunner, CheckSettings,
};
use crate::spec::CheckSpec;
use depot_core::obs;
use depot_core::{
    build_key, ArtifactStore, BuildBackend, CacheEntry, CacheKey, CargoBackend,
    DependencyArtifactCache, DepotConfig, DepotError, PackageBuilder, Result,
    SourceFileSetResolver, TaskGraph, TaskId, TaskKind, Workspace,
};
use depot_env::EnvironmentDescriptor;

/// What a run should do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Packages to build, in request order.
    pub packages: Vec<String>,
    pub checks: Vec<CheckSpec>,
}

impl RunRequest {
    pub fn builds<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
            checks: Vec::new(),
        }
    }

    /// Every buildable package of `workspace`.
    pub fn all_packages(workspace: &Workspace) -> Self {
        Self::builds(workspace.buildable().map(|p| p.name.clone()))
    }

    pub fn checks(checks: Vec<CheckSpec>) -> Self {
        Self {
            packages: Vec::new(),
            checks,
        }
    }

    /// Whether any task consumes the dependency bundle.
    pub fn needs_dependency_bundle(&self) -> bool {
        !self.packages.is_empty()
            || self
                .checks
                .iter()
                .any(|c| c.kind.needs_dependency_artifacts())
    }
}

/// What a graph node executes.
#[derive(Debug, Clone, Copy)]
enum PlannedTask<'r> {
    DependencyCache,
    Build(&'r str),
    Check(&'r CheckSpec),
}

/// Planned graph plus the request entries behind its nodes.
struct Schedule<'r> {
    graph: TaskGraph,
    tasks: HashMap<TaskId, PlannedTask<'r>>,
    /// Build and check nodes in request order.
    builds: Vec<(TaskId, &'r str)>,
    checks: Vec<(TaskId, &'r CheckSpec)>,
}

enum TaskResult {
    Cache(Option<CacheEntry>),
    Build(BuildRecord),
    Check(CheckResult),
}

/// Runs builds and checks against one store.
pub struct Orchestrator {
    store: Arc<ArtifactStore>,
    cache: DependencyArtifactCache,
    builder: PackageBuilder,
    checks: CheckRunner,
    env: EnvironmentDescriptor,
    env_error: Option<String>,
    settings: CheckSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ArtifactStore>,
        backend: Arc<dyn BuildBackend>,
        executor: Arc<dyn CheckExecutor>,
        env: EnvironmentDescriptor,
        settings: CheckSettings,
    ) -> Self {
        Self {
            cache: DependencyArtifactCache::new(store.clone(), backend.clone(), env.clone()),
            builder: PackageBuilder::new(store.clone(), backend, env.clone()),
            checks: CheckRunner::new(store.clone(), executor),
            store,
            env,
            env_error: None,
            settings,
        }
    }

    /// Orchestrator driving cargo, with the environment provisioned from
    /// `config` for the current platform.
    ///
    /// A provisioning failure is kept rather than returned: see
    /// [`provisioning_error`](Self::provisioning_error).
    pub fn from_config(workspace_root: &Path, config: &DepotConfig) -> Result<Self> {
        let store = Arc::new(ArtifactStore::open(config.store_root(workspace_root))?);
        let platform = depot_env::Platform::current();
        let (env, env_error) = match depot_env::provision(&config.environment, &platform) {
            Ok(env) => (env, None),
            Err(err) => {
                warn!(error = %err, "Environment provisioning failed, compiling tasks will fail");
                (EnvironmentDescriptor::empty(platform), Some(err.to_string()))
            }
        };
        let backend = Arc::new(CargoBackend::new().with_timeout(config.checks.timeout_secs));
        let executor = Arc::new(CargoCheckExecutor::new(store.clone()));
        let orchestrator = Self::new(
            store,
            backend,
            executor,
            env,
            CheckSettings::from_config(config, workspace_root),
        );
        Ok(match env_error {
            Some(err) => orchestrator.with_provisioning_error(err),
            None => orchestrator,
        })
    }

    /// Mark the environment as not provisioned. Builds, the dependency
    /// bundle and compiling checks then fail with an environment error.
    pub fn with_provisioning_error(mut self, error: impl Into<String>) -> Self {
        self.env_error = Some(error.into());
        self
    }

    /// Why provisioning failed, if it did.
    pub fn provisioning_error(&self) -> Option<&str> {
        self.env_error.as_deref()
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn cache(&self) -> &DependencyArtifactCache {
        &self.cache
    }

    pub fn env(&self) -> &EnvironmentDescriptor {
        &self.env
    }

    fn context<'a>(&self, workspace: &'a Workspace, cache: Option<CacheEntry>) -> Result<CheckContext<'a>> {
        let sources = SourceFileSetResolver::new(workspace).resolve_workspace()?;
        let source_digest = sources.digest(workspace.root())?;
        Ok(CheckContext {
            workspace,
            cache_key: CacheKey::for_workspace(workspace),
            cache,
            sources,
            source_digest,
            platform: self.env.platform.clone(),
            env: self.env.process_env_vars(),
            settings: self.settings.clone(),
        })
    }

    /// Task graph for `request`: the dependency cache at level 0, builds and
    /// checks above it. Checks that do not read the bundle have no edge.
    pub fn plan(&self, workspace: &Workspace, request: &RunRequest) -> Result<TaskGraph> {
        Ok(self.schedule(workspace, request)?.graph)
    }

    fn schedule<'r>(&self, workspace: &Workspace, request: &'r RunRequest) -> Result<Schedule<'r>> {
        let graph_err = |e: depot_core::GraphError| DepotError::Process(e.to_string());
        let cache_key = CacheKey::for_workspace(workspace);
        let mut schedule = Schedule {
            graph: TaskGraph::new(),
            tasks: HashMap::new(),
            builds: Vec::with_capacity(request.packages.len()),
            checks: Vec::with_capacity(request.checks.len()),
        };
        let cache = schedule
            .graph
            .add(TaskKind::DependencyCache, *cache_key.digest());
        schedule.tasks.insert(cache, PlannedTask::DependencyCache);

        let resolver = SourceFileSetResolver::new(workspace);
        for name in &request.packages {
            let package = workspace.package(name)?;
            let sources = resolver.resolve_package(package)?;
            let key = build_key(&package.name, &sources.digest(workspace.root())?, &cache_key);
            let node = schedule.graph.add(
                TaskKind::PackageBuild {
                    package: package.name.clone(),
                },
                key,
            );
            schedule.graph.depend(cache, node).map_err(graph_err)?;
            schedule.tasks.insert(node, PlannedTask::Build(name.as_str()));
            schedule.builds.push((node, name.as_str()));
        }

        if !request.checks.is_empty() {
            let ctx = self.context(workspace, None)?;
            for spec in &request.checks {
                let node = schedule.graph.add(
                    TaskKind::Check {
                        check: spec.kind.name().to_string(),
                        shard: spec.partition.map(|p| p.to_string()),
                    },
                    ctx.key_for(spec),
                );
                if spec.kind.needs_dependency_artifacts() {
                    schedule.graph.depend(cache, node).map_err(graph_err)?;
                }
                schedule.tasks.insert(node, PlannedTask::Check(spec));
                schedule.checks.push((node, spec));
            }
        }
        Ok(schedule)
    }

    /// Execute `request` against `workspace`.
    pub async fn run(&self, workspace: &Workspace, request: &RunRequest) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.run_inner(workspace, request, run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        workspace: &Workspace,
        request: &RunRequest,
        run_id: String,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let started_at = Utc::now();
        info!(
            packages = request.packages.len(),
            checks = request.checks.len(),
            "Starting run"
        );

        let fatal = |err: DepotError| {
            obs::emit_run_finished(&run_id, start.elapsed().as_millis() as u64, 1, false);
            err
        };

        let schedule = self.schedule(workspace, request).map_err(fatal)?;
        workspace.validate_lock().map_err(|e| fatal(e.into()))?;
        let mut ctx = self.context(workspace, None).map_err(fatal)?;
        let mut cache: Option<CacheEntry> = None;
        let mut results: HashMap<TaskId, TaskResult> = HashMap::new();

        for level in schedule.graph.levels() {
            let outcomes = join_all(level.iter().map(|node| {
                let task = schedule.tasks.get(&node.id).copied();
                let (ctx, cache) = (&ctx, cache.as_ref());
                async move {
                    let result = match task {
                        Some(PlannedTask::DependencyCache) => {
                            TaskResult::Cache(self.dependency_task(workspace, request).await?)
                        }
                        Some(PlannedTask::Build(name)) => {
                            TaskResult::Build(self.build_task(workspace, name, cache).await)
                        }
                        Some(PlannedTask::Check(spec)) => {
                            TaskResult::Check(self.check_task(spec, ctx).await)
                        }
                        None => {
                            return Err(DepotError::Process(format!(
                                "task {} has no planned work",
                                node.id
                            )))
                        }
                    };
                    Ok((node.id, result))
                }
                .instrument(obs::task_span(&node.kind.label()))
            }))
            .await;

            for outcome in outcomes {
                let (id, result) = outcome.map_err(fatal)?;
                if let TaskResult::Cache(Some(entry)) = &result {
                    cache = Some(entry.clone());
                    ctx.cache = Some(entry.clone());
                }
                results.insert(id, result);
            }
        }

        let builds = schedule
            .builds
            .iter()
            .map(|(id, name)| match results.get(id) {
                Some(TaskResult::Build(record)) => record.clone(),
                _ => BuildRecord::failed(name, &not_run(), 0),
            })
            .collect();
        let checks = schedule
            .checks
            .iter()
            .map(|(id, spec)| match results.get(id) {
                Some(TaskResult::Check(result)) => result.clone(),
                _ => self.checks.blocked(spec, &ctx, &not_run().to_string()),
            })
            .collect();

        let report = RunReport {
            run_id: run_id.clone(),
            cache_key: ctx.cache_key.to_hex(),
            cache_reused: cache.as_ref().map(|c| c.reused),
            builds,
            checks,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        let failed = report.failed_tasks();
        obs::emit_run_finished(&run_id, report.duration_ms, failed, failed == 0);
        info!(failed_tasks = failed, duration_ms = report.duration_ms, "Run finished");
        Ok(report)
    }

    /// The bundle is built only when a task consumes it and the environment
    /// it compiles in was provisioned.
    async fn dependency_task(
        &self,
        workspace: &Workspace,
        request: &RunRequest,
    ) -> Result<Option<CacheEntry>> {
        if !request.needs_dependency_bundle() {
            return Ok(None);
        }
        if let Some(err) = &self.env_error {
            warn!(error = %err, "Skipping dependency bundle, environment not provisioned");
            return Ok(None);
        }
        self.cache.ensure(workspace).await.map(Some)
    }

    async fn build_task(
        &self,
        workspace: &Workspace,
        name: &str,
        cache: Option<&CacheEntry>,
    ) -> BuildRecord {
        let begin = Instant::now();
        if let Some(err) = self.environment_error(&format!("build:{}", name)) {
            return BuildRecord::failed(name, &err, 0);
        }
        let Some(cache) = cache else {
            let err = DepotError::Process("dependency bundle unavailable".to_string());
            return BuildRecord::failed(name, &err, 0);
        };
        match self.builder.build(workspace, name, cache).await {
            Ok(outcome) => BuildRecord::built(&outcome),
            Err(err) => BuildRecord::failed(name, &err, begin.elapsed().as_millis() as u64),
        }
    }

    async fn check_task(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckResult {
        if spec.kind.needs_dependency_artifacts() {
            if let Some(err) = self.environment_error(&format!("check:{}", spec.label())) {
                return self.checks.blocked(spec, ctx, &err.to_string());
            }
        }
        self.checks.run(spec, ctx).await
    }

    fn environment_error(&self, task: &str) -> Option<DepotError> {
        self.env_error.as_ref().map(|detail| DepotError::Environment {
            task: task.to_string(),
            detail: detail.clone(),
        })
    }

    /// Run a built executable with the provisioned environment, inheriting
    /// stdio. Returns the exit code.
    pub async fn launch(&self, executable: &Path, args: &[String]) -> Result<i32> {
        info!(executable = %executable.display(), "Launching");
        let status = tokio::process::Command::new(executable)
            .args(args)
            .envs(self.env.process_env_vars())
            .status()
            .await
            .map_err(|e| {
                DepotError::Process(format!("failed to launch {}: {}", executable.display(), e))
            })?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn not_run() -> DepotError {
    DepotError::Process("task was not scheduled".to_string())
}

/// Every check kind, or just `only` when given.
pub fn select_checks(only: &[CheckKind], shards: u32) -> Vec<CheckSpec> {
    if only.is_empty() {
        CheckSpec::plan(&CheckKind::ALL, shards)
    } else {
        CheckSpec::plan(only, shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeCheckExecutor;
    use depot_core::fakes::{FakeBackend, WorkspaceFixture};
    use depot_env::Platform;

    fn orchestrator(fixture: &WorkspaceFixture) -> (Orchestrator, Arc<FakeBackend>) {
        let store = Arc::new(ArtifactStore::open(fixture.store_root()).unwrap());
        let backend = Arc::new(FakeBackend::new());
        let orch = Orchestrator::new(
            store,
            backend.clone(),
            Arc::new(FakeCheckExecutor::new()),
            EnvironmentDescriptor::empty(Platform::current()),
            CheckSettings::from_config(&DepotConfig::default(), fixture.root()),
        );
        (orch, backend)
    }

    #[test]
    fn test_plan_levels() {
        let fixture = WorkspaceFixture::new();
        let ws = fixture.load();
        let (orch, _) = orchestrator(&fixture);
        let request = RunRequest {
            packages: vec!["alpha".to_string(), "beta".to_string()],
            checks: CheckSpec::plan(&[CheckKind::Format, CheckKind::Lint], 1),
        };

        let graph = orch.plan(&ws, &request).unwrap();
        let levels = graph.levels();
        let labels: Vec<Vec<String>> = levels
            .iter()
            .map(|l| l.iter().map(|n| n.kind.label()).collect())
            .collect();
        assert_eq!(
            labels,
            vec![
                vec!["check:format", "dependency-cache"],
                vec!["build:alpha", "build:beta", "check:lint"],
            ]
        );
    }

    #[test]
    fn test_plan_rejects_unknown_package() {
        let fixture = WorkspaceFixture::new();
        let ws = fixture.load();
        let (orch, _) = orchestrator(&fixture);
        let err = orch.plan(&ws, &RunRequest::builds(["nope"])).unwrap_err();
        assert!(matches!(err, DepotError::Resolution(_)));
    }

    #[test]
    fn test_needs_dependency_bundle() {
        assert!(!RunRequest::checks(CheckSpec::plan(&CheckKind::AUDITS, 1)).needs_dependency_bundle());
        assert!(RunRequest::checks(vec![CheckSpec::new(CheckKind::Doc)]).needs_dependency_bundle());
        assert!(RunRequest::builds(["alpha"]).needs_dependency_bundle());
    }

    #[test]
    fn test_select_checks() {
        assert_eq!(select_checks(&[], 2).len(), 9);
        let only = select_checks(&[CheckKind::Test], 3);
        assert_eq!(only.len(), 3);
        assert!(only.iter().all(|s| s.kind == CheckKind::Test));
    }

    #[tokio::test]
    async fn test_format_only_run_builds_no_bundle() {
        let fixture = WorkspaceFixture::new();
        let ws = fixture.load();
        let (orch, backend) = orchestrator(&fixture);

        let report = orch
            .run(&ws, &RunRequest::checks(vec![CheckSpec::new(CheckKind::Format)]))
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(report.cache_reused, None);
        assert_eq!(backend.dependency_builds(), 0);
    }

    #[tokio::test]
    async fn test_all_packages_skips_shared() {
        let fixture = WorkspaceFixture::new();
        let ws = fixture.load();
        let (orch, backend) = orchestrator(&fixture);

        let report = orch.run(&ws, &RunRequest::all_packages(&ws)).await.unwrap();
        let built: Vec<_> = report.builds.iter().map(|b| b.package.as_str()).collect();
        assert_eq!(built, vec!["alpha", "beta", "gamma"]);
        assert_eq!(backend.dependency_builds(), 1);
        assert_eq!(report.cache_reused, Some(false));
    }

    #[tokio::test]
    async fn test_provisioning_error_fails_only_compiling_tasks() {
        let fixture = WorkspaceFixture::new();
        let ws = fixture.load();
        let (orch, backend) = orchestrator(&fixture);
        let orch = orch.with_provisioning_error("native library 'jack' not found");
        assert_eq!(orch.provisioning_error(), Some("native library 'jack' not found"));

        let request = RunRequest {
            packages: vec!["alpha".to_string()],
            checks: CheckSpec::plan(&[CheckKind::Format, CheckKind::Lint], 1),
        };
        let report = orch.run(&ws, &request).await.unwrap();

        assert_eq!(backend.dependency_builds(), 0);
        assert_eq!(report.cache_reused, None);
        match &report.builds[0].status {
            crate::BuildStatus::Failed { category, message } => {
                assert_eq!(*category, depot_core::ErrorCategory::Environment);
                assert!(message.contains("jack"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        let format = report.checks.iter().find(|c| c.kind == CheckKind::Format).unwrap();
        assert!(format.outcome.is_passed());
        let lint = report.checks.iter().find(|c| c.kind == CheckKind::Lint).unwrap();
        assert!(!lint.outcome.is_passed());
        assert!(lint.diagnostics.contains("jack"));
    }

    #[tokio::test]
    async fn test_run_reports_in_request_order() {
        let fixture = WorkspaceFixture::new();
        let ws = fixture.load();
        let (orch, _) = orchestrator(&fixture);
        let request = RunRequest {
            packages: vec!["gamma".to_string(), "alpha".to_string()],
            checks: CheckSpec::plan(&[CheckKind::Lint, CheckKind::Format], 1),
        };

        let report = orch.run(&ws, &request).await.unwrap();
        let built: Vec<_> = report.builds.iter().map(|b| b.package.as_str()).collect();
        assert_eq!(built, vec!["gamma", "alpha"]);
        let labels: Vec<_> = report.checks.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["lint", "format"]);
        assert!(report.success());
    }
}
