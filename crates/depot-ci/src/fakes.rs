//! Fakes for tests (testing only)
//!
//! `FakeCheckExecutor` stands in for cargo-driven checks. External kinds
//! pass unless scripted otherwise; native kinds run for real against the
//! context unless scripted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::check::CheckKind;
use crate::runner::{run_native, CheckContext, CheckExecution, CheckExecutor, CheckOutcome};
use crate::spec::CheckSpec;

#[derive(Debug, Clone)]
enum Script {
    Fail(Vec<String>),
    Error(String),
    Report(String),
}

#[derive(Debug, Default)]
struct ExecutorState {
    scripts: HashMap<CheckKind, Script>,
    executions: HashMap<CheckKind, usize>,
    labels: Vec<String>,
    without_bundle: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Scripted check executor that records every execution.
#[derive(Debug, Default)]
pub struct FakeCheckExecutor {
    state: Mutex<ExecutorState>,
    delay: Option<Duration>,
}

impl FakeCheckExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every execution.
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    /// Make `kind` fail with `findings`.
    pub fn fail(&self, kind: CheckKind, findings: &[&str]) {
        self.state.lock().unwrap().scripts.insert(
            kind,
            Script::Fail(findings.iter().map(|f| f.to_string()).collect()),
        );
    }

    /// Make `kind` unable to run.
    pub fn error(&self, kind: CheckKind, message: &str) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(kind, Script::Error(message.to_string()));
    }

    /// Make `kind` pass with `report` as its report artifact.
    pub fn report(&self, kind: CheckKind, report: &str) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(kind, Script::Report(report.to_string()));
    }

    pub fn executions(&self, kind: CheckKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .executions
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Labels of executed checks, in start order.
    pub fn labels(&self) -> Vec<String> {
        self.state.lock().unwrap().labels.clone()
    }

    /// Labels of checks that needed the dependency bundle but ran without one.
    pub fn ran_without_bundle(&self) -> Vec<String> {
        self.state.lock().unwrap().without_bundle.clone()
    }

    /// Highest number of executions observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

#[async_trait]
impl CheckExecutor for FakeCheckExecutor {
    async fn execute(
        &self,
        spec: &CheckSpec,
        ctx: &CheckContext<'_>,
    ) -> anyhow::Result<CheckExecution> {
        let script = {
            let mut state = self.state.lock().unwrap();
            *state.executions.entry(spec.kind).or_default() += 1;
            state.labels.push(spec.label());
            if spec.kind.needs_dependency_artifacts() && ctx.cache.is_none() {
                state.without_bundle.push(spec.label());
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.scripts.get(&spec.kind).cloned()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().in_flight -= 1;

        match script {
            Some(Script::Fail(findings)) => Ok(CheckExecution {
                outcome: CheckOutcome::Failed { findings },
                diagnostics: format!("{} failed", spec.label()),
                report: None,
            }),
            Some(Script::Error(message)) => Err(anyhow::anyhow!(message)),
            Some(Script::Report(report)) => Ok(CheckExecution {
                report: Some(report),
                ..CheckExecution::passed(format!("{} ok", spec.label()))
            }),
            None => match run_native(spec.kind, ctx) {
                Some(result) => result,
                None => Ok(CheckExecution::passed(format!("{} ok", spec.label()))),
            },
        }
    }
}
