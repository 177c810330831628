//! Task graph.
//!
//! Tasks live in an arena keyed by a digest of their declared inputs, so
//! adding the same task twice yields the same node. An edge `A -> B` means
//! B consumes A's output. Levels are computed with Kahn's algorithm: level 0
//! is the dependency cache, level 1 the package builds and checks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cas::{Digest, DigestBuilder};

/// Stable task identifier derived from the task's inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Digest);

impl TaskId {
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0.short())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.short())
    }
}

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    DependencyCache,
    PackageBuild { package: String },
    Check { check: String, shard: Option<String> },
}

impl TaskKind {
    /// Short label used in logs and reports, e.g. `build:alpha`.
    pub fn label(&self) -> String {
        match self {
            TaskKind::DependencyCache => "dependency-cache".to_string(),
            TaskKind::PackageBuild { package } => format!("build:{}", package),
            TaskKind::Check { check, shard: None } => format!("check:{}", check),
            TaskKind::Check {
                check,
                shard: Some(shard),
            } => format!("check:{}[{}]", check, shard),
        }
    }
}

/// One node in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Digest of the task's declared inputs.
    pub inputs: Digest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {0} is not in the graph")]
    UnknownTask(TaskId),

    #[error("edge {from} -> {to} would create a cycle")]
    Cycle { from: TaskId, to: TaskId },
}

/// Arena of tasks and their data dependencies.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: BTreeMap<TaskId, TaskNode>,
    /// `producer -> consumers`
    downstream: BTreeMap<TaskId, BTreeSet<TaskId>>,
    /// `consumer -> producers`
    upstream: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task, returning its id. Re-adding an identical task is a
    /// no-op that returns the existing id.
    pub fn add(&mut self, kind: TaskKind, inputs: Digest) -> TaskId {
        let kind_bytes = serde_json::to_vec(&kind).unwrap_or_default();
        let id = TaskId(
            DigestBuilder::new("task")
                .field("kind", &kind_bytes)
                .field("inputs", inputs.as_bytes())
                .finish(),
        );
        self.nodes.entry(id).or_insert(TaskNode { id, kind, inputs });
        self.downstream.entry(id).or_default();
        self.upstream.entry(id).or_default();
        id
    }

    /// Declare that `consumer` reads the output of `producer`.
    pub fn depend(&mut self, producer: TaskId, consumer: TaskId) -> Result<(), GraphError> {
        for id in [producer, consumer] {
            if !self.nodes.contains_key(&id) {
                return Err(GraphError::UnknownTask(id));
            }
        }
        if producer == consumer || self.reaches(consumer, producer) {
            return Err(GraphError::Cycle {
                from: producer,
                to: consumer,
            });
        }
        self.downstream.entry(producer).or_default().insert(consumer);
        self.upstream.entry(consumer).or_default().insert(producer);
        Ok(())
    }

    fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(next) = self.downstream.get(&id) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Producers `id` waits for.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.upstream
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|p| self.nodes.get(p))
            .collect()
    }

    /// Tasks grouped by level; tasks within a level are independent.
    /// Ordering inside a level is by label for stable output.
    pub fn levels(&self) -> Vec<Vec<&TaskNode>> {
        let mut in_degree: BTreeMap<TaskId, usize> = self
            .nodes
            .keys()
            .map(|id| (*id, self.upstream.get(id).map_or(0, BTreeSet::len)))
            .collect();

        let mut current: VecDeque<TaskId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut levels = Vec::new();
        while !current.is_empty() {
            let mut level: Vec<&TaskNode> = current.iter().filter_map(|id| self.nodes.get(id)).collect();
            level.sort_by_key(|n| n.kind.label());

            let mut next = VecDeque::new();
            for id in current.drain(..) {
                for consumer in self.downstream.get(&id).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(consumer) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push_back(*consumer);
                        }
                    }
                }
            }
            levels.push(level);
            current = next;
        }
        levels
    }
}
