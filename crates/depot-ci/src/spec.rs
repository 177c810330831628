//! Check task specifications and keys.

use serde::{Deserialize, Serialize};

use crate::check::{CheckKind, TestPartition};
use depot_core::{CacheKey, Digest, DigestBuilder};

/// One check task: a kind plus, for tests, its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckSpec {
    pub kind: CheckKind,
    pub partition: Option<TestPartition>,
}

impl CheckSpec {
    pub fn new(kind: CheckKind) -> Self {
        Self {
            kind,
            partition: None,
        }
    }

    pub fn test_shard(partition: TestPartition) -> Self {
        Self {
            kind: CheckKind::Test,
            partition: Some(partition),
        }
    }

    /// Expand `kinds` into tasks, splitting tests into `shards` partitions.
    /// Duplicate kinds collapse into one task.
    pub fn plan(kinds: &[CheckKind], shards: u32) -> Vec<CheckSpec> {
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();

        let mut specs = Vec::new();
        for kind in kinds {
            if kind.is_partitioned() {
                specs.extend(TestPartition::all(shards).into_iter().map(CheckSpec::test_shard));
            } else {
                specs.push(CheckSpec::new(kind));
            }
        }
        specs
    }

    /// Label used in logs and reports: `test[2/4]`, `lint`.
    pub fn label(&self) -> String {
        match self.partition {
            Some(p) => format!("{}[{}]", self.kind, p),
            None => self.kind.to_string(),
        }
    }

    /// `H("check", kind, partition, cache key, workspace sources)`, plus the
    /// digest of any external snapshot the check reads.
    pub fn key(&self, cache_key: &CacheKey, sources: &Digest, auxiliary: Option<&Digest>) -> Digest {
        let partition = self.partition.map(|p| p.to_string()).unwrap_or_default();
        let mut builder = DigestBuilder::new("check")
            .field("kind", self.kind.name().as_bytes())
            .field("partition", partition.as_bytes())
            .field("cache", cache_key.digest().as_bytes())
            .field("sources", sources.as_bytes());
        if let Some(aux) = auxiliary {
            builder.update_field("auxiliary", aux.as_bytes());
        }
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_expands_test_shards() {
        let specs = CheckSpec::plan(&[CheckKind::Lint, CheckKind::Test, CheckKind::Lint], 3);
        let labels: Vec<_> = specs.iter().map(CheckSpec::label).collect();
        assert_eq!(labels, vec!["lint", "test[1/3]", "test[2/3]", "test[3/3]"]);
    }

    #[test]
    fn test_plan_all_kinds() {
        let specs = CheckSpec::plan(&CheckKind::ALL, 1);
        assert_eq!(specs.len(), 8);
        assert_eq!(specs[6].label(), "test[1/1]");
    }

    #[test]
    fn test_key_inputs() {
        let cache = CacheKey::from_canonical(b"m", b"", b"l");
        let sources = Digest::compute(b"ws");
        let lint = CheckSpec::new(CheckKind::Lint);
        let base = lint.key(&cache, &sources, None);

        assert_eq!(base, lint.key(&cache, &sources, None));
        assert_ne!(base, CheckSpec::new(CheckKind::Doc).key(&cache, &sources, None));
        assert_ne!(base, lint.key(&cache, &Digest::compute(b"edited"), None));
        assert_ne!(
            base,
            lint.key(&CacheKey::from_canonical(b"m", b"", b"l2"), &sources, None)
        );
        assert_ne!(base, lint.key(&cache, &sources, Some(&Digest::compute(b"db"))));

        let one = CheckSpec::test_shard(TestPartition::new(1, 2).unwrap());
        let two = CheckSpec::test_shard(TestPartition::new(2, 2).unwrap());
        assert_ne!(one.key(&cache, &sources, None), two.key(&cache, &sources, None));
    }
}
