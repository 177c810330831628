//! Dependency aggregation consistency.
//!
//! The aggregation package (`workspace-hack`) declares every external
//! dependency with the union of the features any member requests, so all
//! members resolve to one feature set per dependency and share one set of
//! compiled artifacts. This check verifies the aggregation manifest still
//! expresses that union.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;

use depot_core::workspace::MANIFEST_FILE;
use depot_core::{DependencySpec, PackageManifest, Workspace};

/// Union of the requirements every member places on one dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirement {
    pub features: BTreeSet<String>,
    pub default_features: bool,
    /// Members requiring it.
    pub required_by: BTreeSet<String>,
}

/// External dependency requirements across the workspace, keyed by real
/// package name. The aggregation package itself is excluded.
pub fn required_union(workspace: &Workspace) -> BTreeMap<String, Requirement> {
    let aggregation = workspace.aggregation_root();
    let mut union: BTreeMap<String, Requirement> = BTreeMap::new();
    for package in workspace.packages() {
        if Some(package.root.as_path()) == aggregation {
            continue;
        }
        for spec in package.dependencies.values().filter(|d| is_external(d)) {
            let entry = union.entry(spec.package.clone()).or_default();
            entry.features.extend(spec.features.iter().cloned());
            entry.default_features |= spec.default_features;
            entry.required_by.insert(package.name.clone());
        }
    }
    union
}

fn is_external(spec: &DependencySpec) -> bool {
    spec.path.is_none()
}

/// Findings for every way the aggregation manifest fails to express the
/// union of member requirements. Empty means consistent.
pub fn check_consistency(workspace: &Workspace) -> anyhow::Result<Vec<String>> {
    let Some(root) = workspace.aggregation_root() else {
        return Ok(vec!["aggregation package not found in workspace".to_string()]);
    };
    let path = workspace.root().join(root).join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let manifest = PackageManifest::parse(&content, &path)?;
    let declared: BTreeMap<String, DependencySpec> = manifest
        .resolve_workspace_dependencies(workspace.manifest())?
        .into_values()
        .filter(is_external)
        .map(|spec| (spec.package.clone(), spec))
        .collect();

    let mut findings = Vec::new();
    for (name, required) in required_union(workspace) {
        let users = required.required_by.iter().cloned().collect::<Vec<_>>().join(", ");
        let Some(spec) = declared.get(&name) else {
            findings.push(format!("{}: used by {} but missing from the aggregation manifest", name, users));
            continue;
        };
        let missing: Vec<_> = required.features.difference(&spec.features).cloned().collect();
        if !missing.is_empty() {
            findings.push(format!(
                "{}: aggregation manifest lacks features [{}] required by {}",
                name,
                missing.join(", "),
                users
            ));
        }
        if required.default_features && !spec.default_features {
            findings.push(format!(
                "{}: default features disabled in the aggregation manifest but enabled by {}",
                name, users
            ));
        }
    }

    let pinned = workspace.lock().names();
    for name in declared.keys() {
        if !pinned.contains(name.as_str()) {
            findings.push(format!("{}: declared by the aggregation manifest but not pinned in the lock", name));
        }
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::fakes::WorkspaceFixture;

    #[test]
    fn test_fixture_is_consistent() {
        let fixture = WorkspaceFixture::new();
        let findings = check_consistency(&fixture.load()).unwrap();
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[test]
    fn test_union_collects_features() {
        let fixture = WorkspaceFixture::new();
        let union = required_union(&fixture.load());
        assert!(union["serde"].features.contains("derive"));
        assert_eq!(
            union["serde"].required_by.iter().collect::<Vec<_>>(),
            vec!["alpha", "common", "gamma"]
        );
        assert!(!union.contains_key("common"));
    }

    #[test]
    fn test_missing_feature_reported() {
        let fixture = WorkspaceFixture::new();
        fixture.write(
            "crates/gamma/Cargo.toml",
            "[package]\nname = \"gamma\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = { workspace = true, features = [\"rc\"] }\n",
        );
        let findings = check_consistency(&fixture.load()).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].contains("[rc]"));
        assert!(findings[0].contains("gamma"));
    }

    #[test]
    fn test_missing_dependency_reported() {
        let fixture = WorkspaceFixture::new();
        fixture.write(
            "crates/workspace-hack/Cargo.toml",
            "[package]\nname = \"workspace-hack\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = { version = \"1.0\", features = [\"derive\"] }\n",
        );
        let findings = check_consistency(&fixture.load()).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].starts_with("crossbeam: used by beta"));
    }

    #[test]
    fn test_disabled_default_features_reported() {
        let fixture = WorkspaceFixture::new();
        fixture.write(
            "crates/workspace-hack/Cargo.toml",
            "[package]\nname = \"workspace-hack\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = { version = \"1.0\", features = [\"derive\"] }\ncrossbeam = { version = \"0.8\", default-features = false }\n",
        );
        let findings = check_consistency(&fixture.load()).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].contains("default features disabled"));
    }

    #[test]
    fn test_missing_aggregation_package() {
        let fixture = WorkspaceFixture::new();
        let config = depot_core::WorkspaceConfig {
            aggregation: None,
            ..Default::default()
        };
        let ws = depot_core::WorkspaceDescriptor::load(fixture.root(), &config).unwrap();
        let findings = check_consistency(&ws).unwrap();
        assert_eq!(findings, vec!["aggregation package not found in workspace"]);
    }
}
