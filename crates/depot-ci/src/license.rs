//! License audit.
//!
//! Licenses come from a snapshot file rather than the registry, so the
//! audit is a pure function of the lock, the snapshot and the policy:
//!
//! ```toml
//! [licenses]
//! serde = "MIT OR Apache-2.0"
//! "ring@0.17.8" = "ISC AND MIT AND OpenSSL"
//! ```
//!
//! A `name@version` entry takes precedence over a plain `name` entry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use depot_core::LockArtifact;

/// Parsed SPDX license expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseExpr {
    License(String),
    With(String, String),
    And(Box<LicenseExpr>, Box<LicenseExpr>),
    Or(Box<LicenseExpr>, Box<LicenseExpr>),
}

impl LicenseExpr {
    /// Parse an SPDX expression. `/` is accepted as a legacy `OR`.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let tokens = tokenize(input);
        if tokens.is_empty() {
            bail!("empty license expression");
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if parser.pos != parser.tokens.len() {
            bail!(
                "unexpected '{}' in license expression '{}'",
                parser.tokens[parser.pos],
                input
            );
        }
        Ok(expr)
    }

    /// Whether the expression is satisfiable under `policy`.
    pub fn satisfied_by(&self, policy: &LicensePolicy) -> bool {
        match self {
            LicenseExpr::License(id) => policy.allows_id(id),
            LicenseExpr::With(id, exception) => {
                policy.allows_id(&format!("{} WITH {}", id, exception))
                    || (policy.allows_id(id) && policy.allows_id(exception))
            }
            LicenseExpr::And(a, b) => a.satisfied_by(policy) && b.satisfied_by(policy),
            LicenseExpr::Or(a, b) => a.satisfied_by(policy) || b.satisfied_by(policy),
        }
    }
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in input.chars() {
        match ch {
            '(' | ')' | '/' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(if ch == '/' { "OR".to_string() } else { ch.to_string() });
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Option<String> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> anyhow::Result<LicenseExpr> {
        let mut left = self.and()?;
        while self.peek().is_some_and(|t| t.eq_ignore_ascii_case("OR")) {
            self.pos += 1;
            let right = self.and()?;
            left = LicenseExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> anyhow::Result<LicenseExpr> {
        let mut left = self.with()?;
        while self.peek().is_some_and(|t| t.eq_ignore_ascii_case("AND")) {
            self.pos += 1;
            let right = self.with()?;
            left = LicenseExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn with(&mut self) -> anyhow::Result<LicenseExpr> {
        let atom = self.atom()?;
        if self.peek().is_some_and(|t| t.eq_ignore_ascii_case("WITH")) {
            self.pos += 1;
            let exception = match self.next() {
                Some(e) if !is_operator(&e) => e,
                other => bail!("expected exception after WITH, found {:?}", other),
            };
            return match atom {
                LicenseExpr::License(id) => Ok(LicenseExpr::With(id, exception)),
                _ => bail!("WITH must follow a single license"),
            };
        }
        Ok(atom)
    }

    fn atom(&mut self) -> anyhow::Result<LicenseExpr> {
        match self.next() {
            Some(t) if t == "(" => {
                let inner = self.or()?;
                match self.next() {
                    Some(t) if t == ")" => Ok(inner),
                    _ => bail!("unbalanced parentheses in license expression"),
                }
            }
            Some(t) if !is_operator(&t) && t != ")" => Ok(LicenseExpr::License(t)),
            other => bail!("expected a license identifier, found {:?}", other),
        }
    }
}

fn is_operator(token: &str) -> bool {
    ["AND", "OR", "WITH"]
        .iter()
        .any(|op| token.eq_ignore_ascii_case(op))
}

/// Allow-list of SPDX identifiers (and `X WITH Y` combinations).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicensePolicy {
    allowed: BTreeSet<String>,
}

impl LicensePolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    fn allows_id(&self, id: &str) -> bool {
        let id = id.trim_end_matches('+');
        self.allowed.contains(id)
    }
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    licenses: BTreeMap<String, String>,
}

/// Package license snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseSnapshot {
    licenses: BTreeMap<String, String>,
}

impl LicenseSnapshot {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw: RawSnapshot = toml::from_str(content).context("invalid license snapshot")?;
        Ok(Self {
            licenses: raw.licenses,
        })
    }

    /// Load the snapshot at `path`; a missing file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("license snapshot not readable at {}", path.display()))?;
        Self::parse(&content)
    }

    /// License expression for `name` at `version`.
    pub fn license_for(&self, name: &str, version: &str) -> Option<&str> {
        self.licenses
            .get(&format!("{}@{}", name, version))
            .or_else(|| self.licenses.get(name))
            .map(String::as_str)
    }
}

/// Findings for every registry dependency whose license is unknown,
/// unparsable or not allowed.
pub fn audit_licenses(
    lock: &LockArtifact,
    snapshot: &LicenseSnapshot,
    policy: &LicensePolicy,
) -> Vec<String> {
    let mut findings = Vec::new();
    for pkg in lock.external_packages() {
        let Some(license) = snapshot.license_for(&pkg.name, &pkg.version) else {
            findings.push(format!("{} {}: license unknown", pkg.name, pkg.version));
            continue;
        };
        match LicenseExpr::parse(license) {
            Ok(expr) if expr.satisfied_by(policy) => {}
            Ok(_) => findings.push(format!(
                "{} {}: license '{}' is not allowed",
                pkg.name, pkg.version, license
            )),
            Err(e) => findings.push(format!("{} {}: {}", pkg.name, pkg.version, e)),
        }
    }
    findings
}
