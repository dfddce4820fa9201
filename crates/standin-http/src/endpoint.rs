//! Endpoints: named routing units owning an ordered rule list and a live
//! parameter table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::error::{Result, StandinError};
use crate::matcher::RequestMatcher;
use crate::request::StandinRequest;
use crate::response::{ResponseCreator, ResponseDefaults};

/// A named parameter with a default and an optional runtime override.
#[derive(Debug, Clone)]
pub struct EndpointParameter {
    pub name: String,
    pub default_value: String,
    pub description: Option<String>,
    /// None means "use the default".
    pub current_value: Option<String>,
}

impl EndpointParameter {
    pub fn new(name: impl Into<String>, default_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: default_value.into(),
            description: None,
            current_value: None,
        }
    }

    pub fn value(&self) -> &str {
        self.current_value.as_deref().unwrap_or(&self.default_value)
    }
}

/// The live parameter table of an endpoint. Clones share state, so scripts
/// and the test harness observe mutations immediately.
///
/// Writes are last-write-wins. This is a testing tool, not a transactional
/// system; the narrow interface keeps a synchronized implementation
/// substitutable without touching callers.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    inner: Arc<RwLock<HashMap<String, EndpointParameter>>>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, parameter: EndpointParameter) -> Result<()> {
        let mut table = self.inner.write();
        if table.contains_key(&parameter.name) {
            return Err(StandinError::DuplicateParameter(parameter.name));
        }
        table.insert(parameter.name.clone(), parameter);
        Ok(())
    }

    /// Current value if set, otherwise the default. None when undefined.
    pub fn value_of(&self, name: &str) -> Option<String> {
        self.inner.read().get(name).map(|p| p.value().to_string())
    }

    /// Override (or clear, with None) the runtime value of a parameter.
    pub fn set_current(&self, name: &str, value: Option<String>) -> Result<()> {
        let mut table = self.inner.write();
        match table.get_mut(name) {
            Some(parameter) => {
                parameter.current_value = value;
                Ok(())
            }
            None => Err(StandinError::ParameterNotFound(name.to_string())),
        }
    }

    /// Resolve a `*Spec` string: `$name` is parameter indirection, anything
    /// else is a literal. Resolution happens at every call, never cached, so
    /// later `set_current` calls change future behavior.
    pub fn resolve_spec(&self, spec: &str) -> Result<String> {
        match spec.strip_prefix('$') {
            Some(name) => self
                .value_of(name)
                .ok_or_else(|| StandinError::ParameterNotFound(name.to_string())),
            None => Ok(spec.to_string()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// An ordered (matcher, creator) pair. `priority` equals append order and is
/// immutable; rules are never reordered or removed.
#[derive(Debug, Clone)]
pub struct Rule {
    pub priority: usize,
    pub matcher: RequestMatcher,
    pub creator: ResponseCreator,
}

/// Result of resolving a request against an endpoint's rules.
#[derive(Debug, Clone, Copy)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    /// True only if exactly one rule matched. Multiple matches are not fatal
    /// here: rule ordering is the documented tie-break within an endpoint.
    pub single_match: bool,
}

/// A named routing unit. Identity (`name`, path pattern) is immutable; the
/// rule list is append-only; parameters stay mutable for the process
/// lifetime.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    path_pattern: Regex,
    base_dir: PathBuf,
    defaults: ResponseDefaults,
    rules: Vec<Rule>,
    parameters: ParameterTable,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, path_pattern: &str) -> Result<Self> {
        let pattern = Regex::new(path_pattern).map_err(|e| StandinError::InvalidPattern {
            pattern: path_pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: name.into(),
            path_pattern: pattern,
            base_dir: PathBuf::from("."),
            defaults: ResponseDefaults::default(),
            rules: Vec::new(),
            parameters: ParameterTable::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path_pattern(&self) -> &str {
        self.path_pattern.as_str()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn set_base_dir(&mut self, dir: impl Into<PathBuf>) {
        self.base_dir = dir.into();
    }

    pub fn defaults(&self) -> &ResponseDefaults {
        &self.defaults
    }

    pub fn set_defaults(&mut self, defaults: ResponseDefaults) {
        self.defaults = defaults;
    }

    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Append a rule. Fails once a prior catch-all rule sealed the endpoint:
    /// anything appended after it could never be reached.
    pub fn add_rule(&mut self, matcher: RequestMatcher, creator: ResponseCreator) -> Result<()> {
        if self.rules.iter().any(|r| r.matcher.is_catch_all()) {
            return Err(StandinError::EndpointSealed(self.name.clone()));
        }
        self.rules.push(Rule {
            priority: self.rules.len(),
            matcher,
            creator,
        });
        Ok(())
    }

    /// Regex search of the endpoint's path pattern against the raw path.
    pub fn matches(&self, path: &str) -> bool {
        self.path_pattern.is_match(path)
    }

    /// Scan rules in priority order; the first match wins. Counting stops at
    /// two matches since only "more than one" matters for `single_match`.
    pub fn resolve(&self, request: &StandinRequest) -> Result<Option<RuleMatch<'_>>> {
        let mut first: Option<&Rule> = None;
        let mut matched = 0usize;
        for rule in &self.rules {
            if rule.matcher.matches(request)? {
                matched += 1;
                if first.is_none() {
                    first = Some(rule);
                }
                if matched > 1 {
                    break;
                }
            }
        }
        Ok(first.map(|rule| {
            let single_match = matched == 1;
            if !single_match {
                debug!(
                    endpoint = %self.name,
                    rule = rule.priority,
                    "multiple rules matched; first rule wins by priority"
                );
            }
            RuleMatch { rule, single_match }
        }))
    }
}
