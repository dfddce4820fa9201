//! Declarative test evaluation and coverage tracking.
//!
//! Test cases replay through the identical Registry -> Endpoint -> Matcher ->
//! Creator path used by live traffic. Synthesis (script execution, upstream
//! forwarding) only runs when an expectation actually needs the rendered
//! response.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, StandinError};
use crate::registry::EndpointRegistry;
use crate::request::StandinRequest;
use crate::response::SynthesisEnv;
use crate::scripting::ScriptCache;

/// Expected outcome fields of a test case. Unset fields are not checked.
#[derive(Debug, Clone, Default)]
pub struct TestExpectation {
    pub matcher: Option<String>,
    pub creator: Option<String>,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub status_code: Option<u16>,
}

impl TestExpectation {
    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
            && self.creator.is_none()
            && self.body.is_none()
            && self.content_type.is_none()
            && self.charset.is_none()
            && self.status_code.is_none()
    }

    /// Whether the response must actually be rendered to check this
    /// expectation. Kept false for description-only tests to avoid side
    /// effects.
    pub fn needs_synthesis(&self) -> bool {
        self.body.is_some()
            || self.content_type.is_some()
            || self.charset.is_some()
            || self.status_code.is_some()
    }
}

/// A declarative test case: request inputs plus expectations.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: Option<String>,
    pub request: StandinRequest,
    pub expect: TestExpectation,
}

/// The rule a test execution reached, for coverage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulePointer {
    pub endpoint: String,
    pub rule: usize,
}

impl RulePointer {
    pub fn id(&self) -> String {
        format!("{}#{}", self.endpoint, self.rule)
    }
}

/// Outcome of a single test case.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "camelCase")]
pub enum TestOutcome {
    Ok,
    /// A specific expectation mismatched; carries the first mismatch only.
    Fail(String),
    /// An exception occurred during resolution or synthesis.
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub outcome: TestOutcome,
    /// Set whenever rule resolution succeeded, pass or fail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reached: Option<RulePointer>,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, TestOutcome::Ok)
    }
}

/// Aggregated coverage at endpoint and endpoint#ruleIndex granularity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageInfo {
    pub covered_endpoints: BTreeSet<String>,
    pub uncovered_endpoints: BTreeSet<String>,
    pub covered_rules: BTreeSet<String>,
    pub uncovered_rules: BTreeSet<String>,
}

/// Records which rules test executions reached.
#[derive(Debug, Default)]
pub struct CoverageTracker {
    reached: BTreeSet<(String, usize)>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, pointer: &RulePointer) {
        self.reached.insert((pointer.endpoint.clone(), pointer.rule));
    }

    /// Derive covered/uncovered sets against the registry's full rule space.
    pub fn info(&self, registry: &EndpointRegistry) -> CoverageInfo {
        let mut info = CoverageInfo {
            covered_endpoints: BTreeSet::new(),
            uncovered_endpoints: BTreeSet::new(),
            covered_rules: BTreeSet::new(),
            uncovered_rules: BTreeSet::new(),
        };
        for endpoint in registry.iter() {
            let name = endpoint.name();
            let endpoint_hit = self.reached.iter().any(|(e, _)| e == name);
            if endpoint_hit {
                info.covered_endpoints.insert(name.to_string());
            } else {
                info.uncovered_endpoints.insert(name.to_string());
            }
            for rule in endpoint.rules() {
                let id = format!("{name}#{}", rule.priority);
                if self.reached.contains(&(name.to_string(), rule.priority)) {
                    info.covered_rules.insert(id);
                } else {
                    info.uncovered_rules.insert(id);
                }
            }
        }
        info
    }
}

/// Summary row for the "list all tests" diagnostic query.
#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub method: String,
    pub path: String,
}

/// Rendered response for the "show resolved response" diagnostic query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReport {
    pub matcher: String,
    pub creator: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    pub body: String,
}

/// Batch run report: per-case results plus aggregate coverage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub coverage: CoverageInfo,
}

/// Drives the registry with declarative test cases.
pub struct TestEvaluator<'a> {
    registry: &'a EndpointRegistry,
    scripts: &'a ScriptCache,
    /// Debugging mode: propagate exceptions instead of capturing them as
    /// `Error` outcomes.
    pub error_passthrough: bool,
}

impl<'a> TestEvaluator<'a> {
    pub fn new(registry: &'a EndpointRegistry, scripts: &'a ScriptCache) -> Self {
        Self {
            registry,
            scripts,
            error_passthrough: false,
        }
    }

    pub fn list_tests(cases: &[TestCase]) -> Vec<TestSummary> {
        cases
            .iter()
            .enumerate()
            .map(|(index, case)| TestSummary {
                index,
                name: case.name.clone(),
                method: case.request.method.clone(),
                path: case.request.path.clone(),
            })
            .collect()
    }

    /// Run one case. Only an error-passthrough evaluator returns `Err`; by
    /// default exceptions are captured into the result.
    pub async fn run_case(&self, index: usize, case: &TestCase) -> Result<TestResult> {
        let mut reached = None;
        let outcome = match self.evaluate(case, &mut reached).await {
            Ok(outcome) => outcome,
            Err(e) if self.error_passthrough => return Err(e),
            Err(e) => TestOutcome::Error(e.to_string()),
        };
        Ok(TestResult {
            index,
            name: case.name.clone(),
            outcome,
            reached,
        })
    }

    /// Run every case and aggregate coverage. A single case's exception never
    /// aborts the batch unless error passthrough is on.
    pub async fn run_all(&self, cases: &[TestCase]) -> Result<BatchReport> {
        let mut results = Vec::with_capacity(cases.len());
        let mut tracker = CoverageTracker::new();
        for (index, case) in cases.iter().enumerate() {
            let result = self.run_case(index, case).await?;
            if let Some(pointer) = &result.reached {
                tracker.record(pointer);
            }
            results.push(result);
        }
        let passed = results.iter().filter(|r| r.passed()).count();
        let failed = results
            .iter()
            .filter(|r| matches!(r.outcome, TestOutcome::Fail(_)))
            .count();
        let errored = results
            .iter()
            .filter(|r| matches!(r.outcome, TestOutcome::Error(_)))
            .count();
        debug!(passed, failed, errored, "batch run complete");
        Ok(BatchReport {
            results,
            passed,
            failed,
            errored,
            coverage: tracker.info(self.registry),
        })
    }

    /// Resolve and fully render the response for a case, regardless of its
    /// expectations. Read-only diagnostic surface.
    pub async fn show_response(&self, case: &TestCase) -> Result<ResponseReport> {
        let endpoint = self
            .registry
            .resolve(&case.request.path)?
            .ok_or_else(|| {
                StandinError::Configuration(format!(
                    "no endpoint matches path '{}'",
                    case.request.path
                ))
            })?;
        let matched = endpoint.resolve(&case.request)?.ok_or_else(|| {
            StandinError::Configuration("no rule matched the test request".to_string())
        })?;
        let env = SynthesisEnv {
            parameters: endpoint.parameters(),
            base_dir: endpoint.base_dir(),
            defaults: endpoint.defaults(),
            scripts: self.scripts,
        };
        let response = matched.rule.creator.synthesize(&case.request, &env).await?;
        Ok(ResponseReport {
            matcher: matched.rule.matcher.describe(),
            creator: matched.rule.creator.describe(),
            status: response.status,
            content_type: response.content_type.clone(),
            charset: response.charset.clone(),
            body: response.body_text(),
        })
    }

    /// Comparison order: matcher -> creator -> body -> content type ->
    /// charset -> status code. The first mismatch stops evaluation.
    async fn evaluate(
        &self,
        case: &TestCase,
        reached: &mut Option<RulePointer>,
    ) -> Result<TestOutcome> {
        if case.expect.is_empty() {
            return Ok(TestOutcome::Fail("test has no expectations".to_string()));
        }

        let Some(endpoint) = self.registry.resolve(&case.request.path)? else {
            return Ok(TestOutcome::Fail(format!(
                "no endpoint matches path '{}'",
                case.request.path
            )));
        };
        let Some(matched) = endpoint.resolve(&case.request)? else {
            return Ok(TestOutcome::Fail(format!(
                "no rule of endpoint '{}' matched the request",
                endpoint.name()
            )));
        };
        *reached = Some(RulePointer {
            endpoint: endpoint.name().to_string(),
            rule: matched.rule.priority,
        });

        if let Some(expected) = &case.expect.matcher {
            let actual = matched.rule.matcher.describe();
            if *expected != actual {
                return Ok(mismatch("matcher", expected, &actual));
            }
        }
        if let Some(expected) = &case.expect.creator {
            let actual = matched.rule.creator.describe();
            if *expected != actual {
                return Ok(mismatch("creator", expected, &actual));
            }
        }

        if !case.expect.needs_synthesis() {
            return Ok(TestOutcome::Ok);
        }

        let env = SynthesisEnv {
            parameters: endpoint.parameters(),
            base_dir: endpoint.base_dir(),
            defaults: endpoint.defaults(),
            scripts: self.scripts,
        };
        let response = matched.rule.creator.synthesize(&case.request, &env).await?;

        if let Some(expected) = &case.expect.body {
            let actual = response.body_text();
            if *expected != actual {
                return Ok(mismatch("body", expected, &actual));
            }
        }
        if let Some(expected) = &case.expect.content_type {
            let actual = response.content_type.clone().unwrap_or_default();
            if *expected != actual {
                return Ok(mismatch("content type", expected, &actual));
            }
        }
        if let Some(expected) = &case.expect.charset {
            let actual = response.charset.clone().unwrap_or_default();
            if *expected != actual {
                return Ok(mismatch("charset", expected, &actual));
            }
        }
        if let Some(expected) = case.expect.status_code {
            if expected != response.status {
                return Ok(mismatch(
                    "status code",
                    &expected.to_string(),
                    &response.status.to_string(),
                ));
            }
        }

        Ok(TestOutcome::Ok)
    }
}

fn mismatch(field: &str, expected: &str, actual: &str) -> TestOutcome {
    TestOutcome::Fail(format!("expected {field} '{expected}', got '{actual}'"))
}
