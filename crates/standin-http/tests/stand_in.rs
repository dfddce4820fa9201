//! End-to-end tests: declarative config through the loader, the routing and
//! synthesis path, and the test harness with coverage.

use std::path::Path;
use std::sync::Arc;

use standin_http::config::StandinConfig;
use standin_http::harness::{TestCase, TestEvaluator, TestExpectation, TestOutcome};
use standin_http::scripting::{ScriptCache, ScriptCacheConfig};
use standin_http::{StandinError, StandinRequest};

const CONFIG: &str = r#"
defaults:
  contentType: application/xml
  charset: utf-8
endpoints:
  - name: orders
    pathPattern: "^/orders"
    parameters:
      - name: status
        default: "200"
    rules:
      - matcher:
          regex: urgent
        response:
          literal: "<order priority='high'/>"
          contentType: text/xml
      - matcher:
          methods: [POST]
          xpath: "/order/@id = '42'"
        response:
          script: |
            ctx.set_content_type("application/json");
            "{\"id\": 42, \"path\": \"" + ctx.path + "\"}"
      - response:
          literal: fallback
          statusCode: $status
          replacements:
            - search: fall
              replace: FALL
  - name: health
    pathPattern: "^/health$"
    rules:
      - response:
          literal: ok
tests:
  - name: urgent order
    method: GET
    path: /orders/1
    body: urgent
    expect:
      matcher: regex(urgent)
      creator: literal
      body: "<order priority='high'/>"
      contentType: text/xml
      charset: utf-8
      statusCode: 200
  - name: scripted order
    method: POST
    path: /orders
    body: "<order id='42'/>"
    expect:
      contentType: application/json
      body: "{\"id\": 42, \"path\": \"/orders\"}"
  - name: fallback
    method: GET
    path: /orders/other
    expect:
      body: FALLback
"#;

fn scripts() -> ScriptCache {
    ScriptCache::new(ScriptCacheConfig::default())
}

fn load() -> (standin_http::EndpointRegistry, Vec<TestCase>) {
    let config: StandinConfig = serde_yaml::from_str(CONFIG).expect("config parses");
    let registry = config.build_registry(Path::new(".")).expect("registry builds");
    let tests = config.build_tests(Path::new(".")).expect("tests build");
    (registry, tests)
}

#[tokio::test]
async fn declared_tests_all_pass_and_cover_rules() {
    let (registry, tests) = load();
    let scripts = scripts();
    let evaluator = TestEvaluator::new(&registry, &scripts);

    let report = evaluator.run_all(&tests).await.unwrap();
    for result in &report.results {
        assert!(
            result.passed(),
            "case {} failed: {:?}",
            result.index,
            result.outcome
        );
    }
    assert_eq!(report.passed, 3);

    let coverage = &report.coverage;
    assert!(coverage.covered_endpoints.contains("orders"));
    assert!(coverage.uncovered_endpoints.contains("health"));
    assert!(coverage.covered_rules.contains("orders#0"));
    assert!(coverage.covered_rules.contains("orders#1"));
    assert!(coverage.covered_rules.contains("orders#2"));
    assert!(coverage.uncovered_rules.contains("health#0"));
}

#[tokio::test]
async fn parameter_mutation_changes_later_responses() {
    let (registry, _) = load();
    let scripts = scripts();
    let evaluator = TestEvaluator::new(&registry, &scripts);

    let case = TestCase {
        name: None,
        request: StandinRequest::new("GET", "/orders/other"),
        expect: TestExpectation {
            status_code: Some(503),
            ..Default::default()
        },
    };

    // Default parameter value: expecting 503 fails.
    let result = evaluator.run_case(0, &case).await.unwrap();
    assert!(matches!(result.outcome, TestOutcome::Fail(_)));

    // Override through the live table; the same registry now serves 503.
    registry
        .get("orders")
        .unwrap()
        .parameters()
        .set_current("status", Some("503".to_string()))
        .unwrap();
    let result = evaluator.run_case(0, &case).await.unwrap();
    assert!(result.passed(), "got {:?}", result.outcome);
}

#[tokio::test]
async fn ambiguous_route_is_an_error_outcome() {
    let yaml = r#"
endpoints:
  - name: bar
    pathPattern: "^/bar"
    rules:
      - response: { literal: bar }
  - name: barista
    pathPattern: "^/barista"
    rules:
      - response: { literal: barista }
"#;
    let config: StandinConfig = serde_yaml::from_str(yaml).unwrap();
    // Loading succeeds: the overlap is only surfaced at resolution time.
    let registry = config.build_registry(Path::new(".")).unwrap();

    let scripts = scripts();
    let evaluator = TestEvaluator::new(&registry, &scripts);
    let case = TestCase {
        name: None,
        request: StandinRequest::new("GET", "/barista"),
        expect: TestExpectation {
            body: Some("barista".to_string()),
            ..Default::default()
        },
    };
    let result = evaluator.run_case(0, &case).await.unwrap();
    match &result.outcome {
        TestOutcome::Error(message) => assert!(message.contains("more than one endpoint")),
        other => panic!("expected Error, got {other:?}"),
    }

    // The non-overlapping path still resolves normally.
    let case = TestCase {
        name: None,
        request: StandinRequest::new("GET", "/bar/x"),
        expect: TestExpectation {
            body: Some("bar".to_string()),
            ..Default::default()
        },
    };
    assert!(evaluator.run_case(1, &case).await.unwrap().passed());
}

#[test]
fn sealed_endpoint_rejected_at_load() {
    let yaml = r#"
endpoints:
  - name: sealed
    pathPattern: "^/s"
    rules:
      - response: { literal: everything }
      - response: { literal: unreachable }
"#;
    let config: StandinConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(matches!(
        config.build_registry(Path::new(".")),
        Err(StandinError::EndpointSealed(_))
    ));
}

#[tokio::test]
async fn script_cache_is_shared_across_runs() {
    let (registry, tests) = load();
    let scripts = Arc::new(scripts());
    let evaluator = TestEvaluator::new(&registry, &scripts);

    evaluator.run_all(&tests).await.unwrap();
    evaluator.run_all(&tests).await.unwrap();

    let stats = scripts.stats();
    // One distinct script source; the second batch reuses the compiled AST.
    assert_eq!(stats.inserts, 1);
    assert!(stats.hits >= 1);
}
