//! Request matchers: the predicate half of an endpoint rule.
//!
//! A matcher is an HTTP-method filter plus one of a closed set of predicate
//! kinds. The method filter is evaluated first, case-insensitively, and is
//! orthogonal to the predicate.

use regex::Regex;
use sxd_document::parser;
use sxd_xpath::{Context, Factory, Value};

use crate::error::{Result, StandinError};
use crate::request::StandinRequest;

/// Restricts a rule to a set of HTTP methods. `All` is the default.
#[derive(Debug, Clone, Default)]
pub enum MethodFilter {
    #[default]
    All,
    /// Explicit allow-list, stored uppercased.
    Only(Vec<String>),
}

impl MethodFilter {
    pub fn only<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        MethodFilter::Only(
            methods
                .into_iter()
                .map(|m| m.as_ref().to_ascii_uppercase())
                .collect(),
        )
    }

    pub fn allows(&self, method: &str) -> bool {
        match self {
            MethodFilter::All => true,
            MethodFilter::Only(allowed) => {
                allowed.iter().any(|m| m.eq_ignore_ascii_case(method))
            }
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, MethodFilter::All)
    }
}

/// Predicate kinds. Closed set: resolution and synthesis both match
/// exhaustively, so a new kind extends this enum.
#[derive(Debug, Clone)]
pub enum MatchKind {
    /// Matches every request.
    Any,
    /// Matches if the pattern is found (search, not full match) in the body,
    /// the path, or the query string. Any one hit is sufficient.
    Pattern(Regex),
    /// Evaluates an XPath expression against the request body parsed as XML.
    /// The expression must yield a boolean.
    XPath {
        expression: String,
        /// Ordered prefix -> namespace-URI bindings.
        namespaces: Vec<(String, String)>,
    },
}

/// A rule's predicate: method filter + match kind.
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    pub methods: MethodFilter,
    pub kind: MatchKind,
}

impl RequestMatcher {
    pub fn any() -> Self {
        Self {
            methods: MethodFilter::All,
            kind: MatchKind::Any,
        }
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| StandinError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            methods: MethodFilter::All,
            kind: MatchKind::Pattern(regex),
        })
    }

    pub fn xpath(expression: &str, namespaces: Vec<(String, String)>) -> Self {
        Self {
            methods: MethodFilter::All,
            kind: MatchKind::XPath {
                expression: expression.to_string(),
                namespaces,
            },
        }
    }

    pub fn with_methods(mut self, methods: MethodFilter) -> Self {
        self.methods = methods;
        self
    }

    /// True when this matcher accepts every method and every request.
    /// Appending such a rule seals its endpoint.
    pub fn is_catch_all(&self) -> bool {
        self.methods.is_all() && matches!(self.kind, MatchKind::Any)
    }

    /// Evaluate against a request. XPath evaluation can fail (malformed XML,
    /// non-boolean result); that is an error, not a non-match.
    pub fn matches(&self, request: &StandinRequest) -> Result<bool> {
        if !self.methods.allows(&request.method) {
            return Ok(false);
        }
        match &self.kind {
            MatchKind::Any => Ok(true),
            MatchKind::Pattern(regex) => Ok(regex.is_match(&request.body)
                || regex.is_match(&request.path)
                || regex.is_match(&request.query)),
            MatchKind::XPath {
                expression,
                namespaces,
            } => evaluate_xpath_bool(&request.body, expression, namespaces),
        }
    }

    /// Human-readable identifier used by coverage, diagnostic headers, and
    /// test expectations.
    pub fn describe(&self) -> String {
        let kind = match &self.kind {
            MatchKind::Any => "any".to_string(),
            MatchKind::Pattern(regex) => format!("regex({})", regex.as_str()),
            MatchKind::XPath { expression, .. } => format!("xpath({expression})"),
        };
        match &self.methods {
            MethodFilter::All => kind,
            MethodFilter::Only(methods) => format!("{kind} [{}]", methods.join(",")),
        }
    }
}

/// Parse `body` as XML, bind the supplied namespaces, and evaluate the
/// expression. A non-boolean result is an error condition, never coerced.
fn evaluate_xpath_bool(
    body: &str,
    expression: &str,
    namespaces: &[(String, String)],
) -> Result<bool> {
    let package = parser::parse(body)
        .map_err(|e| StandinError::MatchEvaluation(format!("request body is not XML: {e}")))?;
    let document = package.as_document();

    let factory = Factory::new();
    let xpath = factory
        .build(expression)
        .map_err(|e| StandinError::MatchEvaluation(format!("invalid XPath '{expression}': {e}")))?
        .ok_or_else(|| {
            StandinError::MatchEvaluation(format!("empty XPath expression '{expression}'"))
        })?;

    let mut context = Context::new();
    for (prefix, uri) in namespaces {
        context.set_namespace(prefix, uri);
    }

    let value = xpath
        .evaluate(&context, document.root())
        .map_err(|e| StandinError::MatchEvaluation(format!("XPath evaluation failed: {e}")))?;

    match value {
        Value::Boolean(b) => Ok(b),
        Value::Number(_) => Err(non_boolean(expression, "number")),
        Value::String(_) => Err(non_boolean(expression, "string")),
        Value::Nodeset(_) => Err(non_boolean(expression, "nodeset")),
    }
}

fn non_boolean(expression: &str, kind: &str) -> StandinError {
    StandinError::MatchEvaluation(format!(
        "XPath '{expression}' yielded a non-boolean result ({kind})"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str, query: &str, body: &str) -> StandinRequest {
        StandinRequest::new(method, path)
            .with_query(query)
            .with_body(body)
    }

    #[test]
    fn test_any_matches_everything() {
        let m = RequestMatcher::any();
        assert!(m.matches(&request("GET", "/x", "", "")).unwrap());
        assert!(m.matches(&request("DELETE", "/y", "a=b", "body")).unwrap());
        assert!(m.is_catch_all());
    }

    #[test]
    fn test_method_filter_case_insensitive() {
        let m = RequestMatcher::any().with_methods(MethodFilter::only(["post", "PUT"]));
        assert!(m.matches(&request("POST", "/", "", "")).unwrap());
        assert!(m.matches(&request("put", "/", "", "")).unwrap());
        assert!(!m.matches(&request("GET", "/", "", "")).unwrap());
        assert!(!m.is_catch_all());
    }

    #[test]
    fn test_pattern_searches_body_path_and_query() {
        let m = RequestMatcher::pattern("foo").unwrap();
        assert!(m.matches(&request("GET", "/x", "", "say foo here")).unwrap());
        assert!(m.matches(&request("GET", "/foo/bar", "", "")).unwrap());
        assert!(m.matches(&request("GET", "/x", "q=foo", "")).unwrap());
        assert!(!m.matches(&request("GET", "/x", "q=bar", "baz")).unwrap());
    }

    #[test]
    fn test_pattern_is_search_not_full_match() {
        let m = RequestMatcher::pattern("^/api").unwrap();
        assert!(m.matches(&request("GET", "/api/v1/users", "", "")).unwrap());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(matches!(
            RequestMatcher::pattern("(unclosed"),
            Err(StandinError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_xpath_boolean_result() {
        let m = RequestMatcher::xpath("/order/@id = '42'", vec![]);
        let hit = request("POST", "/", "", r#"<order id="42"/>"#);
        let miss = request("POST", "/", "", r#"<order id="7"/>"#);
        assert!(m.matches(&hit).unwrap());
        assert!(!m.matches(&miss).unwrap());
    }

    #[test]
    fn test_xpath_with_namespaces() {
        let m = RequestMatcher::xpath(
            "/o:order/@id = '42'",
            vec![("o".to_string(), "urn:orders".to_string())],
        );
        let body = r#"<order xmlns="urn:orders" id="42"/>"#;
        assert!(m.matches(&request("POST", "/", "", body)).unwrap());
    }

    #[test]
    fn test_xpath_non_boolean_is_error() {
        let m = RequestMatcher::xpath("/order/@id", vec![]);
        let err = m
            .matches(&request("POST", "/", "", r#"<order id="42"/>"#))
            .unwrap_err();
        assert!(matches!(err, StandinError::MatchEvaluation(_)));
        assert!(err.to_string().contains("non-boolean"));
    }

    #[test]
    fn test_xpath_malformed_xml_is_error() {
        let m = RequestMatcher::xpath("/a = 'b'", vec![]);
        assert!(matches!(
            m.matches(&request("POST", "/", "", "not xml")),
            Err(StandinError::MatchEvaluation(_))
        ));
    }

    #[test]
    fn test_describe() {
        assert_eq!(RequestMatcher::any().describe(), "any");
        assert_eq!(
            RequestMatcher::pattern("foo").unwrap().describe(),
            "regex(foo)"
        );
        let restricted = RequestMatcher::any().with_methods(MethodFilter::only(["GET"]));
        assert_eq!(restricted.describe(), "any [GET]");
    }
}
