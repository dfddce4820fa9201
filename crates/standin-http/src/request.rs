//! Inbound request snapshot shared by matchers, creators, and the harness.

use std::collections::HashMap;

/// The parts of an inbound HTTP request the engine cares about. The live
/// server and the test harness both build this, so resolution and synthesis
/// behave identically for real traffic and replayed test cases.
#[derive(Debug, Clone, Default)]
pub struct StandinRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
    pub headers: HashMap<String, String>,
}

impl StandinRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}
