//! Upstream forwarding. Bypasses the shared synthesis pipeline: the
//! upstream's status, content type, and body bytes pass through verbatim.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{debug, error};

use crate::error::{Result, StandinError};
use crate::request::StandinRequest;
use crate::response::SynthesizedResponse;

/// Hop-by-hop and transport-managed headers that must not be copied to the
/// outbound request. The original content type is re-applied explicitly.
const SKIP_HEADERS: [&str; 6] = [
    "connection",
    "content-length",
    "content-type",
    "accept-encoding",
    "expect",
    "host",
];

static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn shared_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default()
    })
}

/// Destination of a forwarding creator.
#[derive(Debug, Clone)]
pub struct ForwardTarget {
    pub upstream_url: String,
    /// Explicit proxy to route through, if any.
    pub proxy_url: Option<String>,
    /// Applied as a regex removal against the incoming path before it is
    /// appended to the upstream URL.
    pub strip_path: Option<Regex>,
}

impl ForwardTarget {
    pub fn new(upstream_url: impl Into<String>) -> Self {
        Self {
            upstream_url: upstream_url.into(),
            proxy_url: None,
            strip_path: None,
        }
    }

    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn with_strip_path(mut self, pattern: Regex) -> Self {
        self.strip_path = Some(pattern);
        self
    }

    /// Path after strip-pattern removal.
    pub fn stripped_path(&self, path: &str) -> String {
        match &self.strip_path {
            Some(pattern) => pattern.replace(path, "").into_owned(),
            None => path.to_string(),
        }
    }

    fn outbound_url(&self, request: &StandinRequest) -> String {
        let path = self.stripped_path(&request.path);
        if request.query.is_empty() {
            format!("{}{path}", self.upstream_url)
        } else {
            format!("{}{path}?{}", self.upstream_url, request.query)
        }
    }

    pub async fn forward(&self, request: &StandinRequest) -> Result<SynthesizedResponse> {
        let url = self.outbound_url(request);
        debug!(%url, "forwarding to upstream");

        let proxied_client;
        let client = match &self.proxy_url {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy)
                    .map_err(|e| StandinError::UpstreamForward(format!("invalid proxy: {e}")))?;
                proxied_client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .proxy(proxy)
                    .build()
                    .map_err(|e| StandinError::UpstreamForward(e.to_string()))?;
                &proxied_client
            }
            None => shared_client(),
        };

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| StandinError::UpstreamForward(format!("invalid method: {e}")))?;

        let response = client
            .request(method, &url)
            .headers(outbound_headers(request))
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                error!(%url, "upstream unreachable: {e}");
                StandinError::UpstreamForward(e.to_string())
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| StandinError::UpstreamForward(e.to_string()))?
            .to_vec();

        // The upstream is authoritative: status, content type, and bytes are
        // passed through untouched, charset included.
        Ok(SynthesizedResponse {
            status,
            content_type,
            charset: None,
            body,
        })
    }
}

/// Copy all incoming headers minus the skip list, then re-apply the original
/// content type explicitly.
fn outbound_headers(request: &StandinRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        if SKIP_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        headers.insert(name, value);
    }
    if let Some(ct) = request.content_type() {
        if let Ok(value) = HeaderValue::from_str(ct) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::compile_strip_pattern;

    #[test]
    fn test_skip_list_never_copied() {
        let request = StandinRequest::new("POST", "/x")
            .with_header("Connection", "keep-alive")
            .with_header("Content-Length", "42")
            .with_header("Accept-Encoding", "gzip")
            .with_header("Expect", "100-continue")
            .with_header("Host", "example.test")
            .with_header("X-Custom", "kept");

        let headers = outbound_headers(&request);
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        for skipped in ["connection", "content-length", "accept-encoding", "expect", "host"] {
            assert!(headers.get(skipped).is_none(), "{skipped} must be skipped");
        }
    }

    #[test]
    fn test_content_type_reapplied() {
        let request = StandinRequest::new("POST", "/x").with_header("Content-Type", "text/xml");
        let headers = outbound_headers(&request);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/xml");
    }

    #[test]
    fn test_strip_path() {
        let target = ForwardTarget::new("http://upstream.test")
            .with_strip_path(compile_strip_pattern("^/gateway").unwrap());
        assert_eq!(target.stripped_path("/gateway/orders/1"), "/orders/1");
        assert_eq!(target.stripped_path("/orders/1"), "/orders/1");
    }

    #[test]
    fn test_outbound_url_appends_query() {
        let target = ForwardTarget::new("http://upstream.test");
        let request = StandinRequest::new("GET", "/a").with_query("x=1");
        assert_eq!(target.outbound_url(&request), "http://upstream.test/a?x=1");
    }
}
