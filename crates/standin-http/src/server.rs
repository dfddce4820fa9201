//! Live HTTP serving: accept loop, request snapshotting, error policy, and
//! the response history ring buffer.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::StandinError;
use crate::registry::EndpointRegistry;
use crate::request::StandinRequest;
use crate::response::SynthesisEnv;
use crate::scripting::ScriptCache;

/// One served request, as recorded in the history ring buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only bounded history of served responses. Mutation is synchronized
/// here; readers get snapshots.
#[derive(Debug)]
pub struct RequestHistory {
    capacity: usize,
    entries: RwLock<VecDeque<HistoryEntry>>,
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, entry: HistoryEntry) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Adds x-standin-matcher / x-standin-creator description headers.
    pub diagnostics: bool,
    pub history_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            diagnostics: false,
            history_capacity: 1000,
        }
    }
}

/// The stand-in server. One logical task per inbound request; synthesis
/// delays suspend only that request's completion.
pub struct StandinServer {
    config: ServerConfig,
    registry: Arc<EndpointRegistry>,
    scripts: Arc<ScriptCache>,
    history: Arc<RequestHistory>,
}

impl StandinServer {
    pub fn new(
        config: ServerConfig,
        registry: Arc<EndpointRegistry>,
        scripts: Arc<ScriptCache>,
    ) -> Self {
        let history = Arc::new(RequestHistory::new(config.history_capacity));
        Self {
            config,
            registry,
            scripts,
            history,
        }
    }

    pub fn history(&self) -> Arc<RequestHistory> {
        Arc::clone(&self.history)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        info!("listening on http://{addr}");
        info!(endpoints = self.registry.len(), "serving stand-in endpoints");

        let server = Arc::new(self);
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle(req).await }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("error serving connection from {remote_addr}: {err}");
                }
            });
        }
    }

    async fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let request = match snapshot_request(req).await {
            Ok(request) => request,
            Err(e) => {
                warn!("failed to read request body: {e}");
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "failed to read request body",
                ));
            }
        };

        let (response, matcher, creator, err) = self.serve(&request).await;
        self.history.push(HistoryEntry {
            timestamp: chrono::Utc::now(),
            method: request.method.clone(),
            path: request.path.clone(),
            status: response.status().as_u16(),
            matcher,
            creator,
            error: err,
        });
        Ok(response)
    }

    /// Resolve and synthesize, mapping every failure to a clearly-marked
    /// error response. Returns the matcher/creator descriptions and error
    /// text for the history record.
    async fn serve(
        &self,
        request: &StandinRequest,
    ) -> (
        Response<Full<Bytes>>,
        Option<String>,
        Option<String>,
        Option<String>,
    ) {
        let endpoint = match self.registry.resolve(&request.path) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                let body = format!("no endpoint matches path '{}'", request.path);
                return (
                    error_response(StatusCode::NOT_FOUND, &body),
                    None,
                    None,
                    Some(body),
                );
            }
            Err(e) => return self.failure(e),
        };

        let matched = match endpoint.resolve(request) {
            Ok(Some(matched)) => matched,
            Ok(None) => {
                let body = format!("no rule of endpoint '{}' matched", endpoint.name());
                return (
                    error_response(StatusCode::NOT_FOUND, &body),
                    None,
                    None,
                    Some(body),
                );
            }
            Err(e) => return self.failure(e),
        };
        let matcher = matched.rule.matcher.describe();
        let creator = matched.rule.creator.describe();

        let env = SynthesisEnv {
            parameters: endpoint.parameters(),
            base_dir: endpoint.base_dir(),
            defaults: endpoint.defaults(),
            scripts: &self.scripts,
        };
        let synthesized = match matched.rule.creator.synthesize(request, &env).await {
            Ok(synthesized) => synthesized,
            Err(e) => {
                let (response, _, _, err) = self.failure(e);
                return (response, Some(matcher), Some(creator), err);
            }
        };

        let mut builder = Response::builder().status(synthesized.status);
        if let Some(content_type) = synthesized.content_type_header() {
            builder = builder.header("content-type", content_type);
        }
        if self.config.diagnostics {
            builder = builder
                .header("x-standin-matcher", matcher.clone())
                .header("x-standin-creator", creator.clone());
        }
        let response = builder
            .body(Full::new(Bytes::from(synthesized.body)))
            .unwrap_or_else(|_| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid response")
            });
        (response, Some(matcher), Some(creator), None)
    }

    fn failure(
        &self,
        e: StandinError,
    ) -> (
        Response<Full<Bytes>>,
        Option<String>,
        Option<String>,
        Option<String>,
    ) {
        error!("response synthesis failed: {e}");
        let message = e.to_string();
        (
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &message),
            None,
            None,
            Some(message),
        )
    }
}

/// Buffer the inbound request into the engine's request snapshot.
async fn snapshot_request(req: Request<hyper::body::Incoming>) -> anyhow::Result<StandinRequest> {
    let (parts, body) = req.into_parts();
    let mut headers = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), value.to_string());
        }
    }
    let query = parts.uri.query().unwrap_or_default().to_string();
    let path = parts.uri.path().to_string();
    let bytes = body.collect().await?.to_bytes();

    Ok(StandinRequest {
        method: parts.method.as_str().to_string(),
        path,
        query,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        headers,
    })
}

/// Error responses carry a distinct marker so callers can tell a synthesized
/// failure from a configured response.
fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "standinError": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", hyper::header::HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> HistoryEntry {
        HistoryEntry {
            timestamp: chrono::Utc::now(),
            method: "GET".to_string(),
            path: path.to_string(),
            status: 200,
            matcher: None,
            creator: None,
            error: None,
        }
    }

    #[test]
    fn test_history_ring_buffer_caps() {
        let history = RequestHistory::new(2);
        history.push(entry("/a"));
        history.push(entry("/b"));
        history.push(entry("/c"));

        let entries = history.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/b");
        assert_eq!(entries[1].path, "/c");
    }

    #[test]
    fn test_error_response_marked() {
        let response = error_response(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(response.status(), 500);
    }

    #[tokio::test]
    async fn test_snapshot_request() {
        let req = Request::builder()
            .method("POST")
            .uri("http://host/foo/bar?x=1&y=2")
            .header("X-Trace", "abc")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        // Incoming bodies only exist on live connections; exercise the parts
        // conversion through the same helper logic instead.
        let (parts, body) = req.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(parts.uri.path(), "/foo/bar");
        assert_eq!(parts.uri.query(), Some("x=1&y=2"));
        assert_eq!(&bytes[..], b"payload");
    }
}
