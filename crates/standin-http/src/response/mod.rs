//! Response creators: the synthesis half of an endpoint rule.
//!
//! Literal, file, and script creators flow through a shared pipeline:
//! resolve the delay and sleep, produce the body, apply the ordered body
//! replacements, resolve content type / charset / status code, encode.
//! Every `*Spec` string may be a `$name` parameter reference resolved at the
//! moment of use. Forwarding bypasses the pipeline entirely; the upstream is
//! authoritative.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::endpoint::ParameterTable;
use crate::error::{Result, StandinError};
use crate::request::StandinRequest;
use crate::scripting::{expand_includes, ScriptCache, ScriptContext};

mod forward;
pub use forward::ForwardTarget;

/// Content-type / charset defaults. Endpoint-level defaults override the
/// global ones field by field; a creator's own specs override both.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseDefaults {
    pub content_type: Option<String>,
    pub charset: Option<String>,
}

impl ResponseDefaults {
    /// `self` layered over `base`: set fields win, unset fields fall through.
    pub fn merged_over(&self, base: &ResponseDefaults) -> ResponseDefaults {
        ResponseDefaults {
            content_type: self.content_type.clone().or_else(|| base.content_type.clone()),
            charset: self.charset.clone().or_else(|| base.charset.clone()),
        }
    }
}

/// Body text encodings. UTF-8 is the default; the other labels exist for
/// stands-in of legacy services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    pub fn from_charset(label: &str) -> Result<Self> {
        match label.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            "iso-8859-1" | "latin-1" | "latin1" => Ok(Encoding::Latin1),
            other => Err(StandinError::Encoding {
                charset: other.to_string(),
                reason: "unsupported charset".to_string(),
            }),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Ascii => {
                if text.is_ascii() {
                    Ok(text.as_bytes().to_vec())
                } else {
                    Err(StandinError::Encoding {
                        charset: "ascii".to_string(),
                        reason: "body contains non-ASCII characters".to_string(),
                    })
                }
            }
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(c as u32).map_err(|_| StandinError::Encoding {
                        charset: "iso-8859-1".to_string(),
                        reason: format!("character '{c}' is outside Latin-1"),
                    })
                })
                .collect(),
        }
    }
}

/// Where a script creator's source comes from.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    Inline(String),
    /// File path template, relative to the endpoint directory.
    File(String),
}

/// The fields every creator shares. All string specs support `$name`
/// indirection.
#[derive(Debug, Clone, Default)]
pub struct ResponseSpec {
    /// Delay in seconds before the body is produced.
    pub delay: Option<String>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    /// Defaults to 200 when unset.
    pub status_code: Option<String>,
    /// Ordered (search, replace) passes; each pass operates on the previous
    /// pass's output.
    pub replacements: Vec<(String, String)>,
}

/// Variant-specific body production. Closed set, matched exhaustively at the
/// synthesis call site.
#[derive(Debug, Clone)]
pub enum CreatorKind {
    /// Fixed body template.
    Literal { template: String },
    /// Full contents of a file relative to the endpoint directory.
    File { template: String },
    /// Body produced by an embedded script via the script cache.
    Script {
        source: ScriptSource,
        /// Directory for `//!include` resolution; defaults to the script
        /// file's own directory for file-sourced scripts.
        include_dir: Option<PathBuf>,
    },
    /// Pass-through to an upstream server.
    Forward(ForwardTarget),
}

/// A rule's response synthesizer.
#[derive(Debug, Clone)]
pub struct ResponseCreator {
    pub kind: CreatorKind,
    pub spec: ResponseSpec,
}

/// Everything synthesis needs from the owning endpoint and the process.
pub struct SynthesisEnv<'a> {
    pub parameters: &'a ParameterTable,
    pub base_dir: &'a Path,
    pub defaults: &'a ResponseDefaults,
    pub scripts: &'a ScriptCache,
}

/// Synthesized output: bytes plus resolved status, content type, charset.
#[derive(Debug, Clone)]
pub struct SynthesizedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub body: Vec<u8>,
}

impl SynthesizedResponse {
    /// Charset-qualified content-type header value, when any part is set.
    pub fn content_type_header(&self) -> Option<String> {
        match (&self.content_type, &self.charset) {
            (Some(ct), Some(cs)) => Some(format!("{ct}; charset={cs}")),
            (Some(ct), None) => Some(ct.clone()),
            (None, _) => None,
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl ResponseCreator {
    pub fn literal(template: impl Into<String>) -> Self {
        Self {
            kind: CreatorKind::Literal {
                template: template.into(),
            },
            spec: ResponseSpec::default(),
        }
    }

    pub fn file(template: impl Into<String>) -> Self {
        Self {
            kind: CreatorKind::File {
                template: template.into(),
            },
            spec: ResponseSpec::default(),
        }
    }

    pub fn script(source: ScriptSource, include_dir: Option<PathBuf>) -> Self {
        Self {
            kind: CreatorKind::Script {
                source,
                include_dir,
            },
            spec: ResponseSpec::default(),
        }
    }

    pub fn forward(target: ForwardTarget) -> Self {
        Self {
            kind: CreatorKind::Forward(target),
            spec: ResponseSpec::default(),
        }
    }

    pub fn with_spec(mut self, spec: ResponseSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Human-readable identifier used by coverage, diagnostic headers, and
    /// test expectations.
    pub fn describe(&self) -> String {
        match &self.kind {
            CreatorKind::Literal { .. } => "literal".to_string(),
            CreatorKind::File { template } => format!("file({template})"),
            CreatorKind::Script {
                source: ScriptSource::Inline(_),
                ..
            } => "script(inline)".to_string(),
            CreatorKind::Script {
                source: ScriptSource::File(template),
                ..
            } => format!("script({template})"),
            CreatorKind::Forward(target) => format!("forward({})", target.upstream_url),
        }
    }

    /// Produce the response for a matched request.
    pub async fn synthesize(
        &self,
        request: &StandinRequest,
        env: &SynthesisEnv<'_>,
    ) -> Result<SynthesizedResponse> {
        // Forwarding is a pass-through: no delay, replacement, or encoding
        // override applies, since the upstream is authoritative.
        if let CreatorKind::Forward(target) = &self.kind {
            return target.forward(request).await;
        }

        self.apply_delay(env).await?;

        let (mut body, script_status, script_content_type) = self.produce_body(request, env).await?;

        for (search, replace) in &self.spec.replacements {
            body = body.replace(search, replace);
        }

        // Script-set status and content type take precedence over the
        // declarative specs.
        let status = match script_status {
            Some(status) => status,
            None => self.resolve_status(env)?,
        };
        let content_type = match script_content_type {
            Some(ct) => Some(ct),
            None => self.resolve_content_type(env)?,
        };
        let charset = self.resolve_charset(env)?;

        let encoding = match charset.as_deref() {
            Some(label) => Encoding::from_charset(label)?,
            None => Encoding::Utf8,
        };
        let body = encoding.encode(&body)?;

        Ok(SynthesizedResponse {
            status,
            content_type,
            charset,
            body,
        })
    }

    async fn apply_delay(&self, env: &SynthesisEnv<'_>) -> Result<()> {
        let Some(spec) = &self.spec.delay else {
            return Ok(());
        };
        let resolved = env.parameters.resolve_spec(spec)?;
        let seconds: f64 = resolved.parse().map_err(|_| {
            StandinError::Configuration(format!("invalid delay value '{resolved}'"))
        })?;
        if seconds > 0.0 {
            debug!(seconds, "delaying response");
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        }
        Ok(())
    }

    /// Variant body production: (body, script status, script content type).
    async fn produce_body(
        &self,
        request: &StandinRequest,
        env: &SynthesisEnv<'_>,
    ) -> Result<(String, Option<u16>, Option<String>)> {
        match &self.kind {
            CreatorKind::Literal { template } => {
                Ok((env.parameters.resolve_spec(template)?, None, None))
            }
            CreatorKind::File { template } => {
                let path = env.base_dir.join(env.parameters.resolve_spec(template)?);
                let body = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|_| StandinError::FileNotFound(path.display().to_string()))?;
                Ok((body, None, None))
            }
            CreatorKind::Script {
                source,
                include_dir,
            } => {
                let (text, source_dir) = match source {
                    ScriptSource::Inline(text) => (text.clone(), None),
                    ScriptSource::File(template) => {
                        let path = env.base_dir.join(env.parameters.resolve_spec(template)?);
                        let text = tokio::fs::read_to_string(&path)
                            .await
                            .map_err(|_| StandinError::FileNotFound(path.display().to_string()))?;
                        (text, path.parent().map(Path::to_path_buf))
                    }
                };
                // Explicit include dir wins over the script file's directory.
                let dir = include_dir
                    .as_ref()
                    .map(|d| env.base_dir.join(d))
                    .or(source_dir);
                let expanded = expand_includes(&text, dir.as_deref())?;

                let context = ScriptContext::new(request, env.parameters.clone());
                let output = env.scripts.execute(&expanded, &context).await?;
                Ok((output.body, output.status, output.content_type))
            }
            CreatorKind::Forward(_) => unreachable!("forward bypasses the shared pipeline"),
        }
    }

    fn resolve_status(&self, env: &SynthesisEnv<'_>) -> Result<u16> {
        let Some(spec) = &self.spec.status_code else {
            return Ok(200);
        };
        let resolved = env.parameters.resolve_spec(spec)?;
        resolved.parse().map_err(|_| {
            StandinError::Configuration(format!("invalid status code '{resolved}'"))
        })
    }

    fn resolve_content_type(&self, env: &SynthesisEnv<'_>) -> Result<Option<String>> {
        match &self.spec.content_type {
            Some(spec) => Ok(Some(env.parameters.resolve_spec(spec)?)),
            None => Ok(env.defaults.content_type.clone()),
        }
    }

    fn resolve_charset(&self, env: &SynthesisEnv<'_>) -> Result<Option<String>> {
        match &self.spec.charset {
            Some(spec) => Ok(Some(env.parameters.resolve_spec(spec)?)),
            None => Ok(env.defaults.charset.clone()),
        }
    }
}

/// Parse a strip-path pattern for forwarding.
pub fn compile_strip_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| StandinError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
