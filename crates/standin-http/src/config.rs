//! Declarative configuration: the descriptor types the JSON/YAML loader
//! consumes and the builders that turn them into the runtime data model.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::endpoint::{Endpoint, EndpointParameter};
use crate::error::{Result, StandinError};
use crate::harness::{TestCase, TestExpectation};
use crate::matcher::{MethodFilter, RequestMatcher};
use crate::registry::EndpointRegistry;
use crate::request::StandinRequest;
use crate::response::{
    compile_strip_pattern, ForwardTarget, ResponseCreator, ResponseDefaults, ResponseSpec,
    ScriptSource,
};

/// A spec value that may be written as a number or a string (strings allow
/// `$param` indirection).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SpecValue {
    Number(i64),
    Float(f64),
    Text(String),
}

impl SpecValue {
    fn into_spec(self) -> String {
        match self {
            SpecValue::Number(n) => n.to_string(),
            SpecValue::Float(f) => f.to_string(),
            SpecValue::Text(s) => s,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamespaceDescriptor {
    pub prefix: String,
    pub uri: String,
}

/// Matcher half of a rule descriptor. Neither `regex` nor `xpath` means
/// match-anything.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatcherDescriptor {
    pub methods: Vec<String>,
    pub regex: Option<String>,
    pub xpath: Option<String>,
    pub namespaces: Vec<NamespaceDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementDescriptor {
    pub search: String,
    pub replace: String,
}

/// Creator half of a rule descriptor. Exactly one of `literal`, `file`,
/// `script`, `scriptFile`, `forward` must be present.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseDescriptor {
    pub literal: Option<String>,
    pub file: Option<String>,
    pub script: Option<String>,
    pub script_file: Option<String>,
    pub include_dir: Option<PathBuf>,
    pub forward: Option<String>,
    pub proxy: Option<String>,
    pub strip_path: Option<String>,

    pub delay: Option<SpecValue>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub status_code: Option<SpecValue>,
    pub replacements: Vec<ReplacementDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDescriptor {
    #[serde(default)]
    pub matcher: MatcherDescriptor,
    pub response: ResponseDescriptor,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDescriptor {
    pub name: String,
    pub default: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    pub name: String,
    pub path_pattern: String,
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Endpoint-level defaults override the global ones field by field.
    #[serde(default)]
    pub defaults: Option<ResponseDefaults>,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    #[serde(default)]
    pub rules: Vec<RuleDescriptor>,
}

/// Expected fields of a declarative test. `body`/`bodyFile` are exclusive.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpectDescriptor {
    pub matcher: Option<String>,
    pub creator: Option<String>,
    pub body: Option<String>,
    pub body_file: Option<PathBuf>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_file: Option<PathBuf>,
    #[serde(default)]
    pub expect: ExpectDescriptor,
}

/// Top-level declarative configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StandinConfig {
    pub defaults: ResponseDefaults,
    pub endpoints: Vec<EndpointDescriptor>,
    pub tests: Vec<TestDescriptor>,
}

impl StandinConfig {
    /// Load from a YAML or JSON file, decided by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| StandinError::FileNotFound(path.display().to_string()))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| StandinError::Configuration(format!("invalid JSON config: {e}")))?,
            _ => serde_yaml::from_str(&text)
                .map_err(|e| StandinError::Configuration(format!("invalid YAML config: {e}")))?,
        };
        Ok(config)
    }

    /// Build the registry. `root` anchors relative base directories (usually
    /// the config file's directory).
    pub fn build_registry(&self, root: &Path) -> Result<EndpointRegistry> {
        let mut registry = EndpointRegistry::new();
        for descriptor in &self.endpoints {
            registry.add(build_endpoint(descriptor, &self.defaults, root)?)?;
        }
        info!(endpoints = registry.len(), "registry loaded");
        Ok(registry)
    }

    /// Build the declarative test cases. `root` anchors `bodyFile` paths.
    pub fn build_tests(&self, root: &Path) -> Result<Vec<TestCase>> {
        self.tests
            .iter()
            .map(|descriptor| build_test(descriptor, root))
            .collect()
    }
}

fn build_endpoint(
    descriptor: &EndpointDescriptor,
    global_defaults: &ResponseDefaults,
    root: &Path,
) -> Result<Endpoint> {
    let mut endpoint = Endpoint::new(&descriptor.name, &descriptor.path_pattern)?;

    let base_dir = match &descriptor.base_dir {
        Some(dir) => root.join(dir),
        None => root.to_path_buf(),
    };
    endpoint.set_base_dir(base_dir);

    let defaults = match &descriptor.defaults {
        Some(own) => own.merged_over(global_defaults),
        None => global_defaults.clone(),
    };
    endpoint.set_defaults(defaults);

    for parameter in &descriptor.parameters {
        let mut p = EndpointParameter::new(&parameter.name, &parameter.default);
        p.description = parameter.description.clone();
        endpoint.parameters().insert(p)?;
    }

    for rule in &descriptor.rules {
        let matcher = build_matcher(&rule.matcher)?;
        let creator = build_creator(&rule.response)?;
        endpoint.add_rule(matcher, creator)?;
    }

    Ok(endpoint)
}

fn build_matcher(descriptor: &MatcherDescriptor) -> Result<RequestMatcher> {
    let matcher = match (&descriptor.regex, &descriptor.xpath) {
        (Some(_), Some(_)) => {
            return Err(StandinError::Configuration(
                "matcher specifies both 'regex' and 'xpath'".to_string(),
            ))
        }
        (Some(pattern), None) => RequestMatcher::pattern(pattern)?,
        (None, Some(expression)) => RequestMatcher::xpath(
            expression,
            descriptor
                .namespaces
                .iter()
                .map(|n| (n.prefix.clone(), n.uri.clone()))
                .collect(),
        ),
        (None, None) => RequestMatcher::any(),
    };
    if descriptor.methods.is_empty() {
        Ok(matcher)
    } else {
        Ok(matcher.with_methods(MethodFilter::only(&descriptor.methods)))
    }
}

fn build_creator(descriptor: &ResponseDescriptor) -> Result<ResponseCreator> {
    let mut kinds = 0;
    for present in [
        descriptor.literal.is_some(),
        descriptor.file.is_some(),
        descriptor.script.is_some(),
        descriptor.script_file.is_some(),
        descriptor.forward.is_some(),
    ] {
        if present {
            kinds += 1;
        }
    }
    if kinds != 1 {
        return Err(StandinError::Configuration(format!(
            "rule response must specify exactly one of literal/file/script/scriptFile/forward, found {kinds}"
        )));
    }

    let creator = if let Some(template) = &descriptor.literal {
        ResponseCreator::literal(template.clone())
    } else if let Some(template) = &descriptor.file {
        ResponseCreator::file(template.clone())
    } else if let Some(code) = &descriptor.script {
        ResponseCreator::script(
            ScriptSource::Inline(code.clone()),
            descriptor.include_dir.clone(),
        )
    } else if let Some(template) = &descriptor.script_file {
        ResponseCreator::script(
            ScriptSource::File(template.clone()),
            descriptor.include_dir.clone(),
        )
    } else if let Some(upstream) = &descriptor.forward {
        let mut target = ForwardTarget::new(upstream.clone());
        if let Some(proxy) = &descriptor.proxy {
            target = target.with_proxy(proxy.clone());
        }
        if let Some(pattern) = &descriptor.strip_path {
            target = target.with_strip_path(compile_strip_pattern(pattern)?);
        }
        ResponseCreator::forward(target)
    } else {
        unreachable!("creator kind count checked above")
    };

    Ok(creator.with_spec(ResponseSpec {
        delay: descriptor.delay.clone().map(SpecValue::into_spec),
        content_type: descriptor.content_type.clone(),
        charset: descriptor.charset.clone(),
        status_code: descriptor.status_code.clone().map(SpecValue::into_spec),
        replacements: descriptor
            .replacements
            .iter()
            .map(|r| (r.search.clone(), r.replace.clone()))
            .collect(),
    }))
}

fn build_test(descriptor: &TestDescriptor, root: &Path) -> Result<TestCase> {
    let body = load_text(&descriptor.body, &descriptor.body_file, root)?;
    let expected_body = load_text(&descriptor.expect.body, &descriptor.expect.body_file, root)?;

    let mut request = StandinRequest::new(&descriptor.method, &descriptor.path);
    if let Some(query) = &descriptor.query {
        request = request.with_query(query.clone());
    }
    if let Some(body) = body {
        request = request.with_body(body);
    }

    Ok(TestCase {
        name: descriptor.name.clone(),
        request,
        expect: TestExpectation {
            matcher: descriptor.expect.matcher.clone(),
            creator: descriptor.expect.creator.clone(),
            body: expected_body,
            content_type: descriptor.expect.content_type.clone(),
            charset: descriptor.expect.charset.clone(),
            status_code: descriptor.expect.status_code,
        },
    })
}

/// Inline text, or the contents of an external file, or nothing.
fn load_text(
    inline: &Option<String>,
    file: &Option<PathBuf>,
    root: &Path,
) -> Result<Option<String>> {
    match (inline, file) {
        (Some(_), Some(_)) => Err(StandinError::Configuration(
            "both inline text and a file reference were given".to_string(),
        )),
        (Some(text), None) => Ok(Some(text.clone())),
        (None, Some(relpath)) => {
            let path = root.join(relpath);
            std::fs::read_to_string(&path)
                .map(Some)
                .map_err(|_| StandinError::FileNotFound(path.display().to_string()))
        }
        (None, None) => Ok(None),
    }
}
