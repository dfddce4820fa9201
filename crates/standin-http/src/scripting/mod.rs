//! Embedded script execution for script-backed response creators.
//!
//! Scripts are Rhai. Each invocation sees a `ctx` object exposing the
//! request (path, query, body, headers), a clock, and live parameter lookup;
//! it may set a status code and content type that take precedence over the
//! rule's declarative specs. The script's return value becomes the response
//! body.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Scope, AST};

use crate::endpoint::ParameterTable;
use crate::error::{Result, StandinError};
use crate::request::StandinRequest;

mod cache;
pub use cache::{
    CacheStats, InstantiationProbe, MemoryPressureHook, NoOpMemoryHook, RetryPolicy, ScriptCache,
    ScriptCacheConfig,
};

/// Include directives are expanded before the cache key is formed.
const INCLUDE_DIRECTIVE: &str = "//!include ";
const MAX_INCLUDE_DEPTH: usize = 8;

/// What a script run produced. `status` and `content_type` are only present
/// when the script set them explicitly.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub body: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
}

#[derive(Debug, Default)]
struct ScriptOutputs {
    status: Option<i64>,
    content_type: Option<String>,
}

/// The `ctx` object visible to scripts. Clones share the output slots, so
/// the engine reads back what the script set. Parameter lookup goes through
/// the live table on every call, never a snapshot.
#[derive(Clone)]
pub struct ScriptContext {
    path: String,
    query: String,
    body: String,
    headers: HashMap<String, String>,
    parameters: ParameterTable,
    outputs: Arc<Mutex<ScriptOutputs>>,
}

impl ScriptContext {
    pub fn new(request: &StandinRequest, parameters: ParameterTable) -> Self {
        Self {
            path: request.path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            headers: request.headers.clone(),
            parameters,
            outputs: Arc::new(Mutex::new(ScriptOutputs::default())),
        }
    }

    fn get_path(&mut self) -> String {
        self.path.clone()
    }

    fn get_query(&mut self) -> String {
        self.query.clone()
    }

    fn get_body(&mut self) -> String {
        self.body.clone()
    }

    fn header(&mut self, name: String) -> Dynamic {
        match self.headers.get(&name.to_lowercase()) {
            Some(value) => value.clone().into(),
            None => Dynamic::UNIT,
        }
    }

    fn param(&mut self, name: String) -> Dynamic {
        match self.parameters.value_of(&name) {
            Some(value) => value.into(),
            None => Dynamic::UNIT,
        }
    }

    fn now(&mut self) -> String {
        Utc::now().to_rfc3339()
    }

    fn set_status(&mut self, code: i64) {
        self.outputs.lock().status = Some(code);
    }

    fn set_content_type(&mut self, content_type: String) {
        self.outputs.lock().content_type = Some(content_type);
    }
}

/// Build the engine with the `ctx` type registered. One engine per cache;
/// invocations share it with a fresh scope each.
pub fn create_engine() -> Engine {
    let mut engine = Engine::new();
    engine
        .register_type_with_name::<ScriptContext>("ScriptContext")
        .register_get("path", ScriptContext::get_path)
        .register_get("query", ScriptContext::get_query)
        .register_get("body", ScriptContext::get_body)
        .register_fn("header", ScriptContext::header)
        .register_fn("param", ScriptContext::param)
        .register_fn("now", ScriptContext::now)
        .register_fn("set_status", ScriptContext::set_status)
        .register_fn("set_content_type", ScriptContext::set_content_type);
    engine
}

/// Run a compiled script against a context. The compiled AST carries no
/// per-invocation state, so concurrent callers share it freely.
pub fn invoke(engine: &Engine, ast: &AST, context: &ScriptContext) -> Result<ScriptOutput> {
    let mut scope = Scope::new();
    scope.push("ctx", context.clone());

    let value = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
        .map_err(|e| StandinError::ScriptRuntime(e.to_string()))?;

    let body = if value.is_unit() {
        String::new()
    } else if value.is_string() {
        value.into_string().unwrap_or_default()
    } else {
        value.to_string()
    };

    let outputs = context.outputs.lock();
    let status = match outputs.status {
        None => None,
        Some(code) if (100..=599).contains(&code) => Some(code as u16),
        Some(code) => {
            return Err(StandinError::ScriptRuntime(format!(
                "script set invalid status code {code}"
            )))
        }
    };

    Ok(ScriptOutput {
        body,
        status,
        content_type: outputs.content_type.clone(),
    })
}

/// Expand `//!include <relpath>` directives. Paths resolve against
/// `include_dir`; includes nested inside an included file resolve against
/// that file's directory. Sources without directives pass through untouched,
/// which also covers inline scripts that have no directory to resolve from.
pub fn expand_includes(source: &str, include_dir: Option<&Path>) -> Result<String> {
    expand_includes_inner(source, include_dir, 0)
}

fn expand_includes_inner(source: &str, include_dir: Option<&Path>, depth: usize) -> Result<String> {
    if !source.contains(INCLUDE_DIRECTIVE) {
        return Ok(source.to_string());
    }
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(StandinError::ScriptCompilation(format!(
            "include nesting exceeds {MAX_INCLUDE_DEPTH} levels"
        )));
    }

    let mut expanded = String::with_capacity(source.len());
    for line in source.lines() {
        match line.trim_start().strip_prefix(INCLUDE_DIRECTIVE) {
            Some(relpath) => {
                let dir = include_dir.ok_or_else(|| {
                    StandinError::Configuration(
                        "script uses //!include but has no include directory".to_string(),
                    )
                })?;
                let path = dir.join(relpath.trim());
                let text = std::fs::read_to_string(&path)
                    .map_err(|_| StandinError::FileNotFound(path.display().to_string()))?;
                let nested_dir = path.parent().map(Path::to_path_buf);
                expanded.push_str(&expand_includes_inner(
                    &text,
                    nested_dir.as_deref(),
                    depth + 1,
                )?);
                if !expanded.ends_with('\n') {
                    expanded.push('\n');
                }
            }
            None => {
                expanded.push_str(line);
                expanded.push('\n');
            }
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointParameter;
    use std::fs;

    fn run(script: &str, context: &ScriptContext) -> Result<ScriptOutput> {
        let engine = create_engine();
        let ast = engine
            .compile(script)
            .map_err(|e| StandinError::ScriptCompilation(e.to_string()))?;
        invoke(&engine, &ast, context)
    }

    fn context_for(request: StandinRequest) -> ScriptContext {
        ScriptContext::new(&request, ParameterTable::new())
    }

    #[test]
    fn test_script_sees_request() {
        let request = StandinRequest::new("POST", "/orders")
            .with_query("id=7")
            .with_body("payload")
            .with_header("X-Trace", "abc");
        let out = run(
            r#"ctx.path + "|" + ctx.query + "|" + ctx.body + "|" + ctx.header("x-trace")"#,
            &context_for(request),
        )
        .unwrap();
        assert_eq!(out.body, "/orders|id=7|payload|abc");
    }

    #[test]
    fn test_script_sets_status_and_content_type() {
        let out = run(
            r#"ctx.set_status(201); ctx.set_content_type("application/json"); "{}""#,
            &context_for(StandinRequest::new("GET", "/")),
        )
        .unwrap();
        assert_eq!(out.status, Some(201));
        assert_eq!(out.content_type.as_deref(), Some("application/json"));
        assert_eq!(out.body, "{}");
    }

    #[test]
    fn test_script_invalid_status_is_runtime_error() {
        let err = run(
            r#"ctx.set_status(9999); "x""#,
            &context_for(StandinRequest::new("GET", "/")),
        )
        .unwrap_err();
        assert!(matches!(err, StandinError::ScriptRuntime(_)));
    }

    #[test]
    fn test_script_reads_live_parameters() {
        let parameters = ParameterTable::new();
        parameters
            .insert(EndpointParameter::new("greeting", "hello"))
            .unwrap();
        let context = ScriptContext::new(&StandinRequest::new("GET", "/"), parameters.clone());

        let engine = create_engine();
        let ast = engine.compile(r#"ctx.param("greeting")"#).unwrap();
        assert_eq!(invoke(&engine, &ast, &context).unwrap().body, "hello");

        // Same context, mutated table: the next invocation sees the change.
        parameters
            .set_current("greeting", Some("hi".to_string()))
            .unwrap();
        assert_eq!(invoke(&engine, &ast, &context).unwrap().body, "hi");
    }

    #[test]
    fn test_missing_param_is_unit() {
        let out = run(
            r#"if ctx.param("nope") == () { "absent" } else { "present" }"#,
            &context_for(StandinRequest::new("GET", "/")),
        )
        .unwrap();
        assert_eq!(out.body, "absent");
    }

    #[test]
    fn test_expand_includes_flat() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("util.rhai"), "let shared = 1;").unwrap();
        let source = "//!include util.rhai\nshared + 1";
        let expanded = expand_includes(source, Some(dir.path())).unwrap();
        assert!(expanded.contains("let shared = 1;"));
        assert!(expanded.contains("shared + 1"));
    }

    #[test]
    fn test_expand_includes_nested_relative_to_included_file() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("lib");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("inner.rhai"), "let inner = 2;").unwrap();
        fs::write(sub.join("outer.rhai"), "//!include inner.rhai\nlet outer = 1;").unwrap();

        let expanded = expand_includes("//!include lib/outer.rhai\n", Some(dir.path())).unwrap();
        assert!(expanded.contains("let inner = 2;"));
        assert!(expanded.contains("let outer = 1;"));
    }

    #[test]
    fn test_include_without_directory_is_configuration_error() {
        let err = expand_includes("//!include util.rhai\n", None).unwrap_err();
        assert!(matches!(err, StandinError::Configuration(_)));
    }

    #[test]
    fn test_include_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = expand_includes("//!include nope.rhai\n", Some(dir.path())).unwrap_err();
        assert!(matches!(err, StandinError::FileNotFound(_)));
    }

    #[test]
    fn test_include_cycle_hits_depth_cap() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rhai"), "//!include b.rhai\n").unwrap();
        fs::write(dir.path().join("b.rhai"), "//!include a.rhai\n").unwrap();
        let err = expand_includes("//!include a.rhai\n", Some(dir.path())).unwrap_err();
        assert!(matches!(err, StandinError::ScriptCompilation(_)));
    }
}
