//! # Tool Registry
//!
//! A validated catalog of callable capabilities. Each tool declares a
//! [`ToolSpec`] (name, ordered typed parameters, description) and a
//! [`Tool`] implementation. The registry validates specs at registration
//! and arguments at invocation, so a tool body only ever sees arguments that
//! match its declaration.
//!
//! ```text
//! register(spec, tool) ──► validate spec ──► reserve name
//! invoke(name, args)   ──► lookup ──► check args ──► tool.call(args)
//!                            │            │               │
//!                     UnknownToolError  ArgumentError  ToolExecutionError
//! ```
//!
//! Once built, a registry is shared read-only (`Arc<ToolRegistry>`) by the
//! sandbox and every concurrent run.

use crate::error::{Error, Result};
use crate::interpreter::{ALLOWED_MODULES, BUILTINS, FINAL_ANSWER};
use crate::parser::KEYWORDS;
use crate::provider::ToolDefinition;
use crate::value::type_name;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Arguments passed to a tool, keyed by parameter name
pub type ToolArgs = Map<String, Value>;

// =============================================================================
// Specs
// =============================================================================

/// Declared type of a tool parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }

    /// Whether a non-null value satisfies this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            description: description.into(),
            required: true,
            nullable: false,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, ty, description)
        }
    }

    /// Accept `None` for this parameter
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Declaration of a tool: what it is called, what it takes, what it returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub output: ParamType,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            output: ParamType::Any,
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_output(mut self, output: ParamType) -> Self {
        self.output = output;
        self
    }

    /// Declaration of the built-in termination call
    pub fn final_answer() -> Self {
        Self::new(FINAL_ANSWER, "Provides a final answer to the given problem.").param(
            ParamSpec::required("answer", ParamType::Any, "The final answer to the problem"),
        )
    }

    pub fn get_param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Reject malformed declarations
    pub fn validate(&self) -> Result<()> {
        let bad = |reason: String| Err(Error::invalid_spec(&self.name, reason));

        if !is_identifier(&self.name) {
            return bad(format!("tool name '{}' is not a valid identifier", self.name));
        }
        if is_reserved(&self.name) {
            return bad(format!(
                "tool name '{}' would shadow a sandbox builtin",
                self.name
            ));
        }
        if self.description.trim().is_empty() {
            return bad(format!("tool '{}' has an empty description", self.name));
        }

        let mut seen_optional = false;
        for (i, param) in self.params.iter().enumerate() {
            if !is_identifier(&param.name) || KEYWORDS.contains(&param.name.as_str()) {
                return bad(format!(
                    "parameter '{}' of tool '{}' is not a valid identifier",
                    param.name, self.name
                ));
            }
            if self.params[..i].iter().any(|p| p.name == param.name) {
                return bad(format!(
                    "parameter '{}' of tool '{}' is declared twice",
                    param.name, self.name
                ));
            }
            if param.required && seen_optional {
                return bad(format!(
                    "required parameter '{}' of tool '{}' follows an optional parameter",
                    param.name, self.name
                ));
            }
            seen_optional |= !param.required;
        }
        Ok(())
    }

    /// Check an argument map against the declaration
    pub fn check_args(&self, args: &ToolArgs) -> Result<()> {
        for key in args.keys() {
            if self.get_param(key).is_none() {
                return Err(Error::invalid_argument(
                    &self.name,
                    format!("{}() got an unexpected argument '{}'", self.name, key),
                ));
            }
        }

        for param in &self.params {
            match args.get(&param.name) {
                None if param.required => {
                    return Err(Error::invalid_argument(
                        &self.name,
                        format!(
                            "{}() missing required argument '{}'",
                            self.name, param.name
                        ),
                    ));
                }
                None => {}
                Some(Value::Null) => {
                    if !param.nullable && param.ty != ParamType::Any {
                        return Err(Error::invalid_argument(
                            &self.name,
                            format!(
                                "argument '{}' of {}() must not be None",
                                param.name, self.name
                            ),
                        ));
                    }
                }
                Some(value) => {
                    if !param.ty.accepts(value) {
                        return Err(Error::invalid_argument(
                            &self.name,
                            format!(
                                "argument '{}' of {}() must be {}, got {}",
                                param.name,
                                self.name,
                                param.ty,
                                type_name(value)
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Map a call's positional then keyword arguments onto parameter names
    pub fn bind_args(&self, positional: Vec<Value>, keywords: Vec<(String, Value)>) -> Result<ToolArgs> {
        if positional.len() > self.params.len() {
            return Err(Error::invalid_argument(
                &self.name,
                format!(
                    "{}() takes {} positional argument(s) but {} were given",
                    self.name,
                    self.params.len(),
                    positional.len()
                ),
            ));
        }

        let mut args = ToolArgs::new();
        for (param, value) in self.params.iter().zip(positional) {
            args.insert(param.name.clone(), value);
        }
        for (key, value) in keywords {
            if args.contains_key(&key) {
                return Err(Error::invalid_argument(
                    &self.name,
                    format!("{}() got multiple values for argument '{}'", self.name, key),
                ));
            }
            args.insert(key, value);
        }
        Ok(args)
    }

    /// JSON Schema for provider tool definitions
    pub fn to_definition(&self) -> ToolDefinition {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut prop = Map::new();
            if param.ty != ParamType::Any {
                prop.insert("type".into(), json!(param.ty.as_str()));
            }
            prop.insert("description".into(), json!(param.description));
            if param.nullable {
                prop.insert("nullable".into(), json!(true));
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(json!(param.name));
            }
        }
        ToolDefinition::new(&self.name, &self.description).with_parameters(json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }))
    }

    /// Human-readable description for the system prompt
    pub fn describe(&self) -> String {
        let inputs: Map<String, Value> = self
            .params
            .iter()
            .map(|p| {
                let mut entry = json!({ "type": p.ty.as_str(), "description": p.description });
                if !p.required {
                    entry["optional"] = json!(true);
                }
                if p.nullable {
                    entry["nullable"] = json!(true);
                }
                (p.name.clone(), entry)
            })
            .collect();
        format!(
            "- {}: {}\n    Takes inputs: {}\n    Returns an output of type: {}",
            self.name,
            self.description,
            Value::Object(inputs),
            self.output
        )
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Names code can never rebind or register as a tool
pub fn is_reserved(name: &str) -> bool {
    name == FINAL_ANSWER
        || BUILTINS.contains(&name)
        || ALLOWED_MODULES.contains(&name)
        || KEYWORDS.contains(&name)
}

// =============================================================================
// Tools
// =============================================================================

/// A callable capability. Implementations receive validated arguments.
pub trait Tool: Send + Sync {
    fn call(&self, args: &ToolArgs) -> anyhow::Result<Value>;
}

impl<F> Tool for F
where
    F: Fn(&ToolArgs) -> anyhow::Result<Value> + Send + Sync,
{
    fn call(&self, args: &ToolArgs) -> anyhow::Result<Value> {
        self(args)
    }
}

/// Wrap a closure as a [`Tool`], so its argument and return types are inferred
pub fn tool_fn<F>(f: F) -> F
where
    F: Fn(&ToolArgs) -> anyhow::Result<Value> + Send + Sync,
{
    f
}

struct Entry {
    spec: ToolSpec,
    tool: Box<dyn Tool>,
}

/// Registered tools, in registration order
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its spec's name
    pub fn register(&mut self, spec: ToolSpec, tool: impl Tool + 'static) -> Result<()> {
        spec.validate()?;
        if self.index.contains_key(&spec.name) {
            return Err(Error::duplicate_tool(&spec.name));
        }
        debug!(tool = %spec.name, params = spec.params.len(), "registered tool");
        self.index.insert(spec.name.clone(), self.entries.len());
        self.entries.push(Entry {
            spec,
            tool: Box::new(tool),
        });
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, spec: ToolSpec, tool: impl Tool + 'static) -> Result<Self> {
        self.register(spec, tool)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.index.get(name).map(|&i| &self.entries[i].spec)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.entries.iter().map(|e| &e.spec)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.spec.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke a tool. The callable is never reached when validation fails.
    pub fn invoke(&self, name: &str, args: &ToolArgs) -> Result<Value> {
        let entry = self
            .index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| Error::unknown_tool(name))?;
        entry.spec.check_args(args)?;

        debug!(tool = name, "invoking tool");
        entry
            .tool
            .call(args)
            .map_err(|e| Error::tool_execution(name, e).with_operation("tool::invoke"))
    }

    /// Provider-format definitions for every tool plus `final_answer`
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.specs()
            .map(ToolSpec::to_definition)
            .chain(std::iter::once(ToolSpec::final_answer().to_definition()))
            .collect()
    }

    /// Prompt text listing every tool plus `final_answer`
    pub fn describe(&self) -> String {
        self.specs()
            .map(ToolSpec::describe)
            .chain(std::iter::once(ToolSpec::final_answer().describe()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn search_spec() -> ToolSpec {
        ToolSpec::new("search", "Search the web")
            .param(ParamSpec::required("query", ParamType::String, "what to look for"))
            .param(ParamSpec::optional("limit", ParamType::Integer, "max results"))
            .with_output(ParamType::String)
    }

    fn args(value: Value) -> ToolArgs {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_register_and_invoke() {
        let mut registry = ToolRegistry::new();
        registry
            .register(search_spec(), tool_fn(|args| {
                Ok(json!(format!("results for {}", args["query"].as_str().unwrap())))
            }))
            .unwrap();

        let out = registry.invoke("search", &args(json!({"query": "rust"}))).unwrap();
        assert_eq!(out, json!("results for rust"));
        assert_eq!(registry.names(), vec!["search"]);
    }

    #[test]
    fn test_duplicate_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(search_spec(), tool_fn(|_| Ok(Value::Null))).unwrap();
        let err = registry
            .register(search_spec(), tool_fn(|_| Ok(Value::Null)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateTool);
    }

    #[test]
    fn test_invalid_specs() {
        let cases = [
            ToolSpec::new("", "empty name"),
            ToolSpec::new("bad name", "spaces"),
            ToolSpec::new("print", "shadows a builtin"),
            ToolSpec::new("final_answer", "reserved"),
            ToolSpec::new("ok", "  "),
            ToolSpec::new("ok", "dup params")
                .param(ParamSpec::required("a", ParamType::Any, ""))
                .param(ParamSpec::required("a", ParamType::Any, "")),
            ToolSpec::new("ok", "order")
                .param(ParamSpec::optional("a", ParamType::Any, ""))
                .param(ParamSpec::required("b", ParamType::Any, "")),
            ToolSpec::new("ok", "keyword param").param(ParamSpec::required("for", ParamType::Any, "")),
        ];
        for spec in cases {
            let err = ToolRegistry::new()
                .register(spec.clone(), tool_fn(|_| Ok(Value::Null)))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSpec, "{:?}", spec);
        }
    }

    #[test]
    fn test_argument_errors_never_reach_callable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = ToolRegistry::new()
            .with(
                search_spec(),
                tool_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }),
            )
            .unwrap();

        let bad = [
            json!({}),
            json!({"query": 3}),
            json!({"query": "x", "limit": 2.5}),
            json!({"query": "x", "extra": true}),
            json!({"query": null}),
        ];
        for case in bad {
            let err = registry.invoke("search", &args(case.clone())).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{case}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let err = registry.invoke("missing", &ToolArgs::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTool);
    }

    #[test]
    fn test_nullable_parameter() {
        let spec = ToolSpec::new("lookup", "Look something up")
            .param(ParamSpec::required("key", ParamType::String, "key").nullable());
        assert!(spec.check_args(&args(json!({"key": null}))).is_ok());
    }

    #[test]
    fn test_tool_failure_message_is_verbatim() {
        let registry = ToolRegistry::new()
            .with(search_spec(), tool_fn(|_| Err(anyhow::anyhow!("rate limited by upstream"))))
            .unwrap();
        let err = registry.invoke("search", &args(json!({"query": "x"}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolExecution);
        assert_eq!(err.message(), "rate limited by upstream");
        assert_eq!(err.brief(), "ToolExecutionError: rate limited by upstream");
    }

    #[test]
    fn test_bind_args() {
        let spec = search_spec();
        let bound = spec
            .bind_args(vec![json!("rust")], vec![("limit".into(), json!(3))])
            .unwrap();
        assert_eq!(Value::Object(bound), json!({"query": "rust", "limit": 3}));

        let err = spec
            .bind_args(vec![json!("a")], vec![("query".into(), json!("b"))])
            .unwrap_err();
        assert!(err.message().contains("multiple values"));

        let err = spec
            .bind_args(vec![json!(1), json!(2), json!(3)], vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rendering() {
        let registry = ToolRegistry::new()
            .with(search_spec(), tool_fn(|_| Ok(Value::Null)))
            .unwrap();

        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].parameters["required"], json!(["query"]));
        assert_eq!(defs[0].parameters["properties"]["limit"]["type"], json!("integer"));

        let text = registry.describe();
        assert!(text.contains("- search: Search the web"));
        assert!(text.contains("Returns an output of type: string"));
        assert!(text.contains("- final_answer:"));
    }
}
