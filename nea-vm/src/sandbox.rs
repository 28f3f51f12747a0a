//! # Code Sandbox
//!
//! Executes the code blocks a model writes. A block is parsed, checked
//! against the allow-list, then interpreted against a [`SandboxState`]
//! that persists across the steps of one run.
//!
//! ```text
//!   model text ──extract_code──▶ code ──parse──▶ AST ──check──▶ Interpreter
//!                                                                   │
//!                                      SandboxState ◀──bindings─────┤
//!                                      ExecutionOutcome ◀──stdout───┘
//! ```
//!
//! Errors raised by code never escape [`CodeExecutor::execute`]; they are
//! reported in the outcome so the agent can feed them back to the model.

use crate::check::check_program;
use crate::error::{Error, ErrorKind, Result};
use crate::interpreter::{Completion, Interpreter};
use crate::parser::parse;
use crate::tool::ToolRegistry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default wall-clock budget for one block
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on interpreter operations for one block
pub const DEFAULT_MAX_OPERATIONS: u64 = 10_000_000;

/// Default cap on iterations of a single `while` loop
pub const DEFAULT_MAX_WHILE_ITERATIONS: u64 = 1_000_000;

/// Default cap on captured stdout
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 50_000;

// =============================================================================
// State
// =============================================================================

/// Variables and imports that persist between blocks of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxState {
    pub(crate) vars: Map<String, Value>,
    /// alias -> module
    pub(crate) modules: BTreeMap<String, String>,
    /// alias -> function imported with `from module import name`
    pub(crate) imported: BTreeMap<String, String>,
}

impl SandboxState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the state, typically with task attachments
    pub fn with_variables(mut self, vars: Map<String, Value>) -> Self {
        self.vars.extend(vars);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Forget everything; used when a block had to be abandoned
    pub fn reset(&mut self) {
        self.vars.clear();
        self.modules.clear();
        self.imported.clear();
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Resource limits applied to each block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Wall-clock budget, checked cooperatively by the interpreter
    pub timeout: Duration,
    pub max_operations: u64,
    pub max_while_iterations: u64,
    pub max_output_chars: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_while_iterations: DEFAULT_MAX_WHILE_ITERATIONS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

impl SandboxLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_operations(mut self, max: u64) -> Self {
        self.max_operations = max;
        self
    }

    pub fn with_max_while_iterations(mut self, max: u64) -> Self {
        self.max_while_iterations = max;
        self
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// An error raised by sandboxed code, as reported back to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaisedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl RaisedError {
    pub fn brief(&self) -> String {
        self.to_string()
    }
}

impl From<&Error> for RaisedError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.message().to_string(),
            line: err.context_value("line").and_then(|l| l.parse().ok()),
        }
    }
}

impl From<Error> for RaisedError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for RaisedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        Ok(())
    }
}

/// Result of executing one block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Everything the block printed, possibly truncated
    pub stdout: String,
    /// Value of the final expression statement, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RaisedError>,
    /// Set when the block called `final_answer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<Value>,
}

impl ExecutionOutcome {
    pub fn is_final(&self) -> bool {
        self.final_answer.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn failed(error: RaisedError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs blocks against a shared tool registry
#[derive(Debug, Clone)]
pub struct CodeExecutor {
    tools: Arc<ToolRegistry>,
    limits: SandboxLimits,
}

impl CodeExecutor {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            limits: SandboxLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Execute one block. Bindings made before an error are kept in `state`.
    pub fn execute(&self, code: &str, state: &mut SandboxState) -> ExecutionOutcome {
        let started = Instant::now();
        let code = dedent(code);

        let body = match parse(&code) {
            Ok(body) => body,
            Err(e) => return ExecutionOutcome::failed(e.into()),
        };
        if let Err(e) = check_program(&body, state, &self.tools) {
            debug!(error = %e.brief(), "code rejected before execution");
            return ExecutionOutcome::failed(e.into());
        }

        let mut interp = Interpreter::new(state, &self.tools, &self.limits, started);
        let result = interp.run(&body);
        let stdout = interp.into_stdout();

        let outcome = match result {
            Ok(Completion::Value(value)) => ExecutionOutcome {
                stdout,
                return_value: value,
                ..Default::default()
            },
            Ok(Completion::Final(answer)) => ExecutionOutcome {
                stdout,
                final_answer: Some(answer),
                ..Default::default()
            },
            Err(e) => ExecutionOutcome {
                stdout,
                error: Some(e.into()),
                ..Default::default()
            },
        };
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_final = outcome.is_final(),
            is_error = outcome.is_error(),
            "code block executed"
        );
        outcome
    }
}

/// Strip the common leading indentation of non-blank lines
fn dedent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    if indent == 0 {
        return code.to_string();
    }
    code.lines()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Extraction
// =============================================================================

/// Code pulled out of a model reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCode {
    /// The block that will run
    pub code: String,
    /// Further non-empty blocks in the reply, which are not executed
    pub ignored: Vec<String>,
}

fn code_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```(?:py|python)?[ \t]*\n(.*?)\n?```").expect("code block pattern is valid")
    })
}

/// Pull the first fenced code block out of a model reply.
///
/// Only fences with no language tag or a `py`/`python` tag count. Blank
/// blocks are skipped. When there are several, the first runs and the rest
/// are reported in [`ExtractedCode::ignored`].
pub fn extract_code(text: &str) -> Result<ExtractedCode> {
    let mut blocks = code_block_pattern()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|b| !b.trim().is_empty());

    match blocks.next() {
        Some(code) => Ok(ExtractedCode {
            code,
            ignored: blocks.collect(),
        }),
        None => Err(Error::no_code_produced(format!(
            "Your code snippet is invalid, because the regex pattern ```(?:py|python)?\\n(.*?)\\n``` \
             was not found in it.\nHere is your code snippet:\n{}\nMake sure to include code with \
             the correct pattern, for instance:\nThoughts: Your thoughts\nCode:\n```py\n\
             # Your python code here\n```<end_code>",
            text
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{tool_fn, ParamSpec, ParamType, ToolSpec};
    use serde_json::json;

    fn executor() -> CodeExecutor {
        let tools = ToolRegistry::new()
            .with(
                ToolSpec::new("fail", "Always fails")
                    .param(ParamSpec::required("why", ParamType::String, "reason")),
                tool_fn(|args| anyhow::bail!("refused: {}", args["why"].as_str().unwrap_or(""))),
            )
            .unwrap();
        CodeExecutor::new(Arc::new(tools))
    }

    #[test]
    fn test_state_persists_between_blocks() {
        let exec = executor();
        let mut state = SandboxState::new();
        let first = exec.execute("x = 20\nprint('set')", &mut state);
        assert_eq!(first.stdout, "set\n");
        assert!(!first.is_error());

        let second = exec.execute("final_answer(x + 1)", &mut state);
        assert_eq!(second.final_answer, Some(json!(21)));
    }

    #[test]
    fn test_errors_are_reported_not_raised() {
        let exec = executor();
        let mut state = SandboxState::new();

        let out = exec.execute("print('before')\nfail('nope')", &mut state);
        let err = out.error.unwrap();
        assert_eq!(err.kind, ErrorKind::ToolExecution);
        assert_eq!(err.message, "refused: nope");
        assert_eq!(err.line, Some(2));
        assert_eq!(out.stdout, "before\n");

        let out = exec.execute("def f():\n    pass", &mut state);
        assert_eq!(out.error.unwrap().kind, ErrorKind::Syntax);

        let out = exec.execute("import os\nprint('x')", &mut state);
        assert_eq!(out.stdout, "");
        assert_eq!(out.error.unwrap().kind, ErrorKind::Forbidden);
    }

    #[test]
    fn test_indented_block_is_dedented() {
        let exec = executor();
        let mut state = SandboxState::new();
        let out = exec.execute("    a = 1\n    if a:\n        a + 1\n", &mut state);
        assert_eq!(out.return_value, Some(json!(2)));
    }

    #[test]
    fn test_raised_error_display() {
        let err = RaisedError {
            kind: ErrorKind::Name,
            message: "name 'y' is not defined".into(),
            line: Some(3),
        };
        assert_eq!(err.to_string(), "NameError: name 'y' is not defined (line 3)");
    }

    #[test]
    fn test_extract_first_block_and_report_rest() {
        let text = "Thought: go\n```py\nx = 1\n```\nthen\n```python\ny = 2\n```\n```\n\n```";
        let extracted = extract_code(text).unwrap();
        assert_eq!(extracted.code, "x = 1");
        assert_eq!(extracted.ignored, vec!["y = 2".to_string()]);
    }

    #[test]
    fn test_extract_ignores_other_languages() {
        let text = "```json\n{\"a\": 1}\n```";
        let err = extract_code(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCodeProduced);
        assert!(err.message().contains("<end_code>"));
    }
}
