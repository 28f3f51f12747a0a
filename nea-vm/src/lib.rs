//! # nea VM
//!
//! The machinery an agent run is built from.
//!
//! ## Core Concepts
//! - **Tools**: a validated registry of callable capabilities with typed arguments
//! - **Sandbox**: a restricted interpreter for the Python-like code models write
//! - **Transcript**: the append-only step log every prompt is rendered from
//! - **Gateway**: a uniform completion call over pluggable providers
//! - **Provider**: trait-based LLM communication (OpenAI, Anthropic, scripted)

pub mod ast;
mod builtins;
mod check;
pub mod default_tools;
pub mod error;
pub mod gateway;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod prompt;
pub mod provider;
pub mod sandbox;
pub mod tool;
pub mod transcript;
pub mod value;

pub use default_tools::UserInput;
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use gateway::{GatewayConfig, ModelGateway, ModelOutput, DEFAULT_STOP_SEQUENCES};
pub use interpreter::{ALLOWED_MODULES, BUILTINS, FINAL_ANSWER};
pub use prompt::SystemPrompt;
pub use provider::{
    AnthropicProvider, ChatMessage, CompletionRequest, CompletionResponse, FinishReason,
    LlmProvider, OpenAIProvider, ProviderConfig, ProviderError, ProviderType, Role,
    ScriptedProvider, ScriptedReply, StreamChunk, StreamReceiver, ToolChoice,
    ToolDefinition, Usage, UsageTracker,
};
pub use sandbox::{
    extract_code, CodeExecutor, ExecutionOutcome, ExtractedCode, RaisedError, SandboxLimits,
    SandboxState,
};
pub use tool::{tool_fn, ParamSpec, ParamType, Tool, ToolArgs, ToolRegistry, ToolSpec};
pub use transcript::{Plan, RenderOptions, Step, StepOutcome, Task, Transcript};
