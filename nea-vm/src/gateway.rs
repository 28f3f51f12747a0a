//! # Model Gateway
//!
//! Turns a rendered transcript into a model completion through any
//! [`LlmProvider`], and folds provider failures into the error taxonomy
//! the agent loop acts on:
//!
//! | Provider failure                         | Error                          |
//! |------------------------------------------|--------------------------------|
//! | network, 429, 5xx                        | `ModelUnavailable` (temporary) |
//! | auth, unknown model, rejected request    | `ModelUnavailable` (permanent) |
//! | unparseable response, empty completion   | `ModelProtocol`                |

use crate::error::{Error, Result};
use crate::provider::{
    ChatMessage, CompletionRequest, FinishReason, LlmProvider, ProviderError, ToolChoice, Usage,
};
use crate::tool::ToolRegistry;
use crate::transcript::truncate_content;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Stop sequences that end a code turn
pub const DEFAULT_STOP_SEQUENCES: &[&str] = &["<end_code>", "Observation:"];

/// Longest undecodable response body kept on a protocol error
pub const MAX_RAW_OUTPUT_CHARS: usize = 4_000;

/// Request shaping applied to every completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Overrides the provider's default model
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub stop: Vec<String>,
    pub stream: bool,
    /// Also send tool schemas in the provider's native format. Native
    /// tool calls stay disabled: tools are only called from code.
    pub attach_tool_schemas: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: Some(0.0),
            max_tokens: None,
            stop: DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
            stream: false,
            attach_tool_schemas: false,
        }
    }
}

impl GatewayConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_tool_schemas(mut self, attach: bool) -> Self {
        self.attach_tool_schemas = attach;
        self
    }
}

/// What the model said
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// Uniform completion entry point over a provider
#[derive(Debug)]
pub struct ModelGateway<P> {
    provider: P,
    config: GatewayConfig,
}

impl<P: LlmProvider> ModelGateway<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            config: GatewayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn request(&self, view: &[ChatMessage], tools: &ToolRegistry, stop: Vec<String>) -> CompletionRequest {
        let mut request = CompletionRequest::new(view.to_vec())
            .with_stop(stop)
            .with_streaming(self.config.stream);
        if let Some(model) = &self.config.model {
            request = request.with_model(model.clone());
        }
        if let Some(t) = self.config.temperature {
            request = request.with_temperature(t);
        }
        if let Some(max) = self.config.max_tokens {
            request = request.with_max_tokens(max);
        }
        if self.config.attach_tool_schemas {
            request = request
                .with_tools(tools.definitions())
                .with_tool_choice(ToolChoice::None);
        }
        request
    }

    /// Ask the model for the next turn given the rendered transcript
    pub async fn complete(&self, view: &[ChatMessage], tools: &ToolRegistry) -> Result<ModelOutput> {
        self.complete_with_stop(view, tools, self.config.stop.clone()).await
    }

    /// Like [`ModelGateway::complete`] with different stop sequences
    pub async fn complete_with_stop(
        &self,
        view: &[ChatMessage],
        tools: &ToolRegistry,
        stop: Vec<String>,
    ) -> Result<ModelOutput> {
        let request = self.request(view, tools, stop);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());
        debug!(
            provider = self.provider.name(),
            model = %model,
            messages = view.len(),
            "requesting completion"
        );

        let output = if self.config.stream {
            let receiver = self.provider.stream(request).await.map_err(map_provider_error)?;
            let (text, finish_reason, usage) = receiver.collect().await.map_err(map_provider_error)?;
            ModelOutput {
                text,
                model,
                usage: usage.unwrap_or_default(),
                finish_reason,
            }
        } else {
            let response = self.provider.complete(request).await.map_err(map_provider_error)?;
            ModelOutput {
                text: response.content.unwrap_or_default(),
                model: if response.model.is_empty() {
                    model
                } else {
                    response.model
                },
                usage: response.usage,
                finish_reason: response.finish_reason,
            }
        };

        if output.text.trim().is_empty() {
            return Err(Error::model_protocol("model returned an empty completion")
                .with_context("model", output.model));
        }
        Ok(output)
    }
}

/// Fold a provider failure into the gateway's error kinds
pub fn map_provider_error(err: ProviderError) -> Error {
    let message = err.to_string();
    match err {
        ProviderError::Parse(_) => Error::model_protocol(message),
        ProviderError::Malformed { body, .. } => Error::model_protocol(message)
            .with_context("raw_output", truncate_content(&body, MAX_RAW_OUTPUT_CHARS)),
        e if e.is_transient() => Error::model_unavailable(message).temporary(),
        _ => Error::model_unavailable(message).permanent(),
    }
    .with_operation("gateway::complete")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ErrorStatus};
    use crate::provider::{ScriptedProvider, ScriptedReply};

    fn view() -> Vec<ChatMessage> {
        vec![ChatMessage::system("sys"), ChatMessage::user("New task:\nadd")]
    }

    #[test]
    fn test_complete_forwards_stop_sequences() {
        let gateway = ModelGateway::new(ScriptedProvider::new(["```py\nfinal_answer(1)\n```"]));
        let output = tokio_test::block_on(gateway.complete(&view(), &ToolRegistry::new())).unwrap();
        assert!(output.text.contains("final_answer"));
        assert_eq!(output.model, "scripted");
        assert!(output.usage.total_tokens > 0);

        let sent = gateway.provider().requests();
        assert_eq!(
            sent[0].stop,
            Some(vec!["<end_code>".to_string(), "Observation:".to_string()])
        );
        assert_eq!(sent[0].temperature, Some(0.0));
        assert!(sent[0].tools.is_none());
    }

    #[test]
    fn test_tool_schemas_attached_on_request() {
        let gateway = ModelGateway::new(ScriptedProvider::new(["ok"]))
            .with_config(GatewayConfig::default().with_tool_schemas(true));
        tokio_test::block_on(gateway.complete(&view(), &ToolRegistry::new())).unwrap();
        let sent = &gateway.provider().requests()[0];
        assert_eq!(sent.tools.as_ref().unwrap()[0].name, "final_answer");
        assert!(matches!(sent.tool_choice, Some(ToolChoice::None)));
    }

    #[test]
    fn test_error_mapping() {
        let gateway = ModelGateway::new(ScriptedProvider::new(vec![
            ScriptedReply::Unavailable("connection refused".into()),
            ScriptedReply::Malformed("{\"choices\": [".into()),
            ScriptedReply::Text("   ".into()),
        ]));
        let tools = ToolRegistry::new();

        let err = tokio_test::block_on(gateway.complete(&view(), &tools)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
        assert_eq!(err.status(), ErrorStatus::Temporary);

        let err = tokio_test::block_on(gateway.complete(&view(), &tools)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelProtocol);
        assert_eq!(err.context_value("raw_output"), Some("{\"choices\": ["));

        let err = tokio_test::block_on(gateway.complete(&view(), &tools)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelProtocol);
        assert_eq!(err.context_value("raw_output"), None);

        let err = map_provider_error(ProviderError::AuthenticationFailed);
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
        assert_eq!(err.status(), ErrorStatus::Permanent);
    }

    #[test]
    fn test_stop_sequences_can_be_overridden() {
        let gateway = ModelGateway::new(ScriptedProvider::new(["1. look\n2. answer"]));
        let stop = vec!["<end_plan>".to_string()];
        tokio_test::block_on(gateway.complete_with_stop(&view(), &ToolRegistry::new(), stop.clone()))
            .unwrap();
        assert_eq!(gateway.provider().requests()[0].stop, Some(stop));
    }

    #[test]
    fn test_streaming_assembles_text() {
        let gateway = ModelGateway::new(ScriptedProvider::new(["Code:\n```py\nx = 1\n```"]))
            .with_config(GatewayConfig::default().with_streaming(true));
        let output = tokio_test::block_on(gateway.complete(&view(), &ToolRegistry::new())).unwrap();
        assert_eq!(output.text, "Code:\n```py\nx = 1\n```");
        assert_eq!(output.finish_reason, FinishReason::Stop);
    }
}
