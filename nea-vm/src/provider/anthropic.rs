//! Anthropic Messages API provider implementation

use super::*;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2023-06-01";

/// Anthropic Claude provider
pub struct AnthropicProvider {
    client: Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = config.http_client(120)?;
        Ok(Self { client, config })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com/v1")
            .trim_end_matches('/')
    }

    fn build(&self, request: CompletionRequest, stream: bool) -> Result<RequestBuilder, ProviderError> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model().to_string());
        let (system, messages) = split_messages(request.messages);

        let api_request = AnthropicRequest {
            model,
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(4096),
            temperature: request.temperature,
            stream: Some(stream),
            tools: request.tools.map(|tools| {
                tools
                    .into_iter()
                    .map(|t| AnthropicTool {
                        name: t.name,
                        description: t.description,
                        input_schema: t.parameters,
                    })
                    .collect()
            }),
            stop_sequences: request.stop,
        };

        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or(ProviderError::AuthenticationFailed)?;

        let mut req = self
            .client
            .post(format!("{}/messages", self.base_url()))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&api_request);

        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            // 529 is Anthropic's "overloaded"
            return Err(ProviderError::from_status(status, text));
        }
        Ok(response)
    }
}

/// Pull system prompts out and merge consecutive same-role turns, which
/// the Messages API rejects.
fn split_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system: Vec<String> = Vec::new();
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        if msg.role == Role::System {
            system.extend(msg.content);
            continue;
        }
        let next = AnthropicMessage::from(msg);
        match out.last_mut() {
            Some(prev) if prev.role == next.role => {
                prev.content.push_str("\n\n");
                prev.content.push_str(&next.content);
            }
            _ => out.push(next),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, out)
}

fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Unknown,
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or("claude-sonnet-4-20250514")
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(self.build(request, false)?).await?;

        let api_response: AnthropicResponse = decode_body(response).await?;

        let content: String = api_response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();

        let usage = Usage {
            prompt_tokens: api_response.usage.input_tokens,
            completion_tokens: api_response.usage.output_tokens,
            total_tokens: api_response.usage.input_tokens + api_response.usage.output_tokens,
        };

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: (!content.is_empty()).then_some(content),
            finish_reason: stop_reason(api_response.stop_reason.as_deref()),
            usage,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamReceiver, ProviderError> {
        let response = self.send(self.build(request, true)?).await?;

        // Create async stream from SSE response
        let stream = async_stream::stream! {
            use futures_util::StreamExt;

            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut prompt_tokens = 0;

            while let Some(chunk_result) = byte_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        // Process complete SSE events
                        while let Some(pos) = buffer.find("\n\n") {
                            let event = buffer[..pos].to_string();
                            buffer.drain(..pos + 2);

                            let mut event_type = None;
                            let mut event_data = None;

                            for line in event.lines() {
                                if let Some(t) = line.strip_prefix("event: ") {
                                    event_type = Some(t.to_string());
                                } else if let Some(d) = line.strip_prefix("data: ") {
                                    event_data = Some(d.to_string());
                                }
                            }

                            let (Some(etype), Some(data)) = (event_type, event_data) else {
                                continue;
                            };
                            match etype.as_str() {
                                "message_start" => {
                                    if let Ok(start) = serde_json::from_str::<MessageStart>(&data) {
                                        prompt_tokens = start.message.usage.input_tokens;
                                    }
                                }
                                "content_block_delta" => {
                                    if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(&data) {
                                        if let DeltaContent::TextDelta { text } = delta.delta {
                                            yield StreamChunk::Text(text);
                                        }
                                    }
                                }
                                "message_delta" => {
                                    if let Ok(delta) = serde_json::from_str::<MessageDelta>(&data) {
                                        if let Some(reason) = delta.delta.stop_reason {
                                            yield StreamChunk::Done {
                                                finish_reason: stop_reason(Some(&reason)),
                                                usage: delta.usage.map(|u| Usage {
                                                    prompt_tokens,
                                                    completion_tokens: u.output_tokens,
                                                    total_tokens: prompt_tokens + u.output_tokens,
                                                }),
                                            };
                                        }
                                    }
                                }
                                "message_stop" => return,
                                "error" => {
                                    yield StreamChunk::Error(data);
                                    return;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        yield StreamChunk::Error(e.to_string());
                        return;
                    }
                }
            }
        };

        Ok(StreamReceiver::new(stream))
    }
}

// ============================================================================
// Anthropic API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

impl From<ChatMessage> for AnthropicMessage {
    fn from(msg: ChatMessage) -> Self {
        let role = match msg.role {
            Role::Assistant => "assistant",
            Role::User | Role::System => "user",
        };
        Self {
            role,
            content: msg.content.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

// Streaming types
#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartBody,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeltaContent {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaContent,
    usage: Option<DeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaContent {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    output_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_is_lifted_and_turns_merged() {
        let (system, messages) = split_messages(vec![
            ChatMessage::system("You are an agent"),
            ChatMessage::user("New task:\nadd"),
            ChatMessage::user("Observation:\n5"),
            ChatMessage::assistant("```py\nfinal_answer(5)\n```"),
        ]);
        assert_eq!(system.as_deref(), Some("You are an agent"));
        assert_eq!(messages.len(), 2);

        let json = serde_json::to_value(&messages).unwrap();
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["content"], "New task:\nadd\n\nObservation:\n5");
        assert_eq!(json[1]["role"], "assistant");
    }

    #[test]
    fn test_non_text_deltas_are_skipped() {
        let text: ContentBlockDelta =
            serde_json::from_str(r#"{"delta": {"type": "text_delta", "text": "x = 1"}}"#).unwrap();
        assert!(matches!(text.delta, DeltaContent::TextDelta { .. }));
        let other: ContentBlockDelta =
            serde_json::from_str(r#"{"delta": {"type": "input_json_delta", "partial_json": "{"}}"#)
                .unwrap();
        assert!(matches!(other.delta, DeltaContent::Other));
    }

    #[test]
    fn test_response_parsing_skips_unknown_blocks() {
        let body = serde_json::json!({
            "id": "msg_1",
            "model": "claude",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Code:\n```py\nx = 1\n```"}
            ],
            "stop_reason": "stop_sequence",
            "usage": {"input_tokens": 7, "output_tokens": 3}
        });
        let parsed: AnthropicResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert!(matches!(parsed.content[0], ContentBlock::Other));
        assert_eq!(stop_reason(parsed.stop_reason.as_deref()), FinishReason::Stop);
    }

    #[test]
    fn test_missing_api_key_is_auth_failure() {
        let mut config = ProviderConfig::anthropic("");
        config.api_key = None;
        let provider = AnthropicProvider::new(config).unwrap();
        let err = provider
            .build(CompletionRequest::new(vec![ChatMessage::user("hi")]), false)
            .unwrap_err();
        assert_eq!(err, ProviderError::AuthenticationFailed);
    }
}
