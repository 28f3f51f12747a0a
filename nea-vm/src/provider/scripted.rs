//! Scripted provider: replays a fixed list of replies.
//!
//! Used for tests and `nea replay`. Replies are handed out in order, one
//! per request, and every request is recorded so callers can inspect the
//! prompts that were sent.

use super::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One canned backend response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedReply {
    /// A successful completion with this text
    Text(String),
    /// A transient backend failure
    Unavailable(String),
    /// A response body that cannot be decoded, given verbatim
    Malformed(String),
}

impl From<&str> for ScriptedReply {
    fn from(text: &str) -> Self {
        ScriptedReply::Text(text.to_string())
    }
}

impl From<String> for ScriptedReply {
    fn from(text: String) -> Self {
        ScriptedReply::Text(text)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplyEntry {
    Text(String),
    Tagged(ScriptedReply),
}

/// Deterministic backend driven by a script
#[derive(Debug)]
pub struct ScriptedProvider {
    replies: Vec<ScriptedReply>,
    cursor: AtomicUsize,
    repeat_last: bool,
    model: String,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new<I, R>(replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ScriptedReply>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            cursor: AtomicUsize::new(0),
            repeat_last: false,
            model: "scripted".into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Keep returning the last reply once the script runs out
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Parse a replay file: a JSON array whose entries are either plain
    /// strings or `{"text"|"unavailable"|"malformed": "..."}` objects.
    pub fn from_json(json: &str) -> Result<Self, ProviderError> {
        let entries: Vec<ReplyEntry> =
            serde_json::from_str(json).map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(Self::new(entries.into_iter().map(|e| match e {
            ReplyEntry::Text(text) => ScriptedReply::Text(text),
            ReplyEntry::Tagged(reply) => reply,
        })))
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of replies handed out
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let reply = match self.replies.get(index) {
            Some(reply) => reply,
            None if self.repeat_last => self
                .replies
                .last()
                .ok_or_else(|| ProviderError::Other("script is empty".into()))?,
            None => {
                return Err(ProviderError::Other(format!(
                    "script exhausted after {} replies",
                    self.replies.len()
                )))
            }
        };
        match reply {
            ScriptedReply::Text(text) => Ok(text.clone()),
            ScriptedReply::Unavailable(why) => Err(ProviderError::Network(why.clone())),
            ScriptedReply::Malformed(body) => Err(ProviderError::Malformed {
                message: "response body is not valid JSON".into(),
                body: body.clone(),
            }),
        }
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let text = self.next_reply(&request)?;
        let prompt_tokens = request
            .messages
            .iter()
            .map(|m| estimate_tokens(m.text()))
            .sum();
        let completion_tokens = estimate_tokens(&text);
        Ok(CompletionResponse {
            id: format!("scripted-{}", self.calls()),
            model: request.model.unwrap_or_else(|| self.model.clone()),
            content: Some(text),
            finish_reason: FinishReason::Stop,
            usage: Usage::new(prompt_tokens, completion_tokens),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamReceiver, ProviderError> {
        let response = self.complete(request).await?;
        let chunks = vec![
            StreamChunk::Text(response.content.unwrap_or_default()),
            StreamChunk::Done {
                finish_reason: response.finish_reason,
                usage: Some(response.usage),
            },
        ];
        Ok(StreamReceiver::new(futures_util::stream::iter(chunks)))
    }
}
