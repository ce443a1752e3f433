//! Anthropic messages API provider.
//!
//! The messages API has no `system` role inside `messages`; system turns are
//! lifted into the top-level `system` field.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::backend::sse::{sse_messages, SseMessage};
use crate::backend::{api_key, http_client, BackendError, Chunk, ChunkStream, GenerationBackend};
use crate::config::BackendConfig;
use crate::translate::{BackendMessage, GenerationRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a BackendMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum StreamData {
    Text(String),
    Skip,
    End,
}

fn parse_stream_event(msg: &SseMessage) -> Result<StreamData, BackendError> {
    let v: Value = serde_json::from_str(&msg.data)
        .map_err(|e| BackendError::Unavailable(format!("invalid stream payload: {e}")))?;

    let kind = msg
        .event
        .as_deref()
        .or_else(|| v["type"].as_str())
        .unwrap_or_default();

    match kind {
        "content_block_delta" => match v["delta"]["text"].as_str() {
            Some(text) if !text.is_empty() => Ok(StreamData::Text(text.to_string())),
            _ => Ok(StreamData::Skip),
        },
        "message_stop" => Ok(StreamData::End),
        "error" => Err(stream_error(&v["error"])),
        _ => Ok(StreamData::Skip),
    }
}

fn stream_error(err: &Value) -> BackendError {
    let message = err["message"].as_str().unwrap_or("unknown error").to_string();
    match err["type"].as_str() {
        Some("invalid_request_error") | Some("not_found_error") => BackendError::Rejected(message),
        Some("timeout_error") => BackendError::Timeout(message),
        _ => BackendError::Unavailable(message),
    }
}

pub struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_tokens: u32,
}

impl AnthropicBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.connect_timeout_secs)?,
            base_url: config.base_url(),
            api_key: api_key(config.api_key_env()),
            max_tokens: config.max_tokens,
        })
    }

    async fn send(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let model = request
            .model
            .as_deref()
            .ok_or_else(|| BackendError::Rejected("no model specified".to_string()))?;

        let (system, messages): (Vec<&BackendMessage>, Vec<&BackendMessage>) =
            request.messages.iter().partition(|m| m.role == "system");
        let system = (!system.is_empty()).then(|| {
            system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });

        let body = MessagesRequest {
            model,
            max_tokens: self.max_tokens,
            system,
            messages,
            stream,
        };

        let mut builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        debug!(model, stream, messages = request.messages.len(), "Anthropic request");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: GenerationRequest) -> Result<String, BackendError> {
        let response = self.send(&request, false).await?;
        let parsed: MessagesResponse = response.json().await?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        info!(chars = text.len(), "Anthropic completion received");
        Ok(text)
    }

    async fn stream(&self, request: GenerationRequest) -> Result<ChunkStream, BackendError> {
        let response = self.send(&request, true).await?;
        let mut events = sse_messages(response);

        let stream = async_stream::stream! {
            while let Some(event) = events.next().await {
                let parsed = event.and_then(|msg| parse_stream_event(&msg));
                match parsed {
                    Ok(StreamData::Text(text)) => yield Ok(Chunk::new(text)),
                    Ok(StreamData::Skip) => {}
                    Ok(StreamData::End) => return,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            // Upstream closed without message_stop: the reply is truncated.
            yield Err(BackendError::Unavailable(
                "stream ended before message_stop".to_string(),
            ));
        };
        Ok(stream.boxed())
    }
}
