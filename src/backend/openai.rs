//! OpenAI-compatible chat completions provider.
//!
//! Works against OpenAI itself and any server exposing
//! `POST {base_url}/chat/completions` (Ollama, vLLM, llama.cpp server, ...).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::backend::sse::sse_messages;
use crate::backend::{api_key, http_client, BackendError, Chunk, ChunkStream, GenerationBackend};
use crate::config::BackendConfig;
use crate::translate::{BackendMessage, GenerationRequest};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [BackendMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// What a single upstream `data:` payload means for the relay.
#[derive(Debug, PartialEq, Eq)]
enum StreamData {
    Text(String),
    Skip,
    End,
}

/// Interpret one `data:` payload of a streaming response.
fn parse_stream_data(data: &str) -> Result<StreamData, BackendError> {
    if data.trim() == "[DONE]" {
        return Ok(StreamData::End);
    }

    let v: Value = serde_json::from_str(data)
        .map_err(|e| BackendError::Unavailable(format!("invalid stream payload: {e}")))?;

    if let Some(err) = v.get("error") {
        return Err(stream_error(err));
    }

    let text = v["choices"][0]["delta"]["content"].as_str().unwrap_or("");
    if text.is_empty() {
        Ok(StreamData::Skip)
    } else {
        Ok(StreamData::Text(text.to_string()))
    }
}

fn stream_error(err: &Value) -> BackendError {
    let message = err["message"].as_str().unwrap_or("unknown error").to_string();
    match err["type"].as_str().or_else(|| err["code"].as_str()) {
        Some("invalid_request_error") | Some("model_not_found") => BackendError::Rejected(message),
        _ => BackendError::Unavailable(message),
    }
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.connect_timeout_secs)?,
            base_url: config.base_url(),
            api_key: api_key(config.api_key_env()),
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

        let body = ChatCompletionRequest {
            model,
            messages: &request.messages,
            stream,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(model, stream, messages = request.messages.len(), "OpenAI request");
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
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: GenerationRequest) -> Result<String, BackendError> {
        let response = self.send(&request, false).await?;
        let parsed: ChatCompletionResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        info!(chars = text.len(), "OpenAI completion received");
        Ok(text)
    }

    async fn stream(&self, request: GenerationRequest) -> Result<ChunkStream, BackendError> {
        let response = self.send(&request, true).await?;
        let mut events = sse_messages(response);

        let stream = async_stream::stream! {
            while let Some(event) = events.next().await {
                let parsed = event.and_then(|msg| parse_stream_data(&msg.data));
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
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delta_content() {
        let data = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"He"},"finish_reason":null}]}"#;
        assert_eq!(parse_stream_data(data).unwrap(), StreamData::Text("He".to_string()));
    }

    #[test]
    fn test_role_only_and_finish_chunks_are_skipped() {
        let role = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        let finish = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_stream_data(role).unwrap(), StreamData::Skip);
        assert_eq!(parse_stream_data(finish).unwrap(), StreamData::Skip);
        assert_eq!(parse_stream_data("[DONE]").unwrap(), StreamData::End);
    }

    #[test]
    fn test_in_stream_error() {
        let data = r#"{"error":{"message":"model gone","type":"invalid_request_error"}}"#;
        assert_eq!(
            parse_stream_data(data).unwrap_err(),
            BackendError::Rejected("model gone".to_string())
        );
        assert!(matches!(
            parse_stream_data("{oops"),
            Err(BackendError::Unavailable(_))
        ));
    }
}
