//! Decoding of upstream Server-Sent Events bodies.
//!
//! Providers stream their replies as SSE. The body arrives in arbitrary
//! byte slices, so events (and UTF-8 sequences) may be split across reads;
//! [`SseDecoder`] buffers until a blank line closes an event.

use futures::stream::{BoxStream, StreamExt};

use crate::backend::BackendError;

/// One decoded upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(msg) = parse_block(&block[..pos]) {
                messages.push(msg);
            }
        }
        messages
    }

    /// Flush a trailing event not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseMessage> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block)
    }
}

fn parse_block(block: &[u8]) -> Option<SseMessage> {
    let text = String::from_utf8_lossy(block);
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() && event.is_none() {
        return None;
    }
    Some(SseMessage {
        event,
        data: data.join("\n"),
    })
}

/// Turn a streaming response body into a stream of decoded events.
pub fn sse_messages(response: reqwest::Response) -> BoxStream<'static, Result<SseMessage, BackendError>> {
    let stream = async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        while let Some(item) = body.next().await {
            match item {
                Ok(bytes) => {
                    for msg in decoder.push(&bytes) {
                        yield Ok(msg);
                    }
                }
                Err(e) => {
                    yield Err(BackendError::from(e));
                    return;
                }
            }
        }

        if let Some(msg) = decoder.finish() {
            yield Ok(msg);
        }
    };
    stream.boxed()
}
