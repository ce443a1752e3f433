//! Scripted generation backend.
//!
//! Serves a fixed reply, or echoes the last user message, one word per
//! chunk. Streams are lazy: nothing is produced until the consumer polls.
//! A shared [`MockStats`] records calls, pulled chunks and stream releases.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::backend::{BackendError, Chunk, ChunkStream, GenerationBackend};
use crate::config::MockConfig;
use crate::translate::GenerationRequest;

/// One scripted stream element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    Chunk(String),
    Fail(BackendError),
}

#[derive(Debug, Clone)]
enum Reply {
    Script(Vec<MockStep>),
    Echo,
}

/// Counters shared between a [`MockBackend`] and its streams.
#[derive(Debug, Default)]
pub struct MockStats {
    calls: AtomicUsize,
    pulled: AtomicUsize,
    released: AtomicUsize,
}

impl MockStats {
    /// Number of `complete`/`stream` calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of stream elements produced so far.
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    /// Number of streams dropped by their consumer.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Increments the release counter when the owning stream is dropped.
struct ReleaseGuard(Arc<MockStats>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct StreamState {
    steps: VecDeque<MockStep>,
    delay: Duration,
    stats: Arc<MockStats>,
    _guard: ReleaseGuard,
}

pub struct MockBackend {
    reply: Reply,
    chunk_delay: Duration,
    open_error: Option<BackendError>,
    stats: Arc<MockStats>,
}

fn split_words(text: &str) -> Vec<MockStep> {
    text.split_inclusive(' ')
        .map(|w| MockStep::Chunk(w.to_string()))
        .collect()
}

impl MockBackend {
    /// Reply with exactly these chunks.
    pub fn scripted<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_steps(chunks.into_iter().map(|c| MockStep::Chunk(c.into())).collect())
    }

    /// Reply with an explicit step list, including failures.
    pub fn with_steps(steps: Vec<MockStep>) -> Self {
        Self {
            reply: Reply::Script(steps),
            chunk_delay: Duration::ZERO,
            open_error: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Echo the last user message back, one word per chunk.
    pub fn echo() -> Self {
        Self {
            reply: Reply::Echo,
            chunk_delay: Duration::ZERO,
            open_error: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn from_config(config: &MockConfig) -> Self {
        let backend = match &config.reply {
            Some(reply) => Self::with_steps(split_words(reply)),
            None => Self::echo(),
        };
        backend.with_chunk_delay(Duration::from_millis(config.chunk_delay_ms))
    }

    /// Sleep before producing each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Fail every call before any chunk is produced.
    pub fn failing_open(mut self, error: BackendError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    fn steps_for(&self, request: &GenerationRequest) -> Vec<MockStep> {
        match &self.reply {
            Reply::Script(steps) => steps.clone(),
            Reply::Echo => split_words(request.last_user_text().unwrap_or_default()),
        }
    }

    fn begin_call(&self) -> Result<(), BackendError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        match &self.open_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: GenerationRequest) -> Result<String, BackendError> {
        self.begin_call()?;

        let mut text = String::new();
        for step in self.steps_for(&request) {
            match step {
                MockStep::Chunk(t) => text.push_str(&t),
                MockStep::Fail(e) => return Err(e),
            }
        }
        Ok(text)
    }

    async fn stream(&self, request: GenerationRequest) -> Result<ChunkStream, BackendError> {
        self.begin_call()?;

        let steps: VecDeque<MockStep> = self.steps_for(&request).into();
        debug!(steps = steps.len(), model = ?request.model, "Mock stream opened");

        let state = StreamState {
            steps,
            delay: self.chunk_delay,
            stats: self.stats.clone(),
            _guard: ReleaseGuard(self.stats.clone()),
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            let step = st.steps.pop_front()?;
            if !st.delay.is_zero() {
                tokio::time::sleep(st.delay).await;
            }
            st.stats.pulled.fetch_add(1, Ordering::SeqCst);

            let item = match step {
                MockStep::Chunk(text) => Ok(Chunk::new(text)),
                MockStep::Fail(e) => {
                    st.steps.clear();
                    Err(e)
                }
            };
            Some((item, st))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::BackendMessage;

    fn request(text: &str) -> GenerationRequest {
        GenerationRequest {
            model: None,
            messages: vec![BackendMessage {
                role: "user".to_string(),
                content: text.to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_echo_stream_is_lazy_and_released() {
        let backend = MockBackend::echo();
        let stats = backend.stats();

        let mut stream = backend.stream(request("one two three")).await.unwrap();
        assert_eq!(stats.pulled(), 0);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "one ");
        assert_eq!(stats.pulled(), 1);

        drop(stream);
        assert_eq!(stats.released(), 1);
        assert_eq!(stats.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_ends_stream() {
        let backend = MockBackend::with_steps(vec![
            MockStep::Chunk("a".to_string()),
            MockStep::Fail(BackendError::Unavailable("down".to_string())),
            MockStep::Chunk("never".to_string()),
        ]);

        let items: Vec<_> = backend.stream(request("x")).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());

        let err = backend.complete(request("x")).await.unwrap_err();
        assert_eq!(err, BackendError::Unavailable("down".to_string()));
    }

    #[tokio::test]
    async fn test_complete_concatenates_and_open_failure() {
        let backend = MockBackend::scripted(["He", "llo", "!"]);
        assert_eq!(backend.complete(request("x")).await.unwrap(), "Hello!");

        let failing = MockBackend::echo().failing_open(BackendError::Timeout("slow".to_string()));
        assert!(failing.stream(request("x")).await.is_err());
        assert_eq!(failing.stats().calls(), 1);
    }
}
