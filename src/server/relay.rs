//! The streaming relay: one generation stream → one client connection.
//!
//! A [`RelaySession`] moves through
//! `Idle → Streaming → {Completed, Aborted, Failed}`:
//!
//! - `start` commits the connection head exactly once, before any frame.
//! - Each chunk is encoded and written; the next chunk is pulled only after
//!   the sink has accepted the previous frame.
//! - A backend error fails the session with an in-band error frame.
//! - Cancellation or client disconnect aborts it: nothing more is pulled or
//!   written, and the chunk stream is dropped.
//! - Exhaustion completes it with the `[DONE]` frame.

use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, Chunk, ChunkStream};
use crate::server::encoder::{encode, WireEvent};
use crate::server::sink::{EventSink, StreamHead};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Aborted | RelayState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Idle => "idle",
            RelayState::Streaming => "streaming",
            RelayState::Completed => "completed",
            RelayState::Aborted => "aborted",
            RelayState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Relay cancelled")]
    Cancelled,
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub session_id: Uuid,
    pub state: RelayState,
    /// Data frames accepted by the sink (terminal frames not counted).
    pub frames_written: usize,
    pub error: Option<RelayError>,
}

/// Single-use binding of one chunk stream to one client connection.
pub struct RelaySession<S: EventSink> {
    id: Uuid,
    state: RelayState,
    sink: S,
    cancel: CancellationToken,
    chunk_timeout: Option<Duration>,
    frames_written: usize,
}

impl<S: EventSink> RelaySession<S> {
    pub fn new(sink: S, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RelayState::Idle,
            sink,
            cancel,
            chunk_timeout: None,
            frames_written: 0,
        }
    }

    /// Fail the session when no chunk arrives within `timeout`.
    pub fn with_chunk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Run the session to a terminal state.
    pub async fn start(mut self, chunks: ChunkStream) -> RelayReport {
        // `run` owns the stream, so it is released on every return path.
        let result = self.run(chunks).await;

        let error = match result {
            Ok(()) => {
                self.state = RelayState::Completed;
                None
            }
            Err(RelayError::Backend(e)) => {
                self.state = RelayState::Failed;
                warn!(session = %self.id, error = %e, frames = self.frames_written, "Relay failed");
                self.signal_failure(&e).await;
                Some(RelayError::Backend(e))
            }
            Err(e) => {
                self.state = RelayState::Aborted;
                debug!(session = %self.id, reason = %e, frames = self.frames_written, "Relay aborted");
                Some(e)
            }
        };

        self.sink.close().await;

        info!(
            session = %self.id,
            state = %self.state,
            frames = self.frames_written,
            "Relay session finished"
        );

        RelayReport {
            session_id: self.id,
            state: self.state,
            frames_written: self.frames_written,
            error,
        }
    }

    async fn run(&mut self, mut chunks: ChunkStream) -> Result<(), RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        self.sink
            .commit(StreamHead::event_stream())
            .await
            .map_err(|_| RelayError::ClientDisconnected)?;
        self.state = RelayState::Streaming;
        debug!(session = %self.id, "Relay streaming");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = self.sink.closed() => return Err(RelayError::ClientDisconnected),
                item = next_chunk(&mut chunks, self.chunk_timeout) => item,
            };

            match next {
                Some(Ok(chunk)) => {
                    self.write(WireEvent::Data(chunk.text)).await?;
                    self.frames_written += 1;
                }
                Some(Err(e)) => return Err(RelayError::Backend(e)),
                None => break,
            }
        }

        self.write(WireEvent::Done).await
    }

    async fn write(&mut self, event: WireEvent) -> Result<(), RelayError> {
        let frame = encode(&event);
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
            sent = self.sink.send(frame) => sent,
        };
        sent.map_err(|_| RelayError::ClientDisconnected)
    }

    /// Best-effort in-band error frame; the head is already committed.
    async fn signal_failure(&mut self, error: &BackendError) {
        let event = WireEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        };
        if let Err(e) = self.write(event).await {
            debug!(session = %self.id, error = %e, "Could not deliver error frame");
        }
    }
}

async fn next_chunk(
    chunks: &mut ChunkStream,
    timeout: Option<Duration>,
) -> Option<Result<Chunk, BackendError>> {
    match timeout {
        None => chunks.next().await,
        Some(limit) => match tokio::time::timeout(limit, chunks.next()).await {
            Ok(item) => item,
            Err(_) => Some(Err(BackendError::Timeout(format!(
                "no chunk received within {}s",
                limit.as_secs_f64()
            )))),
        },
    }
}
