//! Client connection abstraction used by the relay.
//!
//! [`EventSink`] is the relay's view of one open client connection. The axum
//! implementation, [`ChannelSink`], hands the committed head to the request
//! handler through a oneshot and the frames through a bounded channel of
//! capacity one, so a frame counts as accepted only once the previous one has
//! been taken by the HTTP body.

use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// In-flight frames allowed between the relay and the HTTP body.
pub const FRAME_BUFFER: usize = 1;

/// SSE comment written to idle streams. Clients ignore it.
pub const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Client disconnected")]
    Disconnected,

    #[error("Connection already committed to streaming")]
    AlreadyCommitted,

    #[error("Connection not yet committed to streaming")]
    NotCommitted,
}

/// Response head fixed when the relay commits a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHead {
    pub content_type: &'static str,
    pub cache_control: &'static str,
    pub connection: &'static str,
}

impl StreamHead {
    pub fn event_stream() -> Self {
        Self {
            content_type: "text/event-stream",
            cache_control: "no-cache",
            connection: "keep-alive",
        }
    }

    /// Build an HTTP response carrying this head and the given body.
    pub fn into_response(self, body: Body) -> Response {
        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(self.cache_control));
        headers.insert(header::CONNECTION, HeaderValue::from_static(self.connection));
        response
    }
}

/// One open client connection, as seen by the relay.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Fix the response head. Must precede every [`send`](Self::send).
    async fn commit(&mut self, head: StreamHead) -> Result<(), SinkError>;

    /// Write one frame, returning once the transport has accepted it.
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkError>;

    /// Resolves when the client has gone away.
    async fn closed(&self);

    /// End the response. Idempotent.
    async fn close(&mut self);
}

/// Sink backed by channels feeding an axum response.
pub struct ChannelSink {
    head_tx: Option<oneshot::Sender<StreamHead>>,
    frames: Option<mpsc::Sender<Bytes>>,
}

/// Handler-side half of a [`ChannelSink`].
pub struct SinkReceiver {
    head_rx: oneshot::Receiver<StreamHead>,
    frames: mpsc::Receiver<Bytes>,
}

/// Create a connected sink/receiver pair.
pub fn channel() -> (ChannelSink, SinkReceiver) {
    let (head_tx, head_rx) = oneshot::channel();
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
    (
        ChannelSink {
            head_tx: Some(head_tx),
            frames: Some(frame_tx),
        },
        SinkReceiver {
            head_rx,
            frames: frame_rx,
        },
    )
}

impl SinkReceiver {
    /// Wait for the relay to commit. Fails if it ended without committing.
    pub async fn committed(self) -> Result<(StreamHead, mpsc::Receiver<Bytes>), SinkError> {
        let head = self.head_rx.await.map_err(|_| SinkError::NotCommitted)?;
        Ok((head, self.frames))
    }

    /// Wait for the commit and turn it into a streaming HTTP response.
    ///
    /// With `keep_alive` set, a comment frame is written whenever no frame
    /// has gone out for that long.
    pub async fn into_response(self, keep_alive: Option<Duration>) -> Result<Response, SinkError> {
        let (head, frames) = self.committed().await?;
        let body = match keep_alive {
            Some(period) => Body::from_stream(with_keep_alive(frames, period)),
            None => Body::from_stream(ReceiverStream::new(frames).map(Ok::<_, Infallible>)),
        };
        Ok(head.into_response(body))
    }
}

fn with_keep_alive(
    mut frames: mpsc::Receiver<Bytes>,
    period: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let (next, idle) = tokio::select! {
                frame = frames.recv() => (frame, false),
                _ = ticks.tick() => (Some(Bytes::from_static(KEEP_ALIVE_FRAME)), true),
            };
            if !idle {
                ticks.reset();
            }
            match next {
                Some(frame) => yield Ok(frame),
                None => break,
            }
        }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn commit(&mut self, head: StreamHead) -> Result<(), SinkError> {
        let tx = self.head_tx.take().ok_or(SinkError::AlreadyCommitted)?;
        tx.send(head).map_err(|_| SinkError::Disconnected)
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), SinkError> {
        if self.head_tx.is_some() {
            return Err(SinkError::NotCommitted);
        }
        let tx = self.frames.as_ref().ok_or(SinkError::Disconnected)?;
        tx.send(frame).await.map_err(|_| SinkError::Disconnected)
    }

    async fn closed(&self) {
        match &self.frames {
            Some(tx) => tx.closed().await,
            None => {}
        }
    }

    async fn close(&mut self) {
        self.frames = None;
    }
}
