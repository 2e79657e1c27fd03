//! Push handler: serves one client connection from a stream subscription
//!
//! The handler is transport-agnostic. It writes through an [`EventSink`],
//! which the HTTP layer implements over its response body.

use super::registry::StreamRegistry;
use super::stream::{EventStream, Subscription};
use super::wire::{self, SSE_RESPONSE_HEADERS};
use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Response writer able to flush partial bodies
#[async_trait]
pub trait EventSink: Send {
    /// Whether written bytes can be pushed to the client before the body ends
    fn supports_flush(&self) -> bool {
        true
    }

    /// Status line and headers; called exactly once, before any write
    async fn send_head(
        &mut self,
        status: StatusCode,
        headers: &[(&'static str, &'static str)],
    ) -> io::Result<()>;

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("connection does not support streaming responses")]
    FlushUnsupported,

    #[error("invalid Last-Event-ID: {0:?}")]
    InvalidLastEventId(String),

    #[error("failed to start event stream: {0}")]
    Sink(#[from] io::Error),
}

impl PushError {
    /// Status already sent to the client for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            PushError::FlushUnsupported | PushError::Sink(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PushError::InvalidLastEventId(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Why a push loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Producer sent an end-of-stream marker
    EndOfStream,
    /// Request context was cancelled
    Cancelled,
    /// The stream stopped the subscription
    StreamStopped,
    /// Writing to the client failed
    Disconnected,
}

/// Per-connection inputs of [`push_events`]
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Raw `Last-Event-ID` header value
    pub last_event_id: Option<String>,
    pub url: String,
    /// Cancelled when the client goes away
    pub cancel: CancellationToken,
    pub split_data_lines: bool,
}

impl PushRequest {
    pub fn new(url: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            last_event_id: None,
            url: url.into(),
            cancel,
            split_data_lines: true,
        }
    }

    pub fn with_last_event_id(mut self, value: Option<String>) -> Self {
        self.last_event_id = value;
        self
    }

    pub fn with_split_data_lines(mut self, split: bool) -> Self {
        self.split_data_lines = split;
        self
    }
}

/// Stream events from `stream` to `sink` until the connection ends
///
/// Errors are returned only for failures before the event stream started;
/// the matching error response has already been written to the sink, and
/// the stream is unregistered if nobody else is subscribed to it. Once the
/// loop ends the subscription is removed, and the stream is removed from
/// `registry` if that left it without subscribers.
pub async fn push_events<S>(
    registry: &StreamRegistry,
    stream: Arc<EventStream>,
    request: PushRequest,
    sink: &mut S,
) -> Result<PushOutcome, PushError>
where
    S: EventSink + ?Sized,
{
    let cursor = match open(&request, sink).await {
        Ok(cursor) => cursor,
        Err(err) => {
            debug!(stream = %stream.id(), error = %err, "Subscription refused");
            if stream.subscriber_count() == 0 {
                registry.remove_if_current(&stream);
            }
            return Err(err);
        }
    };

    let mut subscription = stream.add_subscription(cursor, request.url);
    info!(
        stream = %stream.id(),
        subscription = subscription.id(),
        cursor,
        "Client subscribed"
    );

    let outcome = pump(&mut subscription, sink, &request.cancel, request.split_data_lines).await;

    subscription.mark_stopped();
    let remaining = stream.remove_subscription(&subscription);
    info!(
        stream = %stream.id(),
        subscription = subscription.id(),
        ?outcome,
        remaining,
        "Client unsubscribed"
    );
    if remaining == 0 {
        registry.remove_if_current(&stream);
    }

    Ok(outcome)
}

async fn pump<S>(
    subscription: &mut Subscription,
    sink: &mut S,
    cancel: &CancellationToken,
    split_data_lines: bool,
) -> PushOutcome
where
    S: EventSink + ?Sized,
{
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PushOutcome::Cancelled,
            received = subscription.recv() => received,
        };

        let Some(event) = received else {
            return PushOutcome::StreamStopped;
        };

        if event.is_end_of_stream() {
            subscription.close();
            return PushOutcome::EndOfStream;
        }
        // events carrying neither data nor a comment also end the stream
        if event.data().is_empty() && event.comment_text().is_empty() {
            return PushOutcome::EndOfStream;
        }

        let frame = wire::encode_event(&event, split_data_lines);
        if let Err(err) = write_frame(sink, frame.as_bytes()).await {
            debug!(subscription = subscription.id(), error = %err, "Client write failed");
            return PushOutcome::Disconnected;
        }
    }
}

async fn write_frame<S>(sink: &mut S, frame: &[u8]) -> io::Result<()>
where
    S: EventSink + ?Sized,
{
    sink.write(frame).await?;
    sink.flush().await
}

/// Validate the connection and send the SSE head, returning the cursor
async fn open<S>(request: &PushRequest, sink: &mut S) -> Result<u64, PushError>
where
    S: EventSink + ?Sized,
{
    if !sink.supports_flush() {
        reject(sink, StatusCode::INTERNAL_SERVER_ERROR, "Streaming unsupported").await;
        return Err(PushError::FlushUnsupported);
    }

    let Ok(cursor) = wire::parse_cursor(request.last_event_id.as_deref()) else {
        reject(sink, StatusCode::BAD_REQUEST, "Invalid Last-Event-ID").await;
        let raw = request.last_event_id.clone().unwrap_or_default();
        return Err(PushError::InvalidLastEventId(raw));
    };

    sink.send_head(StatusCode::OK, &SSE_RESPONSE_HEADERS).await?;
    sink.flush().await?;
    Ok(cursor)
}

/// Error response in the same `{"error": ...}` shape as the HTTP API
async fn reject<S>(sink: &mut S, status: StatusCode, message: &str)
where
    S: EventSink + ?Sized,
{
    let body = json!({ "error": message }).to_string();
    let result = async {
        sink.send_head(status, &[("content-type", "application/json")])
            .await?;
        sink.write(body.as_bytes()).await?;
        if sink.supports_flush() {
            sink.flush().await?;
        }
        Ok::<_, io::Error>(())
    }
    .await;

    if let Err(err) = result {
        debug!(%status, error = %err, "Failed to write rejection");
    }
}
