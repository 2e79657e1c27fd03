//! Response body sink for the push handler
//!
//! The push handler runs in its own task and writes through a
//! [`ChannelSink`]. The HTTP handler waits for the response head, then
//! streams body chunks as they are flushed. Dropping the response body
//! (client disconnect) cancels the push handler's token.

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use floodgate_common::sse::EventSink;
use std::convert::Infallible;
use std::io;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::ApiError;

/// Chunks buffered between the push task and the response body
const BODY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
struct ResponseHead {
    status: StatusCode,
    headers: Vec<(&'static str, &'static str)>,
}

/// [`EventSink`] writing into a streamed axum response body
pub struct ChannelSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::Sender<Bytes>,
    buffer: Vec<u8>,
}

/// Receiving half of a [`ChannelSink`]
pub struct PendingResponse {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

/// Create a sink and the response it feeds; `cancel` fires when the body is dropped
pub fn channel(cancel: CancellationToken) -> (ChannelSink, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    (
        ChannelSink {
            head: Some(head_tx),
            body: body_tx,
            buffer: Vec::new(),
        },
        PendingResponse {
            head: head_rx,
            body: body_rx,
            cancel,
        },
    )
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped")
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send_head(
        &mut self,
        status: StatusCode,
        headers: &[(&'static str, &'static str)],
    ) -> io::Result<()> {
        let head = self.head.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "response head already sent")
        })?;
        head.send(ResponseHead {
            status,
            headers: headers.to_vec(),
        })
        .map_err(|_| client_gone())
    }

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.body.is_closed() {
            return Err(client_gone());
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buffer));
        self.body.send(chunk).await.map_err(|_| client_gone())
    }
}

impl PendingResponse {
    /// Wait for the response head, then stream the body
    pub async fn into_response(self) -> Response {
        let PendingResponse {
            head,
            mut body,
            cancel,
        } = self;

        let head = match head.await {
            Ok(head) => head,
            Err(_) => {
                return ApiError::Internal("push handler ended before responding".to_string())
                    .into_response()
            }
        };

        let guard = cancel.drop_guard();
        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = body.recv().await {
                yield Ok::<_, Infallible>(chunk);
            }
        };

        let mut builder = Response::builder().status(head.status);
        for (name, value) in head.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from_stream(stream))
            .unwrap_or_else(|err| ApiError::Internal(err.to_string()).into_response())
    }
}
