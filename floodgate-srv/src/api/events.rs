//! Event stream endpoints
//!
//! - `GET /events/*path` subscribes to a stream (Server-Sent Events)
//! - `POST /events/*path` publishes one event
//! - `DELETE /events/*path` stops and removes a stream
//!
//! The stream id is the request path, prefixed with the `X-Session-Id`
//! header when present.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    Json,
};
use floodgate_common::events::Event;
use floodgate_common::sse::wire::{EVENT_STREAM_CONTENT_TYPE, LAST_EVENT_ID_HEADER};
use floodgate_common::sse::{push_events, stream_id, PushRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{sink, ApiError};
use crate::AppState;

/// Header scoping streams to a client session
pub const SESSION_HEADER: &str = "x-session-id";

/// Event submitted by a producer
#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub data: String,
    pub event: Option<String>,
    pub retry: Option<u64>,
    pub comment: Option<String>,
    /// Tell subscribers the producer is done
    #[serde(default)]
    pub end: bool,
}

impl PublishRequest {
    fn into_event(self) -> Event {
        if self.end {
            return Event::end_of_stream();
        }
        let mut event = Event::new(self.data);
        if let Some(name) = self.event {
            event = event.with_event_name(name);
        }
        if let Some(retry) = self.retry {
            event = event.with_retry(retry);
        }
        if let Some(comment) = self.comment {
            event = event.with_comment(comment);
        }
        event
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub stream: String,
    pub subscribers: usize,
}

fn session(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

/// Whether the `Accept` header admits an event stream; absent means anything
fn accepts_event_stream(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    accept.split(',').any(|range| {
        let media = range.split(';').next().unwrap_or("").trim();
        media.eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE)
            || media.eq_ignore_ascii_case("text/*")
            || media == "*/*"
    })
}

/// GET /events/*path
pub async fn subscribe(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !accepts_event_stream(&headers) {
        return Err(ApiError::NotAcceptable);
    }

    let id = stream_id(session(&headers), uri.path());
    let stream = state.registry.create_stream(&id);

    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
    let cancel = CancellationToken::new();
    let request = PushRequest::new(uri.to_string(), cancel.clone())
        .with_last_event_id(last_event_id)
        .with_split_data_lines(state.config.streams.split_data_lines);

    let (mut sink, pending) = sink::channel(cancel);
    let registry = Arc::clone(&state.registry);
    tokio::spawn(async move {
        match push_events(&registry, stream, request, &mut sink).await {
            Ok(outcome) => debug!(stream = %id, ?outcome, "Event push finished"),
            Err(err) => warn!(stream = %id, status = %err.status_code(), "Event push rejected: {}", err),
        }
    });

    Ok(pending.into_response().await)
}

/// POST /events/*path
pub async fn publish(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let id = stream_id(session(&headers), uri.path());
    let event = body.into_event();
    if !event.is_end_of_stream() && !event.has_content() {
        return Err(ApiError::BadRequest("event has no content".to_string()));
    }

    let mut stream = state.registry.create_stream(&id);
    if stream.try_publish(event.clone()).await.is_err() {
        // stopped between lookup and publish; a fresh stream replaces it
        stream = state.registry.create_stream(&id);
        stream
            .try_publish(event)
            .await
            .map_err(|err| ApiError::Unavailable(err.to_string()))?;
    }

    debug!(stream = %id, "Event published");
    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            stream: id,
            subscribers: stream.subscriber_count(),
        }),
    ))
}

/// DELETE /events/*path
pub async fn remove_stream(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let id = stream_id(session(&headers), uri.path());
    if state.registry.remove_stream(&id) {
        info!(stream = %id, "Stream removed on request");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_accept_negotiation() {
        assert!(accepts_event_stream(&HeaderMap::new()));
        assert!(accepts_event_stream(&with_accept("text/event-stream")));
        assert!(accepts_event_stream(&with_accept("application/json, text/*;q=0.5")));
        assert!(accepts_event_stream(&with_accept("*/*")));
        assert!(!accepts_event_stream(&with_accept("application/json")));
    }

    #[test]
    fn test_publish_request_into_event() {
        let event = PublishRequest {
            data: "hello".to_string(),
            event: Some("greeting".to_string()),
            retry: Some(1000),
            ..PublishRequest::default()
        }
        .into_event();
        assert_eq!(event.data(), "hello");
        assert_eq!(event.event_name(), "greeting");
        assert_eq!(event.retry(), Some(1000));

        let end = PublishRequest {
            end: true,
            ..PublishRequest::default()
        }
        .into_event();
        assert!(end.is_end_of_stream());
    }
}
