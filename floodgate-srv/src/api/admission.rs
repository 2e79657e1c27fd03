//! Admission middleware
//!
//! Runs the security engine before the handler and records the response
//! status afterwards, including for rejected requests.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use floodgate_common::request::RequestRecord;
use std::net::SocketAddr;
use tracing::{debug, warn};

use super::ApiError;
use crate::AppState;

pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ConnectInfo(remote_addr)) = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .copied()
    else {
        warn!(uri = %request.uri(), "Request without a peer address");
        return ApiError::BadRequest("unknown remote address".to_string()).into_response();
    };

    let record = RequestRecord::new(request.method().clone(), remote_addr);

    if state.engine.rate_limit_request(&record) {
        debug!(socket = %remote_addr, uri = %request.uri(), "Rejected by admission control");
        let response = ApiError::TooManyRequests.into_response();
        state.engine.post_handle(&record, response.status());
        return response;
    }

    let response = next.run(request).await;
    state.engine.post_handle(&record, response.status());
    response
}
