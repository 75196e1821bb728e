//! The operations endpoint: definitions listing plus `POST /<service>/<operation>`.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use super::DispatchState;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::service::CallContext;

/// Path serving the Definitions document.
pub const OPERATIONS_PATH: &str = "/.lightwave/operations";

/// Fallback handler implementing the whole HTTP surface.
///
/// Rules are applied in order: the definitions listing, then 405 for any
/// other non-POST request, then 404 for paths that are not exactly
/// `/<service>/<operation>`, then dispatch.
pub async fn dispatch_handler(
    State(state): State<DispatchState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();

    if method == Method::GET && path == OPERATIONS_PATH {
        return Json(state.dispatcher.definitions()).into_response();
    }

    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }

    let Some((service, operation)) = split_route(path) else {
        return (StatusCode::NOT_FOUND, format!("invalid path: {path}")).into_response();
    };

    let mut ctx = CallContext::with_cancellation(state.cancellation.child_token());
    if let Some(id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        ctx = ctx.with_request_id(id);
    }

    match state.dispatcher.call(ctx, service, operation, body).await {
        Ok(output) => ([(CONTENT_TYPE, "application/json")], output).into_response(),
        Err(err) => {
            debug!(service, operation, error = %err, "rejecting call");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

/// Splits `/<service>/<operation>` into its two segments.
fn split_route(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let mut segments = trimmed.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(service), Some(operation), None) => Some((service, operation)),
        _ => None,
    }
}
