//! Router assembly for a compiled dispatcher.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tokio_util::sync::CancellationToken;

use super::config::HttpConfig;
use super::handlers::{dispatch_handler, DispatchState};
use super::middleware::build_http_layers;
use crate::service::Dispatcher;

/// Builds the operations router for `dispatcher`.
///
/// Every request context is a child of `cancellation`, so cancelling it
/// propagates into handlers that are still running.
#[must_use]
pub fn build_router(
    dispatcher: Arc<Dispatcher>,
    config: &HttpConfig,
    cancellation: CancellationToken,
) -> Router {
    let state = DispatchState {
        dispatcher,
        cancellation,
    };

    Router::new()
        .fallback(dispatch_handler)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(build_http_layers(config))
}
