//! Handler definitions for the operations router.
//!
//! This module defines `DispatchState` (the shared state carried through axum
//! extractors) and re-exports the handler functions used when building the
//! router.

pub mod operations;

pub use operations::{dispatch_handler, OPERATIONS_PATH};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::service::Dispatcher;

/// Shared state passed to the operations handler via `State` extraction.
#[derive(Clone)]
pub struct DispatchState {
    /// Compiled routing table.
    pub dispatcher: Arc<Dispatcher>,
    /// Parent of every per-request cancellation token.
    pub cancellation: CancellationToken,
}
