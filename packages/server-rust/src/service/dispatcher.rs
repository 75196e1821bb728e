use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use ops_core::servicedef::Definitions;
use tracing::{debug, trace};

use super::context::CallContext;
use super::handler::{ErasedHandler, HandlerError};
use super::resource::{downcast_loader, ResourceLoader};

/// Counter of dispatched calls, labelled by service, operation and outcome.
pub const CALLS_METRIC: &str = "ops_operation_calls_total";
/// Histogram of call latency in seconds, labelled by service and operation.
pub const DURATION_METRIC: &str = "ops_operation_duration_seconds";

// ---------------------------------------------------------------------------
// CallError
// ---------------------------------------------------------------------------

/// Per-call dispatch failure. Never fatal to the serving loop.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("service {service} not found")]
    ServiceNotFound { service: String },

    #[error("operation {operation} not found for service {service}")]
    OperationNotFound { service: String, operation: String },

    #[error("invalid input for {service}/{operation}: {source}")]
    InvalidInput {
        service: String,
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{service}/{operation} failed: {source:#}")]
    Operation {
        service: String,
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("encoding output of {service}/{operation}: {source}")]
    EncodeOutput {
        service: String,
        operation: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CallError {
    /// `true` for the two lookup failures.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound { .. } | Self::OperationNotFound { .. })
    }

    fn from_handler(service: &str, operation: &str, err: HandlerError) -> Self {
        let service = service.to_string();
        let operation = operation.to_string();
        match err {
            HandlerError::InvalidInput(source) => Self::InvalidInput {
                service,
                operation,
                source,
            },
            HandlerError::Failed(source) => Self::Operation {
                service,
                operation,
                source,
            },
            HandlerError::EncodeOutput(source) => Self::EncodeOutput {
                service,
                operation,
                source,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub(crate) struct CompiledOperation {
    pub(crate) handler: ErasedHandler,
}

/// Immutable routing table produced by [`Registry::build`](super::Registry::build).
///
/// Safe to share across any number of concurrent callers; nothing is locked
/// on the call path.
pub struct Dispatcher {
    routes: HashMap<String, HashMap<String, CompiledOperation>>,
    definitions: Arc<Definitions>,
    resources: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Dispatcher {
    pub(crate) fn new(
        routes: HashMap<String, HashMap<String, CompiledOperation>>,
        definitions: Arc<Definitions>,
        resources: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            routes,
            definitions,
            resources,
        }
    }

    /// The Definitions document built alongside the routing table.
    #[must_use]
    pub fn definitions(&self) -> &Definitions {
        &self.definitions
    }

    /// Every `(service, operation)` pair that [`Dispatcher::call`] can reach.
    pub fn route_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().flat_map(|(service, ops)| {
            ops.keys()
                .map(move |operation| (service.as_str(), operation.as_str()))
        })
    }

    /// Runs `operation` on `service` with the raw JSON `input` and returns
    /// the JSON-encoded result.
    pub async fn call(
        &self,
        ctx: CallContext,
        service: &str,
        operation: &str,
        input: Bytes,
    ) -> Result<Vec<u8>, CallError> {
        let ops = self
            .routes
            .get(service)
            .ok_or_else(|| CallError::ServiceNotFound {
                service: service.to_string(),
            })?;
        let op = ops
            .get(operation)
            .ok_or_else(|| CallError::OperationNotFound {
                service: service.to_string(),
                operation: operation.to_string(),
            })?;

        trace!(service, operation, bytes = input.len(), "dispatching call");
        let started = Instant::now();
        let result = (op.handler)(ctx, input).await;
        let elapsed = started.elapsed();

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            CALLS_METRIC,
            "service" => service.to_string(),
            "operation" => operation.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
        metrics::histogram!(
            DURATION_METRIC,
            "service" => service.to_string(),
            "operation" => operation.to_string(),
        )
        .record(elapsed.as_secs_f64());

        result.map_err(|err| {
            debug!(service, operation, error = %err, "operation call failed");
            CallError::from_handler(service, operation, err)
        })
    }

    /// Looks up the loader registered for resource type `R`.
    #[must_use]
    pub fn resource_loader<R: Send + 'static>(&self) -> Option<Arc<dyn ResourceLoader<R>>> {
        self.resources
            .get(&TypeId::of::<R>())
            .and_then(downcast_loader::<R>)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("services", &self.routes.len())
            .field("resources", &self.resources.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
