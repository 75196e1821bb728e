//! Handler shapes accepted as operations.
//!
//! An operation handler is an async function whose first two arguments are
//! the shared service object and a [`CallContext`]. It may take one further
//! argument, the decoded JSON input, and must resolve to `Result<O, E>`:
//!
//! ```
//! use std::sync::Arc;
//! use ops_server::service::{CallContext, ServiceDescriptor};
//!
//! struct Greeter;
//!
//! async fn greet(_svc: Arc<Greeter>, _ctx: CallContext, name: String) -> anyhow::Result<String> {
//!     Ok(format!("hello {name}"))
//! }
//!
//! async fn health(_svc: Arc<Greeter>, _ctx: CallContext) -> anyhow::Result<bool> {
//!     Ok(true)
//! }
//!
//! let _ = ServiceDescriptor::new(Greeter)
//!     .operation("Greet", greet)
//!     .operation("Health", health);
//! ```
//!
//! The shapes are expressed as two impls of [`OperationHandler`] that differ
//! only in the marker type parameter, so a function without a leading context
//! or with more than one input simply does not implement the trait. A
//! handler without a context is rejected when the descriptor is built:
//!
//! ```compile_fail
//! use std::sync::Arc;
//! use ops_server::service::ServiceDescriptor;
//!
//! struct Greeter;
//!
//! async fn greet(_svc: Arc<Greeter>, name: String) -> anyhow::Result<String> {
//!     Ok(name)
//! }
//!
//! let _ = ServiceDescriptor::new(Greeter).operation("Greet", greet);
//! ```
//!
//! So is one that takes the service by value instead of through the shared
//! `Arc`:
//!
//! ```compile_fail
//! use ops_server::service::{CallContext, ServiceDescriptor};
//!
//! struct Greeter;
//!
//! async fn health(_svc: Greeter, _ctx: CallContext) -> anyhow::Result<bool> {
//!     Ok(true)
//! }
//!
//! let _ = ServiceDescriptor::new(Greeter).operation("Health", health);
//! ```
//!
//! And one with two inputs:
//!
//! ```compile_fail
//! use std::sync::Arc;
//! use ops_server::service::{CallContext, ServiceDescriptor};
//!
//! struct Greeter;
//!
//! async fn greet(
//!     _svc: Arc<Greeter>,
//!     _ctx: CallContext,
//!     first: String,
//!     last: String,
//! ) -> anyhow::Result<String> {
//!     Ok(format!("{first} {last}"))
//! }
//!
//! let _ = ServiceDescriptor::new(Greeter).operation("Greet", greet);
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use ops_core::servicedef::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use utoipa::PartialSchema;

use super::context::CallContext;

/// Failure inside a bound operation, before the dispatcher attaches the
/// service and operation names.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("error unmarshalling input: {0}")]
    InvalidInput(#[source] serde_json::Error),
    #[error("{0:#}")]
    Failed(#[source] anyhow::Error),
    #[error("error marshalling output: {0}")]
    EncodeOutput(#[source] serde_json::Error),
}

/// A function that can be bound as an operation of service `S`.
///
/// `T` is a marker that keeps the two accepted shapes from overlapping:
/// `()` for context-only handlers and `(I,)` for handlers taking input `I`.
pub trait OperationHandler<S, T>: Clone + Send + Sync + Sized + 'static {
    /// Schema of the request body, or `None` for context-only handlers.
    fn input_schema() -> Option<JsonSchema>;

    /// Schema of the successful result.
    fn output_schema() -> JsonSchema;

    /// Decodes `input` (when the shape takes one), runs the handler and
    /// encodes its result as JSON.
    fn invoke(
        &self,
        service: Arc<S>,
        ctx: CallContext,
        input: Bytes,
    ) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>>;
}

impl<S, F, Fut, O, E> OperationHandler<S, ()> for F
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, CallContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    O: Serialize + PartialSchema + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    fn input_schema() -> Option<JsonSchema> {
        None
    }

    fn output_schema() -> JsonSchema {
        O::schema()
    }

    fn invoke(
        &self,
        service: Arc<S>,
        ctx: CallContext,
        _input: Bytes,
    ) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        let fut = self(service, ctx);
        Box::pin(async move { encode_output(fut.await) })
    }
}

impl<S, F, Fut, I, O, E> OperationHandler<S, (I,)> for F
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, CallContext, I) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    I: DeserializeOwned + PartialSchema + Send + 'static,
    O: Serialize + PartialSchema + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    fn input_schema() -> Option<JsonSchema> {
        Some(I::schema())
    }

    fn output_schema() -> JsonSchema {
        O::schema()
    }

    fn invoke(
        &self,
        service: Arc<S>,
        ctx: CallContext,
        input: Bytes,
    ) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        let input: I = match serde_json::from_slice(&input) {
            Ok(value) => value,
            Err(err) => return Box::pin(std::future::ready(Err(HandlerError::InvalidInput(err)))),
        };
        let fut = self(service, ctx, input);
        Box::pin(async move { encode_output(fut.await) })
    }
}

fn encode_output<O, E>(result: Result<O, E>) -> Result<Vec<u8>, HandlerError>
where
    O: Serialize,
    E: Into<anyhow::Error>,
{
    let output = result.map_err(|err| HandlerError::Failed(err.into()))?;
    serde_json::to_vec(&output).map_err(HandlerError::EncodeOutput)
}

// ---------------------------------------------------------------------------
// Type-erased form
// ---------------------------------------------------------------------------

/// A bound operation with its service object captured.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(CallContext, Bytes) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> + Send + Sync>;

pub(crate) fn erase<S, T, H>(service: Arc<S>, handler: H) -> ErasedHandler
where
    S: Send + Sync + 'static,
    H: OperationHandler<S, T>,
{
    Arc::new(move |ctx, input| handler.invoke(Arc::clone(&service), ctx, input))
}
