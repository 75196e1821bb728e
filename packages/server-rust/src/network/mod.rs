//! HTTP surface: configuration, the operations handler, middleware, and router
//! assembly.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod router;

pub use config::HttpConfig;
pub use handlers::{DispatchState, OPERATIONS_PATH};
pub use router::build_router;
