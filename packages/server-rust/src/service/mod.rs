//! Typed service registration and dispatch.
//!
//! 1. **Describe** (`descriptor`): bind handler functions to a shared service object
//! 2. **Register** (`registry`): collect descriptors and resource loaders
//! 3. **Build**: validate IDs and compile the routing table plus Definitions
//! 4. **Dispatch** (`dispatcher`): route `(service, operation, input)` to a handler

pub mod context;
pub mod descriptor;
pub mod dispatcher;
pub mod handler;
pub mod metadata;
pub mod registry;
pub mod resource;

pub use context::CallContext;
pub use descriptor::ServiceDescriptor;
pub use dispatcher::{CallError, Dispatcher};
pub use handler::{HandlerError, OperationHandler};
pub use metadata::{OperationMetadata, ServiceMetadata};
pub use registry::{BuildError, Registry};
pub use resource::{new_resource, ResourceLoader, ResourceSchema};
