//! `ops` server: typed service registration, operation dispatch over an HTTP
//! surface, and the dial-out tunnel that keeps it reachable through a relay.

pub mod network;
pub mod service;
pub mod start;
pub mod tunnel;

pub use service::{
    new_resource, BuildError, CallContext, CallError, Dispatcher, OperationMetadata,
    Registry, ServiceDescriptor, ServiceMetadata,
};
pub use start::{StartError, StartOptions};
pub use tunnel::{Tunnel, TunnelConfig, TunnelError};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
