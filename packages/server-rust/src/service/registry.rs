use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ops_core::servicedef::{self, Definitions, RootSchema, RoutingRule};
use tracing::warn;

use super::descriptor::{BoundOperation, ServiceDescriptor};
use super::dispatcher::{CompiledOperation, Dispatcher};
use super::metadata::ServiceMetadata;
use super::resource::{Resource, ResourceSchema};

// ---------------------------------------------------------------------------
// BuildError
// ---------------------------------------------------------------------------

/// Reasons a [`Registry`] cannot be compiled into a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("service with ID {id:?} already exists")]
    DuplicateService { id: String },

    #[error("operation {operation:?} is bound twice on service {service:?}")]
    DuplicateOperation { service: String, operation: String },

    #[error("invalid service ID {id:?}: must be non-empty and must not contain '/'")]
    InvalidServiceId { id: String },

    #[error(
        "invalid operation ID {operation:?} on service {service:?}: must be non-empty and must not contain '/'"
    )]
    InvalidOperationId { service: String, operation: String },

    #[error("resource {type_name} is registered twice")]
    DuplicateResource { type_name: &'static str },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct PendingService {
    id: String,
    metadata: Option<ServiceMetadata>,
    operations: Vec<BoundOperation>,
}

/// Collects service descriptors and resources until [`Registry::build`]
/// compiles them into an immutable [`Dispatcher`].
///
/// Services are compiled in registration order, which is also the order they
/// appear in the Definitions document.
#[derive(Default)]
pub struct Registry {
    services: Vec<PendingService>,
    resources: Vec<Box<dyn Resource>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service. Validation is deferred to [`Registry::build`].
    pub fn register<S: Send + Sync + 'static>(&mut self, descriptor: ServiceDescriptor<S>) -> &mut Self {
        let (id, metadata, operations) = descriptor.into_parts();
        self.services.push(PendingService {
            id,
            metadata,
            operations,
        });
        self
    }

    /// Records a resource loader, looked up later with
    /// [`Dispatcher::resource_loader`].
    pub fn register_resource<R: Send + 'static>(&mut self, resource: ResourceSchema<R>) -> &mut Self {
        self.resources.push(Box::new(resource));
        self
    }

    /// Returns the number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns `true` if no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Validates every registration and produces the routing table together
    /// with its Definitions document. Any error aborts the whole build.
    pub fn build(self) -> Result<Dispatcher, BuildError> {
        let mut routes: HashMap<String, HashMap<String, CompiledOperation>> = HashMap::new();
        let mut definitions = Definitions::default();

        for pending in self.services {
            let PendingService {
                id,
                metadata,
                operations,
            } = pending;

            if !valid_segment(&id) {
                return Err(BuildError::InvalidServiceId { id });
            }
            if routes.contains_key(&id) {
                return Err(BuildError::DuplicateService { id });
            }

            let metadata = metadata.unwrap_or_default();
            let mut table = HashMap::with_capacity(operations.len());
            let mut service_def = servicedef::Service {
                cli_name: servicedef::cli_name(&id),
                name: if metadata.display_name.is_empty() {
                    id.clone()
                } else {
                    metadata.display_name.clone()
                },
                description: metadata.description.clone(),
                id: id.clone(),
                operations: Vec::with_capacity(operations.len()),
            };

            for op in operations {
                if !valid_segment(&op.id) {
                    return Err(BuildError::InvalidOperationId {
                        service: id,
                        operation: op.id,
                    });
                }
                if table.contains_key(&op.id) {
                    return Err(BuildError::DuplicateOperation {
                        service: id,
                        operation: op.id,
                    });
                }

                let description = metadata
                    .operations
                    .get(&op.id)
                    .map(|m| m.description.clone())
                    .unwrap_or_default();

                service_def.operations.push(servicedef::Operation {
                    id: op.id.clone(),
                    name: op.id.clone(),
                    cli_name: servicedef::cli_name(&op.id),
                    description,
                    routing_rule: RoutingRule::http_post(&id, &op.id),
                    request_body: op.input_schema.map(|schema| RootSchema { schema }),
                    response_body: [("200".to_string(), op.output_schema)].into(),
                });
                table.insert(op.id, CompiledOperation { handler: op.handler });
            }

            for described in metadata.operations.keys() {
                if !table.contains_key(described) {
                    warn!(
                        service = %id,
                        operation = %described,
                        "metadata describes an operation that is not bound; ignoring"
                    );
                }
            }

            definitions.services.push(service_def);
            routes.insert(id, table);
        }

        let mut seen = HashSet::new();
        let mut resources = HashMap::with_capacity(self.resources.len());
        for resource in self.resources {
            let type_id: TypeId = resource.resource_type();
            if !seen.insert(type_id) {
                return Err(BuildError::DuplicateResource {
                    type_name: resource.resource_type_name(),
                });
            }
            resources.insert(type_id, resource.erased_loader());
        }

        Ok(Dispatcher::new(routes, Arc::new(definitions), resources))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field(
                "services",
                &self.services.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            )
            .field("resources", &self.resources.len())
            .finish()
    }
}

/// An ID is usable as one segment of `/<service>/<operation>`.
fn valid_segment(id: &str) -> bool {
    !id.is_empty() && !id.contains('/')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
