//! Binding a service object to its operations.

use std::sync::Arc;

use ops_core::servicedef::JsonSchema;

use super::handler::{erase, ErasedHandler, OperationHandler};
use super::metadata::ServiceMetadata;

/// One operation bound on a descriptor, already type-erased.
pub(crate) struct BoundOperation {
    pub(crate) id: String,
    pub(crate) input_schema: Option<JsonSchema>,
    pub(crate) output_schema: JsonSchema,
    pub(crate) handler: ErasedHandler,
}

/// A service object plus the operations exposed on it.
///
/// The object is held behind an `Arc` and shared by every operation, so all
/// calls observe the same instance.
///
/// ```ignore
/// let descriptor = ServiceDescriptor::new(Greeter::default())
///     .metadata(ServiceMetadata::new("greeter").description("Says hello"))
///     .operation("Greet", Greeter::greet)
///     .operation("Health", Greeter::health);
/// registry.register(descriptor);
/// ```
pub struct ServiceDescriptor<S> {
    service: Arc<S>,
    metadata: Option<ServiceMetadata>,
    pub(crate) operations: Vec<BoundOperation>,
}

impl<S: Send + Sync + 'static> ServiceDescriptor<S> {
    #[must_use]
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    /// Uses an object that is already shared elsewhere.
    #[must_use]
    pub fn from_arc(service: Arc<S>) -> Self {
        Self {
            service,
            metadata: None,
            operations: Vec::new(),
        }
    }

    /// Attaches display metadata. The metadata ID, when non-empty, replaces
    /// the type-derived service ID.
    #[must_use]
    pub fn metadata(mut self, metadata: ServiceMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Binds `handler` as operation `id`.
    #[must_use]
    pub fn operation<T, H>(mut self, id: impl Into<String>, handler: H) -> Self
    where
        H: OperationHandler<S, T>,
    {
        self.operations.push(BoundOperation {
            id: id.into(),
            input_schema: H::input_schema(),
            output_schema: H::output_schema(),
            handler: erase(Arc::clone(&self.service), handler),
        });
        self
    }

    /// The service ID this descriptor registers under.
    #[must_use]
    pub fn id(&self) -> String {
        match &self.metadata {
            Some(meta) if !meta.id.is_empty() => meta.id.clone(),
            _ => default_service_id(std::any::type_name::<S>()),
        }
    }

    pub(crate) fn into_parts(self) -> (String, Option<ServiceMetadata>, Vec<BoundOperation>) {
        let id = self.id();
        (id, self.metadata, self.operations)
    }
}

impl<S> std::fmt::Debug for ServiceDescriptor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("type", &std::any::type_name::<S>())
            .field("metadata", &self.metadata)
            .field(
                "operations",
                &self.operations.iter().map(|op| op.id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Last path segment of a type name, without generic arguments.
fn default_service_id(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::context::CallContext;

    struct Example;
    #[allow(dead_code)]
    struct Wrapper<T>(T);

    async fn noop(_svc: Arc<Example>, _ctx: CallContext) -> anyhow::Result<bool> {
        Ok(true)
    }

    #[test]
    fn default_id_strips_module_path_and_generics() {
        assert_eq!(default_service_id("crate::a::Example"), "Example");
        assert_eq!(default_service_id("Example"), "Example");
        assert_eq!(
            default_service_id(std::any::type_name::<Wrapper<Example>>()),
            "Wrapper"
        );
    }

    #[test]
    fn metadata_id_overrides_type_name() {
        let descriptor = ServiceDescriptor::new(Example);
        assert_eq!(descriptor.id(), "Example");

        let descriptor = descriptor.metadata(ServiceMetadata::new("example"));
        assert_eq!(descriptor.id(), "example");

        let descriptor = ServiceDescriptor::new(Example).metadata(ServiceMetadata::new(""));
        assert_eq!(descriptor.id(), "Example");
    }

    #[test]
    fn operations_keep_binding_order() {
        let descriptor = ServiceDescriptor::new(Example)
            .operation("B", noop)
            .operation("A", noop);
        let ids: Vec<_> = descriptor.operations.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, ["B", "A"]);
        assert!(descriptor.operations[0].input_schema.is_none());
    }
}
