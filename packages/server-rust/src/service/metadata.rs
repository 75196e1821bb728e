use std::collections::HashMap;

/// Optional descriptive metadata for a service.
///
/// When attached to a `ServiceDescriptor`, `id` replaces the default ID
/// derived from the service's type name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMetadata {
    pub id: String,
    pub display_name: String,
    pub description: String,
    /// Per-operation metadata keyed by operation ID.
    pub operations: HashMap<String, OperationMetadata>,
}

impl ServiceMetadata {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attaches a description to the operation named `operation`.
    #[must_use]
    pub fn operation(mut self, operation: impl Into<String>, description: impl Into<String>) -> Self {
        self.operations.insert(
            operation.into(),
            OperationMetadata {
                description: description.into(),
            },
        );
        self
    }
}

/// Optional descriptive metadata for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationMetadata {
    pub description: String,
}
