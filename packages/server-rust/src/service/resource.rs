//! Resource loaders: typed lookups a service exposes next to its operations.

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;

use super::context::CallContext;

/// Loads a resource of type `R` by identifier.
///
/// `Ok(None)` means the identifier is well formed but nothing exists for it.
#[async_trait]
pub trait ResourceLoader<R: Send>: Send + Sync {
    async fn load(&self, ctx: &CallContext, id: &str) -> anyhow::Result<Option<R>>;
}

/// A loader paired with the resource type it produces.
pub struct ResourceSchema<R> {
    loader: Arc<dyn ResourceLoader<R>>,
}

impl<R> Clone for ResourceSchema<R> {
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<R> std::fmt::Debug for ResourceSchema<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSchema")
            .field("resource", &std::any::type_name::<R>())
            .finish_non_exhaustive()
    }
}

impl<R: Send + 'static> ResourceSchema<R> {
    /// Returns the registered loader.
    #[must_use]
    pub fn loader(&self) -> Arc<dyn ResourceLoader<R>> {
        Arc::clone(&self.loader)
    }
}

/// Declares a resource whose values are produced by `loader`.
pub fn new_resource<R, L>(loader: L) -> ResourceSchema<R>
where
    R: Send + 'static,
    L: ResourceLoader<R> + 'static,
{
    ResourceSchema {
        loader: Arc::new(loader),
    }
}

/// Object-safe view of a [`ResourceSchema`] so the registry can hold many
/// resource types in one list.
pub(crate) trait Resource: Send + Sync {
    fn resource_type(&self) -> TypeId;
    fn resource_type_name(&self) -> &'static str;
    /// The loader boxed as `Arc<dyn ResourceLoader<R>>` inside an `Any`.
    fn erased_loader(&self) -> Arc<dyn Any + Send + Sync>;
}

impl<R: Send + 'static> Resource for ResourceSchema<R> {
    fn resource_type(&self) -> TypeId {
        TypeId::of::<R>()
    }

    fn resource_type_name(&self) -> &'static str {
        std::any::type_name::<R>()
    }

    fn erased_loader(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::new(Arc::clone(&self.loader))
    }
}

/// Recovers the typed loader stored by [`Resource::erased_loader`].
pub(crate) fn downcast_loader<R: Send + 'static>(
    erased: &Arc<dyn Any + Send + Sync>,
) -> Option<Arc<dyn ResourceLoader<R>>> {
    erased
        .downcast_ref::<Arc<dyn ResourceLoader<R>>>()
        .map(Arc::clone)
}
