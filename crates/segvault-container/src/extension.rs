//! Pluggable container extensions.
//!
//! An extension adds a capability to a container without the container
//! knowing its concrete type: extra per-segment writer processors, extra
//! cleanup on segment removal. The set is fixed at construction into an
//! immutable `TypeId`-keyed map; lookup is by concrete type and returns an
//! `Option`, never a fallible cast.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use segvault_core::Result;

use crate::container::SegmentContainer;
use crate::writer::WriterSegmentProcessor;

/// One pluggable capability of a container.
///
/// Implementations must also provide `as_any` so the registry can hand back
/// the concrete type; the usual body is `self`.
#[async_trait]
pub trait ContainerExtension: Send + Sync + 'static {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Called once during container start, after the log is online. A
    /// failure here is fatal to the container.
    async fn initialize(&self) -> Result<()>;

    /// Writer processors this extension contributes for the given segment.
    /// Called whenever the storage writer flushes the segment; returning an
    /// empty vec opts out.
    fn processors(&self, segment_id: u64) -> Vec<Arc<dyn WriterSegmentProcessor>>;

    /// Fired exactly once per removed segment (deleted or evicted), after
    /// physical cleanup.
    async fn notify_segment_removed(&self, segment_id: u64, segment_name: &str);

    /// Synchronous teardown during container close.
    fn close(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Factory invoked once while the container is being constructed. The `Weak`
/// reference becomes upgradable as soon as construction finishes, which is
/// before `start` and therefore before any extension method is called.
pub type CreateExtensions =
    Box<dyn FnOnce(Weak<SegmentContainer>) -> Vec<Arc<dyn ContainerExtension>> + Send>;

/// Factory producing no extensions.
pub fn no_extensions() -> CreateExtensions {
    Box::new(|_| Vec::new())
}

/// Immutable capability-tag → instance map, built once at container
/// construction.
pub struct ExtensionRegistry {
    by_tag: HashMap<TypeId, Arc<dyn ContainerExtension>>,
}

impl ExtensionRegistry {
    pub fn new(extensions: Vec<Arc<dyn ContainerExtension>>) -> Self {
        let by_tag = extensions
            .into_iter()
            // Deref first: `type_id` on the `Arc` itself would tag every
            // extension as `Arc<dyn Any>` instead of its concrete type.
            .map(|ext| ((*ext.clone().as_any()).type_id(), ext))
            .collect();
        Self { by_tag }
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// The extension of concrete type `T`, if one was registered.
    pub fn get<T: ContainerExtension>(&self) -> Option<Arc<T>> {
        self.by_tag
            .get(&TypeId::of::<T>())
            .and_then(|ext| ext.clone().as_any().downcast::<T>().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ContainerExtension>> {
        self.by_tag.values()
    }

    /// Writer processors contributed by every extension for one segment.
    pub fn processors(&self, segment_id: u64) -> Vec<Arc<dyn WriterSegmentProcessor>> {
        self.by_tag
            .values()
            .flat_map(|ext| ext.processors(segment_id))
            .collect()
    }
}
