//! Segment name resolution: binds names to live metadata entries on demand.
//!
//! The fast path is a metadata lookup. On a miss the mapper consults the
//! durable tier: the storage object supplies the byte baseline, the state
//! document supplies the id history, start offset, and attribute snapshot,
//! and the binding is registered through the log under a freshly assigned id
//! (ids are never reused, so a segment evicted and touched again comes back
//! under a new id).
//!
//! Concurrent resolutions of the same name are deduplicated through a shared
//! pending future: the first caller does the work, everyone else awaits the
//! same outcome. When the active-segment budget is exhausted the mapper
//! forces a cleaner sweep before giving up with `TooManySegments`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use segvault_core::{
    AttributeId, AttributeUpdate, Error, Result, SegmentProperties, SegmentSnapshot, TimeoutTimer,
    ATTR_CREATION_TIME, NULL_ATTRIBUTE_VALUE,
};
use segvault_storage::{SegmentState, SegmentStateStore, SharedStorage};
use segvault_wal::OperationLog;

use crate::container::SegmentContainer;
use crate::metadata::{now_ms, ContainerMetadata, SegmentMetadata};

type PendingResolution = Shared<BoxFuture<'static, Result<u64>>>;

struct MapperInner {
    container_id: u32,
    metadata: Arc<ContainerMetadata>,
    log: Arc<dyn OperationLog>,
    storage: SharedStorage,
    state_store: Arc<SegmentStateStore>,
    container: Weak<SegmentContainer>,
    pending: Mutex<HashMap<String, PendingResolution>>,
}

pub struct SegmentMapper {
    inner: Arc<MapperInner>,
}

impl SegmentMapper {
    pub fn new(
        container_id: u32,
        metadata: Arc<ContainerMetadata>,
        log: Arc<dyn OperationLog>,
        storage: SharedStorage,
        state_store: Arc<SegmentStateStore>,
        container: Weak<SegmentContainer>,
    ) -> Self {
        Self {
            inner: Arc::new(MapperInner {
                container_id,
                metadata,
                log,
                storage,
                state_store,
                container,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolves `name` to its live metadata entry, establishing the mapping
    /// from the durable tier if needed.
    pub async fn get_or_assign(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Arc<SegmentMetadata>> {
        if let Some(meta) = self.inner.metadata.get_by_name(name) {
            meta.touch();
            return Ok(meta);
        }
        let timer = TimeoutTimer::new(timeout);
        let resolution = self.pending_resolution(name, timeout);
        let segment_id = timer.run(resolution).await?;
        // The entry can only be gone again if it was evicted or deleted in
        // the window since registration.
        self.inner
            .metadata
            .get_by_id(segment_id)
            .filter(|meta| !meta.is_deleted() && !meta.is_merged())
            .map(|meta| {
                meta.touch();
                meta
            })
            .ok_or_else(|| Error::SegmentNotFound(name.to_string()))
    }

    /// Joins the in-flight resolution for `name`, starting one if nobody is
    /// resolving it yet.
    fn pending_resolution(&self, name: &str, timeout: Duration) -> PendingResolution {
        let mut pending = lock(&self.inner.pending);
        if let Some(existing) = pending.get(name) {
            return existing.clone();
        }
        let fut = MapperInner::assign(Arc::clone(&self.inner), name.to_string(), timeout)
            .boxed()
            .shared();
        pending.insert(name.to_string(), fut.clone());
        fut
    }

    /// Creates a new segment: the storage object is the atomic claim, then a
    /// state document and a metadata binding follow.
    pub async fn create(
        &self,
        name: &str,
        attribute_updates: &[AttributeUpdate],
        timeout: Duration,
    ) -> Result<()> {
        let timer = TimeoutTimer::new(timeout);
        if self.inner.metadata.get_by_name(name).is_some() {
            return Err(Error::SegmentExists(name.to_string()));
        }
        let attributes = creation_attributes(attribute_updates)?;
        self.inner.ensure_capacity().await?;
        timer.run(self.inner.storage.create(name)).await?;

        let segment_id = self.inner.metadata.next_segment_id();
        let mut state = SegmentState::new(segment_id, name);
        state.attributes = attributes.clone();
        self.inner
            .state_store
            .put(name, &state, timer.remaining())
            .await?;

        let snapshot = SegmentSnapshot {
            segment_id,
            name: name.to_string(),
            start_offset: 0,
            length: 0,
            sealed: false,
            attributes,
        };
        self.inner
            .log
            .register_segment(snapshot, timer.remaining())
            .await?;
        debug!(
            container_id = self.inner.container_id,
            segment_id,
            segment = %name,
            "Created segment"
        );
        Ok(())
    }

    /// Properties of a segment that exists durably but is not mapped, built
    /// from the storage object and the state document without establishing a
    /// mapping.
    pub async fn unmapped_info(&self, name: &str, timeout: Duration) -> Result<SegmentProperties> {
        let timer = TimeoutTimer::new(timeout);
        let info = timer.run(self.inner.storage.get_info(name)).await?;
        let state = self
            .inner
            .state_store
            .get(name, timer.remaining())
            .await?;
        let (segment_id, start_offset, attributes) = match state {
            Some(state) => (
                state.segment_id,
                state.start_offset,
                state
                    .attributes
                    .into_iter()
                    .filter(|(_, v)| *v != NULL_ATTRIBUTE_VALUE)
                    .collect(),
            ),
            None => (0, 0, HashMap::new()),
        };
        Ok(SegmentProperties {
            name: name.to_string(),
            segment_id,
            start_offset,
            length: info.length,
            sealed: info.sealed,
            deleted: false,
            merged: false,
            last_modified_ms: 0,
            attributes,
        })
    }
}

impl MapperInner {
    /// The slow path, run at most once per name at a time.
    async fn assign(inner: Arc<MapperInner>, name: String, timeout: Duration) -> Result<u64> {
        let result = Self::assign_inner(&inner, &name, timeout).await;
        lock(&inner.pending).remove(&name);
        result
    }

    async fn assign_inner(inner: &MapperInner, name: &str, timeout: Duration) -> Result<u64> {
        let timer = TimeoutTimer::new(timeout);
        // Lost the race against another resolution or a create.
        if let Some(meta) = inner.metadata.get_by_name(name) {
            return Ok(meta.id());
        }
        let info = timer.run(inner.storage.get_info(name)).await?;
        let state = inner.state_store.get(name, timer.remaining()).await?;
        let (start_offset, attributes) = match state {
            Some(state) => (state.start_offset, state.attributes),
            None => (0, Vec::new()),
        };

        inner.ensure_capacity().await?;
        let snapshot = SegmentSnapshot {
            segment_id: inner.metadata.next_segment_id(),
            name: name.to_string(),
            start_offset,
            length: info.length,
            sealed: info.sealed,
            attributes,
        };
        let segment_id = snapshot.segment_id;
        inner
            .log
            .register_segment(snapshot, timer.remaining())
            .await?;
        debug!(
            container_id = inner.container_id,
            segment_id,
            segment = %name,
            length = info.length,
            "Mapped existing segment"
        );
        Ok(segment_id)
    }

    /// Forces a cleaner sweep when the budget is exhausted; fails with
    /// `TooManySegments` if the sweep freed nothing.
    async fn ensure_capacity(&self) -> Result<()> {
        let limit = self.metadata.max_active_segment_count();
        if self.metadata.active_count() < limit {
            return Ok(());
        }
        if let Some(container) = self.container.upgrade() {
            container.evict_idle_segments().await?;
        }
        let active = self.metadata.active_count();
        if active >= limit {
            return Err(Error::TooManySegments { active, limit });
        }
        Ok(())
    }
}

/// Seeds the creation-time attribute and folds the caller's creation updates
/// on top.
fn creation_attributes(updates: &[AttributeUpdate]) -> Result<Vec<(AttributeId, i64)>> {
    let mut values: HashMap<AttributeId, i64> = HashMap::new();
    values.insert(ATTR_CREATION_TIME, now_ms());
    for update in updates {
        let value = update.apply(values.get(&update.id).copied())?;
        values.insert(update.id, value);
    }
    let mut attributes: Vec<_> = values.into_iter().collect();
    attributes.sort_by_key(|(id, _)| *id);
    Ok(attributes)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
