//! Container metadata: the single source of truth for segment state.
//!
//! Two maps guarded by one `RwLock`: name→id and id→`Arc<SegmentMetadata>`.
//! Entries use atomics for the hot scalar fields, so snapshotting a segment
//! or checking its length never takes the map lock for long. Structural
//! writes (map, unmap, merge) are rare and come from exactly one place: the
//! durable log's applier task, which calls the [`OperationApplier`] methods
//! implemented here in total log order.
//!
//! The applier also feeds the read index inline: a committed append is
//! cached before its caller is acked, a committed merge becomes readable
//! through the index's redirect machinery, a committed truncate evicts
//! cached prefixes. Keeping that wiring here means replaying the journal
//! rebuilds the read index for free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use segvault_core::{
    AttributeId, AttributeUpdate, AttributeUpdateType, Error, Operation, Result,
    SegmentProperties, SegmentSnapshot, NULL_ATTRIBUTE_VALUE,
};
use segvault_storage::ContainerReadIndex;
use segvault_wal::OperationApplier;

use crate::metrics;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Whether this update's outcome depends on the attribute's previous value.
/// `Replace` never looks at it, and `SetIfAbsent` is the cache write-back
/// vehicle: it must be applicable to attributes that were never loaded.
fn reads_previous_value(update: &AttributeUpdate) -> bool {
    !matches!(
        update.update_type,
        AttributeUpdateType::Replace | AttributeUpdateType::SetIfAbsent
    )
}

// ============================================================================
// SegmentMetadata
// ============================================================================

/// Live metadata for one mapped segment. Scalar fields are atomics; only the
/// log applier mutates them, so readers see each operation's effects either
/// fully or not at all in practice, and the attribute map has its own lock.
pub struct SegmentMetadata {
    segment_id: u64,
    name: String,
    start_offset: AtomicU64,
    length: AtomicU64,
    /// Bytes known durable in tiered storage; maintained by the writer.
    storage_length: AtomicU64,
    sealed: AtomicBool,
    deleted: AtomicBool,
    merged: AtomicBool,
    /// Set by the writer once the merged source's bytes are physically in
    /// the target. Gate for sweeping the leftover entry.
    merge_flushed: AtomicBool,
    last_modified_ms: AtomicI64,
    last_used_ms: AtomicI64,
    attributes: RwLock<HashMap<AttributeId, i64>>,
}

impl SegmentMetadata {
    fn from_snapshot(snapshot: &SegmentSnapshot) -> Self {
        let now = now_ms();
        Self {
            segment_id: snapshot.segment_id,
            name: snapshot.name.clone(),
            start_offset: AtomicU64::new(snapshot.start_offset),
            length: AtomicU64::new(snapshot.length),
            storage_length: AtomicU64::new(snapshot.length),
            sealed: AtomicBool::new(snapshot.sealed),
            deleted: AtomicBool::new(false),
            merged: AtomicBool::new(false),
            merge_flushed: AtomicBool::new(false),
            last_modified_ms: AtomicI64::new(now),
            last_used_ms: AtomicI64::new(now),
            attributes: RwLock::new(snapshot.attributes.iter().copied().collect()),
        }
    }

    pub fn id(&self) -> u64 {
        self.segment_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset.load(Ordering::Acquire)
    }

    pub fn storage_length(&self) -> u64 {
        self.storage_length.load(Ordering::Acquire)
    }

    /// Called by the writer after a successful flush.
    pub fn set_storage_length(&self, length: u64) {
        self.storage_length.fetch_max(length, Ordering::AcqRel);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn is_merged(&self) -> bool {
        self.merged.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    fn mark_merged(&self) {
        self.merged.store(true, Ordering::Release);
    }

    pub fn is_merge_flushed(&self) -> bool {
        self.merge_flushed.load(Ordering::Acquire)
    }

    /// Called by the writer once the physical concat is done (or found to be
    /// already done).
    pub fn mark_merge_flushed(&self) {
        self.merge_flushed.store(true, Ordering::Release);
    }

    /// Records a use for eviction accounting.
    pub fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Release);
    }

    pub fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::Acquire)
    }

    fn touch_modified(&self) {
        let now = now_ms();
        self.last_modified_ms.store(now, Ordering::Release);
        self.last_used_ms.store(now, Ordering::Release);
    }

    fn read_attributes(&self) -> RwLockReadGuard<'_, HashMap<AttributeId, i64>> {
        self.attributes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_attributes(&self) -> RwLockWriteGuard<'_, HashMap<AttributeId, i64>> {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The resident value for one attribute, sentinel included.
    pub fn attribute(&self, id: AttributeId) -> Option<i64> {
        self.read_attributes().get(&id).copied()
    }

    /// Splits `ids` into resident values (sentinels count as resident) and
    /// ids that would need an attribute index lookup.
    pub fn partition_attributes(
        &self,
        ids: &[AttributeId],
    ) -> (HashMap<AttributeId, i64>, Vec<AttributeId>) {
        let attributes = self.read_attributes();
        let mut resident = HashMap::new();
        let mut missing = Vec::new();
        for id in ids {
            match attributes.get(id) {
                Some(value) => {
                    resident.insert(*id, *value);
                }
                None => missing.push(*id),
            }
        }
        (resident, missing)
    }

    /// Resident values for the given ids, sentinels included. Used by the
    /// writer to persist post-application values into the attribute index.
    pub fn attribute_values(&self, ids: &[AttributeId]) -> Vec<(AttributeId, i64)> {
        let attributes = self.read_attributes();
        ids.iter()
            .filter_map(|id| attributes.get(id).map(|v| (*id, *v)))
            .collect()
    }

    /// A point-in-time snapshot for external consumption. Sentinel-cached
    /// attributes are filtered out: to a caller, "confirmed absent" and
    /// "absent" look the same.
    pub fn properties(&self) -> SegmentProperties {
        let attributes = self
            .read_attributes()
            .iter()
            .filter(|(_, v)| **v != NULL_ATTRIBUTE_VALUE)
            .map(|(k, v)| (*k, *v))
            .collect();
        SegmentProperties {
            name: self.name.clone(),
            segment_id: self.segment_id,
            start_offset: self.start_offset(),
            length: self.length(),
            sealed: self.is_sealed(),
            deleted: self.is_deleted(),
            merged: self.is_merged(),
            last_modified_ms: self.last_modified_ms.load(Ordering::Acquire),
            attributes,
        }
    }

    /// The durable baseline of this segment: what a re-mapping (or a state
    /// document) needs to rebuild the entry. Sentinels are cache artifacts
    /// and are not part of it.
    pub fn snapshot(&self) -> SegmentSnapshot {
        let mut attributes: Vec<_> = self
            .read_attributes()
            .iter()
            .filter(|(_, v)| **v != NULL_ATTRIBUTE_VALUE)
            .map(|(k, v)| (*k, *v))
            .collect();
        attributes.sort_by_key(|(id, _)| *id);
        SegmentSnapshot {
            segment_id: self.segment_id,
            name: self.name.clone(),
            start_offset: self.start_offset(),
            length: self.length(),
            sealed: self.is_sealed(),
            attributes,
        }
    }

    /// Validates the operation's attribute updates against the resident
    /// values and returns the staged results, without mutating anything.
    ///
    /// A resident sentinel means "confirmed absent" and is presented to the
    /// update as no value. An extended attribute with no resident value at
    /// all is unknown: any update that reads the previous value fails with
    /// the missing-precondition flag, which tells the caller to load the
    /// attribute into the cache and resubmit.
    fn stage_attributes(&self, operation: &Operation) -> Result<Vec<(AttributeId, i64)>> {
        let updates = operation.attribute_updates();
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let attributes = self.read_attributes();
        let mut staged = Vec::with_capacity(updates.len());
        let mut pending: HashMap<AttributeId, i64> = HashMap::new();
        for update in updates {
            // Later updates in the same operation observe earlier ones.
            let current = pending
                .get(&update.id)
                .copied()
                .or_else(|| attributes.get(&update.id).copied());
            let current = match current {
                Some(NULL_ATTRIBUTE_VALUE) => None,
                Some(value) => Some(value),
                None if update.id.is_extended() && reads_previous_value(update) => {
                    return Err(Error::BadAttributeUpdate {
                        attribute_id: update.id,
                        previous_value_missing: true,
                        reason: "attribute value not loaded in metadata".to_string(),
                    });
                }
                None => None,
            };
            let value = update.apply(current)?;
            pending.insert(update.id, value);
            staged.push((update.id, value));
        }
        Ok(staged)
    }

    fn commit_attributes(&self, staged: Vec<(AttributeId, i64)>) {
        if staged.is_empty() {
            return;
        }
        let mut attributes = self.write_attributes();
        for (id, value) in staged {
            attributes.insert(id, value);
        }
    }
}

// ============================================================================
// ContainerMetadata
// ============================================================================

struct SegmentMaps {
    by_name: HashMap<String, u64>,
    by_id: HashMap<u64, Arc<SegmentMetadata>>,
}

/// The in-memory registry of one container's segments, and the
/// [`OperationApplier`] the durable log drives.
pub struct ContainerMetadata {
    container_id: u32,
    container_label: String,
    max_active: usize,
    epoch: AtomicU64,
    next_id: AtomicU64,
    maps: RwLock<SegmentMaps>,
    read_index: Arc<ContainerReadIndex>,
}

impl ContainerMetadata {
    pub fn new(container_id: u32, max_active: usize, read_index: Arc<ContainerReadIndex>) -> Self {
        Self {
            container_id,
            container_label: container_id.to_string(),
            max_active,
            epoch: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            maps: RwLock::new(SegmentMaps {
                by_name: HashMap::new(),
                by_id: HashMap::new(),
            }),
            read_index,
        }
    }

    pub fn container_id(&self) -> u32 {
        self.container_id
    }

    /// Container epoch; `0` until the log has recovered.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    pub fn max_active_segment_count(&self) -> usize {
        self.max_active
    }

    /// Assigns a fresh, never-reused segment id.
    pub fn next_segment_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    fn read_maps(&self) -> RwLockReadGuard<'_, SegmentMaps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_maps(&self) -> RwLockWriteGuard<'_, SegmentMaps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<SegmentMetadata>> {
        let maps = self.read_maps();
        let id = maps.by_name.get(name)?;
        maps.by_id.get(id).cloned()
    }

    pub fn get_by_id(&self, segment_id: u64) -> Option<Arc<SegmentMetadata>> {
        self.read_maps().by_id.get(&segment_id).cloned()
    }

    /// Segments with a live name mapping. Consumed merge sources and deleted
    /// segments are excluded.
    pub fn active_count(&self) -> usize {
        self.read_maps().by_name.len()
    }

    /// Snapshots of every active segment. Coarse: holds the map read lock
    /// for the whole enumeration, which is fine for an administrative query.
    pub fn active_segments(&self) -> Vec<SegmentProperties> {
        let maps = self.read_maps();
        maps.by_name
            .values()
            .filter_map(|id| maps.by_id.get(id))
            .map(|meta| meta.properties())
            .collect()
    }

    /// Segments the cleaner may evict: consumed merge sources whose bytes
    /// have physically moved into their target, and segments unused for
    /// `expiration` whose bytes are fully flushed. At most `max` candidates,
    /// least recently used first.
    pub fn eviction_candidates(
        &self,
        expiration: std::time::Duration,
        max: usize,
    ) -> Vec<Arc<SegmentMetadata>> {
        let cutoff = now_ms() - expiration.as_millis() as i64;
        let maps = self.read_maps();
        let mut candidates: Vec<_> = maps
            .by_id
            .values()
            .filter(|meta| {
                if meta.is_deleted() {
                    return false;
                }
                if meta.is_merged() {
                    return meta.is_merge_flushed();
                }
                meta.last_used_ms() <= cutoff && meta.storage_length() >= meta.length()
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|meta| meta.last_used_ms());
        candidates.truncate(max);
        candidates
    }

    fn update_active_gauge(&self, maps: &SegmentMaps) {
        metrics::CONTAINER_ACTIVE_SEGMENTS
            .with_label_values(&[&self.container_label])
            .set(maps.by_name.len() as i64);
    }

    fn segment_for_operation(
        maps: &SegmentMaps,
        segment_id: u64,
    ) -> Result<Arc<SegmentMetadata>> {
        let meta = maps
            .by_id
            .get(&segment_id)
            .ok_or_else(|| Error::SegmentNotFound(format!("segment id {segment_id}")))?;
        if meta.is_merged() {
            return Err(Error::SegmentMerged(segment_id));
        }
        if meta.is_deleted() {
            return Err(Error::SegmentNotFound(format!("segment id {segment_id}")));
        }
        Ok(Arc::clone(meta))
    }
}

impl OperationApplier for ContainerMetadata {
    fn apply_operation(&self, _sequence: u64, operation: &Operation) -> Result<u64> {
        match operation {
            Operation::Append {
                segment_id,
                expected_offset,
                data,
                ..
            } => {
                let meta = Self::segment_for_operation(&self.read_maps(), *segment_id)?;
                if meta.is_sealed() {
                    return Err(Error::SegmentSealed(*segment_id));
                }
                let offset = meta.length();
                if let Some(expected) = expected_offset {
                    if *expected != offset {
                        return Err(Error::BadOffset {
                            segment_id: *segment_id,
                            expected: *expected,
                            actual: offset,
                        });
                    }
                }
                let staged = meta.stage_attributes(operation)?;
                // Validation passed; commit everything.
                meta.commit_attributes(staged);
                meta.length
                    .store(offset + data.len() as u64, Ordering::Release);
                meta.touch_modified();
                self.read_index.append(*segment_id, offset, data.clone());
                Ok(offset)
            }
            Operation::UpdateAttributes { segment_id, .. } => {
                let meta = Self::segment_for_operation(&self.read_maps(), *segment_id)?;
                if meta.is_sealed() {
                    return Err(Error::SegmentSealed(*segment_id));
                }
                let staged = meta.stage_attributes(operation)?;
                meta.commit_attributes(staged);
                meta.touch_modified();
                Ok(meta.length())
            }
            Operation::Seal { segment_id } => {
                let meta = Self::segment_for_operation(&self.read_maps(), *segment_id)?;
                if meta.is_sealed() {
                    return Err(Error::SegmentSealed(*segment_id));
                }
                meta.sealed.store(true, Ordering::Release);
                meta.touch_modified();
                debug!(
                    container_id = self.container_id,
                    segment_id,
                    length = meta.length(),
                    "Sealed segment"
                );
                Ok(meta.length())
            }
            Operation::Truncate { segment_id, offset } => {
                let meta = Self::segment_for_operation(&self.read_maps(), *segment_id)?;
                if *offset > meta.length() {
                    return Err(Error::InvalidOperation(format!(
                        "cannot truncate segment {segment_id} at {offset}: beyond length {}",
                        meta.length()
                    )));
                }
                if *offset < meta.start_offset() {
                    return Err(Error::InvalidOperation(format!(
                        "cannot truncate segment {segment_id} at {offset}: start offset is already {}",
                        meta.start_offset()
                    )));
                }
                meta.start_offset.store(*offset, Ordering::Release);
                meta.touch_modified();
                self.read_index.truncate(*segment_id, *offset);
                Ok(*offset)
            }
            Operation::Merge {
                target_id,
                source_id,
            } => {
                if target_id == source_id {
                    return Err(Error::InvalidOperation(
                        "cannot merge a segment into itself".to_string(),
                    ));
                }
                let mut maps = self.write_maps();
                let source = Self::segment_for_operation(&maps, *source_id)?;
                let target = Self::segment_for_operation(&maps, *target_id)?;
                if !source.is_sealed() {
                    return Err(Error::InvalidOperation(format!(
                        "merge source {source_id} is not sealed"
                    )));
                }
                if target.is_sealed() {
                    return Err(Error::SegmentSealed(*target_id));
                }
                let offset = target.length();
                target
                    .length
                    .store(offset + source.length(), Ordering::Release);
                target.touch_modified();
                // The source keeps its id entry (so in-flight id-addressed
                // operations learn it was merged) but loses its name; the
                // cleaner sweeps the leftover entry out later.
                maps.by_name.remove(&source.name);
                source.mark_merged();
                source.touch_modified();
                self.update_active_gauge(&maps);
                drop(maps);
                self.read_index.begin_merge(*target_id, offset, *source_id);
                info!(
                    container_id = self.container_id,
                    target_id,
                    source_id,
                    offset,
                    merged_bytes = source.length(),
                    "Merged segment"
                );
                Ok(offset)
            }
        }
    }

    fn apply_map(&self, snapshot: &SegmentSnapshot) -> Result<()> {
        let mut maps = self.write_maps();
        if maps.by_name.contains_key(&snapshot.name) {
            return Err(Error::SegmentExists(snapshot.name.clone()));
        }
        if maps.by_id.contains_key(&snapshot.segment_id) {
            return Err(Error::InvalidOperation(format!(
                "segment id {} is already mapped",
                snapshot.segment_id
            )));
        }
        if maps.by_name.len() >= self.max_active {
            return Err(Error::TooManySegments {
                active: maps.by_name.len(),
                limit: self.max_active,
            });
        }
        let meta = Arc::new(SegmentMetadata::from_snapshot(snapshot));
        maps.by_name.insert(snapshot.name.clone(), snapshot.segment_id);
        maps.by_id.insert(snapshot.segment_id, meta);
        // Replayed mappings move the id counter past everything ever issued.
        self.next_id
            .fetch_max(snapshot.segment_id + 1, Ordering::AcqRel);
        self.update_active_gauge(&maps);
        drop(maps);
        self.read_index.register(snapshot);
        debug!(
            container_id = self.container_id,
            segment_id = snapshot.segment_id,
            segment = %snapshot.name,
            length = snapshot.length,
            "Mapped segment"
        );
        Ok(())
    }

    fn apply_unmap(&self, segment_id: u64, deleted: bool) -> Result<SegmentSnapshot> {
        let mut maps = self.write_maps();
        let meta = maps
            .by_id
            .remove(&segment_id)
            .ok_or_else(|| Error::SegmentNotFound(format!("segment id {segment_id}")))?;
        if maps.by_name.get(meta.name()) == Some(&segment_id) {
            maps.by_name.remove(meta.name());
        }
        self.update_active_gauge(&maps);
        drop(maps);
        let snapshot = meta.snapshot();
        if deleted {
            meta.mark_deleted();
        }
        self.read_index.cleanup(&[segment_id]);
        debug!(
            container_id = self.container_id,
            segment_id,
            segment = %snapshot.name,
            deleted,
            "Unmapped segment"
        );
        Ok(snapshot)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use object_store::memory::InMemory;

    use segvault_core::{AttributeUpdate, AttributeUpdateType};
    use segvault_storage::ObjectStorage;

    fn metadata() -> ContainerMetadata {
        metadata_with_limit(100)
    }

    fn metadata_with_limit(max_active: usize) -> ContainerMetadata {
        let storage = ObjectStorage::new(Arc::new(InMemory::new()));
        let read_index = Arc::new(ContainerReadIndex::new(0, Arc::new(storage)));
        ContainerMetadata::new(0, max_active, read_index)
    }

    fn append(segment_id: u64, data: &'static [u8]) -> Operation {
        Operation::Append {
            segment_id,
            expected_offset: None,
            data: Bytes::from_static(data),
            attribute_updates: Vec::new(),
        }
    }

    #[test]
    fn test_map_append_seal() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg1")).unwrap();

        assert_eq!(metadata.apply_operation(1, &append(1, b"0123456789")).unwrap(), 0);
        assert_eq!(metadata.apply_operation(2, &append(1, b"01234")).unwrap(), 10);

        let meta = metadata.get_by_name("seg1").unwrap();
        assert_eq!(meta.length(), 15);
        assert!(!meta.is_sealed());

        let sealed_at = metadata
            .apply_operation(3, &Operation::Seal { segment_id: 1 })
            .unwrap();
        assert_eq!(sealed_at, 15);
        assert!(meta.is_sealed());

        let err = metadata.apply_operation(4, &append(1, b"x")).unwrap_err();
        assert!(matches!(err, Error::SegmentSealed(1)));
        assert_eq!(meta.length(), 15);
    }

    #[test]
    fn test_conditional_append_checks_offset() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg")).unwrap();
        metadata.apply_operation(1, &append(1, b"abc")).unwrap();

        let ok = Operation::Append {
            segment_id: 1,
            expected_offset: Some(3),
            data: Bytes::from_static(b"de"),
            attribute_updates: Vec::new(),
        };
        assert_eq!(metadata.apply_operation(2, &ok).unwrap(), 3);

        let stale = Operation::Append {
            segment_id: 1,
            expected_offset: Some(3),
            data: Bytes::from_static(b"x"),
            attribute_updates: Vec::new(),
        };
        let err = metadata.apply_operation(3, &stale).unwrap_err();
        assert!(matches!(
            err,
            Error::BadOffset {
                segment_id: 1,
                expected: 3,
                actual: 5,
            }
        ));
    }

    #[test]
    fn test_failed_attribute_update_rolls_back_everything() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg")).unwrap();

        let id = AttributeId::random();
        let op = Operation::Append {
            segment_id: 1,
            expected_offset: None,
            data: Bytes::from_static(b"data"),
            attribute_updates: vec![AttributeUpdate::new(
                id,
                AttributeUpdateType::ReplaceIfEquals { expected: 1 },
                2,
            )],
        };
        let err = metadata.apply_operation(1, &op).unwrap_err();
        assert!(err.is_previous_value_missing());

        // Neither the length nor the attribute moved.
        let meta = metadata.get_by_name("seg").unwrap();
        assert_eq!(meta.length(), 0);
        assert!(meta.attribute(id).is_none());
    }

    #[test]
    fn test_updates_within_one_operation_see_each_other() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg")).unwrap();

        let id = AttributeId::core(5);
        let op = Operation::UpdateAttributes {
            segment_id: 1,
            attribute_updates: vec![
                AttributeUpdate::replace(id, 10),
                AttributeUpdate::accumulate(id, 5),
            ],
        };
        metadata.apply_operation(1, &op).unwrap();
        let meta = metadata.get_by_name("seg").unwrap();
        assert_eq!(meta.attribute(id), Some(15));
    }

    #[test]
    fn test_truncate_bounds() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg")).unwrap();
        metadata.apply_operation(1, &append(1, b"0123456789")).unwrap();

        metadata
            .apply_operation(2, &Operation::Truncate { segment_id: 1, offset: 5 })
            .unwrap();
        let meta = metadata.get_by_name("seg").unwrap();
        assert_eq!(meta.start_offset(), 5);

        let err = metadata
            .apply_operation(3, &Operation::Truncate { segment_id: 1, offset: 3 })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        let err = metadata
            .apply_operation(4, &Operation::Truncate { segment_id: 1, offset: 11 })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_merge_consumes_source_name() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "target")).unwrap();
        metadata.apply_map(&SegmentSnapshot::empty(2, "source")).unwrap();
        metadata.apply_operation(1, &append(1, b"tt")).unwrap();
        metadata.apply_operation(2, &append(2, b"sss")).unwrap();
        metadata
            .apply_operation(3, &Operation::Seal { segment_id: 2 })
            .unwrap();

        let offset = metadata
            .apply_operation(4, &Operation::Merge { target_id: 1, source_id: 2 })
            .unwrap();
        assert_eq!(offset, 2);

        let target = metadata.get_by_name("target").unwrap();
        assert_eq!(target.length(), 5);
        assert!(metadata.get_by_name("source").is_none());
        assert_eq!(metadata.active_count(), 1);

        // The consumed source still answers by id, as merged.
        let source = metadata.get_by_id(2).unwrap();
        assert!(source.is_merged());
        let err = metadata.apply_operation(5, &append(2, b"x")).unwrap_err();
        assert!(matches!(err, Error::SegmentMerged(2)));
    }

    #[test]
    fn test_merge_requires_sealed_source_and_open_target() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "target")).unwrap();
        metadata.apply_map(&SegmentSnapshot::empty(2, "source")).unwrap();

        let err = metadata
            .apply_operation(1, &Operation::Merge { target_id: 1, source_id: 2 })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        metadata
            .apply_operation(2, &Operation::Seal { segment_id: 2 })
            .unwrap();
        metadata
            .apply_operation(3, &Operation::Seal { segment_id: 1 })
            .unwrap();
        let err = metadata
            .apply_operation(4, &Operation::Merge { target_id: 1, source_id: 2 })
            .unwrap_err();
        assert!(matches!(err, Error::SegmentSealed(1)));
    }

    #[test]
    fn test_map_enforces_budget_and_unique_names() {
        let metadata = metadata_with_limit(2);
        metadata.apply_map(&SegmentSnapshot::empty(1, "a")).unwrap();
        metadata.apply_map(&SegmentSnapshot::empty(2, "b")).unwrap();

        let err = metadata
            .apply_map(&SegmentSnapshot::empty(3, "c"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TooManySegments { active: 2, limit: 2 }
        ));

        let err = metadata
            .apply_map(&SegmentSnapshot::empty(4, "a"))
            .unwrap_err();
        assert!(matches!(err, Error::SegmentExists(_)));
    }

    #[test]
    fn test_unmap_returns_final_snapshot() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg")).unwrap();
        metadata.apply_operation(1, &append(1, b"abcde")).unwrap();

        let snapshot = metadata.apply_unmap(1, true).unwrap();
        assert_eq!(snapshot.name, "seg");
        assert_eq!(snapshot.length, 5);
        assert!(metadata.get_by_name("seg").is_none());
        assert!(metadata.get_by_id(1).is_none());

        let err = metadata.apply_unmap(1, true).unwrap_err();
        assert!(matches!(err, Error::SegmentNotFound(_)));
    }

    #[test]
    fn test_ids_are_never_reused_after_replay() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(41, "seg")).unwrap();
        assert!(metadata.next_segment_id() >= 42);
    }

    #[test]
    fn test_eviction_candidates_respect_flush_and_idleness() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "idle")).unwrap();
        metadata.apply_map(&SegmentSnapshot::empty(2, "busy")).unwrap();
        metadata.apply_operation(1, &append(1, b"xx")).unwrap();
        metadata.apply_operation(2, &append(2, b"yy")).unwrap();

        let idle = metadata.get_by_id(1).unwrap();
        let busy = metadata.get_by_id(2).unwrap();
        idle.set_storage_length(2);
        busy.set_storage_length(2);
        idle.last_used_ms.store(0, Ordering::Release);

        let candidates = metadata.eviction_candidates(Duration::from_secs(60), 10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id(), 1);

        // Unflushed bytes pin the entry even when idle.
        idle.length.store(10, Ordering::Release);
        assert!(metadata
            .eviction_candidates(Duration::from_secs(60), 10)
            .is_empty());
    }

    #[test]
    fn test_merged_leftovers_are_always_evictable() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "target")).unwrap();
        metadata.apply_map(&SegmentSnapshot::empty(2, "source")).unwrap();
        metadata.apply_operation(1, &append(2, b"s")).unwrap();
        metadata
            .apply_operation(2, &Operation::Seal { segment_id: 2 })
            .unwrap();
        metadata
            .apply_operation(3, &Operation::Merge { target_id: 1, source_id: 2 })
            .unwrap();

        // Not evictable until the writer has moved the bytes.
        assert!(metadata
            .eviction_candidates(Duration::from_secs(3600), 10)
            .is_empty());

        metadata.get_by_id(2).unwrap().mark_merge_flushed();
        let candidates = metadata.eviction_candidates(Duration::from_secs(3600), 10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id(), 2);
    }

    #[test]
    fn test_properties_filter_sentinels() {
        let metadata = metadata();
        let real = AttributeId::random();
        let absent = AttributeId::random();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg")).unwrap();
        metadata
            .apply_operation(
                1,
                &Operation::UpdateAttributes {
                    segment_id: 1,
                    attribute_updates: vec![
                        AttributeUpdate::replace(real, 7),
                        AttributeUpdate::replace(absent, NULL_ATTRIBUTE_VALUE),
                    ],
                },
            )
            .unwrap();

        let meta = metadata.get_by_name("seg").unwrap();
        let props = meta.properties();
        assert_eq!(props.attributes.get(&real), Some(&7));
        assert!(!props.attributes.contains_key(&absent));
        // The sentinel is still resident for partitioning purposes.
        let (resident, missing) = meta.partition_attributes(&[real, absent]);
        assert_eq!(resident.len(), 2);
        assert!(missing.is_empty());
    }

    #[test]
    fn test_staging_distinguishes_absent_from_not_loaded() {
        let metadata = metadata();
        metadata.apply_map(&SegmentSnapshot::empty(1, "seg")).unwrap();
        let id = AttributeId::random();

        // Not loaded: the update must ask the caller to load it first.
        let err = metadata
            .apply_operation(
                1,
                &Operation::UpdateAttributes {
                    segment_id: 1,
                    attribute_updates: vec![AttributeUpdate::accumulate(id, 4)],
                },
            )
            .unwrap_err();
        assert!(err.is_previous_value_missing());

        // Confirmed absent: accumulate starts from zero.
        metadata
            .apply_operation(
                2,
                &Operation::UpdateAttributes {
                    segment_id: 1,
                    attribute_updates: vec![AttributeUpdate::replace(id, NULL_ATTRIBUTE_VALUE)],
                },
            )
            .unwrap();
        metadata
            .apply_operation(
                3,
                &Operation::UpdateAttributes {
                    segment_id: 1,
                    attribute_updates: vec![AttributeUpdate::accumulate(id, 4)],
                },
            )
            .unwrap();
        let meta = metadata.get_by_name("seg").unwrap();
        assert_eq!(meta.attribute(id), Some(4));
    }
}
