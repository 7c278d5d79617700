//! In-memory read index over the container's segments.
//!
//! Every committed append is pushed here by the log applier before the
//! caller is acked, so reads see data long before the storage writer flushes
//! it. The index never blocks a read on the writer: a read is planned under
//! the lock as a sequence of pieces, each either a cached byte range or a
//! ranged fetch from the durable tier, and the plan is executed lazily after
//! the lock is released.
//!
//! ## Merge visibility
//!
//! When a merge commits in the log, the source's cached ranges move into the
//! target at their rebased offsets and the whole merged span is covered by a
//! redirect naming the source object. Reads of the span hit the moved cache
//! first and fall back to ranged reads of the source object, so merged data
//! is readable before the writer has physically concatenated anything. Once
//! the writer's concat completes it retires the redirect and later fetches
//! go to the target object.
//!
//! ```text
//!  target: [ flushed target bytes | appended tail | merged span          ]
//!                                                   ▲ cached ranges moved
//!                                                   ▲ gaps -> source object
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tracing::{debug, error};

use segvault_core::{Error, Result, SegmentSnapshot};

use crate::SharedStorage;

// ============================================================================
// Index state
// ============================================================================

/// A merged-in source whose bytes have not yet been physically concatenated
/// into the target object.
#[derive(Debug, Clone)]
struct Redirect {
    /// Offset within the target where the merged span begins.
    offset: u64,
    /// Length of the merged span (the source's full length).
    length: u64,
    /// Storage object that still holds the bytes.
    source_name: String,
}

#[derive(Debug)]
struct SegmentIndex {
    /// Storage object name for fetches that miss the cache.
    name: String,
    start_offset: u64,
    length: u64,
    /// Cached append ranges keyed by their starting offset. Ranges never
    /// overlap; they are inserted in append order by the log applier.
    ranges: BTreeMap<u64, Bytes>,
    redirects: Vec<Redirect>,
}

impl SegmentIndex {
    fn from_snapshot(snapshot: &SegmentSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            start_offset: snapshot.start_offset,
            length: snapshot.length,
            ranges: BTreeMap::new(),
            redirects: Vec::new(),
        }
    }

    /// The cached range containing `pos`, if any.
    fn cached_at(&self, pos: u64) -> Option<(u64, &Bytes)> {
        let (start, bytes) = self.ranges.range(..=pos).next_back()?;
        if pos < start + bytes.len() as u64 {
            Some((*start, bytes))
        } else {
            None
        }
    }
}

// ============================================================================
// ContainerReadIndex
// ============================================================================

/// One read index per container, covering every mapped segment.
///
/// Mutations are synchronous and cheap; the log applier calls them inline
/// while holding the operation order. Reads are async only in their storage
/// fallback.
pub struct ContainerReadIndex {
    container_id: u32,
    storage: SharedStorage,
    segments: RwLock<HashMap<u64, SegmentIndex>>,
}

impl ContainerReadIndex {
    pub fn new(container_id: u32, storage: SharedStorage) -> Self {
        Self {
            container_id,
            storage,
            segments: RwLock::new(HashMap::new()),
        }
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<u64, SegmentIndex>> {
        self.segments.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<u64, SegmentIndex>> {
        self.segments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a segment at its durable baseline. Bytes below the
    /// baseline length resolve to storage until appends cache new data.
    pub fn register(&self, snapshot: &SegmentSnapshot) {
        let mut map = self.write_map();
        map.insert(snapshot.segment_id, SegmentIndex::from_snapshot(snapshot));
        debug!(
            container_id = self.container_id,
            segment_id = snapshot.segment_id,
            name = %snapshot.name,
            length = snapshot.length,
            "Registered segment in read index"
        );
    }

    /// Caches a committed append. `offset` has already been validated by the
    /// log applier against the segment's length; a mismatch here means the
    /// index and the metadata have diverged.
    pub fn append(&self, segment_id: u64, offset: u64, data: Bytes) {
        let mut map = self.write_map();
        let Some(index) = map.get_mut(&segment_id) else {
            error!(
                container_id = self.container_id,
                segment_id, "Append for unregistered segment dropped from read index"
            );
            return;
        };
        debug_assert_eq!(index.length, offset);
        if index.length != offset {
            error!(
                container_id = self.container_id,
                segment_id,
                index_length = index.length,
                offset,
                "Read index out of sync with applied append; dropping cached copy"
            );
            return;
        }
        if data.is_empty() {
            return;
        }
        index.length = offset + data.len() as u64;
        index.ranges.insert(offset, data);
    }

    /// Makes a committed merge readable: the source's cached ranges move to
    /// the target at rebased offsets and a redirect covers the whole span
    /// until the writer physically concatenates the objects.
    pub fn begin_merge(&self, target_id: u64, merge_offset: u64, source_id: u64) {
        let mut map = self.write_map();
        let Some(source) = map.remove(&source_id) else {
            error!(
                container_id = self.container_id,
                source_id, "Merge source missing from read index"
            );
            return;
        };
        let Some(target) = map.get_mut(&target_id) else {
            error!(
                container_id = self.container_id,
                target_id, "Merge target missing from read index"
            );
            return;
        };
        debug_assert_eq!(target.length, merge_offset);
        for (offset, bytes) in source.ranges {
            target.ranges.insert(merge_offset + offset, bytes);
        }
        target.redirects.push(Redirect {
            offset: merge_offset,
            length: source.length,
            source_name: source.name.clone(),
        });
        target.length = merge_offset + source.length;
        debug!(
            container_id = self.container_id,
            target_id,
            source_id,
            merge_offset,
            merged_bytes = source.length,
            "Merge visible in read index"
        );
    }

    /// Retires the redirect for a physically completed merge. Fetches of the
    /// merged span go to the target object from now on.
    pub fn complete_merge(&self, target_id: u64, source_name: &str) {
        let mut map = self.write_map();
        let Some(target) = map.get_mut(&target_id) else {
            debug!(
                container_id = self.container_id,
                target_id, "Merge target already cleaned up"
            );
            return;
        };
        target.redirects.retain(|r| r.source_name != source_name);
    }

    /// Applies a committed truncation: evicts cached ranges that fall wholly
    /// below the new start offset.
    pub fn truncate(&self, segment_id: u64, new_start_offset: u64) {
        let mut map = self.write_map();
        let Some(index) = map.get_mut(&segment_id) else {
            return;
        };
        index.start_offset = new_start_offset;
        index
            .ranges
            .retain(|start, bytes| start + bytes.len() as u64 > new_start_offset);
    }

    /// Drops index state for segments that are gone (evicted, deleted, or
    /// merged away).
    pub fn cleanup(&self, segment_ids: &[u64]) {
        let mut map = self.write_map();
        let mut removed = 0usize;
        for id in segment_ids {
            if map.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(
                container_id = self.container_id,
                removed, "Cleaned up read index entries"
            );
        }
    }

    /// Plans a read of up to `max_length` bytes starting at `offset`.
    ///
    /// The plan is fixed at call time: appends that land afterwards are not
    /// part of it. Reading exactly at the current length yields an empty
    /// result rather than waiting for future appends.
    pub fn read(&self, segment_id: u64, offset: u64, max_length: usize) -> Result<ReadResult> {
        let map = self.read_map();
        let index = map
            .get(&segment_id)
            .ok_or_else(|| Error::SegmentNotFound(format!("segment id {segment_id}")))?;

        if offset < index.start_offset {
            return Err(Error::SegmentTruncated {
                segment_id,
                start_offset: index.start_offset,
                offset,
            });
        }
        if offset > index.length {
            return Err(Error::InvalidOperation(format!(
                "read offset {offset} is beyond segment length {}",
                index.length
            )));
        }

        let end = index.length.min(offset.saturating_add(max_length as u64));
        let mut entries = VecDeque::new();
        let mut pos = offset;
        while pos < end {
            if let Some((start, bytes)) = index.cached_at(pos) {
                let range_end = (start + bytes.len() as u64).min(end);
                let slice = bytes.slice((pos - start) as usize..(range_end - start) as usize);
                entries.push_back(PlannedEntry::Cached(slice));
                pos = range_end;
                continue;
            }

            // Uncached gap: bounded by the next cached range and by any
            // redirect edge it would otherwise span.
            let mut gap_end = end;
            if let Some(next_start) = index.ranges.range(pos + 1..).next().map(|(s, _)| *s) {
                gap_end = gap_end.min(next_start);
            }
            let mut redirect: Option<&Redirect> = None;
            for r in &index.redirects {
                if pos < r.offset {
                    gap_end = gap_end.min(r.offset);
                } else if pos < r.offset + r.length {
                    gap_end = gap_end.min(r.offset + r.length);
                    redirect = Some(r);
                }
            }
            let (name, object_offset) = match redirect {
                Some(r) => (r.source_name.clone(), pos - r.offset),
                None => (index.name.clone(), pos),
            };
            entries.push_back(PlannedEntry::Storage {
                name,
                offset: object_offset,
                length: gap_end - pos,
            });
            pos = gap_end;
        }

        Ok(ReadResult {
            segment_id,
            next_offset: offset,
            entries,
            storage: SharedStorage::clone(&self.storage),
        })
    }
}

// ============================================================================
// ReadResult
// ============================================================================

#[derive(Debug)]
enum PlannedEntry {
    Cached(Bytes),
    Storage { name: String, offset: u64, length: u64 },
}

/// Where a returned entry's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEntrySource {
    Cache,
    Storage,
}

/// One contiguous piece of a read.
#[derive(Debug, Clone)]
pub struct ReadEntry {
    /// Segment offset of the first byte in `data`.
    pub offset: u64,
    pub data: Bytes,
    pub source: ReadEntrySource,
}

/// A planned read, consumed entry by entry. Cached entries resolve without
/// I/O; storage entries fetch their range on demand.
pub struct ReadResult {
    segment_id: u64,
    next_offset: u64,
    entries: VecDeque<PlannedEntry>,
    storage: SharedStorage,
}

impl ReadResult {
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Segment offset the next entry will start at.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Bytes left in the plan.
    pub fn remaining(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| match e {
                PlannedEntry::Cached(bytes) => bytes.len() as u64,
                PlannedEntry::Storage { length, .. } => *length,
            })
            .sum()
    }

    /// Resolves the next entry, fetching from storage when the piece is not
    /// cached. Returns `None` once the plan is exhausted.
    pub async fn next_entry(&mut self) -> Result<Option<ReadEntry>> {
        let Some(entry) = self.entries.pop_front() else {
            return Ok(None);
        };
        let offset = self.next_offset;
        let (data, source) = match entry {
            PlannedEntry::Cached(bytes) => (bytes, ReadEntrySource::Cache),
            PlannedEntry::Storage {
                name,
                offset: object_offset,
                length,
            } => {
                let bytes = self.storage.read_range(&name, object_offset, length).await?;
                (bytes, ReadEntrySource::Storage)
            }
        };
        self.next_offset = offset + data.len() as u64;
        Ok(Some(ReadEntry {
            offset,
            data,
            source,
        }))
    }

    /// Drains the whole plan into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.remaining() as usize);
        while let Some(entry) = self.next_entry().await? {
            buf.extend_from_slice(&entry.data);
        }
        Ok(buf.into())
    }
}

// ============================================================================
// Tests
// ============================================================================
