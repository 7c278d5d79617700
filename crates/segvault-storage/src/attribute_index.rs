//! Durable per-segment attribute documents.
//!
//! The container keeps hot attribute values in segment metadata; this index
//! is their durable home. The storage writer persists accumulated updates
//! here during flushes, metadata eviction drops the in-memory copies, and
//! cache misses are repaired by reading the document back.
//!
//! ## Document Format
//!
//! One JSON object per segment under `attributes/{name}`:
//!
//! ```text
//! {"attributes":[[{"msb":...,"lsb":...},42], ...]}
//! ```
//!
//! Pairs are kept sorted by attribute id so identical contents always
//! produce identical documents. A value equal to the null sentinel removes
//! its key instead of being stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use segvault_core::{AttributeId, Error, Result, TimeoutTimer, NULL_ATTRIBUTE_VALUE};

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct AttributeDocument {
    attributes: Vec<(AttributeId, i64)>,
}

impl AttributeDocument {
    fn into_map(self) -> HashMap<AttributeId, i64> {
        self.attributes.into_iter().collect()
    }

    fn from_map(map: HashMap<AttributeId, i64>) -> Self {
        let mut attributes: Vec<_> = map.into_iter().collect();
        attributes.sort_by_key(|(id, _)| *id);
        Self { attributes }
    }
}

// ============================================================================
// ContainerAttributeIndex
// ============================================================================

/// Hands out per-segment index handles and owns the per-segment update
/// locks that serialize read-modify-write cycles on the documents.
pub struct ContainerAttributeIndex {
    container_id: u32,
    store: Arc<dyn ObjectStore>,
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContainerAttributeIndex {
    pub fn new(container_id: u32, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            container_id,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The index for one segment. Creation is free; the document is only
    /// touched by `get`/`put` on the returned handle.
    pub fn for_segment(&self, segment_id: u64, segment_name: &str) -> SegmentAttributeIndex {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(segment_id).or_default())
        };
        SegmentAttributeIndex {
            segment_id,
            name: segment_name.to_string(),
            store: Arc::clone(&self.store),
            lock,
        }
    }

    /// Removes the segment's document. Succeeds when there is none.
    pub async fn delete(&self, segment_name: &str, timeout: Duration) -> Result<()> {
        let timer = TimeoutTimer::new(timeout);
        let path = attribute_path(segment_name);
        timer
            .run(async {
                match self.store.delete(&path).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                    Err(e) => Err(Error::Storage(e.to_string())),
                }
            })
            .await?;
        debug!(
            container_id = self.container_id,
            segment = %segment_name,
            "Deleted attribute document"
        );
        Ok(())
    }

    /// Drops update locks for segments that are gone.
    pub fn cleanup(&self, segment_ids: &[u64]) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for id in segment_ids {
            locks.remove(id);
        }
    }
}

fn attribute_path(segment_name: &str) -> Path {
    Path::from(format!("attributes/{segment_name}"))
}

// ============================================================================
// SegmentAttributeIndex
// ============================================================================

/// Index handle bound to one segment.
pub struct SegmentAttributeIndex {
    segment_id: u64,
    name: String,
    store: Arc<dyn ObjectStore>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl SegmentAttributeIndex {
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    async fn load(&self) -> Result<HashMap<AttributeId, i64>> {
        match self.store.get(&attribute_path(&self.name)).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                let doc: AttributeDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Ok(doc.into_map())
            }
            Err(object_store::Error::NotFound { .. }) => Ok(HashMap::new()),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    /// Looks up the requested ids. Ids with no durable value are absent from
    /// the result; the caller layers its own missing-value semantics on top.
    pub async fn get(
        &self,
        ids: &[AttributeId],
        timeout: Duration,
    ) -> Result<HashMap<AttributeId, i64>> {
        let timer = TimeoutTimer::new(timeout);
        let all = timer.run(self.load()).await?;
        Ok(ids
            .iter()
            .filter_map(|id| all.get(id).map(|v| (*id, *v)))
            .collect())
    }

    /// Merges `values` into the document. Values equal to the null sentinel
    /// remove their key. Concurrent puts for the same segment serialize on
    /// the per-segment lock; the whole cycle shares one deadline.
    pub async fn put(&self, values: &[(AttributeId, i64)], timeout: Duration) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let timer = TimeoutTimer::new(timeout);
        let _guard = timer
            .run(async { Ok(self.lock.lock().await) })
            .await?;
        timer
            .run(async {
                let mut all = self.load().await?;
                for (id, value) in values {
                    if *value == NULL_ATTRIBUTE_VALUE {
                        all.remove(id);
                    } else {
                        all.insert(*id, *value);
                    }
                }
                let doc = AttributeDocument::from_map(all);
                let body = serde_json::to_vec(&doc)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                self.store
                    .put(&attribute_path(&self.name), body.into())
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                debug!(
                    segment_id = self.segment_id,
                    segment = %self.name,
                    updated = values.len(),
                    total = doc.attributes.len(),
                    "Persisted attribute document"
                );
                Ok(())
            })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
