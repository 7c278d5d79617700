//! Durable per-segment state documents.
//!
//! A state document carries the part of a segment that must survive
//! metadata eviction and container restarts outside the log: the attribute
//! values as of creation or the most recent eviction, plus the id the
//! segment held when the document was written. When an evicted segment is
//! touched again the mapper seeds the fresh metadata entry from the
//! document; the new mapping gets a fresh id, never a reused one.
//!
//! Documents are small JSON objects under `state/{name}`, written at
//! creation and before eviction, and removed when the segment is deleted.

use std::sync::Arc;
use std::time::Duration;

use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use segvault_core::{AttributeId, Error, Result, TimeoutTimer};

/// The durable out-of-band state of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentState {
    /// Id the segment held when the document was written. Informational; a
    /// mapping created later is assigned a fresh id.
    pub segment_id: u64,
    pub name: String,
    /// Start offset at the time the document was written, so truncation
    /// survives metadata eviction.
    #[serde(default)]
    pub start_offset: u64,
    /// Attribute values at the time the document was written.
    pub attributes: Vec<(AttributeId, i64)>,
}

impl SegmentState {
    pub fn new(segment_id: u64, name: impl Into<String>) -> Self {
        Self {
            segment_id,
            name: name.into(),
            start_offset: 0,
            attributes: Vec::new(),
        }
    }
}

/// Reads and writes [`SegmentState`] documents.
pub struct SegmentStateStore {
    store: Arc<dyn ObjectStore>,
}

impl SegmentStateStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn state_path(segment_name: &str) -> Path {
        Path::from(format!("state/{segment_name}"))
    }

    /// The stored state, or `None` when the segment has none.
    pub async fn get(&self, segment_name: &str, timeout: Duration) -> Result<Option<SegmentState>> {
        let timer = TimeoutTimer::new(timeout);
        timer
            .run(async {
                match self.store.get(&Self::state_path(segment_name)).await {
                    Ok(result) => {
                        let bytes = result
                            .bytes()
                            .await
                            .map_err(|e| Error::Storage(e.to_string()))?;
                        let state: SegmentState = serde_json::from_slice(&bytes)
                            .map_err(|e| Error::Serialization(e.to_string()))?;
                        Ok(Some(state))
                    }
                    Err(object_store::Error::NotFound { .. }) => Ok(None),
                    Err(e) => Err(Error::Storage(e.to_string())),
                }
            })
            .await
    }

    pub async fn put(
        &self,
        segment_name: &str,
        state: &SegmentState,
        timeout: Duration,
    ) -> Result<()> {
        let timer = TimeoutTimer::new(timeout);
        let body =
            serde_json::to_vec(state).map_err(|e| Error::Serialization(e.to_string()))?;
        timer
            .run(async {
                self.store
                    .put(&Self::state_path(segment_name), body.into())
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            })
            .await?;
        debug!(
            segment = %segment_name,
            segment_id = state.segment_id,
            "Stored segment state"
        );
        Ok(())
    }

    /// Removes the document. Succeeds when there is none.
    pub async fn remove(&self, segment_name: &str, timeout: Duration) -> Result<()> {
        let timer = TimeoutTimer::new(timeout);
        timer
            .run(async {
                match self.store.delete(&Self::state_path(segment_name)).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                    Err(e) => Err(Error::Storage(e.to_string())),
                }
            })
            .await
    }
}
