//! SegVault Storage Layer
//!
//! This crate implements the tiered storage for a segment container: the
//! durable object-store tier that holds flushed segment bytes, plus the three
//! container-local views layered on top of it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────┐
//! │     SegmentContainer       │
//! └─────┬──────┬──────┬───────┘
//!       │      │      │
//!       ▼      ▼      ▼
//! ┌─────────┐ ┌──────────────┐ ┌──────────────┐
//! │ReadIndex│ │AttributeIndex│ │  StateStore  │
//! │ cached  │ │ attributes/  │ │   state/     │
//! │ tails + │ │ {name} docs  │ │ {name} docs  │
//! │ plans   │ └──────┬───────┘ └──────┬───────┘
//! └────┬────┘        │                │
//!      │ misses      │                │
//!      ▼             ▼                ▼
//! ┌─────────────────────────────────────────┐
//! │        Storage (object backend)         │
//! │  segments/{name}   sealed/{name}        │
//! │  meta/epoch (fencing marker)            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### Storage / ObjectStorage
//! The durable tier. One object per segment under `segments/{name}`, a
//! zero-byte seal marker under `sealed/{name}`, and a container epoch marker
//! under `meta/epoch` used to fence out stale writers. Backed by any
//! `object_store::ObjectStore` (`InMemory` in tests, local filesystem or
//! S3-compatible stores in production).
//!
//! ### ContainerReadIndex
//! Serves reads without waiting for the storage writer. Appends land in an
//! in-memory tail cache the instant the durable log commits them; reads are
//! planned against the cache first and fall back to ranged storage reads for
//! anything already flushed. Merges are visible immediately through
//! redirects that point at the not-yet-concatenated source object.
//!
//! ### ContainerAttributeIndex
//! Durable per-segment attribute documents under `attributes/{name}`. The
//! container keeps hot attributes in metadata; this index is where evicted
//! values go and where cache misses are repaired from.
//!
//! ### SegmentStateStore
//! Small per-segment state documents under `state/{name}` recording the
//! assigned segment id and creation-time attributes, read back when a
//! segment is mapped again after eviction or restart.

pub mod attribute_index;
pub mod object;
pub mod read_index;
pub mod state_store;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use segvault_core::Result;

pub use attribute_index::{ContainerAttributeIndex, SegmentAttributeIndex};
pub use object::ObjectStorage;
pub use read_index::{ContainerReadIndex, ReadEntry, ReadEntrySource, ReadResult};
pub use state_store::{SegmentState, SegmentStateStore};

// ============================================================================
// Storage contract
// ============================================================================

/// What the durable tier knows about one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSegmentInfo {
    pub name: String,
    /// Total bytes in the segment object.
    pub length: u64,
    pub sealed: bool,
}

/// Write capability for one segment, returned by [`Storage::open_write`].
///
/// The handle is plain data; it does not pin any resources. It exists so the
/// mutating half of the API is visibly separate from the read half.
#[derive(Debug, Clone)]
pub struct SegmentWriteHandle {
    pub name: String,
}

impl SegmentWriteHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The durable tier a segment container flushes into and reads back from.
///
/// Implementations must fence by epoch: once an instance has been
/// initialized with epoch `e`, any instance initialized with an epoch below
/// `e` must refuse further mutations. Reads are never fenced.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Claims the backend for the given container epoch. Must be called
    /// before any mutation. Fails if a higher epoch already claimed it.
    async fn initialize(&self, epoch: u64) -> Result<()>;

    /// Creates an empty segment. Atomic: exactly one of two concurrent
    /// creators wins, the other gets `Error::SegmentExists`.
    async fn create(&self, name: &str) -> Result<StorageSegmentInfo>;

    /// Opens a segment for mutation. The segment must exist; sealed
    /// segments can still be opened (concat needs a handle on the target).
    async fn open_write(&self, name: &str) -> Result<SegmentWriteHandle>;

    /// Appends `data` at `offset`, which must equal the segment's current
    /// length. Fails on sealed segments.
    async fn write(&self, handle: &SegmentWriteHandle, offset: u64, data: Bytes) -> Result<()>;

    /// Marks the segment sealed. Idempotent.
    async fn seal(&self, handle: &SegmentWriteHandle) -> Result<()>;

    /// Appends the whole of the sealed segment `source_name` to the target
    /// at `offset` (which must equal the target's length), then removes the
    /// source from the backend.
    async fn concat(&self, target: &SegmentWriteHandle, offset: u64, source_name: &str)
        -> Result<()>;

    /// Removes the segment and its seal marker.
    async fn delete(&self, handle: &SegmentWriteHandle) -> Result<()>;

    /// Reads `length` bytes starting at `offset`. The range must lie within
    /// the segment.
    async fn read_range(&self, name: &str, offset: u64, length: u64) -> Result<Bytes>;

    async fn get_info(&self, name: &str) -> Result<StorageSegmentInfo>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Marks this instance closed; all subsequent calls fail with
    /// `Error::ObjectClosed`.
    fn close(&self);
}

/// Shorthand used throughout the container wiring.
pub type SharedStorage = Arc<dyn Storage>;
