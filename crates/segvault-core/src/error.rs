//! Shared error taxonomy for the segment store.
//!
//! Every variant is cloneable so that one failure can be stored in a watch
//! cell or a shared future and handed to every caller that raced on the same
//! work. `std::io::Error` is not `Clone`, so it rides in an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::attributes::AttributeId;
use crate::service::ServiceState;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A public operation arrived while the container was not in `Running`.
    #[error("container {container_id} is not running (state: {state})")]
    ContainerNotRunning {
        container_id: u32,
        state: ServiceState,
    },

    /// The container is up but its durable log is still recovering; writes
    /// and reads are rejected until the log comes back online.
    #[error("container {container_id} is offline: durable log is recovering")]
    ContainerOffline { container_id: u32 },

    /// Use after `close()`.
    #[error("{name} has been closed")]
    ObjectClosed { name: String },

    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    #[error("segment already exists: {0}")]
    SegmentExists(String),

    /// A read addressed an offset below the segment's truncation point.
    #[error("segment {segment_id} is truncated at {start_offset}; cannot read offset {offset}")]
    SegmentTruncated {
        segment_id: u64,
        start_offset: u64,
        offset: u64,
    },

    /// The segment id refers to a segment that has been merged away; callers
    /// holding the id should re-resolve by name.
    #[error("segment {0} has been merged into another segment")]
    SegmentMerged(u64),

    #[error("segment {0} is sealed and does not accept modifications")]
    SegmentSealed(u64),

    /// A conditional attribute update failed its precondition.
    /// `previous_value_missing` distinguishes "no value was present at all"
    /// from "a value was present but did not match".
    #[error("bad attribute update for {attribute_id}: {reason}")]
    BadAttributeUpdate {
        attribute_id: AttributeId,
        previous_value_missing: bool,
        reason: String,
    },

    /// A conditional append named an expected offset that did not match the
    /// segment's current length.
    #[error("bad offset for segment {segment_id}: expected {expected}, actual {actual}")]
    BadOffset {
        segment_id: u64,
        expected: u64,
        actual: u64,
    },

    /// The active-segment quota is exhausted and a forced metadata sweep did
    /// not free any slots.
    #[error("cannot map another segment: {active} active segments (limit {limit})")]
    TooManySegments { active: usize, limit: usize },

    /// A monitored inner component failed. The first failure is the primary
    /// cause; failures observed while shutting the rest down are suppressed.
    #[error("component {component} failed: {cause}")]
    Component {
        component: &'static str,
        cause: Arc<Error>,
        suppressed: Vec<Arc<Error>>,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The durable log journal failed integrity checks during recovery.
    #[error("journal corrupted: {0}")]
    JournalCorrupted(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for the narrow class of conditional-update failures that mean
    /// "the previous value was not resident", which callers may repair by
    /// loading attributes and retrying once.
    pub fn is_previous_value_missing(&self) -> bool {
        matches!(
            self,
            Error::BadAttributeUpdate {
                previous_value_missing: true,
                ..
            }
        )
    }

    pub fn is_bad_attribute_update(&self) -> bool {
        matches!(self, Error::BadAttributeUpdate { .. })
    }

    /// Wraps this error as the primary cause of a component failure.
    pub fn into_component(self, component: &'static str) -> Error {
        Error::Component {
            component,
            cause: Arc::new(self),
            suppressed: Vec::new(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
