//! Durable operations and the receipts the log returns for them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::attributes::AttributeUpdate;

/// One durable mutation against a mapped segment. Operations are appended to
/// the container's log and applied to metadata in log order; everything a
/// replica needs to reapply them after a restart travels inside the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Append `data` at the tail, optionally fencing on the current length
    /// and atomically applying attribute updates.
    Append {
        segment_id: u64,
        /// When set, the append only applies if the segment length equals
        /// this value at application time.
        expected_offset: Option<u64>,
        data: Bytes,
        attribute_updates: Vec<AttributeUpdate>,
    },
    /// Apply attribute updates without moving the tail.
    UpdateAttributes {
        segment_id: u64,
        attribute_updates: Vec<AttributeUpdate>,
    },
    /// Make the segment permanently read-only.
    Seal { segment_id: u64 },
    /// Advance the start offset; reads below it fail afterwards.
    Truncate { segment_id: u64, offset: u64 },
    /// Fold a sealed source segment onto the tail of the target.
    Merge { target_id: u64, source_id: u64 },
}

impl Operation {
    /// The segment this operation mutates (the target, for merges).
    pub fn segment_id(&self) -> u64 {
        match self {
            Operation::Append { segment_id, .. }
            | Operation::UpdateAttributes { segment_id, .. }
            | Operation::Seal { segment_id }
            | Operation::Truncate { segment_id, .. } => *segment_id,
            Operation::Merge { target_id, .. } => *target_id,
        }
    }

    pub fn attribute_updates(&self) -> &[AttributeUpdate] {
        match self {
            Operation::Append {
                attribute_updates, ..
            }
            | Operation::UpdateAttributes {
                attribute_updates, ..
            } => attribute_updates,
            _ => &[],
        }
    }

    /// Short name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Append { .. } => "append",
            Operation::UpdateAttributes { .. } => "update_attributes",
            Operation::Seal { .. } => "seal",
            Operation::Truncate { .. } => "truncate",
            Operation::Merge { .. } => "merge",
        }
    }
}

/// What the log reports once an operation has been durably applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedOperation {
    /// Position in the log's total order.
    pub sequence: u64,
    /// Segment offset produced by the operation: the offset the data landed
    /// at for appends, the final length for seals, the new start offset for
    /// truncations, the merge offset for merges.
    pub segment_offset: u64,
}
