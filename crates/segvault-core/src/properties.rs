//! Point-in-time segment snapshots handed out by the container.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::attributes::AttributeId;

/// An immutable snapshot of one segment's metadata. Once returned it never
/// changes, even if the live segment does.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentProperties {
    pub name: String,
    pub segment_id: u64,
    /// Lowest readable offset; everything below it has been truncated away.
    pub start_offset: u64,
    /// Total length ever written, including truncated prefixes.
    pub length: u64,
    pub sealed: bool,
    pub deleted: bool,
    pub merged: bool,
    pub last_modified_ms: i64,
    /// Attributes resident at snapshot time, sentinel entries filtered out.
    pub attributes: HashMap<AttributeId, i64>,
}

impl SegmentProperties {
    /// Readable bytes remaining after truncation.
    pub fn readable_length(&self) -> u64 {
        self.length - self.start_offset
    }
}

/// The durable baseline of one segment binding: enough to rebuild the
/// metadata entry on recovery, or to rehydrate a previously evicted segment.
/// Attributes ride as pairs so the record serializes the same everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub segment_id: u64,
    pub name: String,
    pub start_offset: u64,
    pub length: u64,
    pub sealed: bool,
    pub attributes: Vec<(AttributeId, i64)>,
}

impl SegmentSnapshot {
    /// A baseline for a segment that has never stored any data.
    pub fn empty(segment_id: u64, name: impl Into<String>) -> Self {
        Self {
            segment_id,
            name: name.into(),
            start_offset: 0,
            length: 0,
            sealed: false,
            attributes: Vec::new(),
        }
    }
}
