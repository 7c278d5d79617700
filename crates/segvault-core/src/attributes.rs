//! Segment attributes: 128-bit keys, the absent-value sentinel and the
//! conditional update protocol.
//!
//! Attributes come in two families decided by the key itself:
//!
//! - **Core** attributes (most-significant half equals the reserved prefix)
//!   live in container metadata for the whole life of the segment and are
//!   always resident.
//! - **Extended** attributes (any other key) are durably owned by the
//!   per-segment attribute index and only cached in metadata on demand.
//!
//! A cached value of [`NULL_ATTRIBUTE_VALUE`] means "confirmed absent": the
//! index was consulted and had nothing. It is cached exactly like a real
//! value so repeated reads of a missing attribute do not re-query the index.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Most-significant half reserved for core attributes.
pub const CORE_ATTRIBUTE_PREFIX: u64 = i64::MIN as u64;

/// Sentinel meaning "this attribute has no value". Never a legal value for a
/// real attribute; callers see it filtered out of query results.
pub const NULL_ATTRIBUTE_VALUE: i64 = i64::MIN;

/// Wall-clock creation time of the segment, in epoch milliseconds.
pub const ATTR_CREATION_TIME: AttributeId = AttributeId::core(0);

/// Number of events appended to the segment, maintained by callers via
/// `Accumulate` updates.
pub const ATTR_EVENT_COUNT: AttributeId = AttributeId::core(1);

/// A 128-bit attribute key, ordered and hashable so it can key b-tree and
/// hash maps alike.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AttributeId {
    msb: u64,
    lsb: u64,
}

impl AttributeId {
    pub const fn new(msb: u64, lsb: u64) -> Self {
        Self { msb, lsb }
    }

    /// A core attribute id under the reserved prefix.
    pub const fn core(lsb: u64) -> Self {
        Self {
            msb: CORE_ATTRIBUTE_PREFIX,
            lsb,
        }
    }

    /// A fresh extended attribute id. Random v4 ids can never collide with
    /// the core prefix because the version nibble is forced to 4.
    pub fn random() -> Self {
        let (msb, lsb) = Uuid::new_v4().as_u64_pair();
        Self { msb, lsb }
    }

    pub fn is_core(&self) -> bool {
        self.msb == CORE_ATTRIBUTE_PREFIX
    }

    pub fn is_extended(&self) -> bool {
        !self.is_core()
    }

    pub fn msb(&self) -> u64 {
        self.msb
    }

    pub fn lsb(&self) -> u64 {
        self.lsb
    }

    /// Big-endian 16-byte form, sorted the same way as `(msb, lsb)`.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.msb.to_be_bytes());
        out[8..].copy_from_slice(&self.lsb.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut msb = [0u8; 8];
        let mut lsb = [0u8; 8];
        msb.copy_from_slice(&bytes[..8]);
        lsb.copy_from_slice(&bytes[8..]);
        Self {
            msb: u64::from_be_bytes(msb),
            lsb: u64::from_be_bytes(lsb),
        }
    }
}

impl std::fmt::Display for AttributeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}-{:016x}", self.msb, self.lsb)
    }
}

/// How an [`AttributeUpdate`] combines with the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeUpdateType {
    /// Unconditionally set the new value.
    Replace,
    /// Set the new value only if the current value equals `expected`.
    /// Expecting [`NULL_ATTRIBUTE_VALUE`] matches a cached "confirmed
    /// absent" entry, which is how compare-and-set-from-nothing is spelled.
    ReplaceIfEquals { expected: i64 },
    /// Set the new value only if it is strictly greater than the current
    /// value. Succeeds when no current value exists.
    ReplaceIfGreater,
    /// Add the update value to the current value (missing counts as zero).
    Accumulate,
    /// Set the new value only if no value currently exists. Used for
    /// write-backs that must lose gracefully to a concurrent writer.
    SetIfAbsent,
}

/// One attribute mutation, applied atomically with the operation carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub id: AttributeId,
    pub update_type: AttributeUpdateType,
    pub value: i64,
}

impl AttributeUpdate {
    pub fn new(id: AttributeId, update_type: AttributeUpdateType, value: i64) -> Self {
        Self {
            id,
            update_type,
            value,
        }
    }

    pub fn replace(id: AttributeId, value: i64) -> Self {
        Self::new(id, AttributeUpdateType::Replace, value)
    }

    pub fn accumulate(id: AttributeId, value: i64) -> Self {
        Self::new(id, AttributeUpdateType::Accumulate, value)
    }

    pub fn set_if_absent(id: AttributeId, value: i64) -> Self {
        Self::new(id, AttributeUpdateType::SetIfAbsent, value)
    }

    /// Computes the value this update produces against `current`, or the
    /// precondition failure it trips over.
    ///
    /// `current` is the value resident in metadata, if any; a resident
    /// [`NULL_ATTRIBUTE_VALUE`] sentinel is a real entry here, not `None`.
    /// Conditional types report `previous_value_missing = true` only when no
    /// entry is resident at all, which is the signal callers use to decide
    /// whether loading the attribute index could repair the failure.
    pub fn apply(&self, current: Option<i64>) -> Result<i64> {
        match self.update_type {
            AttributeUpdateType::Replace => Ok(self.value),
            AttributeUpdateType::ReplaceIfEquals { expected } => match current {
                None => Err(self.failure(true, "no previous value to compare against")),
                Some(actual) if actual == expected => Ok(self.value),
                Some(actual) => Err(self.failure(
                    false,
                    format!("expected previous value {expected}, found {actual}"),
                )),
            },
            AttributeUpdateType::ReplaceIfGreater => match current {
                None => Ok(self.value),
                Some(actual) if self.value > actual => Ok(self.value),
                Some(actual) => Err(self.failure(
                    false,
                    format!("new value {} is not greater than {actual}", self.value),
                )),
            },
            // Wrapping on purpose: accumulators are allowed to roll over
            // rather than fail mid-operation.
            AttributeUpdateType::Accumulate => Ok(current.unwrap_or(0).wrapping_add(self.value)),
            AttributeUpdateType::SetIfAbsent => match current {
                None => Ok(self.value),
                Some(actual) => {
                    Err(self.failure(false, format!("attribute already has value {actual}")))
                }
            },
        }
    }

    fn failure(&self, previous_value_missing: bool, reason: impl Into<String>) -> Error {
        Error::BadAttributeUpdate {
            attribute_id: self.id,
            previous_value_missing,
            reason: reason.into(),
        }
    }
}
