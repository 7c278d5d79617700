//! Core contract types shared by every SegVault crate.
//!
//! This crate defines the vocabulary of the segment store and carries no I/O
//! of its own:
//!
//! - [`AttributeId`] / [`AttributeUpdate`]: 128-bit attribute keys and the
//!   conditional update protocol applied to them.
//! - [`Operation`]: the durable operations a container accepts (append, seal,
//!   truncate, merge, attribute update).
//! - [`SegmentProperties`]: a point-in-time snapshot of one segment.
//! - [`Error`] / [`Result`]: the shared error taxonomy. Errors are cheap to
//!   clone so a single failure can be fanned out to every waiter.
//! - [`ServiceStatus`]: the validated lifecycle state machine used by the
//!   container and its inner services.
//! - [`RetryPolicy`] / [`TimeoutTimer`]: exponential backoff and per-call
//!   deadline budgets.

pub mod attributes;
pub mod error;
pub mod operation;
pub mod properties;
pub mod retry;
pub mod service;
pub mod timer;

pub use attributes::{
    AttributeId, AttributeUpdate, AttributeUpdateType, ATTR_CREATION_TIME, ATTR_EVENT_COUNT,
    NULL_ATTRIBUTE_VALUE,
};
pub use error::{Error, Result};
pub use operation::{AppliedOperation, Operation};
pub use properties::{SegmentProperties, SegmentSnapshot};
pub use retry::RetryPolicy;
pub use service::{ServiceState, ServiceStatus};
pub use timer::TimeoutTimer;
