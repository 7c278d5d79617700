//! The segment container: the per-partition orchestrator of SegVault.
//!
//! A container owns a set of named segments and binds the durable pieces
//! together: the write-ahead log serializes and persists every mutation, the
//! read index serves reads from cache or storage, the attribute index and
//! state store hold per-segment documents in the object tier, and the
//! storage writer moves applied bytes into their durable home in the
//! background. [`SegmentContainer`] is the entry point; everything else in
//! this crate backs it.

pub mod cleaner;
pub mod config;
pub mod container;
pub mod extension;
pub mod mapper;
pub mod metadata;
pub mod metrics;
pub mod writer;

pub use cleaner::MetadataCleaner;
pub use config::ContainerConfig;
pub use container::{DirectSegment, SegmentContainer};
pub use extension::{no_extensions, ContainerExtension, CreateExtensions, ExtensionRegistry};
pub use mapper::SegmentMapper;
pub use metadata::{ContainerMetadata, SegmentMetadata};
pub use writer::{SegmentAggregator, StorageWriter, WriterSegmentProcessor};
