//! Prometheus metrics for the segment container.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global metrics registry for the container crate.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Public operations accepted, labeled by container and operation kind.
    pub static ref CONTAINER_OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "segvault_container_operations_total",
            "Total container operations accepted"
        ),
        &["container", "operation"]
    )
    .expect("metric can be created");

    /// Public operations that returned an error.
    pub static ref CONTAINER_OPERATION_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "segvault_container_operation_errors_total",
            "Total container operations that failed"
        ),
        &["container", "operation"]
    )
    .expect("metric can be created");

    /// Bytes accepted by append operations.
    pub static ref CONTAINER_APPEND_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "segvault_container_append_bytes_total",
            "Total bytes accepted by appends"
        ),
        &["container"]
    )
    .expect("metric can be created");

    /// Segments currently mapped in container metadata.
    pub static ref CONTAINER_ACTIVE_SEGMENTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "segvault_container_active_segments",
            "Segments currently mapped in metadata"
        ),
        &["container"]
    )
    .expect("metric can be created");
}

/// Registers every metric family with [`REGISTRY`]. Safe to call repeatedly.
pub fn register_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CONTAINER_OPERATIONS_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(CONTAINER_OPERATION_ERRORS_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(CONTAINER_APPEND_BYTES_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(CONTAINER_ACTIVE_SEGMENTS.clone()))
            .expect("collector can be registered");
    });
}
