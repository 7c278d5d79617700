//! The segment container: one orchestrator binding the durable log, read
//! index, attribute index, storage writer, mapper, and cleaner into a single
//! consistently-behaving unit.
//!
//! ## Lifecycle
//!
//! `start` brings the log up first. If the log reports itself offline
//! (recovering), the container stays `Starting` and a spawned task finishes
//! the job once the log comes online: the container transitions to `Running`
//! the moment that happens, then secondary services (storage initialization,
//! writer, cleaner, extensions) start behind it. A monitor task watches every
//! inner component; one of them failing, or stopping unexpectedly while the
//! container is live, shuts the whole container down with that failure as
//! the cause. `stop` stops the components concurrently and aggregates their
//! failure causes; `close` is an idempotent hard teardown.
//!
//! ## Request path
//!
//! Every public operation checks closed/running/online first, resolves the
//! segment name through the mapper, builds an `Operation`, and submits it to
//! the log under the caller's deadline. Reads bypass the log and go straight
//! to the read index. The attribute-caching protocol and the
//! missing-precondition repair retry both live here, layered over the log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use object_store::ObjectStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use segvault_core::{
    AppliedOperation, AttributeId, AttributeUpdate, Error, Operation, Result, SegmentProperties,
    ServiceState, ServiceStatus, TimeoutTimer, NULL_ATTRIBUTE_VALUE,
};
use segvault_storage::{
    ContainerAttributeIndex, ContainerReadIndex, ObjectStorage, ReadResult, SegmentState,
    SegmentStateStore, SharedStorage,
};
use segvault_wal::{DurableLog, JournalConfig, OperationApplier, OperationLog};

use crate::cleaner::MetadataCleaner;
use crate::config::ContainerConfig;
use crate::extension::{CreateExtensions, ContainerExtension, ExtensionRegistry};
use crate::mapper::SegmentMapper;
use crate::metadata::{ContainerMetadata, SegmentMetadata};
use crate::metrics;
use crate::writer::{SegmentAggregator, StorageWriter};

/// Deadline for background cleanup and eviction I/O, which has no caller to
/// borrow a budget from.
const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// SegmentContainer
// ============================================================================

pub struct SegmentContainer {
    config: ContainerConfig,
    container_label: String,
    metadata: Arc<ContainerMetadata>,
    log: Arc<dyn OperationLog>,
    storage: SharedStorage,
    read_index: Arc<ContainerReadIndex>,
    attribute_index: Arc<ContainerAttributeIndex>,
    state_store: Arc<SegmentStateStore>,
    writer: StorageWriter,
    cleaner: MetadataCleaner,
    mapper: SegmentMapper,
    extensions: Arc<ExtensionRegistry>,
    status: Arc<ServiceStatus>,
    closed: AtomicBool,
    /// Delayed-start and monitor tasks, aborted on close.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SegmentContainer {
    /// Builds a container over the given object-store backend, with a
    /// journal-backed durable log.
    pub fn new(
        config: ContainerConfig,
        backend: Arc<dyn ObjectStore>,
        create_extensions: CreateExtensions,
    ) -> Result<Arc<Self>> {
        Self::build(config, backend, create_extensions, |id, journal, applier| {
            Arc::new(DurableLog::new(id, journal, applier))
        })
    }

    /// Like [`new`](Self::new) but with a caller-supplied log, for tests
    /// that need to observe or script the log's behavior.
    pub fn with_log<F>(
        config: ContainerConfig,
        backend: Arc<dyn ObjectStore>,
        create_extensions: CreateExtensions,
        log_factory: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(u32, JournalConfig, Arc<dyn OperationApplier>) -> Arc<dyn OperationLog>,
    {
        Self::build(config, backend, create_extensions, log_factory)
    }

    fn build<F>(
        config: ContainerConfig,
        backend: Arc<dyn ObjectStore>,
        create_extensions: CreateExtensions,
        log_factory: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(u32, JournalConfig, Arc<dyn OperationApplier>) -> Arc<dyn OperationLog>,
    {
        config.validate()?;
        metrics::register_metrics();
        let container_id = config.container_id;

        let storage: SharedStorage = Arc::new(ObjectStorage::new(Arc::clone(&backend)));
        let read_index = Arc::new(ContainerReadIndex::new(container_id, Arc::clone(&storage)));
        let metadata = Arc::new(ContainerMetadata::new(
            container_id,
            config.max_active_segment_count,
            Arc::clone(&read_index),
        ));
        let attribute_index = Arc::new(ContainerAttributeIndex::new(
            container_id,
            Arc::clone(&backend),
        ));
        let state_store = Arc::new(SegmentStateStore::new(backend));
        let log = log_factory(
            container_id,
            config.journal.clone(),
            Arc::clone(&metadata) as Arc<dyn OperationApplier>,
        );

        Ok(Arc::new_cyclic(|weak: &Weak<SegmentContainer>| {
            let extensions = Arc::new(ExtensionRegistry::new(create_extensions(weak.clone())));
            let writer = StorageWriter::new(
                container_id,
                config.writer_flush_interval,
                SegmentAggregator::new(
                    Arc::clone(&metadata),
                    Arc::clone(&storage),
                    Arc::clone(&attribute_index),
                    Arc::clone(&read_index),
                ),
                Arc::clone(&extensions),
            );
            let cleaner = MetadataCleaner::new(
                container_id,
                config.metadata_cleanup_interval,
                weak.clone(),
            );
            let mapper = SegmentMapper::new(
                container_id,
                Arc::clone(&metadata),
                Arc::clone(&log),
                Arc::clone(&storage),
                Arc::clone(&state_store),
                weak.clone(),
            );
            SegmentContainer {
                container_label: container_id.to_string(),
                config,
                metadata,
                log,
                storage,
                read_index,
                attribute_index,
                state_store,
                writer,
                cleaner,
                mapper,
                extensions,
                status: Arc::new(ServiceStatus::new("segment-container")),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }
        }))
    }

    pub fn id(&self) -> u32 {
        self.config.container_id
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    /// True while the log is recovering; requests are rejected until it
    /// comes online.
    pub fn is_offline(&self) -> bool {
        self.log.is_offline()
    }

    /// The extension of concrete type `T`, if one was registered.
    pub fn get_extension<T: ContainerExtension>(&self) -> Option<Arc<T>> {
        self.extensions.get::<T>()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.check_not_closed()?;
        self.status.transition(ServiceState::Starting)?;
        info!(container_id = self.id(), "Starting segment container");

        if let Err(e) = self.log.start().await {
            let cause = e.into_component("durable-log");
            self.status.fail(cause.clone());
            return Err(cause);
        }

        if self.log.is_offline() {
            // The log accepted the start but is still recovering. Finish
            // startup in the background; requests are rejected meanwhile.
            let container = Arc::clone(self);
            let handle = tokio::spawn(async move { container.delayed_start().await });
            lock(&self.tasks).push(handle);
            return Ok(());
        }

        if let Err(e) = self.start_secondary_services().await {
            self.status.fail(e.clone());
            return Err(e);
        }
        self.status.transition(ServiceState::Running)?;
        self.spawn_monitor();
        info!(
            container_id = self.id(),
            epoch = self.log.epoch(),
            "Segment container running"
        );
        Ok(())
    }

    async fn delayed_start(self: Arc<Self>) {
        if let Err(e) = self.log.await_online().await {
            self.handle_delayed_failure(e.into_component("durable-log")).await;
            return;
        }
        // Online: accept requests now, even while secondary services are
        // still coming up.
        if self.status.try_transition(ServiceState::Running) {
            info!(
                container_id = self.id(),
                epoch = self.log.epoch(),
                "Segment container running"
            );
        }
        self.spawn_monitor();
        if let Err(e) = self.start_secondary_services().await {
            self.handle_delayed_failure(e).await;
        }
    }

    /// A failure from the background half of startup. Fatal, unless it is a
    /// closed-object error observed while the container is already on its
    /// way down.
    async fn handle_delayed_failure(&self, cause: Error) {
        let stopping = self.closed.load(Ordering::Acquire)
            || !matches!(
                self.status.state(),
                ServiceState::Starting | ServiceState::Running
            );
        if stopping && matches!(cause, Error::ObjectClosed { .. }) {
            debug!(
                container_id = self.id(),
                error = %cause,
                "Suppressing delayed-start failure during shutdown"
            );
            return;
        }
        error!(
            container_id = self.id(),
            error = %cause,
            "Delayed container start failed"
        );
        let _ = self.shutdown(Some(cause)).await;
    }

    async fn start_secondary_services(&self) -> Result<()> {
        let epoch = self.log.epoch();
        self.metadata.set_epoch(epoch);
        self.storage
            .initialize(epoch)
            .await
            .map_err(|e| e.into_component("storage"))?;
        if let Some(tail) = self.log.take_tail() {
            self.writer.start(tail)?;
        }
        self.cleaner.start()?;
        for extension in self.extensions.iter() {
            extension
                .initialize()
                .await
                .map_err(|e| e.into_component(extension.name()))?;
        }
        Ok(())
    }

    /// Watches the inner components; any of them reaching a terminal state
    /// while the container is live is fatal.
    fn spawn_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut log_rx = self.log.status().subscribe();
        let mut writer_rx = self.writer.status().subscribe();
        let mut cleaner_rx = self.cleaner.status().subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = log_rx.changed() => if changed.is_err() { return },
                    changed = writer_rx.changed() => if changed.is_err() { return },
                    changed = cleaner_rx.changed() => if changed.is_err() { return },
                }
                let Some(container) = weak.upgrade() else {
                    return;
                };
                if !matches!(
                    container.status.state(),
                    ServiceState::Starting | ServiceState::Running
                ) {
                    return;
                }
                if let Some(cause) = container.component_failure() {
                    error!(
                        container_id = container.id(),
                        error = %cause,
                        "Inner component died; shutting container down"
                    );
                    let _ = container.shutdown(Some(cause)).await;
                    return;
                }
            }
        });
        lock(&self.tasks).push(handle);
    }

    fn components(&self) -> [(&'static str, &ServiceStatus); 3] {
        [
            ("durable-log", self.log.status()),
            ("storage-writer", self.writer.status()),
            ("metadata-cleaner", self.cleaner.status()),
        ]
    }

    /// The first component in a terminal state, as a component failure.
    fn component_failure(&self) -> Option<Error> {
        for (name, status) in self.components() {
            if status.state().is_terminal() {
                let cause = status.failure_cause().unwrap_or_else(|| {
                    Error::InvalidOperation(format!("{name} stopped unexpectedly"))
                });
                return Some(match cause {
                    wrapped @ Error::Component { .. } => wrapped,
                    other => other.into_component(name),
                });
            }
        }
        None
    }

    pub async fn stop(&self) -> Result<()> {
        self.shutdown(None).await
    }

    async fn shutdown(&self, external_cause: Option<Error>) -> Result<()> {
        if !self.status.try_transition(ServiceState::Stopping) {
            let state = self.status.wait_terminal().await;
            return match (state, self.status.failure_cause()) {
                (ServiceState::Failed, Some(cause)) => Err(cause),
                _ => Ok(()),
            };
        }
        info!(container_id = self.id(), "Stopping segment container");

        let (cleaner_res, writer_res, log_res) =
            tokio::join!(self.cleaner.stop(), self.writer.stop(), self.log.stop());
        for result in [cleaner_res, writer_res, log_res] {
            if let Err(e) = result {
                warn!(container_id = self.id(), error = %e, "Component stop failed");
            }
        }

        let mut causes: Vec<Error> = external_cause.into_iter().collect();
        for (name, status) in self.components() {
            if status.state() == ServiceState::Failed {
                if let Some(cause) = status.failure_cause() {
                    causes.push(match cause {
                        wrapped @ Error::Component { .. } => wrapped,
                        other => other.into_component(name),
                    });
                }
            }
        }

        match aggregate_failure(causes) {
            None => {
                self.status.transition(ServiceState::Terminated)?;
                info!(container_id = self.id(), "Segment container stopped");
                Ok(())
            }
            Some(aggregate) => {
                error!(
                    container_id = self.id(),
                    error = %aggregate,
                    "Segment container stopped with failure"
                );
                self.status.fail(aggregate.clone());
                Err(aggregate)
            }
        }
    }

    /// Idempotent hard teardown: extensions, writer, cleaner, log, storage,
    /// in that order, without waiting for graceful drains.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(container_id = self.id(), "Closing segment container");
        for extension in self.extensions.iter() {
            extension.close();
        }
        self.writer.close();
        self.cleaner.close();
        {
            let log = Arc::clone(&self.log);
            tokio::spawn(async move {
                let _ = log.stop().await;
            });
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.storage.close();
        self.status.try_transition(ServiceState::Stopping);
        self.status.try_transition(ServiceState::Terminated);
    }

    // ========================================================================
    // Gating
    // ========================================================================

    fn check_not_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ObjectClosed {
                name: format!("segment container {}", self.id()),
            });
        }
        Ok(())
    }

    fn check_running(&self) -> Result<()> {
        self.check_not_closed()?;
        let state = self.status.state();
        if state != ServiceState::Running {
            return Err(Error::ContainerNotRunning {
                container_id: self.id(),
                state,
            });
        }
        if self.log.is_offline() {
            return Err(Error::ContainerOffline {
                container_id: self.id(),
            });
        }
        Ok(())
    }

    fn log_request(&self, operation: &'static str, segment: &str) {
        metrics::CONTAINER_OPERATIONS_TOTAL
            .with_label_values(&[&self.container_label, operation])
            .inc();
        debug!(
            container_id = self.id(),
            operation,
            segment = %segment,
            "Request"
        );
    }

    fn track<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if result.is_err() {
            metrics::CONTAINER_OPERATION_ERRORS_TOTAL
                .with_label_values(&[&self.container_label, operation])
                .inc();
        }
        result
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Appends `data` at the segment's tail. Returns the offset the data
    /// landed at.
    pub async fn append(
        &self,
        name: &str,
        data: Bytes,
        attribute_updates: Vec<AttributeUpdate>,
        timeout: Duration,
    ) -> Result<u64> {
        self.check_running()?;
        self.log_request("append", name);
        let bytes = data.len() as u64;
        let result = self
            .append_inner(name, None, data, attribute_updates, timeout)
            .await;
        if result.is_ok() {
            metrics::CONTAINER_APPEND_BYTES_TOTAL
                .with_label_values(&[&self.container_label])
                .inc_by(bytes);
        }
        self.track("append", result)
    }

    /// Conditional append: applies only if the segment's length equals
    /// `expected_offset` at application time.
    pub async fn append_at(
        &self,
        name: &str,
        expected_offset: u64,
        data: Bytes,
        attribute_updates: Vec<AttributeUpdate>,
        timeout: Duration,
    ) -> Result<u64> {
        self.check_running()?;
        self.log_request("append", name);
        let bytes = data.len() as u64;
        let result = self
            .append_inner(name, Some(expected_offset), data, attribute_updates, timeout)
            .await;
        if result.is_ok() {
            metrics::CONTAINER_APPEND_BYTES_TOTAL
                .with_label_values(&[&self.container_label])
                .inc_by(bytes);
        }
        self.track("append", result)
    }

    async fn append_inner(
        &self,
        name: &str,
        expected_offset: Option<u64>,
        data: Bytes,
        attribute_updates: Vec<AttributeUpdate>,
        timeout: Duration,
    ) -> Result<u64> {
        let timer = TimeoutTimer::new(timeout);
        let meta = self.mapper.get_or_assign(name, timer.remaining()).await?;
        let operation = Operation::Append {
            segment_id: meta.id(),
            expected_offset,
            data,
            attribute_updates,
        };
        let applied = self
            .add_with_attribute_repair(&meta, operation, &timer)
            .await?;
        Ok(applied.segment_offset)
    }

    pub async fn update_attributes(
        &self,
        name: &str,
        attribute_updates: Vec<AttributeUpdate>,
        timeout: Duration,
    ) -> Result<()> {
        self.check_running()?;
        self.log_request("update_attributes", name);
        let timer = TimeoutTimer::new(timeout);
        let result = async {
            let meta = self.mapper.get_or_assign(name, timer.remaining()).await?;
            let operation = Operation::UpdateAttributes {
                segment_id: meta.id(),
                attribute_updates,
            };
            self.add_with_attribute_repair(&meta, operation, &timer)
                .await?;
            Ok(())
        }
        .await;
        self.track("update_attributes", result)
    }

    /// Fetches attribute values, consulting the attribute index for extended
    /// attributes not resident in metadata. With `cache == true` the
    /// discovered values are written back into metadata for later hits.
    /// Attributes with no value are absent from the result.
    pub async fn get_attributes(
        &self,
        name: &str,
        ids: &[AttributeId],
        cache: bool,
        timeout: Duration,
    ) -> Result<HashMap<AttributeId, i64>> {
        self.check_running()?;
        self.log_request("get_attributes", name);
        let timer = TimeoutTimer::new(timeout);
        let result = async {
            let meta = self.mapper.get_or_assign(name, timer.remaining()).await?;
            self.fetch_attributes(&meta, ids, cache, &timer).await
        }
        .await;
        self.track("get_attributes", result)
    }

    /// Plans a read of up to `max_length` bytes at `offset`. The returned
    /// [`ReadResult`] is pulled entry by entry; cached entries resolve
    /// without I/O.
    pub async fn read(
        &self,
        name: &str,
        offset: u64,
        max_length: usize,
        timeout: Duration,
    ) -> Result<ReadResult> {
        self.check_running()?;
        self.log_request("read", name);
        let result = async {
            let meta = self.mapper.get_or_assign(name, timeout).await?;
            self.read_index.read(meta.id(), offset, max_length)
        }
        .await;
        self.track("read", result)
    }

    /// A point-in-time snapshot of the segment. With `wait_for_pending_ops`
    /// the snapshot reflects everything submitted before the call. Falls
    /// back to storage plus the state document for segments that exist
    /// durably but are not currently mapped.
    pub async fn get_info(
        &self,
        name: &str,
        wait_for_pending_ops: bool,
        timeout: Duration,
    ) -> Result<SegmentProperties> {
        self.check_running()?;
        self.log_request("get_info", name);
        let timer = TimeoutTimer::new(timeout);
        let result = async {
            if wait_for_pending_ops {
                self.log.barrier(timer.remaining()).await?;
            }
            if let Some(meta) = self.metadata.get_by_name(name) {
                meta.touch();
                return Ok(meta.properties());
            }
            self.mapper.unmapped_info(name, timer.remaining()).await
        }
        .await;
        self.track("get_info", result)
    }

    pub async fn create(
        &self,
        name: &str,
        attribute_updates: Vec<AttributeUpdate>,
        timeout: Duration,
    ) -> Result<()> {
        self.check_running()?;
        self.log_request("create", name);
        let result = self.mapper.create(name, &attribute_updates, timeout).await;
        self.track("create", result)
    }

    /// Deletes the segment. The metadata removal is synchronous and
    /// exactly-once; physical cleanup and the removal notification run in
    /// the background.
    pub async fn delete(&self, name: &str, timeout: Duration) -> Result<()> {
        self.check_running()?;
        self.log_request("delete", name);
        let timer = TimeoutTimer::new(timeout);
        let result = async {
            let meta = match self.metadata.get_by_name(name) {
                Some(meta) => meta,
                // Unmapped but durable segments are mapped first so deletion
                // goes through the one removal path.
                None => self.mapper.get_or_assign(name, timer.remaining()).await?,
            };
            let snapshot = self
                .log
                .remove_segment(meta.id(), true, timer.remaining())
                .await?;
            self.spawn_removal_cleanup(meta.id(), snapshot.name, true);
            Ok(())
        }
        .await;
        self.track("delete", result)
    }

    /// Seals the segment against further modification. Returns the final
    /// length.
    pub async fn seal(&self, name: &str, timeout: Duration) -> Result<u64> {
        self.check_running()?;
        self.log_request("seal", name);
        let timer = TimeoutTimer::new(timeout);
        let result = async {
            let meta = self.mapper.get_or_assign(name, timer.remaining()).await?;
            let applied = self
                .log
                .add(
                    Operation::Seal {
                        segment_id: meta.id(),
                    },
                    timer.remaining(),
                )
                .await?;
            Ok(applied.segment_offset)
        }
        .await;
        self.track("seal", result)
    }

    pub async fn truncate(&self, name: &str, offset: u64, timeout: Duration) -> Result<()> {
        self.check_running()?;
        self.log_request("truncate", name);
        let timer = TimeoutTimer::new(timeout);
        let result = async {
            let meta = self.mapper.get_or_assign(name, timer.remaining()).await?;
            self.log
                .add(
                    Operation::Truncate {
                        segment_id: meta.id(),
                        offset,
                    },
                    timer.remaining(),
                )
                .await?;
            Ok(())
        }
        .await;
        self.track("truncate", result)
    }

    /// Merges `source` onto the tail of `target`, sealing the source first
    /// if needed. A source that turns out to be empty once sealed is deleted
    /// instead. Returns the source's properties as they were before it was
    /// consumed.
    pub async fn merge(
        &self,
        target: &str,
        source: &str,
        timeout: Duration,
    ) -> Result<SegmentProperties> {
        self.check_running()?;
        self.log_request("merge", source);
        let timer = TimeoutTimer::new(timeout);
        let result = self.merge_inner(target, source, &timer).await;
        self.track("merge", result)
    }

    async fn merge_inner(
        &self,
        target: &str,
        source: &str,
        timer: &TimeoutTimer,
    ) -> Result<SegmentProperties> {
        let target_meta = self.mapper.get_or_assign(target, timer.remaining()).await?;
        let source_meta = self.mapper.get_or_assign(source, timer.remaining()).await?;

        if !source_meta.is_sealed() {
            if source_meta.length() > 0 {
                // The source already holds data, so the merge cannot turn
                // into a delete: enqueue Seal and Merge back to back. The
                // log applies one submitter's operations in submission
                // order, so the merge is valid by the time it applies.
                let seal = self.log.submit(Operation::Seal {
                    segment_id: source_meta.id(),
                });
                let merge = self.log.submit(Operation::Merge {
                    target_id: target_meta.id(),
                    source_id: source_meta.id(),
                });
                match timer.run(seal.wait()).await {
                    Ok(_) => {}
                    // A racing seal got there first; ours is a no-op.
                    Err(Error::SegmentSealed(_)) => {}
                    Err(e) => return Err(e),
                }
                let properties = pre_consumption_properties(&source_meta);
                timer.run(merge.wait()).await?;
                self.cleanup_merged_source(source).await;
                return Ok(properties);
            }
            match self
                .log
                .add(
                    Operation::Seal {
                        segment_id: source_meta.id(),
                    },
                    timer.remaining(),
                )
                .await
            {
                Ok(_) => {}
                Err(Error::SegmentSealed(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // The seal has settled, so the length is final.
        let properties = pre_consumption_properties(&source_meta);
        if source_meta.length() == 0 {
            debug!(
                container_id = self.id(),
                source = %source,
                "Merge source is empty; deleting instead"
            );
            let snapshot = self
                .log
                .remove_segment(source_meta.id(), true, timer.remaining())
                .await?;
            self.spawn_removal_cleanup(source_meta.id(), snapshot.name, true);
            return Ok(properties);
        }

        self.log
            .add(
                Operation::Merge {
                    target_id: target_meta.id(),
                    source_id: source_meta.id(),
                },
                timer.remaining(),
            )
            .await?;
        self.cleanup_merged_source(source).await;
        Ok(properties)
    }

    /// Drops the consumed source's out-of-band documents. Best effort; an
    /// orphaned document is harmless.
    async fn cleanup_merged_source(&self, name: &str) {
        if let Err(e) = self.state_store.remove(name, BACKGROUND_TIMEOUT).await {
            warn!(
                container_id = self.id(),
                segment = %name,
                error = %e,
                "Failed to remove merged source's state document"
            );
        }
        if let Err(e) = self
            .attribute_index
            .delete(name, BACKGROUND_TIMEOUT)
            .await
        {
            warn!(
                container_id = self.id(),
                segment = %name,
                error = %e,
                "Failed to remove merged source's attribute document"
            );
        }
    }

    /// Snapshots of every active segment.
    pub fn active_segments(&self) -> Vec<SegmentProperties> {
        self.metadata.active_segments()
    }

    /// An id-bound handle for repeated operations against one segment,
    /// skipping name resolution on every call.
    pub async fn for_segment(
        self: &Arc<Self>,
        name: &str,
        timeout: Duration,
    ) -> Result<DirectSegment> {
        self.check_running()?;
        let meta = self.mapper.get_or_assign(name, timeout).await?;
        Ok(DirectSegment {
            container: Arc::clone(self),
            meta,
        })
    }

    // ========================================================================
    // Attribute protocols
    // ========================================================================

    /// The attribute-caching fetch. Retries under the configured backoff
    /// when a write-back loses the set-if-absent race.
    async fn fetch_attributes(
        &self,
        meta: &Arc<SegmentMetadata>,
        ids: &[AttributeId],
        cache: bool,
        timer: &TimeoutTimer,
    ) -> Result<HashMap<AttributeId, i64>> {
        self.config
            .cache_attributes_retry
            .run(Error::is_bad_attribute_update, || {
                self.fetch_attributes_once(meta, ids, cache, timer)
            })
            .await
    }

    async fn fetch_attributes_once(
        &self,
        meta: &Arc<SegmentMetadata>,
        ids: &[AttributeId],
        cache: bool,
        timer: &TimeoutTimer,
    ) -> Result<HashMap<AttributeId, i64>> {
        let (mut values, missing) = meta.partition_attributes(ids);
        if !missing.is_empty() {
            let handle = self.attribute_index.for_segment(meta.id(), meta.name());
            let mut found = handle.get(&missing, timer.remaining()).await?;
            // Ids the index knows nothing about are confirmed absent.
            for id in &missing {
                found.entry(*id).or_insert(NULL_ATTRIBUTE_VALUE);
            }
            if cache && !meta.is_sealed() {
                let attribute_updates: Vec<_> = found
                    .iter()
                    .map(|(id, value)| AttributeUpdate::set_if_absent(*id, *value))
                    .collect();
                // A concurrent cacher or writer winning the race fails this
                // conditionally; the retry policy re-runs the whole fetch.
                self.log
                    .add(
                        Operation::UpdateAttributes {
                            segment_id: meta.id(),
                            attribute_updates,
                        },
                        timer.remaining(),
                    )
                    .await?;
            }
            values.extend(found);
        }
        values.retain(|_, value| *value != NULL_ATTRIBUTE_VALUE);
        Ok(values)
    }

    /// Submits a mutating operation, repairing a missing-precondition
    /// failure once: the operation's extended attributes are loaded into the
    /// cache and the operation is resubmitted.
    async fn add_with_attribute_repair(
        &self,
        meta: &Arc<SegmentMetadata>,
        operation: Operation,
        timer: &TimeoutTimer,
    ) -> Result<AppliedOperation> {
        match self.log.add(operation.clone(), timer.remaining()).await {
            Err(e) if e.is_previous_value_missing() => {
                let ids: Vec<AttributeId> = operation
                    .attribute_updates()
                    .iter()
                    .map(|u| u.id)
                    .filter(AttributeId::is_extended)
                    .collect();
                debug!(
                    container_id = self.id(),
                    segment_id = meta.id(),
                    attributes = ids.len(),
                    "Loading attributes to repair a missing-precondition failure"
                );
                self.fetch_attributes(meta, &ids, true, timer).await?;
                self.log.add(operation, timer.remaining()).await
            }
            other => other,
        }
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// One eviction sweep: persists state for idle fully-flushed segments,
    /// unmaps them through the log, and sweeps consumed merge sources.
    /// Returns how many segments were evicted.
    pub(crate) async fn evict_idle_segments(&self) -> Result<usize> {
        if self.log.is_offline() {
            return Ok(0);
        }
        let candidates = self.metadata.eviction_candidates(
            self.config.segment_metadata_expiration,
            self.config.max_concurrent_eviction_count,
        );
        let mut evicted = 0usize;
        for meta in candidates {
            if !meta.is_merged() {
                // State first: a crash after the put re-evicts harmlessly, a
                // crash before it loses nothing.
                let snapshot = meta.snapshot();
                let state = SegmentState {
                    segment_id: meta.id(),
                    name: snapshot.name.clone(),
                    start_offset: snapshot.start_offset,
                    attributes: snapshot.attributes,
                };
                self.state_store
                    .put(meta.name(), &state, BACKGROUND_TIMEOUT)
                    .await?;
            }
            match self
                .log
                .remove_segment(meta.id(), meta.is_merged(), BACKGROUND_TIMEOUT)
                .await
            {
                Ok(snapshot) => {
                    self.spawn_removal_cleanup(meta.id(), snapshot.name, false);
                    evicted += 1;
                }
                // Raced with a delete or another sweep.
                Err(Error::SegmentNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if evicted > 0 {
            info!(container_id = self.id(), evicted, "Evicted segment metadata");
        }
        Ok(evicted)
    }

    /// Phase two of removal: physical cleanup (delete path only) followed by
    /// the removal notification fan-out. Runs in the background; the caller
    /// already holds the exactly-once gate (the metadata unmap).
    fn spawn_removal_cleanup(&self, segment_id: u64, name: String, physical: bool) {
        let container_id = self.id();
        let storage = Arc::clone(&self.storage);
        let attribute_index = Arc::clone(&self.attribute_index);
        let state_store = Arc::clone(&self.state_store);
        let read_index = Arc::clone(&self.read_index);
        let extensions = Arc::clone(&self.extensions);
        tokio::spawn(async move {
            if physical {
                match storage.open_write(&name).await {
                    Ok(handle) => {
                        if let Err(e) = storage.delete(&handle).await {
                            if !matches!(e, Error::SegmentNotFound(_)) {
                                warn!(
                                    container_id,
                                    segment = %name,
                                    error = %e,
                                    "Failed to delete segment from storage"
                                );
                            }
                        }
                    }
                    Err(Error::SegmentNotFound(_)) => {}
                    Err(e) => {
                        warn!(
                            container_id,
                            segment = %name,
                            error = %e,
                            "Failed to open segment for deletion"
                        );
                    }
                }
                if let Err(e) = attribute_index.delete(&name, BACKGROUND_TIMEOUT).await {
                    warn!(
                        container_id,
                        segment = %name,
                        error = %e,
                        "Failed to delete attribute document"
                    );
                }
                if let Err(e) = state_store.remove(&name, BACKGROUND_TIMEOUT).await {
                    warn!(
                        container_id,
                        segment = %name,
                        error = %e,
                        "Failed to remove state document"
                    );
                }
            }
            read_index.cleanup(&[segment_id]);
            attribute_index.cleanup(&[segment_id]);
            for extension in extensions.iter() {
                extension.notify_segment_removed(segment_id, &name).await;
            }
            debug!(
                container_id,
                segment_id,
                segment = %name,
                physical,
                "Segment removal cleanup complete"
            );
        });
    }
}

/// The source's properties as a caller should see them at merge time: the
/// seal has settled but the consumption itself is not part of the snapshot.
fn pre_consumption_properties(meta: &Arc<SegmentMetadata>) -> SegmentProperties {
    let mut properties = meta.properties();
    properties.sealed = true;
    properties.merged = false;
    properties.deleted = false;
    properties
}

/// Combines component failures into one error: the first is the primary
/// cause, the rest ride as suppressed.
fn aggregate_failure(causes: Vec<Error>) -> Option<Error> {
    let mut iter = causes.into_iter();
    let primary = iter.next()?;
    let extra: Vec<Arc<Error>> = iter.map(Arc::new).collect();
    Some(match primary {
        Error::Component {
            component,
            cause,
            mut suppressed,
        } => {
            suppressed.extend(extra);
            Error::Component {
                component,
                cause,
                suppressed,
            }
        }
        other if extra.is_empty() => other,
        other => Error::Component {
            component: "segment-container",
            cause: Arc::new(other),
            suppressed: extra,
        },
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// DirectSegment
// ============================================================================

/// An id-bound handle to one segment. Operations skip name resolution; a
/// segment that is merged or deleted underneath the handle fails with
/// `SegmentMerged` / `SegmentNotFound` from the log.
pub struct DirectSegment {
    container: Arc<SegmentContainer>,
    meta: Arc<SegmentMetadata>,
}

impl DirectSegment {
    pub fn segment_id(&self) -> u64 {
        self.meta.id()
    }

    pub fn name(&self) -> &str {
        self.meta.name()
    }

    pub fn info(&self) -> SegmentProperties {
        self.meta.properties()
    }

    pub async fn append(
        &self,
        data: Bytes,
        attribute_updates: Vec<AttributeUpdate>,
        timeout: Duration,
    ) -> Result<u64> {
        self.container.check_running()?;
        self.container.log_request("append", self.meta.name());
        let timer = TimeoutTimer::new(timeout);
        self.meta.touch();
        let operation = Operation::Append {
            segment_id: self.meta.id(),
            expected_offset: None,
            data,
            attribute_updates,
        };
        let applied = self
            .container
            .add_with_attribute_repair(&self.meta, operation, &timer)
            .await?;
        Ok(applied.segment_offset)
    }

    pub async fn update_attributes(
        &self,
        attribute_updates: Vec<AttributeUpdate>,
        timeout: Duration,
    ) -> Result<()> {
        self.container.check_running()?;
        self.container
            .log_request("update_attributes", self.meta.name());
        let timer = TimeoutTimer::new(timeout);
        self.meta.touch();
        let operation = Operation::UpdateAttributes {
            segment_id: self.meta.id(),
            attribute_updates,
        };
        self.container
            .add_with_attribute_repair(&self.meta, operation, &timer)
            .await?;
        Ok(())
    }

    pub async fn get_attributes(
        &self,
        ids: &[AttributeId],
        cache: bool,
        timeout: Duration,
    ) -> Result<HashMap<AttributeId, i64>> {
        self.container.check_running()?;
        self.container
            .log_request("get_attributes", self.meta.name());
        let timer = TimeoutTimer::new(timeout);
        self.meta.touch();
        self.container
            .fetch_attributes(&self.meta, ids, cache, &timer)
            .await
    }

    pub async fn read(&self, offset: u64, max_length: usize) -> Result<ReadResult> {
        self.container.check_running()?;
        self.container.log_request("read", self.meta.name());
        self.meta.touch();
        self.container
            .read_index
            .read(self.meta.id(), offset, max_length)
    }

    pub async fn seal(&self, timeout: Duration) -> Result<u64> {
        self.container.check_running()?;
        self.container.log_request("seal", self.meta.name());
        let applied = self
            .container
            .log
            .add(
                Operation::Seal {
                    segment_id: self.meta.id(),
                },
                timeout,
            )
            .await?;
        Ok(applied.segment_offset)
    }

    pub async fn truncate(&self, offset: u64, timeout: Duration) -> Result<()> {
        self.container.check_running()?;
        self.container.log_request("truncate", self.meta.name());
        self.container
            .log
            .add(
                Operation::Truncate {
                    segment_id: self.meta.id(),
                    offset,
                },
                timeout,
            )
            .await?;
        Ok(())
    }
}
