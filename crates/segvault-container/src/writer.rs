//! The storage writer: flushes applied log operations to the durable tier.
//!
//! The writer tails the log's applied-entry subscription, accumulates
//! entries for a short interval, and processes them one segment at a time:
//! contiguous appends aggregate into one storage write, seals become seal
//! markers, merges become physical concats (retiring the read index redirect
//! afterwards), and extended attributes touched by the batch are persisted
//! into the attribute index. Truncations need no storage work because the
//! backend keeps whole objects.
//!
//! Every step is idempotent against what storage already holds, because the
//! tail replays the full journal after a restart: a flush first asks storage
//! how much of the pending range is already durable and writes only the
//! remainder. That makes retries and crash-replays safe without any extra
//! bookkeeping.
//!
//! Each segment's batch runs through the core [`SegmentAggregator`] plus any
//! processors contributed by container extensions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use segvault_core::{
    AttributeId, Error, Operation, Result, RetryPolicy, ServiceState, ServiceStatus,
};
use segvault_storage::{ContainerAttributeIndex, ContainerReadIndex, SharedStorage};
use segvault_wal::AppliedLogEntry;

use crate::extension::ExtensionRegistry;
use crate::metadata::{ContainerMetadata, SegmentMetadata};

/// Deadline for each attribute index write during a flush.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff for transient storage failures during a flush. Exhausting it is
/// fatal to the writer (and therefore to the container).
const FLUSH_RETRY: RetryPolicy = RetryPolicy::exp_backoff(
    Duration::from_millis(100),
    2,
    5,
    Duration::from_secs(2),
);

fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Storage(_) | Error::Io(_) | Error::Timeout(_))
}

// ============================================================================
// Processor contract
// ============================================================================

/// Processes one segment's slice of a flush batch. The core implementation
/// is [`SegmentAggregator`]; extensions contribute additional processors
/// that run after it.
#[async_trait]
pub trait WriterSegmentProcessor: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Handles the segment's applied entries, in log order. Must be
    /// idempotent: the same entries may be seen again after a restart or a
    /// retried flush.
    async fn process(&self, segment_id: u64, entries: &[AppliedLogEntry]) -> Result<()>;
}

// ============================================================================
// SegmentAggregator
// ============================================================================

/// The core flush processor: moves applied bytes, seals, and merges into the
/// durable tier and persists touched extended attributes.
pub struct SegmentAggregator {
    metadata: Arc<ContainerMetadata>,
    storage: SharedStorage,
    attribute_index: Arc<ContainerAttributeIndex>,
    read_index: Arc<ContainerReadIndex>,
}

impl SegmentAggregator {
    pub fn new(
        metadata: Arc<ContainerMetadata>,
        storage: SharedStorage,
        attribute_index: Arc<ContainerAttributeIndex>,
        read_index: Arc<ContainerReadIndex>,
    ) -> Self {
        Self {
            metadata,
            storage,
            attribute_index,
            read_index,
        }
    }

    /// Writes the pending byte range, skipping any prefix storage already
    /// holds.
    async fn flush_bytes(
        &self,
        meta: &Arc<SegmentMetadata>,
        start: u64,
        data: BytesMut,
    ) -> Result<()> {
        let name = meta.name();
        let data = data.freeze();
        let end = start + data.len() as u64;
        let info = match self.storage.get_info(name).await {
            Ok(info) => info,
            Err(Error::SegmentNotFound(_)) => {
                // Deleted while the flush was in flight.
                debug!(segment = %name, "Skipping flush of deleted segment");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if info.length >= end {
            meta.set_storage_length(end);
            return Ok(());
        }
        if info.length < start {
            return Err(Error::Storage(format!(
                "storage length {} of '{name}' is behind flush start {start}",
                info.length
            )));
        }
        let skip = (info.length - start) as usize;
        let handle = self.storage.open_write(name).await?;
        self.storage
            .write(&handle, info.length, data.slice(skip..))
            .await?;
        meta.set_storage_length(end);
        debug!(
            segment = %name,
            offset = info.length,
            bytes = data.len() - skip,
            "Flushed segment bytes"
        );
        Ok(())
    }

    async fn flush_seal(&self, meta: &Arc<SegmentMetadata>) -> Result<()> {
        match self.storage.open_write(meta.name()).await {
            Ok(handle) => self.storage.seal(&handle).await,
            Err(Error::SegmentNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn flush_merge(
        &self,
        target: &Arc<SegmentMetadata>,
        offset: u64,
        source_id: u64,
    ) -> Result<()> {
        let Some(source) = self.metadata.get_by_id(source_id) else {
            debug!(source_id, "Merge source already swept from metadata");
            return Ok(());
        };
        let source_name = source.name().to_string();
        let end = offset + source.length();

        let already_done = match self.storage.get_info(target.name()).await {
            Ok(info) => info.length >= end,
            Err(Error::SegmentNotFound(_)) => {
                debug!(segment = %target.name(), "Merge target deleted before concat");
                source.mark_merge_flushed();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !already_done {
            let handle = self.storage.open_write(target.name()).await?;
            match self.storage.concat(&handle, offset, &source_name).await {
                Ok(()) => {}
                // The source object is gone: a previous run already moved it.
                Err(Error::SegmentNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.read_index.complete_merge(target.id(), &source_name);
        target.set_storage_length(end);
        source.mark_merge_flushed();
        Ok(())
    }
}

#[async_trait]
impl WriterSegmentProcessor for SegmentAggregator {
    fn name(&self) -> &'static str {
        "storage-aggregator"
    }

    async fn process(&self, segment_id: u64, entries: &[AppliedLogEntry]) -> Result<()> {
        let Some(meta) = self.metadata.get_by_id(segment_id) else {
            // Deleted or evicted; eviction implies everything was flushed.
            debug!(segment_id, "Skipping flush batch for unmapped segment");
            return Ok(());
        };

        let mut pending: Option<(u64, BytesMut)> = None;
        let mut touched: HashSet<AttributeId> = HashSet::new();

        for entry in entries {
            match &entry.operation {
                Operation::Append {
                    data,
                    attribute_updates,
                    ..
                } => {
                    touched.extend(
                        attribute_updates
                            .iter()
                            .map(|u| u.id)
                            .filter(|id| id.is_extended()),
                    );
                    match &mut pending {
                        Some((start, buf)) => {
                            debug_assert_eq!(*start + buf.len() as u64, entry.segment_offset);
                            buf.extend_from_slice(data);
                        }
                        None => {
                            pending = Some((entry.segment_offset, BytesMut::from(&data[..])));
                        }
                    }
                }
                Operation::UpdateAttributes {
                    attribute_updates, ..
                } => {
                    touched.extend(
                        attribute_updates
                            .iter()
                            .map(|u| u.id)
                            .filter(|id| id.is_extended()),
                    );
                }
                Operation::Seal { .. } => {
                    if let Some((start, buf)) = pending.take() {
                        self.flush_bytes(&meta, start, buf).await?;
                    }
                    self.flush_seal(&meta).await?;
                }
                Operation::Truncate { .. } => {
                    // Objects are kept whole; truncation is a metadata fact.
                }
                Operation::Merge { source_id, .. } => {
                    if let Some((start, buf)) = pending.take() {
                        self.flush_bytes(&meta, start, buf).await?;
                    }
                    self.flush_merge(&meta, entry.segment_offset, *source_id)
                        .await?;
                }
            }
        }

        if let Some((start, buf)) = pending.take() {
            self.flush_bytes(&meta, start, buf).await?;
        }

        if !touched.is_empty() {
            let ids: Vec<_> = touched.into_iter().collect();
            let values = meta.attribute_values(&ids);
            self.attribute_index
                .for_segment(segment_id, meta.name())
                .put(&values, IO_TIMEOUT)
                .await?;
        }
        Ok(())
    }
}

// ============================================================================
// StorageWriter
// ============================================================================

/// Background service that drains the log tail and drives the processors.
pub struct StorageWriter {
    container_id: u32,
    flush_interval: Duration,
    core: Arc<SegmentAggregator>,
    extensions: Arc<ExtensionRegistry>,
    status: Arc<ServiceStatus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StorageWriter {
    pub fn new(
        container_id: u32,
        flush_interval: Duration,
        core: SegmentAggregator,
        extensions: Arc<ExtensionRegistry>,
    ) -> Self {
        Self {
            container_id,
            flush_interval,
            core: Arc::new(core),
            extensions,
            status: Arc::new(ServiceStatus::new("storage-writer")),
            shutdown: watch::Sender::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    /// Starts the flush loop over the given tail subscription.
    pub fn start(&self, tail: mpsc::UnboundedReceiver<AppliedLogEntry>) -> Result<()> {
        self.status.transition(ServiceState::Starting)?;
        let task = WriterTask {
            container_id: self.container_id,
            flush_interval: self.flush_interval,
            core: Arc::clone(&self.core),
            extensions: Arc::clone(&self.extensions),
            status: Arc::clone(&self.status),
            shutdown: self.shutdown.subscribe(),
        };
        *lock(&self.task) = Some(tokio::spawn(task.run(tail)));
        self.status.transition(ServiceState::Running)?;
        info!(container_id = self.container_id, "Storage writer started");
        Ok(())
    }

    /// Stops the flush loop after one final drain of pending entries.
    pub async fn stop(&self) -> Result<()> {
        if !self.status.try_transition(ServiceState::Stopping) {
            self.status.wait_terminal().await;
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.status.try_transition(ServiceState::Terminated);
        info!(container_id = self.container_id, "Storage writer stopped");
        Ok(())
    }

    /// Hard teardown: aborts the flush loop without draining.
    pub fn close(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.status.try_transition(ServiceState::Stopping);
        self.status.try_transition(ServiceState::Terminated);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct WriterTask {
    container_id: u32,
    flush_interval: Duration,
    core: Arc<SegmentAggregator>,
    extensions: Arc<ExtensionRegistry>,
    status: Arc<ServiceStatus>,
    shutdown: watch::Receiver<bool>,
}

impl WriterTask {
    async fn run(mut self, mut tail: mpsc::UnboundedReceiver<AppliedLogEntry>) {
        let mut pending: Vec<AppliedLogEntry> = Vec::new();
        loop {
            tokio::select! {
                entry = tail.recv() => {
                    match entry {
                        Some(entry) => {
                            pending.push(entry);
                            while let Ok(more) = tail.try_recv() {
                                pending.push(more);
                            }
                        }
                        None => {
                            // Log gone; drain what we have and terminate.
                            self.drain(&mut pending).await;
                            self.status.try_transition(ServiceState::Stopping);
                            self.status.try_transition(ServiceState::Terminated);
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(self.flush_interval), if !pending.is_empty() => {
                    if !self.flush(std::mem::take(&mut pending)).await {
                        return;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        while let Ok(more) = tail.try_recv() {
                            pending.push(more);
                        }
                        self.drain(&mut pending).await;
                        return;
                    }
                }
            }
        }
    }

    async fn drain(&self, pending: &mut Vec<AppliedLogEntry>) {
        if !pending.is_empty() {
            let _ = self.flush(std::mem::take(pending)).await;
        }
    }

    /// Flushes one batch. Returns `false` if the writer died doing it.
    async fn flush(&self, batch: Vec<AppliedLogEntry>) -> bool {
        let mut groups: HashMap<u64, Vec<AppliedLogEntry>> = HashMap::new();
        let mut order: Vec<u64> = Vec::new();
        for entry in batch {
            // A merge needs the source's bytes durable before the concat;
            // flush anything still pending for the source first.
            if let Operation::Merge { source_id, .. } = entry.operation {
                if let Some(source_entries) = groups.remove(&source_id) {
                    if let Err(e) = self.flush_segment(source_id, &source_entries).await {
                        self.fail(e);
                        return false;
                    }
                }
            }
            let segment_id = entry.operation.segment_id();
            if !groups.contains_key(&segment_id) {
                order.push(segment_id);
            }
            groups.entry(segment_id).or_default().push(entry);
        }
        for segment_id in order {
            let Some(entries) = groups.remove(&segment_id) else {
                continue;
            };
            if let Err(e) = self.flush_segment(segment_id, &entries).await {
                self.fail(e);
                return false;
            }
        }
        true
    }

    async fn flush_segment(&self, segment_id: u64, entries: &[AppliedLogEntry]) -> Result<()> {
        FLUSH_RETRY
            .run(is_transient, || async {
                self.core.process(segment_id, entries).await
            })
            .await?;
        for processor in self.extensions.processors(segment_id) {
            if let Err(e) = FLUSH_RETRY
                .run(is_transient, || async {
                    processor.process(segment_id, entries).await
                })
                .await
            {
                warn!(
                    container_id = self.container_id,
                    segment_id,
                    processor = processor.name(),
                    error = %e,
                    "Extension processor failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn fail(&self, cause: Error) {
        error!(
            container_id = self.container_id,
            error = %cause,
            "Storage writer failed"
        );
        self.status.fail(cause.into_component("storage-writer"));
    }
}

// ============================================================================
// Tests
// ============================================================================
