//! The journal-backed [`OperationLog`] implementation.
//!
//! One applier task owns the journal and the right to mutate metadata. Each
//! loop iteration drains a batch of commands, and for each command in order:
//! encodes the journal record, applies it through the [`OperationApplier`],
//! and stages the record. The batch then commits with a single write (and
//! sync, when configured), after which every receipt in the batch resolves
//! and applied entries are pushed to the tail subscription. Callers are
//! acknowledged only after the commit, so a crash between apply and commit
//! loses nothing that was ever acknowledged: recovery replays the journal's
//! clean prefix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use segvault_core::{
    AppliedOperation, Error, Operation, Result, SegmentSnapshot, ServiceState, ServiceStatus,
    TimeoutTimer,
};

use crate::journal::{Journal, JournalConfig, JournalRecord};
use crate::{AppliedLogEntry, OperationApplier, OperationLog, OperationReceipt};

/// Most commands folded into one journal commit.
const MAX_BATCH: usize = 256;

// ============================================================================
// Commands
// ============================================================================

enum LogCommand {
    Submit {
        operation: Operation,
        ack: oneshot::Sender<Result<AppliedOperation>>,
    },
    Map {
        snapshot: SegmentSnapshot,
        ack: oneshot::Sender<Result<()>>,
    },
    Unmap {
        segment_id: u64,
        deleted: bool,
        ack: oneshot::Sender<Result<SegmentSnapshot>>,
    },
    Barrier {
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

impl LogCommand {
    /// Resolves the command's waiter with `err` without doing any work.
    fn reject(self, err: Error) {
        match self {
            LogCommand::Submit { ack, .. } => {
                let _ = ack.send(Err(err));
            }
            LogCommand::Map { ack, .. } => {
                let _ = ack.send(Err(err));
            }
            LogCommand::Unmap { ack, .. } => {
                let _ = ack.send(Err(err));
            }
            LogCommand::Barrier { ack } => {
                let _ = ack.send(Err(err));
            }
            LogCommand::Shutdown { ack } => {
                let _ = ack.send(());
            }
        }
    }
}

// ============================================================================
// DurableLog
// ============================================================================

/// Durable log for one container. See the module docs for the task design.
pub struct DurableLog {
    container_id: u32,
    config: JournalConfig,
    applier: Arc<dyn OperationApplier>,
    status: Arc<ServiceStatus>,
    online: watch::Sender<bool>,
    epoch: AtomicU64,
    cmd_tx: mpsc::UnboundedSender<LogCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<LogCommand>>>,
    tail_tx: mpsc::UnboundedSender<AppliedLogEntry>,
    tail_rx: Mutex<Option<mpsc::UnboundedReceiver<AppliedLogEntry>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DurableLog {
    pub fn new(container_id: u32, config: JournalConfig, applier: Arc<dyn OperationApplier>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();
        Self {
            container_id,
            config,
            applier,
            status: Arc::new(ServiceStatus::new("durable-log")),
            online: watch::Sender::new(false),
            epoch: AtomicU64::new(0),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            tail_tx,
            tail_rx: Mutex::new(Some(tail_rx)),
            task: Mutex::new(None),
        }
    }

    /// Rejects work unless the log is online.
    fn check_online(&self) -> Result<()> {
        match self.status.state() {
            ServiceState::New | ServiceState::Starting => Err(Error::ContainerOffline {
                container_id: self.container_id,
            }),
            ServiceState::Running => Ok(()),
            _ => Err(closed()),
        }
    }

    async fn recover_and_spawn(&self) -> Result<()> {
        let rx = lock(&self.cmd_rx).take().ok_or_else(|| {
            Error::InvalidOperation("durable log cannot be started twice".to_string())
        })?;

        let (mut journal, records) = Journal::open(&self.config, self.container_id).await?;

        let mut max_epoch = 0u64;
        let mut next_sequence = 1u64;
        let mut replayed_ops = 0usize;
        for record in &records {
            match record {
                JournalRecord::Epoch { epoch } => max_epoch = max_epoch.max(*epoch),
                JournalRecord::Map { snapshot } => {
                    self.applier
                        .apply_map(snapshot)
                        .map_err(|e| replay_error("map", e))?;
                }
                JournalRecord::Unmap {
                    segment_id,
                    deleted,
                } => {
                    self.applier
                        .apply_unmap(*segment_id, *deleted)
                        .map_err(|e| replay_error("unmap", e))?;
                }
                JournalRecord::Op {
                    sequence,
                    operation,
                } => {
                    let segment_offset = self
                        .applier
                        .apply_operation(*sequence, operation)
                        .map_err(|e| replay_error(operation.kind(), e))?;
                    next_sequence = sequence + 1;
                    replayed_ops += 1;
                    let _ = self.tail_tx.send(AppliedLogEntry {
                        sequence: *sequence,
                        operation: operation.clone(),
                        segment_offset,
                    });
                }
            }
        }

        let epoch = max_epoch + 1;
        journal.append(&JournalRecord::Epoch { epoch })?;
        journal.commit().await?;
        self.epoch.store(epoch, Ordering::SeqCst);

        info!(
            container_id = self.container_id,
            epoch,
            records = records.len(),
            operations = replayed_ops,
            "Durable log recovered"
        );

        let task = LogTask {
            container_id: self.container_id,
            journal,
            applier: self.applier.clone(),
            status: self.status.clone(),
            tail_tx: self.tail_tx.clone(),
            next_sequence,
        };
        *lock(&self.task) = Some(tokio::spawn(task.run(rx)));
        Ok(())
    }
}

#[async_trait]
impl OperationLog for DurableLog {
    async fn start(&self) -> Result<()> {
        self.status.transition(ServiceState::Starting)?;
        match self.recover_and_spawn().await {
            Ok(()) => {
                self.status.transition(ServiceState::Running)?;
                // `send` is a no-op without receivers; the flag must flip
                // even when nobody has subscribed yet.
                self.online.send_replace(true);
                Ok(())
            }
            Err(e) => {
                error!(
                    container_id = self.container_id,
                    error = %e,
                    "Durable log failed to start"
                );
                self.status.fail(e.clone());
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if !self.status.try_transition(ServiceState::Stopping) {
            // Someone else is stopping (or already stopped) the log.
            self.status.wait_terminal().await;
            return Ok(());
        }
        self.online.send_replace(false);

        let task = lock(&self.task).take();
        if let Some(task) = task {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.cmd_tx.send(LogCommand::Shutdown { ack: ack_tx }).is_ok() {
                let _ = ack_rx.await;
            }
            let _ = task.await;
        }

        // The applier task records its own failure; anything else is clean.
        self.status.try_transition(ServiceState::Terminated);
        info!(container_id = self.container_id, "Durable log stopped");
        Ok(())
    }

    fn status(&self) -> &ServiceStatus {
        &self.status
    }

    fn is_offline(&self) -> bool {
        !*self.online.borrow()
    }

    async fn await_online(&self) -> Result<()> {
        let mut online = self.online.subscribe();
        let mut state = self.status.subscribe();
        loop {
            if *online.borrow() {
                return Ok(());
            }
            if state.borrow().is_terminal() {
                return Err(self.status.failure_cause().unwrap_or_else(closed));
            }
            tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        return Err(closed());
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(closed());
                    }
                }
            }
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn submit(&self, operation: Operation) -> OperationReceipt {
        if let Err(e) = self.check_online() {
            return OperationReceipt::ready(Err(e));
        }
        let (ack, receipt) = OperationReceipt::channel();
        if self
            .cmd_tx
            .send(LogCommand::Submit { operation, ack })
            .is_err()
        {
            return OperationReceipt::ready(Err(closed()));
        }
        receipt
    }

    async fn register_segment(&self, snapshot: SegmentSnapshot, timeout: Duration) -> Result<()> {
        self.check_online()?;
        let (ack, rx) = oneshot::channel();
        self.cmd_tx
            .send(LogCommand::Map { snapshot, ack })
            .map_err(|_| closed())?;
        TimeoutTimer::new(timeout)
            .run(async {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(closed()),
                }
            })
            .await
    }

    async fn remove_segment(
        &self,
        segment_id: u64,
        deleted: bool,
        timeout: Duration,
    ) -> Result<SegmentSnapshot> {
        self.check_online()?;
        let (ack, rx) = oneshot::channel();
        self.cmd_tx
            .send(LogCommand::Unmap {
                segment_id,
                deleted,
                ack,
            })
            .map_err(|_| closed())?;
        TimeoutTimer::new(timeout)
            .run(async {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(closed()),
                }
            })
            .await
    }

    async fn barrier(&self, timeout: Duration) -> Result<()> {
        self.check_online()?;
        let (ack, rx) = oneshot::channel();
        self.cmd_tx
            .send(LogCommand::Barrier { ack })
            .map_err(|_| closed())?;
        TimeoutTimer::new(timeout)
            .run(async {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(closed()),
                }
            })
            .await
    }

    fn take_tail(&self) -> Option<mpsc::UnboundedReceiver<AppliedLogEntry>> {
        lock(&self.tail_rx).take()
    }
}

impl Drop for DurableLog {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

// ============================================================================
// Applier task
// ============================================================================

/// A command that applied successfully and is waiting for the batch commit
/// before its waiter may learn the outcome.
enum PendingAck {
    Submit {
        ack: oneshot::Sender<Result<AppliedOperation>>,
        applied: AppliedOperation,
    },
    Map {
        ack: oneshot::Sender<Result<()>>,
    },
    Unmap {
        ack: oneshot::Sender<Result<SegmentSnapshot>>,
        snapshot: SegmentSnapshot,
    },
    Barrier {
        ack: oneshot::Sender<Result<()>>,
    },
}

impl PendingAck {
    fn resolve(self) {
        match self {
            PendingAck::Submit { ack, applied } => {
                let _ = ack.send(Ok(applied));
            }
            PendingAck::Map { ack } => {
                let _ = ack.send(Ok(()));
            }
            PendingAck::Unmap { ack, snapshot } => {
                let _ = ack.send(Ok(snapshot));
            }
            PendingAck::Barrier { ack } => {
                let _ = ack.send(Ok(()));
            }
        }
    }

    fn fail(self, err: Error) {
        match self {
            PendingAck::Submit { ack, .. } => {
                let _ = ack.send(Err(err));
            }
            PendingAck::Map { ack } => {
                let _ = ack.send(Err(err));
            }
            PendingAck::Unmap { ack, .. } => {
                let _ = ack.send(Err(err));
            }
            PendingAck::Barrier { ack } => {
                let _ = ack.send(Err(err));
            }
        }
    }
}

struct LogTask {
    container_id: u32,
    journal: Journal,
    applier: Arc<dyn OperationApplier>,
    status: Arc<ServiceStatus>,
    tail_tx: mpsc::UnboundedSender<AppliedLogEntry>,
    next_sequence: u64,
}

impl LogTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
        while let Some(first) = rx.recv().await {
            let mut batch = Vec::with_capacity(8);
            batch.push(first);
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(cmd) => batch.push(cmd),
                    Err(_) => break,
                }
            }

            let mut pending: Vec<PendingAck> = Vec::with_capacity(batch.len());
            let mut tail: Vec<AppliedLogEntry> = Vec::new();
            let mut shutdown: Option<oneshot::Sender<()>> = None;

            let mut commands = batch.into_iter();
            for cmd in commands.by_ref() {
                match cmd {
                    LogCommand::Submit { operation, ack } => {
                        let sequence = self.next_sequence;
                        let record = JournalRecord::Op {
                            sequence,
                            operation: operation.clone(),
                        };
                        let frame = match Journal::encode(&record) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let _ = ack.send(Err(e));
                                continue;
                            }
                        };
                        match self.applier.apply_operation(sequence, &operation) {
                            Ok(segment_offset) => {
                                self.journal.stage(frame);
                                self.next_sequence += 1;
                                tail.push(AppliedLogEntry {
                                    sequence,
                                    operation,
                                    segment_offset,
                                });
                                pending.push(PendingAck::Submit {
                                    ack,
                                    applied: AppliedOperation {
                                        sequence,
                                        segment_offset,
                                    },
                                });
                            }
                            // Rejected operations are never journaled; the
                            // caller can learn that before the batch commits.
                            Err(e) => {
                                let _ = ack.send(Err(e));
                            }
                        }
                    }
                    LogCommand::Map { snapshot, ack } => {
                        let record = JournalRecord::Map {
                            snapshot: snapshot.clone(),
                        };
                        let frame = match Journal::encode(&record) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let _ = ack.send(Err(e));
                                continue;
                            }
                        };
                        match self.applier.apply_map(&snapshot) {
                            Ok(()) => {
                                self.journal.stage(frame);
                                pending.push(PendingAck::Map { ack });
                            }
                            Err(e) => {
                                let _ = ack.send(Err(e));
                            }
                        }
                    }
                    LogCommand::Unmap {
                        segment_id,
                        deleted,
                        ack,
                    } => {
                        let record = JournalRecord::Unmap {
                            segment_id,
                            deleted,
                        };
                        let frame = match Journal::encode(&record) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let _ = ack.send(Err(e));
                                continue;
                            }
                        };
                        match self.applier.apply_unmap(segment_id, deleted) {
                            Ok(snapshot) => {
                                self.journal.stage(frame);
                                pending.push(PendingAck::Unmap { ack, snapshot });
                            }
                            Err(e) => {
                                let _ = ack.send(Err(e));
                            }
                        }
                    }
                    LogCommand::Barrier { ack } => {
                        pending.push(PendingAck::Barrier { ack });
                    }
                    LogCommand::Shutdown { ack } => {
                        shutdown = Some(ack);
                        break;
                    }
                }
            }

            if let Err(e) = self.journal.commit().await {
                error!(
                    container_id = self.container_id,
                    error = %e,
                    "Journal commit failed, stopping durable log"
                );
                for waiter in pending {
                    waiter.fail(e.clone());
                }
                for cmd in commands {
                    cmd.reject(e.clone());
                }
                if let Some(ack) = shutdown {
                    let _ = ack.send(());
                }
                self.status.fail(e);
                drain_reject(rx);
                return;
            }

            for waiter in pending {
                waiter.resolve();
            }
            for entry in tail {
                let _ = self.tail_tx.send(entry);
            }

            if let Some(ack) = shutdown {
                // Commands that slipped in behind the shutdown get closed
                // out instead of applied.
                for cmd in commands {
                    cmd.reject(closed());
                }
                drain_reject(rx);
                let _ = ack.send(());
                return;
            }
        }
    }
}

fn drain_reject(mut rx: mpsc::UnboundedReceiver<LogCommand>) {
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        cmd.reject(closed());
    }
}

fn closed() -> Error {
    Error::ObjectClosed {
        name: "durable log".to_string(),
    }
}

fn replay_error(kind: &str, err: Error) -> Error {
    Error::JournalCorrupted(format!("replay of {kind} record failed: {err}"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct TestSegment {
        name: String,
        start_offset: u64,
        length: u64,
        sealed: bool,
    }

    /// Minimal metadata stand-in: enough state to validate and account for
    /// operations the way the container does.
    #[derive(Default)]
    struct TestApplier {
        segments: Mutex<HashMap<u64, TestSegment>>,
        order: Mutex<Vec<u64>>,
    }

    impl TestApplier {
        fn length(&self, id: u64) -> Option<u64> {
            lock(&self.segments).get(&id).map(|s| s.length)
        }

        fn applied_sequences(&self) -> Vec<u64> {
            lock(&self.order).clone()
        }
    }

    impl OperationApplier for TestApplier {
        fn apply_operation(&self, sequence: u64, operation: &Operation) -> Result<u64> {
            let mut segments = lock(&self.segments);
            let offset = match operation {
                Operation::Append {
                    segment_id,
                    expected_offset,
                    data,
                    ..
                } => {
                    let segment = segments
                        .get_mut(segment_id)
                        .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?;
                    if segment.sealed {
                        return Err(Error::SegmentSealed(*segment_id));
                    }
                    if let Some(expected) = expected_offset {
                        if *expected != segment.length {
                            return Err(Error::BadOffset {
                                segment_id: *segment_id,
                                expected: *expected,
                                actual: segment.length,
                            });
                        }
                    }
                    let offset = segment.length;
                    segment.length += data.len() as u64;
                    offset
                }
                Operation::UpdateAttributes { segment_id, .. } => {
                    segments
                        .get(segment_id)
                        .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?
                        .length
                }
                Operation::Seal { segment_id } => {
                    let segment = segments
                        .get_mut(segment_id)
                        .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?;
                    if segment.sealed {
                        return Err(Error::SegmentSealed(*segment_id));
                    }
                    segment.sealed = true;
                    segment.length
                }
                Operation::Truncate { segment_id, offset } => {
                    let segment = segments
                        .get_mut(segment_id)
                        .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?;
                    segment.start_offset = *offset;
                    *offset
                }
                Operation::Merge {
                    target_id,
                    source_id,
                } => {
                    let source_len = {
                        let source = segments
                            .get(source_id)
                            .ok_or_else(|| Error::SegmentNotFound(source_id.to_string()))?;
                        if !source.sealed {
                            return Err(Error::InvalidOperation("source not sealed".into()));
                        }
                        source.length
                    };
                    let target = segments
                        .get_mut(target_id)
                        .ok_or_else(|| Error::SegmentNotFound(target_id.to_string()))?;
                    let offset = target.length;
                    target.length += source_len;
                    segments.remove(source_id);
                    offset
                }
            };
            lock(&self.order).push(sequence);
            Ok(offset)
        }

        fn apply_map(&self, snapshot: &SegmentSnapshot) -> Result<()> {
            let mut segments = lock(&self.segments);
            segments.insert(
                snapshot.segment_id,
                TestSegment {
                    name: snapshot.name.clone(),
                    start_offset: snapshot.start_offset,
                    length: snapshot.length,
                    sealed: snapshot.sealed,
                },
            );
            Ok(())
        }

        fn apply_unmap(&self, segment_id: u64, _deleted: bool) -> Result<SegmentSnapshot> {
            let mut segments = lock(&self.segments);
            let segment = segments
                .remove(&segment_id)
                .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?;
            Ok(SegmentSnapshot {
                segment_id,
                name: segment.name,
                start_offset: segment.start_offset,
                length: segment.length,
                sealed: segment.sealed,
                attributes: Vec::new(),
            })
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config(dir: &TempDir) -> JournalConfig {
        JournalConfig {
            directory: dir.path().to_path_buf(),
            sync_on_commit: true,
        }
    }

    fn append(segment_id: u64, data: &'static [u8]) -> Operation {
        Operation::Append {
            segment_id,
            expected_offset: None,
            data: Bytes::from_static(data),
            attribute_updates: Vec::new(),
        }
    }

    async fn started_log(dir: &TempDir, applier: Arc<TestApplier>) -> Arc<DurableLog> {
        let log = Arc::new(DurableLog::new(0, test_config(dir), applier));
        log.start().await.unwrap();
        log
    }

    #[tokio::test]
    async fn test_started_log_is_online_without_subscribers() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = Arc::new(DurableLog::new(0, test_config(&dir), applier));

        assert!(log.is_offline());
        log.start().await.unwrap();
        assert!(!log.is_offline());
        log.await_online().await.unwrap();

        log.stop().await.unwrap();
        assert!(log.is_offline());
    }

    #[tokio::test]
    async fn test_operations_apply_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = started_log(&dir, applier.clone()).await;

        log.register_segment(SegmentSnapshot::empty(1, "seg1"), TIMEOUT)
            .await
            .unwrap();

        let first = log.submit(append(1, b"0123456789"));
        let second = log.submit(append(1, b"01234"));

        let second = second.wait().await.unwrap();
        let first = first.wait().await.unwrap();

        assert_eq!(first.segment_offset, 0);
        assert_eq!(second.segment_offset, 10);
        assert!(first.sequence < second.sequence);
        assert_eq!(applier.length(1), Some(15));
        assert_eq!(applier.applied_sequences(), vec![1, 2]);

        log.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_operations_are_not_journaled() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = started_log(&dir, applier.clone()).await;

        let err = log.add(append(42, b"data"), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::SegmentNotFound(_)));
        log.stop().await.unwrap();

        // A fresh instance over the same journal must see nothing.
        let applier2 = Arc::new(TestApplier::default());
        let log2 = started_log(&dir, applier2.clone()).await;
        assert!(applier2.applied_sequences().is_empty());
        log2.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_replays_journal_and_bumps_epoch() {
        let dir = TempDir::new().unwrap();

        let applier = Arc::new(TestApplier::default());
        let log = started_log(&dir, applier.clone()).await;
        assert_eq!(log.epoch(), 1);

        log.register_segment(SegmentSnapshot::empty(1, "seg1"), TIMEOUT)
            .await
            .unwrap();
        log.add(append(1, b"0123456789"), TIMEOUT).await.unwrap();
        log.add(append(1, b"01234"), TIMEOUT).await.unwrap();
        log.add(Operation::Seal { segment_id: 1 }, TIMEOUT)
            .await
            .unwrap();
        log.stop().await.unwrap();
        drop(log);

        let applier2 = Arc::new(TestApplier::default());
        let log2 = started_log(&dir, applier2.clone()).await;
        assert_eq!(log2.epoch(), 2);
        assert_eq!(applier2.length(1), Some(15));
        assert_eq!(applier2.applied_sequences(), vec![1, 2, 3]);

        // Sequences continue after the recovered high-water mark.
        let applied = log2
            .add(
                Operation::Truncate {
                    segment_id: 1,
                    offset: 5,
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(applied.sequence, 4);

        log2.stop().await.unwrap();
        drop(log2);

        let applier3 = Arc::new(TestApplier::default());
        let log3 = started_log(&dir, applier3).await;
        assert_eq!(log3.epoch(), 3);
        log3.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_until_started_and_closed_after_stop() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = Arc::new(DurableLog::new(0, test_config(&dir), applier));

        assert!(log.is_offline());
        let err = log.submit(append(1, b"x")).wait().await.unwrap_err();
        assert!(matches!(err, Error::ContainerOffline { .. }));

        log.start().await.unwrap();
        assert!(!log.is_offline());
        log.stop().await.unwrap();

        let err = log.submit(append(1, b"x")).wait().await.unwrap_err();
        assert!(matches!(err, Error::ObjectClosed { .. }));
    }

    #[tokio::test]
    async fn test_await_online_wakes_waiters() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = Arc::new(DurableLog::new(0, test_config(&dir), applier));

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.await_online().await })
        };
        tokio::task::yield_now().await;
        log.start().await.unwrap();
        waiter.await.unwrap().unwrap();
        log.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_barrier_settles_prior_submissions() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = started_log(&dir, applier.clone()).await;

        log.register_segment(SegmentSnapshot::empty(1, "seg1"), TIMEOUT)
            .await
            .unwrap();
        for _ in 0..10 {
            // Receipts deliberately dropped; the barrier is the only wait.
            let _ = log.submit(append(1, b"abc"));
        }
        log.barrier(TIMEOUT).await.unwrap();
        assert_eq!(applier.length(1), Some(30));
        log.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_segment_returns_final_snapshot() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = started_log(&dir, applier.clone()).await;

        log.register_segment(SegmentSnapshot::empty(9, "victim"), TIMEOUT)
            .await
            .unwrap();
        log.add(append(9, b"abcde"), TIMEOUT).await.unwrap();

        let snapshot = log.remove_segment(9, true, TIMEOUT).await.unwrap();
        assert_eq!(snapshot.name, "victim");
        assert_eq!(snapshot.length, 5);
        assert!(applier.length(9).is_none());

        let err = log.remove_segment(9, true, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::SegmentNotFound(_)));

        log.stop().await.unwrap();

        // Removal is durable: the journal replays to an empty registry.
        let applier2 = Arc::new(TestApplier::default());
        let log2 = started_log(&dir, applier2.clone()).await;
        assert!(applier2.length(9).is_none());
        log2.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tail_subscription_reports_applied_entries() {
        let dir = TempDir::new().unwrap();
        let applier = Arc::new(TestApplier::default());
        let log = started_log(&dir, applier).await;
        let mut tail = log.take_tail().unwrap();
        assert!(log.take_tail().is_none());

        log.register_segment(SegmentSnapshot::empty(1, "seg1"), TIMEOUT)
            .await
            .unwrap();
        log.add(append(1, b"0123456789"), TIMEOUT).await.unwrap();
        log.add(append(1, b"01234"), TIMEOUT).await.unwrap();

        let first = tail.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.segment_offset, 0);
        assert!(matches!(first.operation, Operation::Append { .. }));

        let second = tail.recv().await.unwrap();
        assert_eq!(second.segment_offset, 10);

        log.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tail_taken_after_recovery_sees_replayed_history() {
        let dir = TempDir::new().unwrap();

        let applier = Arc::new(TestApplier::default());
        let log = started_log(&dir, applier).await;
        log.register_segment(SegmentSnapshot::empty(1, "seg1"), TIMEOUT)
            .await
            .unwrap();
        log.add(append(1, b"0123456789"), TIMEOUT).await.unwrap();
        log.stop().await.unwrap();
        drop(log);

        let applier2 = Arc::new(TestApplier::default());
        let log2 = started_log(&dir, applier2).await;
        let mut tail = log2.take_tail().unwrap();
        let replayed = tail.recv().await.unwrap();
        assert_eq!(replayed.sequence, 1);
        assert_eq!(replayed.segment_offset, 0);
        log2.stop().await.unwrap();
    }
}
