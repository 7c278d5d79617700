//! Container lifecycle tests over a scripted log implementation: submission
//! ordering, offline startup, component-failure propagation, and shutdown
//! aggregation, none of which a well-behaved journal will exhibit on cue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tokio::sync::mpsc;

use segvault_container::{no_extensions, ContainerConfig, SegmentContainer};
use segvault_core::{
    AppliedOperation, Error, Operation, Result, SegmentSnapshot, ServiceState, ServiceStatus,
};
use segvault_wal::{
    AppliedLogEntry, JournalConfig, OperationApplier, OperationLog, OperationReceipt,
};

const TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Scripted log
// ============================================================================

/// An in-process log that applies operations synchronously, records the kind
/// of everything submitted, and can hold submissions unresolved or fail on
/// demand.
struct ScriptedLog {
    status: ServiceStatus,
    online: tokio::sync::watch::Sender<bool>,
    applier: Arc<dyn OperationApplier>,
    sequence: AtomicU64,
    submitted: Mutex<Vec<&'static str>>,
    hold: AtomicBool,
    held: Mutex<VecDeque<(Operation, tokio::sync::oneshot::Sender<Result<AppliedOperation>>)>>,
    fail_on_stop: AtomicBool,
    tail_tx: Mutex<Option<mpsc::UnboundedSender<AppliedLogEntry>>>,
    tail_rx: Mutex<Option<mpsc::UnboundedReceiver<AppliedLogEntry>>>,
}

fn kind(operation: &Operation) -> &'static str {
    match operation {
        Operation::Append { .. } => "append",
        Operation::UpdateAttributes { .. } => "update-attributes",
        Operation::Seal { .. } => "seal",
        Operation::Truncate { .. } => "truncate",
        Operation::Merge { .. } => "merge",
    }
}

impl ScriptedLog {
    fn new(applier: Arc<dyn OperationApplier>, online: bool) -> Arc<Self> {
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            status: ServiceStatus::new("durable-log"),
            online: tokio::sync::watch::Sender::new(online),
            applier,
            sequence: AtomicU64::new(0),
            submitted: Mutex::new(Vec::new()),
            hold: AtomicBool::new(false),
            held: Mutex::new(VecDeque::new()),
            fail_on_stop: AtomicBool::new(false),
            tail_tx: Mutex::new(Some(tail_tx)),
            tail_rx: Mutex::new(Some(tail_rx)),
        })
    }

    fn set_online(&self) {
        self.online.send_replace(true);
    }

    fn hold_submissions(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Applies everything held, in submission order, and stops holding.
    fn release_held(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for (operation, tx) in held {
            let _ = tx.send(self.apply(operation));
        }
        self.hold.store(false, Ordering::SeqCst);
    }

    fn fail_next_stop(&self) {
        self.fail_on_stop.store(true, Ordering::SeqCst);
    }

    fn submitted_kinds(&self) -> Vec<&'static str> {
        self.submitted.lock().unwrap().clone()
    }

    fn apply(&self, operation: Operation) -> Result<AppliedOperation> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let segment_offset = self.applier.apply_operation(sequence, &operation)?;
        if let Some(tail) = self.tail_tx.lock().unwrap().as_ref() {
            let _ = tail.send(AppliedLogEntry {
                sequence,
                operation,
                segment_offset,
            });
        }
        Ok(AppliedOperation {
            sequence,
            segment_offset,
        })
    }
}

#[async_trait]
impl OperationLog for ScriptedLog {
    async fn start(&self) -> Result<()> {
        self.status.transition(ServiceState::Starting)?;
        self.status.transition(ServiceState::Running)?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.fail_on_stop.swap(false, Ordering::SeqCst) {
            let cause = Error::Storage("journal device went away".to_string());
            self.status.fail(cause.clone());
            return Err(cause);
        }
        if self.status.try_transition(ServiceState::Stopping) {
            self.status.try_transition(ServiceState::Terminated);
        }
        Ok(())
    }

    fn status(&self) -> &ServiceStatus {
        &self.status
    }

    fn is_offline(&self) -> bool {
        !*self.online.borrow()
    }

    async fn await_online(&self) -> Result<()> {
        let mut rx = self.online.subscribe();
        let observed = rx.wait_for(|online| *online).await;
        match observed {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ObjectClosed {
                name: "scripted log".to_string(),
            }),
        }
    }

    fn epoch(&self) -> u64 {
        1
    }

    fn submit(&self, operation: Operation) -> OperationReceipt {
        self.submitted.lock().unwrap().push(kind(&operation));
        if self.hold.load(Ordering::SeqCst) {
            let (tx, receipt) = OperationReceipt::channel();
            self.held.lock().unwrap().push_back((operation, tx));
            return receipt;
        }
        OperationReceipt::ready(self.apply(operation))
    }

    async fn register_segment(&self, snapshot: SegmentSnapshot, _timeout: Duration) -> Result<()> {
        self.applier.apply_map(&snapshot)
    }

    async fn remove_segment(
        &self,
        segment_id: u64,
        deleted: bool,
        _timeout: Duration,
    ) -> Result<SegmentSnapshot> {
        self.applier.apply_unmap(segment_id, deleted)
    }

    async fn barrier(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn take_tail(&self) -> Option<mpsc::UnboundedReceiver<AppliedLogEntry>> {
        self.tail_rx.lock().unwrap().take()
    }
}

// ============================================================================
// Harness
// ============================================================================

fn scripted_container(online: bool) -> (Arc<SegmentContainer>, Arc<ScriptedLog>) {
    let backend: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let config = ContainerConfig {
        container_id: 9,
        writer_flush_interval: Duration::from_millis(5),
        journal: JournalConfig::default(),
        ..ContainerConfig::default()
    };
    let slot: Arc<Mutex<Option<Arc<ScriptedLog>>>> = Arc::new(Mutex::new(None));
    let container = SegmentContainer::with_log(config, backend, no_extensions(), {
        let slot = Arc::clone(&slot);
        move |_, _, applier| {
            let log = ScriptedLog::new(applier, online);
            *slot.lock().unwrap() = Some(Arc::clone(&log));
            log as Arc<dyn OperationLog>
        }
    })
    .unwrap();
    let log = slot.lock().unwrap().clone().unwrap();
    (container, log)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_requests_rejected_until_log_comes_online() {
    let (container, log) = scripted_container(false);
    container.start().await.unwrap();

    assert!(container.is_offline());
    let err = container.get_info("seg", false, TIMEOUT).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ContainerNotRunning {
            state: ServiceState::Starting,
            ..
        }
    ));

    log.set_online();
    wait_for(|| container.status().state() == ServiceState::Running).await;
    // Secondary services may still be starting; requests are accepted anyway.
    tokio::time::sleep(Duration::from_millis(20)).await;
    container.create("seg", Vec::new(), TIMEOUT).await.unwrap();
    let info = container.get_info("seg", false, TIMEOUT).await.unwrap();
    assert_eq!(info.length, 0);

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_merge_submits_seal_then_merge_while_seal_pending() {
    let (container, log) = scripted_container(true);
    container.start().await.unwrap();

    container.create("target", Vec::new(), TIMEOUT).await.unwrap();
    container.create("source", Vec::new(), TIMEOUT).await.unwrap();
    container
        .append("source", Bytes::from_static(b"payload"), Vec::new(), TIMEOUT)
        .await
        .unwrap();

    log.hold_submissions();
    let merge = tokio::spawn({
        let container = Arc::clone(&container);
        async move {
            container
                .merge("target", "source", Duration::from_secs(30))
                .await
        }
    });

    // Both operations are enqueued back to back while the seal is still
    // unresolved.
    wait_for(|| log.submitted_kinds().ends_with(&["seal", "merge"])).await;
    assert!(!merge.is_finished());

    log.release_held();
    let properties = merge.await.unwrap().unwrap();
    assert_eq!(properties.length, 7);
    assert!(properties.sealed);
    assert!(!properties.merged);

    let info = container.get_info("target", false, TIMEOUT).await.unwrap();
    assert_eq!(info.length, 7);

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_source_merge_submits_no_merge_operation() {
    let (container, log) = scripted_container(true);
    container.start().await.unwrap();

    container.create("target", Vec::new(), TIMEOUT).await.unwrap();
    container.create("source", Vec::new(), TIMEOUT).await.unwrap();
    container.seal("source", TIMEOUT).await.unwrap();

    container.merge("target", "source", TIMEOUT).await.unwrap();
    assert!(!log.submitted_kinds().contains(&"merge"));

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_log_failure_takes_the_container_down() {
    let (container, log) = scripted_container(true);
    container.start().await.unwrap();
    assert_eq!(container.status().state(), ServiceState::Running);

    log.status()
        .fail(Error::Storage("journal torn mid-write".to_string()));

    let state = container.status().wait_terminal().await;
    assert_eq!(state, ServiceState::Failed);
    let cause = container.status().failure_cause().unwrap();
    assert!(matches!(
        cause,
        Error::Component {
            component: "durable-log",
            ..
        }
    ));
}

#[tokio::test]
async fn test_stop_aggregates_component_failures() {
    let (container, log) = scripted_container(true);
    container.start().await.unwrap();

    log.fail_next_stop();
    let err = container.stop().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Component {
            component: "durable-log",
            ..
        }
    ));
    assert_eq!(container.status().state(), ServiceState::Failed);

    // A second stop reports the same terminal failure.
    let err = container.stop().await.unwrap_err();
    assert!(matches!(err, Error::Component { .. }));
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_requests() {
    let (container, _log) = scripted_container(true);
    container.start().await.unwrap();

    container.close();
    container.close();

    let err = container
        .append("seg", Bytes::from_static(b"x"), Vec::new(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ObjectClosed { .. }));
}

#[tokio::test]
async fn test_stop_before_start_terminates_cleanly() {
    let (container, _log) = scripted_container(true);
    container.stop().await.unwrap();
    assert_eq!(container.status().state(), ServiceState::Terminated);
}
