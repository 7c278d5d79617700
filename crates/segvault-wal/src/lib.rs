//! Durable operation log for SegVault containers.
//!
//! ## Architecture
//!
//! ```text
//! Callers ─→ submit() ─→ [mpsc channel] ─→ Applier Task ─→ apply ─→ journal
//!                                               │                    commit
//!                                               └─→ tail channel ─→ Writer
//! ```
//!
//! One task owns the journal and applies every record, which gives the log
//! its total order for free: operations enqueued by one submitter apply in
//! submission order, regardless of when their receipts resolve. The
//! container's merge pipelining leans on exactly that guarantee.
//!
//! Recovery runs inside [`DurableLog::start`]: the journal is replayed
//! through the same [`OperationApplier`] that serves live traffic, the
//! epoch is bumped and made durable, and only then does the log report
//! itself online.

pub mod durable_log;
pub mod journal;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use segvault_core::{
    AppliedOperation, Error, Operation, Result, SegmentSnapshot, ServiceStatus, TimeoutTimer,
};

pub use durable_log::DurableLog;
pub use journal::{Journal, JournalConfig, JournalRecord};

// ============================================================================
// Applier seam
// ============================================================================

/// Applies durably ordered records to the state they govern. Implemented by
/// container metadata and called only from the log's single applier task, so
/// implementations observe records in total order with no interleaving.
///
/// Each method is all-or-nothing: it validates first and mutates only when
/// validation passes, because the log journals a record only after its
/// application succeeded.
pub trait OperationApplier: Send + Sync {
    /// Validates and applies one operation. Returns the segment offset the
    /// operation produced (start offset of an append, final length of a
    /// seal, target offset of a merge, new start offset of a truncate).
    fn apply_operation(&self, sequence: u64, operation: &Operation) -> Result<u64>;

    /// Binds (or rebinds, after eviction) a segment baseline into metadata.
    fn apply_map(&self, snapshot: &SegmentSnapshot) -> Result<()>;

    /// Removes a segment binding from metadata, returning its final
    /// baseline. `deleted` distinguishes deletion from eviction.
    fn apply_unmap(&self, segment_id: u64, deleted: bool) -> Result<SegmentSnapshot>;
}

// ============================================================================
// Log contract
// ============================================================================

/// One applied operation as the tail subscription sees it, after it became
/// durable. The storage writer consumes these.
#[derive(Debug, Clone)]
pub struct AppliedLogEntry {
    pub sequence: u64,
    pub operation: Operation,
    pub segment_offset: u64,
}

/// The durable operation log: totally orders, persists, and applies every
/// mutating operation of one container.
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Recovers the journal and brings the log online.
    async fn start(&self) -> Result<()>;

    /// Stops the applier task. Operations still queued resolve with
    /// `ObjectClosed`.
    async fn stop(&self) -> Result<()>;

    fn status(&self) -> &ServiceStatus;

    /// True while the log is recovering (or has never started); submissions
    /// are rejected during that window.
    fn is_offline(&self) -> bool;

    /// Resolves when the log comes online, or fails if it dies first.
    async fn await_online(&self) -> Result<()>;

    /// Epoch of the current instance. `0` until the log has started.
    fn epoch(&self) -> u64;

    /// Enqueues an operation synchronously and returns a receipt that
    /// resolves once the operation is durable and applied. The enqueue
    /// itself fixes the operation's position in the total order.
    fn submit(&self, operation: Operation) -> OperationReceipt;

    /// Submit-and-wait with a deadline.
    async fn add(&self, operation: Operation, timeout: Duration) -> Result<AppliedOperation> {
        let receipt = self.submit(operation);
        TimeoutTimer::new(timeout).run(receipt.wait()).await
    }

    /// Durably binds a segment baseline into metadata, in log order.
    async fn register_segment(&self, snapshot: SegmentSnapshot, timeout: Duration) -> Result<()>;

    /// Durably removes a segment binding, returning its final baseline.
    async fn remove_segment(
        &self,
        segment_id: u64,
        deleted: bool,
        timeout: Duration,
    ) -> Result<SegmentSnapshot>;

    /// Resolves once everything enqueued before this call has been durably
    /// applied.
    async fn barrier(&self, timeout: Duration) -> Result<()>;

    /// Takes the tail subscription. Yields every applied entry, including
    /// entries replayed during recovery, so a consumer attaching after
    /// startup still sees unflushed history. Returns `None` once taken.
    fn take_tail(&self) -> Option<mpsc::UnboundedReceiver<AppliedLogEntry>>;
}

// ============================================================================
// Receipts
// ============================================================================

/// Resolves when a submitted operation has been durably applied (or
/// rejected). Dropping the receipt does not cancel the operation.
pub struct OperationReceipt {
    rx: oneshot::Receiver<Result<AppliedOperation>>,
}

impl OperationReceipt {
    /// A receipt and the sender that resolves it. Public so log
    /// implementations and test doubles can mint receipts.
    pub fn channel() -> (oneshot::Sender<Result<AppliedOperation>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A receipt that is already resolved.
    pub fn ready(result: Result<AppliedOperation>) -> Self {
        let (tx, receipt) = Self::channel();
        let _ = tx.send(result);
        receipt
    }

    pub async fn wait(self) -> Result<AppliedOperation> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: the applier task is gone.
            Err(_) => Err(Error::ObjectClosed {
                name: "operation log".to_string(),
            }),
        }
    }
}
