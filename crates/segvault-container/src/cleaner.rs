//! Periodic eviction of idle segment metadata.
//!
//! The cleaner asks metadata for eviction candidates on a fixed interval and
//! hands them to the container's eviction routine, which persists a state
//! document, removes the mapping through the log, and fans out cleanup. The
//! mapper calls [`MetadataCleaner::run_once`] directly when the
//! active-segment budget is exhausted and a sweep might free slots.
//!
//! The cleaner holds only a `Weak` reference to the container; once the
//! container is gone the periodic task exits on its own.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use segvault_core::{Result, ServiceState, ServiceStatus};

use crate::container::SegmentContainer;

pub struct MetadataCleaner {
    container_id: u32,
    interval: Duration,
    container: Weak<SegmentContainer>,
    status: Arc<ServiceStatus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataCleaner {
    pub fn new(container_id: u32, interval: Duration, container: Weak<SegmentContainer>) -> Self {
        Self {
            container_id,
            interval,
            container,
            status: Arc::new(ServiceStatus::new("metadata-cleaner")),
            shutdown: watch::Sender::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    /// One eviction sweep. Returns how many segments were evicted.
    pub async fn run_once(&self) -> Result<usize> {
        let Some(container) = self.container.upgrade() else {
            return Ok(0);
        };
        container.evict_idle_segments().await
    }

    pub fn start(&self) -> Result<()> {
        self.status.transition(ServiceState::Starting)?;
        let task = CleanerTask {
            container_id: self.container_id,
            interval: self.interval,
            container: self.container.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        *lock(&self.task) = Some(tokio::spawn(task.run()));
        self.status.transition(ServiceState::Running)?;
        info!(
            container_id = self.container_id,
            interval_secs = self.interval.as_secs(),
            "Metadata cleaner started"
        );
        Ok(())
    }

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
        info!(container_id = self.container_id, "Metadata cleaner stopped");
        Ok(())
    }

    /// Hard teardown without waiting for an in-flight sweep.
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

struct CleanerTask {
    container_id: u32,
    interval: Duration,
    container: Weak<SegmentContainer>,
    shutdown: watch::Receiver<bool>,
}

impl CleanerTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            let Some(container) = self.container.upgrade() else {
                return;
            };
            match container.evict_idle_segments().await {
                Ok(0) => {}
                Ok(evicted) => {
                    debug!(
                        container_id = self.container_id,
                        evicted, "Cleaner sweep evicted segments"
                    );
                }
                // Sweep failures are not fatal; the next interval retries.
                Err(e) => {
                    warn!(
                        container_id = self.container_id,
                        error = %e,
                        "Cleaner sweep failed"
                    );
                }
            }
        }
    }
}
