//! Lifecycle state machine shared by the container and its inner services.
//!
//! ```text
//!                +-----------+
//!                |    New    |
//!                +-----+-----+
//!                      |
//!                +-----v-----+
//!          +-----| Starting  |-----+
//!          |     +-----+-----+     |
//!          |           |           |
//!    +-----v-----+     |     +-----v-----+
//!    |  Running  |-----+---->| Stopping  |
//!    +-----+-----+     |     +-----+-----+
//!          |           |           |
//!          |     +-----v-----+     |
//!          +---->|  Failed   |<----+
//!                +-----------+     |
//!                            +-----v------+
//!                            | Terminated |
//!                            +------------+
//! ```
//!
//! Transitions are validated; observers subscribe through a watch channel so
//! `stop().await` style calls can park until a terminal state is reached.
//! A never-started service may also go `New -> Stopping` directly, so
//! stopping something that was constructed but never started is not an error.

use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, never started.
    New,
    /// `start()` accepted, not yet usable.
    Starting,
    /// Fully operational.
    Running,
    /// Shutdown in progress.
    Stopping,
    /// Stopped cleanly. Terminal.
    Terminated,
    /// Stopped because something broke. Terminal.
    Failed,
}

impl ServiceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed)
    }

    fn can_transition_to(self, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, to),
            (New, Starting)
                | (New, Stopping)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Terminated)
                | (Stopping, Failed)
        )
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::New => "new",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Terminated => "terminated",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Watchable lifecycle state plus the failure that ended it, if any.
#[derive(Debug)]
pub struct ServiceStatus {
    name: &'static str,
    state: watch::Sender<ServiceState>,
    failure: Mutex<Option<Error>>,
}

impl ServiceStatus {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: watch::Sender::new(ServiceState::New),
            failure: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Moves to `to`, rejecting transitions the state machine does not allow.
    pub fn transition(&self, to: ServiceState) -> Result<()> {
        let mut ok = false;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                *current = to;
                ok = true;
                true
            } else {
                false
            }
        });
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "{}: illegal state transition {} -> {}",
                self.name,
                self.state(),
                to
            )))
        }
    }

    /// Like [`transition`](Self::transition) but silently ignores illegal
    /// moves. Returns whether the state changed.
    pub fn try_transition(&self, to: ServiceState) -> bool {
        self.transition(to).is_ok()
    }

    /// Records `cause` and moves to `Failed`. Only the first recorded cause
    /// sticks; later ones are dropped because the service is already dead.
    /// Returns whether this call supplied the primary cause.
    pub fn fail(&self, cause: Error) -> bool {
        let recorded = {
            let mut slot = match self.failure.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_none() {
                *slot = Some(cause);
                true
            } else {
                false
            }
        };
        self.state.send_if_modified(|current| {
            if current.can_transition_to(ServiceState::Failed) {
                *current = ServiceState::Failed;
                true
            } else {
                false
            }
        });
        recorded
    }

    /// The failure that moved this service to `Failed`, if any.
    pub fn failure_cause(&self) -> Option<Error> {
        match self.failure.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Parks until the service reaches `Terminated` or `Failed`.
    pub async fn wait_terminal(&self) -> ServiceState {
        let mut rx = self.state.subscribe();
        let observed = rx.wait_for(|s| s.is_terminal()).await;
        match observed {
            Ok(state) => *state,
            // The sender lives in self, so this only fires if self is being
            // torn down mid-wait; report whatever we last saw.
            Err(_) => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_lifecycle() {
        let status = ServiceStatus::new("container0");
        assert_eq!(status.state(), ServiceState::New);
        status.transition(ServiceState::Starting).unwrap();
        status.transition(ServiceState::Running).unwrap();
        assert!(status.is_running());
        status.transition(ServiceState::Stopping).unwrap();
        status.transition(ServiceState::Terminated).unwrap();
        assert!(status.state().is_terminal());
        assert!(status.failure_cause().is_none());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let status = ServiceStatus::new("svc");
        assert!(status.transition(ServiceState::Running).is_err());
        status.transition(ServiceState::Starting).unwrap();
        assert!(status.transition(ServiceState::Terminated).is_err());
        assert!(!status.try_transition(ServiceState::New));
        assert_eq!(status.state(), ServiceState::Starting);
    }

    #[test]
    fn test_first_failure_cause_wins() {
        let status = ServiceStatus::new("svc");
        status.transition(ServiceState::Starting).unwrap();
        status.transition(ServiceState::Running).unwrap();
        assert!(status.fail(Error::Storage("primary".into())));
        assert!(!status.fail(Error::Storage("late".into())));
        assert_eq!(status.state(), ServiceState::Failed);
        let cause = status.failure_cause().unwrap();
        assert!(cause.to_string().contains("primary"));
    }

    #[test]
    fn test_terminal_states_stay_terminal() {
        let status = ServiceStatus::new("svc");
        status.transition(ServiceState::Starting).unwrap();
        status.transition(ServiceState::Stopping).unwrap();
        status.transition(ServiceState::Terminated).unwrap();
        // A failure after clean termination must not resurrect the service.
        status.fail(Error::Storage("too late".into()));
        assert_eq!(status.state(), ServiceState::Terminated);
    }

    #[tokio::test]
    async fn test_wait_terminal_wakes_on_failure() {
        let status = std::sync::Arc::new(ServiceStatus::new("svc"));
        status.transition(ServiceState::Starting).unwrap();
        status.transition(ServiceState::Running).unwrap();

        let waiter = {
            let status = status.clone();
            tokio::spawn(async move { status.wait_terminal().await })
        };
        tokio::task::yield_now().await;
        status.fail(Error::Storage("boom".into()));
        assert_eq!(waiter.await.unwrap(), ServiceState::Failed);
    }
}
