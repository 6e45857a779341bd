//! Stage lifecycle state machine.
//!
//! ```text
//! Stopped --start--> Starting --(worker started)--> Started
//!    ^                  |                              |
//!    |                stop                           stop
//!    |                  v                              |
//!    +--(worker stopped)-- Stopping <------------------+
//! ```
//!
//! A failed start drops `Starting` straight back to `Stopped`.

use super::LifecycleError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl LifecycleState {
    /// State after a `start()` request.
    pub fn request_start(self, stage: &str) -> Result<Self, LifecycleError> {
        match self {
            LifecycleState::Stopped => Ok(LifecycleState::Starting),
            state => Err(LifecycleError::InvalidTransition {
                stage: stage.to_string(),
                state,
                action: "start",
            }),
        }
    }

    /// State after a `stop()` request; `None` when it is a no-op.
    pub fn request_stop(self) -> Option<Self> {
        match self {
            LifecycleState::Started | LifecycleState::Starting => Some(LifecycleState::Stopping),
            LifecycleState::Stopped | LifecycleState::Stopping => None,
        }
    }

    /// The worker confirmed it is running.
    pub fn on_started(self) -> Self {
        match self {
            LifecycleState::Starting => LifecycleState::Started,
            // A stop was requested meanwhile; keep waiting for it.
            other => other,
        }
    }

    /// The worker failed to start.
    pub fn on_start_failed(self) -> Self {
        match self {
            LifecycleState::Starting => LifecycleState::Stopped,
            other => other,
        }
    }

    /// The worker confirmed it stopped.
    pub fn on_stopped(self) -> Self {
        LifecycleState::Stopped
    }

    /// Whether the state is still in flight.
    pub fn is_transitioning(self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_only_from_stopped() {
        assert_eq!(
            LifecycleState::Stopped.request_start("s"),
            Ok(LifecycleState::Starting)
        );
        for state in [
            LifecycleState::Starting,
            LifecycleState::Started,
            LifecycleState::Stopping,
        ] {
            assert!(matches!(
                state.request_start("s"),
                Err(LifecycleError::InvalidTransition { action: "start", .. })
            ));
        }
    }

    #[test]
    fn test_stop_is_noop_when_stopped_or_stopping() {
        assert_eq!(LifecycleState::Stopped.request_stop(), None);
        assert_eq!(LifecycleState::Stopping.request_stop(), None);
        assert_eq!(
            LifecycleState::Starting.request_stop(),
            Some(LifecycleState::Stopping)
        );
        assert_eq!(
            LifecycleState::Started.request_stop(),
            Some(LifecycleState::Stopping)
        );
    }

    #[test]
    fn test_late_started_reply_does_not_resurrect() {
        let s = LifecycleState::Starting.request_stop().unwrap();
        assert_eq!(s.on_started(), LifecycleState::Stopping);
        assert_eq!(s.on_start_failed(), LifecycleState::Stopping);
        assert_eq!(s.on_stopped(), LifecycleState::Stopped);
        assert!(s.is_transitioning());
    }
}
