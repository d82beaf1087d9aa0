//! Provider lifecycle contract.
//!
//! Every service emulator implements [`Provider`]. The orchestrator drives
//! providers through the status state machine:
//!
//! ```text
//! stopped -> starting -> (running | error)
//! running -> stopping -> stopped
//! error   -> stopping -> stopped
//! ```
//!
//! `start()` and `stop()` are idempotent; `health_check()` is a cheap probe
//! invoked after start and by the management API. Providers that keep state
//! in memory additionally implement `flush()` (persist before shutdown) and
//! `reset()` (drop everything), advertised through the `supports_*` markers.

use async_trait::async_trait;

use crate::error::EmulatorError;

/// Lifecycle state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProviderStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ProviderStatus::Running)
    }

    /// Whether the state machine permits moving to `next` from here.
    pub fn can_transition_to(self, next: ProviderStatus) -> bool {
        use ProviderStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderStatus::Stopped => "stopped",
            ProviderStatus::Starting => "starting",
            ProviderStatus::Running => "running",
            ProviderStatus::Stopping => "stopping",
            ProviderStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// An in-process emulator for one logical service.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, e.g. `"queue:orders"` or `"function:resize"`.
    fn name(&self) -> &str;

    /// Bring the provider up. Idempotent: starting a running provider is a
    /// no-op. Raises `EmulatorError::ProviderStart` on unrecoverable error.
    async fn start(&self) -> Result<(), EmulatorError>;

    /// Tear the provider down. Idempotent.
    async fn stop(&self) -> Result<(), EmulatorError>;

    /// Cheap readiness probe. Failure after start is logged, not fatal.
    async fn health_check(&self) -> bool;

    /// Whether `flush()` does anything for this provider.
    fn supports_flush(&self) -> bool {
        false
    }

    /// Whether `reset()` does anything for this provider.
    fn supports_reset(&self) -> bool {
        false
    }

    /// Persist in-memory state. Called before shutdown on providers that
    /// advertise `supports_flush`.
    async fn flush(&self) -> Result<(), EmulatorError> {
        Ok(())
    }

    /// Drop all state, persisted and in-memory.
    async fn reset(&self) -> Result<(), EmulatorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use ProviderStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Error));
        assert!(Running.can_transition_to(Stopping));
        assert!(Error.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn illegal_transitions() {
        use ProviderStatus::*;
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(ProviderStatus::Running.to_string(), "running");
        assert_eq!(ProviderStatus::Error.to_string(), "error");
    }
}
