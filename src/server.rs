//! Debug server contract consumed by the orchestrator
//!
//! A [`Backend`] resolves a named debug server, the [`DebugServer`] loads a
//! session configuration and opens [`DebugSession`]s bound to one target.
//! Trace verbosity and the operation timeout are state of the server handle,
//! not of the process.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Session option selecting how much flash is erased before a program load
pub const FLASH_ERASE_OPTION: &str = "FlashEraseSelection";

/// Flash erase policy applied before the image is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashErase {
    /// Erase only the sectors the image touches
    #[default]
    NecessarySectors,
    /// Erase the whole flash bank
    EntireFlash,
}

impl FlashErase {
    /// Value of [`FLASH_ERASE_OPTION`] for this policy
    pub fn option_value(self) -> &'static str {
        match self {
            FlashErase::NecessarySectors => "Necessary Sectors Only (for Program Load)",
            FlashErase::EntireFlash => "Entire Flash",
        }
    }

    pub fn from_option_value(value: &str) -> Option<Self> {
        [FlashErase::NecessarySectors, FlashErase::EntireFlash]
            .into_iter()
            .find(|policy| policy.option_value() == value)
    }
}

/// Console trace verbosity of a debug server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Silent,
    Info,
}

/// Lifecycle position of a debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Configured,
    Connected,
    ImageLoaded,
    Running,
    Halted,
    Disconnected,
    Terminated,
}

impl SessionState {
    /// Whether the debug link to the target is up in this state
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::ImageLoaded
                | SessionState::Running
                | SessionState::Halted
        )
    }
}

/// Teardown sub-steps, in the order they are attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Disconnect,
    Terminate,
    Stop,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::Disconnect => write!(f, "disconnect"),
            TeardownStep::Terminate => write!(f, "terminate"),
            TeardownStep::Stop => write!(f, "stop"),
        }
    }
}

/// Resolves debug servers by backend identifier
#[async_trait]
pub trait Backend: Send + Sync {
    type Server: DebugServer;

    /// Resolve and start the named backend.
    ///
    /// Fails with `BackendUnavailable` when the id is unknown or the backend
    /// cannot be started.
    async fn acquire_server(&self, backend_id: &str) -> Result<Self::Server>;
}

/// A running debug server handle
#[async_trait]
pub trait DebugServer: Send {
    type Session: DebugSession;

    /// Bound every later blocking call on this handle and its sessions
    fn set_timeout(&mut self, timeout: Duration);

    async fn load_configuration(&mut self, path: &Path) -> Result<()>;

    async fn open_session(&mut self, target_id: &str) -> Result<Self::Session>;

    /// Change console trace verbosity. Best effort, never fails.
    async fn set_trace_level(&mut self, level: TraceLevel);

    async fn stop(&mut self) -> Result<()>;
}

/// A debug session bound to one target
#[async_trait]
pub trait DebugSession: Send {
    fn target_id(&self) -> &str;

    async fn set_option(&mut self, name: &str, value: &str) -> Result<()>;

    async fn connect(&mut self) -> Result<()>;

    async fn load_image(&mut self, path: &Path) -> Result<()>;

    /// Resume the target and return without waiting on it
    async fn run_async(&mut self) -> Result<()>;

    async fn halt(&mut self) -> Result<()>;

    /// Drop the debug link. A no-op on a session that never connected.
    async fn disconnect(&mut self) -> Result<()>;

    async fn terminate(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_erase_option_values() {
        assert_eq!(
            FlashErase::NecessarySectors.option_value(),
            "Necessary Sectors Only (for Program Load)"
        );
        assert_eq!(
            FlashErase::from_option_value("Entire Flash"),
            Some(FlashErase::EntireFlash)
        );
        assert_eq!(FlashErase::from_option_value("Whatever"), None);
        assert_eq!(FlashErase::default(), FlashErase::NecessarySectors);
    }

    #[test]
    fn test_connected_states() {
        assert!(!SessionState::Opened.is_connected());
        assert!(!SessionState::Configured.is_connected());
        assert!(SessionState::Running.is_connected());
        assert!(!SessionState::Disconnected.is_connected());
    }
}
