//! Scriptable in-memory backend
//!
//! Records every call in order and fails or stalls the calls it is told to.
//! Used by the test-suite to drive the orchestrator without a probe.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{DebugError, Result};
use crate::server::{Backend, DebugServer, DebugSession, SessionState, TraceLevel};

/// A call made on the mock, with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acquire(String),
    SetTimeout(Duration),
    LoadConfig(PathBuf),
    OpenSession(String),
    SetOption { name: String, value: String },
    Connect,
    Trace(TraceLevel),
    LoadImage(PathBuf),
    RunAsync,
    Halt,
    Disconnect,
    Terminate,
    Stop,
}

/// Call kinds that can be scripted to fail or stall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Acquire,
    LoadConfig,
    OpenSession,
    SetOption,
    Connect,
    LoadImage,
    RunAsync,
    Halt,
    Disconnect,
    Terminate,
    Stop,
}

impl Event {
    pub fn call(&self) -> Option<Call> {
        match self {
            Event::Acquire(_) => Some(Call::Acquire),
            Event::LoadConfig(_) => Some(Call::LoadConfig),
            Event::OpenSession(_) => Some(Call::OpenSession),
            Event::SetOption { .. } => Some(Call::SetOption),
            Event::Connect => Some(Call::Connect),
            Event::LoadImage(_) => Some(Call::LoadImage),
            Event::RunAsync => Some(Call::RunAsync),
            Event::Halt => Some(Call::Halt),
            Event::Disconnect => Some(Call::Disconnect),
            Event::Terminate => Some(Call::Terminate),
            Event::Stop => Some(Call::Stop),
            Event::SetTimeout(_) | Event::Trace(_) => None,
        }
    }
}

#[derive(Default)]
struct Script {
    events: Mutex<Vec<Event>>,
    failures: Mutex<HashMap<Call, DebugError>>,
    delays: Mutex<HashMap<Call, Duration>>,
}

impl Script {
    fn record(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Record `event`, then stall and fail as scripted for its call kind
    async fn invoke(&self, event: Event) -> Result<()> {
        let call = event.call();
        self.record(event);

        let Some(call) = call else {
            return Ok(());
        };
        let delay = self.delays.lock().ok().and_then(|delays| delays.get(&call).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().ok().and_then(|failures| failures.get(&call).cloned());
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Backend accepting every call unless scripted otherwise
#[derive(Clone, Default)]
pub struct MockBackend {
    script: Arc<Script>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `call` fail with `error`
    pub fn fail(self, call: Call, error: DebugError) -> Self {
        if let Ok(mut failures) = self.script.failures.lock() {
            failures.insert(call, error);
        }
        self
    }

    /// Make every `call` take `delay` before answering
    pub fn delay(self, call: Call, delay: Duration) -> Self {
        if let Ok(mut delays) = self.script.delays.lock() {
            delays.insert(call, delay);
        }
        self
    }

    /// Every call made so far, in order
    pub fn events(&self) -> Vec<Event> {
        self.script
            .events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// How often `call` was invoked
    pub fn count(&self, call: Call) -> usize {
        self.events()
            .iter()
            .filter(|event| event.call() == Some(call))
            .count()
    }
}

#[async_trait]
impl Backend for MockBackend {
    type Server = MockServer;

    async fn acquire_server(&self, backend_id: &str) -> Result<MockServer> {
        self.script.invoke(Event::Acquire(backend_id.to_string())).await?;
        Ok(MockServer {
            script: self.script.clone(),
            timeout: None,
            trace_level: TraceLevel::Info,
        })
    }
}

pub struct MockServer {
    script: Arc<Script>,
    timeout: Option<Duration>,
    trace_level: TraceLevel,
}

impl MockServer {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn trace_level(&self) -> TraceLevel {
        self.trace_level
    }
}

#[async_trait]
impl DebugServer for MockServer {
    type Session = MockSession;

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
        self.script.record(Event::SetTimeout(timeout));
    }

    async fn load_configuration(&mut self, path: &Path) -> Result<()> {
        self.script.invoke(Event::LoadConfig(path.to_path_buf())).await
    }

    async fn open_session(&mut self, target_id: &str) -> Result<MockSession> {
        self.script.invoke(Event::OpenSession(target_id.to_string())).await?;
        Ok(MockSession {
            script: self.script.clone(),
            target: target_id.to_string(),
            state: SessionState::Opened,
        })
    }

    async fn set_trace_level(&mut self, level: TraceLevel) {
        self.trace_level = level;
        self.script.record(Event::Trace(level));
    }

    async fn stop(&mut self) -> Result<()> {
        self.script.invoke(Event::Stop).await
    }
}

pub struct MockSession {
    script: Arc<Script>,
    target: String,
    state: SessionState,
}

impl MockSession {
    pub fn state(&self) -> SessionState {
        self.state
    }
}

#[async_trait]
impl DebugSession for MockSession {
    fn target_id(&self) -> &str {
        &self.target
    }

    async fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        self.script
            .invoke(Event::SetOption {
                name: name.to_string(),
                value: value.to_string(),
            })
            .await?;
        self.state = SessionState::Configured;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.script.invoke(Event::Connect).await?;
        self.state = SessionState::Connected;
        Ok(())
    }

    async fn load_image(&mut self, path: &Path) -> Result<()> {
        self.script.invoke(Event::LoadImage(path.to_path_buf())).await?;
        if !self.state.is_connected() {
            return Err(DebugError::MemoryWriteFailed {
                path: path.to_path_buf(),
                reason: format!("{} is not connected", self.target),
            });
        }
        self.state = SessionState::ImageLoaded;
        Ok(())
    }

    async fn run_async(&mut self) -> Result<()> {
        self.script.invoke(Event::RunAsync).await?;
        self.state = SessionState::Running;
        Ok(())
    }

    async fn halt(&mut self) -> Result<()> {
        self.script.invoke(Event::Halt).await?;
        self.state = SessionState::Halted;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.script.invoke(Event::Disconnect).await?;
        self.state = SessionState::Disconnected;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        self.script.invoke(Event::Terminate).await?;
        self.state = SessionState::Terminated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let backend = MockBackend::new();
        let mut server = backend.acquire_server("openocd").await.unwrap();
        server.set_timeout(Duration::from_secs(10));
        let mut session = server.open_session("tms570.cpu").await.unwrap();
        session.connect().await.unwrap();

        assert_eq!(
            backend.events(),
            vec![
                Event::Acquire("openocd".to_string()),
                Event::SetTimeout(Duration::from_secs(10)),
                Event::OpenSession("tms570.cpu".to_string()),
                Event::Connect,
            ]
        );
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(server.timeout(), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_still_recorded() {
        let backend = MockBackend::new().fail(Call::Connect, DebugError::ConnectionFailed {
            target: "tms570.cpu".to_string(),
            reason: "probe not present".to_string(),
        });
        let mut server = backend.acquire_server("openocd").await.unwrap();
        let mut session = server.open_session("tms570.cpu").await.unwrap();

        assert!(session.connect().await.is_err());
        assert_eq!(backend.count(Call::Connect), 1);
        assert_eq!(session.state(), SessionState::Opened);
    }

    #[tokio::test]
    async fn test_load_requires_connection() {
        let backend = MockBackend::new();
        let mut server = backend.acquire_server("openocd").await.unwrap();
        let mut session = server.open_session("tms570.cpu").await.unwrap();

        let err = session.load_image(Path::new("fw.bin")).await.unwrap_err();
        assert!(matches!(err, DebugError::MemoryWriteFailed { .. }));
    }
}
