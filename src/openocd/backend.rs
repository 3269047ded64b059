//! Debug server contract implemented on top of OpenOCD

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::client::{parse_target_names, OpenocdClient, OpenocdError};
use crate::config::{Config, DEFAULT_TCL_PORT};
use crate::error::{DebugError, Result};
use crate::server::{
    Backend, DebugServer, DebugSession, FlashErase, SessionState, TeardownStep, TraceLevel,
    FLASH_ERASE_OPTION,
};

/// Identifier this backend answers to
pub const BACKEND_ID: &str = "openocd";

/// How long `connect` waits for the core to report halted, in milliseconds
const HALT_WAIT_MS: u64 = 5000;

/// Settings the OpenOCD backend needs from the configuration
#[derive(Debug, Clone)]
pub struct OpenocdSettings {
    pub openocd_path: Option<PathBuf>,
    pub tcl_port: u16,
    pub extra_args: Vec<String>,
    pub base_address: u64,
}

impl Default for OpenocdSettings {
    fn default() -> Self {
        Self {
            openocd_path: None,
            tcl_port: DEFAULT_TCL_PORT,
            extra_args: Vec::new(),
            base_address: 0,
        }
    }
}

impl From<&Config> for OpenocdSettings {
    fn from(config: &Config) -> Self {
        Self {
            openocd_path: config.openocd.path.clone(),
            tcl_port: config.openocd.tcl_port,
            extra_args: config.openocd.extra_args.clone(),
            base_address: config.image.base_address,
        }
    }
}

impl OpenocdSettings {
    /// Find openocd binary path: settings, then PATH
    pub fn find_openocd(&self) -> std::result::Result<PathBuf, String> {
        if let Some(path) = &self.openocd_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(format!("Configured openocd path does not exist: {}", path.display()));
        }

        super::which("openocd").map_err(|_| "openocd not found on PATH".to_string())
    }
}

/// Resolves the `openocd` backend
pub struct OpenocdBackend {
    settings: OpenocdSettings,
}

impl OpenocdBackend {
    pub fn new(settings: OpenocdSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Backend for OpenocdBackend {
    type Server = OpenocdServer;

    async fn acquire_server(&self, backend_id: &str) -> Result<OpenocdServer> {
        if backend_id != BACKEND_ID {
            return Err(DebugError::BackendUnavailable {
                backend: backend_id.to_string(),
                reason: format!("unknown backend, this build provides '{}'", BACKEND_ID),
            });
        }

        let openocd_path = self.settings.find_openocd().map_err(|reason| {
            DebugError::BackendUnavailable {
                backend: backend_id.to_string(),
                reason,
            }
        })?;

        info!("Using OpenOCD at {}", openocd_path.display());
        Ok(OpenocdServer::new(openocd_path, self.settings.clone()))
    }
}

/// An OpenOCD process, started once a session configuration is loaded
pub struct OpenocdServer {
    openocd_path: PathBuf,
    settings: OpenocdSettings,
    timeout: Duration,
    trace_level: TraceLevel,
    client: Option<Arc<Mutex<OpenocdClient>>>,
}

impl OpenocdServer {
    fn new(openocd_path: PathBuf, settings: OpenocdSettings) -> Self {
        Self {
            openocd_path,
            settings,
            timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
            trace_level: TraceLevel::Info,
            client: None,
        }
    }

    /// Wrap an already connected client, skipping process start-up
    pub fn attached(client: OpenocdClient, settings: OpenocdSettings) -> Self {
        let mut server = Self::new(PathBuf::from(BACKEND_ID), settings);
        server.client = Some(Arc::new(Mutex::new(client)));
        server
    }

    pub fn trace_level(&self) -> TraceLevel {
        self.trace_level
    }
}

#[async_trait]
impl DebugServer for OpenocdServer {
    type Session = OpenocdSession;

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Some(client) = &self.client {
            match client.try_lock() {
                Ok(mut client) => client.set_timeout(timeout),
                Err(_) => warn!(
                    "OpenOCD client busy, timeout {:?} applies from the next server call",
                    timeout
                ),
            }
        }
    }

    async fn load_configuration(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(DebugError::ConfigNotFound(path.to_path_buf()));
        }
        if self.client.is_some() {
            return Err(DebugError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: "a session configuration is already loaded".to_string(),
            });
        }

        let client = OpenocdClient::start(
            &self.openocd_path,
            path,
            &self.settings.extra_args,
            self.settings.tcl_port,
            self.timeout,
        )
        .await
        .map_err(|e| match e {
            OpenocdError::LaunchFailed(reason) => DebugError::BackendUnavailable {
                backend: BACKEND_ID.to_string(),
                reason,
            },
            OpenocdError::Timeout(after) => DebugError::OperationTimeout(after),
            other => DebugError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        self.client = Some(Arc::new(Mutex::new(client)));
        Ok(())
    }

    async fn open_session(&mut self, target_id: &str) -> Result<OpenocdSession> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| DebugError::TargetNotFound(format!("{} (no configuration loaded)", target_id)))?;

        {
            let mut guard = lock_client(&client, self.timeout).await;
            let names = guard
                .eval("target names")
                .await
                .map_err(|e| command_error(e, |reason| DebugError::TargetNotFound(format!("{}: {}", target_id, reason))))?;

            let names = parse_target_names(&names);
            if !names.iter().any(|name| name == target_id) {
                return Err(DebugError::TargetNotFound(format!(
                    "{} (configuration describes: {})",
                    target_id,
                    names.join(", ")
                )));
            }

            guard
                .eval(&format!("targets {}", target_id))
                .await
                .map_err(|e| command_error(e, |reason| DebugError::TargetNotFound(format!("{}: {}", target_id, reason))))?;
        }

        debug!("Session opened on {}", target_id);
        Ok(OpenocdSession {
            target: target_id.to_string(),
            client: Some(client),
            state: SessionState::Opened,
            erase: FlashErase::default(),
            base_address: self.settings.base_address,
        })
    }

    async fn set_trace_level(&mut self, level: TraceLevel) {
        self.trace_level = level;
        let Some(client) = &self.client else {
            return;
        };

        let command = match level {
            TraceLevel::Silent => "debug_level 0",
            TraceLevel::Info => "debug_level 2",
        };
        if let Err(e) = lock_client(client, self.timeout).await.eval(command).await {
            warn!("Failed to set OpenOCD trace level ({}): {}", command, e);
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(client) = self.client.take() else {
            debug!("OpenOCD was never started, nothing to stop");
            return Ok(());
        };

        let mut client = lock_client(&client, self.timeout).await;
        client.shutdown().await.map_err(|e| DebugError::TeardownFailed {
            step: TeardownStep::Stop,
            reason: with_stderr(e.to_string(), &client.stderr_tail()),
        })
    }
}

/// A session on one OpenOCD target
pub struct OpenocdSession {
    target: String,
    client: Option<Arc<Mutex<OpenocdClient>>>,
    state: SessionState,
    erase: FlashErase,
    base_address: u64,
}

impl OpenocdSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn eval(&self, command: &str) -> std::result::Result<String, OpenocdError> {
        let client = self.client.as_ref().ok_or(OpenocdError::ConnectionClosed)?;
        client.lock().await.eval(command).await
    }
}

#[async_trait]
impl DebugSession for OpenocdSession {
    fn target_id(&self) -> &str {
        &self.target
    }

    async fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        if name != FLASH_ERASE_OPTION {
            return Err(DebugError::UnknownOption(name.to_string()));
        }
        self.erase = FlashErase::from_option_value(value).ok_or_else(|| {
            DebugError::InvalidOptionValue {
                name: name.to_string(),
                value: value.to_string(),
            }
        })?;

        if self.state.is_connected() {
            warn!("{} set after connect on {}", name, self.target);
        } else {
            self.state = SessionState::Configured;
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let target = self.target.clone();
        let failed = |reason: String| DebugError::ConnectionFailed {
            target: target.clone(),
            reason,
        };

        self.eval(&format!("{} arp_examine", self.target))
            .await
            .map_err(|e| command_error(e, &failed))?;
        self.eval("halt")
            .await
            .map_err(|e| command_error(e, &failed))?;
        self.eval(&format!("{} arp_waitstate halted {}", self.target, HALT_WAIT_MS))
            .await
            .map_err(|e| command_error(e, &failed))?;

        self.state = SessionState::Connected;
        Ok(())
    }

    async fn load_image(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(DebugError::ImageNotFound(path.to_path_buf()));
        }
        if !self.state.is_connected() {
            return Err(DebugError::MemoryWriteFailed {
                path: path.to_path_buf(),
                reason: format!("{} is not connected", self.target),
            });
        }

        for command in image_commands(path, self.erase, self.base_address) {
            self.eval(&command).await.map_err(|e| {
                command_error(e, |reason| classify_load_error(path, reason))
            })?;
        }

        self.state = SessionState::ImageLoaded;
        Ok(())
    }

    async fn run_async(&mut self) -> Result<()> {
        let target = self.target.clone();
        // `resume` returns as soon as the core leaves halt
        self.eval("resume").await.map_err(|e| {
            command_error(e, |reason| DebugError::ResumeFailed {
                target: target.clone(),
                reason,
            })
        })?;

        self.state = SessionState::Running;
        Ok(())
    }

    async fn halt(&mut self) -> Result<()> {
        let target = self.target.clone();
        self.eval("halt").await.map_err(|e| {
            command_error(e, |reason| DebugError::HaltFailed {
                target: target.clone(),
                reason,
            })
        })?;

        self.state = SessionState::Halted;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.state.is_connected() {
            debug!("{} not connected, disconnect is a no-op", self.target);
            self.state = SessionState::Disconnected;
            return Ok(());
        }

        // the link must still answer for the target to be released cleanly
        let state = self
            .eval(&format!("{} curstate", self.target))
            .await
            .map_err(|e| DebugError::TeardownFailed {
                step: TeardownStep::Disconnect,
                reason: e.to_string(),
            })?;

        info!("Disconnected from {} (core {})", self.target, state.trim());
        self.state = SessionState::Disconnected;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Err(DebugError::TeardownFailed {
                step: TeardownStep::Terminate,
                reason: "session already terminated".to_string(),
            });
        };

        self.state = SessionState::Terminated;
        if !client.lock().await.is_running() {
            return Err(DebugError::TeardownFailed {
                step: TeardownStep::Terminate,
                reason: "OpenOCD exited before the session was terminated".to_string(),
            });
        }
        Ok(())
    }
}

/// Erases every sector of every configured flash bank
const ERASE_ALL_BANKS: &str =
    "for {set bank 0} {$bank < [llength [flash list]]} {incr bank} {flash erase_sector $bank 0 last}";

/// OpenOCD commands writing `path` under the given erase policy
pub fn image_commands(path: &Path, erase: FlashErase, base_address: u64) -> Vec<String> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase);

    // `flash write_image` takes an offset, then a type, for non-ELF images
    let suffix = match extension.as_deref() {
        Some("bin") => format!(" 0x{:x} bin", base_address),
        Some("hex") | Some("ihex") => " 0 ihex".to_string(),
        Some("srec") | Some("s19") | Some("mot") => " 0 s19".to_string(),
        _ => String::new(),
    };
    let file = format!("{{{}}}", path.display());

    match erase {
        FlashErase::NecessarySectors => vec![format!("flash write_image erase {}{}", file, suffix)],
        FlashErase::EntireFlash => vec![
            ERASE_ALL_BANKS.to_string(),
            format!("flash write_image {}{}", file, suffix),
        ],
    }
}

fn load_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)image type|invalid elf|elf header|bad magic|ihex|srec|s19|checksum|record type|file format")
            .expect("load error pattern is valid")
    })
}

/// Split an OpenOCD load failure into a format problem or a write problem
fn classify_load_error(path: &Path, reason: String) -> DebugError {
    if load_error_pattern().is_match(&reason) {
        DebugError::ImageFormatInvalid {
            path: path.to_path_buf(),
            reason,
        }
    } else {
        DebugError::MemoryWriteFailed {
            path: path.to_path_buf(),
            reason,
        }
    }
}

/// Lock the client, bringing it up to the server's current timeout
async fn lock_client(
    client: &Arc<Mutex<OpenocdClient>>,
    timeout: Duration,
) -> MutexGuard<'_, OpenocdClient> {
    let mut guard = client.lock().await;
    guard.set_timeout(timeout);
    guard
}

/// Map a client error, letting timeouts keep their own category
fn command_error(e: OpenocdError, f: impl FnOnce(String) -> DebugError) -> DebugError {
    match e {
        OpenocdError::Timeout(after) => DebugError::OperationTimeout(after),
        OpenocdError::CommandFailed(reason) => f(reason),
        other => f(other.to_string()),
    }
}

fn with_stderr(reason: String, stderr: &str) -> String {
    if stderr.is_empty() {
        reason
    } else {
        format!("{}\n{}", reason, stderr)
    }
}
