//! Program-load workflow
//!
//! Acquire a debug server, load the session configuration, open and configure
//! a session, connect, load the image with tracing silenced, resume the target
//! and tear everything down again. The happy path stops at the first failure;
//! teardown always runs as far as it can and collects its own failures.

use std::fmt;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DebugError, Result};
use crate::server::{
    Backend, DebugServer, DebugSession, FlashErase, TeardownStep, TraceLevel, FLASH_ERASE_OPTION,
};

type SessionOf<B> = <<B as Backend>::Server as DebugServer>::Session;

/// Happy-path steps that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AcquireServer,
    LoadConfiguration,
    OpenSession,
    SetOption,
    Connect,
    LoadImage,
    RunAsync,
    Halt,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::AcquireServer => "acquire server",
            Step::LoadConfiguration => "load configuration",
            Step::OpenSession => "open session",
            Step::SetOption => "set option",
            Step::Connect => "connect",
            Step::LoadImage => "load image",
            Step::RunAsync => "run",
            Step::Halt => "halt",
        };
        f.write_str(name)
    }
}

/// Outcome of a failed workflow
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: DebugError,
        /// Failures hit while cleaning up after `source`
        teardown: Vec<DebugError>,
    },

    #[error("teardown failed: {}", join_errors(.0))]
    Teardown(Vec<DebugError>),
}

impl WorkflowError {
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkflowError::Step { source, .. } => source.exit_code(),
            WorkflowError::Teardown(errors) => errors
                .first()
                .map(DebugError::exit_code)
                .unwrap_or(18),
        }
    }

    pub fn teardown_errors(&self) -> &[DebugError] {
        match self {
            WorkflowError::Step { teardown, .. } => teardown,
            WorkflowError::Teardown(errors) => errors,
        }
    }
}

fn join_errors(errors: &[DebugError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Inputs of one flash-and-run invocation
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub image: PathBuf,
    pub session_config: PathBuf,
    pub backend: String,
    pub target: String,
    pub timeout: Duration,
    /// Halt the core after resuming it, before the link is dropped
    pub halt_before_disconnect: bool,
}

impl LoadPlan {
    /// Plan with the default backend, target and timeout
    pub fn new(image: impl Into<PathBuf>, session_config: impl Into<PathBuf>) -> Self {
        Self::from_config(image, session_config, &Config::default())
    }

    pub fn from_config(
        image: impl Into<PathBuf>,
        session_config: impl Into<PathBuf>,
        config: &Config,
    ) -> Self {
        Self {
            image: image.into(),
            session_config: session_config.into(),
            backend: config.server.backend.clone(),
            target: config.session.target.clone(),
            timeout: config.timeout(),
            halt_before_disconnect: config.session.halt_before_disconnect,
        }
    }
}

/// Drives one plan against a backend
pub struct Orchestrator<B: Backend> {
    backend: B,
    plan: LoadPlan,
}

impl<B: Backend> Orchestrator<B> {
    pub fn new(backend: B, plan: LoadPlan) -> Self {
        Self { backend, plan }
    }

    pub fn plan(&self) -> &LoadPlan {
        &self.plan
    }

    /// Run the workflow, writing progress lines to `out`
    pub async fn run<W: Write>(&self, out: &mut W) -> std::result::Result<(), WorkflowError> {
        let plan = &self.plan;

        info!("Acquiring debug server '{}'", plan.backend);
        let mut server = self
            .bounded(self.backend.acquire_server(&plan.backend))
            .await
            .map_err(|source| WorkflowError::Step {
                step: Step::AcquireServer,
                source,
                teardown: Vec::new(),
            })?;
        server.set_timeout(plan.timeout);
        debug!("Operation timeout set to {:?}", plan.timeout);

        let mut session = None;
        let outcome = self.happy_path(&mut server, &mut session, out).await;
        let teardown = self.teardown(&mut server, session.as_mut()).await;

        match outcome {
            Err((step, source)) => Err(WorkflowError::Step { step, source, teardown }),
            Ok(()) if teardown.is_empty() => Ok(()),
            Ok(()) => Err(WorkflowError::Teardown(teardown)),
        }
    }

    async fn happy_path<W: Write>(
        &self,
        server: &mut B::Server,
        session_slot: &mut Option<SessionOf<B>>,
        out: &mut W,
    ) -> std::result::Result<(), (Step, DebugError)> {
        let plan = &self.plan;

        info!("Loading session configuration {}", plan.session_config.display());
        self.bounded(server.load_configuration(&plan.session_config))
            .await
            .map_err(at(Step::LoadConfiguration))?;

        info!("Opening session on {}", plan.target);
        let opened = self
            .bounded(server.open_session(&plan.target))
            .await
            .map_err(at(Step::OpenSession))?;
        let session = session_slot.insert(opened);

        // never a full-chip erase
        let erase = FlashErase::NecessarySectors;
        self.bounded(session.set_option(FLASH_ERASE_OPTION, erase.option_value()))
            .await
            .map_err(at(Step::SetOption))?;

        info!("Connecting to {}", session.target_id());
        self.bounded(session.connect())
            .await
            .map_err(at(Step::Connect))?;

        self.load_image(server, session, out)
            .await
            .map_err(at(Step::LoadImage))?;

        info!("Starting {}", session.target_id());
        self.bounded(session.run_async())
            .await
            .map_err(at(Step::RunAsync))?;

        if plan.halt_before_disconnect {
            info!("Halting {} before disconnect", session.target_id());
            self.bounded(session.halt())
                .await
                .map_err(at(Step::Halt))?;
        }

        Ok(())
    }

    /// Image load with console tracing silenced; tracing comes back whatever
    /// the load outcome.
    async fn load_image<W: Write>(
        &self,
        server: &mut B::Server,
        session: &mut SessionOf<B>,
        out: &mut W,
    ) -> Result<()> {
        self.set_trace_level(server, TraceLevel::Silent).await;

        write_line(out, &format!("Loading program {}", self.plan.image.display()));
        let result = self.bounded(session.load_image(&self.plan.image)).await;

        self.set_trace_level(server, TraceLevel::Info).await;
        result
    }

    async fn set_trace_level(&self, server: &mut B::Server, level: TraceLevel) {
        if tokio::time::timeout(self.plan.timeout, server.set_trace_level(level))
            .await
            .is_err()
        {
            warn!("Setting trace level {:?} timed out", level);
        }
    }

    /// Disconnect, terminate and stop, each attempted once whatever the
    /// others return.
    async fn teardown(
        &self,
        server: &mut B::Server,
        session: Option<&mut SessionOf<B>>,
    ) -> Vec<DebugError> {
        let mut errors = Vec::new();

        if let Some(session) = session {
            info!("Disconnecting from {}", session.target_id());
            if let Err(e) = self.bounded(session.disconnect()).await {
                errors.push(teardown_error(TeardownStep::Disconnect, e));
            }
            if let Err(e) = self.bounded(session.terminate()).await {
                errors.push(teardown_error(TeardownStep::Terminate, e));
            }
        }

        info!("Stopping debug server");
        if let Err(e) = self.bounded(server.stop()).await {
            errors.push(teardown_error(TeardownStep::Stop, e));
        }

        errors
    }

    /// Race `call` against the operation timeout
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.plan.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DebugError::OperationTimeout(self.plan.timeout)),
        }
    }
}

fn at(step: Step) -> impl FnOnce(DebugError) -> (Step, DebugError) {
    move |error| {
        warn!("{} failed: {}", step, error);
        (step, error)
    }
}

fn teardown_error(step: TeardownStep, error: DebugError) -> DebugError {
    warn!("Teardown step {} failed: {}", step, error);
    match error {
        DebugError::TeardownFailed { .. } => error,
        other => DebugError::TeardownFailed {
            step,
            reason: other.to_string(),
        },
    }
}

/// Run a plan and report on the console.
///
/// Returns the process exit status: 0 on success, the failing category's
/// code otherwise.
pub async fn run_cli<B: Backend, O: Write, E: Write>(
    backend: B,
    plan: LoadPlan,
    out: &mut O,
    err: &mut E,
) -> u8 {
    let orchestrator = Orchestrator::new(backend, plan);

    match orchestrator.run(out).await {
        Ok(()) => {
            write_line(out, "Finished");
            0
        }
        Err(e) => {
            write_line(err, &format!("Error: {}", e));
            if let WorkflowError::Step { teardown, .. } = &e {
                for failure in teardown {
                    write_line(err, &format!("  while cleaning up: {}", failure));
                }
            }
            e.exit_code()
        }
    }
}

/// Console output is informational; a closed stream only gets logged
fn write_line<W: Write>(w: &mut W, line: &str) {
    if let Err(e) = writeln!(w, "{}", line) {
        warn!("Failed to write console line {:?}: {}", line, e);
    }
}
