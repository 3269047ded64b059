//! flash-run
//!
//! Loads an executable image onto a microcontroller through a debug server,
//! starts it and leaves it running untethered. The debug server is reached
//! through the [`server::Backend`] traits; an OpenOCD binding ships with the
//! crate.

pub mod config;
pub mod error;
pub mod mock;
pub mod openocd;
pub mod orchestrator;
pub mod server;

pub use config::Config;
pub use error::{DebugError, Result};
pub use orchestrator::{run_cli, LoadPlan, Orchestrator, Step, WorkflowError};
