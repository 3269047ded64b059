//! OpenOCD debug server backend
//!
//! Spawns `openocd` with the session configuration and drives it over the
//! TCL socket.

pub mod backend;
pub mod client;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{OpenocdBackend, OpenocdServer, OpenocdSession, OpenocdSettings, BACKEND_ID};
pub use client::{OpenocdClient, OpenocdError};

use std::path::PathBuf;

/// Find an executable on PATH (simple which implementation)
pub(crate) fn which(name: &str) -> Result<PathBuf, ()> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_which_finds_ls() {
        assert!(which("ls").is_ok());
    }

    #[test]
    fn test_which_nonexistent() {
        assert!(which("nonexistent_binary_12345").is_err());
    }
}
