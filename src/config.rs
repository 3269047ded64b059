//! Configuration management for flash-run

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DebugError, Result};

/// Backend used when neither the settings file nor the CLI names one
pub const DEFAULT_BACKEND: &str = "openocd";

/// OpenOCD's name for the TMS570LC4357 Cortex-R5F core
pub const DEFAULT_TARGET: &str = "tms570.cpu";

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_TCL_PORT: u16 = 6666;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "flash-run")]
#[command(about = "Load a program onto a target through a debug server and leave it running")]
#[command(version)]
pub struct Args {
    /// Executable image to load
    #[arg(required_unless_present = "show_config")]
    pub image: Option<PathBuf>,

    /// Session configuration describing the board (OpenOCD .cfg for the openocd backend)
    #[arg(required_unless_present = "show_config")]
    pub session_config: Option<PathBuf>,

    /// Path to a TOML settings file
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    /// Debug server backend identifier
    #[arg(long)]
    pub backend: Option<String>,

    /// Target identifier inside the session configuration
    #[arg(long)]
    pub target: Option<String>,

    /// Bound for every blocking debug server call, in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Halt the target before disconnecting instead of leaving it running
    #[arg(long)]
    pub halt_before_disconnect: bool,

    /// Path to openocd binary (defaults to searching PATH)
    #[arg(long)]
    pub openocd_path: Option<PathBuf>,

    /// First of three consecutive ports (tcl, gdb, telnet) given to OpenOCD
    #[arg(long)]
    pub tcl_port: Option<u16>,

    /// Load address for raw .bin images (hex or decimal)
    #[arg(long, value_parser = parse_address)]
    pub base_address: Option<u64>,

    /// Log level (error, warn, info, debug, trace) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log file path (defaults to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print the merged configuration and exit
    #[arg(long)]
    pub show_config: bool,
}

impl Args {
    /// Image and session configuration paths, absent only with `--show-config`
    pub fn load_paths(&self) -> Option<(&Path, &Path)> {
        Some((self.image.as_deref()?, self.session_config.as_deref()?))
    }
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub image: ImageConfig,
    pub openocd: OpenocdConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let content = std::fs::read_to_string(path).map_err(|e| {
                DebugError::InvalidConfig(format!(
                    "Failed to read settings file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| DebugError::InvalidConfig(format!("Invalid TOML syntax: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Merge command line arguments into configuration.
    ///
    /// Only flags given on the command line override the file.
    pub fn merge_args(&mut self, args: &Args) {
        if let Some(backend) = &args.backend {
            self.server.backend = backend.clone();
        }
        if let Some(timeout) = args.timeout_secs {
            self.server.timeout_secs = timeout;
        }
        if let Some(target) = &args.target {
            self.session.target = target.clone();
        }
        if args.halt_before_disconnect {
            self.session.halt_before_disconnect = true;
        }
        if let Some(path) = &args.openocd_path {
            self.openocd.path = Some(path.clone());
        }
        if let Some(port) = args.tcl_port {
            self.openocd.tcl_port = port;
        }
        if let Some(address) = args.base_address {
            self.image.base_address = address;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.log_file.is_some() {
            self.logging.file = args.log_file.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.backend.trim().is_empty() {
            return Err(DebugError::InvalidConfig("server.backend must not be empty".to_string()));
        }
        if self.server.timeout_secs == 0 {
            return Err(DebugError::InvalidConfig("server.timeout_secs must be > 0".to_string()));
        }
        if self.session.target.trim().is_empty() {
            return Err(DebugError::InvalidConfig("session.target must not be empty".to_string()));
        }
        // tcl, gdb and telnet ports are allocated consecutively
        if self.openocd.tcl_port == 0 || self.openocd.tcl_port > u16::MAX - 2 {
            return Err(DebugError::InvalidConfig(format!(
                "openocd.tcl_port {} leaves no room for gdb and telnet ports",
                self.openocd.tcl_port
            )));
        }
        Ok(())
    }

    /// Generate TOML configuration string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DebugError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub backend: String,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub target: String,
    pub halt_before_disconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            halt_before_disconnect: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ImageConfig {
    /// Load address for raw binaries; TMS570 flash starts at 0
    pub base_address: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OpenocdConfig {
    pub path: Option<PathBuf>,
    pub tcl_port: u16,
    pub extra_args: Vec<String>,
}

impl Default for OpenocdConfig {
    fn default() -> Self {
        Self {
            path: None,
            tcl_port: DEFAULT_TCL_PORT,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Parse an address given as "0x10000000" or as a plain decimal number
pub fn parse_address(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex address '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| format!("Invalid address '{}': {}", s, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_positionals() {
        let args = Args::parse_from(["flash-run", "fw.out", "board.cfg"]);
        assert_eq!(
            args.load_paths(),
            Some((Path::new("fw.out"), Path::new("board.cfg")))
        );
        assert_eq!(args.log_level, None);
        assert!(!args.halt_before_disconnect);
    }

    #[test]
    fn test_args_missing_config_rejected() {
        assert!(Args::try_parse_from(["flash-run", "fw.out"]).is_err());
        assert!(Args::try_parse_from(["flash-run"]).is_err());
    }

    #[test]
    fn test_show_config_needs_no_paths() {
        let args = Args::try_parse_from(["flash-run", "--show-config"]).unwrap();
        assert!(args.show_config);
        assert_eq!(args.load_paths(), None);
    }

    #[test]
    fn test_settings_log_level_survives_merge() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();
        let mut config = Config::load(Some(&file.path().to_path_buf())).unwrap();

        config.merge_args(&Args::parse_from(["flash-run", "fw.bin", "board.cfg"]));
        assert_eq!(config.logging.level, "debug");

        config.merge_args(&Args::parse_from([
            "flash-run", "fw.bin", "board.cfg", "--log-level", "warn",
        ]));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.backend, "openocd");
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.session.target, "tms570.cpu");
        assert!(!config.session.halt_before_disconnect);
        assert_eq!(config.openocd.tcl_port, 6666);
    }

    #[test]
    fn test_merge_args_overrides_only_given_flags() {
        let mut config = Config::default();
        config.openocd.tcl_port = 7000;

        let args = Args::parse_from([
            "flash-run",
            "fw.bin",
            "board.cfg",
            "--target", "am263.r5",
            "--timeout-secs", "30",
            "--base-address", "0x08000000",
            "--halt-before-disconnect",
        ]);
        config.merge_args(&args);

        assert_eq!(config.session.target, "am263.r5");
        assert_eq!(config.server.timeout_secs, 30);
        assert_eq!(config.image.base_address, 0x0800_0000);
        assert!(config.session.halt_before_disconnect);
        assert_eq!(config.openocd.tcl_port, 7000);
        assert_eq!(config.server.backend, "openocd");
    }

    #[test]
    fn test_load_partial_settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ntimeout_secs = 20\n\n[openocd]\nextra_args = [\"-d0\"]").unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.server.timeout_secs, 20);
        assert_eq!(config.server.backend, "openocd");
        assert_eq!(config.openocd.extra_args, vec!["-d0".to_string()]);
        assert_eq!(config.session.target, "tms570.cpu");
    }

    #[test]
    fn test_load_rejects_zero_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ntimeout_secs = 0").unwrap();

        let err = Config::load(Some(&file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, DebugError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_missing_settings_file() {
        let path = PathBuf::from("/nonexistent/flash-run.toml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_to_toml_has_sections() {
        let toml_str = Config::default().to_toml().unwrap();
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[session]"));
        assert!(toml_str.contains("[openocd]"));
    }

    #[test]
    fn test_validate_rejects_port_without_room() {
        let mut config = Config::default();
        config.openocd.tcl_port = u16::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x10000000").unwrap(), 0x10000000);
        assert_eq!(parse_address("0X08000000").unwrap(), 0x08000000);
        assert_eq!(parse_address("  4096 ").unwrap(), 4096);
        assert!(parse_address("0xZZZZ").is_err());
        assert!(parse_address("flash").is_err());
    }
}
