//! OpenOCD TCL socket client
//!
//! Communicates with OpenOCD's TCL server (default port 6666).
//! Protocol: send command as UTF-8, terminated by 0x1a (SUB character).
//! Response: UTF-8 text terminated by 0x1a.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// TCL protocol terminator byte (ASCII SUB / Ctrl-Z)
const TCL_TERMINATOR: u8 = 0x1a;

/// Variable holding the result of the last checked command
pub(crate) const RESULT_VAR: &str = "flash_run_result";

/// Lines of OpenOCD stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// OpenOCD TCL client connected to a running OpenOCD instance
pub struct OpenocdClient {
    stream: TcpStream,
    /// OpenOCD child process, absent when attached to an external instance
    process: Option<Child>,
    stderr_tail: StderrTail,
    timeout: Duration,
    /// Replies OpenOCD still owes for commands whose read was abandoned
    pending: usize,
    /// A command write was abandoned before its terminator went out
    partial_write: bool,
    /// TCL port this session uses
    pub tcl_port: u16,
}

impl OpenocdClient {
    /// Start OpenOCD with the given config file and connect to its TCL socket.
    ///
    /// The gdb and telnet ports follow the TCL port.
    pub async fn start(
        openocd_path: &Path,
        cfg_file: &Path,
        extra_args: &[String],
        base_tcl_port: u16,
        timeout: Duration,
    ) -> Result<Self, OpenocdError> {
        let tcl_port = base_tcl_port;
        let gdb_port = base_tcl_port + 1;
        let telnet_port = base_tcl_port + 2;

        info!(
            "Starting OpenOCD: {} -f {} (TCL port {})",
            openocd_path.display(),
            cfg_file.display(),
            tcl_port
        );

        let mut cmd = Command::new(openocd_path);
        cmd.arg("-f").arg(cfg_file)
            .arg("-c").arg(format!("tcl_port {}", tcl_port))
            .arg("-c").arg(format!("gdb_port {}", gdb_port))
            .arg("-c").arg(format!("telnet_port {}", telnet_port));

        for arg in extra_args {
            cmd.arg(arg);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut process = cmd.spawn().map_err(|e| {
            OpenocdError::LaunchFailed(format!("Failed to spawn openocd: {}", e))
        })?;

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = process.stderr.take() {
            tokio::spawn(drain_stderr(stderr, stderr_tail.clone()));
        }

        let stream = Self::wait_for_connection(tcl_port, timeout, &mut process, &stderr_tail).await?;

        info!("Connected to OpenOCD TCL on port {}", tcl_port);

        Ok(Self {
            stream,
            process: Some(process),
            stderr_tail,
            timeout,
            pending: 0,
            partial_write: false,
            tcl_port,
        })
    }

    /// Attach to an OpenOCD instance that is already listening on `tcl_port`
    pub async fn attach(tcl_port: u16, timeout: Duration) -> Result<Self, OpenocdError> {
        let stream = TcpStream::connect(format!("127.0.0.1:{}", tcl_port))
            .await
            .map_err(|e| {
                OpenocdError::ConnectionFailed(format!(
                    "Failed to connect to OpenOCD TCL port {}: {}",
                    tcl_port, e
                ))
            })?;

        Ok(Self {
            stream,
            process: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            timeout,
            pending: 0,
            partial_write: false,
            tcl_port,
        })
    }

    /// Wait for OpenOCD TCL port to become available, retrying with backoff.
    ///
    /// Gives up early when the process exits, which is how OpenOCD reports a
    /// configuration it cannot run.
    async fn wait_for_connection(
        port: u16,
        timeout: Duration,
        process: &mut Child,
        stderr_tail: &StderrTail,
    ) -> Result<TcpStream, OpenocdError> {
        let start = tokio::time::Instant::now();
        let mut delay = Duration::from_millis(50);

        loop {
            if let Ok(Some(status)) = process.try_wait() {
                // let the drain task catch up with the last lines
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Err(OpenocdError::Exited {
                    status: status.to_string(),
                    stderr: tail_text(stderr_tail),
                });
            }

            match TcpStream::connect(format!("127.0.0.1:{}", port)).await {
                Ok(stream) => return Ok(stream),
                Err(_) if start.elapsed() < timeout => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(500));
                }
                Err(e) => {
                    return Err(OpenocdError::ConnectionFailed(format!(
                        "Failed to connect to OpenOCD TCL port {} after {:?}: {}",
                        port, timeout, e
                    )));
                }
            }
        }
    }

    /// Bound the wait for each command response
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a TCL command to OpenOCD and read the response.
    ///
    /// Replies left over from an earlier timed-out or cancelled command are
    /// read and discarded first, so the response always matches `command`.
    pub async fn send_command(&mut self, command: &str) -> Result<String, OpenocdError> {
        self.resync().await?;

        debug!("OpenOCD TCL command: {}", command);

        let mut payload = command.as_bytes().to_vec();
        payload.push(TCL_TERMINATOR);

        self.partial_write = true;
        self.stream.write_all(&payload).await.map_err(|e| {
            OpenocdError::CommandFailed(format!("Write failed: {}", e))
        })?;
        self.partial_write = false;
        self.pending += 1;

        let response = self.read_response().await?;

        debug!("OpenOCD TCL response: {}", response);
        Ok(response)
    }

    /// Run a command and report a TCL error as [`OpenocdError::CommandFailed`].
    ///
    /// The TCL server answers with plain text whether or not the command
    /// failed, so the command is wrapped in `catch` and the outcome read back.
    pub async fn eval(&mut self, command: &str) -> Result<String, OpenocdError> {
        let code = self
            .send_command(&format!("catch {{{}}} {}", command, RESULT_VAR))
            .await?;
        let output = self.send_command(&format!("set {}", RESULT_VAR)).await?;

        match code.trim() {
            "0" => Ok(output),
            _ => Err(OpenocdError::CommandFailed(output.trim().to_string())),
        }
    }

    /// Drain replies owed for abandoned commands
    async fn resync(&mut self) -> Result<(), OpenocdError> {
        if self.partial_write {
            // close the truncated command so OpenOCD answers it
            self.stream.write_all(&[TCL_TERMINATOR]).await.map_err(|e| {
                OpenocdError::CommandFailed(format!("Write failed: {}", e))
            })?;
            self.partial_write = false;
            self.pending += 1;
        }

        while self.pending > 0 {
            let stale = self.read_response().await?;
            debug!("Discarded stale OpenOCD TCL response: {}", stale);
        }
        Ok(())
    }

    /// Read response bytes until 0x1a terminator.
    ///
    /// The owed-reply count only drops once the terminator is consumed, so a
    /// read cut short leaves the rest of the reply to [`Self::resync`].
    async fn read_response(&mut self) -> Result<String, OpenocdError> {
        let mut buf = Vec::with_capacity(4096);
        let mut byte = [0u8; 1];

        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let read_future = self.stream.read(&mut byte);

            match tokio::time::timeout_at(deadline, read_future).await {
                Ok(Ok(0)) => {
                    return Err(OpenocdError::ConnectionClosed);
                }
                Ok(Ok(_)) => {
                    if byte[0] == TCL_TERMINATOR {
                        self.pending = self.pending.saturating_sub(1);
                        break;
                    }
                    buf.push(byte[0]);
                }
                Ok(Err(e)) => {
                    return Err(OpenocdError::CommandFailed(format!("Read failed: {}", e)));
                }
                Err(_) => {
                    return Err(OpenocdError::Timeout(self.timeout));
                }
            }
        }

        String::from_utf8(buf).map_err(|e| {
            OpenocdError::CommandFailed(format!("Invalid UTF-8 in response: {}", e))
        })
    }

    /// Shutdown OpenOCD gracefully
    pub async fn shutdown(&mut self) -> Result<(), OpenocdError> {
        info!("Shutting down OpenOCD");

        if !self.is_running() {
            return Err(OpenocdError::ConnectionClosed);
        }

        // OpenOCD closes the socket while answering, so the reply is not checked
        let _ = self.send_command("shutdown").await;

        if let Some(process) = self.process.as_mut() {
            let exited = tokio::time::timeout(Duration::from_secs(1), process.wait()).await;
            match exited {
                Ok(Ok(status)) => debug!("OpenOCD exited: {}", status),
                _ => {
                    if let Err(e) = process.kill().await {
                        warn!("Kill after shutdown: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Check if the OpenOCD process is still running
    pub fn is_running(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            // attached instances are judged by the socket on the next command
            None => true,
        }
    }

    /// Last lines OpenOCD wrote to stderr
    pub fn stderr_tail(&self) -> String {
        tail_text(&self.stderr_tail)
    }
}

/// Forward OpenOCD's stderr to the log and keep the last lines
async fn drain_stderr(stderr: tokio::process::ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "openocd", "{}", line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

fn tail_text(tail: &StderrTail) -> String {
    tail.lock()
        .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        .unwrap_or_default()
}

/// Parse the output of `target names`
pub fn parse_target_names(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum OpenocdError {
    #[error("OpenOCD launch failed: {0}")]
    LaunchFailed(String),

    #[error("OpenOCD exited ({status}): {stderr}")]
    Exited { status: String, stderr: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by OpenOCD")]
    ConnectionClosed,

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Command timeout after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openocd::testing::FakeTclServer;

    #[test]
    fn test_tcl_terminator_value() {
        assert_eq!(TCL_TERMINATOR, 0x1a);
        assert_eq!(TCL_TERMINATOR, 26);
    }

    #[test]
    fn test_parse_target_names() {
        assert_eq!(parse_target_names("tms570.cpu\n"), vec!["tms570.cpu"]);
        assert_eq!(
            parse_target_names("am263.r5f0 am263.r5f1"),
            vec!["am263.r5f0", "am263.r5f1"]
        );
        assert!(parse_target_names("").is_empty());
    }

    #[tokio::test]
    async fn test_send_command_round_trip() {
        let server = FakeTclServer::start(|cmd| match cmd {
            "version" => Ok("Open On-Chip Debugger 0.12.0".to_string()),
            _ => Err("invalid command name".to_string()),
        })
        .await;

        let mut client = OpenocdClient::attach(server.port, Duration::from_secs(1)).await.unwrap();
        let response = client.send_command("version").await.unwrap();
        assert_eq!(response, "Open On-Chip Debugger 0.12.0");
        assert_eq!(server.commands(), vec!["version".to_string()]);
    }

    #[tokio::test]
    async fn test_eval_reports_tcl_errors() {
        let server = FakeTclServer::start(|cmd| match cmd {
            "target names" => Ok("tms570.cpu".to_string()),
            other => Err(format!("invalid command name \"{}\"", other)),
        })
        .await;

        let mut client = OpenocdClient::attach(server.port, Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.eval("target names").await.unwrap(), "tms570.cpu");

        let err = client.eval("bogus").await.unwrap_err();
        match err {
            OpenocdError::CommandFailed(msg) => assert!(msg.contains("bogus")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_connection_detected() {
        let server = FakeTclServer::start(|_| Ok(String::new())).await;
        let mut client = OpenocdClient::attach(server.port, Duration::from_secs(1)).await.unwrap();

        server.close();
        let err = client.send_command("version").await.unwrap_err();
        assert!(matches!(
            err,
            OpenocdError::ConnectionClosed | OpenocdError::CommandFailed(_)
        ));
    }

    /// TCL server on its own thread that answers `flash write_image` late
    fn spawn_slow_server(delay: Duration) -> u16 {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut last = String::new();
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            while let Ok(1) = stream.read(&mut byte) {
                if byte[0] != TCL_TERMINATOR {
                    buf.push(byte[0]);
                    continue;
                }
                let command = String::from_utf8_lossy(&buf).to_string();
                buf.clear();
                let reply = if command.starts_with("catch {flash write_image") {
                    std::thread::sleep(delay);
                    last = String::new();
                    "0".to_string()
                } else if command.starts_with("catch {target names}") {
                    last = "tms570.cpu".to_string();
                    "0".to_string()
                } else if command.starts_with("catch {") {
                    last = "running".to_string();
                    "0".to_string()
                } else {
                    last.clone()
                };
                let mut payload = reply.into_bytes();
                payload.push(TCL_TERMINATOR);
                if stream.write_all(&payload).is_err() {
                    return;
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_late_reply_does_not_shift_responses() {
        let port = spawn_slow_server(Duration::from_millis(600));
        let mut client = OpenocdClient::attach(port, Duration::from_millis(400)).await.unwrap();

        let err = client.eval("flash write_image erase {fw.out}").await.unwrap_err();
        assert!(matches!(err, OpenocdError::Timeout(_)));

        // the late `0` for the write is discarded, not read as this reply
        assert_eq!(client.eval("target names").await.unwrap(), "tms570.cpu");
        assert_eq!(client.eval("tms570.cpu curstate").await.unwrap(), "running");
    }

    #[tokio::test]
    async fn test_cancelled_command_does_not_shift_responses() {
        let port = spawn_slow_server(Duration::from_millis(300));
        let mut client = OpenocdClient::attach(port, Duration::from_secs(2)).await.unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            client.eval("flash write_image erase {fw.out}"),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(client.eval("target names").await.unwrap(), "tms570.cpu");
    }

    #[tokio::test]
    async fn test_attach_without_server_fails() {
        let port = crate::openocd::testing::unused_port().await;
        let result = OpenocdClient::attach(port, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(OpenocdError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_start_reports_early_exit() {
        // `false` exits immediately, standing in for OpenOCD rejecting its config
        let Ok(path) = crate::openocd::which("false") else {
            return;
        };
        let port = crate::openocd::testing::unused_port().await;
        let result = OpenocdClient::start(
            &path,
            Path::new("board.cfg"),
            &[],
            port,
            Duration::from_secs(2),
        )
        .await;
        assert!(matches!(result, Err(OpenocdError::Exited { .. })));
    }
}
