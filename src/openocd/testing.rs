//! In-process stand-in for OpenOCD's TCL server

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::client::RESULT_VAR;

const TERMINATOR: u8 = 0x1a;

type Handler = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// Answers TCL commands through `handler` and records what it was sent.
///
/// `catch {cmd} var` / `set var` pairs are unwrapped so the handler and the
/// command log only see `cmd`.
pub(crate) struct FakeTclServer {
    pub port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeTclServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let log = commands.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                serve(stream, handler.clone(), log.clone()).await;
            }
        });

        Self { port, commands, task }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Drop the listener and any open connection
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for FakeTclServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, handler: Handler, log: Arc<Mutex<Vec<String>>>) {
    let catch_suffix = format!("}} {}", RESULT_VAR);
    let fetch = format!("set {}", RESULT_VAR);
    let mut last_result = String::new();

    loop {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte).await {
                Ok(0) | Err(_) => return,
                Ok(_) if byte[0] == TERMINATOR => break,
                Ok(_) => buf.push(byte[0]),
            }
        }
        let command = String::from_utf8_lossy(&buf).to_string();

        let reply = if let Some(inner) = command
            .strip_prefix("catch {")
            .and_then(|rest| rest.strip_suffix(catch_suffix.as_str()))
        {
            log.lock().unwrap().push(inner.to_string());
            match handler(inner) {
                Ok(output) => {
                    last_result = output;
                    "0".to_string()
                }
                Err(message) => {
                    last_result = message;
                    "1".to_string()
                }
            }
        } else if command == fetch {
            last_result.clone()
        } else {
            log.lock().unwrap().push(command.clone());
            handler(&command).unwrap_or_else(|message| message)
        };

        let mut payload = reply.into_bytes();
        payload.push(TERMINATOR);
        if stream.write_all(&payload).await.is_err() {
            return;
        }
    }
}

/// A local port with nothing listening on it
pub(crate) async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
