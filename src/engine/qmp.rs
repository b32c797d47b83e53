//! Minimal QMP (QEMU Machine Protocol) client.
//!
//! QMP is line-delimited JSON over a Unix socket. The server greets on
//! connect; `qmp_capabilities` must be negotiated before any command.
//! Asynchronous events can arrive between responses and are logged, not
//! returned.

use std::path::Path;

use serde_json::{Value, json};

use crate::error::RunnerError;
use crate::socket::LocalSocket;

pub struct QmpClient {
    socket: LocalSocket,
    pending: Vec<u8>,
}

impl QmpClient {
    /// Connect, consume the greeting, negotiate capabilities.
    pub async fn connect(path: &Path) -> Result<Self, RunnerError> {
        let socket = LocalSocket::connect(path).await.map_err(|e| {
            RunnerError::RuntimeError(format!("QMP connect to {} failed: {e}", path.display()))
        })?;
        let mut client = Self {
            socket,
            pending: Vec::new(),
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(RunnerError::RuntimeError(format!(
                "unexpected QMP greeting: {greeting}"
            )));
        }
        client.execute("qmp_capabilities").await?;
        Ok(client)
    }

    /// Run a command and return its `return` payload.
    pub async fn execute(&mut self, command: &str) -> Result<Value, RunnerError> {
        let line = format!("{}\n", json!({ "execute": command }));
        self.socket
            .send(line.as_bytes())
            .await
            .map_err(|e| RunnerError::RuntimeError(format!("QMP send failed: {e}")))?;

        loop {
            let message = self.read_message().await?;
            if let Some(event) = message.get("event").and_then(Value::as_str) {
                log_event(event);
                continue;
            }
            if let Some(error) = message.get("error") {
                return Err(RunnerError::RuntimeError(format!(
                    "QMP command '{command}' failed: {error}"
                )));
            }
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            tracing::debug!(%message, "ignoring unrecognized QMP message");
        }
    }

    /// Next newline-terminated JSON message.
    async fn read_message(&mut self) -> Result<Value, RunnerError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return serde_json::from_slice(&line).map_err(|e| {
                    RunnerError::RuntimeError(format!("invalid QMP message: {e}"))
                });
            }
            let chunk = self
                .socket
                .receive(4096)
                .await
                .map_err(|e| RunnerError::RuntimeError(format!("QMP receive failed: {e}")))?;
            if chunk.is_empty() {
                return Err(RunnerError::RuntimeError("QMP connection closed".into()));
            }
            self.pending.extend_from_slice(&chunk);
        }
    }
}

fn log_event(event: &str) {
    match event {
        "SHUTDOWN" | "POWERDOWN" => tracing::info!(event, "guest is shutting down"),
        "STOP" | "RESUME" => tracing::debug!(event, "guest execution state changed"),
        _ => tracing::debug!(event, "QMP event"),
    }
}
