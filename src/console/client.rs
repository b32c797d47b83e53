//! Interactive console session: stdin/stdout bridged onto a VM's console
//! socket with the terminal in raw mode.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

use crate::socket::LocalSocket;
use crate::terminal::RawModeGuard;

/// Ctrl-] — ends the session locally without touching the VM.
pub const DETACH_KEY: u8 = 0x1D;

#[derive(Debug, Error)]
pub enum ConsoleConnectionError {
    #[error("console attach requires a terminal")]
    NotATerminal,

    #[error("failed to connect to console: {0}")]
    ConnectionFailed(String),
}

pub struct ConsoleClient {
    socket_path: PathBuf,
    vm_name: String,
}

impl ConsoleClient {
    pub fn new(socket_path: PathBuf, vm_name: &str) -> Self {
        Self {
            socket_path,
            vm_name: vm_name.to_string(),
        }
    }

    /// Run the session until detach (Ctrl-], stdin EOF, or the VM side
    /// closing).
    ///
    /// Teardown order matters: the socket closes first so the multiplexer
    /// drops this client promptly, the terminal is restored before any
    /// user-visible message, and only then is `notify` called.
    pub async fn run(
        &self,
        mut notify: impl FnMut(&str),
    ) -> Result<(), ConsoleConnectionError> {
        if !std::io::stdin().is_terminal() {
            return Err(ConsoleConnectionError::NotATerminal);
        }

        let socket = LocalSocket::connect(&self.socket_path)
            .await
            .map_err(|e| ConsoleConnectionError::ConnectionFailed(e.to_string()))?;
        let socket = Arc::new(socket);

        let raw_mode =
            RawModeGuard::new().map_err(|e| ConsoleConnectionError::ConnectionFailed(e.to_string()))?;

        let detach = Arc::new(Notify::new());
        let stdin_task = tokio::spawn(forward_stdin(socket.clone(), detach.clone()));

        // Socket → stdout until the stream ends or detach is signalled.
        let output = async {
            let mut stdout = std::io::stdout();
            loop {
                match socket.receive(4096).await {
                    Ok(chunk) if chunk.is_empty() => break,
                    Ok(chunk) => {
                        if stdout.write_all(&chunk).is_err() {
                            break;
                        }
                        let _ = stdout.flush();
                    }
                    Err(_) => break,
                }
            }
        };

        tokio::select! {
            _ = detach.notified() => {}
            _ = output => {}
        }

        stdin_task.abort();
        let _ = stdin_task.await;

        // Last reference: closes the socket before the terminal is restored.
        drop(socket);
        drop(raw_mode);

        notify("Detached from VM console");
        notify(&format!(
            "VM '{}' continues running in the background",
            self.vm_name
        ));
        Ok(())
    }
}

/// Forward stdin chunks to the socket; a chunk containing the detach key
/// signals detach and is not forwarded.
async fn forward_stdin(socket: Arc<LocalSocket>, detach: Arc<Notify>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                detach.notify_one();
                break;
            }
            Ok(n) => {
                let chunk = &buf[..n];
                if chunk.contains(&DETACH_KEY) {
                    detach.notify_one();
                    break;
                }
                if socket.send(chunk).await.is_err() {
                    detach.notify_one();
                    break;
                }
            }
            Err(_) => {
                detach.notify_one();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The detach scan applied to stdin chunks, extracted for testing: a
    /// chunk with the key is dropped wholesale.
    fn chunk_disposition(chunk: &[u8]) -> Option<&[u8]> {
        if chunk.contains(&DETACH_KEY) {
            None
        } else {
            Some(chunk)
        }
    }

    #[test]
    fn detach_key_suppresses_the_whole_chunk() {
        assert_eq!(chunk_disposition(b"ls -la\r"), Some(b"ls -la\r".as_slice()));
        assert_eq!(chunk_disposition(&[b'a', DETACH_KEY, b'b']), None);
        assert_eq!(chunk_disposition(&[DETACH_KEY]), None);
    }
}
