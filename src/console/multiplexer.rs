//! Console multiplexer: one VM serial stream fanned out to any number of
//! transient clients.
//!
//! The multiplexer owns both pipe ends it is given. VM output is appended
//! to the replay buffer before each broadcast attempt, so a client that
//! attaches later sees a prefix-consistent view: replayed bytes first, then
//! live bytes. Client input is written to the VM in arrival order; no order
//! is defined across clients.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

use crate::console::replay::ReplayBuffer;
use crate::socket::{DEFAULT_BACKLOG, LocalSocket, SocketError};

#[derive(Debug, Error)]
pub enum ConsoleListenerError {
    #[error("console multiplexer is already running")]
    AlreadyRunning,

    #[error("failed to open console socket")]
    Bind(#[source] SocketError),
}

struct Client {
    socket: Arc<LocalSocket>,
    reader: JoinHandle<()>,
}

type ClientMap = Arc<Mutex<HashMap<u64, Client>>>;

struct Running {
    output_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
    clients: ClientMap,
}

#[derive(Default)]
pub struct ConsoleMultiplexer {
    running: Option<Running>,
}

impl ConsoleMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `socket_path`, start fanning `vm_out` to clients and client
    /// input into `vm_in`.
    pub async fn start(
        &mut self,
        socket_path: &Path,
        vm_in: pipe::Sender,
        vm_out: pipe::Receiver,
    ) -> Result<(), ConsoleListenerError> {
        if self.running.is_some() {
            return Err(ConsoleListenerError::AlreadyRunning);
        }

        let mut server = LocalSocket::new().map_err(ConsoleListenerError::Bind)?;
        server.bind(socket_path).map_err(ConsoleListenerError::Bind)?;
        server
            .listen(DEFAULT_BACKLOG)
            .map_err(ConsoleListenerError::Bind)?;

        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        let replay = Arc::new(Mutex::new(ReplayBuffer::new()));
        let vm_in = Arc::new(tokio::sync::Mutex::new(vm_in));
        let next_id = Arc::new(AtomicU64::new(0));

        let output_task = tokio::spawn(pump_output(vm_out, replay.clone(), clients.clone()));
        let accept_task = tokio::spawn(accept_loop(
            server,
            replay.clone(),
            clients.clone(),
            vm_in,
            next_id,
        ));

        self.running = Some(Running {
            output_task,
            accept_task,
            clients,
        });
        Ok(())
    }

    /// Tear everything down: accept loop, per-client readers, all client
    /// sockets, the listening socket (unlinking its path), and the serial
    /// reader. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.accept_task.abort();
        running.output_task.abort();
        // Awaiting the aborted tasks guarantees the listener is dropped
        // (and its path unlinked) before we return.
        let _ = running.accept_task.await;
        let _ = running.output_task.await;

        let clients: Vec<Client> = running
            .clients
            .lock()
            .unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for client in clients {
            client.reader.abort();
            let _ = client.reader.await;
            drop(client.socket);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Read VM serial output and broadcast each chunk.
async fn pump_output(
    mut vm_out: pipe::Receiver,
    replay: Arc<Mutex<ReplayBuffer>>,
    clients: ClientMap,
) {
    let mut buf = [0u8; 4096];
    loop {
        match vm_out.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                // Replay append happens-before the broadcast attempt.
                replay.lock().unwrap().append(chunk);

                let targets: Vec<(u64, Arc<LocalSocket>)> = clients
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(id, c)| (*id, c.socket.clone()))
                    .collect();

                let mut failed = Vec::new();
                for (id, socket) in targets {
                    if let Err(err) = socket.send(chunk).await {
                        tracing::debug!(client = id, %err, "dropping console client");
                        failed.push(id);
                    }
                }
                if !failed.is_empty() {
                    let mut map = clients.lock().unwrap();
                    for id in failed {
                        if let Some(client) = map.remove(&id) {
                            client.reader.abort();
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(%err, "serial output reader stopped");
                break;
            }
        }
    }
}

/// Accept clients forever; each gets the replay snapshot, then live data.
async fn accept_loop(
    server: LocalSocket,
    replay: Arc<Mutex<ReplayBuffer>>,
    clients: ClientMap,
    vm_in: Arc<tokio::sync::Mutex<pipe::Sender>>,
    next_id: Arc<AtomicU64>,
) {
    loop {
        match server.accept().await {
            Ok(peer) => {
                let snapshot = replay.lock().unwrap().snapshot();
                if !snapshot.is_empty() && peer.send(&snapshot).await.is_err() {
                    // Could not even seed the client; drop it on the floor.
                    continue;
                }

                let id = next_id.fetch_add(1, Ordering::SeqCst);
                let peer = Arc::new(peer);
                let reader = tokio::spawn(client_reader(
                    id,
                    peer.clone(),
                    vm_in.clone(),
                    clients.clone(),
                ));
                clients.lock().unwrap().insert(
                    id,
                    Client {
                        socket: peer,
                        reader,
                    },
                );
                tracing::debug!(client = id, "console client attached");
            }
            Err(err) => {
                tracing::debug!(%err, "console accept failed, backing off");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Forward one client's input into the VM until it hangs up.
async fn client_reader(
    id: u64,
    socket: Arc<LocalSocket>,
    vm_in: Arc<tokio::sync::Mutex<pipe::Sender>>,
    clients: ClientMap,
) {
    loop {
        match socket.receive(4096).await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => {
                let mut pipe = vm_in.lock().await;
                if pipe.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    clients.lock().unwrap().remove(&id);
    tracing::debug!(client = id, "console client detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    use crate::socket::set_nonblocking;

    /// Pipe pair with the daemon-side ends wrapped for async use; the
    /// VM-side ends are plain `File`s the tests read and write directly.
    fn serial_pipes() -> ((File, pipe::Sender), (pipe::Receiver, File)) {
        let (in_read, in_write) = nix::unistd::pipe().unwrap();
        let (out_read, out_write) = nix::unistd::pipe().unwrap();
        set_nonblocking(in_write.as_raw_fd()).unwrap();
        set_nonblocking(out_read.as_raw_fd()).unwrap();
        let vm_in = pipe::Sender::from_owned_fd(in_write).unwrap();
        let vm_out = pipe::Receiver::from_owned_fd(out_read).unwrap();
        ((File::from(in_read), vm_in), (vm_out, File::from(out_write)))
    }

    async fn recv_with_timeout(sock: &LocalSocket, max: usize) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), sock.receive(max))
            .await
            .expect("receive timed out")
            .expect("receive failed")
    }

    #[tokio::test]
    async fn broadcasts_to_all_clients_and_replays_to_late_joiners() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("console.sock");

        let ((_in_read, vm_in), (vm_out, mut out_write)) = serial_pipes();
        let mut mux = ConsoleMultiplexer::new();
        mux.start(&sock_path, vm_in, vm_out).await.unwrap();

        let early = LocalSocket::connect(&sock_path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        out_write.write_all(b"\x1b[32mboot ok\x1b[0m\r\n").unwrap();
        assert_eq!(recv_with_timeout(&early, 256).await, b"\x1b[32mboot ok\x1b[0m\r\n");

        // A client joining now sees the stripped replay first.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let late = LocalSocket::connect(&sock_path).await.unwrap();
        assert_eq!(recv_with_timeout(&late, 256).await, b"boot ok\r\n");

        // Both observe subsequent live output.
        out_write.write_all(b"more").unwrap();
        assert_eq!(recv_with_timeout(&early, 256).await, b"more");
        assert_eq!(recv_with_timeout(&late, 256).await, b"more");

        mux.stop().await;
        assert!(!sock_path.exists());
    }

    #[tokio::test]
    async fn client_input_reaches_vm_and_disconnect_spares_others() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("console.sock");

        let ((mut in_read, vm_in), (vm_out, mut out_write)) = serial_pipes();
        let mut mux = ConsoleMultiplexer::new();
        mux.start(&sock_path, vm_in, vm_out).await.unwrap();

        let alpha = LocalSocket::connect(&sock_path).await.unwrap();
        let beta = LocalSocket::connect(&sock_path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        alpha.send(b"ls\r").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut buf = [0u8; 16];
        let n = in_read.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ls\r");

        // alpha hangs up; beta keeps receiving broadcasts.
        drop(alpha);
        tokio::time::sleep(Duration::from_millis(100)).await;
        out_write.write_all(b"still here").unwrap();
        assert_eq!(recv_with_timeout(&beta, 256).await, b"still here");

        mux.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("console.sock");

        let ((_in_read, vm_in), (vm_out, _out_write)) = serial_pipes();
        let mut mux = ConsoleMultiplexer::new();
        mux.start(&sock_path, vm_in, vm_out).await.unwrap();
        assert!(mux.is_running());

        mux.stop().await;
        mux.stop().await;
        assert!(!mux.is_running());
        assert!(!sock_path.exists());

        let ((_in_read2, vm_in2), (vm_out2, _out_write2)) = serial_pipes();
        mux.start(&sock_path, vm_in2, vm_out2).await.unwrap();
        let _client = LocalSocket::connect(&sock_path).await.unwrap();
        mux.stop().await;
    }

    #[tokio::test]
    async fn second_start_while_running_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("console.sock");

        let ((_a, vm_in), (vm_out, _b)) = serial_pipes();
        let mut mux = ConsoleMultiplexer::new();
        mux.start(&sock_path, vm_in, vm_out).await.unwrap();

        let ((_c, vm_in2), (vm_out2, _d)) = serial_pipes();
        assert!(matches!(
            mux.start(&sock_path, vm_in2, vm_out2).await,
            Err(ConsoleListenerError::AlreadyRunning)
        ));
        mux.stop().await;
    }
}
