//! Non-blocking Unix stream socket primitive.
//!
//! All daemon-side rendezvous (console multiplexer, QMP) goes through this
//! type: descriptors are created `O_NONBLOCK`/`CLOEXEC` and progress is
//! awaited through the runtime's readiness notifications (`AsyncFd`), so no
//! task ever parks in a blocking syscall.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use futures_util::Stream;
use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 5;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket is closed")]
    InvalidDescriptor,

    #[error("socket path too long: {0}")]
    AddressTooLong(PathBuf),

    #[error("peer disconnected")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,

    #[error("socket error: {message} (errno {errno})")]
    SystemError { errno: i32, message: String },
}

impl SocketError {
    fn last_os() -> Self {
        io::Error::last_os_error().into()
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::ESHUTDOWN) => {
                SocketError::Disconnected
            }
            Some(libc::ETIMEDOUT) => SocketError::Timeout,
            Some(libc::EBADF) => SocketError::InvalidDescriptor,
            Some(errno) => SocketError::SystemError {
                errno,
                message: err.to_string(),
            },
            None => SocketError::SystemError {
                errno: 0,
                message: err.to_string(),
            },
        }
    }
}

fn socket_address(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t), SocketError> {
    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };

    // Leave room for the trailing NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(SocketError::AddressTooLong(path.to_path_buf()));
    }

    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    Ok((addr, len))
}

fn new_stream_fd() -> Result<OwnedFd, SocketError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(SocketError::last_os());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Put an inherited descriptor (e.g. a pipe end) into non-blocking mode so
/// it can be driven by the runtime.
pub fn set_nonblocking(fd: std::os::fd::RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A local stream socket: either a listener (after [`bind`](Self::bind) +
/// [`listen`](Self::listen)) or a connected peer.
///
/// Closing unlinks any bound path; `close` is idempotent and also runs on
/// drop.
#[derive(Debug)]
pub struct LocalSocket {
    io: Option<AsyncFd<OwnedFd>>,
    bound_path: Option<PathBuf>,
}

impl LocalSocket {
    /// Create an unbound, unconnected socket.
    pub fn new() -> Result<Self, SocketError> {
        let fd = new_stream_fd()?;
        let io = AsyncFd::new(fd).map_err(SocketError::from)?;
        Ok(Self {
            io: Some(io),
            bound_path: None,
        })
    }

    fn from_owned(fd: OwnedFd) -> Result<Self, SocketError> {
        Ok(Self {
            io: Some(AsyncFd::new(fd).map_err(SocketError::from)?),
            bound_path: None,
        })
    }

    fn io(&self) -> Result<&AsyncFd<OwnedFd>, SocketError> {
        self.io.as_ref().ok_or(SocketError::InvalidDescriptor)
    }

    /// Bind to a filesystem path, replacing any existing entry there.
    ///
    /// The path length is checked against the platform address limit before
    /// anything touches the filesystem.
    pub fn bind(&mut self, path: &Path) -> Result<(), SocketError> {
        let (addr, len) = socket_address(path)?;
        let io = self.io()?;

        // A stale socket file from a previous run would make bind fail.
        let _ = std::fs::remove_file(path);

        let rc = unsafe {
            libc::bind(
                io.get_ref().as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if rc < 0 {
            return Err(SocketError::last_os());
        }
        self.bound_path = Some(path.to_path_buf());
        Ok(())
    }

    /// Mark the socket as accepting connections.
    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        let io = self.io()?;
        let rc = unsafe { libc::listen(io.get_ref().as_raw_fd(), backlog) };
        if rc < 0 {
            return Err(SocketError::last_os());
        }
        Ok(())
    }

    /// Wait for an inbound connection and return the connected peer socket.
    pub async fn accept(&self) -> Result<LocalSocket, SocketError> {
        let io = self.io()?;
        let fd = io
            .async_io(Interest::READABLE, |inner| {
                let rc = unsafe {
                    libc::accept4(
                        inner.as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(unsafe { OwnedFd::from_raw_fd(rc) })
                }
            })
            .await
            .map_err(SocketError::from)?;
        LocalSocket::from_owned(fd)
    }

    /// Connect to a listening socket at `path`.
    pub async fn connect(path: &Path) -> Result<LocalSocket, SocketError> {
        let (addr, len) = socket_address(path)?;
        let fd = new_stream_fd()?;
        let raw = fd.as_raw_fd();
        let io = AsyncFd::new(fd).map_err(SocketError::from)?;

        let rc = unsafe {
            libc::connect(
                raw,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                let _guard = io.writable().await.map_err(SocketError::from)?;
                let mut so_error: libc::c_int = 0;
                let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        raw,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut so_error as *mut libc::c_int as *mut libc::c_void,
                        &mut optlen,
                    )
                };
                if rc < 0 {
                    return Err(SocketError::last_os());
                }
                if so_error != 0 {
                    return Err(io::Error::from_raw_os_error(so_error).into());
                }
            } else {
                return Err(err.into());
            }
        }

        Ok(Self {
            io: Some(io),
            bound_path: None,
        })
    }

    /// Write the complete buffer. A zero-length kernel write means the peer
    /// is gone and fails with [`SocketError::Disconnected`].
    pub async fn send(&self, buf: &[u8]) -> Result<(), SocketError> {
        let io = self.io()?;
        let mut written = 0usize;
        while written < buf.len() {
            let remaining = &buf[written..];
            let n = io
                .async_io(Interest::WRITABLE, |inner| {
                    let rc = unsafe {
                        libc::write(
                            inner.as_raw_fd(),
                            remaining.as_ptr() as *const libc::c_void,
                            remaining.len(),
                        )
                    };
                    if rc < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(rc as usize)
                    }
                })
                .await
                .map_err(SocketError::from)?;
            if n == 0 {
                return Err(SocketError::Disconnected);
            }
            written += n;
        }
        Ok(())
    }

    /// Read up to `max` bytes. An empty result means the peer closed.
    pub async fn receive(&self, max: usize) -> Result<Vec<u8>, SocketError> {
        let io = self.io()?;
        let mut buf = vec![0u8; max];
        let n = io
            .async_io(Interest::READABLE, |inner| {
                let rc = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            })
            .await
            .map_err(SocketError::from)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Lazy sequence of non-empty chunks, ending on orderly close or after
    /// yielding one error.
    pub fn receive_stream(
        &self,
        max: usize,
    ) -> impl Stream<Item = Result<Vec<u8>, SocketError>> + '_ {
        futures_util::stream::unfold((self, false), move |(sock, done)| async move {
            if done {
                return None;
            }
            match sock.receive(max).await {
                Ok(chunk) if chunk.is_empty() => None,
                Ok(chunk) => Some((Ok(chunk), (sock, false))),
                Err(err) => Some((Err(err), (sock, true))),
            }
        })
    }

    /// Close the descriptor and unlink any bound path. Idempotent.
    pub fn close(&mut self) {
        self.io = None;
        if let Some(path) = self.bound_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::StreamExt;

    fn sock_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[tokio::test]
    async fn bind_rejects_overlong_path_without_touching_fs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x".repeat(200));

        let mut sock = LocalSocket::new().unwrap();
        match sock.bind(&path) {
            Err(SocketError::AddressTooLong(p)) => assert_eq!(p, path),
            other => panic!("expected AddressTooLong, got {other:?}"),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn round_trip_and_close_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let path = sock_path(&dir, "rt.sock");

        let mut server = LocalSocket::new().unwrap();
        server.bind(&path).unwrap();
        server.listen(DEFAULT_BACKLOG).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let client = LocalSocket::connect(&path).await.unwrap();
                client.send(b"hello").await.unwrap();
                client
            }
        });

        let peer = server.accept().await.unwrap();
        let chunk = peer.receive(64).await.unwrap();
        assert_eq!(chunk, b"hello");

        let client = client.await.unwrap();
        drop(client);
        // Orderly close reads as an empty chunk.
        let chunk = peer.receive(64).await.unwrap();
        assert!(chunk.is_empty());

        server.close();
        assert!(!path.exists());
        server.close(); // idempotent
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = sock_path(&dir, "stale.sock");
        std::fs::write(&path, b"stale").unwrap();

        let mut server = LocalSocket::new().unwrap();
        server.bind(&path).unwrap();
        server.listen(DEFAULT_BACKLOG).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn connect_to_absent_path_is_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = sock_path(&dir, "nobody.sock");
        match LocalSocket::connect(&path).await {
            Err(SocketError::SystemError { errno, .. }) => {
                assert!(errno == libc::ENOENT || errno == libc::ECONNREFUSED);
            }
            other => panic!("expected SystemError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_closed_peer_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = sock_path(&dir, "gone.sock");

        let mut server = LocalSocket::new().unwrap();
        server.bind(&path).unwrap();
        server.listen(DEFAULT_BACKLOG).unwrap();

        let client = LocalSocket::connect(&path).await.unwrap();
        let peer = server.accept().await.unwrap();
        drop(peer);

        // The first writes may land in the kernel buffer; keep writing
        // until the disconnect surfaces.
        let mut saw_disconnect = false;
        for _ in 0..64 {
            match client.send(&[0u8; 4096]).await {
                Ok(()) => continue,
                Err(SocketError::Disconnected) => {
                    saw_disconnect = true;
                    break;
                }
                Err(other) => panic!("expected Disconnected, got {other:?}"),
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn receive_stream_yields_chunks_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = sock_path(&dir, "stream.sock");

        let mut server = LocalSocket::new().unwrap();
        server.bind(&path).unwrap();
        server.listen(DEFAULT_BACKLOG).unwrap();

        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                let client = LocalSocket::connect(&path).await.unwrap();
                client.send(b"one").await.unwrap();
                client.send(b"two").await.unwrap();
            }
        });

        let peer = server.accept().await.unwrap();
        let chunks: Vec<Vec<u8>> = peer
            .receive_stream(1024)
            .map(|c| c.unwrap())
            .collect()
            .await;
        writer.await.unwrap();

        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, b"onetwo");
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[tokio::test]
    async fn receive_composes_with_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = sock_path(&dir, "quiet.sock");

        let mut server = LocalSocket::new().unwrap();
        server.bind(&path).unwrap();
        server.listen(DEFAULT_BACKLOG).unwrap();
        let client = LocalSocket::connect(&path).await.unwrap();
        let _peer = server.accept().await.unwrap();

        // Nobody writes: the race resolves on the timer side.
        let started = std::time::Instant::now();
        let result =
            tokio::time::timeout(Duration::from_millis(50), client.receive(64)).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn operations_on_closed_socket_fail_invalid_descriptor() {
        let mut sock = LocalSocket::new().unwrap();
        sock.close();
        match sock.receive(16).await {
            Err(SocketError::InvalidDescriptor) => {}
            other => panic!("expected InvalidDescriptor, got {other:?}"),
        }
        match sock.send(b"x").await {
            Err(SocketError::InvalidDescriptor) => {}
            other => panic!("expected InvalidDescriptor, got {other:?}"),
        }
    }
}
