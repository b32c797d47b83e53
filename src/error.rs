use std::path::PathBuf;

use thiserror::Error;

/// VM store preconditions and configuration handling.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("VM '{0}' already exists")]
    VmAlreadyExists(String),

    #[error("invalid VM name '{0}' (use letters, digits, '-' and '_', starting with a letter or digit)")]
    InvalidVmName(String),

    #[error("{0}")]
    ConfigurationError(String),

    #[error("{context}")]
    FileSystemError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Disk image operations.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("disk image not found: {0}")]
    FileNotFound(PathBuf),

    #[error("disk image already exists: {0}")]
    DiskAlreadyExists(PathBuf),

    #[error("failed to create disk image {path}")]
    CreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid disk size: {0}")]
    InvalidSize(String),

    #[error("failed to copy disk image to {path}")]
    CopyFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    ResizeFailed(String),
}

/// Daemon and engine lifecycle.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    ConfigurationError(String),

    #[error("{0}")]
    BootError(String),

    #[error("{0}")]
    RuntimeError(String),

    #[error("VM '{0}' is already running")]
    AlreadyRunning(String),
}

/// Cloud-init seed production.
#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("failed to write cloud-init ISO {path}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cloud-init content too large for a single ISO directory: {0}")]
    ContentTooLarge(String),
}

/// Rescue image cache: download, verification, conversion.
#[derive(Debug, Error)]
pub enum RescueCacheError {
    #[error("failed to download rescue image: {0}")]
    NetworkError(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("failed to parse checksum manifest: {0}")]
    ParseError(String),

    #[error("{context}")]
    FileSystemError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no rescue image available for architecture '{0}'")]
    UnsupportedArchitecture(String),

    #[error("failed to convert rescue image: {0}")]
    ConversionError(String),
}

/// Umbrella error returned by command entry points; `main` renders it as a
/// single `error:` line.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    CloudInit(#[from] CloudInitError),

    #[error(transparent)]
    RescueCache(#[from] RescueCacheError),

    #[error(transparent)]
    Socket(#[from] crate::socket::SocketError),

    #[error(transparent)]
    GuestAgent(#[from] crate::guest_agent::GuestAgentError),

    #[error(transparent)]
    ConsoleListener(#[from] crate::console::ConsoleListenerError),

    #[error(transparent)]
    ConsoleConnection(#[from] crate::console::ConsoleConnectionError),

    #[error(transparent)]
    Terminal(#[from] crate::terminal::TerminalError),
}
