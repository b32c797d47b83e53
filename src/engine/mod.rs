//! VM engine: an opaque handle over the host hypervisor (QEMU/KVM driven
//! as a child process plus a QMP control socket).

pub mod qemu;
pub mod qmp;

pub use qemu::{Engine, EngineConfig};

/// Observable engine state, sampled by the daemon's monitoring loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    Paused,
    Stopped,
    Error,
}

impl EngineState {
    /// Terminal states end the daemon's monitoring loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Error)
    }
}

/// Vsock endpoint exposed for the guest-agent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsockEndpoint {
    pub cid: u32,
    pub port: u32,
}
