//! Raw-mode control for the process's controlling terminal.
//!
//! Raw mode is process-wide state: the saved attributes live in a static so
//! that restore works no matter which call path performed the switch.

use std::sync::Mutex;

use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
    Termios,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to get terminal attributes")]
    FailedToGetAttributes(#[source] nix::Error),

    #[error("failed to set terminal attributes")]
    FailedToSetAttributes(#[source] nix::Error),
}

static SAVED: Mutex<Option<Termios>> = Mutex::new(None);

/// Switch stdin to raw mode, saving the prior attributes for restore.
///
/// Raw mode: no echo, no canonical buffering, no signal chars, no software
/// flow control, no CR/NL translation, no output post-processing, 8-bit
/// chars, `MIN=1 TIME=0`.
pub fn enable_raw_mode() -> Result<(), TerminalError> {
    let stdin = std::io::stdin();
    let saved = termios::tcgetattr(&stdin).map_err(TerminalError::FailedToGetAttributes)?;

    let mut raw = saved.clone();
    raw.local_flags.remove(
        LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN,
    );
    raw.input_flags.remove(
        InputFlags::IXON
            | InputFlags::ICRNL
            | InputFlags::INLCR
            | InputFlags::BRKINT
            | InputFlags::ISTRIP
            | InputFlags::INPCK,
    );
    raw.output_flags.remove(OutputFlags::OPOST);
    raw.control_flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    raw.control_flags.insert(ControlFlags::CS8);
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)
        .map_err(TerminalError::FailedToSetAttributes)?;

    // A second enable must not clobber the cooked-mode attributes.
    let mut slot = SAVED.lock().unwrap();
    if slot.is_none() {
        *slot = Some(saved);
    }
    Ok(())
}

/// Restore the attributes saved by [`enable_raw_mode`]. No-op when raw mode
/// was never enabled.
pub fn disable_raw_mode() -> Result<(), TerminalError> {
    let saved = SAVED.lock().unwrap().take();
    if let Some(attrs) = saved {
        let stdin = std::io::stdin();
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &attrs)
            .map_err(TerminalError::FailedToSetAttributes)?;
    }
    Ok(())
}

/// Guard that restores the terminal on drop, including during unwinding.
pub struct RawModeGuard(());

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode()?;
        Ok(Self(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Run `f` with the terminal in raw mode, restoring it on every exit path.
pub fn with_raw_mode<T>(f: impl FnOnce() -> T) -> Result<T, TerminalError> {
    let _guard = RawModeGuard::new()?;
    Ok(f())
}
