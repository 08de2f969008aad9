use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::IsTerminal;
use tracing::{debug, warn};

/// Puts the host terminal into raw mode for the lifetime of the guard.
///
/// Raw mode is only entered when stdin is a terminal; otherwise the guard is
/// inert so piped or test invocations behave normally.
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    pub fn enter() -> std::io::Result<Self> {
        if !stdin_is_terminal() {
            debug!("stdin is not a terminal, leaving terminal mode unchanged");
            return Ok(Self { active: false });
        }
        enable_raw_mode()?;
        Ok(Self { active: true })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = disable_raw_mode() {
                warn!("failed to restore terminal mode: {e}");
            }
        }
    }
}

pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}
