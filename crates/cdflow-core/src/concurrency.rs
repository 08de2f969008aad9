use crate::CoreError;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Fail with `Interrupted` once a shutdown has been requested.
///
/// Called between phases so that deferred cleanups run as on any other error.
pub fn check_interrupted() -> Result<(), CoreError> {
    if shutdown_requested() {
        return Err(CoreError::Interrupted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_interrupted_by_default() {
        assert!(!shutdown_requested());
        assert!(check_interrupted().is_ok());
    }
}
