//! Container runtime adapter for cdflow2.
//!
//! This crate implements the narrow capability layer the orchestrator needs
//! from an OCI runtime: the `ContainerRuntime` trait, a `DockerCli` backend
//! that drives the `docker` (or compatible) client, a recording `MockRuntime`
//! for tests, registry credential lookup, output sink helpers, and the raw-mode
//! terminal guard used by interactive execs.

pub mod auth;
pub mod backend;
pub mod docker;
pub mod mock;
pub mod sink;
pub mod terminal;

pub use backend::{
    select_runtime, BeforeRemoveHook, ContainerRuntime, ExecInput, ExecOptions, RunOptions,
};
pub use docker::DockerCli;
pub use mock::{ExecCall, MockRuntime, RunCall};
pub use sink::{SharedBuffer, SharedWriter, TeeWriter};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("container runtime '{0}' is not available on this system")]
    Unavailable(String),
    #[error("{action}: {message}")]
    CommandFailed { action: String, message: String },
    #[error("container exited with unsuccessful exit code {0}")]
    ContainerExit(i64),
    #[error("exec process exited with error status code {0}")]
    ExecExit(i64),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("unexpected runtime output: {0}")]
    InvalidOutput(String),
    #[error("before-remove hook failed: {0}")]
    Hook(String),
    #[error("{primary}, also {also}")]
    Also {
        primary: Box<RuntimeError>,
        also: Box<RuntimeError>,
    },
}

impl RuntimeError {
    /// Chain a cleanup failure onto an earlier result, keeping the first error first.
    pub fn chain(first: Result<(), Self>, then: Result<(), Self>) -> Result<(), Self> {
        match (first, then) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(primary), Err(also)) => Err(Self::Also {
                primary: Box::new(primary),
                also: Box::new(also),
            }),
        }
    }
}

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `<prefix>-<16 hex chars>`, unique within and across processes.
pub fn random_name(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut hasher = blake3::Hasher::new();
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&NAME_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("{prefix}-{}", &hex[..16])
}

/// Convert a mapping to list-form environment, sorted by key.
pub fn env_list<'a, I>(env: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut list: Vec<(String, String)> = env
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    list.sort();
    list
}
