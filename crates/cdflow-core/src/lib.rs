//! Core orchestration engine for cdflow2.
//!
//! This crate ties the manifest, the container runtime and the three plugin
//! kinds together: the long-lived config plugin session and its JSON protocol,
//! the Terraform sidecar, the short-lived build plugin runner, and the release
//! volume that carries the release bundle between them. `Engine` composes these
//! into the `release`, `deploy`, `destroy`, `shell` and `setup` phase sequences
//! with cleanup on every exit path.

mod background;
pub mod build;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod env;
pub mod metadata;
pub mod monitoring;
pub mod output;
pub mod protocol;
pub mod scan;
pub mod state;
pub mod terraform;
pub mod volume;

pub use build::{run_build, TailBuffer, TAIL_WINDOW};
pub use concurrency::{check_interrupted, install_signal_handler, shutdown_requested};
pub use config::{cache_volume_name, ConfigSession};
pub use engine::{DeployArgs, DestroyArgs, Engine, ReleaseArgs, ShellArgs};
pub use env::{build_env, host_env, ReleaseIdentity, RESERVED_KEYS};
pub use metadata::{parse_release_data, release_tags, ReleaseMetadata};
pub use monitoring::{
    merge_monitoring, select_monitor, CommandEvent, DatadogMonitor, Monitor, MonitoringData,
    NoopMonitor,
};
pub use output::{format_command, format_info};
pub use scan::{SecurityScanner, SECURITY_FINDINGS_KEY};
pub use state::{GlobalOptions, GlobalState};
pub use terraform::{init_initial, BackendConfigValue, TerraformSidecar};
pub use volume::ReleaseVolume;

use cdflow_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Manifest(#[from] cdflow_schema::ManifestError),
    #[error("{context}: {source}")]
    Runtime {
        context: String,
        #[source]
        source: RuntimeError,
    },
    #[error("config container failed during {action}")]
    Plugin { action: String },
    #[error("error running build '{build_id}': {message}")]
    Build { build_id: String, message: String },
    #[error("invalid {action} response from config container: {message}")]
    Protocol { action: String, message: String },
    #[error("{0}")]
    Usage(String),
    /// A Terraform plan refused by a deploy guard.
    #[error("{0}")]
    Rejected(String),
    #[error("interrupted by signal")]
    Interrupted,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{primary}, also {cleanup}")]
    Cleanup {
        primary: Box<CoreError>,
        cleanup: Box<CoreError>,
    },
}

impl CoreError {
    /// Wrap a runtime failure with a short description of what was being done.
    pub fn runtime(context: impl Into<String>, source: RuntimeError) -> Self {
        Self::Runtime {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for this error: 2 for driver bugs, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Internal(_) => 2,
            Self::Cleanup { primary, .. } => primary.exit_code(),
            _ => 1,
        }
    }

    /// Combine a primary outcome with the outcome of a deferred cleanup.
    ///
    /// A cleanup failure after a primary error is appended to it; the primary
    /// error keeps deciding the classification.
    pub fn with_cleanup<T>(
        result: Result<T, CoreError>,
        cleanup: Result<(), CoreError>,
    ) -> Result<T, CoreError> {
        match (result, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(primary), Err(cleanup)) => Err(Self::Cleanup {
                primary: Box::new(primary),
                cleanup: Box::new(cleanup),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_error_is_appended_to_primary() {
        let result: Result<(), CoreError> = CoreError::with_cleanup(
            Err(CoreError::Plugin {
                action: "configure_release".to_owned(),
            }),
            Err(CoreError::runtime(
                "removing release volume",
                RuntimeError::Unavailable("docker".to_owned()),
            )),
        );
        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "config container failed during configure_release, also removing release volume: \
             container runtime 'docker' is not available on this system"
        );
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn cleanup_classified_by_primary() {
        let err = CoreError::with_cleanup::<()>(
            Err(CoreError::Internal("broken invariant".to_owned())),
            Err(CoreError::Interrupted),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn cleanup_failure_alone_surfaces() {
        let err = CoreError::with_cleanup(Ok(5), Err(CoreError::Interrupted)).unwrap_err();
        assert!(matches!(err, CoreError::Interrupted));
        assert_eq!(CoreError::with_cleanup(Ok(5), Ok(())).unwrap(), 5);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(CoreError::Usage("bad".to_owned()).exit_code(), 1);
        assert_eq!(CoreError::Internal("bug".to_owned()).exit_code(), 2);
        assert_eq!(CoreError::Interrupted.to_string(), "interrupted by signal");
    }
}
