pub mod completions;
pub mod deploy;
pub mod destroy;
pub mod init;
pub mod release;
pub mod setup;
pub mod shell;

use crate::{git, GlobalArgs};
use cdflow_core::{
    host_env, select_monitor, CommandEvent, CoreError, Engine, GlobalOptions, GlobalState,
    Monitor,
};
use cdflow_runtime::{select_runtime, SharedWriter};
use cdflow_schema::load_manifest;
use std::sync::Arc;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INTERNAL: u8 = 2;

/// Container runtime client binary.
pub const DOCKER_ENV: &str = "CDFLOW2_DOCKER";
/// Telemetry backend: `datadog` (default) or `none`.
pub const MONITORING_ENV: &str = "CDFLOW2_MONITORING";

fn options(globals: &GlobalArgs) -> GlobalOptions {
    GlobalOptions {
        no_pull_config: globals.no_pull_config,
        no_pull_release: globals.no_pull_release,
        no_pull_terraform: globals.no_pull_terraform,
        no_pull_scan: globals.no_pull_scan,
        quiet: globals.quiet,
    }
}

/// An engine for the project in the working directory, plus where to report the outcome.
pub struct Pipeline {
    engine: Engine,
    monitor: Box<dyn Monitor>,
}

impl Pipeline {
    pub fn open(globals: &GlobalArgs) -> Result<Self, String> {
        let code_dir =
            std::env::current_dir().map_err(|e| format!("cannot read working directory: {e}"))?;
        let manifest = load_manifest(&code_dir).map_err(|e| e.to_string())?;
        let component = match &globals.component {
            Some(c) => c.clone(),
            None => git::component(&code_dir)?,
        };
        let commit = match &globals.commit {
            Some(c) => c.clone(),
            None => git::commit(&code_dir)?,
        };

        let monitor_name =
            std::env::var(MONITORING_ENV).unwrap_or_else(|_| "datadog".to_owned());
        let monitor = select_monitor(&monitor_name)?;

        let docker = std::env::var(DOCKER_ENV).unwrap_or_else(|_| "docker".to_owned());
        let runtime = select_runtime(&docker).map_err(|e| e.to_string())?;
        if !runtime.available() {
            return Err(format!(
                "container runtime '{}' is not available on this system",
                runtime.name()
            ));
        }
        debug!(
            "component {component} at {commit}, runtime {}, monitoring {}",
            runtime.name(),
            monitor.name()
        );

        let state = GlobalState {
            runtime: Arc::from(runtime),
            output: SharedWriter::stdout(),
            error: SharedWriter::stderr(),
            code_dir,
            component,
            commit,
            manifest,
            options: options(globals),
            host_env: host_env(),
        };
        Ok(Self {
            engine: Engine::new(state),
            monitor,
        })
    }

    pub fn engine(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Report the command to telemetry and turn its outcome into an exit code.
    pub fn finish(
        self,
        command: &str,
        environment: &str,
        release_version: &str,
        result: Result<(), CoreError>,
    ) -> Result<u8, String> {
        let status_code = match &result {
            Ok(()) => EXIT_SUCCESS,
            Err(e) => e.exit_code(),
        };
        let state = self.engine.state();
        let event = CommandEvent {
            command: command.to_owned(),
            project: state.component.clone(),
            environment: environment.to_owned(),
            team: state.manifest.team.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            release_version: release_version.to_owned(),
            status_code,
            monitoring: self.engine.monitoring().clone(),
        };
        self.monitor.submit(&event);
        exit_code(result)
    }
}

/// Print a failed command's error and return its exit code.
pub fn exit_code(result: Result<(), CoreError>) -> Result<u8, String> {
    match result {
        Ok(()) => Ok(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("error: {e}");
            Ok(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_INTERNAL);
    }

    #[test]
    fn internal_errors_exit_two() {
        assert_eq!(exit_code(Ok(())), Ok(EXIT_SUCCESS));
        assert_eq!(
            exit_code(Err(CoreError::Internal("bug".to_owned()))),
            Ok(EXIT_INTERNAL)
        );
        assert_eq!(
            exit_code(Err(CoreError::Plugin {
                action: "setup".to_owned()
            })),
            Ok(EXIT_FAILURE)
        );
    }

    #[test]
    fn global_flags_map_to_options() {
        let globals = GlobalArgs {
            no_pull_terraform: true,
            no_pull_scan: true,
            quiet: true,
            ..GlobalArgs::default()
        };
        let opts = options(&globals);
        assert!(opts.no_pull_terraform);
        assert!(opts.no_pull_scan);
        assert!(opts.quiet);
        assert!(!opts.no_pull_config);
    }
}
