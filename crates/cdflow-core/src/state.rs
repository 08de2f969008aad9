use crate::output::{display_command, format_command, format_info};
use crate::CoreError;
use cdflow_runtime::{ContainerRuntime, SharedWriter};
use cdflow_schema::Manifest;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Flags that apply to every command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    pub no_pull_config: bool,
    pub no_pull_release: bool,
    pub no_pull_terraform: bool,
    pub no_pull_scan: bool,
    pub quiet: bool,
}

/// Everything a command needs, built once per invocation.
pub struct GlobalState {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub output: SharedWriter,
    pub error: SharedWriter,
    /// Absolute path of the project, bound into build and Terraform containers.
    pub code_dir: PathBuf,
    pub component: String,
    pub commit: String,
    pub manifest: Manifest,
    pub options: GlobalOptions,
    /// Host environment forwarded to the config plugin and build `env_vars`.
    pub host_env: BTreeMap<String, String>,
}

impl GlobalState {
    pub fn code_dir_str(&self) -> String {
        self.code_dir.to_string_lossy().into_owned()
    }

    /// Print a `cdflow2: ` progress line to the error sink unless quiet.
    pub fn info(&self, info: &str) -> Result<(), CoreError> {
        if self.options.quiet {
            return Ok(());
        }
        let mut error = self.error.clone();
        writeln!(error, "\n{}\n", format_info(info))?;
        Ok(())
    }

    /// Print the command about to be run unless quiet.
    pub fn announce<S: AsRef<str>>(&self, info: &str, args: &[S]) -> Result<(), CoreError> {
        if self.options.quiet {
            return Ok(());
        }
        let mut error = self.error.clone();
        writeln!(
            error,
            "\n{}\n{}\n",
            format_info(info),
            format_command(&display_command(args))
        )?;
        Ok(())
    }

    /// Pull `image`, writing progress to the error sink.
    pub fn pull(&self, what: &str, image: &str) -> Result<(), CoreError> {
        self.info(&format!("pulling {what} image: {image}"))?;
        let mut progress = self.error.clone();
        self.runtime
            .pull_image(image, &mut progress)
            .map_err(|e| CoreError::runtime(format!("error pulling {what} image {image}"), e))
    }

    /// Pull `image` only when it is not already present.
    pub fn ensure_image(&self, what: &str, image: &str) -> Result<(), CoreError> {
        let mut progress = self.error.clone();
        self.runtime
            .ensure_image(image, &mut progress)
            .map_err(|e| CoreError::runtime(format!("error pulling {what} image {image}"), e))
    }
}

impl std::fmt::Debug for GlobalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalState")
            .field("runtime", &self.runtime.name())
            .field("code_dir", &self.code_dir)
            .field("component", &self.component)
            .field("commit", &self.commit)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
