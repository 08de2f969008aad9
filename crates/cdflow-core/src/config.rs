//! The config plugin session.
//!
//! The config container stays up for the length of a command. Each protocol
//! call runs `/app forward` inside it with one JSON request line on stdin and
//! reads one JSON response line back from stdout.

use crate::background::BackgroundContainer;
use crate::metadata::{metadata_tar, single_file_tar, ReleaseMetadata};
use crate::protocol::{
    ConfigureReleaseResponse, PrepareTerraformResponse, Request, Response, SetupResponse,
    UploadReleaseResponse,
};
use crate::state::GlobalState;
use crate::CoreError;
use cdflow_runtime::{ExecInput, ExecOptions, RunOptions, SharedWriter};
use serde::de::DeserializeOwned;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CONFIG_STOP_TIMEOUT: Duration = Duration::from_secs(2);

const FORWARD_COMMAND: [&str; 2] = ["/app", "forward"];

/// Name of the persistent cache volume for a config image.
pub fn cache_volume_name(image: &str) -> String {
    let sanitized: String = image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("cdflow2-cache-{sanitized}")
}

pub struct ConfigSession {
    container: BackgroundContainer,
    error: SharedWriter,
}

impl ConfigSession {
    /// Start the config container, on the release volume when one is given.
    pub fn start(state: &GlobalState, release_volume: Option<&str>) -> Result<Self, CoreError> {
        let image = &state.manifest.config.image;
        let cache = cache_volume_name(image);
        let runtime = Arc::clone(&state.runtime);
        let exists = runtime
            .volume_exists(&cache)
            .map_err(|e| CoreError::runtime("error checking cache volume", e))?;
        if !exists {
            debug!("creating cache volume {cache}");
            runtime
                .create_volume(Some(&cache))
                .map_err(|e| CoreError::runtime("error creating cache volume", e))?;
        }

        let mut opts = RunOptions::new(image, "cdflow2-config");
        opts.init = true;
        opts.output = Box::new(state.error.clone());
        opts.error = Box::new(state.error.clone());
        match release_volume {
            Some(volume) => {
                opts.binds.push(format!("{volume}:/release"));
                opts.working_dir = Some("/release".to_owned());
            }
            None => opts.working_dir = Some("/".to_owned()),
        }
        opts.binds.push(format!("{cache}:/cache"));

        let container =
            BackgroundContainer::start(runtime, opts, "config container", CONFIG_STOP_TIMEOUT)?;
        Ok(Self {
            container,
            error: state.error.clone(),
        })
    }

    pub fn container_id(&self) -> &str {
        self.container.id()
    }

    fn request<R>(&self, request: &Request<'_>) -> Result<R, CoreError>
    where
        R: DeserializeOwned + Response,
    {
        let action = request.action();
        let mut input = serde_json::to_vec(request)?;
        input.push(b'\n');
        debug!("config plugin request: {action}");

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = self.container.runtime().exec(ExecOptions {
            container_id: self.container.id(),
            cmd: FORWARD_COMMAND.iter().map(|s| (*s).to_owned()).collect(),
            env: Vec::new(),
            input: ExecInput::Bytes(input),
            output: &mut stdout,
            error: &mut stderr,
            tty: false,
            working_dir: None,
        });

        let mut error = self.error.clone();
        error.write_all(&stderr)?;
        result.map_err(|e| CoreError::runtime(format!("error running {action} in config container"), e))?;

        let text = String::from_utf8_lossy(&stdout);
        let mut lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some(last) = lines.pop() else {
            return Err(CoreError::Protocol {
                action: action.to_owned(),
                message: "no response received".to_owned(),
            });
        };
        for line in lines {
            writeln!(error, "{line}")?;
        }
        let response: R = serde_json::from_str(last).map_err(|e| CoreError::Protocol {
            action: action.to_owned(),
            message: e.to_string(),
        })?;
        if !response.success() {
            return Err(CoreError::Plugin {
                action: action.to_owned(),
            });
        }
        Ok(response)
    }

    pub fn setup(&self, state: &GlobalState) -> Result<SetupResponse, CoreError> {
        let requirements = state.manifest.release_requirements();
        self.request(&Request::Setup {
            config: &state.manifest.config.params,
            env: &state.host_env,
            component: &state.component,
            commit: &state.commit,
            team: &state.manifest.team,
            release_requirements: &requirements,
        })
    }

    pub fn configure_release(
        &self,
        state: &GlobalState,
        version: &str,
    ) -> Result<ConfigureReleaseResponse, CoreError> {
        let requirements = state.manifest.release_requirements();
        self.request(&Request::ConfigureRelease {
            version,
            component: &state.component,
            commit: &state.commit,
            team: &state.manifest.team,
            config: &state.manifest.config.params,
            env: &state.host_env,
            release_requirements: &requirements,
        })
    }

    pub fn upload_release(&self, terraform_image: &str) -> Result<UploadReleaseResponse, CoreError> {
        self.request(&Request::UploadRelease { terraform_image })
    }

    pub fn prepare_terraform(
        &self,
        state: &GlobalState,
        version: &str,
        env_name: &str,
        state_should_exist: Option<bool>,
    ) -> Result<PrepareTerraformResponse, CoreError> {
        self.request(&Request::PrepareTerraform {
            version,
            component: &state.component,
            commit: &state.commit,
            env_name,
            state_should_exist,
            config: &state.manifest.config.params,
            env: &state.host_env,
        })
    }

    /// Write `release-metadata.json` into the release volume.
    pub fn write_release_metadata(&self, metadata: &ReleaseMetadata) -> Result<(), CoreError> {
        let tar = metadata_tar(metadata)?;
        self.copy_to_root(&tar, "error writing release metadata")
    }

    /// Write a file into the top level of the release volume.
    pub fn copy_file_to_release(&self, name: &str, content: &[u8]) -> Result<(), CoreError> {
        let tar = single_file_tar(&format!("release/{name}"), content)?;
        self.copy_to_root(&tar, &format!("error copying {name} to release"))
    }

    fn copy_to_root(&self, tar: &[u8], context: &str) -> Result<(), CoreError> {
        self.container
            .runtime()
            .copy_to_container(self.container.id(), "/", tar)
            .map_err(|e| CoreError::runtime(context, e))
    }

    /// Stop the config container and return its run result.
    pub fn done(mut self) -> Result<(), CoreError> {
        self.container.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_volume_names_are_sanitized() {
        assert_eq!(
            cache_volume_name("mergermarket/cdflow2-config-aws-simple:latest"),
            "cdflow2-cache-mergermarket-cdflow2-config-aws-simple-latest"
        );
        assert_eq!(cache_volume_name("config"), "cdflow2-cache-config");
    }
}
