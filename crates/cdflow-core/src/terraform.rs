//! The Terraform sidecar and the release-time provider fetch.

use crate::background::{BackgroundContainer, SIGTERM_STATUS};
use crate::output::display_command;
use crate::protocol::PrepareTerraformResponse;
use crate::state::GlobalState;
use crate::CoreError;
use cdflow_runtime::terminal::RawModeGuard;
use cdflow_runtime::{env_list, ExecInput, ExecOptions, RunOptions, SharedWriter};
use cdflow_schema::{parse_semver, Semver};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const TERRAFORM_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the sidecar's `sleep` runs: long enough to outlive any command.
pub(crate) const SLEEP_SECONDS: u64 = 365 * 24 * 60 * 60;

/// One `-backend-config` setting, with the text to show in its place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfigValue {
    pub key: String,
    pub value: String,
    pub display: String,
}

impl BackendConfigValue {
    /// Backend settings in order: plain config pairs, then parameter pairs.
    pub fn from_response(response: &PrepareTerraformResponse) -> Vec<Self> {
        let plain = response
            .terraform_backend_config
            .iter()
            .map(|(key, value)| Self {
                key: key.to_owned(),
                value: value.clone(),
                display: value.clone(),
            });
        let parameters = response
            .terraform_backend_config_parameters
            .iter()
            .map(|(key, param)| Self {
                key: key.to_owned(),
                value: param.value.clone(),
                display: if param.display_value.is_empty() {
                    param.value.clone()
                } else {
                    param.display_value.clone()
                },
            });
        plain.chain(parameters).collect()
    }
}

fn image_tag(image: &str) -> Option<&str> {
    if image.contains('@') {
        return None;
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    last_segment.split_once(':').map(|(_, tag)| tag)
}

/// Whether `terraform init` in this image still accepts `-get-plugins`.
///
/// The flag was removed in Terraform 0.15; images whose tag does not parse as
/// a version are assumed to be current.
pub fn accepts_get_plugins(image: &str) -> bool {
    image_tag(image)
        .and_then(|tag| parse_semver(tag.split('-').next().unwrap_or(tag)).ok())
        .is_some_and(|version| version < Semver::new(0, 15, 0))
}

fn terraform_env(log_level: Option<&str>) -> Vec<(String, String)> {
    let mut env = BTreeMap::new();
    env.insert("TF_IN_AUTOMATION".to_owned(), "true".to_owned());
    if let Some(level) = log_level.filter(|l| !l.is_empty()) {
        env.insert("TF_LOG".to_owned(), level.to_owned());
    }
    env_list(&env)
}

/// Fetch providers and modules into the release volume with a one-shot run.
pub fn init_initial(
    state: &GlobalState,
    image: &str,
    release_volume: &str,
    log_level: Option<&str>,
) -> Result<(), CoreError> {
    let mut opts = RunOptions::new(image, "cdflow2-terraform-init");
    opts.working_dir = Some("/build".to_owned());
    opts.cmd = vec!["init".to_owned(), "/code/infra".to_owned()];
    opts.env = terraform_env(log_level);
    opts.binds = vec![
        format!("{}:/code:ro", state.code_dir_str()),
        format!("{release_volume}:/build"),
    ];
    opts.output = Box::new(state.output.clone());
    opts.error = Box::new(state.error.clone());
    state
        .runtime
        .run(opts)
        .map_err(|e| CoreError::runtime("error running terraform init", e))
}

/// A long-lived Terraform container that commands are exec'd into.
pub struct TerraformSidecar {
    container: BackgroundContainer,
    image: String,
    output: SharedWriter,
    error: SharedWriter,
    quiet: bool,
}

impl TerraformSidecar {
    pub fn start(
        state: &GlobalState,
        image: &str,
        release_volume: &str,
        log_level: Option<&str>,
    ) -> Result<Self, CoreError> {
        let mut opts = RunOptions::new(image, "cdflow2-terraform");
        opts.working_dir = Some("/code".to_owned());
        opts.entrypoint = Some(vec!["/bin/sleep".to_owned()]);
        opts.cmd = vec![SLEEP_SECONDS.to_string()];
        let mut env = terraform_env(log_level);
        env.push(("TF_DATA_DIR".to_owned(), "/release/.terraform".to_owned()));
        env.sort();
        opts.env = env;
        opts.binds = vec![
            format!("{}:/code:ro", state.code_dir_str()),
            format!("{release_volume}:/release"),
        ];
        opts.init = true;
        opts.success_status = SIGTERM_STATUS;
        opts.output = Box::new(state.output.clone());
        opts.error = Box::new(state.error.clone());

        let container = BackgroundContainer::start(
            Arc::clone(&state.runtime),
            opts,
            "terraform container",
            TERRAFORM_STOP_TIMEOUT,
        )?;
        Ok(Self {
            container,
            image: image.to_owned(),
            output: state.output.clone(),
            error: state.error.clone(),
            quiet: state.options.quiet,
        })
    }

    pub fn container_id(&self) -> &str {
        self.container.id()
    }

    fn exec(
        &self,
        cmd: &[String],
        env: &BTreeMap<String, String>,
        input: ExecInput,
        output: &mut (dyn Write + Send),
        error: &mut (dyn Write + Send),
        tty: bool,
    ) -> Result<(), CoreError> {
        debug!("terraform exec: {}", display_command(cmd));
        self.container
            .runtime()
            .exec(ExecOptions {
                container_id: self.container.id(),
                cmd: cmd.to_vec(),
                env: env_list(env),
                input,
                output,
                error,
                tty,
                working_dir: None,
            })
            .map_err(|e| CoreError::runtime(format!("error running '{}'", display_command(cmd)), e))
    }

    fn announce(&self, args: &[String]) -> Result<(), CoreError> {
        if self.quiet {
            return Ok(());
        }
        let mut error = self.error.clone();
        writeln!(
            error,
            "{}",
            crate::output::format_command(&display_command(args))
        )?;
        Ok(())
    }

    /// Run `terraform init` against the backend the config plugin prepared.
    ///
    /// Outside a shell, input is disabled and stdin is closed. In a shell the
    /// host stdin is passed so Terraform can prompt for partial configuration.
    pub fn configure_backend(
        &self,
        backend: &[BackendConfigValue],
        is_shell: bool,
    ) -> Result<(), CoreError> {
        let mut args = vec![
            "terraform".to_owned(),
            "init".to_owned(),
            "-get=false".to_owned(),
        ];
        if accepts_get_plugins(&self.image) {
            args.push("-get-plugins=false".to_owned());
        }
        let mut shown = args.clone();
        for entry in backend {
            args.push(format!("-backend-config={}={}", entry.key, entry.value));
            shown.push(format!("-backend-config={}={}", entry.key, entry.display));
        }
        let mut tail = Vec::new();
        if !is_shell {
            tail.push("-input=false".to_owned());
        }
        tail.push("infra/".to_owned());
        args.extend(tail.iter().cloned());
        shown.extend(tail);

        self.announce(&shown)?;
        let input = if is_shell {
            ExecInput::Inherit
        } else {
            ExecInput::Null
        };
        let mut output = self.output.clone();
        let mut error = self.error.clone();
        self.exec(&args, &BTreeMap::new(), input, &mut output, &mut error, false)
    }

    fn list_workspaces(&self) -> Result<BTreeSet<String>, CoreError> {
        let mut listing = Vec::new();
        let mut error = self.error.clone();
        self.exec(
            &["terraform".to_owned(), "workspace".to_owned(), "list".to_owned()],
            &BTreeMap::new(),
            ExecInput::Null,
            &mut listing,
            &mut error,
            false,
        )?;
        Ok(String::from_utf8_lossy(&listing)
            .split_whitespace()
            .filter(|word| *word != "*")
            .map(str::to_owned)
            .collect())
    }

    /// Select the named workspace, creating it first if it does not exist.
    pub fn switch_workspace(&self, name: &str) -> Result<(), CoreError> {
        let workspaces = self.list_workspaces()?;
        let action = if workspaces.contains(name) {
            "select"
        } else {
            "new"
        };
        let args = vec![
            "terraform".to_owned(),
            "workspace".to_owned(),
            action.to_owned(),
            name.to_owned(),
        ];
        self.announce(&args)?;
        let mut output = self.output.clone();
        let mut error = self.error.clone();
        self.exec(&args, &BTreeMap::new(), ExecInput::Null, &mut output, &mut error, false)
    }

    pub fn run_command(
        &self,
        cmd: &[String],
        env: &BTreeMap<String, String>,
        output: &mut (dyn Write + Send),
        error: &mut (dyn Write + Send),
    ) -> Result<(), CoreError> {
        self.exec(cmd, env, ExecInput::Null, output, error, false)
    }

    /// Run a command attached to the host terminal, in raw mode when stdin is a terminal.
    pub fn run_interactive(
        &self,
        cmd: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        let _raw = RawModeGuard::enter()?;
        self.exec(
            cmd,
            env,
            ExecInput::Inherit,
            &mut io::sink(),
            &mut io::sink(),
            true,
        )
    }

    /// Stop the sidecar and return its run result.
    pub fn done(mut self) -> Result<(), CoreError> {
        self.container.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PrepareTerraformResponse;

    #[test]
    fn get_plugins_only_for_old_terraform() {
        assert!(accepts_get_plugins("hashicorp/terraform:0.12.31"));
        assert!(accepts_get_plugins("hashicorp/terraform:0.14.11-alpine"));
        assert!(!accepts_get_plugins("hashicorp/terraform:0.15.0"));
        assert!(!accepts_get_plugins("hashicorp/terraform:1.5.7"));
        assert!(!accepts_get_plugins("hashicorp/terraform:latest"));
        assert!(!accepts_get_plugins("hashicorp/terraform"));
        assert!(!accepts_get_plugins("hashicorp/terraform@sha256:0123abcd"));
        assert!(accepts_get_plugins("localhost:5000/terraform:0.13"));
    }

    #[test]
    fn backend_values_keep_order_and_mask() {
        let response: PrepareTerraformResponse = serde_json::from_str(
            r#"{"Success": true,
                "TerraformBackendConfig": {"region": "eu-west-1", "bucket": "state"},
                "TerraformBackendConfigParameters": {
                    "secret_key": {"Value": "s3cr3t", "DisplayValue": "***"},
                    "plain": {"Value": "visible"}
                }}"#,
        )
        .unwrap();
        let values = BackendConfigValue::from_response(&response);
        let keys: Vec<&str> = values.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["region", "bucket", "secret_key", "plain"]);
        assert_eq!(values[2].value, "s3cr3t");
        assert_eq!(values[2].display, "***");
        assert_eq!(values[3].display, "visible");
    }

    #[test]
    fn env_includes_log_level_when_set() {
        assert_eq!(
            terraform_env(None),
            vec![("TF_IN_AUTOMATION".to_owned(), "true".to_owned())]
        );
        assert_eq!(
            terraform_env(Some("DEBUG")),
            vec![
                ("TF_IN_AUTOMATION".to_owned(), "true".to_owned()),
                ("TF_LOG".to_owned(), "DEBUG".to_owned())
            ]
        );
    }
}
