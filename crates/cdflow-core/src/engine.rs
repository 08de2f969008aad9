use crate::build::run_build;
use crate::concurrency::check_interrupted;
use crate::config::ConfigSession;
use crate::env::{build_env, ReleaseIdentity};
use crate::metadata::{finalize, release_tags, ReleaseDetails};
use crate::monitoring::{merge_monitoring, MonitoringData};
use crate::protocol::PrepareTerraformResponse;
use crate::scan::{SecurityScanner, SECURITY_FINDINGS_KEY};
use crate::state::GlobalState;
use crate::terraform::{init_initial, BackendConfigValue, TerraformSidecar};
use crate::volume::ReleaseVolume;
use crate::CoreError;
use cdflow_runtime::{random_name, RuntimeError, SharedBuffer, TeeWriter};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RELEASE_METADATA_VAR_FILE: &str = "-var-file=/release/release-metadata.json";
const TERRAFORM_LOCK_FILE: &str = ".terraform.lock.hcl";

#[derive(Debug, Clone, Default)]
pub struct ReleaseArgs {
    pub version: String,
    /// `--release-data` pairs, in the order given.
    pub release_data: Vec<(String, String)>,
    pub terraform_log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeployArgs {
    pub env_name: String,
    pub version: String,
    pub plan_only: bool,
    pub state_should_exist: bool,
    pub error_on_destroy: bool,
    pub terraform_log_level: Option<String>,
}

impl Default for DeployArgs {
    fn default() -> Self {
        Self {
            env_name: String::new(),
            version: String::new(),
            plan_only: false,
            state_should_exist: true,
            error_on_destroy: false,
            terraform_log_level: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DestroyArgs {
    pub env_name: String,
    pub version: String,
    pub plan_only: bool,
    pub terraform_log_level: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShellArgs {
    pub env_name: String,
    pub version: Option<String>,
    /// Arguments passed to `/bin/sh`.
    pub args: Vec<String>,
    pub terraform_log_level: Option<String>,
}

/// Runs cdflow2 commands as ordered phases over the container runtime.
///
/// Every phase that acquires a container or volume releases it on all exit
/// paths; a cleanup failure after an earlier error is appended to that error.
pub struct Engine {
    state: GlobalState,
    monitoring: MonitoringData,
}

impl Engine {
    pub fn new(state: GlobalState) -> Self {
        Self {
            state,
            monitoring: MonitoringData::default(),
        }
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    /// Telemetry settings collected from the config plugin so far.
    pub fn monitoring(&self) -> &MonitoringData {
        &self.monitoring
    }

    /// Let the config plugin provision whatever the project needs.
    pub fn setup(&mut self) -> Result<(), CoreError> {
        let state = &self.state;
        info!("running setup for {}", state.component);
        if !state.options.no_pull_config {
            state.pull("config", &state.manifest.config.image)?;
        }
        let session = ConfigSession::start(state, None)?;
        let result = session.setup(state);
        let response = CoreError::with_cleanup(result, session.done())?;
        merge_monitoring(&mut self.monitoring, &response.monitoring);
        if !response.message.is_empty() {
            let mut output = state.output.clone();
            writeln!(output, "{}", response.message)?;
        }
        Ok(())
    }

    /// Build every artifact, record the release metadata and upload the release.
    pub fn release(&mut self, args: &ReleaseArgs) -> Result<(), CoreError> {
        let state = &self.state;
        info!("releasing version {} of {}", args.version, state.component);
        let terraform_image = &state.manifest.terraform.image;
        if !state.options.no_pull_terraform {
            state.pull("terraform", terraform_image)?;
        }
        let saved_terraform_image = resolve_terraform_digest(state, terraform_image)?;
        check_interrupted()?;

        let scanner = match &state.manifest.trivy {
            Some(trivy) => {
                if !state.options.no_pull_scan {
                    state.pull("trivy", &trivy.image)?;
                }
                Some(SecurityScanner::start(state, trivy)?)
            }
            None => None,
        };
        let result = scanned_release(
            state,
            &mut self.monitoring,
            scanner.as_ref(),
            args,
            &saved_terraform_image,
        );
        let message = match scanner {
            Some(scanner) => {
                let found = scanner.found_critical();
                let message = CoreError::with_cleanup(result, scanner.done())?;
                self.monitoring
                    .data
                    .insert(SECURITY_FINDINGS_KEY.to_owned(), found.to_string());
                message
            }
            None => result?,
        };

        let mut error = state.error.clone();
        writeln!(error, "{message}")?;
        Ok(())
    }

    /// Plan and apply the release's infrastructure in an environment.
    pub fn deploy(&mut self, args: &DeployArgs) -> Result<(), CoreError> {
        info!("deploying version {} to {}", args.version, args.env_name);
        let target = Target {
            env_name: &args.env_name,
            version: &args.version,
            state_should_exist: Some(args.state_should_exist),
            use_release_image: !args.version.is_empty(),
            is_shell: false,
            log_level: args.terraform_log_level.as_deref(),
        };
        in_environment(&self.state, &mut self.monitoring, &target, |sidecar, env| {
            deploy_plan(&self.state, sidecar, env, args)
        })
    }

    /// Plan and run the removal of an environment's infrastructure.
    pub fn destroy(&mut self, args: &DestroyArgs) -> Result<(), CoreError> {
        info!("destroying {} in {}", state_label(&args.version), args.env_name);
        let target = Target {
            env_name: &args.env_name,
            version: &args.version,
            state_should_exist: Some(true),
            use_release_image: !args.version.is_empty(),
            is_shell: false,
            log_level: args.terraform_log_level.as_deref(),
        };
        in_environment(&self.state, &mut self.monitoring, &target, |sidecar, env| {
            destroy_plan(&self.state, sidecar, env, args)
        })
    }

    /// Open an interactive shell in the Terraform container for an environment.
    pub fn shell(&mut self, args: &ShellArgs) -> Result<(), CoreError> {
        info!("opening shell in {}", args.env_name);
        let target = Target {
            env_name: &args.env_name,
            version: args.version.as_deref().unwrap_or_default(),
            state_should_exist: None,
            use_release_image: args.version.is_some(),
            is_shell: true,
            log_level: args.terraform_log_level.as_deref(),
        };
        in_environment(&self.state, &mut self.monitoring, &target, |sidecar, env| {
            let mut cmd = vec!["/bin/sh".to_owned()];
            cmd.extend(args.args.iter().cloned());
            sidecar.run_interactive(&cmd, env)
        })
    }
}

/// The environment a deploy, destroy or shell command works in.
struct Target<'a> {
    env_name: &'a str,
    version: &'a str,
    state_should_exist: Option<bool>,
    use_release_image: bool,
    is_shell: bool,
    log_level: Option<&'a str>,
}

/// Prepare Terraform for `target` and run `f` in a sidecar on its workspace.
///
/// The release volume, config container and sidecar are all released before
/// returning.
fn in_environment<F>(
    state: &GlobalState,
    monitoring: &mut MonitoringData,
    target: &Target<'_>,
    f: F,
) -> Result<(), CoreError>
where
    F: FnOnce(&TerraformSidecar, &BTreeMap<String, String>) -> Result<(), CoreError>,
{
    let volume = ReleaseVolume::create(Arc::clone(&state.runtime))?;
    let result = prepare_terraform(state, monitoring, volume.name(), target).and_then(|response| {
        let image = terraform_image(state, &response, target.use_release_image)?;
        with_sidecar(state, &image, volume.name(), target.log_level, |sidecar| {
            sidecar.configure_backend(
                &BackendConfigValue::from_response(&response),
                target.is_shell,
            )?;
            sidecar.switch_workspace(target.env_name)?;
            check_interrupted()?;
            f(sidecar, &response.env)
        })
    });
    CoreError::with_cleanup(result, volume.remove())
}

fn state_label(version: &str) -> String {
    if version.is_empty() {
        "current state".to_owned()
    } else {
        format!("version {version}")
    }
}

/// The first repo digest of the Terraform image, recorded with the release.
///
/// When pulls are suppressed and no digest is known the image reference
/// itself is used.
fn resolve_terraform_digest(state: &GlobalState, image: &str) -> Result<String, CoreError> {
    let suppressed = state.options.no_pull_terraform;
    match state.runtime.image_repo_digests(image) {
        Ok(digests) if !digests.is_empty() => Ok(digests[0].clone()),
        Ok(_) | Err(RuntimeError::ImageNotFound(_)) if suppressed => {
            warn!("no repo digest for terraform image {image}, recording the image reference");
            Ok(image.to_owned())
        }
        Ok(_) => Err(CoreError::runtime(
            "error resolving terraform image digest",
            RuntimeError::InvalidOutput(format!("no repo digests for image {image}")),
        )),
        Err(e) => Err(CoreError::runtime("error resolving terraform image digest", e)),
    }
}

/// Scan the repository when a scanner is configured, then release in a fresh volume.
fn scanned_release(
    state: &GlobalState,
    monitoring: &mut MonitoringData,
    scanner: Option<&SecurityScanner>,
    args: &ReleaseArgs,
    saved_terraform_image: &str,
) -> Result<String, CoreError> {
    if let Some(scanner) = scanner {
        state.info("scanning repository...")?;
        scanner.scan_repository()?;
        check_interrupted()?;
    }
    let volume = ReleaseVolume::create(Arc::clone(&state.runtime))?;
    let result = release_phases(
        state,
        monitoring,
        scanner,
        volume.name(),
        args,
        saved_terraform_image,
    );
    CoreError::with_cleanup(result, volume.remove())
}

fn release_phases(
    state: &GlobalState,
    monitoring: &mut MonitoringData,
    scanner: Option<&SecurityScanner>,
    volume: &str,
    args: &ReleaseArgs,
    saved_terraform_image: &str,
) -> Result<String, CoreError> {
    state.info("fetching terraform providers and modules...")?;
    init_initial(
        state,
        &state.manifest.terraform.image,
        volume,
        args.terraform_log_level.as_deref(),
    )?;
    check_interrupted()?;

    if !state.options.no_pull_config {
        state.pull("config", &state.manifest.config.image)?;
    }
    let session = ConfigSession::start(state, Some(volume))?;
    let result = build_and_upload(
        state,
        monitoring,
        scanner,
        &session,
        volume,
        args,
        saved_terraform_image,
    );
    CoreError::with_cleanup(result, session.done())
}

fn build_and_upload(
    state: &GlobalState,
    monitoring: &mut MonitoringData,
    scanner: Option<&SecurityScanner>,
    session: &ConfigSession,
    volume: &str,
    args: &ReleaseArgs,
    saved_terraform_image: &str,
) -> Result<String, CoreError> {
    state.info("getting release configuration...")?;
    let configured = session.configure_release(state, &args.version)?;
    merge_monitoring(monitoring, &configured.monitoring);
    check_interrupted()?;

    let identity = ReleaseIdentity {
        version: args.version.clone(),
        team: state.manifest.team.clone(),
        component: state.component.clone(),
        commit: state.commit.clone(),
    };
    let mut builds = BTreeMap::new();
    for (build_id, build) in &state.manifest.builds {
        if !state.options.no_pull_release {
            state.pull(&format!("build ({build_id})"), &build.image)?;
        }
        let env = build_env(
            build_id,
            build,
            configured.env.get(build_id),
            &state.host_env,
            &identity,
        )?;
        state.info(&format!("running build '{build_id}'..."))?;
        let metadata = run_build(state, build_id, build, &env, volume)?;
        debug!("build {build_id} returned {} metadata keys", metadata.len());
        if let (Some(scanner), Some(image)) = (scanner, metadata.get("image")) {
            state.info(&format!("scanning image {image}..."))?;
            scanner.scan_image(image)?;
        }
        builds.insert(build_id.clone(), metadata);
        check_interrupted()?;
    }

    let details = ReleaseDetails {
        tags: release_tags(&state.host_env)?,
        additional_metadata: Some(&configured.additional_metadata),
        release_data: &args.release_data,
    };
    let metadata = finalize(builds, &details, &identity);
    session.write_release_metadata(&metadata)?;

    let lock_file = state.code_dir.join("infra").join(TERRAFORM_LOCK_FILE);
    if lock_file.is_file() {
        debug!("adding {} to release", lock_file.display());
        let content = std::fs::read(&lock_file)?;
        session.copy_file_to_release(TERRAFORM_LOCK_FILE, &content)?;
    }

    state.info("uploading release...")?;
    let uploaded = session.upload_release(saved_terraform_image)?;
    Ok(uploaded.message)
}

/// Start a config session, ask it to prepare Terraform, then tear it down.
fn prepare_terraform(
    state: &GlobalState,
    monitoring: &mut MonitoringData,
    volume: &str,
    target: &Target<'_>,
) -> Result<PrepareTerraformResponse, CoreError> {
    if !state.options.no_pull_config {
        state.pull("config", &state.manifest.config.image)?;
    }
    let session = ConfigSession::start(state, Some(volume))?;
    let result = session.prepare_terraform(
        state,
        target.version,
        target.env_name,
        target.state_should_exist,
    );
    let response = CoreError::with_cleanup(result, session.done())?;
    merge_monitoring(monitoring, &response.monitoring);
    check_interrupted()?;
    Ok(response)
}

/// The plugin's Terraform image when deploying a release, else the manifest's.
fn terraform_image(
    state: &GlobalState,
    response: &PrepareTerraformResponse,
    use_release_image: bool,
) -> Result<String, CoreError> {
    let image = if use_release_image && !response.terraform_image.is_empty() {
        response.terraform_image.clone()
    } else {
        state.manifest.terraform.image.clone()
    };
    if !state.options.no_pull_terraform {
        state.ensure_image("terraform", &image)?;
    }
    Ok(image)
}

fn with_sidecar<T, F>(
    state: &GlobalState,
    image: &str,
    volume: &str,
    log_level: Option<&str>,
    f: F,
) -> Result<T, CoreError>
where
    F: FnOnce(&TerraformSidecar) -> Result<T, CoreError>,
{
    let sidecar = TerraformSidecar::start(state, image, volume, log_level)?;
    let result = f(&sidecar);
    CoreError::with_cleanup(result, sidecar.done())
}

/// `-var-file` arguments for the project's common and per-environment config.
fn config_var_files(state: &GlobalState, env_name: &str) -> Vec<String> {
    let config_dir = state.code_dir.join("config");
    ["common".to_owned(), env_name.to_owned()]
        .iter()
        .filter(|name| config_dir.join(format!("{name}.json")).is_file())
        .map(|name| format!("-var-file=config/{name}.json"))
        .collect()
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

fn deploy_plan(
    state: &GlobalState,
    sidecar: &TerraformSidecar,
    env: &BTreeMap<String, String>,
    args: &DeployArgs,
) -> Result<(), CoreError> {
    let plan_file = format!("/release/{}", random_name("plan"));
    let mut plan = strings(&[
        "terraform",
        "plan",
        "-input=false",
        RELEASE_METADATA_VAR_FILE,
    ]);
    plan.extend(config_var_files(state, &args.env_name));
    plan.push(format!("-out={plan_file}"));
    plan.push("infra/".to_owned());

    state.announce("creating plan", &plan)?;
    let captured = SharedBuffer::new();
    let mut output = TeeWriter::new(state.output.clone(), captured.clone());
    let mut error = state.error.clone();
    sidecar.run_command(&plan, env, &mut output, &mut error)?;

    if args.error_on_destroy && !captured.contents_lossy().contains("0 to destroy") {
        return Err(CoreError::Rejected(
            "the plan contains resources to be deleted".to_owned(),
        ));
    }
    if args.plan_only {
        return Ok(());
    }
    check_interrupted()?;

    let apply = strings(&["terraform", "apply", "-input=false", &plan_file]);
    state.announce("applying plan", &apply)?;
    let mut output = state.output.clone();
    sidecar.run_command(&apply, env, &mut output, &mut error)
}

fn destroy_plan(
    state: &GlobalState,
    sidecar: &TerraformSidecar,
    env: &BTreeMap<String, String>,
    args: &DestroyArgs,
) -> Result<(), CoreError> {
    let mut var_files = Vec::new();
    if !args.version.is_empty() {
        var_files.push(RELEASE_METADATA_VAR_FILE.to_owned());
    }
    var_files.extend(config_var_files(state, &args.env_name));

    let mut plan = strings(&["terraform", "plan", "-destroy", "-input=false"]);
    plan.extend(var_files.iter().cloned());
    plan.push("infra/".to_owned());

    state.announce("generating plan", &plan)?;
    let mut output = state.output.clone();
    let mut error = state.error.clone();
    sidecar.run_command(&plan, env, &mut output, &mut error)?;
    if args.plan_only {
        return Ok(());
    }
    check_interrupted()?;

    let mut destroy = strings(&["terraform", "destroy", "-auto-approve", "-input=false"]);
    destroy.extend(var_files);
    destroy.push("infra/".to_owned());
    state.announce("applying plan", &destroy)?;
    sidecar.run_command(&destroy, env, &mut output, &mut error)
}
