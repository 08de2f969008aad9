//! Optional Trivy security scanning during a release.

use crate::background::{BackgroundContainer, SIGTERM_STATUS};
use crate::output::display_command;
use crate::state::GlobalState;
use crate::terraform::SLEEP_SECONDS;
use crate::CoreError;
use cdflow_runtime::{ExecInput, ExecOptions, RunOptions, RuntimeError, SharedWriter};
use cdflow_schema::TrivySection;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const SCANNER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Monitoring key recording whether any scan reported critical findings.
pub const SECURITY_FINDINGS_KEY: &str = "release_critical_security_findings";

/// Exit status Trivy is told to use when it finds something.
const FINDINGS_EXIT_CODE: i64 = 5;

/// A long-lived Trivy container that repository and image scans are exec'd into.
pub struct SecurityScanner {
    container: BackgroundContainer,
    error_on_findings: bool,
    found: Cell<bool>,
    output: SharedWriter,
    error: SharedWriter,
}

impl SecurityScanner {
    pub fn start(state: &GlobalState, trivy: &TrivySection) -> Result<Self, CoreError> {
        let mut opts = RunOptions::new(&trivy.image, "cdflow2-trivy");
        opts.working_dir = Some("/code".to_owned());
        opts.entrypoint = Some(vec!["/bin/sleep".to_owned()]);
        opts.cmd = vec![SLEEP_SECONDS.to_string()];
        opts.binds = vec![
            format!("{}:/code:ro", state.code_dir_str()),
            "/var/run/docker.sock:/var/run/docker.sock".to_owned(),
        ];
        opts.init = true;
        opts.success_status = SIGTERM_STATUS;
        opts.output = Box::new(state.output.clone());
        opts.error = Box::new(state.error.clone());

        let container = BackgroundContainer::start(
            Arc::clone(&state.runtime),
            opts,
            "trivy container",
            SCANNER_STOP_TIMEOUT,
        )?;
        Ok(Self {
            container,
            error_on_findings: trivy.error_on_findings(),
            found: Cell::new(false),
            output: state.output.clone(),
            error: state.error.clone(),
        })
    }

    /// Scan the project's source tree for critical vulnerabilities and secrets.
    pub fn scan_repository(&self) -> Result<bool, CoreError> {
        self.scan("repository", "fs", "vuln,secret", "/code")
    }

    /// Scan an image produced by a build.
    pub fn scan_image(&self, image: &str) -> Result<bool, CoreError> {
        self.scan(&format!("image {image}"), "image", "vuln,misconfig,secret", image)
    }

    /// Whether any scan so far reported critical findings.
    pub fn found_critical(&self) -> bool {
        self.found.get()
    }

    fn scan(
        &self,
        target: &str,
        kind: &str,
        scanners: &str,
        subject: &str,
    ) -> Result<bool, CoreError> {
        let cmd = vec![
            "trivy".to_owned(),
            kind.to_owned(),
            "--severity".to_owned(),
            "CRITICAL".to_owned(),
            "--ignore-unfixed".to_owned(),
            "--exit-code".to_owned(),
            FINDINGS_EXIT_CODE.to_string(),
            "--scanners".to_owned(),
            scanners.to_owned(),
            subject.to_owned(),
        ];
        debug!("trivy exec: {}", display_command(&cmd));

        let mut output = self.output.clone();
        let mut error = self.error.clone();
        let result = self.container.runtime().exec(ExecOptions {
            container_id: self.container.id(),
            cmd,
            env: Vec::new(),
            input: ExecInput::Null,
            output: &mut output,
            error: &mut error,
            tty: false,
            working_dir: None,
        });
        match result {
            Ok(()) => Ok(false),
            Err(RuntimeError::ExecExit(FINDINGS_EXIT_CODE)) => {
                self.found.set(true);
                if self.error_on_findings {
                    return Err(CoreError::Rejected(format!(
                        "critical security findings in {target}"
                    )));
                }
                warn!("critical security findings in {target}");
                Ok(true)
            }
            Err(e) => Err(CoreError::runtime(format!("error scanning {target}"), e)),
        }
    }

    /// Stop the scanner and return its run result.
    pub fn done(mut self) -> Result<(), CoreError> {
        self.container.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GlobalOptions;
    use cdflow_runtime::MockRuntime;
    use cdflow_schema::parse_manifest_str;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    const TRIVY: &str = "aquasec/trivy:0.50.0";

    fn state(mock: &MockRuntime, params: &str) -> GlobalState {
        let manifest = parse_manifest_str(&format!(
            "version: 2\nconfig:\n  image: config\nterraform:\n  image: terraform\ntrivy:\n  image: {TRIVY}\n{params}"
        ))
        .unwrap();
        GlobalState {
            runtime: Arc::new(mock.clone()),
            output: SharedWriter::sink(),
            error: SharedWriter::sink(),
            code_dir: PathBuf::from("/src/svc"),
            component: "svc".to_owned(),
            commit: "abc".to_owned(),
            manifest,
            options: GlobalOptions::default(),
            host_env: BTreeMap::new(),
        }
    }

    fn scanner(mock: &MockRuntime, params: &str) -> SecurityScanner {
        mock.keep_running(TRIVY);
        let state = state(mock, params);
        let trivy = state.manifest.trivy.clone().unwrap();
        SecurityScanner::start(&state, &trivy).unwrap()
    }

    #[test]
    fn scan_commands() {
        let mock = MockRuntime::new();
        let scanner = scanner(&mock, "");
        assert!(!scanner.scan_repository().unwrap());
        assert!(!scanner.scan_image("acme/app:1").unwrap());
        scanner.done().unwrap();

        let commands: Vec<Vec<String>> = mock.execs().into_iter().map(|c| c.cmd).collect();
        assert_eq!(
            commands,
            vec![
                vec![
                    "trivy", "fs", "--severity", "CRITICAL", "--ignore-unfixed", "--exit-code",
                    "5", "--scanners", "vuln,secret", "/code",
                ],
                vec![
                    "trivy", "image", "--severity", "CRITICAL", "--ignore-unfixed", "--exit-code",
                    "5", "--scanners", "vuln,misconfig,secret", "acme/app:1",
                ],
            ]
        );
        let run = &mock.runs()[0];
        assert_eq!(run.name_prefix, "cdflow2-trivy");
        assert!(run.binds.contains(&"/src/svc:/code:ro".to_owned()));
        assert!(mock.live_containers().is_empty());
    }

    #[test]
    fn findings_fail_by_default() {
        let mock = MockRuntime::new();
        mock.on_exec(TRIVY, |_, _, _| FINDINGS_EXIT_CODE);
        let scanner = scanner(&mock, "");
        let err = scanner.scan_repository().unwrap_err();
        assert!(matches!(err, CoreError::Rejected(_)), "{err}");
        assert!(scanner.found_critical());
        scanner.done().unwrap();
    }

    #[test]
    fn findings_reported_when_not_fatal() {
        let mock = MockRuntime::new();
        mock.on_exec(TRIVY, |_, _, _| FINDINGS_EXIT_CODE);
        let scanner = scanner(&mock, "  params:\n    errorOnFindings: false\n");
        assert!(scanner.scan_image("acme/app:1").unwrap());
        assert!(scanner.found_critical());
        scanner.done().unwrap();
    }

    #[test]
    fn other_exit_codes_are_errors() {
        let mock = MockRuntime::new();
        mock.on_exec(TRIVY, |_, _, _| 1);
        let scanner = scanner(&mock, "  params:\n    errorOnFindings: false\n");
        let err = scanner.scan_repository().unwrap_err();
        assert!(err.to_string().starts_with("error scanning repository"), "{err}");
        assert!(!scanner.found_critical());
        scanner.done().unwrap();
    }
}
