use crate::auth::{credentials_from_env, write_client_config};
use crate::backend::{ContainerRuntime, ExecInput, ExecOptions, RunOptions};
use crate::{random_name, RuntimeError};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const START_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drives the `docker` command-line client (or a compatible one, e.g. `podman`).
pub struct DockerCli {
    binary: String,
    debug_volume: Mutex<Option<String>>,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::with_binary("docker")
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ContainerState {
    status: String,
    exit_code: i64,
    error: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_owned(),
            debug_volume: Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn spawn_error(&self, e: io::Error) -> RuntimeError {
        if e.kind() == io::ErrorKind::NotFound {
            RuntimeError::Unavailable(self.binary.clone())
        } else {
            RuntimeError::Io(e)
        }
    }

    fn output(&self, cmd: &mut Command) -> Result<Output, RuntimeError> {
        debug!("{cmd:?}");
        cmd.stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))
    }

    /// Run a client command to completion and return its stdout.
    fn checked(&self, action: &str, cmd: &mut Command) -> Result<String, RuntimeError> {
        let output = self.output(cmd)?;
        if !output.status.success() {
            return Err(command_failed(action, &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn debug_volume(&self) -> Option<String> {
        self.debug_volume.lock().ok().and_then(|v| v.clone())
    }

    fn create_args(&self, name: &str, opts: &RunOptions) -> Vec<String> {
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), name.to_owned()];
        if opts.input.is_some() {
            args.push("--interactive".into());
        }
        if opts.init {
            args.push("--init".into());
        }
        if let Some(dir) = &opts.working_dir {
            args.push("--workdir".into());
            args.push(dir.clone());
        }
        let mut cmd = opts.cmd.clone();
        if let Some(entrypoint) = &opts.entrypoint {
            args.push("--entrypoint".into());
            match entrypoint.split_first() {
                Some((program, rest)) => {
                    args.push(program.clone());
                    cmd.splice(0..0, rest.iter().cloned());
                }
                None => args.push(String::new()),
            }
        }
        for (key, _) in &opts.env {
            args.push("--env".into());
            args.push(key.clone());
        }
        for bind in &opts.binds {
            args.push("--volume".into());
            args.push(bind.clone());
        }
        if let Some(volume) = self.debug_volume() {
            args.push("--volume".into());
            args.push(format!("{volume}:/debug"));
        }
        args.push(opts.image.clone());
        args.extend(cmd);
        args
    }

    fn inspect_state(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let stdout = self.checked(
            "inspecting container",
            self.command().args([
                "container",
                "inspect",
                "--format",
                "{{.State.Status}}|{{.State.ExitCode}}|{{.State.Error}}",
                id,
            ]),
        )?;
        parse_state(&stdout)
    }

    /// Attach to a created container, start it and wait for it to exit.
    fn start_and_wait(&self, id: &str, opts: &mut RunOptions) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["start", "--attach"]);
        if opts.input.is_some() {
            cmd.arg("--interactive");
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.arg(id).stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!("{cmd:?}");
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let finished = AtomicBool::new(false);
        let input = opts.input.take();
        let started = opts.started.take();
        let output = &mut opts.output;
        let error = &mut opts.error;

        let wait_result = thread::scope(|s| {
            let stdin = child.stdin.take();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            if let (Some(mut stdin), Some(bytes)) = (stdin, input) {
                s.spawn(move || {
                    if let Err(e) = stdin.write_all(&bytes) {
                        debug!("writing container input: {e}");
                    }
                });
            }
            let out_thread = stdout.map(|r| s.spawn(move || copy_stream(r, output)));
            let err_thread = stderr.map(|r| s.spawn(move || copy_stream(r, error)));
            if let Some(started) = started {
                let finished = &finished;
                s.spawn(move || self.watch_started(id, finished, &started));
            }

            let status = child.wait();
            finished.store(true, Ordering::SeqCst);
            for handle in [out_thread, err_thread].into_iter().flatten() {
                if let Ok(Err(e)) = handle.join() {
                    warn!("forwarding container output: {e}");
                }
            }
            status
        });
        let status = wait_result?;

        let state = self.inspect_state(id)?;
        if state.status == "created" {
            let message = if state.error.is_empty() {
                format!("client exited with {status}")
            } else {
                state.error
            };
            return Err(RuntimeError::CommandFailed {
                action: format!("starting container {id}"),
                message,
            });
        }
        if state.exit_code != opts.success_status {
            return Err(RuntimeError::ContainerExit(state.exit_code));
        }
        Ok(())
    }

    fn watch_started(&self, id: &str, finished: &AtomicBool, started: &std::sync::mpsc::SyncSender<String>) {
        loop {
            let done = finished.load(Ordering::SeqCst);
            match self.inspect_state(id) {
                Ok(state) if state.status != "created" => {
                    let _ = started.send(id.to_owned());
                    return;
                }
                Ok(_) => {}
                Err(e) => debug!("waiting for container {id} to start: {e}"),
            }
            if done {
                return;
            }
            thread::sleep(START_POLL_INTERVAL);
        }
    }

    fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.checked(
            "removing container",
            self.command().args(["rm", "--force", "--volumes", id]),
        )?;
        Ok(())
    }

    fn exec_args(opts: &ExecOptions<'_>) -> Vec<String> {
        let mut args: Vec<String> = vec!["exec".into()];
        if opts.input != ExecInput::Null {
            args.push("--interactive".into());
        }
        if opts.tty {
            args.push("--tty".into());
        }
        if let Some(dir) = &opts.working_dir {
            args.push("--workdir".into());
            args.push(dir.clone());
        }
        for (key, _) in &opts.env {
            args.push("--env".into());
            args.push(key.clone());
        }
        args.push(opts.container_id.to_owned());
        args.extend(opts.cmd.iter().cloned());
        args
    }

    fn exec_piped(&self, mut child: Child, opts: ExecOptions<'_>) -> Result<i32, RuntimeError> {
        let ExecOptions {
            input,
            output,
            error,
            ..
        } = opts;
        let status = thread::scope(|s| {
            if let (Some(mut stdin), ExecInput::Bytes(bytes)) = (child.stdin.take(), input) {
                s.spawn(move || {
                    if let Err(e) = stdin.write_all(&bytes) {
                        debug!("writing exec input: {e}");
                    }
                });
            }
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let out_thread = stdout.map(|r| s.spawn(move || copy_stream(r, output)));
            let err_thread = stderr.map(|r| s.spawn(move || copy_stream(r, error)));
            let status = child.wait();
            for handle in [out_thread, err_thread].into_iter().flatten() {
                if let Ok(Err(e)) = handle.join() {
                    warn!("forwarding exec output: {e}");
                }
            }
            status
        })?;
        Ok(status.code().unwrap_or(1))
    }
}

fn command_failed(action: &str, stderr: &[u8]) -> RuntimeError {
    RuntimeError::CommandFailed {
        action: action.to_owned(),
        message: String::from_utf8_lossy(stderr).trim().to_owned(),
    }
}

fn copy_stream<R: Read, W: Write + ?Sized>(mut reader: R, writer: &mut W) -> io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            writer.flush()?;
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn parse_state(stdout: &str) -> Result<ContainerState, RuntimeError> {
    let mut parts = stdout.trim_end_matches('\n').splitn(3, '|');
    let status = parts.next().unwrap_or_default().trim().to_owned();
    let exit_code = parts
        .next()
        .and_then(|c| c.trim().parse::<i64>().ok())
        .ok_or_else(|| RuntimeError::InvalidOutput(format!("container state '{}'", stdout.trim())))?;
    let error = parts.next().unwrap_or_default().trim().to_owned();
    Ok(ContainerState {
        status,
        exit_code,
        error,
    })
}

/// Condense one line of `docker pull` output, dropping byte-level progress.
fn progress_line(line: &str) -> Option<String> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    let status = match line.split_once(": ") {
        Some((id, status)) if is_layer_id(id) => status,
        _ => line,
    };
    if status.starts_with("Downloading") || status.starts_with("Extracting") {
        return None;
    }
    Some(line.to_owned())
}

fn is_layer_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_not_found(stderr: &[u8]) -> bool {
    let text = String::from_utf8_lossy(stderr).to_lowercase();
    text.contains("no such") || text.contains("not found") || text.contains("does not exist")
}

impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn available(&self) -> bool {
        self.command()
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn run(&self, mut opts: RunOptions) -> Result<(), RuntimeError> {
        let name = random_name(&opts.name_prefix);
        let mut create = self.command();
        create.args(self.create_args(&name, &opts));
        for (key, value) in &opts.env {
            create.env(key, value);
        }
        let id = self
            .checked(&format!("creating container from {}", opts.image), &mut create)?
            .trim()
            .to_owned();
        debug!("created container {name} ({id})");

        // The container exists from here on; always run the hook and remove it.
        let result = self.start_and_wait(&id, &mut opts);
        let hook_result = match opts.before_remove.take() {
            Some(hook) => hook(&id),
            None => Ok(()),
        };
        let result = RuntimeError::chain(result, hook_result);
        RuntimeError::chain(result, self.remove_container(&id))
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let output = self.output(self.command().args([
            "image",
            "inspect",
            "--format",
            "{{.Id}}",
            image,
        ]))?;
        if output.status.success() {
            return Ok(true);
        }
        if is_not_found(&output.stderr) {
            return Ok(false);
        }
        Err(command_failed("inspecting image", &output.stderr))
    }

    fn pull_image(&self, image: &str, progress: &mut dyn Write) -> Result<(), RuntimeError> {
        let config_dir = match credentials_from_env(image) {
            Some(creds) => {
                let dir = tempfile::tempdir()?;
                write_client_config(dir.path(), &creds)?;
                debug!("pulling {image} with credentials for {}", creds.registry);
                Some(dir)
            }
            None => None,
        };
        let mut cmd = self.command();
        if let Some(dir) = &config_dir {
            cmd.arg("--config").arg(dir.path());
        }
        cmd.args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("{cmd:?}");
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let (status, stderr) = thread::scope(|s| {
            let err_thread = child.stderr.take().map(|mut r| {
                s.spawn(move || {
                    let mut buf = Vec::new();
                    let _ = r.read_to_end(&mut buf);
                    buf
                })
            });
            if let Some(stdout) = child.stdout.take() {
                for line in BufReader::new(stdout).lines() {
                    let line = line?;
                    if let Some(line) = progress_line(&line) {
                        writeln!(progress, "{line}")?;
                    }
                }
            }
            let status = child.wait()?;
            let stderr = err_thread
                .and_then(|h| h.join().ok())
                .unwrap_or_default();
            Ok::<_, io::Error>((status, stderr))
        })?;
        if !status.success() {
            if is_not_found(&stderr) {
                return Err(RuntimeError::ImageNotFound(image.to_owned()));
            }
            return Err(command_failed(&format!("pulling image {image}"), &stderr));
        }
        Ok(())
    }

    fn image_repo_digests(&self, image: &str) -> Result<Vec<String>, RuntimeError> {
        let stdout = self.checked(
            "inspecting image",
            self.command().args([
                "image",
                "inspect",
                "--format",
                "{{json .RepoDigests}}",
                image,
            ]),
        )?;
        let digests: Option<Vec<String>> = serde_json::from_str(stdout.trim())
            .map_err(|e| RuntimeError::InvalidOutput(format!("repo digests for {image}: {e}")))?;
        Ok(digests.unwrap_or_default())
    }

    fn exec(&self, opts: ExecOptions<'_>) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(Self::exec_args(&opts));
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        let code = if opts.tty {
            debug!("{cmd:?}");
            let stdin = if opts.input == ExecInput::Inherit {
                Stdio::inherit()
            } else {
                Stdio::null()
            };
            let status = cmd
                .stdin(stdin)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(|e| self.spawn_error(e))?;
            status.code().unwrap_or(1)
        } else {
            let stdin = match opts.input {
                ExecInput::Null => Stdio::null(),
                ExecInput::Bytes(_) => Stdio::piped(),
                ExecInput::Inherit => Stdio::inherit(),
            };
            debug!("{cmd:?}");
            let child = cmd
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| self.spawn_error(e))?;
            self.exec_piped(child, opts)?
        };
        if code != 0 {
            return Err(RuntimeError::ExecExit(i64::from(code)));
        }
        Ok(())
    }

    fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let secs = timeout.as_secs().max(1).to_string();
        self.checked(
            "stopping container",
            self.command().args(["stop", "--time", &secs, container_id]),
        )?;
        Ok(())
    }

    fn create_volume(&self, name: Option<&str>) -> Result<String, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["volume", "create"]);
        if let Some(name) = name {
            cmd.arg(name);
        }
        let stdout = self.checked("creating volume", &mut cmd)?;
        let id = stdout.trim().to_owned();
        if id.is_empty() {
            return Err(RuntimeError::InvalidOutput(
                "volume create printed no name".to_owned(),
            ));
        }
        Ok(id)
    }

    fn remove_volume(&self, id: &str) -> Result<(), RuntimeError> {
        self.checked("removing volume", self.command().args(["volume", "rm", id]))?;
        Ok(())
    }

    fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let output = self.output(self.command().args(["volume", "inspect", name]))?;
        if output.status.success() {
            return Ok(true);
        }
        if is_not_found(&output.stderr) {
            return Ok(false);
        }
        Err(command_failed("inspecting volume", &output.stderr))
    }

    fn copy_to_container(
        &self,
        container_id: &str,
        path: &str,
        tar: &[u8],
    ) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["cp", "-", &format!("{container_id}:{path}")])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        debug!("{cmd:?}");
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        // Inner closure so the child is always reaped, even if the write fails.
        let write_inner = |child: &mut Child| -> io::Result<()> {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(tar)?;
            }
            Ok(())
        };
        let written = write_inner(&mut child);
        let output = child.wait_with_output()?;
        written?;
        if !output.status.success() {
            return Err(command_failed("copying to container", &output.stderr));
        }
        Ok(())
    }

    fn copy_from_container(
        &self,
        container_id: &str,
        path: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        let output = self.output(self.command().args([
            "cp",
            &format!("{container_id}:{path}"),
            "-",
        ]))?;
        if !output.status.success() {
            return Err(command_failed("copying from container", &output.stderr));
        }
        Ok(output.stdout)
    }

    fn set_debug_volume(&self, volume: Option<String>) {
        if let Ok(mut slot) = self.debug_volume.lock() {
            *slot = volume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_opts() -> RunOptions {
        let mut opts = RunOptions::new("terraform:1.5", "cdflow2-terraform");
        opts.working_dir = Some("/code".to_owned());
        opts.entrypoint = Some(vec!["/bin/sleep".to_owned()]);
        opts.cmd = vec!["31536000".to_owned()];
        opts.env = vec![("TF_IN_AUTOMATION".to_owned(), "true".to_owned())];
        opts.binds = vec!["/src:/code:ro".to_owned(), "vol:/release".to_owned()];
        opts.init = true;
        opts
    }

    #[test]
    fn create_args_keep_env_values_off_the_command_line() {
        let docker = DockerCli::new();
        let args = docker.create_args("cdflow2-terraform-abc", &run_opts());
        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "cdflow2-terraform-abc",
                "--init",
                "--workdir",
                "/code",
                "--entrypoint",
                "/bin/sleep",
                "--env",
                "TF_IN_AUTOMATION",
                "--volume",
                "/src:/code:ro",
                "--volume",
                "vol:/release",
                "terraform:1.5",
                "31536000",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("true")));
    }

    #[test]
    fn multi_part_entrypoint_moves_into_command() {
        let docker = DockerCli::new();
        let mut opts = RunOptions::new("img", "p");
        opts.entrypoint = Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]);
        opts.cmd = vec!["echo hi".to_owned()];
        let args = docker.create_args("p-1", &opts);
        let tail: Vec<&str> = args.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["img", "-c", "echo hi"]);
    }

    #[test]
    fn input_makes_create_interactive() {
        let docker = DockerCli::new();
        let mut opts = RunOptions::new("img", "p");
        opts.input = Some(b"{}".to_vec());
        assert!(docker
            .create_args("p-1", &opts)
            .contains(&"--interactive".to_owned()));
    }

    #[test]
    fn debug_volume_is_bound() {
        let docker = DockerCli::new();
        docker.set_debug_volume(Some("debugvol".to_owned()));
        let args = docker.create_args("p-1", &RunOptions::new("img", "p"));
        assert!(args.contains(&"debugvol:/debug".to_owned()));
        docker.set_debug_volume(None);
        let args = docker.create_args("p-1", &RunOptions::new("img", "p"));
        assert!(!args.iter().any(|a| a.ends_with(":/debug")));
    }

    #[test]
    fn exec_args_for_protocol_call() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let opts = ExecOptions {
            container_id: "abc",
            cmd: vec!["/app".to_owned(), "forward".to_owned()],
            env: vec![("SECRET".to_owned(), "value".to_owned())],
            input: ExecInput::Bytes(b"{}\n".to_vec()),
            output: &mut out,
            error: &mut err,
            tty: false,
            working_dir: None,
        };
        assert_eq!(
            DockerCli::exec_args(&opts),
            vec!["exec", "--interactive", "--env", "SECRET", "abc", "/app", "forward"]
        );
    }

    #[test]
    fn exec_args_for_shell() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let opts = ExecOptions {
            container_id: "abc",
            cmd: vec!["/bin/sh".to_owned()],
            env: Vec::new(),
            input: ExecInput::Inherit,
            output: &mut out,
            error: &mut err,
            tty: true,
            working_dir: Some("/code".to_owned()),
        };
        assert_eq!(
            DockerCli::exec_args(&opts),
            vec!["exec", "--interactive", "--tty", "--workdir", "/code", "abc", "/bin/sh"]
        );
    }

    #[test]
    fn parses_container_state() {
        assert_eq!(
            parse_state("exited|143|\n").unwrap(),
            ContainerState {
                status: "exited".to_owned(),
                exit_code: 143,
                error: String::new(),
            }
        );
        let failed = parse_state("created|127|exec: \"/nope\": no such file|x\n").unwrap();
        assert_eq!(failed.status, "created");
        assert_eq!(failed.error, "exec: \"/nope\": no such file|x");
        assert!(parse_state("garbage").is_err());
    }

    #[test]
    fn pull_progress_drops_byte_level_updates() {
        assert_eq!(
            progress_line("a3ed95caeb02: Pulling fs layer"),
            Some("a3ed95caeb02: Pulling fs layer".to_owned())
        );
        assert_eq!(progress_line("a3ed95caeb02: Downloading [=>   ] 1MB/9MB"), None);
        assert_eq!(progress_line("a3ed95caeb02: Extracting [=>   ] 1MB/9MB"), None);
        assert_eq!(
            progress_line("Status: Downloaded newer image for alpine:3"),
            Some("Status: Downloaded newer image for alpine:3".to_owned())
        );
        assert_eq!(progress_line(""), None);
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(b"Error: No such volume: foo"));
        assert!(is_not_found(b"Error response from daemon: No such image: x:1"));
        assert!(!is_not_found(b"permission denied"));
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let docker = DockerCli::with_binary("cdflow2-no-such-docker-binary");
        assert!(!docker.available());
        assert!(matches!(
            docker.volume_exists("v"),
            Err(RuntimeError::Unavailable(_))
        ));
    }
}
