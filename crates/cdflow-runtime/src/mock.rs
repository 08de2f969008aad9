use crate::backend::{ContainerRuntime, ExecInput, ExecOptions, RunOptions};
use crate::{random_name, RuntimeError};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Exit status a kept-alive mock container reports after being stopped.
pub const STOPPED_STATUS: i64 = 128 + 15;

/// A recorded `run` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCall {
    pub id: String,
    pub image: String,
    pub name_prefix: String,
    pub working_dir: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub binds: Vec<String>,
    pub input: Option<Vec<u8>>,
    pub init: bool,
    pub success_status: i64,
}

impl RunCall {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        lookup(&self.env, key)
    }
}

/// A recorded `exec` call, with the image of the container it ran in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub container_id: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub input: ExecInput,
    pub tty: bool,
    pub working_dir: Option<String>,
}

impl ExecCall {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        lookup(&self.env, key)
    }

    pub fn input_bytes(&self) -> &[u8] {
        match &self.input {
            ExecInput::Bytes(bytes) => bytes,
            _ => &[],
        }
    }
}

fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Scripted container behaviour: writes to stdout/stderr and returns an exit status.
pub type RunHandler = Arc<dyn Fn(&RunCall, &mut dyn Write, &mut dyn Write) -> i64 + Send + Sync>;
pub type ExecHandler =
    Arc<dyn Fn(&ExecCall, &mut dyn Write, &mut dyn Write) -> i64 + Send + Sync>;

#[derive(Debug)]
struct Container {
    image: String,
    stopped: bool,
}

#[derive(Default)]
struct MockState {
    runs: Vec<RunCall>,
    execs: Vec<ExecCall>,
    stops: Vec<(String, Duration)>,
    containers: HashMap<String, Container>,
    removed_containers: Vec<String>,
    volumes: BTreeSet<String>,
    created_volumes: Vec<String>,
    removed_volumes: Vec<String>,
    copies: Vec<(String, String, Vec<u8>)>,
    pulls: Vec<String>,
    local_images: BTreeSet<String>,
    missing_images: BTreeSet<String>,
    repo_digests: HashMap<String, Vec<String>>,
    keep_running: BTreeSet<String>,
    run_handlers: HashMap<String, RunHandler>,
    exec_handlers: HashMap<String, ExecHandler>,
    debug_volume: Option<String>,
}

/// In-memory runtime that records every call and plays back scripted behaviour.
///
/// Containers of images registered with `keep_running` stay up until `stop`
/// and then exit with `STOPPED_STATUS`. Other containers run their `on_run`
/// handler, or exit 0 straight away.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<(Mutex<MockState>, Condvar)>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .0
            .lock()
            .map_err(|e| RuntimeError::InvalidOutput(format!("mock mutex poisoned: {e}")))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = match self.state.0.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn keep_running(&self, image: &str) {
        self.with_state(|s| s.keep_running.insert(image.to_owned()));
    }

    pub fn on_run<F>(&self, image: &str, handler: F)
    where
        F: Fn(&RunCall, &mut dyn Write, &mut dyn Write) -> i64 + Send + Sync + 'static,
    {
        self.with_state(|s| s.run_handlers.insert(image.to_owned(), Arc::new(handler)));
    }

    pub fn on_exec<F>(&self, image: &str, handler: F)
    where
        F: Fn(&ExecCall, &mut dyn Write, &mut dyn Write) -> i64 + Send + Sync + 'static,
    {
        self.with_state(|s| s.exec_handlers.insert(image.to_owned(), Arc::new(handler)));
    }

    pub fn add_local_image(&self, image: &str, digests: &[&str]) {
        self.with_state(|s| {
            s.local_images.insert(image.to_owned());
            s.repo_digests.insert(
                image.to_owned(),
                digests.iter().map(|d| (*d).to_owned()).collect(),
            );
        });
    }

    /// Make pulls of `image` fail as if the registry did not have it.
    pub fn mark_missing(&self, image: &str) {
        self.with_state(|s| s.missing_images.insert(image.to_owned()));
    }

    pub fn runs(&self) -> Vec<RunCall> {
        self.with_state(|s| s.runs.clone())
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.with_state(|s| s.execs.clone())
    }

    pub fn stops(&self) -> Vec<(String, Duration)> {
        self.with_state(|s| s.stops.clone())
    }

    pub fn pulls(&self) -> Vec<String> {
        self.with_state(|s| s.pulls.clone())
    }

    /// `(container id, path, tar bytes)` for every copy into a container.
    pub fn copies(&self) -> Vec<(String, String, Vec<u8>)> {
        self.with_state(|s| s.copies.clone())
    }

    pub fn created_volumes(&self) -> Vec<String> {
        self.with_state(|s| s.created_volumes.clone())
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.with_state(|s| s.removed_volumes.clone())
    }

    pub fn live_volumes(&self) -> Vec<String> {
        self.with_state(|s| s.volumes.iter().cloned().collect())
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.with_state(|s| s.removed_containers.clone())
    }

    /// Ids of containers that have been created but not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        self.with_state(|s| {
            let mut ids: Vec<String> = s.containers.keys().cloned().collect();
            ids.sort();
            ids
        })
    }

    fn default_digest(image: &str) -> String {
        let repository = match image.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => repo,
            _ => image,
        };
        format!(
            "{repository}@sha256:{}",
            blake3::hash(image.as_bytes()).to_hex()
        )
    }

    fn wait_until_stopped(&self, id: &str) -> Result<(), RuntimeError> {
        let (lock, cvar) = &*self.state;
        let mut guard = lock
            .lock()
            .map_err(|e| RuntimeError::InvalidOutput(format!("mock mutex poisoned: {e}")))?;
        while !guard.containers.get(id).is_some_and(|c| c.stopped) {
            guard = cvar
                .wait(guard)
                .map_err(|e| RuntimeError::InvalidOutput(format!("mock mutex poisoned: {e}")))?;
        }
        Ok(())
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn run(&self, mut opts: RunOptions) -> Result<(), RuntimeError> {
        let (call, handler, keep_running) = {
            let mut state = self.lock()?;
            let mut binds = opts.binds.clone();
            if let Some(volume) = &state.debug_volume {
                binds.push(format!("{volume}:/debug"));
            }
            let call = RunCall {
                id: random_name(&opts.name_prefix),
                image: opts.image.clone(),
                name_prefix: opts.name_prefix.clone(),
                working_dir: opts.working_dir.clone(),
                entrypoint: opts.entrypoint.clone(),
                cmd: opts.cmd.clone(),
                env: opts.env.clone(),
                binds,
                input: opts.input.clone(),
                init: opts.init,
                success_status: opts.success_status,
            };
            state.runs.push(call.clone());
            state.containers.insert(
                call.id.clone(),
                Container {
                    image: opts.image.clone(),
                    stopped: false,
                },
            );
            let handler = state.run_handlers.get(&opts.image).cloned();
            let keep_running = state.keep_running.contains(&opts.image);
            (call, handler, keep_running)
        };

        if let Some(started) = opts.started.take() {
            let _ = started.send(call.id.clone());
        }

        let mut status = 0;
        if let Some(handler) = handler {
            status = handler(&call, &mut opts.output, &mut opts.error);
        }
        let exit_code = if keep_running && status == 0 {
            self.wait_until_stopped(&call.id).map(|()| STOPPED_STATUS)
        } else {
            Ok(status)
        };
        let result = exit_code.and_then(|code| {
            if code == opts.success_status {
                Ok(())
            } else {
                Err(RuntimeError::ContainerExit(code))
            }
        });

        let hook_result = match opts.before_remove.take() {
            Some(hook) => hook(&call.id),
            None => Ok(()),
        };
        self.with_state(|s| {
            s.containers.remove(&call.id);
            s.removed_containers.push(call.id.clone());
        });
        RuntimeError::chain(result, hook_result)
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.lock()?.local_images.contains(image))
    }

    fn pull_image(&self, image: &str, progress: &mut dyn Write) -> Result<(), RuntimeError> {
        {
            let mut state = self.lock()?;
            state.pulls.push(image.to_owned());
            if state.missing_images.contains(image) {
                return Err(RuntimeError::ImageNotFound(image.to_owned()));
            }
            state.local_images.insert(image.to_owned());
        }
        writeln!(progress, "Status: Downloaded newer image for {image}")?;
        Ok(())
    }

    fn image_repo_digests(&self, image: &str) -> Result<Vec<String>, RuntimeError> {
        let state = self.lock()?;
        if let Some(digests) = state.repo_digests.get(image) {
            return Ok(digests.clone());
        }
        if state.local_images.contains(image) {
            return Ok(vec![Self::default_digest(image)]);
        }
        Err(RuntimeError::ImageNotFound(image.to_owned()))
    }

    fn exec(&self, opts: ExecOptions<'_>) -> Result<(), RuntimeError> {
        let (call, handler) = {
            let mut state = self.lock()?;
            let image = match state.containers.get(opts.container_id) {
                Some(c) if !c.stopped => c.image.clone(),
                Some(_) => {
                    return Err(RuntimeError::CommandFailed {
                        action: "exec".to_owned(),
                        message: format!("container {} is not running", opts.container_id),
                    })
                }
                None => {
                    return Err(RuntimeError::CommandFailed {
                        action: "exec".to_owned(),
                        message: format!("No such container: {}", opts.container_id),
                    })
                }
            };
            let call = ExecCall {
                container_id: opts.container_id.to_owned(),
                image,
                cmd: opts.cmd.clone(),
                env: opts.env.clone(),
                input: opts.input.clone(),
                tty: opts.tty,
                working_dir: opts.working_dir.clone(),
            };
            state.execs.push(call.clone());
            let handler = state.exec_handlers.get(&call.image).cloned();
            (call, handler)
        };
        let code = match handler {
            Some(handler) => handler(&call, opts.output, opts.error),
            None => 0,
        };
        if code != 0 {
            return Err(RuntimeError::ExecExit(code));
        }
        Ok(())
    }

    fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.stops.push((container_id.to_owned(), timeout));
        match state.containers.get_mut(container_id) {
            Some(container) => container.stopped = true,
            None => {
                return Err(RuntimeError::CommandFailed {
                    action: "stopping container".to_owned(),
                    message: format!("No such container: {container_id}"),
                })
            }
        }
        drop(state);
        self.state.1.notify_all();
        Ok(())
    }

    fn create_volume(&self, name: Option<&str>) -> Result<String, RuntimeError> {
        let mut state = self.lock()?;
        let name = name.map_or_else(|| random_name("mockvol"), str::to_owned);
        state.volumes.insert(name.clone());
        state.created_volumes.push(name.clone());
        Ok(name)
    }

    fn remove_volume(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        if !state.volumes.remove(id) {
            return Err(RuntimeError::CommandFailed {
                action: "removing volume".to_owned(),
                message: format!("No such volume: {id}"),
            });
        }
        state.removed_volumes.push(id.to_owned());
        Ok(())
    }

    fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.lock()?.volumes.contains(name))
    }

    fn copy_to_container(
        &self,
        container_id: &str,
        path: &str,
        tar: &[u8],
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        if !state.containers.contains_key(container_id) {
            return Err(RuntimeError::CommandFailed {
                action: "copying to container".to_owned(),
                message: format!("No such container: {container_id}"),
            });
        }
        state
            .copies
            .push((container_id.to_owned(), path.to_owned(), tar.to_vec()));
        Ok(())
    }

    fn copy_from_container(
        &self,
        container_id: &str,
        path: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        let state = self.lock()?;
        state
            .copies
            .iter()
            .rev()
            .find(|(id, p, _)| id == container_id && p == path)
            .map(|(_, _, bytes)| bytes.clone())
            .ok_or_else(|| RuntimeError::CommandFailed {
                action: "copying from container".to_owned(),
                message: format!("Could not find the file {path} in container {container_id}"),
            })
    }

    fn set_debug_volume(&self, volume: Option<String>) {
        self.with_state(|s| s.debug_volume = volume);
    }
}
