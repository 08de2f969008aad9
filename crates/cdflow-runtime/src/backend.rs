use crate::RuntimeError;
use std::fmt;
use std::io::{self, Write};
use std::sync::mpsc::SyncSender;
use std::time::Duration;

/// Runs just before a finished container is removed, with the container id.
pub type BeforeRemoveHook = Box<dyn FnOnce(&str) -> Result<(), RuntimeError> + Send>;

/// Everything needed to run a one-shot container to completion.
pub struct RunOptions {
    pub image: String,
    pub name_prefix: String,
    pub working_dir: Option<String>,
    /// Overrides the image entrypoint. The first element is the executable.
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    /// List-form environment; callers pass it sorted.
    pub env: Vec<(String, String)>,
    pub binds: Vec<String>,
    /// When set, the container is attached three-way and this is its stdin.
    pub input: Option<Vec<u8>>,
    pub output: Box<dyn Write + Send>,
    pub error: Box<dyn Write + Send>,
    /// Receives the container id once the container has been attached and started.
    pub started: Option<SyncSender<String>>,
    pub init: bool,
    pub success_status: i64,
    pub before_remove: Option<BeforeRemoveHook>,
}

impl RunOptions {
    pub fn new(image: &str, name_prefix: &str) -> Self {
        Self {
            image: image.to_owned(),
            name_prefix: name_prefix.to_owned(),
            working_dir: None,
            entrypoint: None,
            cmd: Vec::new(),
            env: Vec::new(),
            binds: Vec::new(),
            input: None,
            output: Box::new(io::sink()),
            error: Box::new(io::sink()),
            started: None,
            init: false,
            success_status: 0,
            before_remove: None,
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("image", &self.image)
            .field("name_prefix", &self.name_prefix)
            .field("working_dir", &self.working_dir)
            .field("entrypoint", &self.entrypoint)
            .field("cmd", &self.cmd)
            .field("binds", &self.binds)
            .field("init", &self.init)
            .field("success_status", &self.success_status)
            .finish_non_exhaustive()
    }
}

/// Where an exec'd process reads its stdin from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecInput {
    #[default]
    Null,
    Bytes(Vec<u8>),
    /// The host process's own stdin, for interactive commands.
    Inherit,
}

/// A process to run inside an already running container.
///
/// With `tty` set the process is attached to the host terminal directly and
/// the `output`/`error` sinks are not used.
pub struct ExecOptions<'a> {
    pub container_id: &'a str,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub input: ExecInput,
    pub output: &'a mut (dyn Write + Send),
    pub error: &'a mut (dyn Write + Send),
    pub tty: bool,
    pub working_dir: Option<String>,
}

pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Create, start and wait for a container, then remove it.
    ///
    /// Succeeds when the exit code equals `success_status`. Images are not
    /// pulled implicitly.
    fn run(&self, opts: RunOptions) -> Result<(), RuntimeError>;

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pull an image, writing condensed progress lines to `progress`.
    fn pull_image(&self, image: &str, progress: &mut dyn Write) -> Result<(), RuntimeError>;

    /// Pull an image only when it is not present locally.
    fn ensure_image(&self, image: &str, progress: &mut dyn Write) -> Result<(), RuntimeError> {
        if self.image_exists(image)? {
            return Ok(());
        }
        self.pull_image(image, progress)
    }

    fn image_repo_digests(&self, image: &str) -> Result<Vec<String>, RuntimeError>;

    /// Run a process in a running container; fails on a non-zero exit code.
    fn exec(&self, opts: ExecOptions<'_>) -> Result<(), RuntimeError>;

    /// SIGTERM, then SIGKILL once `timeout` has passed.
    fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Create a volume, letting the runtime pick a name when none is given.
    fn create_volume(&self, name: Option<&str>) -> Result<String, RuntimeError>;

    fn remove_volume(&self, id: &str) -> Result<(), RuntimeError>;

    fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Extract a tar stream into the container filesystem under `path`.
    fn copy_to_container(
        &self,
        container_id: &str,
        path: &str,
        tar: &[u8],
    ) -> Result<(), RuntimeError>;

    /// Read `path` out of the container as a tar stream.
    fn copy_from_container(&self, container_id: &str, path: &str)
        -> Result<Vec<u8>, RuntimeError>;

    /// Bind `<volume>:/debug` into every subsequent run. Test use only.
    fn set_debug_volume(&self, volume: Option<String>);
}

pub fn select_runtime(name: &str) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "mock" => Ok(Box::new(crate::mock::MockRuntime::new())),
        "" => Err(RuntimeError::Unavailable(name.to_owned())),
        binary => Ok(Box::new(crate::docker::DockerCli::with_binary(binary))),
    }
}
