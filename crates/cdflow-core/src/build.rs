use crate::state::GlobalState;
use crate::CoreError;
use cdflow_runtime::{env_list, RunOptions, SharedWriter};
use cdflow_schema::BuildSection;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Bytes of build stdout held back to find the metadata line.
pub const TAIL_WINDOW: usize = 10 * 1024;

struct TailState {
    window: Vec<u8>,
    limit: usize,
    forward: SharedWriter,
}

/// Keeps the last `limit` bytes written and forwards anything older.
///
/// Clones share the same window, so one clone can be handed to the runtime
/// as the container's stdout while another reads the result afterwards.
#[derive(Clone)]
pub struct TailBuffer {
    state: Arc<Mutex<TailState>>,
}

impl TailBuffer {
    pub fn new(limit: usize, forward: SharedWriter) -> Self {
        Self {
            state: Arc::new(Mutex::new(TailState {
                window: Vec::new(),
                limit,
                forward,
            })),
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, TailState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("tail buffer mutex poisoned"))
    }

    /// Forward everything before the final line and parse that line as metadata.
    ///
    /// When no metadata can be parsed the whole window is forwarded, so the
    /// user still sees the end of the build's output.
    pub fn finish(&self) -> Result<BTreeMap<String, String>, String> {
        let mut state = self.lock().map_err(|e| e.to_string())?;
        let window = std::mem::take(&mut state.window);
        let parsed = split_metadata(&window);
        let shown = match &parsed {
            Ok((head, _)) => *head,
            Err(_) => &window[..],
        };
        state
            .forward
            .write_all(shown)
            .map_err(|e| format!("error forwarding build output: {e}"))?;
        parsed.map(|(_, metadata)| metadata)
    }

    /// Forward the held window as is.
    pub fn flush_all(&self) -> io::Result<()> {
        let mut state = self.lock()?;
        let window = std::mem::take(&mut state.window);
        state.forward.write_all(&window)?;
        state.forward.flush()
    }
}

/// Split held output into the log before the final line and that line's metadata.
fn split_metadata(window: &[u8]) -> Result<(&[u8], BTreeMap<String, String>), String> {
    if window.is_empty() {
        return Err("no output from build (expected a JSON metadata line)".to_owned());
    }
    let Some(body) = window.strip_suffix(b"\n") else {
        return Err("build output must end with a newline".to_owned());
    };
    let (head, last) = match body.iter().rposition(|b| *b == b'\n') {
        Some(pos) => window.split_at(pos + 1),
        None => (&[][..], window),
    };
    let last = String::from_utf8_lossy(last);
    let line = last.trim_end_matches('\n');
    let metadata = serde_json::from_str(line).map_err(|e| {
        format!("could not parse metadata from last line of build output {line:?}: {e}")
    })?;
    Ok((head, metadata))
}

impl Write for TailBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock()?;
        state.window.extend_from_slice(buf);
        if state.window.len() > state.limit {
            let excess = state.window.len() - state.limit;
            let evicted: Vec<u8> = state.window.drain(..excess).collect();
            state.forward.write_all(&evicted)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.forward.flush()
    }
}

/// Run one build plugin to completion and return the metadata it printed.
pub fn run_build(
    state: &GlobalState,
    build_id: &str,
    build: &BuildSection,
    env: &BTreeMap<String, String>,
    release_volume: &str,
) -> Result<BTreeMap<String, String>, CoreError> {
    info!("running build {build_id} with image {}", build.image);
    let tail = TailBuffer::new(TAIL_WINDOW, state.output.clone());

    let mut opts = RunOptions::new(&build.image, &format!("cdflow2-build-{build_id}"));
    opts.working_dir = Some("/code".to_owned());
    opts.env = env_list(env);
    opts.binds = vec![
        format!("{}:/code:ro", state.code_dir_str()),
        format!("{release_volume}:/release"),
        "/var/run/docker.sock:/var/run/docker.sock".to_owned(),
    ];
    opts.output = Box::new(tail.clone());
    opts.error = Box::new(state.error.clone());

    let failed = |message: String| CoreError::Build {
        build_id: build_id.to_owned(),
        message,
    };
    if let Err(e) = state.runtime.run(opts) {
        if let Err(flush) = tail.flush_all() {
            warn!("forwarding output of failed build {build_id}: {flush}");
        }
        return Err(failed(e.to_string()));
    }
    tail.finish().map_err(failed)
}
