use crate::CoreError;
use cdflow_runtime::{ContainerRuntime, RunOptions, RuntimeError};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Exit status of a container that was stopped with SIGTERM.
pub const SIGTERM_STATUS: i64 = 128 + 15;

/// A long-lived container driven by its own run thread.
///
/// The thread publishes the container id once started and the run result once
/// the container has exited. Dropping an unfinished container stops it and
/// waits for the run thread.
pub(crate) struct BackgroundContainer {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    label: &'static str,
    stop_timeout: Duration,
    done_rx: Receiver<Result<(), RuntimeError>>,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl BackgroundContainer {
    pub(crate) fn start(
        runtime: Arc<dyn ContainerRuntime>,
        mut opts: RunOptions,
        label: &'static str,
        stop_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        opts.started = Some(started_tx);

        let runner = Arc::clone(&runtime);
        let handle = thread::Builder::new()
            .name(label.replace(' ', "-"))
            .spawn(move || {
                let result = runner.run(opts);
                let _ = done_tx.send(result);
            })?;

        match started_rx.recv() {
            Ok(id) => {
                debug!("{label} started: {id}");
                Ok(Self {
                    runtime,
                    id,
                    label,
                    stop_timeout,
                    done_rx,
                    handle: Some(handle),
                    finished: false,
                })
            }
            Err(_) => {
                let result = done_rx.recv();
                let _ = handle.join();
                Err(match result {
                    Ok(Err(e)) => CoreError::runtime(format!("error starting {label}"), e),
                    Ok(Ok(())) => CoreError::Internal(format!("{label} exited without starting")),
                    Err(_) => CoreError::Internal(format!("{label} run thread ended without a result")),
                })
            }
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Stop the container unless it already exited, then return its run result.
    pub(crate) fn finish(&mut self) -> Result<(), CoreError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let result = match self.done_rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => {
                debug!("stopping {label} {id}", label = self.label, id = self.id);
                let stopped = self.runtime.stop(&self.id, self.stop_timeout);
                let result = match self.done_rx.recv() {
                    Ok(Err(RuntimeError::ContainerExit(SIGTERM_STATUS))) => Ok(()),
                    Ok(result) => result,
                    Err(_) => Err(RuntimeError::InvalidOutput(format!(
                        "{} run thread ended without a result",
                        self.label
                    ))),
                };
                RuntimeError::chain(result, stopped)
            }
            Err(TryRecvError::Disconnected) => Err(RuntimeError::InvalidOutput(format!(
                "{} run thread ended without a result",
                self.label
            ))),
        };
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        result.map_err(|e| CoreError::runtime(self.label, e))
    }
}

impl Drop for BackgroundContainer {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                warn!("failed to shut down {}: {e}", self.label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdflow_runtime::MockRuntime;

    #[test]
    fn start_and_finish_stops_container() {
        let mock = MockRuntime::new();
        mock.keep_running("sidecar");
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(mock.clone());
        let mut container = BackgroundContainer::start(
            runtime,
            RunOptions::new("sidecar", "cdflow2-test"),
            "test container",
            Duration::from_secs(2),
        )
        .unwrap();
        let id = container.id().to_owned();
        assert_eq!(mock.live_containers(), vec![id.clone()]);
        container.finish().unwrap();
        assert_eq!(mock.stops(), vec![(id, Duration::from_secs(2))]);
        assert!(mock.live_containers().is_empty());
    }

    #[test]
    fn drop_stops_unfinished_container() {
        let mock = MockRuntime::new();
        mock.keep_running("sidecar");
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(mock.clone());
        {
            let _container = BackgroundContainer::start(
                runtime,
                RunOptions::new("sidecar", "cdflow2-test"),
                "test container",
                Duration::from_secs(10),
            )
            .unwrap();
        }
        assert_eq!(mock.stops().len(), 1);
        assert!(mock.live_containers().is_empty());
    }

    #[test]
    fn exit_before_finish_is_reported_without_stop() {
        let mock = MockRuntime::new();
        mock.on_run("crashy", |_, _, _| 1);
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(mock.clone());
        let mut container = BackgroundContainer::start(
            runtime,
            RunOptions::new("crashy", "cdflow2-test"),
            "test container",
            Duration::from_secs(2),
        )
        .unwrap();
        while !container.handle.as_ref().is_some_and(JoinHandle::is_finished) {
            std::thread::yield_now();
        }
        let err = container.finish().unwrap_err();
        assert_eq!(
            err.to_string(),
            "test container: container exited with unsuccessful exit code 1"
        );
        assert!(mock.stops().is_empty());
    }
}
