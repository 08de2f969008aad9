use crate::CoreError;
use cdflow_runtime::ContainerRuntime;
use std::sync::Arc;
use tracing::{debug, warn};

/// The scratch volume mounted as `/release` for the length of one command.
///
/// `remove` reports the outcome; a volume that is dropped without being
/// removed is removed on a best-effort basis.
pub struct ReleaseVolume {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    removed: bool,
}

impl ReleaseVolume {
    pub fn create(runtime: Arc<dyn ContainerRuntime>) -> Result<Self, CoreError> {
        let name = runtime
            .create_volume(None)
            .map_err(|e| CoreError::runtime("error creating release volume", e))?;
        debug!("created release volume {name}");
        Ok(Self {
            runtime,
            name,
            removed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remove(mut self) -> Result<(), CoreError> {
        self.remove_inner()
    }

    fn remove_inner(&mut self) -> Result<(), CoreError> {
        self.removed = true;
        debug!("removing release volume {}", self.name);
        self.runtime
            .remove_volume(&self.name)
            .map_err(|e| CoreError::runtime("error removing release volume", e))
    }
}

impl Drop for ReleaseVolume {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = self.remove_inner() {
                warn!("{e}");
            }
        }
    }
}
