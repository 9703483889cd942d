//! Container state persistence.

use std::io::Write;
use std::path::Path;

use corral_common::{CorralError, CorralPaths, CorralResult};
use corral_oci::ContainerState;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::ContainerConfig;

/// Manages container state persistence.
#[derive(Debug, Clone)]
pub struct StateManager {
    paths: CorralPaths,
}

impl StateManager {
    /// Create a new state manager.
    #[must_use]
    pub const fn new(paths: CorralPaths) -> Self {
        Self { paths }
    }

    /// Save container state.
    pub fn save(&self, state: &ContainerState) -> CorralResult<()> {
        let path = self.paths.container_state(&state.id);
        write_json_atomic(&path, state)?;

        tracing::debug!(
            container_id = %state.id,
            path = %path.display(),
            "Saved container state"
        );

        Ok(())
    }

    /// Load container state.
    pub fn load(&self, container_id: &str) -> CorralResult<ContainerState> {
        let path = self.paths.container_state(container_id);
        let state = read_json(&path).map_err(|e| not_found_as(e, container_id))?;

        tracing::debug!(
            container_id = %container_id,
            path = %path.display(),
            "Loaded container state"
        );

        Ok(state)
    }

    /// Save the runtime configuration next to the state.
    pub fn save_config(&self, container_id: &str, config: &ContainerConfig) -> CorralResult<()> {
        write_json_atomic(&self.paths.container_config(container_id), config)
    }

    /// Load the runtime configuration.
    pub fn load_config(&self, container_id: &str) -> CorralResult<ContainerConfig> {
        read_json(&self.paths.container_config(container_id))
            .map_err(|e| not_found_as(e, container_id))
    }

    /// Delete container state. Missing state is not an error.
    pub fn delete(&self, container_id: &str) -> CorralResult<()> {
        let container_dir = self.paths.container(container_id);

        match std::fs::remove_dir_all(&container_dir) {
            Ok(()) => {
                tracing::debug!(
                    container_id = %container_id,
                    path = %container_dir.display(),
                    "Deleted container state"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CorralError::io_context("remove container state", e)),
        }
    }

    /// Check if a container exists.
    #[must_use]
    pub fn exists(&self, container_id: &str) -> bool {
        self.paths.container_state(container_id).exists()
    }
}

fn not_found_as(err: CorralError, container_id: &str) -> CorralError {
    if err.is_not_found() {
        CorralError::ContainerNotFound {
            id: container_id.to_string(),
        }
    } else {
        err
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> CorralResult<T> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Write JSON through a temporary file in the same directory and rename it
/// into place, so readers never observe a partial file.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CorralResult<()> {
    let dir = path.parent().ok_or_else(|| CorralError::Internal {
        message: format!("{} has no parent directory", path.display()),
    })?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| CorralError::Io(e.error))?;

    Ok(())
}
