//! Container state management.
//!
//! Based on the OCI Runtime Specification state format:
//! <https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state>

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI version.
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Container status.
    pub status: ContainerStatus,
    /// Process ID of the container's main process, as seen from the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Path to the bundle.
    pub bundle: PathBuf,
    /// Resolved root filesystem.
    pub rootfs: PathBuf,
    /// When the container record was created.
    pub created: DateTime<Utc>,
}

/// Container status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container has been registered but its process has not started.
    Created,
    /// Container process is running.
    Running,
    /// Container process has exited or the container was destroyed.
    Stopped,
}

impl ContainerStatus {
    /// Returns true if the container can be started.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Returns true if the container is in a running state.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container has exited.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl ContainerState {
    /// Create a new container state in the "created" status.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        bundle: impl Into<PathBuf>,
        rootfs: impl Into<PathBuf>,
    ) -> Self {
        Self {
            oci_version: "1.2.0".to_string(),
            id: id.into(),
            status: ContainerStatus::Created,
            pid: None,
            bundle: bundle.into(),
            rootfs: rootfs.into(),
            created: Utc::now(),
        }
    }

    /// Transition to the "running" status.
    pub fn set_running(&mut self, pid: i32) {
        self.status = ContainerStatus::Running;
        self.pid = Some(pid);
    }

    /// Transition to the "stopped" status.
    pub fn set_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.pid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let mut state = ContainerState::new("test-container", "/bundles/test", "/bundles/test/rootfs");
        assert_eq!(state.status, ContainerStatus::Created);
        assert!(state.status.can_start());
        assert_eq!(state.pid, None);

        state.set_running(12345);
        assert!(state.status.is_running());
        assert!(!state.status.can_start());
        assert_eq!(state.pid, Some(12345));

        state.set_stopped();
        assert!(state.status.is_stopped());
        assert_eq!(state.pid, None);
    }

    #[test]
    fn state_serialization() {
        let mut state = ContainerState::new("test-container", "/bundles/test", "/bundles/test/rootfs");
        state.set_running(12345);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"pid\":12345"));
        assert!(json.contains("\"ociVersion\""));

        let back: ContainerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.created, state.created);
    }

    #[test]
    fn status_display() {
        assert_eq!(ContainerStatus::Created.to_string(), "created");
        assert_eq!(ContainerStatus::Running.to_string(), "running");
        assert_eq!(ContainerStatus::Stopped.to_string(), "stopped");
    }
}
