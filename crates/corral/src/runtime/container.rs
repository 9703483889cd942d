//! Container type and operations.

use corral_common::{ContainerId, CorralError, CorralResult};
use corral_oci::ContainerState;
use corral_oci::state::ContainerStatus;

use super::config::RuntimeConfig;
use super::container_config::ContainerConfig;
use super::state::StateManager;
use crate::cgroup::CgroupManager;
use crate::exec::Process;
use crate::exec::bootstrap::bootstrap;
use crate::exec::process::{process_alive, send_signal};

/// A container instance.
///
/// Obtained from [`super::Factory::create`] or [`super::Factory::load`].
#[derive(Debug)]
pub struct Container {
    /// Container ID.
    id: ContainerId,
    /// Configuration derived from the bundle.
    config: ContainerConfig,
    /// Persisted lifecycle state.
    state: ContainerState,
    /// Runtime configuration.
    runtime: RuntimeConfig,
    /// State store.
    store: StateManager,
    /// Set once [`Container::destroy`] has run.
    destroyed: bool,
}

impl Container {
    pub(super) const fn new(
        id: ContainerId,
        config: ContainerConfig,
        state: ContainerState,
        runtime: RuntimeConfig,
        store: StateManager,
    ) -> Self {
        Self {
            id,
            config,
            state,
            runtime,
            store,
            destroyed: false,
        }
    }

    /// ID accessor.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Configuration the container was created with.
    #[must_use]
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Get the container state.
    #[must_use]
    pub const fn state(&self) -> &ContainerState {
        &self.state
    }

    /// Get the container status.
    #[must_use]
    pub const fn status(&self) -> ContainerStatus {
        self.state.status
    }

    /// Host pid of the container process while running.
    #[must_use]
    pub const fn pid(&self) -> Option<i32> {
        self.state.pid
    }

    /// Start `process` as the container's process.
    ///
    /// Places it in the container cgroup, runs the init handshake and
    /// records the container as running. The process's environment and
    /// descriptors are frozen from here on. On error the container stays
    /// `created` and should be destroyed.
    pub fn start(&mut self, process: &mut Process) -> CorralResult<()> {
        if !self.state.status.can_start() {
            return Err(self.invalid_state("start"));
        }

        let cgroup = CgroupManager::create(
            self.id.as_str(),
            &self.runtime.cgroup_root,
            &self.config.cgroup,
        )?;

        bootstrap(&self.runtime, &self.config, &cgroup, process)?;

        let pid = process.pid().ok_or_else(|| CorralError::Internal {
            message: "init handshake succeeded without a pid".to_string(),
        })?;
        self.state.set_running(pid);
        self.store.save(&self.state)?;

        tracing::info!(container_id = %self.id, pid, "Container started");
        Ok(())
    }

    /// Send a signal to the container process.
    pub fn signal(&self, signal: i32) -> CorralResult<()> {
        let pid = match self.state.pid {
            Some(pid) if self.state.status.is_running() => pid,
            _ => return Err(self.invalid_state("signal")),
        };
        tracing::debug!(container_id = %self.id, pid, signal, "Signalling container");
        send_signal(pid, signal)
    }

    /// Record that the container's process has exited and been reaped.
    pub fn mark_stopped(&mut self) -> CorralResult<()> {
        if self.state.status.is_stopped() {
            return Ok(());
        }
        self.state.set_stopped();
        self.store.save(&self.state)?;
        tracing::debug!(container_id = %self.id, "Container stopped");
        Ok(())
    }

    /// Mark a running container stopped if its process is gone.
    pub(super) fn refresh(&mut self) -> CorralResult<()> {
        if let Some(pid) = self.state.pid {
            if self.state.status.is_running() && !process_alive(pid) {
                tracing::debug!(container_id = %self.id, pid, "Container process is gone");
                self.state.set_stopped();
                self.store.save(&self.state)?;
            }
        }
        Ok(())
    }

    /// Tear down every resource held by the container.
    ///
    /// Kills remaining processes, removes the cgroup and the persisted
    /// state. Every step runs even if an earlier one fails; the first error
    /// is returned. Calling it again is a no-op.
    pub fn destroy(&mut self) -> CorralResult<()> {
        if self.destroyed {
            return Ok(());
        }

        let cgroup = CgroupManager::open(
            self.id.as_str(),
            &self.runtime.cgroup_root,
            &self.config.cgroup,
        );

        let mut first_error = None;
        let mut record = |step: &str, result: CorralResult<()>| {
            if let Err(e) = result {
                tracing::warn!(container_id = %self.id, step, error = %e, "Destroy step failed");
                first_error.get_or_insert(e);
            }
        };

        // Only cgroup members are signalled: a recorded pid may already have
        // been reaped and reused by an unrelated process.
        if cgroup.has_processes() {
            record("kill", cgroup.kill_all());
        }

        record("remove cgroup", cgroup.delete());
        record("remove state", self.store.delete(self.id.as_str()));

        self.state.set_stopped();
        self.destroyed = true;
        tracing::info!(container_id = %self.id, "Container destroyed");

        first_error.map_or(Ok(()), Err)
    }

    fn invalid_state(&self, operation: &str) -> CorralError {
        CorralError::InvalidState {
            id: self.id.to_string(),
            status: self.state.status.to_string(),
            operation: operation.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn container(root: &Path) -> Container {
        let runtime = RuntimeConfig::default()
            .with_root(root.join("state"))
            .with_cgroup_root(root.join("cgroup"));
        let store = StateManager::new(runtime.paths.clone());
        let config: ContainerConfig =
            serde_json::from_str(r#"{"bundle":"/b","rootfs":"/b/rootfs"}"#).unwrap();
        let state = ContainerState::new("web", "/b", "/b/rootfs");

        std::fs::create_dir_all(runtime.paths.container("web")).unwrap();
        store.save(&state).unwrap();

        Container::new(
            ContainerId::new("web").unwrap(),
            config,
            state,
            runtime,
            store,
        )
    }

    #[test_log::test]
    fn signal_requires_running() {
        let root = tempfile::tempdir().unwrap();
        let container = container(root.path());
        let err = container.signal(libc::SIGTERM).unwrap_err();
        assert!(matches!(err, CorralError::InvalidState { .. }));
    }

    #[test_log::test]
    fn destroy_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut container = container(root.path());

        container.destroy().unwrap();
        assert!(container.status().is_stopped());
        assert!(!root.path().join("state/containers/web").exists());

        container.destroy().unwrap();
    }

    #[test_log::test]
    fn start_after_destroy_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut container = container(root.path());
        container.destroy().unwrap();

        let mut process = Process::default();
        let err = container.start(&mut process).unwrap_err();
        assert!(matches!(err, CorralError::InvalidState { .. }));
    }

    #[test_log::test]
    fn destroy_leaves_recorded_pid_outside_cgroup_alone() {
        let root = tempfile::tempdir().unwrap();
        let mut container = container(root.path());

        // Stands in for a reaped container process whose pid was reused.
        let mut unrelated = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        container.state.set_running(i32::try_from(unrelated.id()).unwrap());

        container.destroy().unwrap();

        let status = unrelated.try_wait().unwrap();
        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
        assert!(status.is_none(), "unrelated process was signalled: {status:?}");
    }

    #[test_log::test]
    fn mark_stopped_persists() {
        let root = tempfile::tempdir().unwrap();
        let mut container = container(root.path());
        container.state.set_running(i32::MAX);

        container.mark_stopped().unwrap();
        assert!(container.status().is_stopped());

        let saved = container.store.load(container.id.as_str()).unwrap();
        assert!(saved.status.is_stopped());
    }

    #[test_log::test]
    fn refresh_marks_dead_process_stopped() {
        let root = tempfile::tempdir().unwrap();
        let mut container = container(root.path());

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        child.wait().unwrap();

        container.state.set_running(pid);
        container.refresh().unwrap();
        assert!(container.status().is_stopped());
    }
}
