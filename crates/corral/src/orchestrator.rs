//! Top-level start sequence with compensation.
//!
//! `start_container` drives one container through create, start, optional
//! pid file and either detach or wait. Every failure after the container is
//! registered destroys it again, and a failure after the process started
//! kills that process first, so no error leaves an unmanaged process behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use corral_oci::Spec;

use crate::exec::{NotifySocket, Process, SignalForwarder, activation, setup_io};
use crate::runtime::{Container, ContainerConfig, Factory};

/// Options of a single start.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Container ID.
    pub id: String,
    /// Terminal device to use instead of allocating a pty.
    pub console: Option<PathBuf>,
    /// Return once the process runs instead of waiting for it.
    pub detach: bool,
    /// Where to write the process's host pid.
    pub pid_file: Option<PathBuf>,
}

/// Refuse to run without full administrative privilege.
///
/// # Errors
///
/// Returns [`CorralError::PermissionDenied`] when the effective uid is not 0.
pub fn ensure_privileged() -> CorralResult<()> {
    if rustix::process::geteuid().is_root() {
        return Ok(());
    }
    Err(CorralError::PermissionDenied {
        operation: "corral must be run as root".to_string(),
    })
}

/// Create and start a container from `spec`, then wait for or detach from
/// its process.
///
/// Returns the process's exit status (`128 + n` when killed by signal `n`)
/// when attached, and 0 when detached. A detached container is left
/// running and registered; an attached one is destroyed once its process
/// has exited.
///
/// Unless the factory's configuration opts out, fails with
/// [`CorralError::PermissionDenied`] before anything is created when not
/// running as root.
pub fn start_container(
    factory: &Factory,
    spec: &Spec,
    bundle: &Path,
    options: &StartOptions,
) -> CorralResult<i32> {
    if factory.config().require_root {
        ensure_privileged()?;
    }
    if options.id.is_empty() {
        return Err(CorralError::empty_id());
    }

    tracing::info!(container_id = %options.id, bundle = %bundle.display(), "Starting container");

    let process_spec = spec.process()?;
    let mut config = ContainerConfig::from_spec(&options.id, spec, bundle)?;
    let root_uid = config.host_uid()?;

    let notify = NotifySocket::from_env();
    if let Some(notify) = &notify {
        notify.prepare_config(&mut config);
    }

    let mut guard = ContainerGuard::new(factory.create(&options.id, config)?);

    let mut process = Process::from_spec(process_spec);
    activation::apply(&mut process, activation::listen_fds()?);
    if let Some(notify) = &notify {
        notify.prepare_process(&mut process);
    }

    // Installed before any copy thread exists so every launcher thread
    // inherits the blocked mask.
    let forwarder = if options.detach {
        None
    } else {
        Some(SignalForwarder::install()?)
    };

    let mut tty = setup_io(
        &mut process,
        root_uid,
        options.console.as_deref(),
        options.detach,
    )?;

    guard.container_mut().start(&mut process)?;
    let pid = process.pid().ok_or_else(|| CorralError::Internal {
        message: "started process has no pid".to_string(),
    })?;

    if let Some(notify) = &notify {
        if let Err(e) = notify.notify_main_pid(pid) {
            tracing::warn!(error = %e, "Failed to notify service manager");
        }
    }

    if let Some(path) = &options.pid_file {
        if let Err(e) = write_pid_file(path, pid) {
            tracing::warn!(pid, error = %e, "Pid file write failed, killing process");
            if let Err(kill) = process.signal(libc::SIGKILL) {
                tracing::warn!(pid, error = %kill, "Failed to kill process");
            }
            match process.wait() {
                Ok(_) => mark_stopped(guard.container_mut()),
                Err(wait) => tracing::warn!(pid, error = %wait, "Failed to reap process"),
            }
            return Err(e);
        }
    }

    let Some(forwarder) = &forwarder else {
        guard.disarm();
        tracing::info!(container_id = %options.id, pid, "Container detached");
        return Ok(0);
    };

    let code = forwarder.forward(&mut process, tty.as_mut())?;
    mark_stopped(guard.container_mut());
    tracing::info!(container_id = %options.id, exit_code = code, "Container exited");
    Ok(code)
}

/// Record a reaped process; the container is destroyed next either way.
fn mark_stopped(container: &mut Container) {
    if let Err(e) = container.mark_stopped() {
        tracing::warn!(container_id = %container.id(), error = %e, "Failed to record container stop");
    }
}

/// Write `pid` to `path` atomically: a temp file in the same directory is
/// renamed over the target.
pub fn write_pid_file(path: &Path, pid: i32) -> CorralResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| CorralError::io_context("create pid file", e))?;
    write!(tmp, "{pid}").map_err(|e| CorralError::io_context("write pid file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CorralError::io_context("sync pid file", e))?;
    tmp.persist(path)
        .map_err(|e| CorralError::io_context("rename pid file", e.error))?;

    tracing::debug!(path = %path.display(), pid, "Wrote pid file");
    Ok(())
}

/// Destroys the container when dropped unless disarmed.
struct ContainerGuard {
    container: Container,
    armed: bool,
}

impl ContainerGuard {
    const fn new(container: Container) -> Self {
        Self {
            container,
            armed: true,
        }
    }

    const fn container_mut(&mut self) -> &mut Container {
        &mut self.container
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.container.destroy() {
            tracing::warn!(container_id = %self.container.id(), error = %e, "Failed to destroy container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    fn factory(root: &Path) -> Factory {
        Factory::new(
            RuntimeConfig::default()
                .with_root(root.join("state"))
                .with_cgroup_root(root.join("cgroup"))
                .without_root_check(),
        )
    }

    fn spec(rootfs: &str) -> Spec {
        serde_json::from_value(serde_json::json!({
            "ociVersion": "1.2.0",
            "root": { "path": rootfs },
            "process": { "args": ["true"] }
        }))
        .unwrap()
    }

    #[test]
    fn empty_id_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let options = StartOptions::default();

        let err = start_container(&factory(tmp.path()), &spec("/"), tmp.path(), &options)
            .unwrap_err();
        assert!(matches!(err, CorralError::InvalidArgument { .. }));
        assert!(!tmp.path().join("state").exists());
    }

    #[test]
    fn root_check_runs_before_anything_else() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = Factory::new(RuntimeConfig::default().with_root(tmp.path().join("state")));

        let err = start_container(&factory, &spec("/"), tmp.path(), &StartOptions::default())
            .unwrap_err();
        if rustix::process::geteuid().is_root() {
            assert!(matches!(err, CorralError::InvalidArgument { .. }));
        } else {
            assert!(matches!(err, CorralError::PermissionDenied { .. }));
        }
        assert!(!tmp.path().join("state").exists());
    }

    #[test]
    fn missing_rootfs_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let options = StartOptions {
            id: "web".to_string(),
            ..StartOptions::default()
        };

        let err = start_container(&factory(tmp.path()), &spec("rootfs"), tmp.path(), &options)
            .unwrap_err();
        assert!(matches!(err, CorralError::RootfsNotFound { .. }));
        assert!(!tmp.path().join("state/containers/web").exists());
    }

    #[test]
    fn missing_process_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let spec: Spec = serde_json::from_value(serde_json::json!({
            "ociVersion": "1.2.0",
            "root": { "path": "/" }
        }))
        .unwrap();
        let options = StartOptions {
            id: "web".to_string(),
            ..StartOptions::default()
        };

        assert!(start_container(&factory(tmp.path()), &spec, tmp.path(), &options).is_err());
        assert!(!tmp.path().join("state/containers/web").exists());
    }

    #[test]
    fn pid_file_is_written_whole() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("web.pid");

        write_pid_file(&path, 4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242");

        write_pid_file(&path, 7).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7");
    }

    #[test]
    fn pid_file_in_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing/web.pid");
        let err = write_pid_file(&path, 1).unwrap_err();
        assert!(matches!(err, CorralError::Io(_)));
        assert!(!path.exists());
    }
}
