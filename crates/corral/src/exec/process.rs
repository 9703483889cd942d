#![allow(unsafe_code)]
//! The process run inside a container.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use corral_common::{CorralError, CorralResult};
use corral_oci::runtime::User;

/// Description of the program to run, plus its runtime handle once started.
///
/// Environment and descriptors may be amended until the process is handed
/// to [`crate::runtime::Container::start`]; after that they are frozen.
#[derive(Debug, Default)]
pub struct Process {
    /// Program and arguments.
    pub args: Vec<String>,
    /// Environment as `KEY=value` entries, in order.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    /// Identity the program runs as.
    pub user: User,
    /// The process gets a controlling terminal on its stdio.
    pub terminal: bool,
    /// Terminal device the init stage opens as stdio and controlling tty.
    pub console: Option<PathBuf>,
    /// Descriptors placed at 3, 4, ... in the process.
    pub extra_files: Vec<OwnedFd>,
    /// Descriptor for fd 0; the launcher's own stdin when unset.
    pub stdin: Option<OwnedFd>,
    /// Descriptor for fd 1; the launcher's own stdout when unset.
    pub stdout: Option<OwnedFd>,
    /// Descriptor for fd 2; the launcher's own stderr when unset.
    pub stderr: Option<OwnedFd>,
    pid: Option<i32>,
    exit_code: Option<i32>,
}

impl Process {
    /// Build a process from the bundle's process section.
    #[must_use]
    pub fn from_spec(spec: &corral_oci::runtime::Process) -> Self {
        Self {
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            user: spec.user.clone(),
            terminal: spec.terminal,
            ..Self::default()
        }
    }

    /// Append an environment entry.
    pub fn push_env(&mut self, key: &str, value: impl std::fmt::Display) {
        self.env.push(format!("{key}={value}"));
    }

    /// Host pid once started.
    #[must_use]
    pub const fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Exit status once reaped, already translated by [`exit_code_from_raw`].
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub(crate) const fn set_pid(&mut self, pid: i32) {
        self.pid = Some(pid);
    }

    pub(crate) const fn mark_exited(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    /// Send a signal. A no-op once the process has exited.
    pub fn signal(&self, signal: i32) -> CorralResult<()> {
        let Some(pid) = self.pid else {
            return Err(CorralError::Internal {
                message: "process has not been started".to_string(),
            });
        };
        if self.exit_code.is_some() {
            return Ok(());
        }
        send_signal(pid, signal)
    }

    /// Block until the process exits and return its translated status.
    pub fn wait(&mut self) -> CorralResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let pid = self.pid.ok_or_else(|| CorralError::Internal {
            message: "process has not been started".to_string(),
        })?;

        let status = wait_pid(pid)?;
        let code = exit_code_from_raw(status);
        self.exit_code = Some(code);

        tracing::debug!(pid, exit_code = code, "Process exited");
        Ok(code)
    }
}

/// Send `signal` to `pid`, treating an already-gone process as success.
pub(crate) fn send_signal(pid: i32, signal: i32) -> CorralResult<()> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(CorralError::io_context(&format!("kill {pid}"), err))
}

/// Returns true while `pid` exists (zombies included).
pub(crate) fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence.
    let exists = unsafe { libc::kill(pid, 0) } == 0;
    exists || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// `waitpid` with `EINTR` retry; returns the raw wait status.
pub(crate) fn wait_pid(pid: i32) -> CorralResult<libc::c_int> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer for the duration of the call.
        let ret = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if ret == pid {
            return Ok(status);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(CorralError::io_context(&format!("waitpid {pid}"), err));
        }
    }
}

/// Translate a raw wait status: the exit code, or 128 + signal number.
#[must_use]
pub fn exit_code_from_raw(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}
