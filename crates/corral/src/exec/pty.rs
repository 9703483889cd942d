//! PTY (pseudo-terminal) handling.

use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

use corral_common::{CorralError, CorralResult};
use rustix::fs::{Mode, OFlags};
use rustix::pty::{OpenptFlags, grantpt, openpt, ptsname, unlockpt};
use rustix::termios::{OptionalActions, Termios, tcgetattr, tcgetwinsize, tcsetattr, tcsetwinsize};

/// PTY file descriptor pair.
#[derive(Debug)]
pub struct PtyPair {
    /// Master side, kept by the launcher.
    pub master: OwnedFd,
    /// Slave side, handed to the container process.
    pub slave: OwnedFd,
    /// Path of the slave device.
    pub slave_path: PathBuf,
}

/// Allocate a PTY.
pub fn allocate_pty() -> CorralResult<PtyPair> {
    let master = openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY | OpenptFlags::CLOEXEC)
        .map_err(|e| CorralError::io_context("open pty master", e.into()))?;
    grantpt(&master).map_err(|e| CorralError::io_context("grantpt", e.into()))?;
    unlockpt(&master).map_err(|e| CorralError::io_context("unlockpt", e.into()))?;

    let name = ptsname(&master, Vec::new())
        .map_err(|e| CorralError::io_context("ptsname", e.into()))?;
    let slave_path = PathBuf::from(name.to_string_lossy().into_owned());

    let slave = rustix::fs::open(
        &slave_path,
        OFlags::RDWR | OFlags::NOCTTY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| CorralError::io_context("open pty slave", e.into()))?;

    tracing::debug!(slave = %slave_path.display(), "Allocated PTY");

    Ok(PtyPair {
        master,
        slave,
        slave_path,
    })
}

/// Copy the window size of `from` onto `to`. Silently skips non-terminals.
pub fn copy_winsize(from: impl AsFd, to: impl AsFd) {
    if let Ok(size) = tcgetwinsize(from) {
        if let Err(e) = tcsetwinsize(to, size) {
            tracing::debug!(error = %e, "Failed to set window size");
        }
    }
}

/// A terminal switched to raw mode, restored on [`RawMode::restore`] or drop.
#[derive(Debug)]
pub struct RawMode {
    fd: OwnedFd,
    saved: Option<Termios>,
}

impl RawMode {
    /// Put the terminal behind `fd` into raw mode, if it is a terminal.
    pub fn enable(fd: impl AsFd) -> CorralResult<Option<Self>> {
        if !rustix::termios::isatty(&fd) {
            return Ok(None);
        }

        let saved = tcgetattr(&fd).map_err(|e| CorralError::io_context("tcgetattr", e.into()))?;
        let mut raw = saved.clone();
        raw.make_raw();
        tcsetattr(&fd, OptionalActions::Now, &raw)
            .map_err(|e| CorralError::io_context("tcsetattr", e.into()))?;

        let fd = fd
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| CorralError::io_context("dup terminal", e))?;

        Ok(Some(Self {
            fd,
            saved: Some(saved),
        }))
    }

    /// Restore the saved terminal attributes.
    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = tcsetattr(&self.fd, OptionalActions::Now, &saved) {
                tracing::warn!(error = %e, "Failed to restore terminal");
            }
        }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        self.restore();
    }
}
