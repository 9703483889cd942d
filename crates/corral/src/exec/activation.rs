#![allow(unsafe_code)]
//! Socket activation pass-through.
//!
//! A supervisor that pre-opened listening sockets for the launcher sets
//! `LISTEN_PID` to the launcher's pid and `LISTEN_FDS` to the count; the
//! sockets start at descriptor 3.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use corral_common::{CorralError, CorralResult};
use rustix::io::FdFlags;

use super::Process;

/// First descriptor passed by the activation protocol.
pub const LISTEN_FDS_START: RawFd = 3;

/// Take ownership of the descriptors inherited through socket activation.
///
/// Returns an empty list when the variables are absent or addressed to
/// another process. Taken descriptors are marked close-on-exec so they only
/// reach the container through [`apply`].
pub fn listen_fds() -> CorralResult<Vec<OwnedFd>> {
    let count = match parse_env(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    ) {
        Ok(count) => count,
        Err(reason) => {
            tracing::trace!(reason, "No socket activation");
            return Ok(Vec::new());
        }
    };

    let mut fds = Vec::with_capacity(count);
    for offset in 0..count {
        let raw = LISTEN_FDS_START
            + RawFd::try_from(offset).map_err(|_| CorralError::InvalidArgument {
                message: format!("LISTEN_FDS out of range: {count}"),
            })?;

        // SAFETY: fcntl(F_GETFD) only inspects the descriptor table.
        if unsafe { libc::fcntl(raw, libc::F_GETFD) } < 0 {
            return Err(CorralError::io_context(
                &format!("inherited listen fd {raw}"),
                std::io::Error::last_os_error(),
            ));
        }
        // SAFETY: the activation protocol transfers ownership of fds
        // 3..3+LISTEN_FDS to this process, and each is taken once.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        rustix::io::fcntl_setfd(&fd, FdFlags::CLOEXEC)
            .map_err(|e| CorralError::io_context("set close-on-exec", e.into()))?;
        fds.push(fd);
    }

    tracing::debug!(count, "Inherited socket activation descriptors");
    Ok(fds)
}

/// Forward `fds` to the container process.
///
/// The process sees them at 3, 4, ... ahead of any other extra files, with
/// `LISTEN_FDS` set to the count and `LISTEN_PID` to its own pid, which is
/// 1 inside a new PID namespace.
pub fn apply(process: &mut Process, fds: Vec<OwnedFd>) {
    if fds.is_empty() {
        return;
    }
    process.push_env("LISTEN_FDS", fds.len());
    process.push_env("LISTEN_PID", 1);

    let mut files = fds;
    files.append(&mut process.extra_files);
    process.extra_files = files;
}

/// Validate the activation variables against `own_pid`.
fn parse_env(
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    own_pid: u32,
) -> Result<usize, &'static str> {
    let pid: u32 = listen_pid
        .ok_or("LISTEN_PID unset")?
        .parse()
        .map_err(|_| "LISTEN_PID invalid")?;
    if pid != own_pid {
        return Err("LISTEN_PID names another process");
    }
    let count: usize = listen_fds
        .ok_or("LISTEN_FDS unset")?
        .parse()
        .map_err(|_| "LISTEN_FDS invalid")?;
    if count == 0 {
        return Err("LISTEN_FDS is zero");
    }
    Ok(count)
}
