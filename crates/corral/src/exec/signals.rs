#![allow(unsafe_code)]
//! Signal forwarding and exit collection for an attached container.
//!
//! Every asynchronous signal is blocked in the launcher and consumed
//! synchronously with `sigwaitinfo`, so a signal that races with the
//! process's exit is either forwarded before `SIGCHLD` is seen or dropped
//! after it. Nothing is forwarded to an exited process.

use std::mem::MaybeUninit;

use corral_common::{CorralError, CorralResult};

use super::Process;
use super::process::{exit_code_from_raw, send_signal};
use super::stdio::Tty;

/// Faults raised by the launcher's own code; these stay deliverable.
const SYNCHRONOUS: &[libc::c_int] = &[
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
    libc::SIGSYS,
];

/// Blocks asynchronous signals for its lifetime and forwards them.
///
/// Install before any thread is spawned and before the process starts, so
/// the mask is inherited by every launcher thread and no `SIGCHLD` is lost.
pub struct SignalForwarder {
    blocked: libc::sigset_t,
    previous: libc::sigset_t,
}

impl std::fmt::Debug for SignalForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalForwarder").finish_non_exhaustive()
    }
}

impl SignalForwarder {
    /// Block signals and make the launcher a child subreaper.
    pub fn install() -> CorralResult<Self> {
        let blocked = forwarded_set();
        let mut previous = MaybeUninit::<libc::sigset_t>::uninit();

        // SAFETY: blocked is initialised, previous is a valid out-pointer.
        let rc = unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, &raw const blocked, previous.as_mut_ptr())
        };
        if rc != 0 {
            return Err(CorralError::io_context(
                "block signals",
                std::io::Error::from_raw_os_error(rc),
            ));
        }
        // SAFETY: pthread_sigmask succeeded and filled previous.
        let previous = unsafe { previous.assume_init() };

        // SAFETY: prctl with integer arguments only.
        if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "Failed to become child subreaper"
            );
        }

        tracing::debug!("Signal forwarder installed");
        Ok(Self { blocked, previous })
    }

    /// Forward signals to `process` until it exits and return its status.
    ///
    /// `SIGWINCH` resizes the pty instead of being forwarded. The TTY is
    /// closed before returning so buffered output is flushed first.
    pub fn forward(&self, process: &mut Process, mut tty: Option<&mut Tty>) -> CorralResult<i32> {
        let pid = process.pid().ok_or_else(|| CorralError::Internal {
            message: "cannot forward signals to a process that never started".to_string(),
        })?;

        loop {
            let signal = self.wait()?;
            match signal {
                libc::SIGWINCH => {
                    if let Some(tty) = tty.as_deref() {
                        tty.resize();
                    }
                }
                libc::SIGCHLD => {
                    if let Some(code) = reap(pid)? {
                        process.mark_exited(code);
                        tracing::debug!(pid, exit_code = code, "Container process exited");
                        if let Some(tty) = tty.as_deref_mut() {
                            tty.close();
                        }
                        return Ok(code);
                    }
                }
                _ => {
                    tracing::debug!(pid, signal, "Forwarding signal");
                    send_signal(pid, signal)?;
                }
            }
        }
    }

    /// Block until one of the blocked signals is pending.
    fn wait(&self) -> CorralResult<libc::c_int> {
        loop {
            // SAFETY: blocked is initialised; a null siginfo is allowed.
            let signal = unsafe { libc::sigwaitinfo(&raw const self.blocked, std::ptr::null_mut()) };
            if signal >= 0 {
                return Ok(signal);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(CorralError::io_context("sigwaitinfo", err));
            }
        }
    }
}

impl Drop for SignalForwarder {
    /// Discard signals still pending, then restore the previous mask.
    ///
    /// Without the drain a `SIGTERM` that arrived after the process exited
    /// would kill the launcher before cleanup runs.
    fn drop(&mut self) {
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        loop {
            // SAFETY: all pointers reference initialised locals or fields.
            let signal = unsafe {
                libc::sigtimedwait(&raw const self.blocked, std::ptr::null_mut(), &raw const zero)
            };
            if signal < 0 {
                break;
            }
            tracing::debug!(signal, "Discarded pending signal");
        }

        // SAFETY: previous was filled by pthread_sigmask in install.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &raw const self.previous, std::ptr::null_mut());
        }
    }
}

/// Every signal except the synchronous faults. `SIGKILL` and `SIGSTOP`
/// cannot be blocked and are ignored by the kernel here.
fn forwarded_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigfillset initialises the set; sigdelset only edits it.
    unsafe {
        libc::sigfillset(set.as_mut_ptr());
        for signal in SYNCHRONOUS {
            libc::sigdelset(set.as_mut_ptr(), *signal);
        }
        set.assume_init()
    }
}

/// Reap every exited child. Returns the main process's status if it was
/// among them; other children are orphans inherited as subreaper.
fn reap(main_pid: i32) -> CorralResult<Option<i32>> {
    let mut main_exit = None;
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer.
        let pid = unsafe { libc::waitpid(-1, &raw mut status, libc::WNOHANG) };
        match pid {
            0 => break,
            -1 => {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => {}
                    Some(libc::ECHILD) => break,
                    _ => return Err(CorralError::io_context("waitpid", err)),
                }
            }
            pid if pid == main_pid => main_exit = Some(exit_code_from_raw(status)),
            pid => tracing::trace!(pid, "Reaped orphan"),
        }
    }
    Ok(main_exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronous_signals_stay_deliverable() {
        let set = forwarded_set();
        for signal in SYNCHRONOUS {
            // SAFETY: set is initialised.
            assert_eq!(unsafe { libc::sigismember(&raw const set, *signal) }, 0);
        }
        for signal in [libc::SIGTERM, libc::SIGINT, libc::SIGCHLD, libc::SIGWINCH] {
            // SAFETY: set is initialised.
            assert_eq!(unsafe { libc::sigismember(&raw const set, signal) }, 1);
        }
    }

    #[test]
    fn forward_requires_started_process() {
        let forwarder = SignalForwarder::install().unwrap();
        let mut process = Process::default();
        assert!(forwarder.forward(&mut process, None).is_err());
    }
}
