#![allow(unsafe_code)]
//! Standard I/O wiring for the container process.
//!
//! Three modes, picked from the terminal flag, an explicit console path and
//! the detach flag:
//! - console: a pty whose master is copied to and from the launcher's stdio
//! - inherited: three pipes serviced by copy threads
//! - detached: the launcher's own stdio is handed over, nothing is copied

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use corral_common::{CorralError, CorralResult};

use super::Process;
use super::pty::{RawMode, allocate_pty, copy_winsize};

/// How long output copiers may keep draining once the process has exited.
///
/// Descendants that outlive the process keep the pipes or the pty slave
/// open, so EOF may never arrive; copiers still running after this are
/// abandoned.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Wire the process's standard streams.
///
/// Returns the handle owning the launcher side, if anything needs to be
/// serviced; dropping it restores the terminal and drains the output copiers.
/// Descriptors handed to the process are owned by `root_uid`.
pub fn setup_io(
    process: &mut Process,
    root_uid: u32,
    console: Option<&Path>,
    detach: bool,
) -> CorralResult<Option<Tty>> {
    if process.terminal {
        if let Some(path) = console {
            process.console = Some(path.to_path_buf());
            return Ok(None);
        }
        if detach {
            return Err(CorralError::InvalidArgument {
                message: "cannot allocate a tty when detaching without a console".to_string(),
            });
        }
        return Tty::console(process, root_uid).map(Some);
    }

    if detach {
        inherit_stdio(process, root_uid)?;
        return Ok(None);
    }

    Tty::pipes(process, root_uid).map(Some)
}

/// Duplicate the launcher's stdio into the process.
fn inherit_stdio(process: &mut Process, root_uid: u32) -> CorralResult<()> {
    let dup = |fd: std::os::fd::BorrowedFd<'_>| -> CorralResult<OwnedFd> {
        let owned = fd
            .try_clone_to_owned()
            .map_err(|e| CorralError::io_context("dup stdio", e))?;
        chown_fd(&owned, root_uid)?;
        Ok(owned)
    };

    process.stdin = Some(dup(std::io::stdin().as_fd())?);
    process.stdout = Some(dup(std::io::stdout().as_fd())?);
    process.stderr = Some(dup(std::io::stderr().as_fd())?);
    Ok(())
}

/// Hand `fd` to `uid`. Terminals and pipes the launcher does not own
/// (`EPERM`/`EINVAL`) are left as they are.
fn chown_fd(fd: &impl AsFd, uid: u32) -> CorralResult<()> {
    if uid == 0 {
        return Ok(());
    }
    // SAFETY: the descriptor is valid for the duration of the call; gid -1
    // leaves the group unchanged.
    let rc = unsafe { libc::fchown(fd.as_fd().as_raw_fd(), uid, libc::gid_t::MAX) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if !matches!(err.raw_os_error(), Some(libc::EPERM | libc::EINVAL)) {
            return Err(CorralError::io_context("fchown stdio", err));
        }
    }
    Ok(())
}

/// Launcher side of the process's stdio.
#[derive(Debug)]
pub struct Tty {
    master: Option<Arc<File>>,
    raw: Option<RawMode>,
    /// Output copiers, drained on close.
    outputs: Vec<JoinHandle<()>>,
}

impl Tty {
    /// Allocate a pty, hand the slave to the process and copy the master.
    fn console(process: &mut Process, root_uid: u32) -> CorralResult<Self> {
        let pair = allocate_pty()?;
        chown_fd(&pair.slave, root_uid)?;

        let slave = pair.slave;
        process.stdin = Some(
            slave
                .try_clone()
                .map_err(|e| CorralError::io_context("dup pty slave", e))?,
        );
        process.stdout = Some(
            slave
                .try_clone()
                .map_err(|e| CorralError::io_context("dup pty slave", e))?,
        );
        process.stderr = Some(slave);

        let master = Arc::new(File::from(pair.master));
        copy_winsize(std::io::stdin(), master.as_ref());
        let raw = RawMode::enable(std::io::stdin())?;

        let input = Arc::clone(&master);
        spawn_copier("stdin", std::io::stdin(), move |buf| {
            (&*input).write_all(buf)
        });

        let output = Arc::clone(&master);
        let stdout = spawn_copier("stdout", ArcReader(output), |buf| {
            let mut out = std::io::stdout().lock();
            out.write_all(buf)?;
            out.flush()
        });

        tracing::debug!("Console IO established");

        Ok(Self {
            master: Some(master),
            raw,
            outputs: vec![stdout],
        })
    }

    /// Create three pipes and copy them to and from the launcher's stdio.
    fn pipes(process: &mut Process, root_uid: u32) -> CorralResult<Self> {
        let (stdin_r, stdin_w) = pipe()?;
        let (stdout_r, stdout_w) = pipe()?;
        let (stderr_r, stderr_w) = pipe()?;

        for fd in [&stdin_r, &stdout_w, &stderr_w] {
            chown_fd(fd, root_uid)?;
        }

        process.stdin = Some(stdin_r);
        process.stdout = Some(stdout_w);
        process.stderr = Some(stderr_w);

        let mut stdin_w = File::from(stdin_w);
        spawn_copier("stdin", std::io::stdin(), move |buf| stdin_w.write_all(buf));

        let stdout = spawn_copier("stdout", File::from(stdout_r), |buf| {
            let mut out = std::io::stdout().lock();
            out.write_all(buf)?;
            out.flush()
        });
        let stderr = spawn_copier("stderr", File::from(stderr_r), |buf| {
            std::io::stderr().lock().write_all(buf)
        });

        Ok(Self {
            master: None,
            raw: None,
            outputs: vec![stdout, stderr],
        })
    }

    /// Propagate the launcher's window size to the pty.
    pub fn resize(&self) {
        if let Some(master) = &self.master {
            copy_winsize(std::io::stdin(), master.as_ref());
        }
    }

    /// Restore the terminal and give the output copiers [`DRAIN_TIMEOUT`]
    /// to reach EOF.
    ///
    /// Copiers that are still blocked afterwards, and the stdin copier, are
    /// detached; they hold no state that needs releasing.
    pub fn close(&mut self) {
        self.close_within(DRAIN_TIMEOUT);
    }

    fn close_within(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.outputs.iter().any(|handle| !handle.is_finished()) && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }

        for handle in self.outputs.drain(..) {
            if !handle.is_finished() {
                tracing::debug!("Output still held open by a descendant, not waiting for EOF");
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("Output copier panicked");
            }
        }
        self.master = None;
        if let Some(mut raw) = self.raw.take() {
            raw.restore();
        }
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads through a shared file.
struct ArcReader(Arc<File>);

impl Read for ArcReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&*self.0).read(buf)
    }
}

fn pipe() -> CorralResult<(OwnedFd, OwnedFd)> {
    rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)
        .map_err(|e| CorralError::io_context("pipe", e.into()))
}

/// Copy `reader` into `write` in 4 KiB chunks until EOF or an error.
///
/// A pty master reports `EIO` once every slave descriptor is closed, which
/// ends the copy like EOF.
fn spawn_copier<R, W>(name: &'static str, mut reader: R, mut write: W) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    W: FnMut(&[u8]) -> std::io::Result<()> + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if write(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        tracing::trace!(stream = name, "Copier finished");
    })
}
