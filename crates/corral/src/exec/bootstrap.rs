#![allow(unsafe_code)]
//! Launcher side of the init handshake.
//!
//! The launcher clones a child into the new namespaces and has it re-exec
//! the runtime binary as `corral init`. The two sides share a socket pair:
//!
//! 1. the launcher writes the [`InitConfig`] and shuts down its write half
//! 2. the init stage prepares the container and execs the program
//! 3. exec closes the close-on-exec socket, which the launcher reads as EOF
//!
//! A payload instead of EOF is an [`InitMessage`] describing the failure.
//! A second close-on-exec pipe reports a failed re-exec of the runtime
//! binary itself, before any init code ran.

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;

use corral_common::{CorralError, CorralResult};
use rustix::net::{AddressFamily, SendFlags, SocketFlags, SocketType};

use super::Process;
use super::init::{INIT_PIPE_ENV, InitConfig, InitMessage};
use super::process::{send_signal, wait_pid};
use crate::cgroup::CgroupManager;
use crate::runtime::{ContainerConfig, RuntimeConfig};

/// Start `process` inside the container described by `config`.
///
/// On success the process has exec'd the user program and its pid is
/// recorded on `process`. The process's stdio and extra descriptors are
/// consumed. On failure no child is left behind.
pub fn bootstrap(
    runtime: &RuntimeConfig,
    config: &ContainerConfig,
    cgroup: &CgroupManager,
    process: &mut Process,
) -> CorralResult<()> {
    let extra_files = std::mem::take(&mut process.extra_files);
    let init_config = InitConfig {
        container: config.clone(),
        args: process.args.clone(),
        env: process.env.clone(),
        cwd: process.cwd.clone(),
        user: process.user.clone(),
        terminal: process.terminal,
        console: process.console.clone(),
        preserved_fds: extra_files.len(),
    };
    let payload = serde_json::to_vec(&init_config)?;

    let (parent_sock, child_sock) = rustix::net::socketpair(
        AddressFamily::UNIX,
        SocketType::STREAM,
        SocketFlags::CLOEXEC,
        None,
    )
    .map_err(|e| CorralError::io_context("init socketpair", e.into()))?;
    let (err_read, err_write) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)
        .map_err(|e| CorralError::io_context("launch error pipe", e.into()))?;

    let stdio = [
        process.stdin.take(),
        process.stdout.take(),
        process.stderr.take(),
    ];
    let plan = FdPlan::new(&stdio, &extra_files, &child_sock)?;

    let init_fd = plan.init_fd;
    let launch = Launch::new(runtime, init_fd)?;

    let manager = config.namespace_manager();
    // CLONE_NEWCGROUP is left to the init stage so its cgroup namespace is
    // rooted at the container cgroup the launcher places it in.
    let flags = config.namespaces.clone_flags() & !libc::CLONE_NEWCGROUP;

    let pid = {
        let _pidns = manager.enter_pid_namespace()?;
        // SAFETY: without CLONE_VM the child runs on a copy of this address
        // space, and spawn_child only makes async-signal-safe calls on data
        // prepared above before exec or _exit.
        let pid = unsafe {
            libc::syscall(
                libc::SYS_clone,
                libc::c_long::from(flags | libc::SIGCHLD),
                0usize,
                0usize,
                0usize,
                0usize,
            )
        };
        if pid == 0 {
            // SAFETY: this is the freshly cloned child.
            unsafe { spawn_child(&plan, &launch, err_write.as_raw_fd()) }
        }
        if pid < 0 {
            return Err(CorralError::io_context(
                "clone init process",
                std::io::Error::last_os_error(),
            ));
        }
        i32::try_from(pid).map_err(|_| CorralError::Internal {
            message: format!("clone returned out-of-range pid {pid}"),
        })?
    };

    drop(plan);
    drop(child_sock);
    drop(err_write);
    drop(stdio);
    drop(extra_files);

    tracing::debug!(pid, "Cloned init process");

    check_launched(pid, err_read)?;

    if let Err(e) = prepare_child(config, cgroup, pid) {
        kill_and_reap(pid);
        return Err(e);
    }

    let mut stream = UnixStream::from(parent_sock);
    if let Err(e) = send_config(&stream, &payload) {
        kill_and_reap(pid);
        return Err(e);
    }

    let mut report = Vec::new();
    if let Err(e) = stream.read_to_end(&mut report) {
        kill_and_reap(pid);
        return Err(CorralError::io_context("read init report", e));
    }

    if !report.is_empty() {
        let message = InitMessage::decode(&report);
        tracing::debug!(pid, report = ?message, "Init stage reported failure");
        reap(pid);
        return Err(message.into_error());
    }

    process.set_pid(pid);
    tracing::info!(pid, "Container process started");
    Ok(())
}

/// Read the launch error pipe: EOF means the init binary was exec'd.
fn check_launched(pid: i32, err_read: OwnedFd) -> CorralResult<()> {
    let mut buf = Vec::with_capacity(4);
    File::from(err_read)
        .read_to_end(&mut buf)
        .map_err(|e| CorralError::io_context("read launch error pipe", e))?;

    if let Ok(bytes) = <[u8; 4]>::try_from(buf.as_slice()) {
        reap(pid);
        let errno = i32::from_ne_bytes(bytes);
        return Err(CorralError::io_context(
            "exec init binary",
            std::io::Error::from_raw_os_error(errno),
        ));
    }
    Ok(())
}

/// Work the launcher does for the child before it may continue.
fn prepare_child(config: &ContainerConfig, cgroup: &CgroupManager, pid: i32) -> CorralResult<()> {
    let manager = config.namespace_manager();
    if manager.needs_id_maps() {
        manager.write_uid_map(pid)?;
        manager.write_gid_map(pid)?;
    }
    cgroup.add_process(pid)?;
    cgroup.apply_resources(&config.cgroup.resources)?;
    Ok(())
}

/// Write the whole payload, then close the write half so the init stage
/// sees EOF. `MSG_NOSIGNAL` keeps a dead peer from raising `SIGPIPE`.
fn send_config(stream: &UnixStream, payload: &[u8]) -> CorralResult<()> {
    let mut sent = 0;
    while sent < payload.len() {
        match rustix::net::send(stream, &payload[sent..], SendFlags::NOSIGNAL) {
            Ok(n) => sent += n,
            Err(rustix::io::Errno::INTR) => {}
            Err(e) => return Err(CorralError::io_context("send init config", e.into())),
        }
    }
    stream
        .shutdown(std::net::Shutdown::Write)
        .map_err(|e| CorralError::io_context("shutdown init socket", e))
}

fn kill_and_reap(pid: i32) {
    if let Err(e) = send_signal(pid, libc::SIGKILL) {
        tracing::warn!(pid, error = %e, "Failed to kill init process");
    }
    reap(pid);
}

fn reap(pid: i32) {
    if let Err(e) = wait_pid(pid) {
        tracing::warn!(pid, error = %e, "Failed to reap init process");
    }
}

/// Descriptor layout of the child: stdio at 0..=2, extra files from 3, then
/// the init socket.
///
/// Sources are first duplicated above every target so no `dup2` can
/// clobber a source that is still needed.
struct FdPlan {
    /// High duplicates, kept open until the child is cloned.
    sources: Vec<(OwnedFd, RawFd)>,
    init_fd: RawFd,
}

impl FdPlan {
    fn new(
        stdio: &[Option<OwnedFd>; 3],
        extra_files: &[OwnedFd],
        init_sock: &OwnedFd,
    ) -> CorralResult<Self> {
        let init_fd = RawFd::try_from(3 + extra_files.len()).map_err(|_| {
            CorralError::InvalidArgument {
                message: format!("too many extra files: {}", extra_files.len()),
            }
        })?;
        let floor = init_fd + 1;

        let mut wanted: Vec<(&OwnedFd, RawFd)> = Vec::new();
        for (target, fd) in (0..).zip(stdio) {
            if let Some(fd) = fd {
                wanted.push((fd, target));
            }
        }
        for (target, fd) in (3..).zip(extra_files) {
            wanted.push((fd, target));
        }
        wanted.push((init_sock, init_fd));

        let sources = wanted
            .into_iter()
            .map(|(fd, target)| {
                rustix::io::fcntl_dupfd_cloexec(fd.as_fd(), floor)
                    .map(|high| (high, target))
                    .map_err(|e| CorralError::io_context("duplicate child descriptor", e.into()))
            })
            .collect::<CorralResult<_>>()?;

        Ok(Self { sources, init_fd })
    }
}

/// Everything `execve` needs, allocated before the clone.
struct Launch {
    path: CString,
    _args: Vec<CString>,
    _env: Vec<CString>,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    empty_mask: libc::sigset_t,
}

impl Launch {
    fn new(runtime: &RuntimeConfig, init_fd: RawFd) -> CorralResult<Self> {
        let cstring = |bytes: &[u8]| {
            CString::new(bytes).map_err(|_| CorralError::InvalidArgument {
                message: "init arguments must not contain NUL".to_string(),
            })
        };

        let path = cstring(runtime.init_path.as_os_str().as_bytes())?;
        let mut args = vec![path.clone()];
        for arg in &runtime.init_args {
            args.push(cstring(arg.as_bytes())?);
        }
        let env = vec![cstring(format!("{INIT_PIPE_ENV}={init_fd}").as_bytes())?];

        let argv = args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let mut empty_mask = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset initialises the set.
        let empty_mask = unsafe {
            libc::sigemptyset(empty_mask.as_mut_ptr());
            empty_mask.assume_init()
        };

        Ok(Self {
            path,
            _args: args,
            _env: env,
            argv,
            envp,
            empty_mask,
        })
    }
}

/// Child half of the clone: lay out descriptors and exec the init stage.
///
/// Reports the errno of a failed step on `err_fd` and exits 127.
///
/// # Safety
///
/// Must only be called in the child of a fork-like clone.
unsafe fn spawn_child(plan: &FdPlan, launch: &Launch, err_fd: RawFd) -> ! {
    // SAFETY: only async-signal-safe calls on pre-built data follow.
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &raw const launch.empty_mask, std::ptr::null_mut());

        for (source, target) in &plan.sources {
            if libc::dup2(source.as_raw_fd(), *target) < 0 {
                child_fail(err_fd);
            }
        }

        libc::execve(launch.path.as_ptr(), launch.argv.as_ptr(), launch.envp.as_ptr());
        child_fail(err_fd)
    }
}

/// # Safety
///
/// Child-only; see [`spawn_child`].
unsafe fn child_fail(err_fd: RawFd) -> ! {
    // SAFETY: errno location and write/_exit are async-signal-safe.
    unsafe {
        let errno = *libc::__errno_location();
        let bytes = errno.to_ne_bytes();
        libc::write(err_fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(127)
    }
}
