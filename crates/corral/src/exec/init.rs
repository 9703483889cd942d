#![allow(unsafe_code)]
//! The init stage: the runtime binary re-executed inside the new namespaces.
//!
//! The launcher clones a child that execs `corral init` with the parent end
//! of the init socket in `_CORRAL_INITPIPE`. The stage reads its
//! [`InitConfig`] from the socket, prepares the container and replaces
//! itself with the user program. The socket is close-on-exec, so a clean
//! exec is reported to the launcher as EOF; any failure is written back as
//! an [`InitMessage`] before the stage exits.

use std::convert::Infallible;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use corral_common::{CorralError, CorralResult};
use corral_oci::runtime::{NamespaceType, User};
use rustix::io::FdFlags;
use serde::{Deserialize, Serialize};

use crate::filesystem::{finalize_rootfs, setup_rootfs};
use crate::runtime::ContainerConfig;
use crate::security::{
    CapabilitySet, apply_rlimits, set_keep_caps, set_no_new_privs, switch_user,
};

/// Argument that dispatches the binary into the init stage.
pub const INIT_ARG: &str = "init";

/// Environment variable carrying the init socket's descriptor number.
pub const INIT_PIPE_ENV: &str = "_CORRAL_INITPIPE";

/// Everything the init stage needs, sent over the init socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Container configuration.
    pub container: ContainerConfig,
    /// Program and arguments.
    pub args: Vec<String>,
    /// Environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    /// Identity the program runs as.
    pub user: User,
    /// Make stdin the controlling terminal.
    pub terminal: bool,
    /// Terminal device to open as stdio and controlling terminal.
    pub console: Option<PathBuf>,
    /// Number of descriptors from 3 upward that survive exec.
    pub preserved_fds: usize,
}

/// Report from the init stage. Absent when the program was exec'd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitMessage {
    /// Initialisation failed before exec.
    Bootstrap {
        /// Cause of the failure.
        cause: String,
    },
    /// The stage neither exec'd nor failed cleanly.
    ProtocolViolation {
        /// What happened.
        message: String,
    },
}

impl InitMessage {
    /// Encode for the init socket.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a non-empty payload from the init socket.
    ///
    /// An undecodable payload is itself a protocol violation.
    #[must_use]
    pub fn decode(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_else(|e| Self::ProtocolViolation {
            message: format!("undecodable init report ({e}): {}", String::from_utf8_lossy(payload)),
        })
    }

    /// The launcher-side error for this report.
    #[must_use]
    pub fn into_error(self) -> CorralError {
        match self {
            Self::Bootstrap { cause } => CorralError::Bootstrap { cause },
            Self::ProtocolViolation { message } => CorralError::ProtocolViolation { message },
        }
    }
}

/// The work done between reading the config and exec.
///
/// Only returns on failure; success replaces the process image.
pub trait InitRoutine {
    /// Prepare the container and exec the program.
    fn run(&self, config: &InitConfig) -> CorralResult<Infallible>;
}

/// The routine used by `corral init`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardInit;

impl InitRoutine for StandardInit {
    fn run(&self, config: &InitConfig) -> CorralResult<Infallible> {
        let container = &config.container;
        let namespaces = &container.namespaces;

        // setns into a user or mount namespace fails for threaded callers.
        // Rust threads map 1:1 to kernel tasks, so one task means nothing
        // can migrate this code to another thread between the steps below.
        ensure_single_threaded()?;
        mark_cloexec_from(3 + config.preserved_fds)?;

        if let Some(console) = &config.console {
            attach_console(console)?;
        } else if config.terminal {
            set_controlling_terminal()?;
        }

        container.namespace_manager().join()?;
        if namespaces.creates(NamespaceType::Cgroup) {
            unshare_cgroup()?;
        }

        setup_rootfs(
            &container.rootfs,
            &container.mounts,
            namespaces.creates(NamespaceType::Mount),
            namespaces.creates(NamespaceType::Pid),
        )?;
        finalize_rootfs(container.readonly)?;

        if let Some(hostname) = &container.hostname {
            set_hostname(hostname)?;
        }

        apply_rlimits(&container.rlimits)?;

        let caps = container
            .capabilities
            .as_ref()
            .map(CapabilitySet::from_spec)
            .transpose()?;
        if let Some(caps) = &caps {
            caps.drop_bounding()?;
        }

        set_keep_caps(true)?;
        switch_user(
            config.user.uid,
            config.user.gid,
            &config.user.additional_gids,
        )?;
        set_keep_caps(false)?;

        if let Some(caps) = &caps {
            caps.apply()?;
        }
        if container.no_new_privileges {
            set_no_new_privs()?;
        }

        std::env::set_current_dir(&config.cwd)
            .map_err(|e| CorralError::io_context(&format!("chdir {}", config.cwd.display()), e))?;

        let Some((program, args)) = config.args.split_first() else {
            return Err(CorralError::InvalidArgument {
                message: "process args must not be empty".to_string(),
            });
        };

        let err = std::process::Command::new(program)
            .args(args)
            .env_clear()
            .envs(parse_env(&config.env))
            .exec();
        Err(CorralError::Bootstrap {
            cause: format!("exec {program}: {err}"),
        })
    }
}

/// Entry point of `corral init`. Never returns.
///
/// No tracing subscriber is installed: stdio already belongs to the
/// container, so failures travel over the init socket only.
pub fn run_init_stage() -> ! {
    let Some(fd) = std::env::var(INIT_PIPE_ENV)
        .ok()
        .and_then(|v| v.parse::<RawFd>().ok())
    else {
        eprintln!("corral init: {INIT_PIPE_ENV} is not set; this command is internal");
        std::process::exit(1);
    };

    // SAFETY: the launcher placed the init socket at this descriptor and
    // nothing else in this process owns it.
    let mut socket = unsafe { UnixStream::from_raw_fd(fd) };
    if rustix::io::fcntl_setfd(&socket, FdFlags::CLOEXEC).is_err() {
        std::process::exit(1);
    }
    install_panic_report(&socket);

    let result = read_config(&mut socket).and_then(|config| StandardInit.run(&config));
    match result {
        Ok(never) => match never {},
        Err(e) => {
            let report = InitMessage::Bootstrap {
                cause: e.to_string(),
            };
            let _ = socket.write_all(&report.encode());
            std::process::exit(1);
        }
    }
}

fn read_config(socket: &mut UnixStream) -> CorralResult<InitConfig> {
    let mut payload = Vec::new();
    socket
        .read_to_end(&mut payload)
        .map_err(|e| CorralError::io_context("read init config", e))?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Report a panic as a protocol violation, then abort.
fn install_panic_report(socket: &UnixStream) {
    let Ok(reporter) = socket.try_clone() else {
        return;
    };
    std::panic::set_hook(Box::new(move |info| {
        let report = InitMessage::ProtocolViolation {
            message: format!("init stage panicked: {info}"),
        };
        let _ = (&reporter).write_all(&report.encode());
        std::process::abort();
    }));
}

/// Fail unless the calling process has exactly one thread.
fn ensure_single_threaded() -> CorralResult<()> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|e| CorralError::io_context("read /proc/self/status", e))?;
    let threads = status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|n| n.trim().parse::<u32>().ok())
        .ok_or_else(|| CorralError::Internal {
            message: "no thread count in /proc/self/status".to_string(),
        })?;
    if threads != 1 {
        return Err(CorralError::Internal {
            message: format!("init stage must be single-threaded, found {threads} threads"),
        });
    }
    Ok(())
}

/// Mark every open descriptor from `first` upward close-on-exec.
fn mark_cloexec_from(first: usize) -> CorralResult<()> {
    let first = RawFd::try_from(first).map_err(|_| CorralError::InvalidArgument {
        message: format!("too many preserved descriptors: {first}"),
    })?;
    let entries = std::fs::read_dir("/proc/self/fd")
        .map_err(|e| CorralError::io_context("read /proc/self/fd", e))?;

    for entry in entries.flatten() {
        let Some(fd) = entry.file_name().to_str().and_then(|n| n.parse::<RawFd>().ok()) else {
            continue;
        };
        if fd < first {
            continue;
        }
        // SAFETY: the descriptor is only borrowed for one fcntl call; the
        // directory iterator's own descriptor may already be closed (EBADF).
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match rustix::io::fcntl_getfd(borrowed) {
            Ok(flags) => {
                rustix::io::fcntl_setfd(borrowed, flags | FdFlags::CLOEXEC)
                    .map_err(|e| CorralError::io_context("set close-on-exec", e.into()))?;
            }
            Err(rustix::io::Errno::BADF) => {}
            Err(e) => return Err(CorralError::io_context("get fd flags", e.into())),
        }
    }
    Ok(())
}

/// Open `console`, make it stdio and the controlling terminal.
fn attach_console(console: &std::path::Path) -> CorralResult<()> {
    rustix::process::setsid().map_err(|e| CorralError::io_context("setsid", e.into()))?;

    let tty = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(console)
        .map_err(|e| CorralError::io_context(&format!("open console {}", console.display()), e))?;
    for target in 0..=2 {
        // SAFETY: both descriptors are open; dup2 replaces the target.
        if unsafe { libc::dup2(tty.as_raw_fd(), target) } < 0 {
            return Err(CorralError::io_context(
                "dup2 console",
                std::io::Error::last_os_error(),
            ));
        }
    }
    ioctl_set_ctty()
}

/// Make the terminal already on stdin the controlling terminal.
fn set_controlling_terminal() -> CorralResult<()> {
    rustix::process::setsid().map_err(|e| CorralError::io_context("setsid", e.into()))?;
    ioctl_set_ctty()
}

fn ioctl_set_ctty() -> CorralResult<()> {
    // SAFETY: TIOCSCTTY takes an integer argument.
    if unsafe { libc::ioctl(0, libc::TIOCSCTTY, 0) } < 0 {
        return Err(CorralError::io_context(
            "set controlling terminal",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Enter a new cgroup namespace rooted at the current cgroup.
fn unshare_cgroup() -> CorralResult<()> {
    // SAFETY: unshare takes flags only.
    if unsafe { libc::unshare(libc::CLONE_NEWCGROUP) } != 0 {
        return Err(CorralError::io_context(
            "unshare cgroup namespace",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn set_hostname(hostname: &str) -> CorralResult<()> {
    // SAFETY: the pointer and length describe the borrowed string.
    if unsafe { libc::sethostname(hostname.as_ptr().cast(), hostname.len()) } != 0 {
        return Err(CorralError::io_context(
            "sethostname",
            std::io::Error::last_os_error(),
        ));
    }
    tracing::debug!(hostname, "Set hostname");
    Ok(())
}

/// Split `KEY=value` entries; malformed entries are dropped.
fn parse_env(env: &[String]) -> Vec<(&str, &str)> {
    env.iter()
        .filter_map(|entry| {
            let pair = entry.split_once('=');
            if pair.is_none() {
                tracing::warn!(entry = %entry, "Ignoring malformed environment entry");
            }
            pair
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_use_tagged_json() {
        let msg = InitMessage::Bootstrap {
            cause: "mount /proc: EPERM".to_string(),
        };
        let json = String::from_utf8(msg.encode()).unwrap();
        assert_eq!(json, r#"{"type":"bootstrap","cause":"mount /proc: EPERM"}"#);
        assert_eq!(InitMessage::decode(json.as_bytes()), msg);
    }

    #[test]
    fn garbage_report_is_protocol_violation() {
        let err = InitMessage::decode(b"\x00\x01").into_error();
        assert!(matches!(err, CorralError::ProtocolViolation { .. }));

        let err = InitMessage::Bootstrap {
            cause: "x".to_string(),
        }
        .into_error();
        assert!(matches!(err, CorralError::Bootstrap { .. }));
    }

    #[test]
    fn env_entries_are_split_on_first_equals() {
        let env = vec![
            "PATH=/bin:/usr/bin".to_string(),
            "OPTS=a=b".to_string(),
            "BROKEN".to_string(),
        ];
        assert_eq!(
            parse_env(&env),
            vec![("PATH", "/bin:/usr/bin"), ("OPTS", "a=b")]
        );
    }

    #[test]
    fn init_config_round_trips() {
        let container: ContainerConfig =
            serde_json::from_str(r#"{"bundle":"/b","rootfs":"/b/rootfs"}"#).unwrap();
        let config = InitConfig {
            container,
            args: vec!["sh".to_string()],
            env: vec![],
            cwd: PathBuf::from("/"),
            user: User::default(),
            terminal: false,
            console: None,
            preserved_fds: 2,
        };
        let json = serde_json::to_vec(&config).unwrap();
        let back: InitConfig = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.preserved_fds, 2);
        assert_eq!(back.container.rootfs, PathBuf::from("/b/rootfs"));
    }
}
