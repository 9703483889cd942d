#![allow(unsafe_code)]
//! Container security features.
//!
//! This module provides the privilege-shedding steps of the init stage:
//! - Linux capabilities
//! - Resource limits
//! - User and group identity
//! - `no_new_privs`

mod capabilities;

pub use capabilities::CapabilitySet;

use corral_common::{CorralError, CorralResult};
use corral_oci::runtime::Rlimit;
#[cfg(target_os = "linux")]
use rustix::process::Resource;

/// Set the no_new_privs flag.
#[cfg(target_os = "linux")]
pub fn set_no_new_privs() -> CorralResult<()> {
    // SAFETY: prctl with integer arguments only.
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };

    if result != 0 {
        return Err(CorralError::Internal {
            message: format!(
                "prctl(PR_SET_NO_NEW_PRIVS) failed: {}",
                std::io::Error::last_os_error()
            ),
        });
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_no_new_privs() -> CorralResult<()> {
    Err(CorralError::Unsupported {
        feature: "no_new_privs".to_string(),
    })
}

/// Keep permitted capabilities across the uid switch.
#[cfg(target_os = "linux")]
pub fn set_keep_caps(keep: bool) -> CorralResult<()> {
    // SAFETY: prctl with integer arguments only.
    let result = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, libc::c_ulong::from(keep), 0, 0, 0) };
    if result != 0 {
        return Err(CorralError::io_context(
            "prctl(PR_SET_KEEPCAPS)",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Switch to the container user: supplementary groups, then gid, then uid.
#[cfg(target_os = "linux")]
pub fn switch_user(uid: u32, gid: u32, additional_gids: &[u32]) -> CorralResult<()> {
    // SAFETY: the slice outlives the call and its length is passed alongside.
    let rc = unsafe { libc::setgroups(additional_gids.len(), additional_gids.as_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // setgroups is denied inside user namespaces set up without it
        if !(additional_gids.is_empty() && err.raw_os_error() == Some(libc::EPERM)) {
            return Err(CorralError::io_context("setgroups", err));
        }
    }

    // SAFETY: plain syscalls with integer arguments.
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(CorralError::io_context(
            "setgid",
            std::io::Error::last_os_error(),
        ));
    }
    // SAFETY: plain syscalls with integer arguments.
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(CorralError::io_context(
            "setuid",
            std::io::Error::last_os_error(),
        ));
    }

    tracing::debug!(uid, gid, "Switched user");
    Ok(())
}

/// Map an rlimit name such as `RLIMIT_NOFILE` to its resource.
#[cfg(target_os = "linux")]
#[must_use]
pub fn rlimit_resource(name: &str) -> Option<Resource> {
    let resource = match name {
        "RLIMIT_AS" => Resource::As,
        "RLIMIT_CORE" => Resource::Core,
        "RLIMIT_CPU" => Resource::Cpu,
        "RLIMIT_DATA" => Resource::Data,
        "RLIMIT_FSIZE" => Resource::Fsize,
        "RLIMIT_LOCKS" => Resource::Locks,
        "RLIMIT_MEMLOCK" => Resource::Memlock,
        "RLIMIT_MSGQUEUE" => Resource::Msgqueue,
        "RLIMIT_NICE" => Resource::Nice,
        "RLIMIT_NOFILE" => Resource::Nofile,
        "RLIMIT_NPROC" => Resource::Nproc,
        "RLIMIT_RSS" => Resource::Rss,
        "RLIMIT_RTPRIO" => Resource::Rtprio,
        "RLIMIT_RTTIME" => Resource::Rttime,
        "RLIMIT_SIGPENDING" => Resource::Sigpending,
        "RLIMIT_STACK" => Resource::Stack,
        _ => return None,
    };
    Some(resource)
}

/// Apply resource limits to the calling process.
#[cfg(target_os = "linux")]
pub fn apply_rlimits(rlimits: &[Rlimit]) -> CorralResult<()> {
    for limit in rlimits {
        let resource =
            rlimit_resource(&limit.limit_type).ok_or_else(|| CorralError::InvalidArgument {
                message: format!("unknown rlimit {:?}", limit.limit_type),
            })?;
        let value = rustix::process::Rlimit {
            current: (limit.soft != u64::MAX).then_some(limit.soft),
            maximum: (limit.hard != u64::MAX).then_some(limit.hard),
        };
        rustix::process::setrlimit(resource, value).map_err(|e| {
            CorralError::io_context(&format!("setrlimit {}", limit.limit_type), e.into())
        })?;
        tracing::debug!(rlimit = %limit.limit_type, soft = limit.soft, hard = limit.hard, "Set rlimit");
    }
    Ok(())
}
