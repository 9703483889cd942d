#![allow(unsafe_code)]
//! Namespace manager.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use corral_common::{CorralError, CorralResult};
use corral_oci::runtime::NamespaceType;

use super::{IdMapping, NamespaceConfig, format_id_map, self_ns_path};

/// Manages Linux namespaces for a container.
#[derive(Debug, Clone)]
pub struct NamespaceManager {
    config: NamespaceConfig,
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
}

impl NamespaceManager {
    /// Create a new namespace manager.
    #[must_use]
    pub const fn new(
        config: NamespaceConfig,
        uid_mappings: Vec<IdMapping>,
        gid_mappings: Vec<IdMapping>,
    ) -> Self {
        Self {
            config,
            uid_mappings,
            gid_mappings,
        }
    }

    /// The namespace configuration.
    #[must_use]
    pub const fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Returns true if ID maps must be written for a new user namespace.
    #[must_use]
    pub fn needs_id_maps(&self) -> bool {
        self.config.creates(NamespaceType::User)
    }

    /// Write UID mappings to /proc/[pid]/uid_map.
    #[cfg(target_os = "linux")]
    pub fn write_uid_map(&self, pid: i32) -> CorralResult<()> {
        if self.uid_mappings.is_empty() {
            return Ok(());
        }

        let path = format!("/proc/{pid}/uid_map");
        std::fs::write(&path, format_id_map(&self.uid_mappings)).map_err(|e| {
            CorralError::Internal {
                message: format!("Failed to write uid_map: {e}"),
            }
        })?;

        tracing::debug!(path = %path, "Wrote UID mappings");

        Ok(())
    }

    /// Write GID mappings to /proc/[pid]/gid_map.
    #[cfg(target_os = "linux")]
    pub fn write_gid_map(&self, pid: i32) -> CorralResult<()> {
        if self.gid_mappings.is_empty() {
            return Ok(());
        }

        // Unprivileged writers must deny setgroups first
        if !rustix::process::geteuid().is_root() {
            let setgroups_path = format!("/proc/{pid}/setgroups");
            if Path::new(&setgroups_path).exists() {
                std::fs::write(&setgroups_path, "deny")?;
            }
        }

        let path = format!("/proc/{pid}/gid_map");
        std::fs::write(&path, format_id_map(&self.gid_mappings)).map_err(|e| {
            CorralError::Internal {
                message: format!("Failed to write gid_map: {e}"),
            }
        })?;

        tracing::debug!(path = %path, "Wrote GID mappings");

        Ok(())
    }

    /// Join every namespace configured by path, except PID.
    ///
    /// Must run in a single-threaded process. A PID namespace is joined by
    /// the launcher around `clone(2)` instead, see [`PidNamespaceGuard`].
    #[cfg(target_os = "linux")]
    pub fn join(&self) -> CorralResult<()> {
        for (kind, path) in self.config.joins() {
            if kind == NamespaceType::Pid {
                continue;
            }
            setns_path(path, kind)?;
        }
        Ok(())
    }

    /// Point the calling thread's future children at the configured PID
    /// namespace, if one is joined by path.
    #[cfg(target_os = "linux")]
    pub fn enter_pid_namespace(&self) -> CorralResult<Option<PidNamespaceGuard>> {
        let Some(path) = self.config.join_path(NamespaceType::Pid) else {
            return Ok(None);
        };

        let own = File::open(self_ns_path(NamespaceType::Pid))?;
        setns_path(path, NamespaceType::Pid)?;
        Ok(Some(PidNamespaceGuard { own }))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn write_uid_map(&self, _pid: i32) -> CorralResult<()> {
        Err(CorralError::Unsupported {
            feature: "user namespaces".to_string(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn write_gid_map(&self, _pid: i32) -> CorralResult<()> {
        Err(CorralError::Unsupported {
            feature: "user namespaces".to_string(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn join(&self) -> CorralResult<()> {
        Err(CorralError::Unsupported {
            feature: "namespaces".to_string(),
        })
    }
}

/// Restores the launcher's own PID namespace for children when dropped.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct PidNamespaceGuard {
    own: File,
}

#[cfg(target_os = "linux")]
impl Drop for PidNamespaceGuard {
    fn drop(&mut self) {
        // SAFETY: own is an open nsfs file for the caller's PID namespace.
        let rc = unsafe { libc::setns(self.own.as_raw_fd(), libc::CLONE_NEWPID) };
        if rc != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "Failed to restore PID namespace for children"
            );
        }
    }
}

#[cfg(target_os = "linux")]
fn setns_path(path: &Path, kind: NamespaceType) -> CorralResult<()> {
    let file = File::open(path).map_err(|e| {
        CorralError::io_context(&format!("open namespace {}", path.display()), e)
    })?;

    // SAFETY: file is an open namespace descriptor and the flag names its type.
    let rc = unsafe { libc::setns(file.as_raw_fd(), super::clone_flag(kind)) };
    if rc != 0 {
        return Err(CorralError::io_context(
            &format!("setns {}", path.display()),
            std::io::Error::last_os_error(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_oci::runtime::Namespace;

    #[test]
    fn id_maps_only_for_new_user_namespace() {
        let joined = NamespaceManager::new(
            NamespaceConfig {
                namespaces: vec![Namespace {
                    ns_type: NamespaceType::User,
                    path: Some("/proc/1/ns/user".into()),
                }],
            },
            Vec::new(),
            Vec::new(),
        );
        assert!(!joined.needs_id_maps());

        let created = NamespaceManager::new(
            NamespaceConfig {
                namespaces: vec![Namespace {
                    ns_type: NamespaceType::User,
                    path: None,
                }],
            },
            Vec::new(),
            Vec::new(),
        );
        assert!(created.needs_id_maps());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn no_pid_join_means_no_guard() {
        let manager = NamespaceManager::new(NamespaceConfig::default(), Vec::new(), Vec::new());
        assert!(manager.enter_pid_namespace().unwrap().is_none());
        assert!(manager.join().is_ok());
    }
}
