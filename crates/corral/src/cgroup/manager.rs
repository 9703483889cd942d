//! Cgroup manager implementation.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use corral_common::{CorralError, CorralResult};
use corral_oci::runtime::{CpuResources, MemoryResources, PidsResources, Resources};

use super::{CgroupConfig, shares_to_weight};
use crate::exec::process::send_signal;

/// Attempts at removing a cgroup whose processes are still being reaped.
const REMOVE_ATTEMPTS: u32 = 10;

/// Manages a cgroup for a container.
#[derive(Debug)]
pub struct CgroupManager {
    /// Container ID.
    container_id: String,
    /// Absolute cgroup path.
    path: PathBuf,
}

impl CgroupManager {
    /// Create the cgroup for a container under `root`.
    ///
    /// `root` must be a cgroup v2 mount; anything else is
    /// [`CorralError::Unsupported`].
    pub fn create(container_id: &str, root: &Path, config: &CgroupConfig) -> CorralResult<Self> {
        ensure_unified(root)?;
        let path = root.join(&config.path);

        tracing::debug!(
            container_id = %container_id,
            path = %path.display(),
            "Creating cgroup"
        );

        std::fs::create_dir_all(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                CorralError::PermissionDenied {
                    operation: "create cgroup".to_string(),
                }
            } else {
                CorralError::io_context("create cgroup", e)
            }
        })?;

        Ok(Self {
            container_id: container_id.to_string(),
            path,
        })
    }

    /// Handle to an existing cgroup. The directory may already be gone.
    #[must_use]
    pub fn open(container_id: &str, root: &Path, config: &CgroupConfig) -> Self {
        Self {
            container_id: container_id.to_string(),
            path: root.join(&config.path),
        }
    }

    /// Get the cgroup path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a process to the cgroup.
    pub fn add_process(&self, pid: i32) -> CorralResult<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string())
            .map_err(|e| CorralError::io_context("join cgroup", e))?;

        tracing::debug!(
            container_id = %self.container_id,
            pid = pid,
            "Added process to cgroup"
        );

        Ok(())
    }

    /// Apply resource limits.
    pub fn apply_resources(&self, resources: &Resources) -> CorralResult<()> {
        if let Some(cpu) = &resources.cpu {
            self.apply_cpu(cpu)?;
        }

        if let Some(memory) = &resources.memory {
            self.apply_memory(memory)?;
        }

        if let Some(pids) = &resources.pids {
            self.apply_pids(pids)?;
        }

        Ok(())
    }

    /// Apply CPU limits.
    fn apply_cpu(&self, cpu: &CpuResources) -> CorralResult<()> {
        // cpu.max format: "$quota $period"
        if let Some(quota) = cpu.quota {
            let period = cpu.period.unwrap_or(100_000);
            let value = if quota > 0 {
                format!("{quota} {period}")
            } else {
                format!("max {period}")
            };
            std::fs::write(self.path.join("cpu.max"), value)?;
            tracing::debug!(quota, period, "Set CPU quota");
        }

        if let Some(shares) = cpu.shares {
            let weight = shares_to_weight(shares);
            std::fs::write(self.path.join("cpu.weight"), weight.to_string())?;
            tracing::debug!(shares, weight, "Set CPU weight");
        }

        Ok(())
    }

    /// Apply memory limits.
    fn apply_memory(&self, memory: &MemoryResources) -> CorralResult<()> {
        if let Some(limit) = memory.limit {
            let value = if limit > 0 {
                limit.to_string()
            } else {
                "max".to_string()
            };
            std::fs::write(self.path.join("memory.max"), value)?;
            tracing::debug!(limit, "Set memory.max");
        }

        Ok(())
    }

    /// Apply PIDs limit.
    fn apply_pids(&self, pids: &PidsResources) -> CorralResult<()> {
        let value = if pids.limit > 0 {
            pids.limit.to_string()
        } else {
            "max".to_string()
        };
        std::fs::write(self.path.join("pids.max"), value)?;
        tracing::debug!(max = pids.limit, "Set pids.max");
        Ok(())
    }

    /// Returns true if any process is still a member of the cgroup.
    #[must_use]
    pub fn has_processes(&self) -> bool {
        std::fs::read_to_string(self.path.join("cgroup.procs"))
            .is_ok_and(|procs| !procs.trim().is_empty())
    }

    /// Pids of the cgroup's member processes.
    pub fn pids(&self) -> CorralResult<Vec<i32>> {
        let procs = std::fs::read_to_string(self.path.join("cgroup.procs"))
            .map_err(|e| CorralError::io_context("read cgroup.procs", e))?;
        Ok(procs
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Kill all processes in the cgroup.
    ///
    /// Kernels without `cgroup.kill` get `SIGKILL` sent to every member
    /// listed in `cgroup.procs` instead.
    pub fn kill_all(&self) -> CorralResult<()> {
        if let Err(e) = std::fs::write(self.path.join("cgroup.kill"), "1") {
            tracing::debug!(error = %e, "cgroup.kill unavailable, signalling members");
            for pid in self.pids()? {
                send_signal(pid, libc::SIGKILL)?;
            }
        }
        tracing::debug!(container_id = %self.container_id, "Killed all processes in cgroup");
        Ok(())
    }

    /// Delete the cgroup. Missing directories are not an error.
    ///
    /// Killed members linger until reaped, so `EBUSY` is retried a bounded
    /// number of times.
    pub fn delete(&self) -> CorralResult<()> {
        let mut delay = Duration::from_millis(10);
        for attempt in 1..=REMOVE_ATTEMPTS {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => {
                    tracing::debug!(
                        container_id = %self.container_id,
                        path = %self.path.display(),
                        "Deleted cgroup"
                    );
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < REMOVE_ATTEMPTS => {
                    thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(CorralError::io_context("remove cgroup", e)),
            }
        }
        Ok(())
    }
}

/// Refuse hierarchies that are not cgroup v2.
///
/// On a v1 host the directories created below `/sys/fs/cgroup` are plain
/// tmpfs directories, so nothing written there would take effect.
fn ensure_unified(root: &Path) -> CorralResult<()> {
    if root.join("cgroup.controllers").is_file() {
        return Ok(());
    }
    Err(CorralError::Unsupported {
        feature: format!("cgroup hierarchy at {} (cgroup v2 required)", root.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A directory laid out like a cgroup v2 mount.
    fn unified_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "cpu memory pids\n").unwrap();
        root
    }

    #[test]
    fn create_and_delete_plain_directory() {
        let root = unified_root();
        let config = CgroupConfig {
            path: PathBuf::from("corral/test"),
            resources: Resources::default(),
        };

        let manager = CgroupManager::create("test", root.path(), &config).unwrap();
        assert!(manager.path().exists());
        assert!(!manager.has_processes());

        manager.delete().unwrap();
        assert!(!manager.path().exists());
        manager.delete().unwrap();
    }

    #[test]
    fn limits_are_written() {
        let root = unified_root();
        let config = CgroupConfig {
            path: PathBuf::from("corral/limits"),
            resources: Resources::default(),
        };
        let manager = CgroupManager::create("limits", root.path(), &config).unwrap();

        manager
            .apply_resources(&Resources {
                cpu: Some(CpuResources {
                    shares: None,
                    quota: Some(50_000),
                    period: None,
                }),
                memory: Some(MemoryResources { limit: Some(-1) }),
                pids: Some(PidsResources { limit: 64 }),
            })
            .unwrap();

        let read = |name: &str| std::fs::read_to_string(manager.path().join(name)).unwrap();
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("memory.max"), "max");
        assert_eq!(read("pids.max"), "64");
    }

    #[test]
    fn legacy_hierarchy_is_unsupported() {
        let root = tempfile::tempdir().unwrap();
        let config = CgroupConfig {
            path: PathBuf::from("corral/legacy"),
            resources: Resources::default(),
        };

        let err = CgroupManager::create("legacy", root.path(), &config).unwrap_err();
        assert!(matches!(err, CorralError::Unsupported { .. }));
        assert!(!root.path().join("corral").exists());
    }

    #[test]
    fn pids_lists_members() {
        let root = unified_root();
        let config = CgroupConfig {
            path: PathBuf::from("corral/members"),
            resources: Resources::default(),
        };
        let manager = CgroupManager::create("members", root.path(), &config).unwrap();
        std::fs::write(manager.path().join("cgroup.procs"), "12\n34\n").unwrap();

        assert!(manager.has_processes());
        assert_eq!(manager.pids().unwrap(), vec![12, 34]);
    }

    #[test]
    #[ignore = "requires root and cgroups v2"]
    fn create_real_cgroup() {
        let config = CgroupConfig {
            path: PathBuf::from("corral/test-container"),
            resources: Resources::default(),
        };
        let manager =
            CgroupManager::create("test-container", Path::new(super::super::CGROUP_ROOT), &config)
                .unwrap();
        assert!(manager.path().exists());
        manager.delete().unwrap();
    }
}
