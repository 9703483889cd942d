//! Linux namespace management.
//!
//! A container either creates a namespace (a spec entry without a path) or
//! joins an existing one (an entry naming a `/proc/<pid>/ns/*` file):
//! - User namespace (CLONE_NEWUSER)
//! - PID namespace (CLONE_NEWPID)
//! - Network namespace (CLONE_NEWNET)
//! - Mount namespace (CLONE_NEWNS)
//! - UTS namespace (CLONE_NEWUTS)
//! - IPC namespace (CLONE_NEWIPC)
//! - Cgroup namespace (CLONE_NEWCGROUP)

mod manager;

use std::path::{Path, PathBuf};

pub use corral_oci::runtime::IdMapping;
pub use manager::NamespaceManager;

use corral_oci::runtime::{Namespace, NamespaceType};
use serde::{Deserialize, Serialize};

/// Namespace configuration for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Requested namespaces, in spec order.
    pub namespaces: Vec<Namespace>,
}

impl NamespaceConfig {
    /// Create from OCI spec.
    #[must_use]
    pub fn from_spec(spec: &corral_oci::Spec) -> Self {
        let namespaces = spec
            .linux
            .as_ref()
            .map(|linux| linux.namespaces.clone())
            .unwrap_or_default();
        Self { namespaces }
    }

    /// Returns true if the namespace is requested at all, created or joined.
    #[must_use]
    pub fn contains(&self, kind: NamespaceType) -> bool {
        self.namespaces.iter().any(|ns| ns.ns_type == kind)
    }

    /// Returns true if a fresh namespace of this kind is created.
    #[must_use]
    pub fn creates(&self, kind: NamespaceType) -> bool {
        self.namespaces
            .iter()
            .any(|ns| ns.ns_type == kind && ns.path.is_none())
    }

    /// Existing namespaces to join, user namespace first.
    pub fn joins(&self) -> impl Iterator<Item = (NamespaceType, &Path)> {
        let user = self.join_path(NamespaceType::User);
        let rest = self.namespaces.iter().filter_map(|ns| match &ns.path {
            Some(path) if ns.ns_type != NamespaceType::User => Some((ns.ns_type, path.as_path())),
            _ => None,
        });
        user.map(|path| (NamespaceType::User, path))
            .into_iter()
            .chain(rest)
    }

    /// Path of the namespace of this kind to join, if any.
    #[must_use]
    pub fn join_path(&self, kind: NamespaceType) -> Option<&Path> {
        self.namespaces
            .iter()
            .find(|ns| ns.ns_type == kind)
            .and_then(|ns| ns.path.as_deref())
    }

    /// `clone(2)` flags for the namespaces that are created rather than joined.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn clone_flags(&self) -> libc::c_int {
        self.namespaces
            .iter()
            .filter(|ns| ns.path.is_none())
            .fold(0, |flags, ns| flags | clone_flag(ns.ns_type))
    }

    /// Absolute join paths, resolved against `base` when relative.
    #[must_use]
    pub fn resolved(mut self, base: &Path) -> Self {
        for ns in &mut self.namespaces {
            if let Some(path) = ns.path.take() {
                ns.path = Some(if path.is_absolute() {
                    path
                } else {
                    base.join(path)
                });
            }
        }
        self
    }
}

/// The `CLONE_NEW*` constant for a namespace kind.
#[cfg(target_os = "linux")]
#[must_use]
pub const fn clone_flag(kind: NamespaceType) -> libc::c_int {
    match kind {
        NamespaceType::User => libc::CLONE_NEWUSER,
        NamespaceType::Pid => libc::CLONE_NEWPID,
        NamespaceType::Network => libc::CLONE_NEWNET,
        NamespaceType::Mount => libc::CLONE_NEWNS,
        NamespaceType::Uts => libc::CLONE_NEWUTS,
        NamespaceType::Ipc => libc::CLONE_NEWIPC,
        NamespaceType::Cgroup => libc::CLONE_NEWCGROUP,
    }
}

/// Format mappings the way `/proc/<pid>/{uid,gid}_map` expects them.
#[must_use]
pub fn format_id_map(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// Translate a container ID into the host ID it maps to.
#[must_use]
pub fn map_to_host(mappings: &[IdMapping], container_id: u32) -> Option<u32> {
    mappings.iter().find_map(|m| {
        let offset = container_id.checked_sub(m.container_id)?;
        (offset < m.size).then(|| m.host_id + offset)
    })
}

/// The `/proc/self/ns` link for a namespace kind.
#[must_use]
pub fn self_ns_path(kind: NamespaceType) -> PathBuf {
    PathBuf::from("/proc/self/ns").join(kind.proc_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(ns_type: NamespaceType, path: Option<&str>) -> Namespace {
        Namespace {
            ns_type,
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn created_and_joined_namespaces() {
        let config = NamespaceConfig {
            namespaces: vec![
                ns(NamespaceType::Pid, None),
                ns(NamespaceType::Network, Some("/proc/42/ns/net")),
                ns(NamespaceType::Mount, None),
                ns(NamespaceType::User, Some("/proc/42/ns/user")),
            ],
        };

        assert!(config.creates(NamespaceType::Pid));
        assert!(!config.creates(NamespaceType::Network));
        assert!(config.contains(NamespaceType::Network));
        assert!(!config.contains(NamespaceType::Uts));

        let joins: Vec<_> = config.joins().map(|(kind, _)| kind).collect();
        assert_eq!(joins, vec![NamespaceType::User, NamespaceType::Network]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn clone_flags_skip_joined() {
        let config = NamespaceConfig {
            namespaces: vec![
                ns(NamespaceType::Pid, None),
                ns(NamespaceType::Network, Some("/proc/42/ns/net")),
            ],
        };
        assert_eq!(config.clone_flags(), libc::CLONE_NEWPID);
    }

    #[test]
    fn id_map_format_and_lookup() {
        let mappings = [
            IdMapping {
                container_id: 0,
                host_id: 100_000,
                size: 1000,
            },
            IdMapping {
                container_id: 1000,
                host_id: 1000,
                size: 1,
            },
        ];

        assert_eq!(format_id_map(&mappings), "0 100000 1000\n1000 1000 1\n");
        assert_eq!(map_to_host(&mappings, 0), Some(100_000));
        assert_eq!(map_to_host(&mappings, 999), Some(100_999));
        assert_eq!(map_to_host(&mappings, 1000), Some(1000));
        assert_eq!(map_to_host(&mappings, 1001), None);
    }

    #[test]
    fn relative_join_paths_resolve() {
        let config = NamespaceConfig {
            namespaces: vec![ns(NamespaceType::Uts, Some("ns/uts"))],
        }
        .resolved(Path::new("/bundle"));
        assert_eq!(
            config.join_path(NamespaceType::Uts),
            Some(Path::new("/bundle/ns/uts"))
        );
    }
}
