//! Runtime-internal container configuration.

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use corral_oci::Spec;
use corral_oci::runtime::{Capabilities, Mount, NamespaceType, Rlimit};
use serde::{Deserialize, Serialize};

use crate::cgroup::CgroupConfig;
use crate::namespace::{IdMapping, NamespaceConfig, NamespaceManager, map_to_host};

/// Everything the runtime needs to build one container, derived from a
/// bundle [`Spec`]. Persisted next to the state and sent to the init stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Bundle directory.
    pub bundle: PathBuf,
    /// Absolute root filesystem path.
    pub rootfs: PathBuf,
    /// Remount the root filesystem read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Container hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Namespaces to create or join.
    #[serde(default)]
    pub namespaces: NamespaceConfig,
    /// UID mappings for a new user namespace.
    #[serde(default)]
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings for a new user namespace.
    #[serde(default)]
    pub gid_mappings: Vec<IdMapping>,
    /// Cgroup placement and limits.
    #[serde(default)]
    pub cgroup: CgroupConfig,
    /// Mounts below the rootfs, in order.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Capability sets by name.
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    /// Resource limits.
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    /// Set `no_new_privs` before exec.
    #[serde(default)]
    pub no_new_privileges: bool,
}

impl ContainerConfig {
    /// Derive the configuration for container `id` from a bundle spec.
    ///
    /// Relative paths are resolved against `bundle`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] if the spec names no root filesystem.
    pub fn from_spec(id: &str, spec: &Spec, bundle: &Path) -> CorralResult<Self> {
        let root = spec.root.as_ref().ok_or_else(|| CorralError::Config {
            message: "No root filesystem in spec".to_string(),
        })?;
        let rootfs = if root.path.is_absolute() {
            root.path.clone()
        } else {
            bundle.join(&root.path)
        };

        let linux = spec.linux.clone().unwrap_or_default();
        let process = spec.process.as_ref();

        Ok(Self {
            bundle: bundle.to_path_buf(),
            rootfs,
            readonly: root.readonly,
            hostname: spec.hostname.clone(),
            namespaces: NamespaceConfig::from_spec(spec).resolved(bundle),
            uid_mappings: linux.uid_mappings,
            gid_mappings: linux.gid_mappings,
            cgroup: CgroupConfig::from_spec(id, spec),
            mounts: spec.mounts.clone(),
            capabilities: process.and_then(|p| p.capabilities.clone()),
            rlimits: process.map(|p| p.rlimits.clone()).unwrap_or_default(),
            no_new_privileges: process.is_some_and(|p| p.no_new_privileges),
        })
    }

    /// Host uid that owns files created for container root.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PermissionDenied`] when a user namespace is
    /// configured but no mapping covers container uid 0.
    pub fn host_uid(&self) -> CorralResult<u32> {
        self.host_id(&self.uid_mappings, "uid")
    }

    /// Host gid for container root; see [`Self::host_uid`].
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PermissionDenied`] when no mapping covers gid 0.
    pub fn host_gid(&self) -> CorralResult<u32> {
        self.host_id(&self.gid_mappings, "gid")
    }

    fn host_id(&self, mappings: &[IdMapping], kind: &str) -> CorralResult<u32> {
        if !self.namespaces.contains(NamespaceType::User) {
            return Ok(0);
        }
        map_to_host(mappings, 0).ok_or_else(|| CorralError::PermissionDenied {
            operation: format!("resolve host {kind}: no mapping for container root"),
        })
    }

    /// Namespace manager for this configuration.
    #[must_use]
    pub fn namespace_manager(&self) -> NamespaceManager {
        NamespaceManager::new(
            self.namespaces.clone(),
            self.uid_mappings.clone(),
            self.gid_mappings.clone(),
        )
    }

    /// Bind-mount a host path into the container at the same location.
    pub fn add_bind_mount(&mut self, path: &Path) {
        self.mounts.push(Mount {
            destination: path.to_path_buf(),
            mount_type: Some("bind".to_string()),
            source: Some(path.to_path_buf()),
            options: vec!["bind".to_string()],
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_oci::runtime::{Linux, Namespace, Root};

    fn spec_with(linux: Option<Linux>) -> Spec {
        Spec {
            root: Some(Root {
                path: PathBuf::from("rootfs"),
                readonly: true,
            }),
            linux,
            ..Spec::default()
        }
    }

    #[test]
    fn rootfs_resolves_against_bundle() {
        let config = ContainerConfig::from_spec("web", &spec_with(None), Path::new("/bundles/web"))
            .unwrap();
        assert_eq!(config.rootfs, PathBuf::from("/bundles/web/rootfs"));
        assert!(config.readonly);
        assert_eq!(config.cgroup.path, PathBuf::from("corral/web"));
    }

    #[test]
    fn missing_root_is_config_error() {
        let err = ContainerConfig::from_spec("web", &Spec::default(), Path::new("/b")).unwrap_err();
        assert!(matches!(err, CorralError::Config { .. }));
    }

    #[test]
    fn host_uid_without_user_namespace_is_root() {
        let config = ContainerConfig::from_spec("web", &spec_with(None), Path::new("/b")).unwrap();
        assert_eq!(config.host_uid().unwrap(), 0);
        assert_eq!(config.host_gid().unwrap(), 0);
    }

    #[test]
    fn host_uid_follows_mapping() {
        let linux = Linux {
            namespaces: vec![Namespace {
                ns_type: NamespaceType::User,
                path: None,
            }],
            uid_mappings: vec![IdMapping {
                container_id: 0,
                host_id: 100_000,
                size: 65_536,
            }],
            ..Linux::default()
        };
        let config =
            ContainerConfig::from_spec("web", &spec_with(Some(linux)), Path::new("/b")).unwrap();

        assert_eq!(config.host_uid().unwrap(), 100_000);
        let err = config.host_gid().unwrap_err();
        assert!(matches!(err, CorralError::PermissionDenied { .. }));
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config =
            ContainerConfig::from_spec("web", &spec_with(None), Path::new("/b")).unwrap();
        config.add_bind_mount(Path::new("/run/notify.sock"));

        let json = serde_json::to_string(&config).unwrap();
        let back: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mounts.len(), 1);
        assert_eq!(back.mounts[0].options, vec!["bind".to_string()]);
    }
}
