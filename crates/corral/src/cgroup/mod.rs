//! Cgroup v2 management.
//!
//! Each container gets its own leaf cgroup. The launcher moves the container
//! process into it before the init stage is released.

mod manager;

use std::path::{Path, PathBuf};

pub use manager::CgroupManager;

use corral_oci::runtime::Resources;
use serde::{Deserialize, Serialize};

/// Default cgroup v2 mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Cgroup placement and limits for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Cgroup path relative to the cgroup root.
    pub path: PathBuf,
    /// Resource limits.
    #[serde(default)]
    pub resources: Resources,
}

impl CgroupConfig {
    /// Derive the configuration from an OCI spec.
    ///
    /// Without `linux.cgroupsPath` the container lands in `corral/<id>`.
    #[must_use]
    pub fn from_spec(id: &str, spec: &corral_oci::Spec) -> Self {
        let linux = spec.linux.as_ref();
        let path = linux
            .and_then(|l| l.cgroups_path.as_deref())
            .map_or_else(
                || Path::new("corral").join(id),
                |p| PathBuf::from(p.trim_start_matches('/')),
            );
        let resources = linux
            .and_then(|l| l.resources.clone())
            .unwrap_or_default();
        Self { path, resources }
    }
}

/// Convert cgroup v1 CPU shares to a cgroup v2 weight.
///
/// Maps `[2, 262144]` onto `[1, 10000]`.
#[must_use]
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    1 + ((shares - 2) * 9999) / 262_142
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_oci::runtime::Linux;

    #[test]
    fn default_path_uses_id() {
        let config = CgroupConfig::from_spec("web", &corral_oci::Spec::default());
        assert_eq!(config.path, PathBuf::from("corral/web"));
    }

    #[test]
    fn spec_path_is_made_relative() {
        let spec = corral_oci::Spec {
            linux: Some(Linux {
                cgroups_path: Some("/machine/web".to_string()),
                ..Linux::default()
            }),
            ..corral_oci::Spec::default()
        };
        let config = CgroupConfig::from_spec("web", &spec);
        assert_eq!(config.path, PathBuf::from("machine/web"));
    }

    #[test]
    fn shares_conversion_bounds() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(1024), 39);
        assert_eq!(shares_to_weight(0), 1);
    }
}
