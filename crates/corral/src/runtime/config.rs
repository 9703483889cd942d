//! Runtime configuration.

use std::path::PathBuf;

use corral_common::CorralPaths;

use crate::cgroup::CGROUP_ROOT;
use crate::exec::init::INIT_ARG;

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: CorralPaths,
    /// Binary re-executed as the init stage.
    pub init_path: PathBuf,
    /// Arguments that select the init stage in that binary.
    pub init_args: Vec<String>,
    /// Cgroup v2 mount point.
    pub cgroup_root: PathBuf,
    /// Refuse to start containers unless running as root.
    pub require_root: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: CorralPaths::new(),
            init_path: PathBuf::from("/proc/self/exe"),
            init_args: vec![INIT_ARG.to_string()],
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            require_root: true,
        }
    }
}

impl RuntimeConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = CorralPaths::with_root(root);
        self
    }

    /// Re-execute a different binary as the init stage.
    #[must_use]
    pub fn with_init_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_path = path.into();
        self
    }

    /// Use a different cgroup v2 mount point.
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Skip the root check before starting a container, for callers that
    /// validate privileges themselves.
    #[must_use]
    pub const fn without_root_check(mut self) -> Self {
        self.require_root = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.init_path, PathBuf::from("/proc/self/exe"));
        assert_eq!(config.init_args, vec!["init".to_string()]);
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert!(config.require_root);
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_init_path("/usr/bin/corral")
            .with_cgroup_root("/tmp/cgroup")
            .without_root_check();

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.init_path, PathBuf::from("/usr/bin/corral"));
        assert_eq!(config.cgroup_root, PathBuf::from("/tmp/cgroup"));
        assert!(!config.require_root);
    }
}
