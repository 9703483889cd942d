//! Standard filesystem paths for Corral.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default state root for Corral.
pub static CORRAL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CORRAL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/corral"))
});

/// Standard paths used by the Corral runtime.
#[derive(Debug, Clone)]
pub struct CorralPaths {
    /// State root directory (default: /run/corral).
    pub root: PathBuf,
}

impl CorralPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one subdirectory per container.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Container state file.
    #[must_use]
    pub fn container_state(&self, id: &str) -> PathBuf {
        self.container(id).join("state.json")
    }

    /// Container runtime configuration file.
    #[must_use]
    pub fn container_config(&self, id: &str) -> PathBuf {
        self.container(id).join("config.json")
    }
}

impl Default for CorralPaths {
    fn default() -> Self {
        Self {
            root: CORRAL_ROOT.clone(),
        }
    }
}
