//! Container registry: creates and loads containers under the state root.

use corral_common::{ContainerId, CorralError, CorralResult};
use corral_oci::ContainerState;
use once_cell::sync::OnceCell;

use super::config::RuntimeConfig;
use super::container::Container;
use super::container_config::ContainerConfig;
use super::state::StateManager;

/// Creates new containers and loads existing ones by ID.
#[derive(Debug)]
pub struct Factory {
    config: RuntimeConfig,
    store: StateManager,
    /// Set once the containers directory is known to exist.
    ready: OnceCell<()>,
}

impl Factory {
    /// Create a factory rooted at `config.paths`.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let store = StateManager::new(config.paths.clone());
        Self {
            config,
            store,
            ready: OnceCell::new(),
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a new container in the `created` state.
    ///
    /// # Errors
    ///
    /// - [`CorralError::InvalidArgument`] for an empty or malformed ID
    /// - [`CorralError::RootfsNotFound`] if the rootfs does not exist
    /// - [`CorralError::ContainerExists`] if the ID is taken
    ///
    /// Nothing is persisted when an error is returned.
    pub fn create(&self, id: &str, config: ContainerConfig) -> CorralResult<Container> {
        let id = ContainerId::new(id)?;

        match std::fs::metadata(&config.rootfs) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CorralError::RootfsNotFound {
                    path: config.rootfs.clone(),
                });
            }
            Err(e) => {
                return Err(CorralError::io_context(
                    &format!("stat rootfs {}", config.rootfs.display()),
                    e,
                ));
            }
        }

        self.ensure_root()?;

        let dir = self.config.paths.container(id.as_str());
        std::fs::create_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                CorralError::ContainerExists { id: id.to_string() }
            } else {
                CorralError::io_context("create container directory", e)
            }
        })?;

        let state = ContainerState::new(id.as_str(), &config.bundle, &config.rootfs);
        let persisted = self
            .store
            .save_config(id.as_str(), &config)
            .and_then(|()| self.store.save(&state));
        if let Err(e) = persisted {
            if let Err(cleanup) = self.store.delete(id.as_str()) {
                tracing::warn!(container_id = %id, error = %cleanup, "Failed to remove partial state");
            }
            return Err(e);
        }

        tracing::info!(container_id = %id, bundle = %config.bundle.display(), "Container created");

        Ok(Container::new(
            id,
            config,
            state,
            self.config.clone(),
            self.store.clone(),
        ))
    }

    /// Load a previously created container.
    ///
    /// A container recorded as running whose process is gone is reported,
    /// and persisted, as stopped.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::ContainerNotFound`] for an unknown ID.
    pub fn load(&self, id: &str) -> CorralResult<Container> {
        let id = ContainerId::new(id)?;
        let state = self.store.load(id.as_str())?;
        let config = self.store.load_config(id.as_str())?;

        let mut container = Container::new(
            id,
            config,
            state,
            self.config.clone(),
            self.store.clone(),
        );
        container.refresh()?;
        Ok(container)
    }

    fn ensure_root(&self) -> CorralResult<()> {
        self.ready
            .get_or_try_init(|| {
                let containers = self.config.paths.containers();
                std::fs::create_dir_all(&containers).map_err(|e| {
                    CorralError::io_context(
                        &format!("create state root {}", containers.display()),
                        e,
                    )
                })
            })
            .map(|_| ())
    }
}
