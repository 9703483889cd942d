//! Container runtime core.
//!
//! This module provides the [`Factory`] registry and the [`Container`]
//! handle with its persisted state.

mod config;
mod container;
mod container_config;
mod factory;
mod state;

pub use config::RuntimeConfig;
pub use container::Container;
pub use container_config::ContainerConfig;
pub use factory::Factory;
pub use state::StateManager;
