//! # Corral Container Runtime
//!
//! Corral runs exactly one process inside a fresh set of Linux namespaces
//! and cgroup, and manages that process's lifecycle.
//!
//! ## Features
//!
//! - **Init handshake**: the runtime binary re-executes itself as `corral init`
//!   inside the new namespaces and reports failures back over a socket
//! - **Signal forwarding**: the attached launcher forwards signals and exits
//!   with the process's own status (`128 + n` for signal `n`)
//! - **Compensation**: every failure after creation tears the container down
//! - **Pass-through protocols**: socket activation and `NOTIFY_SOCKET`
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//!
//! use corral::orchestrator::{StartOptions, start_container};
//! use corral::runtime::{Factory, RuntimeConfig};
//! use corral_oci::Spec;
//!
//! # fn example() -> corral_common::CorralResult<()> {
//! let bundle = Path::new("/srv/bundles/web");
//! let spec = Spec::load(bundle)?;
//! let factory = Factory::new(RuntimeConfig::default());
//!
//! let options = StartOptions {
//!     id: "web".to_string(),
//!     ..StartOptions::default()
//! };
//! let exit_code = start_container(&factory, &spec, bundle, &options)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod namespace;
pub mod orchestrator;
pub mod runtime;
pub mod security;

pub use runtime::{Container, Factory};
