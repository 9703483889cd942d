//! # corral-oci
//!
//! OCI (Open Container Initiative) bundle types for Corral.
//!
//! This crate provides Rust types for:
//! - The subset of the OCI Runtime Specification (config.json) Corral consumes
//! - Persisted container state

#![warn(missing_docs)]

pub mod runtime;
pub mod state;

pub use runtime::Spec;
pub use state::{ContainerState, ContainerStatus};
