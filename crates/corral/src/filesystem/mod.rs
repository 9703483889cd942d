//! Filesystem operations for containers.
//!
//! This module handles:
//! - Mount option parsing and bundle mounts
//! - Root filesystem setup
//! - pivot_root and chroot

mod mounts;
mod pivot;
mod rootfs;

pub use mounts::{MountOptions, container_path, mount_entry};
#[cfg(target_os = "linux")]
pub use mounts::{mount, remount_readonly};
pub use pivot::{chroot, pivot_root};
#[cfg(target_os = "linux")]
pub use rootfs::finalize_rootfs;
pub use rootfs::setup_rootfs;
