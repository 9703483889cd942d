#![allow(unsafe_code)]
//! pivot_root implementation.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use corral_common::{CorralError, CorralResult};

use super::mounts::unmount_detach;

/// Directory inside the new root that briefly holds the old root.
const PUT_OLD: &str = ".pivot_root";

/// Make `new_root` the process root and detach the old one.
///
/// `new_root` must be a mount point; the caller bind-mounts it onto itself
/// first.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> CorralResult<()> {
    let put_old = new_root.join(PUT_OLD);

    tracing::debug!(
        new_root = %new_root.display(),
        put_old = %put_old.display(),
        "Executing pivot_root"
    );

    std::fs::create_dir_all(&put_old)?;

    let new_root_c = CString::new(new_root.as_os_str().as_bytes()).map_err(|e| {
        CorralError::Internal {
            message: format!("Invalid path: {e}"),
        }
    })?;
    let put_old_c = CString::new(put_old.as_os_str().as_bytes()).map_err(|e| {
        CorralError::Internal {
            message: format!("Invalid path: {e}"),
        }
    })?;

    // SAFETY: both arguments are valid NUL-terminated paths.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pivot_root,
            new_root_c.as_ptr(),
            put_old_c.as_ptr(),
        )
    };

    if ret != 0 {
        return Err(CorralError::io_context(
            "pivot_root",
            std::io::Error::last_os_error(),
        ));
    }

    rustix::process::chdir("/").map_err(|e| CorralError::io_context("chdir /", e.into()))?;

    let old_root = Path::new("/").join(PUT_OLD);
    unmount_detach(&old_root)?;
    std::fs::remove_dir(&old_root)?;

    tracing::debug!("pivot_root successful");
    Ok(())
}

/// Change root without a mount namespace.
#[cfg(target_os = "linux")]
pub fn chroot(new_root: &Path) -> CorralResult<()> {
    rustix::process::chroot(new_root)
        .map_err(|e| CorralError::io_context("chroot", e.into()))?;
    rustix::process::chdir("/").map_err(|e| CorralError::io_context("chdir /", e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &Path) -> CorralResult<()> {
    Err(CorralError::Unsupported {
        feature: "pivot_root".to_string(),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn chroot(_new_root: &Path) -> CorralResult<()> {
    Err(CorralError::Unsupported {
        feature: "chroot".to_string(),
    })
}
