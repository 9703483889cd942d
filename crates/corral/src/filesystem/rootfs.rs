//! Root filesystem setup.

use std::path::Path;

use corral_common::CorralResult;
use corral_oci::runtime::Mount;

/// Symlinks every container expects under /dev.
const DEV_LINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("ptmx", "pts/ptmx"),
];

/// Switch the process into the container root filesystem.
///
/// With a mount namespace the rootfs is bind-mounted onto itself, the bundle
/// mounts are applied below it and the root is pivoted. A fresh `/proc` is
/// mounted for a new PID namespace unless the bundle mounts one itself.
/// Without a mount namespace the process only chroots, since mounting would
/// leak into the host.
#[cfg(target_os = "linux")]
pub fn setup_rootfs(
    rootfs: &Path,
    mounts: &[Mount],
    mount_namespace: bool,
    new_pid_namespace: bool,
) -> CorralResult<()> {
    use super::mounts::{make_rprivate, mount, mount_entry};

    tracing::debug!(rootfs = %rootfs.display(), mount_namespace, "Setting up root filesystem");

    if !mount_namespace {
        if !mounts.is_empty() {
            tracing::warn!(count = mounts.len(), "Ignoring mounts without a mount namespace");
        }
        return super::chroot(rootfs);
    }

    make_rprivate(Path::new("/"))?;
    mount(Some(rootfs), rootfs, None, libc::MS_BIND | libc::MS_REC, "")?;

    for entry in mounts {
        mount_entry(rootfs, entry)?;
    }

    if new_pid_namespace && !mounts.iter().any(|m| m.destination == Path::new("/proc")) {
        let proc_dir = rootfs.join("proc");
        std::fs::create_dir_all(&proc_dir)?;
        mount(
            Some(Path::new("proc")),
            &proc_dir,
            Some("proc"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            "",
        )?;
    }

    setup_dev(rootfs)?;

    super::pivot_root(rootfs)
}

#[cfg(not(target_os = "linux"))]
pub fn setup_rootfs(
    _rootfs: &Path,
    _mounts: &[Mount],
    _mount_namespace: bool,
    _new_pid_namespace: bool,
) -> CorralResult<()> {
    Err(corral_common::CorralError::Unsupported {
        feature: "rootfs".to_string(),
    })
}

/// Apply settings that must wait until the pivot is done.
#[cfg(target_os = "linux")]
pub fn finalize_rootfs(readonly: bool) -> CorralResult<()> {
    if readonly {
        tracing::debug!("Remounting rootfs read-only");
        super::mounts::remount_readonly(Path::new("/"))?;
    }
    Ok(())
}

/// Setup /dev with essential links and device nodes.
fn setup_dev(rootfs: &Path) -> CorralResult<()> {
    let dev = rootfs.join("dev");
    std::fs::create_dir_all(&dev)?;

    for (name, target) in DEV_LINKS {
        let path = dev.join(name);
        if path.symlink_metadata().is_err() {
            std::os::unix::fs::symlink(target, &path)?;
        }
    }

    let _ = std::fs::create_dir_all(dev.join("pts"));
    let _ = std::fs::create_dir_all(dev.join("shm"));

    #[cfg(target_os = "linux")]
    create_device_nodes(&dev);

    Ok(())
}

/// Standard device nodes to create in containers.
/// Format: (name, major, minor, mode)
#[cfg(target_os = "linux")]
const DEVICE_NODES: &[(&str, u32, u32, u32)] = &[
    ("null", 1, 3, 0o666),
    ("zero", 1, 5, 0o666),
    ("full", 1, 7, 0o666),
    ("random", 1, 8, 0o666),
    ("urandom", 1, 9, 0o666),
    ("tty", 5, 0, 0o666),
];

/// Create character device nodes in /dev. Best effort.
#[cfg(target_os = "linux")]
fn create_device_nodes(dev: &Path) {
    use rustix::fs::{FileType, Mode, mknodat};

    for (name, major, minor, mode) in DEVICE_NODES {
        let path = dev.join(name);
        if path.symlink_metadata().is_ok() {
            continue;
        }

        let dev_num = rustix::fs::makedev(*major, *minor);

        tracing::debug!(device = %name, major, minor, "Creating device node");

        // Requires CAP_MKNOD, which a user namespace never grants
        if let Err(e) = mknodat(
            rustix::fs::CWD,
            &path,
            FileType::CharacterDevice,
            Mode::from_raw_mode(*mode),
            dev_num,
        ) {
            if e != rustix::io::Errno::PERM {
                tracing::warn!(device = %name, error = %e, "Failed to create device node");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn setup_dev_creates_links() {
        let temp = tempdir().unwrap();
        setup_dev(temp.path()).unwrap();

        let dev = temp.path().join("dev");
        assert_eq!(
            std::fs::read_link(dev.join("fd")).unwrap(),
            Path::new("/proc/self/fd")
        );
        assert_eq!(
            std::fs::read_link(dev.join("ptmx")).unwrap(),
            Path::new("pts/ptmx")
        );
        assert!(dev.join("pts").is_dir());

        // Idempotent
        setup_dev(temp.path()).unwrap();
    }
}
