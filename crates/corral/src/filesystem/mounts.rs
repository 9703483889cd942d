#![allow(unsafe_code)]
//! Mount operations.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use corral_oci::runtime::Mount;

/// Parsed OCI mount options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// `MS_*` flags for the mount itself.
    pub flags: libc::c_ulong,
    /// Propagation flags applied after mounting.
    pub propagation: libc::c_ulong,
    /// Filesystem-specific data, comma separated.
    pub data: String,
}

impl MountOptions {
    /// Parse `mount(8)` style option strings.
    #[must_use]
    pub fn parse(options: &[String]) -> Self {
        let mut parsed = Self::default();
        let mut data = Vec::new();

        for option in options {
            if let Some((clear, flag)) = flag_option(option) {
                if clear {
                    parsed.flags &= !flag;
                } else {
                    parsed.flags |= flag;
                }
            } else if let Some(flag) = propagation_option(option) {
                parsed.propagation |= flag;
            } else {
                data.push(option.as_str());
            }
        }

        parsed.data = data.join(",");
        parsed
    }

    /// Returns true for bind and rbind mounts.
    #[must_use]
    pub const fn is_bind(&self) -> bool {
        self.flags & libc::MS_BIND != 0
    }
}

fn flag_option(option: &str) -> Option<(bool, libc::c_ulong)> {
    let entry = match option {
        "ro" => (false, libc::MS_RDONLY),
        "rw" => (true, libc::MS_RDONLY),
        "nosuid" => (false, libc::MS_NOSUID),
        "suid" => (true, libc::MS_NOSUID),
        "nodev" => (false, libc::MS_NODEV),
        "dev" => (true, libc::MS_NODEV),
        "noexec" => (false, libc::MS_NOEXEC),
        "exec" => (true, libc::MS_NOEXEC),
        "sync" => (false, libc::MS_SYNCHRONOUS),
        "async" => (true, libc::MS_SYNCHRONOUS),
        "noatime" => (false, libc::MS_NOATIME),
        "atime" => (true, libc::MS_NOATIME),
        "nodiratime" => (false, libc::MS_NODIRATIME),
        "diratime" => (true, libc::MS_NODIRATIME),
        "relatime" => (false, libc::MS_RELATIME),
        "norelatime" => (true, libc::MS_RELATIME),
        "strictatime" => (false, libc::MS_STRICTATIME),
        "nostrictatime" => (true, libc::MS_STRICTATIME),
        "bind" => (false, libc::MS_BIND),
        "rbind" => (false, libc::MS_BIND | libc::MS_REC),
        _ => return None,
    };
    Some(entry)
}

fn propagation_option(option: &str) -> Option<libc::c_ulong> {
    let flag = match option {
        "private" => libc::MS_PRIVATE,
        "rprivate" => libc::MS_PRIVATE | libc::MS_REC,
        "shared" => libc::MS_SHARED,
        "rshared" => libc::MS_SHARED | libc::MS_REC,
        "slave" => libc::MS_SLAVE,
        "rslave" => libc::MS_SLAVE | libc::MS_REC,
        "unbindable" => libc::MS_UNBINDABLE,
        "runbindable" => libc::MS_UNBINDABLE | libc::MS_REC,
        _ => return None,
    };
    Some(flag)
}

fn cstring(value: &[u8]) -> CorralResult<CString> {
    CString::new(value).map_err(|e| CorralError::InvalidArgument {
        message: format!("mount argument contains NUL: {e}"),
    })
}

/// Mount a filesystem with raw `MS_*` flags.
#[cfg(target_os = "linux")]
pub fn mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: &str,
) -> CorralResult<()> {
    tracing::debug!(
        source = ?source,
        target = %target.display(),
        fstype = ?fstype,
        flags,
        "Mounting filesystem"
    );

    let source_c = cstring(source.map_or(b"none".as_slice(), |p| p.as_os_str().as_bytes()))?;
    let target_c = cstring(target.as_os_str().as_bytes())?;
    let fstype_c = fstype.map(|t| cstring(t.as_bytes())).transpose()?;
    let data_c = cstring(data.as_bytes())?;

    // SAFETY: every pointer is a valid NUL-terminated string for the call.
    let rc = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            fstype_c.as_ref().map_or(std::ptr::null(), |t| t.as_ptr()),
            flags,
            if data.is_empty() {
                std::ptr::null()
            } else {
                data_c.as_ptr().cast()
            },
        )
    };

    if rc != 0 {
        return Err(CorralError::io_context(
            &format!("mount {}", target.display()),
            std::io::Error::last_os_error(),
        ));
    }

    Ok(())
}

/// Lazily unmount a filesystem.
#[cfg(target_os = "linux")]
pub fn unmount_detach(target: &Path) -> CorralResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %target.display(), "Unmounting filesystem");

    unmount(target, UnmountFlags::DETACH)
        .map_err(|e| CorralError::io_context(&format!("umount {}", target.display()), e.into()))
}

/// Recursively mark every mount below `target` private.
#[cfg(target_os = "linux")]
pub fn make_rprivate(target: &Path) -> CorralResult<()> {
    mount(None, target, None, libc::MS_REC | libc::MS_PRIVATE, "")
}

/// Remount a bind mount read-only.
#[cfg(target_os = "linux")]
pub fn remount_readonly(target: &Path) -> CorralResult<()> {
    mount(
        None,
        target,
        None,
        libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
        "",
    )
}

/// Resolve a container path below the rootfs.
#[must_use]
pub fn container_path(rootfs: &Path, destination: &Path) -> PathBuf {
    rootfs.join(destination.strip_prefix("/").unwrap_or(destination))
}

/// Mount one bundle mount entry under `rootfs`.
#[cfg(target_os = "linux")]
pub fn mount_entry(rootfs: &Path, entry: &Mount) -> CorralResult<()> {
    let options = MountOptions::parse(&entry.options);
    let target = container_path(rootfs, &entry.destination);
    let fstype = entry
        .mount_type
        .as_deref()
        .filter(|t| *t != "bind" && !options.is_bind());

    let source_is_file = options.is_bind()
        && entry
            .source
            .as_deref()
            .is_some_and(|s| s.metadata().is_ok_and(|m| !m.is_dir()));

    if source_is_file {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            std::fs::File::create(&target)?;
        }
    } else {
        std::fs::create_dir_all(&target)?;
    }

    let source = entry.source.as_deref();
    if options.is_bind() {
        mount(source, &target, None, options.flags & (libc::MS_BIND | libc::MS_REC), "")?;
        let extra = options.flags & !(libc::MS_BIND | libc::MS_REC);
        if extra != 0 {
            mount(
                None,
                &target,
                None,
                libc::MS_BIND | libc::MS_REMOUNT | extra,
                "",
            )?;
        }
    } else {
        mount(source, &target, fstype, options.flags, &options.data)?;
    }

    if options.propagation != 0 {
        mount(None, &target, None, options.propagation, "")?;
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_entry(_rootfs: &Path, _entry: &Mount) -> CorralResult<()> {
    Err(CorralError::Unsupported {
        feature: "mounts".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parse_flags_and_data() {
        let parsed = MountOptions::parse(&opts(&["nosuid", "noexec", "mode=755", "size=65536k"]));
        assert_eq!(parsed.flags, libc::MS_NOSUID | libc::MS_NOEXEC);
        assert_eq!(parsed.propagation, 0);
        assert_eq!(parsed.data, "mode=755,size=65536k");
        assert!(!parsed.is_bind());
    }

    #[test]
    fn later_options_override_earlier() {
        let parsed = MountOptions::parse(&opts(&["ro", "rw"]));
        assert_eq!(parsed.flags & libc::MS_RDONLY, 0);
    }

    #[test]
    fn rbind_with_propagation() {
        let parsed = MountOptions::parse(&opts(&["rbind", "ro", "rslave"]));
        assert!(parsed.is_bind());
        assert_eq!(parsed.flags & libc::MS_REC, libc::MS_REC);
        assert_eq!(parsed.propagation, libc::MS_SLAVE | libc::MS_REC);
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn container_paths_stay_below_rootfs() {
        assert_eq!(
            container_path(Path::new("/rootfs"), Path::new("/dev/shm")),
            PathBuf::from("/rootfs/dev/shm")
        );
        assert_eq!(
            container_path(Path::new("/rootfs"), Path::new("run")),
            PathBuf::from("/rootfs/run")
        );
    }
}
