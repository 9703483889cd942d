//! OCI Runtime Specification types.
//!
//! Based on the OCI Runtime Specification v1.2.0:
//! <https://github.com/opencontainers/runtime-spec/blob/main/config.md>
//!
//! Only the fields the runtime acts on are modelled; unknown fields in a
//! bundle's `config.json` are ignored.

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use serde::{Deserialize, Serialize};

/// Name of the specification file inside a bundle.
pub const SPEC_FILE: &str = "config.json";

/// OCI Runtime Specification (config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// OCI version.
    #[serde(default = "default_oci_version")]
    pub oci_version: String,

    /// Container's root filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,

    /// Container process configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    /// Container hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Additional mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Linux-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

fn default_oci_version() -> String {
    "1.2.0".to_string()
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            oci_version: default_oci_version(),
            root: None,
            process: None,
            hostname: None,
            mounts: Vec::new(),
            linux: None,
        }
    }
}

impl Spec {
    /// Load `config.json` from a bundle directory.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] if the file is missing and
    /// [`CorralError::Serialization`] if it does not parse.
    pub fn load(bundle: &Path) -> CorralResult<Self> {
        let path = bundle.join(SPEC_FILE);
        let json = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CorralError::Config {
                message: format!("Bundle {SPEC_FILE} not found at {}", path.display()),
            },
            _ => CorralError::io_context(&format!("read {}", path.display()), e),
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// The process section, or a configuration error if the bundle has none.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] when `process` is absent.
    pub fn process(&self) -> CorralResult<&Process> {
        self.process.as_ref().ok_or_else(|| CorralError::Config {
            message: "No process config in spec".to_string(),
        })
    }
}

/// Root filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    /// Path to the root filesystem.
    pub path: PathBuf,

    /// Whether the root filesystem is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Whether to run with a terminal.
    #[serde(default)]
    pub terminal: bool,

    /// User to run as.
    #[serde(default)]
    pub user: User,

    /// Command arguments.
    pub args: Vec<String>,

    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Working directory.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,

    /// Resource limits (rlimits).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,

    /// No new privileges flag.
    #[serde(default)]
    pub no_new_privileges: bool,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

/// User and group IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID.
    #[serde(default)]
    pub uid: u32,
    /// Group ID.
    #[serde(default)]
    pub gid: u32,
    /// Additional group IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// Linux capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Bounding capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding: Vec<String>,
    /// Effective capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effective: Vec<String>,
    /// Inheritable capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritable: Vec<String>,
    /// Permitted capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permitted: Vec<String>,
    /// Ambient capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambient: Vec<String>,
}

/// Resource limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit type (e.g., `RLIMIT_NOFILE`).
    #[serde(rename = "type")]
    pub limit_type: String,
    /// Hard limit.
    pub hard: u64,
    /// Soft limit.
    pub soft: u64,
}

/// Mount configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Mount destination path (inside container).
    pub destination: PathBuf,
    /// Mount type (e.g., "bind", "tmpfs", "proc").
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Mount source path (outside container).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// UID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    /// Namespaces to create/join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    /// Cgroup path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    /// Resource limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

/// ID mapping for user/group namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    /// Container ID (start of range).
    pub container_id: u32,
    /// Host ID (start of range).
    pub host_id: u32,
    /// Size of the range.
    pub size: u32,
}

/// Namespace configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path to existing namespace (to join instead of create).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Namespace types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
}

impl NamespaceType {
    /// Name of the namespace link under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Mount => "mnt",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

/// Resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    /// Memory resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    /// PIDs limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsResources>,
}

/// CPU resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuResources {
    /// CPU shares (relative weight).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    /// CPU quota (in microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// CPU period (in microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

/// Memory resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryResources {
    /// Hard memory limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// PIDs resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsResources {
    /// Maximum number of PIDs.
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_default() {
        let spec = Spec::default();
        assert_eq!(spec.oci_version, "1.2.0");
        assert!(spec.root.is_none());
        assert!(spec.process().is_err());
    }

    #[test]
    fn parse_minimal_bundle_config() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "root": { "path": "rootfs" },
            "process": {
                "terminal": true,
                "user": { "uid": 1000, "gid": 1000 },
                "args": ["sh"],
                "env": ["PATH=/usr/bin:/bin"],
                "noNewPrivileges": true
            },
            "hostname": "box",
            "linux": {
                "namespaces": [{ "type": "pid" }, { "type": "network", "path": "/var/run/netns/x" }],
                "uidMappings": [{ "containerID": 0, "hostID": 100000, "size": 65536 }]
            },
            "annotations": { "ignored": "yes" }
        }"#;

        let spec: Spec = serde_json::from_str(json).unwrap();
        let process = spec.process().unwrap();
        assert!(process.terminal);
        assert_eq!(process.user.uid, 1000);
        assert_eq!(process.cwd, PathBuf::from("/"));
        assert!(process.no_new_privileges);

        let linux = spec.linux.unwrap();
        assert_eq!(linux.namespaces[0].ns_type, NamespaceType::Pid);
        assert_eq!(
            linux.namespaces[1].path.as_deref(),
            Some(Path::new("/var/run/netns/x"))
        );
        assert_eq!(linux.uid_mappings[0].host_id, 100_000);
    }

    #[test]
    fn load_reports_missing_config() {
        let temp = tempfile::tempdir().unwrap();
        let err = Spec::load(temp.path()).unwrap_err();
        assert!(matches!(err, CorralError::Config { .. }));
    }

    #[test]
    fn load_reads_bundle_config() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join(SPEC_FILE),
            r#"{"root":{"path":"rootfs","readonly":true},"process":{"args":["true"]}}"#,
        )
        .unwrap();

        let spec = Spec::load(temp.path()).unwrap();
        let root = spec.root.unwrap();
        assert!(root.readonly);
        assert_eq!(root.path, PathBuf::from("rootfs"));
    }

    #[test]
    fn namespace_type_serialization() {
        let ns = Namespace {
            ns_type: NamespaceType::Pid,
            path: None,
        };
        let json = serde_json::to_string(&ns).unwrap();
        assert!(json.contains("\"type\":\"pid\""));
        assert_eq!(NamespaceType::Network.proc_name(), "net");
    }
}
