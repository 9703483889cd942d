//! Service-manager readiness pass-through (`NOTIFY_SOCKET`).

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};

use super::Process;
use crate::runtime::ContainerConfig;

/// Environment variable naming the service manager's notification socket.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// The notification socket inherited from the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySocket {
    path: String,
}

impl NotifySocket {
    /// Read `NOTIFY_SOCKET` from the launcher's environment.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var(NOTIFY_SOCKET_ENV)
            .ok()
            .filter(|path| !path.is_empty())
            .map(|path| Self { path })
    }

    /// Socket address as given; a leading `@` names an abstract socket.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Abstract sockets live in the network namespace, not the filesystem.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.path.starts_with('@')
    }

    /// Make the socket reachable from inside the container.
    pub fn prepare_config(&self, config: &mut ContainerConfig) {
        if self.is_abstract() {
            return;
        }
        config.add_bind_mount(Path::new(&self.path));
    }

    /// Advertise the socket to the container process.
    pub fn prepare_process(&self, process: &mut Process) {
        process.push_env(NOTIFY_SOCKET_ENV, &self.path);
    }

    /// Tell the service manager which pid is the main process.
    pub fn notify_main_pid(&self, pid: i32) -> CorralResult<()> {
        self.send(&format!("MAINPID={pid}\n"))
    }

    fn send(&self, message: &str) -> CorralResult<()> {
        let socket =
            UnixDatagram::unbound().map_err(|e| CorralError::io_context("notify socket", e))?;

        let addr = match self.path.strip_prefix('@') {
            Some(name) => SocketAddr::from_abstract_name(name.as_bytes()),
            None => SocketAddr::from_pathname(PathBuf::from(&self.path)),
        }
        .map_err(|e| CorralError::io_context("notify socket address", e))?;

        socket
            .send_to_addr(message.as_bytes(), &addr)
            .map_err(|e| CorralError::io_context(&format!("notify {}", self.path), e))?;

        tracing::debug!(socket = %self.path, message = message.trim_end(), "Notified service manager");
        Ok(())
    }
}
