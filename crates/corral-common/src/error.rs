//! Common error types for the Corral runtime.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CorralError`].
pub type CorralResult<T> = Result<T, CorralError>;

/// Common errors across the Corral runtime.
#[derive(Error, Diagnostic, Debug)]
pub enum CorralError {
    /// A caller-supplied argument is unusable (e.g. an empty container ID).
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(corral::invalid_argument))]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(corral::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// The container's root filesystem does not exist.
    #[error("rootfs ({}) does not exist", path.display())]
    #[diagnostic(
        code(corral::rootfs::not_found),
        help("Check root.path in the bundle's config.json")
    )]
    RootfsNotFound {
        /// The missing rootfs path.
        path: PathBuf,
    },

    /// A container with this ID already has persisted state.
    #[error("Container already exists: {id}")]
    #[diagnostic(
        code(corral::container::exists),
        help("Delete the existing container first or pick another ID")
    )]
    ContainerExists {
        /// The conflicting container ID.
        id: String,
    },

    /// The operation is not valid in the container's current state.
    #[error("Container {id} cannot {operation} (status: {status})")]
    #[diagnostic(code(corral::container::invalid_state))]
    InvalidState {
        /// The container ID.
        id: String,
        /// Current status.
        status: String,
        /// The attempted operation.
        operation: String,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(corral::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// The initialization routine failed inside the new namespaces.
    #[error("Container init failed: {cause}")]
    #[diagnostic(code(corral::bootstrap))]
    Bootstrap {
        /// The underlying cause reported by the init stage.
        cause: String,
    },

    /// The init stage neither replaced its image nor reported a failure.
    ///
    /// Isolation may not have been established; this is never retried.
    #[error("Init protocol violation: {message}")]
    #[diagnostic(
        code(corral::protocol_violation),
        severity(Error),
        help("The container may have run without full isolation; this is a bug")
    )]
    ProtocolViolation {
        /// Details reported by the init stage.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(corral::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(corral::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(corral::unsupported), help("Corral requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(corral::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(corral::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl CorralError {
    /// The error returned for an empty container identifier.
    #[must_use]
    pub fn empty_id() -> Self {
        Self::InvalidArgument {
            message: "container id cannot be empty".to_string(),
        }
    }

    /// Returns true for every "does not exist" flavour of error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ContainerNotFound { .. } | Self::RootfsNotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Wrap an I/O error with the operation that produced it.
    #[must_use]
    pub fn io_context(operation: &str, err: std::io::Error) -> Self {
        Self::Io(std::io::Error::new(
            err.kind(),
            format!("{operation}: {err}"),
        ))
    }
}

impl From<serde_json::Error> for CorralError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CorralError::ContainerNotFound {
            id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Container not found: abc123");
    }

    #[test]
    fn rootfs_display_quotes_path() {
        let err = CorralError::RootfsNotFound {
            path: PathBuf::from("/bundle/rootfs"),
        };
        assert_eq!(err.to_string(), "rootfs (/bundle/rootfs) does not exist");
        assert!(err.is_not_found());
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CorralError = io_err.into();
        assert!(matches!(err, CorralError::Io(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn io_context_keeps_kind() {
        let io_err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = CorralError::io_context("write pid file", io_err);
        match err {
            CorralError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied);
                assert!(e.to_string().starts_with("write pid file"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_id_is_invalid_argument() {
        assert!(matches!(
            CorralError::empty_id(),
            CorralError::InvalidArgument { .. }
        ));
        assert!(!CorralError::empty_id().is_not_found());
    }
}
