//! Container ID validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CorralError, CorralResult};

/// A validated container ID.
///
/// Container IDs must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
///
/// The ID doubles as a directory name under the state root, so anything
/// that could escape it (`/`, `..`) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::InvalidArgument`] if the ID is empty or malformed.
    pub fn new(id: impl Into<String>) -> CorralResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> CorralResult<()> {
        let Some(first) = id.chars().next() else {
            return Err(CorralError::empty_id());
        };

        let invalid = |reason: &str| CorralError::InvalidArgument {
            message: format!("invalid container id {id:?}: {reason}"),
        };

        if id.len() > Self::MAX_LENGTH {
            return Err(invalid("longer than 64 characters"));
        }
        if !first.is_ascii_alphanumeric() {
            return Err(invalid("must start with a letter or digit"));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(&format!("character {c:?} is not allowed")));
        }

        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
