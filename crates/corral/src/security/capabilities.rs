//! Linux capabilities management.

use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use corral_common::{CorralError, CorralResult};
use corral_oci::runtime::Capabilities;

/// The five capability sets of the container process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Bounding set.
    pub bounding: CapsHashSet,
    /// Effective set.
    pub effective: CapsHashSet,
    /// Inheritable set.
    pub inheritable: CapsHashSet,
    /// Permitted set.
    pub permitted: CapsHashSet,
    /// Ambient set.
    pub ambient: CapsHashSet,
}

impl CapabilitySet {
    /// Parse capability names such as `CAP_CHOWN` from a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::InvalidArgument`] for an unknown name.
    pub fn from_spec(spec: &Capabilities) -> CorralResult<Self> {
        Ok(Self {
            bounding: parse_set(&spec.bounding)?,
            effective: parse_set(&spec.effective)?,
            inheritable: parse_set(&spec.inheritable)?,
            permitted: parse_set(&spec.permitted)?,
            ambient: parse_set(&spec.ambient)?,
        })
    }

    /// Drop every capability outside the bounding set.
    ///
    /// Must run while the process still holds `CAP_SETPCAP`.
    pub fn drop_bounding(&self) -> CorralResult<()> {
        for cap in caps::all() {
            if self.bounding.contains(&cap) {
                continue;
            }
            caps::drop(None, CapSet::Bounding, cap).map_err(|e| CorralError::Internal {
                message: format!("Failed to drop {cap} from bounding set: {e}"),
            })?;
        }
        tracing::debug!(kept = self.bounding.len(), "Dropped bounding capabilities");
        Ok(())
    }

    /// Install the effective, inheritable, permitted and ambient sets.
    ///
    /// Runs after the identity switch; effective is set first so it never
    /// exceeds the permitted set being narrowed.
    pub fn apply(&self) -> CorralResult<()> {
        tracing::debug!("Applying capability set");

        caps::set(None, CapSet::Effective, &self.effective).map_err(|e| {
            CorralError::Internal {
                message: format!("Failed to set effective caps: {e}"),
            }
        })?;

        caps::set(None, CapSet::Inheritable, &self.inheritable).map_err(|e| {
            CorralError::Internal {
                message: format!("Failed to set inheritable caps: {e}"),
            }
        })?;

        caps::set(None, CapSet::Permitted, &self.permitted).map_err(|e| {
            CorralError::Internal {
                message: format!("Failed to set permitted caps: {e}"),
            }
        })?;

        // Older kernels have no ambient set
        if let Err(e) = caps::set(None, CapSet::Ambient, &self.ambient) {
            tracing::warn!(error = %e, "Failed to set ambient caps");
        }

        Ok(())
    }
}

fn parse_set(names: &[String]) -> CorralResult<CapsHashSet> {
    names
        .iter()
        .map(|name| {
            Capability::from_str(name).map_err(|_| CorralError::InvalidArgument {
                message: format!("unknown capability {name:?}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_names() {
        let spec = Capabilities {
            bounding: vec!["CAP_CHOWN".into(), "CAP_KILL".into()],
            effective: vec!["CAP_KILL".into()],
            ..Capabilities::default()
        };

        let set = CapabilitySet::from_spec(&spec).unwrap();
        assert_eq!(set.bounding.len(), 2);
        assert!(set.effective.contains(&Capability::CAP_KILL));
        assert!(set.ambient.is_empty());
    }

    #[test]
    fn reject_unknown_name() {
        let spec = Capabilities {
            permitted: vec!["CAP_MAKE_COFFEE".into()],
            ..Capabilities::default()
        };

        let err = CapabilitySet::from_spec(&spec).unwrap_err();
        assert!(matches!(err, CorralError::InvalidArgument { .. }));
    }
}
