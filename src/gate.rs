//! Host-version compatibility gate.
//!
//! Checked before any loading work so incompatible packages never pay load
//! cost. Bounds are closed-interval inclusive on both ends; an absent bound
//! is unconstrained in that direction.

use semver::Version;

use crate::error::{ActivationErrorKind, Stage};
use crate::manifest::ManifestDescriptor;

/// Returns true when `host` falls inside the manifest's declared range.
pub fn is_compatible(manifest: &ManifestDescriptor, host: &Version) -> bool {
    if let Some(min) = &manifest.min_host_version {
        if host < min {
            return false;
        }
    }
    if let Some(max) = &manifest.max_host_version {
        if host > max {
            return false;
        }
    }
    true
}

/// Gate check as a stage result for the lifecycle controller.
pub(crate) fn check(
    manifest: &ManifestDescriptor,
    host: &Version,
) -> Result<(), (Stage, ActivationErrorKind)> {
    if is_compatible(manifest, host) {
        Ok(())
    } else {
        Err((
            Stage::VersionGate,
            ActivationErrorKind::IncompatibleVersion {
                host: host.clone(),
                min: manifest.min_host_version.clone(),
                max: manifest.max_host_version.clone(),
            },
        ))
    }
}
