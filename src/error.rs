//! Error types for trust plane operations

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by trust-material operations.
///
/// Every variant names the artifact or operation that failed so the operator
/// can tell which step aborted. All of them abort the current operation; the
/// only non-fatal absence is the skip-on-export behavior of the zone encoder,
/// which never produces an error at all.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrustError {
    /// The crypto backend could not produce the requested key pair
    #[error("key generation failed for {artifact}: {reason}")]
    KeyGeneration { artifact: String, reason: String },

    /// A certificate or request could not be signed, or the signing key is unusable
    #[error("signing failed for {artifact}: {reason}")]
    Signing { artifact: String, reason: String },

    /// The certificate request could not be built from the given subject
    #[error("invalid certificate request for {subject:?}: {reason}")]
    Csr { subject: String, reason: String },

    /// An X.509 extension is inconsistent with the subject
    #[error("extension error for {subject:?}: {reason}")]
    Extension { subject: String, reason: String },

    /// A filesystem operation on the artifact store failed
    #[error("filesystem error on {}: {reason}", path.display())]
    Filesystem { path: PathBuf, reason: String },

    /// A backup snapshot could not be completed; nothing live was touched
    #[error("backup of {} failed: {reason}", path.display())]
    Backup { path: PathBuf, reason: String },

    /// An unrecognised rotation scope was requested
    #[error("unknown rotation scope {scope:?} (expected one of: cert, kex, all)")]
    UnknownScope { scope: String },

    /// An operation requires an artifact that does not exist
    #[error("{operation} requires {dependency}, which is not present")]
    MissingDependency { operation: String, dependency: String },

    /// A stored artifact could not be decoded
    #[error("cannot decode {artifact}: {reason}")]
    Encoding { artifact: String, reason: String },

    /// The configuration file is unreadable or malformed
    #[error("configuration error: {0}")]
    Config(String),

    /// A rotation stopped; carries which steps completed before the failure
    #[error(transparent)]
    Rotation(Box<crate::rotation::RotationFailure>),
}

impl From<crate::rotation::RotationFailure> for TrustError {
    fn from(failure: crate::rotation::RotationFailure) -> Self {
        Self::Rotation(Box::new(failure))
    }
}

/// Result type for trust plane operations
pub type Result<T> = std::result::Result<T, TrustError>;

impl TrustError {
    pub fn key_generation(artifact: impl Into<String>, reason: impl ToString) -> Self {
        Self::KeyGeneration {
            artifact: artifact.into(),
            reason: reason.to_string(),
        }
    }

    pub fn signing(artifact: impl Into<String>, reason: impl ToString) -> Self {
        Self::Signing {
            artifact: artifact.into(),
            reason: reason.to_string(),
        }
    }

    pub fn csr(subject: impl Into<String>, reason: impl ToString) -> Self {
        Self::Csr {
            subject: subject.into(),
            reason: reason.to_string(),
        }
    }

    pub fn extension(subject: impl Into<String>, reason: impl ToString) -> Self {
        Self::Extension {
            subject: subject.into(),
            reason: reason.to_string(),
        }
    }

    pub fn filesystem(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn backup(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::Backup {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn missing(operation: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            operation: operation.into(),
            dependency: dependency.into(),
        }
    }

    pub fn encoding(artifact: impl Into<String>, reason: impl ToString) -> Self {
        Self::Encoding {
            artifact: artifact.into(),
            reason: reason.to_string(),
        }
    }
}
