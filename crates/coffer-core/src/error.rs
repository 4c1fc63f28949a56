//! Error types for the vault core.

use thiserror::Error;

/// Errors that can occur in the vault core.
///
/// Authorization checks never produce an error themselves; they return a
/// boolean that the [`Vault`](crate::Vault) turns into [`Error::Forbidden`].
#[derive(Debug, Error)]
pub enum Error {
    /// A secret, environment, version, project or token does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Why the request was refused.
        reason: String,
    },

    /// Malformed input: key name, slug, folder, glob, time window.
    #[error("validation failed: {reason}")]
    Validation {
        /// What failed validation.
        reason: String,
    },

    /// OTP seed, digits, period or algorithm is unusable.
    #[error("invalid otp configuration: {reason}")]
    InvalidOtpConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// AEAD authentication failed or the payload cannot be opened.
    #[error("decryption failed: {reason}")]
    DecryptionError {
        /// The reason decryption failed.
        reason: String,
    },

    /// Encryption or key wrapping failed.
    #[error("encryption error: {reason}")]
    Encryption {
        /// The reason encryption failed.
        reason: String,
    },

    /// A data key referenced by a payload does not exist for the project.
    #[error("encryption key not found: {key_id}")]
    KeyNotFound {
        /// The missing key identifier.
        key_id: String,
    },

    /// A uniqueness or structural invariant would be violated.
    #[error("conflict: {reason}")]
    Conflict {
        /// The violated invariant.
        reason: String,
    },

    /// The environment still has versions and cannot be deleted.
    #[error("environment {environment} has dependent secret versions")]
    HasDependentVersions {
        /// Slug of the environment.
        environment: String,
    },

    /// An audit record was targeted by an update or delete.
    #[error("audit record {id} is immutable")]
    ImmutableRecord {
        /// The audit record identifier.
        id: String,
    },

    /// A collaborator outside the core is unavailable.
    #[error("external service unavailable: {reason}")]
    ExternalUnavailable {
        /// Details from the collaborator.
        reason: String,
    },

    /// The audit sink could not persist a record.
    #[error("audit sink failure: {reason}")]
    Audit {
        /// The reason the sink failed.
        reason: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {reason}")]
    Serialization {
        /// The reason serialization failed.
        reason: String,
    },
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub(crate) fn otp_config(reason: impl Into<String>) -> Self {
        Self::InvalidOtpConfig {
            reason: reason.into(),
        }
    }

    /// HTTP-equivalent status code for the API layer.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Forbidden { .. } => 403,
            Self::Validation { .. } | Self::InvalidOtpConfig { .. } => 422,
            Self::Conflict { .. } | Self::HasDependentVersions { .. } | Self::ImmutableRecord { .. } => 409,
            Self::ExternalUnavailable { .. } => 503,
            Self::DecryptionError { .. }
            | Self::Encryption { .. }
            | Self::KeyNotFound { .. }
            | Self::Audit { .. }
            | Self::Serialization { .. } => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn error_display_formats_correctly() {
        let err = Error::not_found("secret", "DB_PASSWORD");
        assert_eq!(err.to_string(), "secret not found: DB_PASSWORD");

        let err = Error::HasDependentVersions {
            environment: "staging".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "environment staging has dependent secret versions"
        );

        let err = Error::KeyNotFound {
            key_id: "k1".to_string(),
        };
        assert_eq!(err.to_string(), "encryption key not found: k1");
    }

    #[test_case(Error::not_found("secret", "X"), 404 ; "not found")]
    #[test_case(Error::Forbidden { reason: "no".into() }, 403 ; "forbidden")]
    #[test_case(Error::validation("bad key"), 422 ; "validation")]
    #[test_case(Error::otp_config("digits"), 422 ; "otp config")]
    #[test_case(Error::conflict("dup"), 409 ; "conflict")]
    #[test_case(Error::DecryptionError { reason: "tag".into() }, 500 ; "decryption")]
    #[test_case(Error::ExternalUnavailable { reason: "down".into() }, 503 ; "external")]
    fn status_code_mapping(err: Error, expected: u16) {
        assert_eq!(err.status_code(), expected);
    }
}
