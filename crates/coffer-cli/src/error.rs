//! CLI error types.

use std::fmt;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Invalid configuration.
    Config(String),
    /// Invalid argument.
    InvalidArgument(String),
    /// Output formatting error.
    Format(String),
    /// Vault operation failed.
    Vault(coffer_core::Error),
    /// IO error.
    Io(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Format(msg) => write!(f, "format error: {msg}"),
            Self::Vault(e) => write!(f, "vault error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Vault(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<coffer_core::Error> for CliError {
    fn from(err: coffer_core::Error) -> Self {
        match err {
            coffer_core::Error::InvalidOtpConfig { reason } => Self::InvalidArgument(reason),
            other => Self::Vault(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn cli_error_display_config() {
        let err = CliError::Config("missing file".into());
        assert_eq!(err.to_string(), "configuration error: missing file");
    }

    #[test]
    fn cli_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let cli_err = CliError::from(io_err);
        assert!(matches!(cli_err, CliError::Io(_)));
        assert!(cli_err.source().is_some());
    }

    #[test]
    fn otp_config_errors_become_invalid_arguments() {
        let err = CliError::from(coffer_core::Error::InvalidOtpConfig {
            reason: "seed is not valid base32".into(),
        });
        assert_eq!(err.to_string(), "invalid argument: seed is not valid base32");
    }

    #[test]
    fn vault_errors_keep_their_source() {
        let err = CliError::from(coffer_core::Error::NotFound {
            kind: "secret",
            id: "API_KEY".into(),
        });
        assert!(matches!(err, CliError::Vault(_)));
        assert_eq!(err.to_string(), "vault error: secret not found: API_KEY");
        assert!(err.source().is_some());
    }
}
