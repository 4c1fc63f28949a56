//! Access token command implementation.

use std::io::Write;

use coffer_core::{AccessToken, PermissionSet, ProjectId, TokenOptions, VaultConfig};
use tracing::info;

use crate::cli::TokenCommands;
use crate::error::CliError;
use crate::output::{OutputFormat, TokenOutput};

/// Handler for token subcommands.
pub struct TokenCommand<'a> {
    config: &'a VaultConfig,
}

impl<'a> TokenCommand<'a> {
    /// Creates a new token command handler.
    #[must_use]
    pub const fn new(config: &'a VaultConfig) -> Self {
        Self { config }
    }

    /// Executes the token subcommand.
    ///
    /// # Errors
    ///
    /// Returns error if the prefix is invalid or output fails.
    pub fn execute<W: Write>(
        &self,
        out: &mut W,
        format: &OutputFormat,
        command: &TokenCommands,
    ) -> Result<(), CliError> {
        match command {
            TokenCommands::Generate { prefix, name } => {
                self.generate(out, format, prefix.as_deref(), name)
            }
        }
    }

    fn generate<W: Write>(
        &self,
        out: &mut W,
        format: &OutputFormat,
        prefix: Option<&str>,
        name: &str,
    ) -> Result<(), CliError> {
        let prefix = match prefix {
            Some(prefix) => {
                self.config
                    .clone()
                    .with_token_prefix(prefix)
                    .validate()
                    .map_err(|e| CliError::InvalidArgument(e.to_string()))?;
                prefix
            }
            None => self.config.token_prefix.as_str(),
        };

        let (token, plaintext) = AccessToken::issue(
            ProjectId::new(),
            name,
            prefix,
            TokenOptions::new(PermissionSet::read_only()),
        );
        info!(token = %token.id, lookup = %token.prefix, "generated access token");

        format.write(
            out,
            &TokenOutput {
                id: token.id.to_string(),
                name: token.name.clone(),
                token: plaintext.expose().to_string(),
                lookup_prefix: token.prefix,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;

    fn generate(config: &VaultConfig, prefix: Option<&str>) -> Result<serde_json::Value, CliError> {
        let mut buf = Vec::new();
        TokenCommand::new(config).execute(
            &mut buf,
            &OutputFormat::new(Format::Json),
            &TokenCommands::Generate {
                prefix: prefix.map(str::to_string),
                name: "deploy".into(),
            },
        )?;
        Ok(serde_json::from_slice(&buf).expect("json"))
    }

    #[test]
    fn uses_configured_prefix() {
        let value = generate(&VaultConfig::default(), None).expect("generate");
        let token = value["token"].as_str().expect("token");
        assert!(token.starts_with("cft_"));
        assert!(token.starts_with(value["lookup_prefix"].as_str().expect("prefix")));
        assert_eq!(value["name"], "deploy");
    }

    #[test]
    fn explicit_prefix_overrides_config() {
        let value = generate(&VaultConfig::default(), Some("ci_")).expect("generate");
        assert!(value["token"].as_str().expect("token").starts_with("ci_"));
    }

    #[test]
    fn rejects_invalid_prefix() {
        let err = generate(&VaultConfig::default(), Some("Bad-Prefix")).expect_err("invalid");
        assert!(matches!(err, CliError::InvalidArgument(_)));
    }

    #[test]
    fn tokens_are_unique() {
        let config = VaultConfig::default();
        let a = generate(&config, None).expect("a");
        let b = generate(&config, None).expect("b");
        assert_ne!(a["token"], b["token"]);
    }
}
