//! Vault configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::encryption::KeyAlgorithm;
use crate::error::{Error, Result};

/// Default number of versions re-encrypted per rotation batch.
pub const DEFAULT_ROTATION_BATCH_SIZE: usize = 100;

/// Default prefix of issued access tokens.
pub const DEFAULT_TOKEN_PREFIX: &str = "cft_";

/// Configuration for a [`Vault`](crate::Vault).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Cipher for new data keys.
    pub key_algorithm: KeyAlgorithm,
    /// Keep unwrapped data keys in memory.
    pub cache_data_keys: bool,
    /// Versions per rotation batch.
    pub rotation_batch_size: usize,
    /// TOTP steps accepted either side of now.
    pub totp_skew_steps: u32,
    /// HOTP verification lookahead.
    pub hotp_lookahead: u64,
    /// Mirror audit records to `tracing` under the `coffer_audit` target.
    pub mirror_audit_to_tracing: bool,
    /// Prefix of issued access tokens.
    pub token_prefix: String,
    /// JSON-lines audit file. In-memory when unset.
    pub audit_log_path: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_algorithm: KeyAlgorithm::default(),
            cache_data_keys: true,
            rotation_batch_size: DEFAULT_ROTATION_BATCH_SIZE,
            totp_skew_steps: 1,
            hotp_lookahead: 10,
            mirror_audit_to_tracing: true,
            token_prefix: DEFAULT_TOKEN_PREFIX.to_string(),
            audit_log_path: None,
        }
    }
}

impl VaultConfig {
    /// Loads a JSON or YAML (by extension) configuration file.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the file cannot be read or fails
    /// [`validate`](Self::validate), or [`Error::Serialization`] if it does
    /// not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&raw)?,
            _ => serde_json::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the cipher for new data keys.
    #[must_use]
    pub const fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    /// Enables or disables the data key cache.
    #[must_use]
    pub const fn with_cache_data_keys(mut self, enabled: bool) -> Self {
        self.cache_data_keys = enabled;
        self
    }

    /// Sets the rotation batch size.
    #[must_use]
    pub const fn with_rotation_batch_size(mut self, size: usize) -> Self {
        self.rotation_batch_size = size;
        self
    }

    /// Sets the TOTP skew.
    #[must_use]
    pub const fn with_totp_skew_steps(mut self, steps: u32) -> Self {
        self.totp_skew_steps = steps;
        self
    }

    /// Sets the HOTP lookahead.
    #[must_use]
    pub const fn with_hotp_lookahead(mut self, lookahead: u64) -> Self {
        self.hotp_lookahead = lookahead;
        self
    }

    /// Enables or disables the tracing mirror of the audit log.
    #[must_use]
    pub const fn with_mirror_audit_to_tracing(mut self, enabled: bool) -> Self {
        self.mirror_audit_to_tracing = enabled;
        self
    }

    /// Sets the access token prefix.
    #[must_use]
    pub fn with_token_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.token_prefix = prefix.into();
        self
    }

    /// Writes audit records to a JSON-lines file.
    #[must_use]
    pub fn with_audit_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log_path = Some(path.into());
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a zero batch size or skew, or a
    /// token prefix that is empty, longer than 8 characters or not
    /// `[a-z0-9_]`.
    pub fn validate(&self) -> Result<()> {
        if self.rotation_batch_size == 0 {
            return Err(Error::validation("rotation_batch_size must be at least 1"));
        }
        if self.totp_skew_steps == 0 {
            return Err(Error::validation("totp_skew_steps must be at least 1"));
        }
        let prefix_ok = !self.token_prefix.is_empty()
            && self.token_prefix.len() <= 8
            && self
                .token_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !prefix_ok {
            return Err(Error::validation(format!(
                "invalid token prefix '{}'",
                self.token_prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert_eq!(config.key_algorithm, KeyAlgorithm::Aes256Gcm);
        assert!(config.cache_data_keys);
        assert_eq!(config.rotation_batch_size, 100);
        assert_eq!(config.totp_skew_steps, 1);
        assert_eq!(config.hotp_lookahead, 10);
        assert!(config.mirror_audit_to_tracing);
        assert_eq!(config.token_prefix, "cft_");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = VaultConfig::default()
            .with_key_algorithm(KeyAlgorithm::ChaCha20Poly1305)
            .with_cache_data_keys(false)
            .with_rotation_batch_size(10)
            .with_totp_skew_steps(2)
            .with_hotp_lookahead(20)
            .with_mirror_audit_to_tracing(false)
            .with_token_prefix("tok_")
            .with_audit_log_path("/tmp/audit.jsonl");

        assert_eq!(config.key_algorithm, KeyAlgorithm::ChaCha20Poly1305);
        assert!(!config.cache_data_keys);
        assert_eq!(config.rotation_batch_size, 10);
        assert_eq!(config.totp_skew_steps, 2);
        assert_eq!(config.hotp_lookahead, 20);
        assert_eq!(config.token_prefix, "tok_");
        assert!(config.audit_log_path.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zeroes_and_bad_prefix() {
        assert!(VaultConfig::default().with_rotation_batch_size(0).validate().is_err());
        assert!(VaultConfig::default().with_totp_skew_steps(0).validate().is_err());
        assert!(VaultConfig::default().with_token_prefix("").validate().is_err());
        assert!(VaultConfig::default().with_token_prefix("BAD-").validate().is_err());
        assert!(VaultConfig::default()
            .with_token_prefix("muchtoolong_")
            .validate()
            .is_err());
    }

    #[test]
    fn test_load_json_with_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("tempfile");
        write!(file, r#"{{"key_algorithm": "chacha20-poly1305", "hotp_lookahead": 3}}"#)
            .expect("write");
        let config = VaultConfig::load(file.path()).expect("load");
        assert_eq!(config.key_algorithm, KeyAlgorithm::ChaCha20Poly1305);
        assert_eq!(config.hotp_lookahead, 3);
        assert_eq!(config.rotation_batch_size, 100);
    }

    #[test]
    fn test_load_yaml_and_validate() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "rotation_batch_size: 0").expect("write");
        assert!(matches!(
            VaultConfig::load(file.path()),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(VaultConfig::load("/nonexistent/coffer.json").is_err());
    }
}
