//! # Coffer Core
//!
//! A multi-tenant secrets vault:
//!
//! - **Envelope encryption**: values are sealed with per-project data keys
//!   (AES-256-GCM or ChaCha20-Poly1305), data keys are wrapped by a
//!   [`MasterKeyProvider`]
//! - **Versioned secrets**: every write is a new version, rollback copies a
//!   prior version forward, values inherit through an environment tree
//! - **Access control**: scoped access tokens and principal policies with
//!   MFA, IP and time-window conditions
//! - **Audit logging**: one append-only record per operation
//! - **OTP**: TOTP/HOTP generators bound to credential secrets
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use coffer_core::{
//!     LocalMasterKeyProvider, NewSecret, RequestContext, SecretName, Vault, VaultConfig,
//! };
//!
//! let provider = LocalMasterKeyProvider::from_passphrase("correct horse", b"coffer-doc-salt")
//!     .expect("provider");
//! let vault = Vault::new(VaultConfig::default(), Arc::new(provider)).expect("vault");
//! let (project, keys) = vault.create_project("acme").expect("project");
//! let admin = vault
//!     .authenticate(project.id, keys.api_key.expose(), RequestContext::now())
//!     .expect("caller");
//!
//! vault
//!     .create_environment(&admin, project.id, "Production", "production", None)
//!     .expect("environment");
//! let name = SecretName::new("DATABASE_URL").expect("name");
//! vault.create_secret(&admin, project.id, NewSecret::new(name)).expect("secret");
//! vault
//!     .set_value(&admin, project.id, "DATABASE_URL", "production", b"postgres://db", None)
//!     .expect("write");
//!
//! let value = vault
//!     .get_value(&admin, project.id, "DATABASE_URL", "production")
//!     .expect("read");
//! assert_eq!(value.as_bytes(), b"postgres://db");
//! ```
//!
//! ## Security Considerations
//!
//! - Plaintext values, data keys and seeds use `zeroize` to clear memory on drop
//! - Token and key digests are compared in constant time
//! - Debug output for secrets and credentials is redacted

pub mod access;
pub mod audit;
pub mod config;
pub mod encryption;
pub mod environment;
pub mod error;
pub mod formats;
pub mod keys;
pub mod otp;
pub mod store;
pub mod types;
pub mod versions;
pub mod vault;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::{
    Actor, ActorType, EnvironmentId, KeyId, OtpAlgorithm, OtpKind, OtpSettings, Permission,
    PermissionSet, PlaintextCredential, Project, ProjectId, ProjectKeys, SecretId, SecretName,
    SecretType, SecretValue, TokenId, VersionId,
};

pub use access::{
    AccessPolicy, AccessToken, IpMatcher, PolicyConditions, Principal, PrincipalType,
    RequestContext, TimeWindow, TokenOptions,
};
pub use audit::{AuditAction, AuditFilter, AuditLog, AuditRecord, AuditSink, ResourceType};
pub use config::VaultConfig;
pub use encryption::{EncryptedPayload, Encryptor, KeyAlgorithm};
pub use environment::{Environment, EnvironmentGraph};
pub use formats::ExportFormat;
pub use keys::{KeyManager, LocalMasterKeyProvider, MasterKeyProvider, RotationReport};
pub use otp::OtpEngine;
pub use store::{CredentialInput, NewSecret, OtpCode, Secret, SecretStore};
pub use vault::{Caller, Grant, Vault};
pub use versions::VersionSummary;
