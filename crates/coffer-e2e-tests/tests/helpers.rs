//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::sync::Arc;

use coffer_core::{
    AuditFilter, Caller, LocalMasterKeyProvider, NewSecret, ProjectId, RequestContext, Secret,
    SecretName, SecretType, Vault, VaultConfig, VersionSummary,
};

/// Fixed master key for tests.
pub const MASTER_KEY: [u8; 32] = [42u8; 32];

/// A vault with one project, an API-key caller and the environment chain
/// `production > staging > development`.
pub struct TestVault {
    pub vault: Arc<Vault>,
    pub project: ProjectId,
    pub admin: Caller,
}

impl TestVault {
    /// Builds a vault with the default configuration.
    pub fn new() -> Self {
        Self::with_config(VaultConfig::default().with_mirror_audit_to_tracing(false))
    }

    /// Builds a vault with `config`.
    pub fn with_config(config: VaultConfig) -> Self {
        let provider = LocalMasterKeyProvider::from_bytes(&MASTER_KEY).expect("provider");
        let vault = Arc::new(Vault::new(config, Arc::new(provider)).expect("vault"));
        let (project, keys) = vault.create_project("e2e").expect("project");
        let admin = vault
            .authenticate(project.id, keys.api_key.expose(), RequestContext::now())
            .expect("admin caller");

        for (name, slug, parent) in [
            ("Production", "production", None),
            ("Staging", "staging", Some("production")),
            ("Development", "development", Some("staging")),
        ] {
            vault
                .create_environment(&admin, project.id, name, slug, parent)
                .expect("environment");
        }

        Self {
            vault,
            project: project.id,
            admin,
        }
    }

    /// Creates a root-level string secret.
    pub fn secret(&self, key: &str) -> Secret {
        self.typed_secret(key, SecretType::String)
    }

    /// Creates a root-level secret of `secret_type`.
    pub fn typed_secret(&self, key: &str, secret_type: SecretType) -> Secret {
        let name = SecretName::new(key).expect("secret name");
        self.vault
            .create_secret(&self.admin, self.project, NewSecret::new(name).of_type(secret_type))
            .expect("create secret")
    }

    /// Writes a value as the admin.
    pub fn write(&self, path: &str, env: &str, value: &str) -> VersionSummary {
        self.vault
            .set_value(&self.admin, self.project, path, env, value.as_bytes(), None)
            .expect("set value")
    }

    /// Reads a value as the admin.
    pub fn read(&self, path: &str, env: &str) -> String {
        let value = self
            .vault
            .get_value(&self.admin, self.project, path, env)
            .expect("get value");
        value.as_str().expect("utf8").to_string()
    }

    /// Number of audit records in the project.
    pub fn audit_count(&self) -> usize {
        self.vault
            .audit_trail(&self.admin, self.project, &AuditFilter::new())
            .expect("audit trail")
            .len()
    }

    /// The admin caller with a different request context.
    pub fn admin_with(&self, context: RequestContext) -> Caller {
        self.admin.clone().with_context(context)
    }
}
