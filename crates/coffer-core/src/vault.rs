//! The vault operation surface.
//!
//! Every operation runs in the same order: authorize the [`Caller`], run the
//! store operation, write exactly one audit record. A denied caller gets an
//! `access_denied` record and [`Error::Forbidden`]; a failed operation gets a
//! record with `success = false`. If the audit sink rejects the record of a
//! successful operation the operation reports [`Error::Audit`].

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::access::{
    policies_allow, AccessPolicy, AccessToken, Principal, RequestContext, TokenOptions,
    TokenRegistry,
};
use crate::audit::{
    AuditAction, AuditFilter, AuditLog, AuditRecord, AuditSink, JsonLinesAuditSink,
    MemoryAuditSink, ResourceType,
};
use crate::config::VaultConfig;
use crate::encryption::Encryptor;
use crate::environment::{Environment, EnvironmentGraph};
use crate::error::{Error, Result};
use crate::formats::{self, ExportFormat};
use crate::keys::{KeyManager, MasterKeyProvider, RotationOptions, RotationReport};
use crate::otp::OtpEngine;
use crate::store::{
    CredentialInput, ImportReport, NewSecret, OtpCheck, OtpCode, ResolvedValue, Secret,
    SecretStore,
};
use crate::types::{
    secret_path, Actor, ActorType, Permission, PlaintextCredential, Project, ProjectId, ProjectKeys,
    SecretValue, TokenId,
};
use crate::versions::VersionSummary;

/// Environment and path placeholder for operations that span a whole
/// project. Only grants without environment or path restrictions cover it.
pub const ANY: &str = "*";

/// What authorizes a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// A registered access token. Re-read on every check so revocation
    /// takes effect immediately.
    Token(TokenId),
    /// The principals a caller acts as, evaluated against project policies.
    Policies(Vec<Principal>),
    /// The project API key. Full access to that project.
    ProjectKey(ProjectId),
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Authorization source.
    pub grant: Grant,
    /// Audit attribution.
    pub actor: Actor,
    /// Request facts for conditions and audit.
    pub context: RequestContext,
}

impl Caller {
    /// A caller acting as `principals`.
    #[must_use]
    pub fn principals(actor: Actor, principals: Vec<Principal>) -> Self {
        Self {
            grant: Grant::Policies(principals),
            actor,
            context: RequestContext::now(),
        }
    }

    /// Replaces the request context.
    #[must_use]
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

/// A multi-tenant secrets vault.
pub struct Vault {
    config: VaultConfig,
    keys: Arc<KeyManager>,
    store: Arc<SecretStore>,
    audit: AuditLog,
    tokens: TokenRegistry,
    policies: RwLock<Vec<AccessPolicy>>,
    projects: RwLock<HashMap<ProjectId, Project>>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("config", &self.config)
            .field("projects", &self.projects.read().len())
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Creates a vault. Audit records go to the configured JSON-lines file,
    /// or to memory when none is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the audit file
    /// cannot be opened.
    pub fn new(config: VaultConfig, provider: Arc<dyn MasterKeyProvider>) -> Result<Self> {
        let sink: Arc<dyn AuditSink> = match &config.audit_log_path {
            Some(path) => Arc::new(JsonLinesAuditSink::open(path)?),
            None => Arc::new(MemoryAuditSink::new()),
        };
        Self::with_audit_sink(config, provider, sink)
    }

    /// Creates a vault over an explicit audit sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the configuration is invalid.
    pub fn with_audit_sink(
        config: VaultConfig,
        provider: Arc<dyn MasterKeyProvider>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let mut keys = KeyManager::new(provider, config.key_algorithm);
        if !config.cache_data_keys {
            keys = keys.without_cache();
        }
        let keys = Arc::new(keys);
        let store = Arc::new(SecretStore::new(
            Encryptor::new(Arc::clone(&keys)),
            Arc::new(EnvironmentGraph::new()),
            OtpEngine::new(config.totp_skew_steps, config.hotp_lookahead),
        ));
        let audit = AuditLog::new(sink).with_tracing_mirror(config.mirror_audit_to_tracing);
        Ok(Self {
            config,
            keys,
            store,
            audit,
            tokens: TokenRegistry::new(),
            policies: RwLock::new(Vec::new()),
            projects: RwLock::new(HashMap::new()),
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// The underlying store. Bypasses authorization and audit.
    #[must_use]
    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    /// The key manager.
    #[must_use]
    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// The environment graph.
    #[must_use]
    pub fn environments(&self) -> &Arc<EnvironmentGraph> {
        self.store.environments()
    }

    /// The audit log.
    #[must_use]
    pub const fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // ===================
    // Projects and callers
    // ===================

    /// Creates a project with its first data key. The returned keys are
    /// shown once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty name.
    pub fn create_project(&self, name: &str) -> Result<(Project, ProjectKeys)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("project name cannot be empty"));
        }
        let (project, keys) = Project::create(name);
        self.keys.create_key(project.id)?;
        self.projects.write().insert(project.id, project.clone());
        info!(project = %project.id, name = %project.name, "created project");
        Ok((project, keys))
    }

    /// Looks up a project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown project.
    pub fn project(&self, id: ProjectId) -> Result<Project> {
        self.projects
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("project", id))
    }

    /// Resolves a presented bearer credential (project API key or access
    /// token) into a caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] for an unknown credential, after
    /// auditing the attempt.
    pub fn authenticate(
        &self,
        project: ProjectId,
        presented: &str,
        context: RequestContext,
    ) -> Result<Caller> {
        let known = self.project(project)?;
        if known.verify_api_key(presented) {
            return Ok(Caller {
                grant: Grant::ProjectKey(project),
                actor: Actor {
                    actor_type: ActorType::ApiKey,
                    id: project.to_string(),
                    name: Some(known.name),
                },
                context,
            });
        }
        if let Some(token) = self.tokens.authenticate(project, presented) {
            return Ok(Caller {
                grant: Grant::Token(token.id),
                actor: Actor::token(token.id, token.name),
                context,
            });
        }

        let reason = "unrecognized credential";
        warn!(project = %project, ip = ?context.ip, "{reason}");
        let anonymous = Actor {
            actor_type: ActorType::Token,
            id: "unknown".to_string(),
            name: None,
        };
        self.audit.record(
            AuditRecord::new(project, AuditAction::AccessDenied, ResourceType::AccessToken, anonymous)
                .with_ip(context.ip_addr())
                .with_user_agent(context.user_agent.clone())
                .failed(reason),
        )?;
        Err(Error::Forbidden {
            reason: reason.to_string(),
        })
    }

    fn allowed(
        &self,
        caller: &Caller,
        project: ProjectId,
        permission: Permission,
        env_slug: &str,
        path: &str,
    ) -> bool {
        match &caller.grant {
            Grant::ProjectKey(granted) => *granted == project,
            Grant::Token(id) => self.tokens.get(*id).is_some_and(|token| {
                token.project == project
                    && token.authorize_request(permission, env_slug, path, &caller.context)
            }),
            Grant::Policies(principals) => {
                let scoped: Vec<AccessPolicy> = self
                    .policies
                    .read()
                    .iter()
                    .filter(|p| p.project == project)
                    .cloned()
                    .collect();
                policies_allow(&scoped, principals, permission, env_slug, path, &caller.context)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn guard(
        &self,
        caller: &Caller,
        project: ProjectId,
        permission: Permission,
        env_slug: &str,
        path: &str,
        action: AuditAction,
        resource_type: ResourceType,
    ) -> Result<()> {
        if self.allowed(caller, project, permission, env_slug, path) {
            if let Grant::Token(id) = &caller.grant {
                self.tokens.record_use(*id, caller.context.now);
            }
            return Ok(());
        }

        let reason = format!("{} lacks {permission} on '{path}' in '{env_slug}'", caller.actor);
        warn!(
            project = %project,
            actor = %caller.actor,
            action = action.as_str(),
            permission = %permission,
            path,
            environment = env_slug,
            "access denied"
        );
        if permission == Permission::Read && resource_type == ResourceType::Secret {
            self.audit.log_access(
                project,
                path,
                env_slug,
                &caller.actor,
                caller.context.ip_addr(),
                false,
                Some(&reason),
            )?;
        } else {
            self.audit.record(
                self.base_record(caller, project, AuditAction::AccessDenied, resource_type)
                    .with_path(path)
                    .with_environment(env_slug)
                    .with_metadata("attempted", action.as_str())
                    .failed(reason.clone()),
            )?;
        }
        Err(Error::Forbidden { reason })
    }

    fn base_record(
        &self,
        caller: &Caller,
        project: ProjectId,
        action: AuditAction,
        resource_type: ResourceType,
    ) -> AuditRecord {
        AuditRecord::new(project, action, resource_type, caller.actor.clone())
            .with_ip(caller.context.ip_addr())
            .with_user_agent(caller.context.user_agent.clone())
    }

    fn secret_record(
        &self,
        caller: &Caller,
        project: ProjectId,
        action: AuditAction,
        path: &str,
        env_slug: &str,
    ) -> AuditRecord {
        self.base_record(caller, project, action, ResourceType::Secret)
            .with_path(path)
            .with_environment(env_slug)
    }

    /// Writes the single audit record of an operation.
    fn finish<T>(
        &self,
        record: AuditRecord,
        result: Result<T>,
        annotate: impl FnOnce(AuditRecord, &T) -> AuditRecord,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                self.audit.record(annotate(record, &value))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(audit_err) = self.audit.record(record.failed(err.to_string())) {
                    warn!(error = %audit_err, operation_error = %err, "could not audit failed operation");
                }
                Err(err)
            }
        }
    }

    fn environment(&self, project: ProjectId, slug: &str) -> Result<Environment> {
        self.environments()
            .find_by_slug(project, slug)
            .ok_or_else(|| Error::not_found("environment", slug))
    }

    fn live_secret(&self, project: ProjectId, path: &str) -> Result<Secret> {
        self.store
            .find_by_path(project, path)
            .filter(|s| !s.archived)
            .ok_or_else(|| Error::not_found("secret", path))
    }

    fn any_secret(&self, project: ProjectId, path: &str) -> Result<Secret> {
        self.store
            .find_by_path(project, path)
            .ok_or_else(|| Error::not_found("secret", path))
    }

    // ===================
    // Secrets
    // ===================

    /// Creates a secret.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `write` on the path, otherwise as
    /// [`SecretStore::create_secret`].
    pub fn create_secret(&self, caller: &Caller, project: ProjectId, new: NewSecret) -> Result<Secret> {
        let path = secret_path(new.folder.as_deref(), &new.key)?;
        self.guard(caller, project, Permission::Write, ANY, &path, AuditAction::SecretCreate, ResourceType::Secret)?;
        let result = self.store.create_secret(project, new, &caller.actor);
        self.finish(
            self.base_record(caller, project, AuditAction::SecretCreate, ResourceType::Secret)
                .with_path(&path),
            result,
            |record, secret| {
                record
                    .with_resource_id(secret.id)
                    .with_metadata("type", secret.secret_type.as_str())
            },
        )
    }

    /// Resolves a value with its provenance, falling back through ancestor
    /// environments.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `read`; [`Error::NotFound`] if nothing
    /// resolves.
    pub fn resolve_value(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
    ) -> Result<ResolvedValue> {
        self.guard(caller, project, Permission::Read, env_slug, path, AuditAction::SecretRead, ResourceType::Secret)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let secret = self.live_secret(project, path)?;
            self.store.resolve_value(project, secret.id, env.id)
        });
        self.finish(
            self.secret_record(caller, project, AuditAction::SecretRead, path, env_slug),
            result,
            |record, resolved| {
                record
                    .with_resource_id(resolved.version.secret)
                    .with_metadata("version", resolved.version.version)
                    .with_metadata("source_environment", resolved.source_environment.to_string())
            },
        )
    }

    /// Resolves a value.
    ///
    /// # Errors
    ///
    /// As [`resolve_value`](Self::resolve_value).
    pub fn get_value(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
    ) -> Result<SecretValue> {
        self.resolve_value(caller, project, path, env_slug)
            .map(|resolved| resolved.value)
    }

    /// Writes a new current version.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `write`, otherwise as
    /// [`SecretStore::set_value`].
    #[allow(clippy::too_many_arguments)]
    pub fn set_value(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
        plaintext: &[u8],
        note: Option<&str>,
    ) -> Result<VersionSummary> {
        self.guard(caller, project, Permission::Write, env_slug, path, AuditAction::SecretWrite, ResourceType::Secret)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let secret = self.live_secret(project, path)?;
            self.store
                .set_value(project, secret.id, env.id, plaintext, &caller.actor, note)
        });
        self.finish(
            self.secret_record(caller, project, AuditAction::SecretWrite, path, env_slug),
            result,
            annotate_version,
        )
    }

    /// Restores `target_version` as a new current version.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `write`; [`Error::NotFound`] for an
    /// unknown version.
    pub fn rollback(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
        target_version: u32,
    ) -> Result<VersionSummary> {
        self.guard(caller, project, Permission::Write, env_slug, path, AuditAction::SecretRollback, ResourceType::Secret)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let secret = self.live_secret(project, path)?;
            self.store
                .rollback(project, secret.id, env.id, target_version, &caller.actor)
        });
        self.finish(
            self.secret_record(caller, project, AuditAction::SecretRollback, path, env_slug)
                .with_metadata("target_version", target_version),
            result,
            annotate_version,
        )
    }

    /// Archives a secret.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `delete`.
    pub fn archive(&self, caller: &Caller, project: ProjectId, path: &str) -> Result<Secret> {
        self.guard(caller, project, Permission::Delete, ANY, path, AuditAction::SecretArchive, ResourceType::Secret)?;
        let result = self
            .live_secret(project, path)
            .and_then(|secret| self.store.archive(project, secret.id));
        self.finish(
            self.base_record(caller, project, AuditAction::SecretArchive, ResourceType::Secret)
                .with_path(path),
            result,
            |record, secret| record.with_resource_id(secret.id),
        )
    }

    /// Restores an archived secret.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `delete`.
    pub fn restore(&self, caller: &Caller, project: ProjectId, path: &str) -> Result<Secret> {
        self.guard(caller, project, Permission::Delete, ANY, path, AuditAction::SecretRestore, ResourceType::Secret)?;
        let result = self
            .any_secret(project, path)
            .and_then(|secret| self.store.restore(project, secret.id));
        self.finish(
            self.base_record(caller, project, AuditAction::SecretRestore, ResourceType::Secret)
                .with_path(path),
            result,
            |record, secret| record.with_resource_id(secret.id),
        )
    }

    /// Version history of a secret in an environment, newest first.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `read`.
    pub fn list_versions(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
    ) -> Result<Vec<VersionSummary>> {
        self.guard(caller, project, Permission::Read, env_slug, path, AuditAction::VersionsList, ResourceType::Secret)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let secret = self.any_secret(project, path)?;
            self.store.list_versions(project, secret.id, env.id)
        });
        self.finish(
            self.secret_record(caller, project, AuditAction::VersionsList, path, env_slug),
            result,
            |record, versions| record.with_metadata("count", versions.len()),
        )
    }

    // ===================
    // Credentials and OTP
    // ===================

    /// Writes a credential version.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `write`, otherwise as
    /// [`SecretStore::set_credential`].
    #[allow(clippy::too_many_arguments)]
    pub fn set_credential(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
        input: &CredentialInput,
        note: Option<&str>,
    ) -> Result<VersionSummary> {
        self.guard(caller, project, Permission::Write, env_slug, path, AuditAction::CredentialWrite, ResourceType::Secret)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let secret = self.live_secret(project, path)?;
            self.store
                .set_credential(project, secret.id, env.id, input, &caller.actor, note)
        });
        self.finish(
            self.secret_record(caller, project, AuditAction::CredentialWrite, path, env_slug),
            result,
            |record, version| {
                annotate_version(record, version).with_metadata("has_otp_seed", version.has_otp_seed)
            },
        )
    }

    /// Generates an OTP code at the caller's request time.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `read`; [`Error::InvalidOtpConfig`] if
    /// the secret has no generator.
    pub fn generate_otp(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
    ) -> Result<OtpCode> {
        self.guard(caller, project, Permission::Read, env_slug, path, AuditAction::OtpGenerate, ResourceType::Secret)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let secret = self.live_secret(project, path)?;
            self.store
                .generate_otp(project, secret.id, env.id, caller.context.now)
        });
        self.finish(
            self.secret_record(caller, project, AuditAction::OtpGenerate, path, env_slug),
            result,
            |record, code| match code {
                OtpCode::Totp(_) => record.with_metadata("kind", "totp"),
                OtpCode::Hotp(h) => record
                    .with_metadata("kind", "hotp")
                    .with_metadata("counter", h.counter),
            },
        )
    }

    /// Verifies an OTP code. A rejected code is a successful operation with
    /// `valid = false`.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `read`; [`Error::InvalidOtpConfig`] if
    /// the secret has no generator.
    pub fn verify_otp(
        &self,
        caller: &Caller,
        project: ProjectId,
        path: &str,
        env_slug: &str,
        code: &str,
    ) -> Result<OtpCheck> {
        self.guard(caller, project, Permission::Read, env_slug, path, AuditAction::OtpVerify, ResourceType::Secret)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let secret = self.live_secret(project, path)?;
            self.store
                .verify_otp(project, secret.id, env.id, code, caller.context.now)
        });
        self.finish(
            self.secret_record(caller, project, AuditAction::OtpVerify, path, env_slug),
            result,
            |record, check| record.with_metadata("valid", check.valid),
        )
    }

    // ===================
    // Environments
    // ===================

    /// Creates an environment under an optional parent slug.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `admin` on the new slug, otherwise as
    /// [`EnvironmentGraph::create`].
    pub fn create_environment(
        &self,
        caller: &Caller,
        project: ProjectId,
        name: &str,
        slug: &str,
        parent_slug: Option<&str>,
    ) -> Result<Environment> {
        self.guard(caller, project, Permission::Admin, slug, ANY, AuditAction::EnvironmentCreate, ResourceType::Environment)?;
        let result = parent_slug
            .map(|parent| self.environment(project, parent).map(|env| env.id))
            .transpose()
            .and_then(|parent| self.environments().create(project, name, slug, parent));
        self.finish(
            self.base_record(caller, project, AuditAction::EnvironmentCreate, ResourceType::Environment)
                .with_environment(slug),
            result,
            |record, env| record.with_resource_id(env.id),
        )
    }

    /// Deletes an environment with no versions and no children.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `admin`;
    /// [`Error::HasDependentVersions`] while versions reference it.
    pub fn delete_environment(&self, caller: &Caller, project: ProjectId, slug: &str) -> Result<Environment> {
        self.guard(caller, project, Permission::Admin, slug, ANY, AuditAction::EnvironmentDelete, ResourceType::Environment)?;
        let result = self
            .environment(project, slug)
            .and_then(|env| self.store.delete_environment(project, env.id));
        self.finish(
            self.base_record(caller, project, AuditAction::EnvironmentDelete, ResourceType::Environment)
                .with_environment(slug),
            result,
            |record, env| record.with_resource_id(env.id),
        )
    }

    // ===================
    // Keys
    // ===================

    fn run_rotation(&self, project: ProjectId, cancel: CancellationToken) -> Result<RotationReport> {
        let options = RotationOptions::new(self.config.rotation_batch_size).with_cancel(cancel);
        self.keys.rotate_key(project, self.store.as_ref(), &options)
    }

    /// Rotates the project's data key and re-encrypts every version.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without project-wide `admin`.
    pub fn rotate_key(&self, caller: &Caller, project: ProjectId) -> Result<RotationReport> {
        self.guard(caller, project, Permission::Admin, ANY, ANY, AuditAction::KeyRotate, ResourceType::EncryptionKey)?;
        let result = self.run_rotation(project, CancellationToken::new());
        self.finish(
            self.base_record(caller, project, AuditAction::KeyRotate, ResourceType::EncryptionKey),
            result,
            annotate_rotation,
        )
    }

    /// Runs [`rotate_key`](Self::rotate_key) on a background thread.
    /// Authorization happens before the thread starts; cancelling `cancel`
    /// stops migration between versions.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without project-wide `admin`, or
    /// [`Error::ExternalUnavailable`] if the thread cannot be spawned.
    pub fn spawn_key_rotation(
        self: &Arc<Self>,
        caller: &Caller,
        project: ProjectId,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<RotationReport>>> {
        self.guard(caller, project, Permission::Admin, ANY, ANY, AuditAction::KeyRotate, ResourceType::EncryptionKey)?;
        let vault = Arc::clone(self);
        let record = self
            .base_record(caller, project, AuditAction::KeyRotate, ResourceType::EncryptionKey)
            .with_metadata("background", true);
        std::thread::Builder::new()
            .name("coffer-key-rotation".to_string())
            .spawn(move || {
                let result = vault.run_rotation(project, cancel);
                vault.finish(record, result, annotate_rotation)
            })
            .map_err(|e| Error::ExternalUnavailable {
                reason: format!("cannot spawn rotation thread: {e}"),
            })
    }

    /// Finishes rotations left in `rotating` by a cancelled or failed run.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without project-wide `admin`.
    pub fn resume_rotation(&self, caller: &Caller, project: ProjectId) -> Result<Vec<RotationReport>> {
        self.guard(caller, project, Permission::Admin, ANY, ANY, AuditAction::KeyRotate, ResourceType::EncryptionKey)?;
        let options = RotationOptions::new(self.config.rotation_batch_size);
        let result = self
            .keys
            .resume_rotation(project, self.store.as_ref(), &options);
        self.finish(
            self.base_record(caller, project, AuditAction::KeyRotate, ResourceType::EncryptionKey)
                .with_metadata("resumed", true),
            result,
            |record, reports| record.with_metadata("keys", reports.len()),
        )
    }

    // ===================
    // Tokens and policies
    // ===================

    /// Issues an access token. The plaintext is returned once.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without project-wide `admin`;
    /// [`Error::Validation`] for an invalid path glob.
    pub fn issue_token(
        &self,
        caller: &Caller,
        project: ProjectId,
        name: &str,
        options: TokenOptions,
    ) -> Result<(AccessToken, PlaintextCredential)> {
        self.guard(caller, project, Permission::Admin, ANY, ANY, AuditAction::TokenCreate, ResourceType::AccessToken)?;
        let result = validate_globs(&options.paths).map(|()| {
            let (token, plaintext) =
                AccessToken::issue(project, name, &self.config.token_prefix, options);
            self.tokens.insert(token.clone());
            (token, plaintext)
        });
        self.finish(
            self.base_record(caller, project, AuditAction::TokenCreate, ResourceType::AccessToken),
            result,
            |record, (token, _)| {
                record
                    .with_resource_id(token.id)
                    .with_metadata("name", token.name.clone())
            },
        )
    }

    /// Revokes an access token.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without project-wide `admin`;
    /// [`Error::NotFound`] for a token of another project.
    pub fn revoke_token(&self, caller: &Caller, project: ProjectId, token: TokenId) -> Result<()> {
        self.guard(caller, project, Permission::Admin, ANY, ANY, AuditAction::TokenRevoke, ResourceType::AccessToken)?;
        let result = match self.tokens.get(token) {
            Some(found) if found.project == project => self.tokens.revoke(token),
            _ => Err(Error::not_found("token", token)),
        };
        self.finish(
            self.base_record(caller, project, AuditAction::TokenRevoke, ResourceType::AccessToken)
                .with_resource_id(token),
            result,
            |record, _| record,
        )
    }

    /// Adds an access policy to its project.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without project-wide `admin`;
    /// [`Error::Validation`] for an invalid path glob.
    pub fn add_policy(&self, caller: &Caller, policy: AccessPolicy) -> Result<AccessPolicy> {
        let project = policy.project;
        self.guard(caller, project, Permission::Admin, ANY, ANY, AuditAction::PolicyCreate, ResourceType::AccessPolicy)?;
        let result = validate_globs(&policy.paths).map(|()| {
            self.policies.write().push(policy.clone());
            policy
        });
        self.finish(
            self.base_record(caller, project, AuditAction::PolicyCreate, ResourceType::AccessPolicy),
            result,
            |record, policy| {
                record
                    .with_resource_id(policy.id)
                    .with_metadata("principal", policy.principal.to_string())
            },
        )
    }

    // ===================
    // Bulk
    // ===================

    /// Renders every resolved value of an environment.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `read` on every path.
    pub fn export_environment(
        &self,
        caller: &Caller,
        project: ProjectId,
        env_slug: &str,
        format: ExportFormat,
    ) -> Result<Zeroizing<String>> {
        self.guard(caller, project, Permission::Read, env_slug, ANY, AuditAction::SecretsExport, ResourceType::Environment)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let entries = self.store.export_environment(project, env.id)?;
            let rendered = formats::render(format, &entries)?;
            Ok((entries.len(), rendered))
        });
        self.finish(
            self.base_record(caller, project, AuditAction::SecretsExport, ResourceType::Environment)
                .with_environment(env_slug)
                .with_metadata("format", format.as_str()),
            result,
            |record, (count, _)| record.with_metadata("count", *count),
        )
        .map(|(_, rendered)| rendered)
    }

    /// Parses `input` and writes each entry into an environment.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without `write` on every path;
    /// [`Error::Validation`] for malformed input.
    pub fn import_environment(
        &self,
        caller: &Caller,
        project: ProjectId,
        env_slug: &str,
        format: ExportFormat,
        input: &str,
    ) -> Result<ImportReport> {
        self.guard(caller, project, Permission::Write, env_slug, ANY, AuditAction::SecretsImport, ResourceType::Environment)?;
        let result = self.environment(project, env_slug).and_then(|env| {
            let entries = formats::parse(format, input)?;
            self.store
                .import_environment(project, env.id, &entries, &caller.actor)
        });
        self.finish(
            self.base_record(caller, project, AuditAction::SecretsImport, ResourceType::Environment)
                .with_environment(env_slug)
                .with_metadata("format", format.as_str()),
            result,
            |record, report| {
                record
                    .with_metadata("created", report.created)
                    .with_metadata("updated", report.updated)
                    .with_metadata("unchanged", report.unchanged)
            },
        )
    }

    /// Audit records of a project, newest first.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] without project-wide `admin`.
    pub fn audit_trail(
        &self,
        caller: &Caller,
        project: ProjectId,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        self.guard(caller, project, Permission::Admin, ANY, ANY, AuditAction::AuditQuery, ResourceType::Project)?;
        self.audit.query(&filter.clone().for_project(project))
    }
}

fn annotate_version(record: AuditRecord, version: &VersionSummary) -> AuditRecord {
    record
        .with_resource_id(version.secret)
        .with_metadata("version", version.version)
}

fn annotate_rotation(record: AuditRecord, report: &RotationReport) -> AuditRecord {
    record
        .with_resource_id(&report.new_key_id)
        .with_metadata("migrated", report.migrated)
        .with_metadata("failed", report.failed)
        .with_metadata("cancelled", report.cancelled)
        .with_metadata("old_key_retired", report.old_key_retired)
}

fn validate_globs(patterns: &[String]) -> Result<()> {
    for pattern in patterns {
        glob::Pattern::new(pattern)
            .map_err(|e| Error::validation(format!("invalid path glob '{pattern}': {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::LocalMasterKeyProvider;
    use crate::types::{PermissionSet, SecretName};

    fn vault() -> (Vault, Project, Caller) {
        let provider = LocalMasterKeyProvider::from_bytes(&[9u8; 32]).expect("provider");
        let vault = Vault::new(VaultConfig::default(), Arc::new(provider)).expect("vault");
        let (project, keys) = vault.create_project("acme").expect("project");
        let admin = vault
            .authenticate(project.id, keys.api_key.expose(), RequestContext::now())
            .expect("admin");
        vault
            .create_environment(&admin, project.id, "Production", "production", None)
            .expect("env");
        (vault, project, admin)
    }

    fn count(vault: &Vault, action: AuditAction) -> usize {
        vault
            .audit()
            .query(&AuditFilter::new().with_action(action))
            .expect("query")
            .len()
    }

    #[test]
    fn project_key_round_trip_audits_once_each() {
        let (vault, project, admin) = vault();
        vault
            .create_secret(&admin, project.id, NewSecret::new(SecretName::new("API_KEY").expect("name")))
            .expect("secret");
        vault
            .set_value(&admin, project.id, "API_KEY", "production", b"s3cret", None)
            .expect("set");
        let value = vault
            .get_value(&admin, project.id, "API_KEY", "production")
            .expect("get");
        assert_eq!(value.as_bytes(), b"s3cret");
        assert_eq!(count(&vault, AuditAction::SecretWrite), 1);
        assert_eq!(count(&vault, AuditAction::SecretRead), 1);
    }

    #[test]
    fn unknown_credential_is_denied_and_audited() {
        let (vault, project, _) = vault();
        let result = vault.authenticate(project.id, "cft_nope", RequestContext::now());
        assert!(matches!(result, Err(Error::Forbidden { .. })));
        assert_eq!(count(&vault, AuditAction::AccessDenied), 1);
    }

    #[test]
    fn revoked_token_stops_working() {
        let (vault, project, admin) = vault();
        let (token, plaintext) = vault
            .issue_token(&admin, project.id, "ci", TokenOptions::new(PermissionSet::read_only()))
            .expect("token");
        assert!(plaintext.expose().starts_with("cft_"));
        let caller = vault
            .authenticate(project.id, plaintext.expose(), RequestContext::now())
            .expect("token caller");
        vault.revoke_token(&admin, project.id, token.id).expect("revoke");
        let denied = vault.get_value(&caller, project.id, "ANY", "production");
        assert!(matches!(denied, Err(Error::Forbidden { .. })));
    }

    #[test]
    fn policy_callers_need_matching_policy() {
        let (vault, project, admin) = vault();
        let caller = Caller::principals(Actor::user("u1", "alice"), vec![Principal::user("u1")]);
        assert!(matches!(
            vault.get_value(&caller, project.id, "DB", "production"),
            Err(Error::Forbidden { .. })
        ));
        vault
            .add_policy(
                &admin,
                AccessPolicy::new(project.id, "readers", Principal::user("u1"), PermissionSet::read_only())
                    .with_paths(["DB*"]),
            )
            .expect("policy");
        assert!(matches!(
            vault.get_value(&caller, project.id, "DB", "production"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn invalid_globs_are_rejected() {
        let (vault, project, admin) = vault();
        let options = TokenOptions::new(PermissionSet::read_only()).paths(["[unclosed"]);
        assert!(matches!(
            vault.issue_token(&admin, project.id, "bad", options),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn cross_project_key_is_denied() {
        let (vault, _, admin) = vault();
        let (other, _) = vault.create_project("other").expect("project");
        assert!(matches!(
            vault.create_environment(&admin, other.id, "Dev", "dev", None),
            Err(Error::Forbidden { .. })
        ));
    }

    #[test]
    fn denied_audit_query_is_recorded() {
        let (vault, project, admin) = vault();
        let (_, plaintext) = vault
            .issue_token(&admin, project.id, "reader", TokenOptions::new(PermissionSet::read_only()))
            .expect("token");
        let reader = vault
            .authenticate(project.id, plaintext.expose(), RequestContext::now())
            .expect("reader");

        assert!(matches!(
            vault.audit_trail(&reader, project.id, &AuditFilter::new()),
            Err(Error::Forbidden { .. })
        ));
        let denied = vault
            .audit_trail(&admin, project.id, &AuditFilter::new().with_action(AuditAction::AccessDenied))
            .expect("admin query");
        assert_eq!(denied.len(), 1);
        assert!(!denied[0].success);
        assert_eq!(
            denied[0].metadata.get("attempted").and_then(serde_json::Value::as_str),
            Some("audit_query")
        );
    }
}
