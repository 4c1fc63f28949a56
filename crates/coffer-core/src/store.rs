//! Secret storage.
//!
//! [`SecretStore`] is the only path through which secret plaintext is read
//! or written. Values are encrypted before they reach the version table and
//! decrypted only on resolution. Mutations of a `(secret, environment)` pair
//! are serialized by a per-pair lock; the [`VersionTable`] rejects anything
//! that would break version numbering or the single-current rule.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::encryption::{EncryptedPayload, Encryptor, Rekeyer};
use crate::environment::{Environment, EnvironmentGraph};
use crate::error::{Error, Result};
use crate::keys::{MigrationOutcome, RotationTarget};
use crate::otp::{self, HotpCode, OtpEngine, TotpCode};
use crate::types::{
    secret_path, Actor, EnvironmentId, KeyId, OtpKind, OtpSettings, ProjectId, SecretId,
    SecretName, SecretType, SecretValue, VersionId,
};
use crate::versions::{PairKey, SecretVersion, VersionSummary, VersionTable};

/// Placeholder returned by [`SecretStore::preview`] when a value cannot be
/// decrypted.
pub const PREVIEW_UNAVAILABLE: &str = "[unavailable]";

/// A logical named value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Secret identifier.
    pub id: SecretId,
    /// Owning project.
    pub project: ProjectId,
    /// Canonical key.
    pub key: SecretName,
    /// Optional folder.
    pub folder: Option<String>,
    /// `folder/KEY`, unique per project.
    pub path: String,
    /// Value kind.
    pub secret_type: SecretType,
    /// Human description.
    pub description: Option<String>,
    /// Flat labels.
    pub tags: BTreeMap<String, String>,
    /// OTP parameters for credential, totp and hotp secrets.
    pub otp: Option<OtpSettings>,
    /// Archived secrets are hidden from listings and resolution.
    pub archived: bool,
    /// When the secret was archived.
    pub archived_at: Option<DateTime<Utc>>,
    /// Creator.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last metadata change.
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    /// Which OTP generator the secret is bound to.
    #[must_use]
    pub fn otp_kind(&self) -> OtpKind {
        match self.secret_type {
            SecretType::Totp => OtpKind::Totp,
            SecretType::Hotp => OtpKind::Hotp,
            SecretType::Credential => self.otp.as_ref().map_or(OtpKind::None, |s| s.kind),
            SecretType::String
            | SecretType::Json
            | SecretType::File
            | SecretType::Certificate => OtpKind::None,
        }
    }
}

/// Parameters for a new secret.
#[derive(Debug, Clone)]
pub struct NewSecret {
    /// Canonical key.
    pub key: SecretName,
    /// Optional folder.
    pub folder: Option<String>,
    /// Value kind.
    pub secret_type: SecretType,
    /// Human description.
    pub description: Option<String>,
    /// Flat labels.
    pub tags: BTreeMap<String, String>,
    /// OTP parameters.
    pub otp: Option<OtpSettings>,
}

impl NewSecret {
    /// A string secret at the project root.
    #[must_use]
    pub fn new(key: SecretName) -> Self {
        Self {
            key,
            folder: None,
            secret_type: SecretType::String,
            description: None,
            tags: BTreeMap::new(),
            otp: None,
        }
    }

    /// Places the secret in a folder.
    #[must_use]
    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Sets the value kind.
    #[must_use]
    pub const fn of_type(mut self, secret_type: SecretType) -> Self {
        self.secret_type = secret_type;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets OTP parameters.
    #[must_use]
    pub fn with_otp(mut self, settings: OtpSettings) -> Self {
        self.otp = Some(settings);
        self
    }
}

/// Input of [`SecretStore::set_credential`].
#[derive(Clone)]
pub struct CredentialInput {
    /// Login name, stored in clear.
    pub username: String,
    /// Password, encrypted as the version value.
    pub password: SecretValue,
    /// Base32 OTP seed, encrypted separately.
    pub otp_seed: Option<SecretValue>,
}

impl std::fmt::Debug for CredentialInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialInput")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("otp_seed", &self.otp_seed.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A resolved plaintext and where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedValue {
    /// Decrypted value.
    pub value: SecretValue,
    /// Version that supplied it.
    pub version: VersionSummary,
    /// Environment the version lives in; an ancestor when inherited.
    pub source_environment: EnvironmentId,
}

/// A generated OTP code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OtpCode {
    /// Time-based code.
    Totp(TotpCode),
    /// Counter-based code.
    Hotp(HotpCode),
}

impl OtpCode {
    /// The code digits.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Totp(c) => &c.code,
            Self::Hotp(c) => &c.code,
        }
    }
}

/// Result of [`SecretStore::verify_otp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpCheck {
    /// Whether the code was accepted.
    pub valid: bool,
    /// TOTP step offset of the match.
    pub drift: Option<i64>,
    /// HOTP counter persisted after a match.
    pub counter: Option<u64>,
}

/// Outcome counts of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Secrets created.
    pub created: usize,
    /// Secrets that received a new version.
    pub updated: usize,
    /// Entries whose value matched the current version.
    pub unchanged: usize,
}

/// Secret and version storage for every project.
pub struct SecretStore {
    encryptor: Encryptor,
    environments: Arc<EnvironmentGraph>,
    otp: OtpEngine,
    secrets: RwLock<HashMap<SecretId, Secret>>,
    versions: RwLock<VersionTable>,
    pair_locks: Mutex<HashMap<PairKey, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("secrets", &self.secrets.read().len())
            .finish_non_exhaustive()
    }
}

fn value_hash(plaintext: &[u8]) -> String {
    blake3::hash(plaintext).to_hex().to_string()
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().take(3).collect();
    if value.chars().count() > 8 {
        format!("{visible}{}", "*".repeat(8))
    } else {
        "*".repeat(8)
    }
}

impl SecretStore {
    /// Creates a store.
    #[must_use]
    pub fn new(encryptor: Encryptor, environments: Arc<EnvironmentGraph>, otp: OtpEngine) -> Self {
        Self {
            encryptor,
            environments,
            otp,
            secrets: RwLock::new(HashMap::new()),
            versions: RwLock::new(VersionTable::new()),
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The environment graph the store resolves against.
    #[must_use]
    pub fn environments(&self) -> &Arc<EnvironmentGraph> {
        &self.environments
    }

    /// The encryptor.
    #[must_use]
    pub const fn encryptor(&self) -> &Encryptor {
        &self.encryptor
    }

    fn pair_lock(&self, pair: PairKey) -> Arc<Mutex<()>> {
        Arc::clone(self.pair_locks.lock().entry(pair).or_default())
    }

    // ===================
    // Secrets
    // ===================

    /// Creates a secret without any version.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a bad folder, OTP settings on a type that
    ///   cannot carry them
    /// - [`Error::InvalidOtpConfig`] for unusable OTP settings
    /// - [`Error::Conflict`] if the path is taken
    pub fn create_secret(&self, project: ProjectId, new: NewSecret, author: &Actor) -> Result<Secret> {
        let path = secret_path(new.folder.as_deref(), &new.key)?;
        let otp = match (new.secret_type, new.otp) {
            (SecretType::Totp, settings) => Some(OtpSettings {
                kind: OtpKind::Totp,
                ..settings.unwrap_or_else(OtpSettings::totp)
            }),
            (SecretType::Hotp, settings) => Some(OtpSettings {
                kind: OtpKind::Hotp,
                ..settings.unwrap_or_else(OtpSettings::hotp)
            }),
            (SecretType::Credential, settings) => settings,
            (other, Some(_)) => {
                return Err(Error::validation(format!(
                    "secret type '{other}' cannot carry otp settings"
                )));
            }
            (_, None) => None,
        };
        if let Some(settings) = &otp {
            settings.validate()?;
        }

        let now = Utc::now();
        let secret = Secret {
            id: SecretId::new(),
            project,
            key: new.key,
            folder: new.folder.filter(|f| !f.trim().is_empty()),
            path,
            secret_type: new.secret_type,
            description: new.description,
            tags: new.tags,
            otp,
            archived: false,
            archived_at: None,
            created_by: author.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut secrets = self.secrets.write();
        if secrets
            .values()
            .any(|s| s.project == project && s.path == secret.path)
        {
            return Err(Error::conflict(format!(
                "secret path '{}' already exists",
                secret.path
            )));
        }
        secrets.insert(secret.id, secret.clone());
        Ok(secret)
    }

    /// Looks up a secret, archived or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it does not exist in the project.
    pub fn get_secret(&self, project: ProjectId, id: SecretId) -> Result<Secret> {
        self.secrets
            .read()
            .get(&id)
            .filter(|s| s.project == project)
            .cloned()
            .ok_or_else(|| Error::not_found("secret", id))
    }

    /// Looks up a secret by path, archived or not.
    #[must_use]
    pub fn find_by_path(&self, project: ProjectId, path: &str) -> Option<Secret> {
        self.secrets
            .read()
            .values()
            .find(|s| s.project == project && s.path == path)
            .cloned()
    }

    /// Lists secrets by path.
    #[must_use]
    pub fn list_secrets(&self, project: ProjectId, include_archived: bool) -> Vec<Secret> {
        let mut secrets: Vec<Secret> = self
            .secrets
            .read()
            .values()
            .filter(|s| s.project == project && (include_archived || !s.archived))
            .cloned()
            .collect();
        secrets.sort_by(|a, b| a.path.cmp(&b.path));
        secrets
    }

    /// Soft-deletes a secret. History is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the secret does not exist.
    pub fn archive(&self, project: ProjectId, id: SecretId) -> Result<Secret> {
        self.update_secret(project, id, |s| {
            if !s.archived {
                s.archived = true;
                s.archived_at = Some(Utc::now());
            }
        })
    }

    /// Makes an archived secret visible again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the secret does not exist.
    pub fn restore(&self, project: ProjectId, id: SecretId) -> Result<Secret> {
        self.update_secret(project, id, |s| {
            s.archived = false;
            s.archived_at = None;
        })
    }

    /// Removes a secret that has never had a version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if any version exists; archive it instead.
    pub fn delete_secret(&self, project: ProjectId, id: SecretId) -> Result<Secret> {
        let versions = self.versions.read();
        let mut secrets = self.secrets.write();
        if !secrets.get(&id).is_some_and(|s| s.project == project) {
            return Err(Error::not_found("secret", id));
        }
        if versions.has_secret(id) {
            return Err(Error::conflict(
                "secret has version history and can only be archived",
            ));
        }
        secrets
            .remove(&id)
            .ok_or_else(|| Error::not_found("secret", id))
    }

    fn update_secret(
        &self,
        project: ProjectId,
        id: SecretId,
        apply: impl FnOnce(&mut Secret),
    ) -> Result<Secret> {
        let mut secrets = self.secrets.write();
        let secret = secrets
            .get_mut(&id)
            .filter(|s| s.project == project)
            .ok_or_else(|| Error::not_found("secret", id))?;
        apply(secret);
        secret.updated_at = Utc::now();
        Ok(secret.clone())
    }

    fn live_secret(&self, project: ProjectId, id: SecretId) -> Result<Secret> {
        let secret = self.get_secret(project, id)?;
        if secret.archived {
            return Err(Error::not_found("secret", secret.path));
        }
        Ok(secret)
    }

    fn writable_environment(&self, project: ProjectId, id: EnvironmentId) -> Result<Environment> {
        let env = self.environments.get(project, id)?;
        if env.locked {
            return Err(Error::Forbidden {
                reason: format!("environment '{}' is locked", env.slug),
            });
        }
        Ok(env)
    }

    fn validate_value(secret: &Secret, plaintext: &[u8]) -> Result<()> {
        match secret.secret_type {
            SecretType::Json => {
                serde_json::from_slice::<serde_json::Value>(plaintext).map_err(|e| {
                    Error::validation(format!("value of json secret is not valid JSON: {e}"))
                })?;
            }
            SecretType::Totp | SecretType::Hotp => {
                let seed = std::str::from_utf8(plaintext)
                    .map_err(|_| Error::otp_config("seed is not valid UTF-8"))?;
                otp::decode_seed(seed)?;
            }
            SecretType::String
            | SecretType::File
            | SecretType::Certificate
            | SecretType::Credential => {}
        }
        Ok(())
    }

    // ===================
    // Versions
    // ===================

    /// Writes a new current version of a secret in an environment.
    ///
    /// Credential versions keep the username, OTP seed and HOTP counter of
    /// the version they replace.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] for an unknown or archived secret or environment
    /// - [`Error::Forbidden`] if the environment is locked
    /// - [`Error::Validation`] for a malformed `json` value
    /// - [`Error::Conflict`] if the version table rejects the row
    pub fn set_value(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
        plaintext: &[u8],
        author: &Actor,
        note: Option<&str>,
    ) -> Result<VersionSummary> {
        let secret = self.live_secret(project, secret_id)?;
        self.writable_environment(project, environment)?;
        Self::validate_value(&secret, plaintext)?;

        let pair = (secret_id, environment);
        let lock = self.pair_lock(pair);
        let _guard = lock.lock();

        let (carried_username, carried_seed, carried_counter) = {
            let versions = self.versions.read();
            versions
                .current(pair)
                .filter(|_| secret.secret_type == SecretType::Credential)
                .map_or((None, None, 0), |current| {
                    (
                        current.username.clone(),
                        current.otp_seed.clone(),
                        current.hotp_counter,
                    )
                })
        };
        let payload = self.encryptor.encrypt(plaintext, project)?;
        self.commit(
            project,
            pair,
            payload,
            plaintext,
            carried_username,
            carried_seed,
            carried_counter,
            author,
            note.map(str::to_string),
        )
    }

    /// Inserts the next version of `pair` under the caller's pair lock.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        project: ProjectId,
        pair: PairKey,
        value: EncryptedPayload,
        plaintext: &[u8],
        username: Option<String>,
        otp_seed: Option<EncryptedPayload>,
        hotp_counter: u64,
        author: &Actor,
        change_note: Option<String>,
    ) -> Result<VersionSummary> {
        let mut versions = self.versions.write();
        if !self.environments.contains(project, pair.1) {
            return Err(Error::not_found("environment", pair.1));
        }
        // Checked under the table lock so a rotation listing versions cannot
        // miss this row.
        let value = self.encryptor.reseal(value, project)?;
        let otp_seed = otp_seed
            .map(|seed| self.encryptor.reseal(seed, project))
            .transpose()?;
        let row = SecretVersion {
            id: VersionId::new(),
            project,
            secret: pair.0,
            environment: pair.1,
            version: versions.max_version(pair) + 1,
            is_current: true,
            value,
            value_length: plaintext.len(),
            value_hash: value_hash(plaintext),
            username,
            otp_seed,
            hotp_counter,
            created_by: author.to_string(),
            change_note,
            created_at: Utc::now(),
        };
        let summary = row.summary();
        versions.commit_current(row)?;
        drop(versions);

        debug!(
            project = %project,
            secret = %pair.0,
            environment = %pair.1,
            version = summary.version,
            "committed secret version"
        );
        Ok(summary)
    }

    /// Resolves the current value, falling back through ancestor
    /// environments to the root.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no environment in the chain has a version
    /// - [`Error::DecryptionError`] if the value cannot be opened
    pub fn resolve_value(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
    ) -> Result<ResolvedValue> {
        let secret = self.live_secret(project, secret_id)?;
        let row = self.resolve_row(project, &secret, environment)?;
        let value = self.encryptor.decrypt(&row.value, project)?;
        Ok(ResolvedValue {
            value,
            source_environment: row.environment,
            version: row.summary(),
        })
    }

    fn resolve_row(
        &self,
        project: ProjectId,
        secret: &Secret,
        environment: EnvironmentId,
    ) -> Result<SecretVersion> {
        let chain = self.environments.walk(project, environment)?;
        let versions = self.versions.read();
        chain
            .iter()
            .find_map(|env| versions.current((secret.id, env.id)).cloned())
            .ok_or_else(|| Error::not_found("secret value", &secret.path))
    }

    /// Restores a prior version as a new current version.
    ///
    /// The payload is copied as-is while its key is still active; a payload
    /// on a rotating or retired key is moved onto the active key.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the target version does not exist in the pair
    /// - [`Error::Forbidden`] if the environment is locked
    pub fn rollback(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
        target_version: u32,
        author: &Actor,
    ) -> Result<VersionSummary> {
        self.live_secret(project, secret_id)?;
        self.writable_environment(project, environment)?;

        let pair = (secret_id, environment);
        let lock = self.pair_lock(pair);
        let _guard = lock.lock();

        let target = self
            .versions
            .read()
            .version(pair, target_version)
            .cloned()
            .ok_or_else(|| Error::not_found("version", target_version))?;

        let mut versions = self.versions.write();
        if !self.environments.contains(project, environment) {
            return Err(Error::not_found("environment", environment));
        }
        let value = self.encryptor.reseal(target.value, project)?;
        let otp_seed = target
            .otp_seed
            .map(|seed| self.encryptor.reseal(seed, project))
            .transpose()?;
        let row = SecretVersion {
            id: VersionId::new(),
            project,
            secret: secret_id,
            environment,
            version: versions.max_version(pair) + 1,
            is_current: true,
            value,
            value_length: target.value_length,
            value_hash: target.value_hash,
            username: target.username,
            otp_seed,
            hotp_counter: target.hotp_counter,
            created_by: author.to_string(),
            change_note: Some(format!("rollback to version {target_version}")),
            created_at: Utc::now(),
        };
        let summary = row.summary();
        versions.commit_current(row)?;
        Ok(summary)
    }

    /// Version history of a pair, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown secret or environment.
    pub fn list_versions(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
    ) -> Result<Vec<VersionSummary>> {
        self.get_secret(project, secret_id)?;
        self.environments.get(project, environment)?;
        Ok(self
            .versions
            .read()
            .history((secret_id, environment))
            .into_iter()
            .map(SecretVersion::summary)
            .collect())
    }

    /// A masked rendering of the resolved value.
    ///
    /// Decryption failures degrade to [`PREVIEW_UNAVAILABLE`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing resolves.
    pub fn preview(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
    ) -> Result<String> {
        match self.resolve_value(project, secret_id, environment) {
            Ok(resolved) => Ok(resolved
                .value
                .as_str()
                .map_or_else(|_| "*".repeat(8), mask)),
            Err(Error::DecryptionError { reason }) => {
                warn!(secret = %secret_id, reason = %reason, "preview could not decrypt value");
                Ok(PREVIEW_UNAVAILABLE.to_string())
            }
            Err(err) => Err(err),
        }
    }

    /// Returns true if any version references the environment.
    #[must_use]
    pub fn environment_in_use(&self, environment: EnvironmentId) -> bool {
        self.versions.read().has_environment(environment)
    }

    /// Deletes an environment with no versions and no children.
    ///
    /// # Errors
    ///
    /// - [`Error::HasDependentVersions`] while versions reference it
    /// - [`Error::Forbidden`] if it is protected
    /// - [`Error::Conflict`] if it has child environments
    pub fn delete_environment(&self, project: ProjectId, environment: EnvironmentId) -> Result<Environment> {
        // Holding the table lock keeps writers from adding a version meanwhile.
        let versions = self.versions.write();
        let env = self.environments.get(project, environment)?;
        if versions.has_environment(environment) {
            return Err(Error::HasDependentVersions {
                environment: env.slug,
            });
        }
        self.environments.remove(project, environment)
    }

    // ===================
    // Credentials and OTP
    // ===================

    /// Writes a credential version: password as the value, OTP seed
    /// encrypted separately, HOTP counter reset to 0.
    ///
    /// Without a new seed the previous version's seed and counter are kept.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the secret is not a credential
    /// - [`Error::InvalidOtpConfig`] for a malformed seed
    pub fn set_credential(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
        input: &CredentialInput,
        author: &Actor,
        note: Option<&str>,
    ) -> Result<VersionSummary> {
        let secret = self.live_secret(project, secret_id)?;
        if secret.secret_type != SecretType::Credential {
            return Err(Error::validation(format!(
                "secret '{}' is not a credential",
                secret.path
            )));
        }
        if input.username.trim().is_empty() {
            return Err(Error::validation("credential username cannot be empty"));
        }
        self.writable_environment(project, environment)?;
        if let Some(seed) = &input.otp_seed {
            let settings = secret
                .otp
                .as_ref()
                .filter(|s| s.kind != OtpKind::None)
                .ok_or_else(|| Error::otp_config("credential has no otp settings"))?;
            settings.validate()?;
            otp::decode_seed(seed.as_str().map_err(|_| Error::otp_config("seed is not valid UTF-8"))?)?;
        }

        let pair = (secret_id, environment);
        let lock = self.pair_lock(pair);
        let _guard = lock.lock();

        let password = self.encryptor.encrypt(input.password.as_bytes(), project)?;
        let (otp_seed, hotp_counter) = match &input.otp_seed {
            Some(seed) => (Some(self.encryptor.encrypt(seed.as_bytes(), project)?), 0),
            None => self
                .versions
                .read()
                .current(pair)
                .map_or((None, 0), |current| (current.otp_seed.clone(), current.hotp_counter)),
        };
        self.commit(
            project,
            pair,
            password,
            input.password.as_bytes(),
            Some(input.username.trim().to_string()),
            otp_seed,
            hotp_counter,
            author,
            note.map(str::to_string),
        )
    }

    /// The OTP seed and settings of the resolved version.
    fn otp_material(
        &self,
        project: ProjectId,
        secret: &Secret,
        environment: EnvironmentId,
    ) -> Result<(SecretVersion, SecretValue, OtpSettings, OtpKind)> {
        let kind = secret.otp_kind();
        if kind == OtpKind::None {
            return Err(Error::otp_config(format!(
                "secret '{}' has no otp generator",
                secret.path
            )));
        }
        let settings = secret
            .otp
            .clone()
            .ok_or_else(|| Error::otp_config("missing otp settings"))?;
        let row = self.resolve_row(project, secret, environment)?;
        let payload = match secret.secret_type {
            SecretType::Credential => row
                .otp_seed
                .clone()
                .ok_or_else(|| Error::otp_config("credential has no otp seed"))?,
            _ => row.value.clone(),
        };
        let seed = self.encryptor.decrypt(&payload, project)?;
        Ok((row, seed, settings, kind))
    }

    /// Generates the next OTP code. HOTP generation persists `counter + 1`
    /// on the owning version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] if the secret has no usable
    /// generator.
    pub fn generate_otp(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
        at: DateTime<Utc>,
    ) -> Result<OtpCode> {
        let secret = self.live_secret(project, secret_id)?;
        let (row, seed, settings, kind) = self.otp_material(project, &secret, environment)?;
        let seed_str = seed
            .as_str()
            .map_err(|_| Error::otp_config("seed is not valid UTF-8"))?;

        match kind {
            OtpKind::Totp => Ok(OtpCode::Totp(self.otp.totp_generate(seed_str, &settings, at)?)),
            OtpKind::Hotp => {
                let lock = self.pair_lock(row.pair());
                let _guard = lock.lock();
                let counter = self.current_counter(row.id)?;
                let code = self
                    .otp
                    .hotp_generate(seed_str, counter, settings.algorithm, settings.digits)?;
                self.store_counter(row.id, counter.saturating_add(1))?;
                Ok(OtpCode::Hotp(code))
            }
            OtpKind::None => Err(Error::otp_config("secret has no otp generator")),
        }
    }

    /// Verifies an OTP code. A matched HOTP code persists `matched + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] if the secret has no usable
    /// generator.
    pub fn verify_otp(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<OtpCheck> {
        let secret = self.live_secret(project, secret_id)?;
        let (row, seed, settings, kind) = self.otp_material(project, &secret, environment)?;
        let seed_str = seed
            .as_str()
            .map_err(|_| Error::otp_config("seed is not valid UTF-8"))?;

        match kind {
            OtpKind::Totp => {
                let result = self.otp.totp_verify(seed_str, code, &settings, at)?;
                Ok(OtpCheck {
                    valid: result.valid,
                    drift: result.drift,
                    counter: None,
                })
            }
            OtpKind::Hotp => {
                let lock = self.pair_lock(row.pair());
                let _guard = lock.lock();
                let counter = self.current_counter(row.id)?;
                let result = self.otp.hotp_verify(
                    seed_str,
                    code,
                    counter,
                    settings.algorithm,
                    settings.digits,
                    self.otp.lookahead(),
                )?;
                if let Some(new_counter) = result.new_counter {
                    self.store_counter(row.id, new_counter)?;
                }
                Ok(OtpCheck {
                    valid: result.valid,
                    drift: None,
                    counter: result.new_counter,
                })
            }
            OtpKind::None => Err(Error::otp_config("secret has no otp generator")),
        }
    }

    /// Overwrites the HOTP counter of the current version in an environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the environment has no current version.
    pub fn set_hotp_counter(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
        counter: u64,
    ) -> Result<()> {
        let secret = self.live_secret(project, secret_id)?;
        if secret.otp_kind() != OtpKind::Hotp {
            return Err(Error::otp_config(format!(
                "secret '{}' is not an hotp generator",
                secret.path
            )));
        }
        let pair = (secret_id, environment);
        let lock = self.pair_lock(pair);
        let _guard = lock.lock();
        let id = self
            .versions
            .read()
            .current(pair)
            .map(|r| r.id)
            .ok_or_else(|| Error::not_found("secret value", &secret.path))?;
        self.store_counter(id, counter)
    }

    /// Builds an `otpauth://` enrollment URI for the resolved seed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] if the secret has no usable
    /// generator.
    pub fn provisioning_uri(
        &self,
        project: ProjectId,
        secret_id: SecretId,
        environment: EnvironmentId,
        account: &str,
    ) -> Result<String> {
        let secret = self.live_secret(project, secret_id)?;
        let (row, seed, settings, kind) = self.otp_material(project, &secret, environment)?;
        let seed_str = seed
            .as_str()
            .map_err(|_| Error::otp_config("seed is not valid UTF-8"))?;
        self.otp
            .provisioning_uri(seed_str, kind, &settings, account, row.hotp_counter)
    }

    fn current_counter(&self, version: VersionId) -> Result<u64> {
        self.versions
            .read()
            .get(version)
            .map(|r| r.hotp_counter)
            .ok_or_else(|| Error::not_found("version", version))
    }

    fn store_counter(&self, version: VersionId, counter: u64) -> Result<()> {
        let mut versions = self.versions.write();
        let row = versions
            .get_mut(version)
            .ok_or_else(|| Error::not_found("version", version))?;
        row.hotp_counter = counter;
        Ok(())
    }

    // ===================
    // Bulk
    // ===================

    /// Resolves every live secret for an environment, keyed by secret key.
    ///
    /// Secrets with nothing to resolve are skipped. When two folders hold the
    /// same key, the first path wins.
    ///
    /// # Errors
    ///
    /// Returns an error if a value fails to decrypt.
    pub fn export_environment(
        &self,
        project: ProjectId,
        environment: EnvironmentId,
    ) -> Result<Vec<(String, SecretValue)>> {
        self.environments.get(project, environment)?;
        let mut entries: Vec<(String, SecretValue)> = Vec::new();
        for secret in self.list_secrets(project, false) {
            if entries.iter().any(|(k, _)| k == secret.key.as_str()) {
                warn!(path = %secret.path, "duplicate key in export, skipping");
                continue;
            }
            match self.resolve_value(project, secret.id, environment) {
                Ok(resolved) => entries.push((secret.key.to_string(), resolved.value)),
                Err(Error::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    /// Writes `KEY=value` entries into an environment, creating root-level
    /// string secrets as needed. Values equal to the environment's current
    /// version are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error on the first entry that fails validation or writing.
    pub fn import_environment(
        &self,
        project: ProjectId,
        environment: EnvironmentId,
        entries: &[(String, SecretValue)],
        author: &Actor,
    ) -> Result<ImportReport> {
        self.writable_environment(project, environment)?;
        let mut report = ImportReport::default();
        for (raw_key, value) in entries {
            let key = SecretName::canonicalize(raw_key)?;
            let secret = match self.find_by_path(project, key.as_str()) {
                Some(existing) => {
                    if existing.archived {
                        self.restore(project, existing.id)?
                    } else {
                        existing
                    }
                }
                None => {
                    report.created += 1;
                    self.create_secret(project, NewSecret::new(key), author)?
                }
            };

            let unchanged = self
                .versions
                .read()
                .current((secret.id, environment))
                .is_some_and(|current| current.value_hash == value_hash(value.as_bytes()));
            if unchanged {
                report.unchanged += 1;
                continue;
            }
            self.set_value(
                project,
                secret.id,
                environment,
                value.as_bytes(),
                author,
                Some("import"),
            )?;
            report.updated += 1;
        }
        Ok(report)
    }
}

impl RotationTarget for SecretStore {
    fn pending_versions(&self, project: ProjectId, key_id: &KeyId) -> Vec<VersionId> {
        self.versions.read().using_key(project, key_id)
    }

    fn migrate_version(&self, version: VersionId, rekeyer: &Rekeyer) -> Result<MigrationOutcome> {
        let pair = self
            .versions
            .read()
            .get(version)
            .map(SecretVersion::pair)
            .ok_or_else(|| Error::not_found("version", version))?;
        let lock = self.pair_lock(pair);
        let _guard = lock.lock();

        let (value, seed) = {
            let versions = self.versions.read();
            let row = versions
                .get(version)
                .ok_or_else(|| Error::not_found("version", version))?;
            (row.value.clone(), row.otp_seed.clone())
        };
        let new_value = rekeyer.rekey(&value)?;
        let new_seed = match &seed {
            Some(seed) => rekeyer.rekey(seed)?,
            None => None,
        };
        if new_value.is_none() && new_seed.is_none() {
            return Ok(MigrationOutcome::Skipped);
        }

        let mut versions = self.versions.write();
        let row = versions
            .get_mut(version)
            .ok_or_else(|| Error::not_found("version", version))?;
        if let Some(value) = new_value {
            row.value = value;
        }
        if let Some(seed) = new_seed {
            row.otp_seed = Some(seed);
        }
        Ok(MigrationOutcome::Migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::KeyAlgorithm;
    use crate::keys::{KeyManager, KeyStatus, LocalMasterKeyProvider, RotationOptions};
    use crate::types::OtpAlgorithm;

    const SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    struct Fixture {
        store: SecretStore,
        keys: Arc<KeyManager>,
        project: ProjectId,
        prod: Environment,
        staging: Environment,
        dev: Environment,
        author: Actor,
    }

    fn fixture() -> Fixture {
        let provider = LocalMasterKeyProvider::from_bytes(&[3u8; 32]).expect("provider");
        let keys = Arc::new(KeyManager::new(Arc::new(provider), KeyAlgorithm::Aes256Gcm));
        let graph = Arc::new(EnvironmentGraph::new());
        let project = ProjectId::new();
        let prod = graph.create(project, "Production", "production", None).expect("prod");
        let staging = graph
            .create(project, "Staging", "staging", Some(prod.id))
            .expect("staging");
        let dev = graph
            .create(project, "Development", "development", Some(staging.id))
            .expect("dev");
        let store = SecretStore::new(Encryptor::new(Arc::clone(&keys)), graph, OtpEngine::default());
        Fixture {
            store,
            keys,
            project,
            prod,
            staging,
            dev,
            author: Actor::user("u1", "alice"),
        }
    }

    fn secret(f: &Fixture, key: &str, secret_type: SecretType) -> Secret {
        f.store
            .create_secret(
                f.project,
                NewSecret::new(SecretName::new(key).expect("name")).of_type(secret_type),
                &f.author,
            )
            .expect("create")
    }

    #[test]
    fn set_value_numbers_versions_with_one_current() {
        let f = fixture();
        let s = secret(&f, "API_KEY", SecretType::String);
        for i in 1..=4u32 {
            let v = f
                .store
                .set_value(f.project, s.id, f.prod.id, format!("v{i}").as_bytes(), &f.author, None)
                .expect("set");
            assert_eq!(v.version, i);
        }
        let history = f.store.list_versions(f.project, s.id, f.prod.id).expect("history");
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);
        assert_eq!(history[0].version, 4);
        assert!(history[0].is_current);
    }

    #[test]
    fn resolve_inherits_from_ancestors() {
        let f = fixture();
        let s = secret(&f, "DATABASE_URL", SecretType::String);
        assert!(matches!(
            f.store.resolve_value(f.project, s.id, f.dev.id),
            Err(Error::NotFound { .. })
        ));

        f.store
            .set_value(f.project, s.id, f.prod.id, b"prod-db", &f.author, None)
            .expect("set");
        let resolved = f.store.resolve_value(f.project, s.id, f.dev.id).expect("resolve");
        assert_eq!(resolved.value.as_bytes(), b"prod-db");
        assert_eq!(resolved.source_environment, f.prod.id);

        f.store
            .set_value(f.project, s.id, f.staging.id, b"staging-db", &f.author, None)
            .expect("set");
        let resolved = f.store.resolve_value(f.project, s.id, f.dev.id).expect("resolve");
        assert_eq!(resolved.value.as_bytes(), b"staging-db");
    }

    #[test]
    fn rollback_copies_ciphertext() {
        let f = fixture();
        let s = secret(&f, "TOKEN", SecretType::String);
        f.store
            .set_value(f.project, s.id, f.prod.id, b"first", &f.author, None)
            .expect("set");
        f.store
            .set_value(f.project, s.id, f.prod.id, b"second", &f.author, None)
            .expect("set");

        let v3 = f
            .store
            .rollback(f.project, s.id, f.prod.id, 1, &f.author)
            .expect("rollback");
        assert_eq!(v3.version, 3);
        assert_eq!(v3.change_note.as_deref(), Some("rollback to version 1"));
        let history = f.store.list_versions(f.project, s.id, f.prod.id).expect("history");
        assert_eq!(history[2].value_hash, v3.value_hash);
        let resolved = f.store.resolve_value(f.project, s.id, f.prod.id).expect("resolve");
        assert_eq!(resolved.value.as_bytes(), b"first");

        assert!(matches!(
            f.store.rollback(f.project, s.id, f.prod.id, 9, &f.author),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn archive_hides_and_restore_returns() {
        let f = fixture();
        let s = secret(&f, "OLD", SecretType::String);
        f.store
            .set_value(f.project, s.id, f.prod.id, b"x", &f.author, None)
            .expect("set");
        f.store.archive(f.project, s.id).expect("archive");
        assert!(f.store.list_secrets(f.project, false).is_empty());
        assert_eq!(f.store.list_secrets(f.project, true).len(), 1);
        assert!(matches!(
            f.store.resolve_value(f.project, s.id, f.prod.id),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            f.store.delete_secret(f.project, s.id),
            Err(Error::Conflict { .. })
        ));

        f.store.restore(f.project, s.id).expect("restore");
        assert!(f.store.resolve_value(f.project, s.id, f.prod.id).is_ok());
    }

    #[test]
    fn delete_secret_without_versions() {
        let f = fixture();
        let s = secret(&f, "UNUSED", SecretType::String);
        f.store.delete_secret(f.project, s.id).expect("delete");
        assert!(f.store.get_secret(f.project, s.id).is_err());
    }

    #[test]
    fn paths_are_unique_per_project() {
        let f = fixture();
        secret(&f, "DUP", SecretType::String);
        let again = f.store.create_secret(
            f.project,
            NewSecret::new(SecretName::new("DUP").expect("name")),
            &f.author,
        );
        assert!(matches!(again, Err(Error::Conflict { .. })));
        let foldered = f
            .store
            .create_secret(
                f.project,
                NewSecret::new(SecretName::new("DUP").expect("name")).in_folder("infra"),
                &f.author,
            )
            .expect("folder");
        assert_eq!(foldered.path, "infra/DUP");
    }

    #[test]
    fn json_values_are_validated() {
        let f = fixture();
        let s = secret(&f, "CONFIG", SecretType::Json);
        assert!(matches!(
            f.store.set_value(f.project, s.id, f.prod.id, b"{not json", &f.author, None),
            Err(Error::Validation { .. })
        ));
        f.store
            .set_value(f.project, s.id, f.prod.id, br#"{"a":1}"#, &f.author, None)
            .expect("valid json");
    }

    #[test]
    fn locked_environment_refuses_writes() {
        let f = fixture();
        let s = secret(&f, "LOCKED", SecretType::String);
        f.store
            .environments()
            .set_locked(f.project, f.prod.id, true)
            .expect("lock");
        assert!(matches!(
            f.store.set_value(f.project, s.id, f.prod.id, b"x", &f.author, None),
            Err(Error::Forbidden { .. })
        ));
    }

    #[test]
    fn delete_environment_refused_with_versions() {
        let f = fixture();
        let s = secret(&f, "IN_DEV", SecretType::String);
        f.store
            .set_value(f.project, s.id, f.dev.id, b"x", &f.author, None)
            .expect("set");
        assert!(matches!(
            f.store.delete_environment(f.project, f.dev.id),
            Err(Error::HasDependentVersions { .. })
        ));
        assert!(f.store.environment_in_use(f.dev.id));
    }

    #[test]
    fn preview_masks_and_degrades() {
        let f = fixture();
        let s = secret(&f, "LONG", SecretType::String);
        f.store
            .set_value(f.project, s.id, f.prod.id, b"supersecretvalue", &f.author, None)
            .expect("set");
        assert_eq!(
            f.store.preview(f.project, s.id, f.prod.id).expect("preview"),
            "sup********"
        );

        // Corrupt the stored ciphertext.
        {
            let mut versions = f.store.versions.write();
            let id = versions.current((s.id, f.prod.id)).map(|r| r.id).expect("row");
            let row = versions.get_mut(id).expect("row");
            row.value.ciphertext[0] ^= 0xff;
        }
        assert_eq!(
            f.store.preview(f.project, s.id, f.prod.id).expect("preview"),
            PREVIEW_UNAVAILABLE
        );
    }

    #[test]
    fn credential_with_totp_seed() {
        let f = fixture();
        let s = f
            .store
            .create_secret(
                f.project,
                NewSecret::new(SecretName::new("GITHUB_LOGIN").expect("name"))
                    .of_type(SecretType::Credential)
                    .with_otp(OtpSettings::totp()),
                &f.author,
            )
            .expect("create");
        let input = CredentialInput {
            username: "octocat".into(),
            password: SecretValue::from("hunter2"),
            otp_seed: Some(SecretValue::from(SEED)),
        };
        let v = f
            .store
            .set_credential(f.project, s.id, f.prod.id, &input, &f.author, None)
            .expect("credential");
        assert_eq!(v.username.as_deref(), Some("octocat"));
        assert!(v.has_otp_seed);
        assert_eq!(v.hotp_counter, 0);

        let now = Utc::now();
        let code = f.store.generate_otp(f.project, s.id, f.prod.id, now).expect("code");
        assert!(matches!(code, OtpCode::Totp(_)));
        let check = f
            .store
            .verify_otp(f.project, s.id, f.prod.id, code.code(), now)
            .expect("verify");
        assert!(check.valid);
        assert_eq!(check.drift, Some(0));

        // Password rotation keeps the seed.
        let v2 = f
            .store
            .set_value(f.project, s.id, f.prod.id, b"hunter3", &f.author, None)
            .expect("rotate password");
        assert!(v2.has_otp_seed);
        assert_eq!(v2.username.as_deref(), Some("octocat"));
    }

    #[test]
    fn credential_rejects_bad_seed() {
        let f = fixture();
        let s = f
            .store
            .create_secret(
                f.project,
                NewSecret::new(SecretName::new("LOGIN").expect("name"))
                    .of_type(SecretType::Credential)
                    .with_otp(OtpSettings::hotp()),
                &f.author,
            )
            .expect("create");
        let input = CredentialInput {
            username: "u".into(),
            password: SecretValue::from("p"),
            otp_seed: Some(SecretValue::from("!!!")),
        };
        assert!(matches!(
            f.store.set_credential(f.project, s.id, f.prod.id, &input, &f.author, None),
            Err(Error::InvalidOtpConfig { .. })
        ));
    }

    #[test]
    fn hotp_counter_advances_and_resyncs() {
        let f = fixture();
        let s = f
            .store
            .create_secret(
                f.project,
                NewSecret::new(SecretName::new("HOTP_SEED").expect("name"))
                    .of_type(SecretType::Hotp)
                    .with_otp(OtpSettings::hotp().with_algorithm(OtpAlgorithm::Sha1)),
                &f.author,
            )
            .expect("create");
        f.store
            .set_value(f.project, s.id, f.prod.id, SEED.as_bytes(), &f.author, None)
            .expect("seed");
        f.store
            .set_hotp_counter(f.project, s.id, f.prod.id, 5)
            .expect("counter");

        let now = Utc::now();
        let codes: Vec<OtpCode> = (0..3)
            .map(|_| f.store.generate_otp(f.project, s.id, f.prod.id, now).expect("generate"))
            .collect();
        let counters: Vec<u64> = codes
            .iter()
            .map(|c| match c {
                OtpCode::Hotp(h) => h.counter,
                OtpCode::Totp(_) => u64::MAX,
            })
            .collect();
        assert_eq!(counters, vec![5, 6, 7]);

        // Rewind to 5 as if codes were generated offline, then verify code 7.
        f.store
            .set_hotp_counter(f.project, s.id, f.prod.id, 5)
            .expect("rewind");
        let check = f
            .store
            .verify_otp(f.project, s.id, f.prod.id, codes[2].code(), now)
            .expect("verify");
        assert!(check.valid);
        assert_eq!(check.counter, Some(8));
        let history = f.store.list_versions(f.project, s.id, f.prod.id).expect("history");
        assert_eq!(history[0].hotp_counter, 8);
    }

    #[test]
    fn plain_secret_has_no_otp() {
        let f = fixture();
        let s = secret(&f, "PLAIN", SecretType::String);
        f.store
            .set_value(f.project, s.id, f.prod.id, b"x", &f.author, None)
            .expect("set");
        assert!(matches!(
            f.store.generate_otp(f.project, s.id, f.prod.id, Utc::now()),
            Err(Error::InvalidOtpConfig { .. })
        ));
    }

    #[test]
    fn export_and_import_roundtrip() {
        let f = fixture();
        let entries = vec![
            ("DATABASE_URL".to_string(), SecretValue::from("postgres://db")),
            ("api-key".to_string(), SecretValue::from("abc 123")),
        ];
        let report = f
            .store
            .import_environment(f.project, f.staging.id, &entries, &f.author)
            .expect("import");
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 2);

        let again = f
            .store
            .import_environment(f.project, f.staging.id, &entries, &f.author)
            .expect("import");
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.updated, 0);

        let exported = f.store.export_environment(f.project, f.dev.id).expect("export");
        let keys: Vec<&str> = exported.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["API_KEY", "DATABASE_URL"]);
        assert_eq!(exported[0].1.as_bytes(), b"abc 123");
    }

    #[test]
    fn rotation_reencrypts_values_and_seeds_in_place() {
        let f = fixture();
        let plain = secret(&f, "PLAIN", SecretType::String);
        let cred = f
            .store
            .create_secret(
                f.project,
                NewSecret::new(SecretName::new("LOGIN").expect("name"))
                    .of_type(SecretType::Credential)
                    .with_otp(OtpSettings::totp()),
                &f.author,
            )
            .expect("create");
        f.store
            .set_value(f.project, plain.id, f.prod.id, b"v1", &f.author, None)
            .expect("set");
        f.store
            .set_value(f.project, plain.id, f.prod.id, b"v2", &f.author, None)
            .expect("set");
        let input = CredentialInput {
            username: "u".into(),
            password: SecretValue::from("pw"),
            otp_seed: Some(SecretValue::from(SEED)),
        };
        f.store
            .set_credential(f.project, cred.id, f.staging.id, &input, &f.author, None)
            .expect("credential");

        let report = f
            .keys
            .rotate_key(f.project, &f.store, &RotationOptions::new(1))
            .expect("rotate");
        assert_eq!(report.migrated, 3);
        assert!(report.old_key_retired);
        let old = report.old_key_id.clone().expect("old key");
        assert!(f.store.pending_versions(f.project, &old).is_empty());
        assert!(f
            .keys
            .list_keys(f.project)
            .iter()
            .any(|k| k.key_id == old && k.status == KeyStatus::Retired));

        let history = f.store.list_versions(f.project, plain.id, f.prod.id).expect("history");
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|v| v.key_id == report.new_key_id));
        let resolved = f.store.resolve_value(f.project, plain.id, f.prod.id).expect("resolve");
        assert_eq!(resolved.value.as_bytes(), b"v2");
        assert!(f
            .store
            .generate_otp(f.project, cred.id, f.staging.id, Utc::now())
            .is_ok());
    }

    #[test]
    fn concurrent_writers_never_share_a_version() {
        let f = Arc::new(fixture());
        let id = secret(&f, "RACE", SecretType::String).id;
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    for j in 0..10 {
                        f.store
                            .set_value(
                                f.project,
                                id,
                                f.prod.id,
                                format!("{i}-{j}").as_bytes(),
                                &f.author,
                                None,
                            )
                            .expect("set");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let history = f.store.list_versions(f.project, id, f.prod.id).expect("history");
        assert_eq!(history.len(), 80);
        let mut numbers: Vec<u32> = history.iter().map(|v| v.version).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=80).collect::<Vec<_>>());
        assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);
    }

    #[derive(Clone, Copy)]
    enum Race {
        Write,
        Rollback,
    }

    /// Runs one store mutation right after rotation lists its versions.
    struct RacingTarget<'a> {
        f: &'a Fixture,
        secret: SecretId,
        race: Mutex<Option<Race>>,
    }

    impl RotationTarget for RacingTarget<'_> {
        fn pending_versions(&self, project: ProjectId, key_id: &KeyId) -> Vec<VersionId> {
            let listed = self.f.store.pending_versions(project, key_id);
            let race = self.race.lock().take();
            match race {
                Some(Race::Write) => {
                    self.f
                        .store
                        .set_value(project, self.secret, self.f.prod.id, b"pw2", &self.f.author, None)
                        .expect("racing write");
                }
                Some(Race::Rollback) => {
                    self.f
                        .store
                        .rollback(project, self.secret, self.f.prod.id, 1, &self.f.author)
                        .expect("racing rollback");
                }
                None => {}
            }
            listed
        }

        fn migrate_version(&self, version: VersionId, rekeyer: &Rekeyer) -> Result<MigrationOutcome> {
            self.f.store.migrate_version(version, rekeyer)
        }
    }

    fn rotate_during(race: Race) {
        let f = fixture();
        let cred = f
            .store
            .create_secret(
                f.project,
                NewSecret::new(SecretName::new("LOGIN").expect("name"))
                    .of_type(SecretType::Credential)
                    .with_otp(OtpSettings::totp()),
                &f.author,
            )
            .expect("create");
        let input = CredentialInput {
            username: "u".into(),
            password: SecretValue::from("pw"),
            otp_seed: Some(SecretValue::from(SEED)),
        };
        f.store
            .set_credential(f.project, cred.id, f.prod.id, &input, &f.author, None)
            .expect("credential");

        let target = RacingTarget {
            f: &f,
            secret: cred.id,
            race: Mutex::new(Some(race)),
        };
        let report = f
            .keys
            .rotate_key(f.project, &target, &RotationOptions::default())
            .expect("rotate");
        let old = report.old_key_id.clone().expect("old key");

        assert!(report.old_key_retired);
        assert!(f.store.pending_versions(f.project, &old).is_empty());
        let history = f.store.list_versions(f.project, cred.id, f.prod.id).expect("history");
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|v| v.key_id == report.new_key_id));
        assert!(f
            .store
            .generate_otp(f.project, cred.id, f.prod.id, Utc::now())
            .is_ok());
    }

    #[test]
    fn write_during_rotation_does_not_strand_old_key() {
        rotate_during(Race::Write);
    }

    #[test]
    fn rollback_during_rotation_does_not_strand_old_key() {
        rotate_during(Race::Rollback);
    }
}
