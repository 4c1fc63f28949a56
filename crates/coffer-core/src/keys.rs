//! Data key lifecycle.
//!
//! Every project owns a chain of data keys. Exactly one is `active` at a time;
//! rotation creates a replacement, moves the prior key to `rotating` while
//! versions are re-encrypted, then marks it `retired`. Raw key bytes are only
//! ever held wrapped by a [`MasterKeyProvider`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use argon2::Argon2;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::encryption::{open, seal, DataKey, KeyAlgorithm, Rekeyer, KEY_SIZE};
use crate::error::{Error, Result};
use crate::types::{KeyId, ProjectId, VersionId};

/// A data key sealed by the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Sealed key bytes followed by the tag.
    pub ciphertext: Vec<u8>,
    /// IV used when wrapping.
    pub iv: Vec<u8>,
}

/// Wraps and unwraps data keys.
///
/// The master key never encrypts secret values directly. Implementations
/// may be backed by a local key or by an external KMS.
pub trait MasterKeyProvider: Send + Sync + fmt::Debug {
    /// Identifies the wrapping scheme (e.g. `local-aes-256-gcm`).
    fn key_type(&self) -> &str;

    /// Wraps raw data key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot seal the key.
    fn wrap_key(&self, raw: &DataKey) -> Result<WrappedKey>;

    /// Unwraps data key bytes for use with `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns an error if the wrapped bytes do not authenticate.
    fn unwrap_key(&self, wrapped: &WrappedKey, algorithm: KeyAlgorithm) -> Result<DataKey>;
}

/// Master key provider holding a local AES-256-GCM key.
pub struct LocalMasterKeyProvider {
    key: DataKey,
}

impl LocalMasterKeyProvider {
    /// Minimum salt length accepted for passphrase derivation.
    pub const MIN_SALT_LENGTH: usize = 8;

    /// Derives the master key from a passphrase and salt with Argon2id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty passphrase or short salt,
    /// and [`Error::Encryption`] if derivation fails.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::validation("master passphrase cannot be empty"));
        }
        if salt.len() < Self::MIN_SALT_LENGTH {
            return Err(Error::validation(format!(
                "salt must be at least {} bytes",
                Self::MIN_SALT_LENGTH
            )));
        }
        let mut derived = zeroize::Zeroizing::new([0u8; KEY_SIZE]);
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, derived.as_mut())
            .map_err(|e| Error::Encryption {
                reason: format!("master key derivation failed: {e}"),
            })?;
        Self::from_bytes(derived.as_ref())
    }

    /// Uses raw master key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            key: DataKey::from_bytes(bytes, KeyAlgorithm::Aes256Gcm)?,
        })
    }
}

impl fmt::Debug for LocalMasterKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMasterKeyProvider")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MasterKeyProvider for LocalMasterKeyProvider {
    fn key_type(&self) -> &str {
        "local-aes-256-gcm"
    }

    fn wrap_key(&self, raw: &DataKey) -> Result<WrappedKey> {
        let (ciphertext, iv) = seal(&self.key, raw.as_bytes())?;
        Ok(WrappedKey {
            ciphertext,
            iv: iv.to_vec(),
        })
    }

    fn unwrap_key(&self, wrapped: &WrappedKey, algorithm: KeyAlgorithm) -> Result<DataKey> {
        let raw = zeroize::Zeroizing::new(open(&self.key, &wrapped.ciphertext, &wrapped.iv)?);
        DataKey::from_bytes(&raw, algorithm)
    }
}

/// Lifecycle state of a data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Used for new encryptions.
    Active,
    /// Replaced; versions are still being migrated off it.
    Rotating,
    /// No version references it any more. Kept to open old backups.
    Retired,
}

impl KeyStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Retired => "retired",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted data key. The wrapped bytes never change after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Owning project.
    pub project: ProjectId,
    /// Key identifier, unique per project.
    pub key_id: KeyId,
    /// Cipher this key is used with.
    pub key_type: KeyAlgorithm,
    /// Key bytes sealed by the master key.
    pub wrapped: WrappedKey,
    /// Lifecycle state.
    pub status: KeyStatus,
    /// The key this one replaced.
    pub previous_key: Option<KeyId>,
    /// When the key became active.
    pub activated_at: DateTime<Utc>,
    /// When the key was retired.
    pub retired_at: Option<DateTime<Utc>>,
}

/// Key metadata without wrapped material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Key identifier.
    pub key_id: KeyId,
    /// Cipher.
    pub key_type: KeyAlgorithm,
    /// Lifecycle state.
    pub status: KeyStatus,
    /// Predecessor in the rotation chain.
    pub previous_key: Option<KeyId>,
    /// Activation time.
    pub activated_at: DateTime<Utc>,
    /// Retirement time.
    pub retired_at: Option<DateTime<Utc>>,
}

impl From<&EncryptionKey> for KeyInfo {
    fn from(key: &EncryptionKey) -> Self {
        Self {
            key_id: key.key_id.clone(),
            key_type: key.key_type,
            status: key.status,
            previous_key: key.previous_key.clone(),
            activated_at: key.activated_at,
            retired_at: key.retired_at,
        }
    }
}

/// Outcome of migrating a single version during rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The version was re-encrypted under the new key.
    Migrated,
    /// Nothing on the version referenced the old key.
    Skipped,
}

/// Storage that holds payloads sealed by data keys.
///
/// Implemented by [`SecretStore`](crate::store::SecretStore).
pub trait RotationTarget: Send + Sync {
    /// Versions with a value or OTP seed sealed by `key_id`.
    fn pending_versions(&self, project: ProjectId, key_id: &KeyId) -> Vec<VersionId>;

    /// Re-encrypts one version in place while holding its pair lock.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload fails to open under the old key.
    fn migrate_version(&self, version: VersionId, rekeyer: &Rekeyer) -> Result<MigrationOutcome>;
}

/// Tuning for a rotation run.
#[derive(Debug, Clone)]
pub struct RotationOptions {
    /// Versions processed between progress checkpoints.
    pub batch_size: usize,
    /// Checked between versions.
    pub cancel: CancellationToken,
}

impl RotationOptions {
    /// Creates options with the given batch size.
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses an external cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Summary of a rotation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    /// Project whose key was rotated.
    pub project: ProjectId,
    /// Key versions were migrated off.
    pub old_key_id: Option<KeyId>,
    /// Key versions were migrated to.
    pub new_key_id: KeyId,
    /// Versions re-encrypted.
    pub migrated: usize,
    /// Versions already under the new key.
    pub skipped: usize,
    /// Versions that failed to decrypt.
    pub failed: usize,
    /// Whether the run stopped on cancellation.
    pub cancelled: bool,
    /// Whether the old key reached `retired`.
    pub old_key_retired: bool,
}

/// Owns the data keys of every project.
pub struct KeyManager {
    provider: Arc<dyn MasterKeyProvider>,
    algorithm: KeyAlgorithm,
    keys: RwLock<HashMap<(ProjectId, KeyId), EncryptionKey>>,
    cache: Option<RwLock<HashMap<(ProjectId, KeyId), DataKey>>>,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("provider", &self.provider.key_type())
            .field("algorithm", &self.algorithm)
            .field("keys", &self.keys.read().len())
            .field("cache_enabled", &self.cache.is_some())
            .finish()
    }
}

impl KeyManager {
    /// Creates a key manager with an in-memory raw key cache.
    #[must_use]
    pub fn new(provider: Arc<dyn MasterKeyProvider>, algorithm: KeyAlgorithm) -> Self {
        Self {
            provider,
            algorithm,
            keys: RwLock::new(HashMap::new()),
            cache: Some(RwLock::new(HashMap::new())),
        }
    }

    /// Disables the raw key cache; every call unwraps via the provider.
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    /// Returns the cipher used for new keys.
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Returns the project's active key, creating one if none exists.
    ///
    /// The active key lookup always reads the key table.
    ///
    /// # Errors
    ///
    /// Returns an error if key creation or unwrapping fails.
    pub fn current_key(&self, project: ProjectId) -> Result<(KeyId, DataKey)> {
        if let Some(key_id) = self.active_key_id(project) {
            let raw = self.get_key(&key_id, project)?;
            return Ok((key_id, raw));
        }
        match self.create_key(project) {
            Ok(info) => {
                let raw = self.get_key(&info.key_id, project)?;
                Ok((info.key_id, raw))
            }
            // Lost the race to another creator; use theirs.
            Err(Error::Conflict { .. }) => {
                let key_id = self
                    .active_key_id(project)
                    .ok_or_else(|| Error::conflict("active key disappeared during creation"))?;
                let raw = self.get_key(&key_id, project)?;
                Ok((key_id, raw))
            }
            Err(err) => Err(err),
        }
    }

    /// Unwraps a key of any status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the project has no such key.
    pub fn get_key(&self, key_id: &KeyId, project: ProjectId) -> Result<DataKey> {
        let cache_key = (project, key_id.clone());
        if let Some(cache) = &self.cache {
            if let Some(raw) = cache.read().get(&cache_key) {
                return Ok(raw.clone());
            }
        }

        let record = self
            .keys
            .read()
            .get(&cache_key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound {
                key_id: key_id.to_string(),
            })?;
        let raw = self.provider.unwrap_key(&record.wrapped, record.key_type)?;

        if let Some(cache) = &self.cache {
            cache.write().insert(cache_key, raw.clone());
        }
        Ok(raw)
    }

    /// Creates a new active key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the project already has an active key.
    pub fn create_key(&self, project: ProjectId) -> Result<KeyInfo> {
        let raw = DataKey::generate(self.algorithm);
        let wrapped = self.provider.wrap_key(&raw)?;
        let record = EncryptionKey {
            project,
            key_id: KeyId::generate(),
            key_type: self.algorithm,
            wrapped,
            status: KeyStatus::Active,
            previous_key: None,
            activated_at: Utc::now(),
            retired_at: None,
        };

        let mut keys = self.keys.write();
        let has_active = keys
            .values()
            .any(|k| k.project == project && k.status == KeyStatus::Active);
        if has_active {
            return Err(Error::conflict(format!(
                "project {project} already has an active key"
            )));
        }
        let info = KeyInfo::from(&record);
        keys.insert((project, record.key_id.clone()), record);
        drop(keys);

        info!(project = %project, key_id = %info.key_id, key_type = %info.key_type, "created data key");
        Ok(info)
    }

    /// Lists key metadata for a project, oldest first.
    #[must_use]
    pub fn list_keys(&self, project: ProjectId) -> Vec<KeyInfo> {
        let mut infos: Vec<KeyInfo> = self
            .keys
            .read()
            .values()
            .filter(|k| k.project == project)
            .map(KeyInfo::from)
            .collect();
        infos.sort_by_key(|k| k.activated_at);
        infos
    }

    /// Status of one key, `None` if the project has no such key.
    #[must_use]
    pub fn key_status(&self, key_id: &KeyId, project: ProjectId) -> Option<KeyStatus> {
        self.keys
            .read()
            .get(&(project, key_id.clone()))
            .map(|k| k.status)
    }

    /// Replaces the active key and migrates every version off the old one.
    ///
    /// The old key stays `rotating` unless every version migrated and the run
    /// was not cancelled; [`resume_rotation`](Self::resume_rotation) picks it
    /// up again.
    ///
    /// # Errors
    ///
    /// Returns an error if the new key cannot be created. Per-version
    /// failures are counted in the report.
    pub fn rotate_key(
        &self,
        project: ProjectId,
        target: &dyn RotationTarget,
        options: &RotationOptions,
    ) -> Result<RotationReport> {
        let raw = DataKey::generate(self.algorithm);
        let wrapped = self.provider.wrap_key(&raw)?;
        let new_key_id = KeyId::generate();
        let now = Utc::now();

        let old_key_id = {
            let mut keys = self.keys.write();
            let old = keys
                .values_mut()
                .find(|k| k.project == project && k.status == KeyStatus::Active);
            let old_key_id = old.map(|k| {
                k.status = KeyStatus::Rotating;
                k.key_id.clone()
            });
            keys.insert(
                (project, new_key_id.clone()),
                EncryptionKey {
                    project,
                    key_id: new_key_id.clone(),
                    key_type: self.algorithm,
                    wrapped,
                    status: KeyStatus::Active,
                    previous_key: old_key_id.clone(),
                    activated_at: now,
                    retired_at: None,
                },
            );
            old_key_id
        };

        info!(
            project = %project,
            old_key_id = ?old_key_id.as_ref().map(KeyId::as_str),
            new_key_id = %new_key_id,
            "rotating data key"
        );

        let Some(old_key_id) = old_key_id else {
            return Ok(RotationReport {
                project,
                old_key_id: None,
                new_key_id,
                migrated: 0,
                skipped: 0,
                failed: 0,
                cancelled: false,
                old_key_retired: false,
            });
        };

        self.migrate(project, old_key_id, new_key_id, target, options)
    }

    /// Continues migrating every key left in `rotating`.
    ///
    /// # Errors
    ///
    /// Returns an error if the project has no active key to migrate to.
    pub fn resume_rotation(
        &self,
        project: ProjectId,
        target: &dyn RotationTarget,
        options: &RotationOptions,
    ) -> Result<Vec<RotationReport>> {
        let rotating: Vec<KeyId> = self
            .keys
            .read()
            .values()
            .filter(|k| k.project == project && k.status == KeyStatus::Rotating)
            .map(|k| k.key_id.clone())
            .collect();
        if rotating.is_empty() {
            return Ok(Vec::new());
        }
        let active = self
            .active_key_id(project)
            .ok_or_else(|| Error::not_found("active key", project))?;

        let mut reports = Vec::with_capacity(rotating.len());
        for old_key_id in rotating {
            if options.cancel.is_cancelled() {
                break;
            }
            reports.push(self.migrate(project, old_key_id, active.clone(), target, options)?);
        }
        Ok(reports)
    }

    fn migrate(
        &self,
        project: ProjectId,
        old_key_id: KeyId,
        new_key_id: KeyId,
        target: &dyn RotationTarget,
        options: &RotationOptions,
    ) -> Result<RotationReport> {
        let old = self.get_key(&old_key_id, project)?;
        let new = self.get_key(&new_key_id, project)?;
        let rekeyer = Rekeyer::new(old_key_id.clone(), old, new_key_id.clone(), new);

        let mut report = RotationReport {
            project,
            old_key_id: Some(old_key_id.clone()),
            new_key_id,
            migrated: 0,
            skipped: 0,
            failed: 0,
            cancelled: false,
            old_key_retired: false,
        };

        // Writes that race the first listing can still land on the old key,
        // so keep listing until a pass finds nothing new.
        let mut settled: HashSet<VersionId> = HashSet::new();
        let mut pass = 0usize;
        'passes: loop {
            let pending: Vec<VersionId> = target
                .pending_versions(project, &old_key_id)
                .into_iter()
                .filter(|v| !settled.contains(v))
                .collect();
            if pending.is_empty() {
                break;
            }
            for (batch_index, batch) in pending.chunks(options.batch_size.max(1)).enumerate() {
                for version in batch {
                    if options.cancel.is_cancelled() {
                        report.cancelled = true;
                        break 'passes;
                    }
                    settled.insert(*version);
                    match target.migrate_version(*version, &rekeyer) {
                        Ok(MigrationOutcome::Migrated) => report.migrated += 1,
                        Ok(MigrationOutcome::Skipped) => report.skipped += 1,
                        Err(err) => {
                            warn!(
                                project = %project,
                                key_id = %old_key_id,
                                version = %version,
                                error = %err,
                                "failed to re-encrypt version, skipping"
                            );
                            report.failed += 1;
                        }
                    }
                }
                debug!(
                    project = %project,
                    pass,
                    batch = batch_index,
                    migrated = report.migrated,
                    failed = report.failed,
                    "rotation batch complete"
                );
            }
            pass += 1;
        }

        let clear = !report.cancelled
            && report.failed == 0
            && target.pending_versions(project, &old_key_id).is_empty();
        if clear {
            if let Some(key) = self.keys.write().get_mut(&(project, old_key_id.clone())) {
                key.status = KeyStatus::Retired;
                key.retired_at = Some(Utc::now());
                report.old_key_retired = true;
            }
        }

        info!(
            project = %project,
            old_key_id = %old_key_id,
            new_key_id = %report.new_key_id,
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            retired = report.old_key_retired,
            "key rotation finished"
        );
        Ok(report)
    }

    fn active_key_id(&self, project: ProjectId) -> Option<KeyId> {
        self.keys
            .read()
            .values()
            .find(|k| k.project == project && k.status == KeyStatus::Active)
            .map(|k| k.key_id.clone())
    }
}
