//! Secret version rows and the table that holds them.
//!
//! The table is the single place that enforces the version invariants:
//! `(secret, environment, version)` is unique, and each pair has at most one
//! row flagged current. Violations surface as [`Error::Conflict`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encryption::EncryptedPayload;
use crate::error::{Error, Result};
use crate::types::{EnvironmentId, KeyId, ProjectId, SecretId, VersionId};

/// Identifies the `(secret, environment)` pair a version belongs to.
pub type PairKey = (SecretId, EnvironmentId);

/// One write-once encrypted value of a secret in an environment.
///
/// Only the current flag, the HOTP counter and (during key rotation) the
/// payload key change after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersion {
    /// Row identifier.
    pub id: VersionId,
    /// Owning project.
    pub project: ProjectId,
    /// Owning secret.
    pub secret: SecretId,
    /// Environment the value applies to.
    pub environment: EnvironmentId,
    /// 1-based, monotonic per pair.
    pub version: u32,
    /// Whether reads use this row.
    pub is_current: bool,
    /// The encrypted value.
    pub value: EncryptedPayload,
    /// Plaintext length in bytes.
    pub value_length: usize,
    /// blake3 hex digest of the plaintext.
    pub value_hash: String,
    /// Username of a credential secret. Not secret.
    pub username: Option<String>,
    /// Encrypted OTP seed of a credential secret.
    pub otp_seed: Option<EncryptedPayload>,
    /// Next HOTP counter.
    pub hotp_counter: u64,
    /// Actor that wrote the version.
    pub created_by: String,
    /// Free-form note.
    pub change_note: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl SecretVersion {
    /// Returns the pair this version belongs to.
    #[must_use]
    pub const fn pair(&self) -> PairKey {
        (self.secret, self.environment)
    }

    /// Returns true if any payload on the row is sealed by `key_id`.
    #[must_use]
    pub fn uses_key(&self, key_id: &KeyId) -> bool {
        &self.value.key_id == key_id
            || self
                .otp_seed
                .as_ref()
                .is_some_and(|seed| &seed.key_id == key_id)
    }

    /// Metadata view without ciphertext.
    #[must_use]
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            secret: self.secret,
            environment: self.environment,
            version: self.version,
            is_current: self.is_current,
            value_length: self.value_length,
            value_hash: self.value_hash.clone(),
            key_id: self.value.key_id.clone(),
            username: self.username.clone(),
            has_otp_seed: self.otp_seed.is_some(),
            hotp_counter: self.hotp_counter,
            created_by: self.created_by.clone(),
            change_note: self.change_note.clone(),
            created_at: self.created_at,
        }
    }
}

/// Version metadata returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    /// Row identifier.
    pub id: VersionId,
    /// Owning secret.
    pub secret: SecretId,
    /// Environment.
    pub environment: EnvironmentId,
    /// Version number.
    pub version: u32,
    /// Current flag.
    pub is_current: bool,
    /// Plaintext length.
    pub value_length: usize,
    /// Plaintext digest.
    pub value_hash: String,
    /// Key sealing the value.
    pub key_id: KeyId,
    /// Credential username.
    pub username: Option<String>,
    /// Whether an OTP seed is stored.
    pub has_otp_seed: bool,
    /// Next HOTP counter.
    pub hotp_counter: u64,
    /// Author.
    pub created_by: String,
    /// Note.
    pub change_note: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// In-memory version table.
#[derive(Debug, Default)]
pub struct VersionTable {
    rows: HashMap<VersionId, SecretVersion>,
    by_pair: HashMap<PairKey, Vec<VersionId>>,
}

impl VersionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] for a duplicate version number or a second
    /// current row in the pair.
    pub fn insert(&mut self, row: SecretVersion) -> Result<()> {
        let pair = row.pair();
        if self.pair_rows(pair).any(|r| r.version == row.version) {
            return Err(Error::conflict(format!(
                "version {} already exists for secret {} in environment {}",
                row.version, row.secret, row.environment
            )));
        }
        if row.is_current && self.current(pair).is_some() {
            return Err(Error::conflict(format!(
                "secret {} already has a current version in environment {}",
                row.secret, row.environment
            )));
        }
        self.by_pair.entry(pair).or_default().push(row.id);
        self.rows.insert(row.id, row);
        Ok(())
    }

    /// Makes `row` the current version of its pair in one step.
    ///
    /// The row must carry `max(version) + 1`. Nothing changes on error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the version number is not the next one.
    pub fn commit_current(&mut self, mut row: SecretVersion) -> Result<()> {
        let pair = row.pair();
        let expected = self.max_version(pair) + 1;
        if row.version != expected {
            return Err(Error::conflict(format!(
                "version {} is not the next version ({expected}) of secret {}",
                row.version, row.secret
            )));
        }
        let previous = self.current(pair).map(|r| r.id);
        if let Some(previous) = previous {
            if let Some(prev) = self.rows.get_mut(&previous) {
                prev.is_current = false;
            }
        }
        row.is_current = true;
        self.insert(row)
    }

    /// The current row of a pair.
    #[must_use]
    pub fn current(&self, pair: PairKey) -> Option<&SecretVersion> {
        self.pair_rows(pair).find(|r| r.is_current)
    }

    /// A specific version of a pair.
    #[must_use]
    pub fn version(&self, pair: PairKey, version: u32) -> Option<&SecretVersion> {
        self.pair_rows(pair).find(|r| r.version == version)
    }

    /// Highest version number in a pair, or 0.
    #[must_use]
    pub fn max_version(&self, pair: PairKey) -> u32 {
        self.pair_rows(pair).map(|r| r.version).max().unwrap_or(0)
    }

    /// Rows of a pair, newest first.
    #[must_use]
    pub fn history(&self, pair: PairKey) -> Vec<&SecretVersion> {
        let mut rows: Vec<&SecretVersion> = self.pair_rows(pair).collect();
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        rows
    }

    /// Looks up a row by id.
    #[must_use]
    pub fn get(&self, id: VersionId) -> Option<&SecretVersion> {
        self.rows.get(&id)
    }

    /// Mutable access for in-place counter and rotation updates.
    pub(crate) fn get_mut(&mut self, id: VersionId) -> Option<&mut SecretVersion> {
        self.rows.get_mut(&id)
    }

    /// Returns true if any row belongs to `secret`.
    #[must_use]
    pub fn has_secret(&self, secret: SecretId) -> bool {
        self.by_pair.keys().any(|(s, _)| *s == secret)
    }

    /// Returns true if any row references `environment`.
    #[must_use]
    pub fn has_environment(&self, environment: EnvironmentId) -> bool {
        self.by_pair
            .iter()
            .any(|((_, e), ids)| *e == environment && !ids.is_empty())
    }

    /// Rows of a project with any payload sealed by `key_id`.
    #[must_use]
    pub fn using_key(&self, project: ProjectId, key_id: &KeyId) -> Vec<VersionId> {
        let mut ids: Vec<(DateTime<Utc>, VersionId)> = self
            .rows
            .values()
            .filter(|r| r.project == project && r.uses_key(key_id))
            .map(|r| (r.created_at, r.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn pair_rows(&self, pair: PairKey) -> impl Iterator<Item = &SecretVersion> {
        self.by_pair
            .get(&pair)
            .into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pair: PairKey, version: u32, is_current: bool) -> SecretVersion {
        SecretVersion {
            id: VersionId::new(),
            project: ProjectId::new(),
            secret: pair.0,
            environment: pair.1,
            version,
            is_current,
            value: EncryptedPayload {
                ciphertext: vec![1, 2, 3],
                iv: vec![0; 12],
                key_id: KeyId::new("key_a"),
            },
            value_length: 3,
            value_hash: "h".into(),
            username: None,
            otp_seed: None,
            hotp_counter: 0,
            created_by: "user:u1".into(),
            change_note: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_rejects_duplicate_version() {
        let mut table = VersionTable::new();
        let pair = (SecretId::new(), EnvironmentId::new());
        table.insert(row(pair, 1, false)).expect("insert");
        assert!(matches!(
            table.insert(row(pair, 1, false)),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn insert_rejects_second_current() {
        let mut table = VersionTable::new();
        let pair = (SecretId::new(), EnvironmentId::new());
        table.insert(row(pair, 1, true)).expect("insert");
        assert!(matches!(
            table.insert(row(pair, 2, true)),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn commit_current_flips_flag() {
        let mut table = VersionTable::new();
        let pair = (SecretId::new(), EnvironmentId::new());
        for version in 1..=3 {
            table.commit_current(row(pair, version, false)).expect("commit");
            let current: Vec<_> = table.history(pair).into_iter().filter(|r| r.is_current).collect();
            assert_eq!(current.len(), 1);
            assert_eq!(current[0].version, version);
        }
        assert_eq!(table.max_version(pair), 3);
        assert!(table.has_environment(pair.1));
        assert!(table.has_secret(pair.0));
    }

    #[test]
    fn commit_current_requires_next_number() {
        let mut table = VersionTable::new();
        let pair = (SecretId::new(), EnvironmentId::new());
        table.commit_current(row(pair, 1, false)).expect("commit");
        assert!(table.commit_current(row(pair, 3, false)).is_err());
        assert!(table.commit_current(row(pair, 1, false)).is_err());
        assert_eq!(table.current(pair).map(|r| r.version), Some(1));
    }
}
