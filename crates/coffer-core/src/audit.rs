//! Append-only audit trail.
//!
//! Every security-relevant event becomes one [`AuditRecord`]. Records are
//! written through an [`AuditSink`], which only ever appends: updating or
//! deleting a record is rejected by the sink itself with
//! [`Error::ImmutableRecord`]. [`AuditLog::record`] returns only after the
//! sink has accepted the record, so a failing sink fails the operation that
//! triggered it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Actor, ProjectId};

/// Kind of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A secret was created.
    SecretCreate,
    /// A secret value was resolved.
    SecretRead,
    /// A new secret version was written.
    SecretWrite,
    /// A prior version was restored as a new version.
    SecretRollback,
    /// A secret was archived.
    SecretArchive,
    /// An archived secret was restored.
    SecretRestore,
    /// A secret without versions was deleted.
    SecretDelete,
    /// Version history was listed.
    VersionsList,
    /// A credential was written.
    CredentialWrite,
    /// An OTP code was generated.
    OtpGenerate,
    /// An OTP code was verified.
    OtpVerify,
    /// An environment was created.
    EnvironmentCreate,
    /// An environment was deleted.
    EnvironmentDelete,
    /// A data key was rotated.
    KeyRotate,
    /// An access token was issued.
    TokenCreate,
    /// An access token was revoked.
    TokenRevoke,
    /// An access policy was added.
    PolicyCreate,
    /// An environment was exported.
    SecretsExport,
    /// Values were imported into an environment.
    SecretsImport,
    /// The audit trail was queried.
    AuditQuery,
    /// An authorization check failed.
    AccessDenied,
}

impl AuditAction {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SecretCreate => "secret_create",
            Self::SecretRead => "secret_read",
            Self::SecretWrite => "secret_write",
            Self::SecretRollback => "secret_rollback",
            Self::SecretArchive => "secret_archive",
            Self::SecretRestore => "secret_restore",
            Self::SecretDelete => "secret_delete",
            Self::VersionsList => "versions_list",
            Self::CredentialWrite => "credential_write",
            Self::OtpGenerate => "otp_generate",
            Self::OtpVerify => "otp_verify",
            Self::EnvironmentCreate => "environment_create",
            Self::EnvironmentDelete => "environment_delete",
            Self::KeyRotate => "key_rotate",
            Self::TokenCreate => "token_create",
            Self::TokenRevoke => "token_revoke",
            Self::PolicyCreate => "policy_create",
            Self::SecretsExport => "secrets_export",
            Self::SecretsImport => "secrets_import",
            Self::AuditQuery => "audit_query",
            Self::AccessDenied => "access_denied",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of resource an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A secret or one of its versions.
    Secret,
    /// An environment.
    Environment,
    /// A data key.
    EncryptionKey,
    /// An access token.
    AccessToken,
    /// An access policy.
    AccessPolicy,
    /// A whole project.
    Project,
}

/// One immutable audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record identifier.
    pub id: Uuid,
    /// Project the event belongs to.
    pub project: ProjectId,
    /// What happened.
    pub action: AuditAction,
    /// Kind of resource.
    pub resource_type: ResourceType,
    /// Resource identifier.
    pub resource_id: Option<String>,
    /// Resource path, for secrets.
    pub resource_path: Option<String>,
    /// Who did it.
    pub actor: Actor,
    /// Client address.
    pub ip: Option<IpAddr>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Environment slug, if any.
    pub environment: Option<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message for failed operations.
    pub error: Option<String>,
    /// Free-form details.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a successful record.
    #[must_use]
    pub fn new(project: ProjectId, action: AuditAction, resource_type: ResourceType, actor: Actor) -> Self {
        Self {
            id: Uuid::new_v4(),
            project,
            action,
            resource_type,
            resource_id: None,
            resource_path: None,
            actor,
            ip: None,
            user_agent: None,
            environment: None,
            success: true,
            error: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the resource id.
    #[must_use]
    pub fn with_resource_id(mut self, id: impl ToString) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    /// Sets the resource path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.resource_path = Some(path.into());
        self
    }

    /// Sets the environment slug.
    #[must_use]
    pub fn with_environment(mut self, slug: impl Into<String>) -> Self {
        self.environment = Some(slug.into());
        self
    }

    /// Sets the client address.
    #[must_use]
    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip;
        self
    }

    /// Sets the client user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Marks the record as a failure.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Filter criteria for querying audit records.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by project.
    pub project: Option<ProjectId>,
    /// Filter by action.
    pub action: Option<AuditAction>,
    /// Filter by resource id.
    pub resource_id: Option<String>,
    /// Filter by actor id.
    pub actor_id: Option<String>,
    /// Filter by environment slug.
    pub environment: Option<String>,
    /// Filter by outcome.
    pub success: Option<bool>,
    /// Records created after this time.
    pub after: Option<DateTime<Utc>>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Creates a filter that matches every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by project.
    #[must_use]
    pub fn for_project(mut self, project: ProjectId) -> Self {
        self.project = Some(project);
        self
    }

    /// Filters by action.
    #[must_use]
    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Filters by resource id.
    #[must_use]
    pub fn for_resource(mut self, id: impl ToString) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    /// Filters by actor id.
    #[must_use]
    pub fn by_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Filters by environment slug.
    #[must_use]
    pub fn in_environment(mut self, slug: impl Into<String>) -> Self {
        self.environment = Some(slug.into());
        self
    }

    /// Keeps only failures (`false`) or only successes (`true`).
    #[must_use]
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    /// Records created after `time`.
    #[must_use]
    pub fn after(mut self, time: DateTime<Utc>) -> Self {
        self.after = Some(time);
        self
    }

    /// Limits the number of returned records.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Checks whether a record matches.
    #[must_use]
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.project.is_none_or(|p| record.project == p)
            && self.action.is_none_or(|a| record.action == a)
            && self
                .resource_id
                .as_ref()
                .is_none_or(|id| record.resource_id.as_ref() == Some(id))
            && self.actor_id.as_ref().is_none_or(|id| &record.actor.id == id)
            && self
                .environment
                .as_ref()
                .is_none_or(|env| record.environment.as_ref() == Some(env))
            && self.success.is_none_or(|s| record.success == s)
            && self.after.is_none_or(|t| record.created_at > t)
    }

    /// Sorts oldest-first input newest first and applies the limit. Equal
    /// timestamps keep reverse insertion order.
    fn finish(&self, mut records: Vec<AuditRecord>) -> Vec<AuditRecord> {
        records.reverse();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

/// Append-only storage for audit records.
///
/// The trait only appends and reads. Changing a persisted record goes through
/// the inherent `update` and `delete` on `dyn AuditSink`, which always fail
/// with [`Error::ImmutableRecord`] and cannot be overridden by a sink.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Persists a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audit`] if the record could not be stored.
    fn append(&self, record: &AuditRecord) -> Result<()>;

    /// Returns matching records, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audit`] if the sink cannot be read.
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>>;
}

impl dyn AuditSink + '_ {
    /// Rejects any update of a persisted record.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::ImmutableRecord`].
    pub fn update(&self, id: Uuid, _record: &AuditRecord) -> Result<()> {
        Err(Error::ImmutableRecord { id: id.to_string() })
    }

    /// Rejects any deletion of a persisted record.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::ImmutableRecord`].
    pub fn delete(&self, id: Uuid) -> Result<()> {
        Err(Error::ImmutableRecord { id: id.to_string() })
    }
}

/// An in-memory audit sink.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no record has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        let matching = self
            .records
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(filter.finish(matching))
    }
}

/// Audit sink writing one JSON document per line to a file opened for append.
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAuditSink {
    /// Opens (or creates) the file in append-only mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audit`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Audit {
                reason: format!("failed to open audit file {}: {e}", path.display()),
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the audit file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for JsonLinesAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)
            .and_then(|()| file.flush())
            .map_err(|e| Error::Audit {
                reason: format!("failed to write audit record: {e}"),
            })
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        let file = File::open(&self.path).map_err(|e| Error::Audit {
            reason: format!("failed to read audit file {}: {e}", self.path.display()),
        })?;

        let mut matching = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::Audit {
                reason: format!("failed to read audit file: {e}"),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)?;
            if filter.matches(&record) {
                matching.push(record);
            }
        }
        Ok(filter.finish(matching))
    }
}

/// The audit log used by the vault.
#[derive(Debug, Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    mirror_to_tracing: bool,
}

impl AuditLog {
    /// Creates a log over `sink`, mirroring records to `tracing`.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            mirror_to_tracing: true,
        }
    }

    /// Creates a log over a fresh in-memory sink.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditSink::new()))
    }

    /// Enables or disables the `tracing` mirror.
    #[must_use]
    pub const fn with_tracing_mirror(mut self, enabled: bool) -> Self {
        self.mirror_to_tracing = enabled;
        self
    }

    /// Returns the underlying sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Persists a record. Returns once the sink has accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audit`] if the sink fails.
    pub fn record(&self, record: AuditRecord) -> Result<()> {
        self.sink.append(&record).map_err(|err| match err {
            Error::Audit { .. } => err,
            other => Error::Audit {
                reason: other.to_string(),
            },
        })?;
        if self.mirror_to_tracing {
            mirror(&record);
        }
        Ok(())
    }

    /// Records a secret read or a denied access in one call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audit`] if the sink fails.
    #[allow(clippy::too_many_arguments)]
    pub fn log_access(
        &self,
        project: ProjectId,
        secret_path: &str,
        environment: &str,
        actor: &Actor,
        ip: Option<IpAddr>,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let action = if success {
            AuditAction::SecretRead
        } else {
            AuditAction::AccessDenied
        };
        let mut record = AuditRecord::new(project, action, ResourceType::Secret, actor.clone())
            .with_path(secret_path)
            .with_environment(environment)
            .with_ip(ip);
        if !success {
            record = record.failed(error.unwrap_or("access denied"));
        }
        self.record(record)
    }

    /// Queries the sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audit`] if the sink cannot be read.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        self.sink.query(filter)
    }
}

fn mirror(record: &AuditRecord) {
    let action = record.action.as_str();
    let path = record.resource_path.as_deref().unwrap_or("-");
    let environment = record.environment.as_deref().unwrap_or("-");
    if record.success {
        tracing::info!(
            target: "coffer_audit",
            audit_id = %record.id,
            project = %record.project,
            action,
            actor = %record.actor,
            path,
            environment,
            "[AUDIT] {action}"
        );
    } else {
        tracing::warn!(
            target: "coffer_audit",
            audit_id = %record.id,
            project = %record.project,
            action,
            actor = %record.actor,
            path,
            environment,
            error = record.error.as_deref().unwrap_or(""),
            "[AUDIT] {action} failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(project: ProjectId, action: AuditAction) -> AuditRecord {
        AuditRecord::new(project, action, ResourceType::Secret, Actor::user("u1", "alice"))
            .with_path("DB_PASSWORD")
            .with_environment("production")
    }

    #[test]
    fn action_serializes_snake_case() {
        let json = serde_json::to_string(&AuditAction::AccessDenied).expect("serialize");
        assert_eq!(json, r#""access_denied""#);
        assert_eq!(AuditAction::AccessDenied.to_string(), "access_denied");
    }

    #[test]
    fn memory_sink_query_filters_newest_first() {
        let sink = MemoryAuditSink::new();
        let project = ProjectId::new();
        let mut first = record(project, AuditAction::SecretWrite);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        sink.append(&first).expect("append");
        sink.append(&record(project, AuditAction::SecretRead)).expect("append");
        sink.append(&record(ProjectId::new(), AuditAction::SecretRead))
            .expect("append");

        let all = sink
            .query(&AuditFilter::new().for_project(project))
            .expect("query");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, AuditAction::SecretRead);

        let writes = sink
            .query(&AuditFilter::new().with_action(AuditAction::SecretWrite))
            .expect("query");
        assert_eq!(writes.len(), 1);

        let limited = sink.query(&AuditFilter::new().limit(1)).expect("query");
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn sinks_reject_update_and_delete() {
        let memory = Arc::new(MemoryAuditSink::new());
        let sink: Arc<dyn AuditSink> = memory.clone();
        let rec = record(ProjectId::new(), AuditAction::SecretRead);
        sink.append(&rec).expect("append");

        assert!(matches!(sink.update(rec.id, &rec), Err(Error::ImmutableRecord { .. })));
        assert!(matches!(sink.delete(rec.id), Err(Error::ImmutableRecord { .. })));
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn log_access_records_denial() {
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new(sink.clone()).with_tracing_mirror(false);
        let project = ProjectId::new();
        let actor = Actor::user("u1", "alice");

        log.log_access(project, "DB_PASSWORD", "staging", &actor, None, true, None)
            .expect("log");
        log.log_access(
            project,
            "DB_PASSWORD",
            "production",
            &actor,
            "10.0.0.1".parse().ok(),
            false,
            Some("token lacks read"),
        )
        .expect("log");

        let denied = log
            .query(&AuditFilter::new().with_action(AuditAction::AccessDenied))
            .expect("query");
        assert_eq!(denied.len(), 1);
        assert!(!denied[0].success);
        assert_eq!(denied[0].error.as_deref(), Some("token lacks read"));
        assert_eq!(denied[0].environment.as_deref(), Some("production"));
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn json_lines_sink_appends_and_reopens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let project = ProjectId::new();

        {
            let sink = JsonLinesAuditSink::open(&path).expect("open");
            sink.append(&record(project, AuditAction::SecretWrite)).expect("append");
        }
        let sink = JsonLinesAuditSink::open(&path).expect("reopen");
        sink.append(&record(project, AuditAction::SecretRead)).expect("append");

        let records = sink
            .query(&AuditFilter::new().for_project(project))
            .expect("query");
        assert_eq!(records.len(), 2);
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), 2);
        let sink: &dyn AuditSink = &sink;
        assert!(matches!(sink.delete(records[0].id), Err(Error::ImmutableRecord { .. })));
    }

    #[derive(Debug)]
    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn append(&self, _record: &AuditRecord) -> Result<()> {
            Err(Error::ExternalUnavailable {
                reason: "disk full".into(),
            })
        }

        fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn sink_failure_surfaces_as_audit_error() {
        let log = AuditLog::new(Arc::new(BrokenSink)).with_tracing_mirror(false);
        let result = log.record(record(ProjectId::new(), AuditAction::SecretRead));
        assert!(matches!(result, Err(Error::Audit { .. })));
    }

    /// Counts events on the `coffer_audit` target.
    #[derive(Clone, Default)]
    struct AuditEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for AuditEvents {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if event.metadata().target() == "coffer_audit" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn mirrored_events(f: impl FnOnce()) -> usize {
        use tracing_subscriber::layer::SubscriberExt;

        let events = AuditEvents::default();
        let subscriber = tracing_subscriber::registry().with(events.clone());
        tracing::subscriber::with_default(subscriber, f);
        events.0.load(Ordering::SeqCst)
    }

    #[test]
    fn only_persisted_records_are_mirrored() {
        let broken = AuditLog::new(Arc::new(BrokenSink));
        let failed = mirrored_events(|| {
            assert!(broken
                .record(record(ProjectId::new(), AuditAction::SecretRead))
                .is_err());
        });
        assert_eq!(failed, 0);

        let working = AuditLog::in_memory();
        let stored = mirrored_events(|| {
            working
                .record(record(ProjectId::new(), AuditAction::SecretRead))
                .expect("record");
        });
        assert_eq!(stored, 1);
    }
}
