//! Access control for secret operations.
//!
//! Two kinds of grants are evaluated here:
//! - [`AccessToken`]: a bearer credential carrying its own permissions and
//!   environment/path allowlists
//! - [`AccessPolicy`]: a rule attached to a principal, with optional
//!   [`PolicyConditions`] (MFA, source IP, time window)
//!
//! Every check returns a plain `bool`. Turning a `false` into a refusal and
//! an `access_denied` audit record is the caller's job.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::types::{
    generate_credential, plaintext_credential, CredentialDigest, Permission, PermissionSet,
    PlaintextCredential, PolicyId, ProjectId, TokenId,
};

/// Length of the plaintext prefix stored for token lookup.
pub const TOKEN_LOOKUP_PREFIX_LENGTH: usize = 12;

/// Per-request facts consulted by policy conditions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Whether the caller completed MFA.
    pub mfa_verified: bool,
    /// Client address as presented, possibly malformed.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Evaluation time.
    pub now: DateTime<Utc>,
}

impl RequestContext {
    /// A context at the current time with no client details.
    #[must_use]
    pub fn now() -> Self {
        Self {
            mfa_verified: false,
            ip: None,
            user_agent: None,
            now: Utc::now(),
        }
    }

    /// Sets the client address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Marks MFA as verified.
    #[must_use]
    pub const fn with_mfa(mut self, verified: bool) -> Self {
        self.mfa_verified = verified;
        self
    }

    /// Sets the evaluation time.
    #[must_use]
    pub const fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Sets the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// The client address, if present and well-formed.
    #[must_use]
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.as_deref().and_then(|ip| ip.trim().parse().ok())
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::now()
    }
}

/// Matches client addresses against exact addresses and CIDR blocks.
///
/// Used by both token IP allowlists and policy `allowed_ips` conditions.
/// A malformed entry or a malformed client address makes [`matches`]
/// return `false`.
///
/// [`matches`]: IpMatcher::matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpMatcher {
    entries: Vec<String>,
}

impl IpMatcher {
    /// Creates a matcher over address or CIDR strings.
    #[must_use]
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if no entries are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the configured entries.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Checks `ip` against the entries.
    #[must_use]
    pub fn matches(&self, ip: Option<&str>) -> bool {
        let Some(ip) = ip.and_then(|ip| ip.trim().parse::<IpAddr>().ok()) else {
            return false;
        };
        let mut matched = false;
        for entry in &self.entries {
            match parse_entry(entry) {
                Some(net) => matched |= net.contains(&ip),
                None => return false,
            }
        }
        matched
    }
}

fn parse_entry(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if entry.contains('/') {
        entry.parse::<IpNet>().ok()
    } else {
        let ip = entry.parse::<IpAddr>().ok()?;
        let host_prefix = if ip.is_ipv4() { 32 } else { 128 };
        IpNet::new(ip, host_prefix).ok()
    }
}

/// Daily time window in a named timezone, inclusive at both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Window start, `HH:MM`.
    pub start: String,
    /// Window end, `HH:MM`.
    pub end: String,
    /// IANA timezone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl TimeWindow {
    /// Creates a validated window.
    ///
    /// Windows crossing midnight (`start > end`) are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed times, an unknown
    /// timezone, or `start > end`.
    pub fn new(start: &str, end: &str, timezone: Option<&str>) -> Result<Self> {
        let start_time = parse_hhmm(start)
            .ok_or_else(|| Error::validation(format!("invalid window start '{start}'")))?;
        let end_time =
            parse_hhmm(end).ok_or_else(|| Error::validation(format!("invalid window end '{end}'")))?;
        let timezone = timezone.unwrap_or("UTC");
        if timezone.parse::<Tz>().is_err() {
            return Err(Error::validation(format!("unknown timezone '{timezone}'")));
        }
        if start_time > end_time {
            return Err(Error::validation(format!(
                "time window {start}-{end} crosses midnight"
            )));
        }
        Ok(Self {
            start: start_time.format("%H:%M").to_string(),
            end: end_time.format("%H:%M").to_string(),
            timezone: timezone.to_string(),
        })
    }

    /// Checks whether `now`, in the window's timezone, falls inside it.
    ///
    /// Any malformed field, or `start > end`, yields `false`.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        let Ok(tz) = self.timezone.parse::<Tz>() else {
            return false;
        };
        if start > end {
            return false;
        }
        let local = now.with_timezone(&tz).format("%H:%M").to_string();
        let Some(local) = parse_hhmm(&local) else {
            return false;
        };
        start <= local && local <= end
    }
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Secondary predicates evaluated after a policy matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConditions {
    /// Require the caller to have completed MFA.
    #[serde(default)]
    pub require_mfa: bool,
    /// Restrict source addresses.
    #[serde(default)]
    pub allowed_ips: Option<IpMatcher>,
    /// Restrict time of day.
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
}

impl PolicyConditions {
    /// Evaluates every configured condition; absent ones pass.
    #[must_use]
    pub fn check(&self, ctx: &RequestContext) -> bool {
        if self.require_mfa && !ctx.mfa_verified {
            return false;
        }
        if let Some(ips) = &self.allowed_ips {
            if !ips.is_empty() && !ips.matches(ctx.ip.as_deref()) {
                return false;
            }
        }
        if let Some(window) = &self.time_window {
            if !window.contains(ctx.now) {
                return false;
            }
        }
        true
    }
}

fn environment_allowed(allowlist: &[String], env_slug: &str) -> bool {
    allowlist.is_empty() || allowlist.iter().any(|e| e == env_slug)
}

/// Checks a secret path against glob patterns. An empty list allows all;
/// invalid patterns never match.
#[must_use]
pub fn path_allowed(patterns: &[String], path: &str) -> bool {
    patterns.is_empty()
        || patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern).is_ok_and(|compiled| compiled.matches(path))
        })
}

/// Restrictions attached to a new token.
#[derive(Debug, Clone, Default)]
pub struct TokenOptions {
    /// Granted permissions.
    pub permissions: PermissionSet,
    /// Environment slugs; empty means all.
    pub environments: Vec<String>,
    /// Path globs; empty means all.
    pub paths: Vec<String>,
    /// Client addresses; empty means any.
    pub allowed_ips: IpMatcher,
    /// Expiry time.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenOptions {
    /// Options granting `permissions` everywhere.
    #[must_use]
    pub fn new(permissions: PermissionSet) -> Self {
        Self {
            permissions,
            ..Self::default()
        }
    }

    /// Restricts the token to environment slugs.
    #[must_use]
    pub fn environments<I, S>(mut self, slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = slugs.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the token to path globs.
    #[must_use]
    pub fn paths<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = globs.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the token to client addresses.
    #[must_use]
    pub fn allowed_ips(mut self, matcher: IpMatcher) -> Self {
        self.allowed_ips = matcher;
        self
    }

    /// Sets the expiry.
    #[must_use]
    pub const fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// A bearer credential. Only its digest and lookup prefix are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    /// Token identifier.
    pub id: TokenId,
    /// Owning project.
    pub project: ProjectId,
    /// Display name.
    pub name: String,
    /// Digest of the plaintext token.
    pub digest: CredentialDigest,
    /// First characters of the plaintext, for lookup.
    pub prefix: String,
    /// Granted permissions.
    pub permissions: PermissionSet,
    /// Environment slugs; empty means all.
    pub environments: Vec<String>,
    /// Path globs; empty means all.
    pub paths: Vec<String>,
    /// Client addresses; empty means any.
    #[serde(default)]
    pub allowed_ips: IpMatcher,
    /// Expiry time.
    pub expires_at: Option<DateTime<Utc>>,
    /// Inactive tokens authorize nothing.
    pub active: bool,
    /// When the token was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful use.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Number of successful uses.
    pub use_count: u64,
}

impl AccessToken {
    /// Creates a token and returns it with its plaintext.
    #[must_use]
    pub fn issue(
        project: ProjectId,
        name: impl Into<String>,
        token_prefix: &str,
        options: TokenOptions,
    ) -> (Self, PlaintextCredential) {
        let plaintext = generate_credential(token_prefix);
        let token = Self {
            id: TokenId::new(),
            project,
            name: name.into(),
            digest: CredentialDigest::of(&plaintext),
            prefix: lookup_prefix(&plaintext),
            permissions: options.permissions,
            environments: options.environments,
            paths: options.paths,
            allowed_ips: options.allowed_ips,
            expires_at: options.expires_at,
            active: true,
            revoked_at: None,
            created_at: Utc::now(),
            last_used_at: None,
            use_count: 0,
        };
        (token, plaintext_credential(plaintext))
    }

    /// Replaces the token secret. The old plaintext stops verifying.
    #[must_use]
    pub fn regenerate(&mut self, token_prefix: &str) -> PlaintextCredential {
        let plaintext = generate_credential(token_prefix);
        self.digest = CredentialDigest::of(&plaintext);
        self.prefix = lookup_prefix(&plaintext);
        plaintext_credential(plaintext)
    }

    /// Verifies a presented plaintext in constant time.
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        let prefix_ok: bool = lookup_prefix(presented)
            .as_bytes()
            .ct_eq(self.prefix.as_bytes())
            .into();
        prefix_ok & self.digest.verify(presented)
    }

    /// Returns true if the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Revokes the token.
    pub fn revoke(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.revoked_at = Some(now);
    }

    /// Records a successful use.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.last_used_at = Some(now);
        self.use_count = self.use_count.saturating_add(1);
    }

    /// Checks every token restriction. All must pass.
    #[must_use]
    pub fn authorize(
        &self,
        permission: Permission,
        env_slug: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.active
            && self.revoked_at.is_none()
            && !self.is_expired(now)
            && environment_allowed(&self.environments, env_slug)
            && path_allowed(&self.paths, path)
            && self.permissions.allows(permission)
    }

    /// [`authorize`](Self::authorize) plus the token's IP allowlist.
    #[must_use]
    pub fn authorize_request(
        &self,
        permission: Permission,
        env_slug: &str,
        path: &str,
        ctx: &RequestContext,
    ) -> bool {
        self.authorize(permission, env_slug, path, ctx.now)
            && (self.allowed_ips.is_empty() || self.allowed_ips.matches(ctx.ip.as_deref()))
    }
}

fn lookup_prefix(plaintext: &str) -> String {
    plaintext.chars().take(TOKEN_LOOKUP_PREFIX_LENGTH).collect()
}

/// Token store with prefix lookup.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<TokenId, AccessToken>>,
}

impl TokenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a token.
    pub fn insert(&self, token: AccessToken) {
        self.tokens.write().insert(token.id, token);
    }

    /// Looks up a token by id.
    #[must_use]
    pub fn get(&self, id: TokenId) -> Option<AccessToken> {
        self.tokens.read().get(&id).cloned()
    }

    /// Finds the token a presented plaintext belongs to.
    #[must_use]
    pub fn authenticate(&self, project: ProjectId, presented: &str) -> Option<AccessToken> {
        let prefix = lookup_prefix(presented);
        self.tokens
            .read()
            .values()
            .filter(|t| t.project == project && t.prefix == prefix)
            .find(|t| t.verify(presented))
            .cloned()
    }

    /// Lists a project's tokens.
    #[must_use]
    pub fn list(&self, project: ProjectId) -> Vec<AccessToken> {
        let mut tokens: Vec<AccessToken> = self
            .tokens
            .read()
            .values()
            .filter(|t| t.project == project)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.created_at);
        tokens
    }

    /// Revokes a token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the token does not exist.
    pub fn revoke(&self, id: TokenId) -> Result<()> {
        self.tokens
            .write()
            .get_mut(&id)
            .map(|t| t.revoke(Utc::now()))
            .ok_or_else(|| Error::not_found("token", id))
    }

    /// Bumps usage counters.
    pub fn record_use(&self, id: TokenId, now: DateTime<Utc>) {
        if let Some(token) = self.tokens.write().get_mut(&id) {
            token.record_use(now);
        }
    }
}

/// What a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    /// A single user.
    User,
    /// Every member of a group.
    Group,
    /// A service account.
    ServiceAccount,
    /// An access token.
    Token,
}

impl PrincipalType {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::ServiceAccount => "service_account",
            Self::Token => "token",
        }
    }
}

/// A principal a caller acts as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Principal kind.
    pub principal_type: PrincipalType,
    /// Principal identifier.
    pub principal_id: String,
}

impl Principal {
    /// A user principal.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            principal_type: PrincipalType::User,
            principal_id: id.into(),
        }
    }

    /// A group principal.
    #[must_use]
    pub fn group(id: impl Into<String>) -> Self {
        Self {
            principal_type: PrincipalType::Group,
            principal_id: id.into(),
        }
    }

    /// A service account principal.
    #[must_use]
    pub fn service_account(id: impl Into<String>) -> Self {
        Self {
            principal_type: PrincipalType::ServiceAccount,
            principal_id: id.into(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.principal_type.as_str(), self.principal_id)
    }
}

/// A declarative access rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Policy identifier.
    pub id: PolicyId,
    /// Owning project.
    pub project: ProjectId,
    /// Display name.
    pub name: String,
    /// Who the policy applies to.
    #[serde(flatten)]
    pub principal: Principal,
    /// Environment slugs; empty means all.
    pub environments: Vec<String>,
    /// Path globs; empty means all.
    pub paths: Vec<String>,
    /// Granted permissions.
    pub permissions: PermissionSet,
    /// Secondary predicates.
    pub conditions: Option<PolicyConditions>,
    /// Disabled policies never match.
    pub enabled: bool,
}

impl AccessPolicy {
    /// Creates an enabled policy without restrictions or conditions.
    #[must_use]
    pub fn new(
        project: ProjectId,
        name: impl Into<String>,
        principal: Principal,
        permissions: PermissionSet,
    ) -> Self {
        Self {
            id: PolicyId::new(),
            project,
            name: name.into(),
            principal,
            environments: Vec::new(),
            paths: Vec::new(),
            permissions,
            conditions: None,
            enabled: true,
        }
    }

    /// Restricts the policy to environment slugs.
    #[must_use]
    pub fn with_environments<I, S>(mut self, slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = slugs.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the policy to path globs.
    #[must_use]
    pub fn with_paths<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = globs.into_iter().map(Into::into).collect();
        self
    }

    /// Attaches conditions.
    #[must_use]
    pub fn with_conditions(mut self, conditions: PolicyConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Enables or disables the policy.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Checks enabled state, environment, path and permission.
    #[must_use]
    pub fn matches(&self, path: &str, env_slug: &str, permission: Permission) -> bool {
        self.enabled
            && environment_allowed(&self.environments, env_slug)
            && path_allowed(&self.paths, path)
            && self.permissions.allows(permission)
    }

    /// Evaluates the conditions block; none means pass.
    #[must_use]
    pub fn check_conditions(&self, ctx: &RequestContext) -> bool {
        self.conditions.as_ref().is_none_or(|c| c.check(ctx))
    }

    /// Returns true if the policy applies to any of `principals`.
    #[must_use]
    pub fn applies_to(&self, principals: &[Principal]) -> bool {
        principals.contains(&self.principal)
    }
}

/// Grants access if any applicable policy matches and its conditions pass.
#[must_use]
pub fn policies_allow(
    policies: &[AccessPolicy],
    principals: &[Principal],
    permission: Permission,
    env_slug: &str,
    path: &str,
    ctx: &RequestContext,
) -> bool {
    policies.iter().any(|policy| {
        policy.applies_to(principals)
            && policy.matches(path, env_slug, permission)
            && policy.check_conditions(ctx)
    })
}
