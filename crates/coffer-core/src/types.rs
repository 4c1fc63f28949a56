//! Core types shared across the vault.
//!
//! - Identifiers for projects, secrets, environments, versions and keys
//! - [`SecretName`]: a validated canonical secret key
//! - [`SecretValue`]: decrypted plaintext that zeroizes on drop
//! - [`Permission`] and [`PermissionSet`]
//! - [`SecretType`] and the OTP settings bound to credential secrets
//! - [`Actor`]: who performed an operation, for audit attribution
//! - [`Project`]: the tenant boundary and its bearer keys

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies a project (tenant).
    ProjectId
);
uuid_id!(
    /// Identifies a logical secret.
    SecretId
);
uuid_id!(
    /// Identifies an environment node.
    EnvironmentId
);
uuid_id!(
    /// Identifies a single secret version row.
    VersionId
);
uuid_id!(
    /// Identifies an access token.
    TokenId
);
uuid_id!(
    /// Identifies an access policy.
    PolicyId
);

/// Identifies a data key within a project.
///
/// Key ids are opaque strings of the form `key_<32 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Generates a new random key id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("key_{}", Uuid::new_v4().simple()))
    }

    /// Wraps an existing key id string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the key id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static SECRET_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap_or_else(|_| unreachable!()));

static FOLDER_SEGMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap_or_else(|_| unreachable!()));

/// A canonical secret key such as `DATABASE_URL`.
///
/// Secret names must:
/// - Start with an uppercase ASCII letter
/// - Contain only uppercase letters, digits and underscores
/// - Be at most 256 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretName(String);

impl SecretName {
    /// Maximum length of a secret name.
    pub const MAX_LENGTH: usize = 256;

    /// Creates a new `SecretName` after validating the input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the name is malformed.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::validation("secret key cannot be empty"));
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(Error::validation(format!(
                "secret key exceeds maximum length of {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !SECRET_NAME_REGEX.is_match(&name) {
            return Err(Error::validation(format!(
                "secret key '{name}' must match [A-Z][A-Z0-9_]*"
            )));
        }
        Ok(Self(name))
    }

    /// Normalizes loose input (`database-url`) into canonical form
    /// (`DATABASE_URL`) and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the normalized name is still malformed.
    pub fn canonicalize(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | '.' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        Self::new(normalized)
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SecretName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SecretName> for String {
    fn from(name: SecretName) -> Self {
        name.0
    }
}

/// Builds the project-unique path of a secret from an optional folder.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the folder has empty or malformed segments.
pub fn secret_path(folder: Option<&str>, name: &SecretName) -> Result<String> {
    let Some(folder) = folder.map(str::trim).filter(|f| !f.is_empty()) else {
        return Ok(name.as_str().to_string());
    };
    for segment in folder.split('/') {
        if !FOLDER_SEGMENT_REGEX.is_match(segment) {
            return Err(Error::validation(format!(
                "folder '{folder}' has an invalid segment '{segment}'"
            )));
        }
    }
    Ok(format!("{folder}/{name}"))
}

/// Decrypted secret material that securely zeroizes memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue {
    data: Vec<u8>,
}

impl SecretValue {
    /// Wraps plaintext bytes.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns the plaintext as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the plaintext as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the value is not valid UTF-8.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|_| Error::validation("secret value is not valid UTF-8"))
    }

    /// Returns the length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the value and returns the plaintext bytes.
    #[must_use]
    pub fn into_bytes(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("len", &self.data.len())
            .field("data", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecretValue {
    fn eq(&self, other: &Self) -> bool {
        self.data.ct_eq(&other.data).into()
    }
}

impl Eq for SecretValue {}

/// An operation a principal may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Resolve secret values and list versions.
    Read,
    /// Create versions, roll back, write credentials.
    Write,
    /// Archive or delete secrets and environments.
    Delete,
    /// Everything, including key rotation and token management.
    Admin,
}

impl Permission {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A set of granted permissions. `admin` implies every other permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    /// Creates a set from the given permissions.
    #[must_use]
    pub fn new(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self(permissions.into_iter().collect())
    }

    /// A set granting only `read`.
    #[must_use]
    pub fn read_only() -> Self {
        Self::new([Permission::Read])
    }

    /// A set granting `admin`.
    #[must_use]
    pub fn admin() -> Self {
        Self::new([Permission::Admin])
    }

    /// Checks whether the set grants `permission`.
    #[must_use]
    pub fn allows(&self, permission: Permission) -> bool {
        self.0.contains(&permission) || self.0.contains(&Permission::Admin)
    }

    /// Returns true if nothing is granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the explicitly granted permissions.
    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }
}

/// The kind of value a secret holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretType {
    /// Free-form text.
    #[default]
    String,
    /// A JSON document; validated on write.
    Json,
    /// Opaque file contents.
    File,
    /// PEM certificate material.
    Certificate,
    /// Username and password with an optional OTP seed.
    Credential,
    /// A time-based OTP seed.
    Totp,
    /// A counter-based OTP seed.
    Hotp,
}

impl SecretType {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Json => "json",
            Self::File => "file",
            Self::Certificate => "certificate",
            Self::Credential => "credential",
            Self::Totp => "totp",
            Self::Hotp => "hotp",
        }
    }

    /// Returns true for types that carry OTP settings.
    #[must_use]
    pub const fn supports_otp(&self) -> bool {
        matches!(self, Self::Credential | Self::Totp | Self::Hotp)
    }
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which OTP generator a secret is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpKind {
    /// No OTP generator.
    #[default]
    None,
    /// RFC 6238 time-based codes.
    Totp,
    /// RFC 4226 counter-based codes.
    Hotp,
}

/// HMAC digest used by the OTP generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpAlgorithm {
    /// HMAC-SHA1, the authenticator-app default.
    #[default]
    Sha1,
    /// HMAC-SHA256.
    Sha256,
    /// HMAC-SHA512.
    Sha512,
}

impl OtpAlgorithm {
    /// Returns the name used in `otpauth://` URIs.
    #[must_use]
    pub const fn uri_name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Parses an algorithm name, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] for anything but sha1/sha256/sha512.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::otp_config(format!("unsupported algorithm '{other}'"))),
        }
    }
}

/// OTP parameters stored on credential, totp and hotp secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpSettings {
    /// Generator kind. Only meaningful for credential secrets; totp/hotp
    /// secrets are bound to their own kind.
    pub kind: OtpKind,
    /// HMAC digest.
    pub algorithm: OtpAlgorithm,
    /// Number of decimal digits, 6 to 8.
    pub digits: u32,
    /// Time step in seconds (TOTP only).
    pub period: u64,
    /// Issuer shown by authenticator apps.
    pub issuer: Option<String>,
}

impl OtpSettings {
    /// Smallest supported code length.
    pub const MIN_DIGITS: u32 = 6;
    /// Largest supported code length.
    pub const MAX_DIGITS: u32 = 8;

    /// Default TOTP settings: SHA1, 6 digits, 30 second period.
    #[must_use]
    pub const fn totp() -> Self {
        Self {
            kind: OtpKind::Totp,
            algorithm: OtpAlgorithm::Sha1,
            digits: 6,
            period: 30,
            issuer: None,
        }
    }

    /// Default HOTP settings: SHA1, 6 digits.
    #[must_use]
    pub const fn hotp() -> Self {
        Self {
            kind: OtpKind::Hotp,
            algorithm: OtpAlgorithm::Sha1,
            digits: 6,
            period: 30,
            issuer: None,
        }
    }

    /// Sets the algorithm.
    #[must_use]
    pub const fn with_algorithm(mut self, algorithm: OtpAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sets the number of digits.
    #[must_use]
    pub const fn with_digits(mut self, digits: u32) -> Self {
        self.digits = digits;
        self
    }

    /// Sets the TOTP period.
    #[must_use]
    pub const fn with_period(mut self, period: u64) -> Self {
        self.period = period;
        self
    }

    /// Sets the issuer.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Validates digits and period.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] if the settings are unusable.
    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_DIGITS..=Self::MAX_DIGITS).contains(&self.digits) {
            return Err(Error::otp_config(format!(
                "digits must be between {} and {}, got {}",
                Self::MIN_DIGITS,
                Self::MAX_DIGITS,
                self.digits
            )));
        }
        if self.kind == OtpKind::Totp && self.period == 0 {
            return Err(Error::otp_config("period must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self::totp()
    }
}

/// The kind of principal behind an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user.
    User,
    /// A non-human service account.
    ServiceAccount,
    /// An access token.
    Token,
    /// A project-level API key.
    ApiKey,
    /// The vault itself (rotation jobs, migrations).
    System,
}

impl ActorType {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ServiceAccount => "service_account",
            Self::Token => "token",
            Self::ApiKey => "api_key",
            Self::System => "system",
        }
    }
}

/// Who performed an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Principal kind.
    pub actor_type: ActorType,
    /// Principal identifier.
    pub id: String,
    /// Display name, if known.
    pub name: Option<String>,
}

impl Actor {
    /// A user actor.
    #[must_use]
    pub fn user(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// A token actor.
    #[must_use]
    pub fn token(id: TokenId, name: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Token,
            id: id.to_string(),
            name: Some(name.into()),
        }
    }

    /// The system actor.
    #[must_use]
    pub fn system() -> Self {
        Self {
            actor_type: ActorType::System,
            id: "system".to_string(),
            name: None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor_type.as_str(), self.id)
    }
}

/// Length of the random part of generated bearer credentials.
const CREDENTIAL_RANDOM_LENGTH: usize = 40;

/// Generates a random alphanumeric bearer credential with the given prefix.
#[must_use]
pub(crate) fn generate_credential(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let random: String = (0..CREDENTIAL_RANDOM_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..62u8);
            match idx {
                0..=9 => (b'0' + idx) as char,
                10..=35 => (b'a' + idx - 10) as char,
                _ => (b'A' + idx - 36) as char,
            }
        })
        .collect();
    format!("{prefix}{random}")
}

/// A blake3 digest of a bearer credential, compared in constant time.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialDigest {
    hash: [u8; 32],
}

impl CredentialDigest {
    /// Hashes a plaintext credential.
    #[must_use]
    pub fn of(credential: &str) -> Self {
        Self {
            hash: *blake3::hash(credential.as_bytes()).as_bytes(),
        }
    }

    /// Verifies a plaintext credential against this digest.
    #[must_use]
    pub fn verify(&self, credential: &str) -> bool {
        let other = blake3::hash(credential.as_bytes());
        self.hash.ct_eq(other.as_bytes()).into()
    }
}

impl fmt::Debug for CredentialDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialDigest")
            .field("hash", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for CredentialDigest {
    fn eq(&self, other: &Self) -> bool {
        self.hash.ct_eq(&other.hash).into()
    }
}

impl Eq for CredentialDigest {}

/// A plaintext bearer credential, only available at creation time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PlaintextCredential(String);

impl PlaintextCredential {
    /// Returns the credential as a string slice.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PlaintextCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible = self.0.get(..8).map_or_else(|| "[SHORT]".to_string(), |p| format!("{p}..."));
        f.debug_tuple("PlaintextCredential").field(&visible).finish()
    }
}

/// The tenant boundary. Every other entity is scoped by its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project identifier.
    pub id: ProjectId,
    /// Display name.
    pub name: String,
    /// Digest of the service-to-service API key.
    pub api_key_digest: CredentialDigest,
    /// Digest of the ingest key.
    pub ingest_key_digest: CredentialDigest,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Plaintext project keys returned once at project creation.
#[derive(Debug)]
pub struct ProjectKeys {
    /// Project API key, prefixed `cfp_`.
    pub api_key: PlaintextCredential,
    /// Ingest key, prefixed `cfi_`.
    pub ingest_key: PlaintextCredential,
}

impl Project {
    /// Creates a project and its bearer keys.
    #[must_use]
    pub fn create(name: impl Into<String>) -> (Self, ProjectKeys) {
        let api_key = generate_credential("cfp_");
        let ingest_key = generate_credential("cfi_");
        let project = Self {
            id: ProjectId::new(),
            name: name.into(),
            api_key_digest: CredentialDigest::of(&api_key),
            ingest_key_digest: CredentialDigest::of(&ingest_key),
            created_at: Utc::now(),
        };
        let keys = ProjectKeys {
            api_key: PlaintextCredential(api_key),
            ingest_key: PlaintextCredential(ingest_key),
        };
        (project, keys)
    }

    /// Verifies a presented API key.
    #[must_use]
    pub fn verify_api_key(&self, presented: &str) -> bool {
        self.api_key_digest.verify(presented)
    }

    /// Verifies a presented ingest key.
    #[must_use]
    pub fn verify_ingest_key(&self, presented: &str) -> bool {
        self.ingest_key_digest.verify(presented)
    }
}

pub(crate) fn plaintext_credential(value: String) -> PlaintextCredential {
    PlaintextCredential(value)
}
