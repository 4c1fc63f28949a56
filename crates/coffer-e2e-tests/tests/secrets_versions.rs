//! End-to-end tests for encryption, versioning and inheritance.
//!
//! These tests verify:
//! 1. Envelope encryption round-trips and rejects tampering
//! 2. Version numbers increase with exactly one current version
//! 3. Rollback copies an old value forward as a new version
//! 4. Values inherit through the environment chain

mod helpers;

use std::sync::Arc;

use coffer_core::{
    Encryptor, Error, ExportFormat, KeyAlgorithm, KeyManager, LocalMasterKeyProvider, ProjectId,
};
use helpers::{TestVault, MASTER_KEY};
use test_case::test_case;

// ============================================================================
// Encryption
// ============================================================================

fn encryptor(algorithm: KeyAlgorithm) -> Encryptor {
    let provider = LocalMasterKeyProvider::from_bytes(&MASTER_KEY).expect("provider");
    Encryptor::new(Arc::new(KeyManager::new(Arc::new(provider), algorithm)))
}

#[test_case(KeyAlgorithm::Aes256Gcm ; "aes")]
#[test_case(KeyAlgorithm::ChaCha20Poly1305 ; "chacha")]
fn test_encryption_round_trip(algorithm: KeyAlgorithm) {
    let enc = encryptor(algorithm);
    let project = ProjectId::new();
    let payload = enc.encrypt(b"postgres://db/app", project).expect("encrypt");

    assert_ne!(payload.ciphertext.as_slice(), b"postgres://db/app".as_slice());
    let plain = enc.decrypt(&payload, project).expect("decrypt");
    assert_eq!(plain.as_bytes(), b"postgres://db/app");
}

#[test]
fn test_tampered_ciphertext_is_rejected() {
    let enc = encryptor(KeyAlgorithm::Aes256Gcm);
    let project = ProjectId::new();
    let mut payload = enc.encrypt(b"s3cret", project).expect("encrypt");
    payload.ciphertext[0] ^= 0x01;

    assert!(matches!(
        enc.decrypt(&payload, project),
        Err(Error::DecryptionError { .. })
    ));
}

#[test]
fn test_tampered_iv_is_rejected() {
    let enc = encryptor(KeyAlgorithm::Aes256Gcm);
    let project = ProjectId::new();
    let mut payload = enc.encrypt(b"s3cret", project).expect("encrypt");
    payload.iv[0] ^= 0x80;

    assert!(matches!(
        enc.decrypt(&payload, project),
        Err(Error::DecryptionError { .. })
    ));
}

#[test]
fn test_other_project_cannot_decrypt() {
    let enc = encryptor(KeyAlgorithm::Aes256Gcm);
    let payload = enc.encrypt(b"s3cret", ProjectId::new()).expect("encrypt");
    assert!(enc.decrypt(&payload, ProjectId::new()).is_err());
}

// ============================================================================
// Versions
// ============================================================================

#[test]
fn test_versions_are_monotonic_with_one_current() {
    let t = TestVault::new();
    t.secret("API_KEY");

    for (i, value) in ["one", "two", "three"].iter().enumerate() {
        let version = t.write("API_KEY", "production", value);
        assert_eq!(version.version as usize, i + 1);
        assert!(version.is_current);
    }

    let versions = t
        .vault
        .list_versions(&t.admin, t.project, "API_KEY", "production")
        .expect("versions");
    assert_eq!(
        versions.iter().map(|v| v.version).collect::<Vec<_>>(),
        vec![3, 2, 1]
    );
    assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);
    assert!(versions[0].is_current);
    assert_eq!(t.read("API_KEY", "production"), "three");
}

#[test]
fn test_rollback_creates_next_version_with_old_value() {
    let t = TestVault::new();
    t.secret("API_KEY");
    t.write("API_KEY", "production", "first");
    t.write("API_KEY", "production", "second");

    let restored = t
        .vault
        .rollback(&t.admin, t.project, "API_KEY", "production", 1)
        .expect("rollback");

    assert_eq!(restored.version, 3);
    assert!(restored.is_current);
    assert_eq!(t.read("API_KEY", "production"), "first");

    let versions = t
        .vault
        .list_versions(&t.admin, t.project, "API_KEY", "production")
        .expect("versions");
    assert_eq!(versions.len(), 3);
    assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);
    assert_eq!(versions[0].value_hash, versions[2].value_hash);
}

#[test]
fn test_rollback_to_unknown_version_fails() {
    let t = TestVault::new();
    t.secret("API_KEY");
    t.write("API_KEY", "production", "first");

    let err = t
        .vault
        .rollback(&t.admin, t.project, "API_KEY", "production", 9)
        .expect_err("unknown version");
    assert!(matches!(err, Error::NotFound { .. }));
}

// ============================================================================
// Inheritance
// ============================================================================

#[test]
fn test_value_inherits_from_nearest_ancestor() {
    let t = TestVault::new();
    t.secret("DATABASE_URL");
    t.write("DATABASE_URL", "production", "prod");

    assert_eq!(t.read("DATABASE_URL", "development"), "prod");

    t.write("DATABASE_URL", "staging", "staging");
    let resolved = t
        .vault
        .resolve_value(&t.admin, t.project, "DATABASE_URL", "development")
        .expect("resolve");
    let staging = t
        .vault
        .environments()
        .find_by_slug(t.project, "staging")
        .expect("staging");
    assert_eq!(resolved.source_environment, staging.id);
    assert_eq!(resolved.value.as_bytes(), b"staging");
}

#[test]
fn test_missing_value_is_not_found() {
    let t = TestVault::new();
    t.secret("ORPHAN");
    t.write("ORPHAN", "development", "dev only");

    let err = t
        .vault
        .get_value(&t.admin, t.project, "ORPHAN", "production")
        .expect_err("nothing in production");
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn test_archived_secret_cannot_be_read() {
    let t = TestVault::new();
    t.secret("OLD_KEY");
    t.write("OLD_KEY", "production", "v");

    t.vault
        .archive(&t.admin, t.project, "OLD_KEY")
        .expect("archive");
    assert!(t
        .vault
        .get_value(&t.admin, t.project, "OLD_KEY", "production")
        .is_err());

    t.vault
        .restore(&t.admin, t.project, "OLD_KEY")
        .expect("restore");
    assert_eq!(t.read("OLD_KEY", "production"), "v");
}

#[test]
fn test_environment_with_versions_cannot_be_deleted() {
    let t = TestVault::new();
    t.secret("API_KEY");
    t.write("API_KEY", "development", "dev");

    let err = t
        .vault
        .delete_environment(&t.admin, t.project, "development")
        .expect_err("has versions");
    assert!(matches!(err, Error::HasDependentVersions { .. }));
}

// ============================================================================
// Bulk
// ============================================================================

#[test]
fn test_import_then_export_resolves_inherited_values() {
    let t = TestVault::new();
    let report = t
        .vault
        .import_environment(
            &t.admin,
            t.project,
            "production",
            ExportFormat::Dotenv,
            "API_KEY=abc\nGREETING=\"hello world\"\n",
        )
        .expect("import");
    assert_eq!(report.created, 2);

    let rendered = t
        .vault
        .export_environment(&t.admin, t.project, "development", ExportFormat::Shell)
        .expect("export");
    assert!(rendered.contains("export API_KEY='abc'"));
    assert!(rendered.contains("export GREETING='hello world'"));
}
