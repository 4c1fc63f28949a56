//! End-to-end tests for tokens and access policies.
//!
//! These tests verify:
//! 1. Scoped tokens only reach their environments and permissions
//! 2. Revocation takes effect on the next request
//! 3. Policy conditions: MFA, CIDR ranges, malformed client addresses
//! 4. Every denial is audited

mod helpers;

use coffer_core::{
    AccessPolicy, Actor, AuditAction, AuditFilter, Caller, Error, IpMatcher, Permission,
    PermissionSet, PolicyConditions, Principal, RequestContext, TokenOptions,
};
use helpers::TestVault;
use test_case::test_case;

fn seeded() -> TestVault {
    let t = TestVault::new();
    t.secret("DATABASE_URL");
    t.write("DATABASE_URL", "production", "prod");
    t.write("DATABASE_URL", "staging", "staging");
    t
}

// ============================================================================
// Tokens
// ============================================================================

fn staging_reader(t: &TestVault) -> (Caller, coffer_core::TokenId) {
    let (token, plaintext) = t
        .vault
        .issue_token(
            &t.admin,
            t.project,
            "staging-reader",
            TokenOptions::new(PermissionSet::read_only()).environments(["staging"]),
        )
        .expect("issue token");
    let caller = t
        .vault
        .authenticate(t.project, plaintext.expose(), RequestContext::now())
        .expect("authenticate");
    (caller, token.id)
}

#[test]
fn test_token_reads_only_its_environment() {
    let t = seeded();
    let (reader, _) = staging_reader(&t);

    let value = t
        .vault
        .get_value(&reader, t.project, "DATABASE_URL", "staging")
        .expect("staging read");
    assert_eq!(value.as_bytes(), b"staging");

    let err = t
        .vault
        .get_value(&reader, t.project, "DATABASE_URL", "production")
        .expect_err("production read");
    assert!(matches!(err, Error::Forbidden { .. }));
}

#[test]
fn test_read_token_cannot_write() {
    let t = seeded();
    let (reader, _) = staging_reader(&t);

    let err = t
        .vault
        .set_value(&reader, t.project, "DATABASE_URL", "staging", b"hijack", None)
        .expect_err("write with read token");
    assert!(matches!(err, Error::Forbidden { .. }));
    assert_eq!(t.read("DATABASE_URL", "staging"), "staging");
}

#[test]
fn test_revoked_token_is_denied() {
    let t = seeded();
    let (reader, token_id) = staging_reader(&t);

    t.vault
        .revoke_token(&t.admin, t.project, token_id)
        .expect("revoke");
    assert!(matches!(
        t.vault
            .get_value(&reader, t.project, "DATABASE_URL", "staging"),
        Err(Error::Forbidden { .. })
    ));
}

#[test]
fn test_unknown_credential_is_denied_and_audited() {
    let t = seeded();
    let before = t.audit_count();

    let err = t
        .vault
        .authenticate(t.project, "cft_not-a-real-token", RequestContext::now())
        .expect_err("unknown token");
    assert!(matches!(err, Error::Forbidden { .. }));
    assert_eq!(t.audit_count(), before + 1);
}

#[test]
fn test_token_cannot_reach_other_project() {
    let t = seeded();
    let (reader, _) = staging_reader(&t);
    let (other, _) = t.vault.create_project("other").expect("project");

    assert!(matches!(
        t.vault
            .get_value(&reader, other.id, "DATABASE_URL", "staging"),
        Err(Error::Forbidden { .. })
    ));
}

// ============================================================================
// Policies
// ============================================================================

fn alice(context: RequestContext) -> Caller {
    Caller::principals(Actor::user("alice", "Alice"), vec![Principal::user("alice")])
        .with_context(context)
}

fn guarded(t: &TestVault) {
    let policy = AccessPolicy::new(
        t.project,
        "mfa readers",
        Principal::user("alice"),
        PermissionSet::read_only(),
    )
    .with_environments(["production"])
    .with_conditions(PolicyConditions {
        require_mfa: true,
        allowed_ips: Some(IpMatcher::new(["10.0.0.0/8"])),
        time_window: None,
    });
    t.vault.add_policy(&t.admin, policy).expect("add policy");
}

#[test_case(true, Some("10.1.2.3"), true ; "mfa and internal address")]
#[test_case(false, Some("10.1.2.3"), false ; "missing mfa")]
#[test_case(true, Some("8.8.8.8"), false ; "external address")]
#[test_case(true, Some("not-an-ip"), false ; "malformed address")]
#[test_case(true, None, false ; "no address")]
fn test_policy_conditions(mfa: bool, ip: Option<&str>, allowed: bool) {
    let t = seeded();
    guarded(&t);

    let mut context = RequestContext::now().with_mfa(mfa);
    if let Some(ip) = ip {
        context = context.with_ip(ip);
    }
    let result = t
        .vault
        .get_value(&alice(context), t.project, "DATABASE_URL", "production");
    assert_eq!(result.is_ok(), allowed, "result: {result:?}");
}

#[test]
fn test_policy_does_not_grant_other_permissions() {
    let t = seeded();
    guarded(&t);
    let caller = alice(RequestContext::now().with_mfa(true).with_ip("10.0.0.1"));

    assert!(matches!(
        t.vault
            .set_value(&caller, t.project, "DATABASE_URL", "production", b"x", None),
        Err(Error::Forbidden { .. })
    ));
    assert!(matches!(
        t.vault
            .get_value(&caller, t.project, "DATABASE_URL", "staging"),
        Err(Error::Forbidden { .. })
    ));
}

#[test]
fn test_path_glob_policy() {
    let t = seeded();
    t.secret("PAYMENTS_KEY");
    t.write("PAYMENTS_KEY", "production", "pk");
    let policy = AccessPolicy::new(
        t.project,
        "payments",
        Principal::service_account("billing"),
        PermissionSet::new([Permission::Read]),
    )
    .with_paths(["PAYMENTS_*"]);
    t.vault.add_policy(&t.admin, policy).expect("add policy");

    let billing = Caller::principals(
        Actor::user("billing", "Billing"),
        vec![Principal::service_account("billing")],
    );
    assert!(t
        .vault
        .get_value(&billing, t.project, "PAYMENTS_KEY", "production")
        .is_ok());
    assert!(t
        .vault
        .get_value(&billing, t.project, "DATABASE_URL", "production")
        .is_err());
}

#[test]
fn test_denial_is_recorded_once() {
    let t = seeded();
    guarded(&t);
    let before = t.audit_count();

    let _ = t.vault.get_value(
        &alice(RequestContext::now()),
        t.project,
        "DATABASE_URL",
        "production",
    );

    let records = t
        .vault
        .audit_trail(&t.admin, t.project, &AuditFilter::new())
        .expect("audit");
    assert_eq!(records.len(), before + 1);
    let denied = &records[0];
    assert_eq!(denied.action, AuditAction::AccessDenied);
    assert!(!denied.success);
    assert_eq!(denied.resource_path.as_deref(), Some("DATABASE_URL"));
    assert_eq!(denied.environment.as_deref(), Some("production"));
}

#[test]
fn test_invalid_glob_is_rejected() {
    let t = seeded();
    let err = t
        .vault
        .issue_token(
            &t.admin,
            t.project,
            "broken",
            TokenOptions::new(PermissionSet::read_only()).paths(["[unclosed"]),
        )
        .expect_err("invalid glob");
    assert!(matches!(err, Error::Validation { .. }));
}
