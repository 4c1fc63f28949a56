//! In-memory vault walkthrough.
//!
//! Builds a vault, exercises inheritance, rollback, credentials with OTP,
//! scoped tokens and key rotation, then prints what happened together with
//! the audit trail.

use std::io::Write;
use std::sync::Arc;

use coffer_core::otp::generate_seed;
use coffer_core::{
    AuditFilter, Caller, CredentialInput, Error, ExportFormat, LocalMasterKeyProvider, NewSecret,
    OtpAlgorithm, OtpSettings, PermissionSet, ProjectId, RequestContext, SecretName, SecretType,
    SecretValue, TokenOptions, Vault, VaultConfig,
};
use tracing::{info, warn};

use crate::cli::DemoArgs;
use crate::error::CliError;
use crate::output::{AuditLine, DemoReport, DemoStep, OutputFormat};

const DEMO_PROJECT: &str = "coffer-demo";
const DEMO_SALT: &[u8] = b"coffer-demo-salt";
const DEFAULT_PASSPHRASE: &str = "coffer-demo-passphrase";

/// Handler for the demo command.
pub struct DemoCommand<'a> {
    config: &'a VaultConfig,
}

impl<'a> DemoCommand<'a> {
    /// Creates a new demo command handler.
    #[must_use]
    pub const fn new(config: &'a VaultConfig) -> Self {
        Self { config }
    }

    /// Executes the demo scenario.
    ///
    /// # Errors
    ///
    /// Returns error if a step that should succeed fails.
    pub fn execute<W: Write>(
        &self,
        out: &mut W,
        format: &OutputFormat,
        args: &DemoArgs,
    ) -> Result<(), CliError> {
        let passphrase = args.passphrase.as_deref().unwrap_or_else(|| {
            warn!("no master passphrase set, using the built-in demo passphrase");
            DEFAULT_PASSPHRASE
        });
        let report = self.run(passphrase)?;
        format.write(out, &report)
    }

    /// Runs the scenario and collects the report.
    ///
    /// # Errors
    ///
    /// Returns error if a step that should succeed fails.
    pub fn run(&self, passphrase: &str) -> Result<DemoReport, CliError> {
        let provider = LocalMasterKeyProvider::from_passphrase(passphrase, DEMO_SALT)?;
        let vault = Vault::new(self.config.clone(), Arc::new(provider))?;
        let (project, keys) = vault.create_project(DEMO_PROJECT)?;
        let admin = vault.authenticate(project.id, keys.api_key.expose(), RequestContext::now())?;
        let mut scenario = Scenario {
            vault: &vault,
            project: project.id,
            admin,
            steps: Vec::new(),
        };

        scenario.environments()?;
        scenario.inheritance_and_rollback()?;
        scenario.credential_with_otp()?;
        scenario.scoped_token()?;
        scenario.rotation()?;
        scenario.export()?;

        let audit = vault
            .audit_trail(&scenario.admin, project.id, &AuditFilter::new())?
            .iter()
            .map(AuditLine::from)
            .collect();
        info!(project = %project.id, steps = scenario.steps.len(), "demo finished");

        Ok(DemoReport {
            project: project.name,
            steps: scenario.steps,
            audit,
        })
    }
}

struct Scenario<'v> {
    vault: &'v Vault,
    project: ProjectId,
    admin: Caller,
    steps: Vec<DemoStep>,
}

impl Scenario<'_> {
    fn record(&mut self, step: impl Into<String>, outcome: impl Into<String>) {
        self.steps.push(DemoStep {
            step: step.into(),
            outcome: outcome.into(),
        });
    }

    fn environments(&mut self) -> Result<(), CliError> {
        let chain = [
            ("Production", "production", None),
            ("Staging", "staging", Some("production")),
            ("Development", "development", Some("staging")),
        ];
        for (name, slug, parent) in chain {
            self.vault
                .create_environment(&self.admin, self.project, name, slug, parent)?;
        }
        self.record("create environments", "production > staging > development");
        Ok(())
    }

    fn inheritance_and_rollback(&mut self) -> Result<(), CliError> {
        let name = SecretName::new("DATABASE_URL")?;
        self.vault.create_secret(
            &self.admin,
            self.project,
            NewSecret::new(name).with_description("primary database"),
        )?;
        self.vault.set_value(
            &self.admin,
            self.project,
            "DATABASE_URL",
            "production",
            b"postgres://prod-db:5432/app",
            Some("initial"),
        )?;

        let resolved =
            self.vault
                .resolve_value(&self.admin, self.project, "DATABASE_URL", "development")?;
        let source = self
            .vault
            .environments()
            .get(self.project, resolved.source_environment)?;
        self.record(
            "read DATABASE_URL in development",
            format!("inherited from {} v{}", source.slug, resolved.version.version),
        );

        for value in [
            "postgres://staging-db:5432/app",
            "postgres://staging-db:5432/app?pool=50",
        ] {
            self.vault.set_value(
                &self.admin,
                self.project,
                "DATABASE_URL",
                "staging",
                value.as_bytes(),
                None,
            )?;
        }
        let restored = self
            .vault
            .rollback(&self.admin, self.project, "DATABASE_URL", "staging", 1)?;
        self.record(
            "roll back DATABASE_URL in staging",
            format!("v1 restored as v{}", restored.version),
        );
        Ok(())
    }

    fn credential_with_otp(&mut self) -> Result<(), CliError> {
        let name = SecretName::new("GITHUB_LOGIN")?;
        self.vault.create_secret(
            &self.admin,
            self.project,
            NewSecret::new(name)
                .of_type(SecretType::Credential)
                .with_otp(OtpSettings::totp().with_issuer("GitHub")),
        )?;
        let input = CredentialInput {
            username: "deploy-bot".into(),
            password: SecretValue::from("correct-horse-battery-staple"),
            otp_seed: Some(SecretValue::from(generate_seed(OtpAlgorithm::Sha1))),
        };
        self.vault.set_credential(
            &self.admin,
            self.project,
            "GITHUB_LOGIN",
            "production",
            &input,
            None,
        )?;

        let code = self
            .vault
            .generate_otp(&self.admin, self.project, "GITHUB_LOGIN", "production")?;
        let check = self.vault.verify_otp(
            &self.admin,
            self.project,
            "GITHUB_LOGIN",
            "production",
            code.code(),
        )?;
        self.record(
            "generate and verify GITHUB_LOGIN otp",
            if check.valid { "accepted" } else { "rejected" },
        );
        Ok(())
    }

    fn scoped_token(&mut self) -> Result<(), CliError> {
        let (_, plaintext) = self.vault.issue_token(
            &self.admin,
            self.project,
            "staging-reader",
            TokenOptions::new(PermissionSet::read_only()).environments(["staging"]),
        )?;
        let reader =
            self.vault
                .authenticate(self.project, plaintext.expose(), RequestContext::now())?;

        self.vault
            .get_value(&reader, self.project, "DATABASE_URL", "staging")?;
        self.record("staging-reader reads staging", "allowed");

        let outcome = match self
            .vault
            .get_value(&reader, self.project, "DATABASE_URL", "production")
        {
            Ok(_) => "allowed".to_string(),
            Err(Error::Forbidden { .. }) => "denied".to_string(),
            Err(e) => return Err(e.into()),
        };
        self.record("staging-reader reads production", outcome);
        Ok(())
    }

    fn rotation(&mut self) -> Result<(), CliError> {
        let report = self.vault.rotate_key(&self.admin, self.project)?;
        self.record(
            "rotate data key",
            format!(
                "{} versions migrated, old key {}",
                report.migrated,
                if report.old_key_retired { "retired" } else { "still in use" }
            ),
        );
        Ok(())
    }

    fn export(&mut self) -> Result<(), CliError> {
        let rendered =
            self.vault
                .export_environment(&self.admin, self.project, "staging", ExportFormat::Dotenv)?;
        self.record(
            "export staging as dotenv",
            format!("{} entries", rendered.lines().count()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;

    fn report() -> DemoReport {
        let config = VaultConfig::default().with_mirror_audit_to_tracing(false);
        DemoCommand::new(&config).run("test-passphrase").expect("demo")
    }

    fn outcome<'a>(report: &'a DemoReport, step: &str) -> &'a str {
        report
            .steps
            .iter()
            .find(|s| s.step == step)
            .map(|s| s.outcome.as_str())
            .expect("step present")
    }

    #[test]
    fn demo_walks_the_scenario() {
        let report = report();
        assert_eq!(report.project, DEMO_PROJECT);
        assert_eq!(
            outcome(&report, "read DATABASE_URL in development"),
            "inherited from production v1"
        );
        assert_eq!(outcome(&report, "roll back DATABASE_URL in staging"), "v1 restored as v3");
        assert_eq!(outcome(&report, "generate and verify GITHUB_LOGIN otp"), "accepted");
        assert_eq!(outcome(&report, "staging-reader reads staging"), "allowed");
        assert_eq!(outcome(&report, "staging-reader reads production"), "denied");
        assert_eq!(
            outcome(&report, "rotate data key"),
            "5 versions migrated, old key retired"
        );
        assert_eq!(outcome(&report, "export staging as dotenv"), "2 entries");
    }

    #[test]
    fn demo_audit_trail_records_the_denial() {
        let report = report();
        let denied: Vec<_> = report.audit.iter().filter(|line| !line.success).collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].action, "access_denied");
        assert_eq!(denied[0].environment.as_deref(), Some("production"));
    }

    #[test]
    fn demo_renders_as_json() {
        let config = VaultConfig::default().with_mirror_audit_to_tracing(false);
        let mut buf = Vec::new();
        DemoCommand::new(&config)
            .execute(
                &mut buf,
                &OutputFormat::new(Format::Json),
                &DemoArgs {
                    passphrase: Some("test-passphrase".into()),
                },
            )
            .expect("demo");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert!(value["audit"].as_array().is_some_and(|a| !a.is_empty()));
        assert_eq!(value["steps"].as_array().map(Vec::len), Some(8));
    }
}
