//! One-time password command implementation.
//!
//! Generates and verifies TOTP/HOTP codes from a base32 seed without a
//! vault, for enrolling and debugging authenticators.

use std::io::Write;

use chrono::{DateTime, TimeZone, Utc};
use coffer_core::otp::generate_seed;
use coffer_core::{OtpAlgorithm, OtpEngine, OtpKind, OtpSettings, VaultConfig};
use tracing::debug;

use crate::cli::{KindArg, OtpCommands, SeedArgs};
use crate::error::CliError;
use crate::output::{OtpCodeOutput, OutputFormat, SeedOutput, UriOutput, VerifyOutput};

/// Handler for OTP subcommands.
pub struct OtpCommand {
    engine: OtpEngine,
}

impl OtpCommand {
    /// Creates an OTP command handler using the configured skew and lookahead.
    #[must_use]
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            engine: OtpEngine::new(config.totp_skew_steps, config.hotp_lookahead),
        }
    }

    /// Executes the OTP subcommand.
    ///
    /// # Errors
    ///
    /// Returns error if the seed or settings are unusable, or output fails.
    pub fn execute<W: Write>(
        &self,
        out: &mut W,
        format: &OutputFormat,
        command: &OtpCommands,
    ) -> Result<(), CliError> {
        match command {
            OtpCommands::Totp { seed, period, time } => self.totp(out, format, seed, *period, *time),
            OtpCommands::Hotp { seed, counter } => self.hotp(out, format, seed, *counter),
            OtpCommands::Verify {
                seed,
                code,
                kind,
                period,
                counter,
                time,
            } => self.verify(out, format, seed, code, *kind, *period, *counter, *time),
            OtpCommands::Uri {
                seed,
                account,
                issuer,
                kind,
                period,
                counter,
            } => {
                let mut settings = totp_settings(seed, *period);
                if let Some(issuer) = issuer {
                    settings = settings.with_issuer(issuer);
                }
                let uri = self.engine.provisioning_uri(
                    &seed.seed,
                    OtpKind::from(*kind),
                    &settings,
                    account,
                    *counter,
                )?;
                format.write(out, &UriOutput { uri })
            }
            OtpCommands::Seed { algorithm } => {
                let algorithm = OtpAlgorithm::from(*algorithm);
                let output = SeedOutput {
                    seed: generate_seed(algorithm),
                    algorithm: algorithm.uri_name().to_string(),
                };
                format.write(out, &output)
            }
        }
    }

    fn totp<W: Write>(
        &self,
        out: &mut W,
        format: &OutputFormat,
        seed: &SeedArgs,
        period: u64,
        time: Option<i64>,
    ) -> Result<(), CliError> {
        let at = instant(time)?;
        let code = self
            .engine
            .totp_generate(&seed.seed, &totp_settings(seed, period), at)?;
        debug!(at = %at, remaining = code.remaining_seconds, "generated totp code");
        format.write(
            out,
            &OtpCodeOutput {
                kind: "totp".into(),
                code: code.code,
                counter: None,
                expires_at: Some(code.expires_at),
                remaining_seconds: Some(code.remaining_seconds),
            },
        )
    }

    fn hotp<W: Write>(
        &self,
        out: &mut W,
        format: &OutputFormat,
        seed: &SeedArgs,
        counter: u64,
    ) -> Result<(), CliError> {
        let code = self.engine.hotp_generate(
            &seed.seed,
            counter,
            OtpAlgorithm::from(seed.algorithm),
            seed.digits,
        )?;
        format.write(
            out,
            &OtpCodeOutput {
                kind: "hotp".into(),
                code: code.code,
                counter: Some(code.counter),
                expires_at: None,
                remaining_seconds: None,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn verify<W: Write>(
        &self,
        out: &mut W,
        format: &OutputFormat,
        seed: &SeedArgs,
        code: &str,
        kind: KindArg,
        period: u64,
        counter: u64,
        time: Option<i64>,
    ) -> Result<(), CliError> {
        let output = match kind {
            KindArg::Totp => {
                let check = self.engine.totp_verify(
                    &seed.seed,
                    code,
                    &totp_settings(seed, period),
                    instant(time)?,
                )?;
                VerifyOutput {
                    valid: check.valid,
                    drift: check.drift,
                    next_counter: None,
                }
            }
            KindArg::Hotp => {
                let check = self.engine.hotp_verify(
                    &seed.seed,
                    code,
                    counter,
                    OtpAlgorithm::from(seed.algorithm),
                    seed.digits,
                    self.engine.lookahead(),
                )?;
                VerifyOutput {
                    valid: check.valid,
                    drift: None,
                    next_counter: check.new_counter,
                }
            }
        };
        format.write(out, &output)
    }
}

fn totp_settings(seed: &SeedArgs, period: u64) -> OtpSettings {
    OtpSettings::totp()
        .with_algorithm(OtpAlgorithm::from(seed.algorithm))
        .with_digits(seed.digits)
        .with_period(period)
}

fn instant(time: Option<i64>) -> Result<DateTime<Utc>, CliError> {
    match time {
        None => Ok(Utc::now()),
        Some(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| CliError::InvalidArgument(format!("time out of range: {secs}"))),
    }
}
