//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use chrono::{DateTime, Utc};
use coffer_core::AuditRecord;
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Get the current format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

// ===================
// OTP
// ===================

/// A generated one-time code.
#[derive(Debug, Clone, Serialize)]
pub struct OtpCodeOutput {
    /// `totp` or `hotp`.
    pub kind: String,
    /// The code.
    pub code: String,
    /// HOTP counter the code belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    /// End of the TOTP step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds left in the TOTP step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
}

impl TableDisplay for OtpCodeOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Code:       {}", self.code)?;
        writeln!(writer, "Kind:       {}", self.kind)?;
        if let Some(counter) = self.counter {
            writeln!(writer, "Counter:    {counter}")?;
        }
        if let (Some(expires), Some(remaining)) = (self.expires_at, self.remaining_seconds) {
            writeln!(writer, "Expires:    {} ({remaining}s)", expires.to_rfc3339())?;
        }
        Ok(())
    }
}

/// Result of verifying a one-time code.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutput {
    /// Whether the code was accepted.
    pub valid: bool,
    /// TOTP step offset of the match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<i64>,
    /// HOTP counter to persist after a match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_counter: Option<u64>,
}

impl TableDisplay for VerifyOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Valid:      {}", if self.valid { "yes" } else { "no" })?;
        if let Some(drift) = self.drift {
            writeln!(writer, "Drift:      {drift:+} step(s)")?;
        }
        if let Some(counter) = self.next_counter {
            writeln!(writer, "Next:       {counter}")?;
        }
        Ok(())
    }
}

/// An enrollment URI.
#[derive(Debug, Clone, Serialize)]
pub struct UriOutput {
    /// `otpauth://` URI.
    pub uri: String,
}

impl TableDisplay for UriOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{}", self.uri)?;
        Ok(())
    }
}

/// A generated seed.
#[derive(Debug, Clone, Serialize)]
pub struct SeedOutput {
    /// Base32 seed.
    pub seed: String,
    /// Algorithm it is sized for.
    pub algorithm: String,
}

impl TableDisplay for SeedOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Seed:       {}", self.seed)?;
        writeln!(writer, "Algorithm:  {}", self.algorithm)?;
        Ok(())
    }
}

// ===================
// Tokens
// ===================

/// A freshly generated access token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenOutput {
    /// Token identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Plaintext bearer token. Shown once.
    pub token: String,
    /// Stored lookup prefix.
    pub lookup_prefix: String,
}

impl TableDisplay for TokenOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Token ID:   {}", self.id)?;
        writeln!(writer, "Name:       {}", self.name)?;
        writeln!(writer, "Lookup:     {}", self.lookup_prefix)?;
        writeln!(writer)?;
        writeln!(writer, "{}", self.token)?;
        writeln!(writer)?;
        writeln!(writer, "Store this token now. It cannot be shown again.")?;
        Ok(())
    }
}

// ===================
// Demo
// ===================

/// One step of the demo scenario.
#[derive(Debug, Clone, Serialize)]
pub struct DemoStep {
    /// What was attempted.
    pub step: String,
    /// What happened.
    pub outcome: String,
}

/// A condensed audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLine {
    /// Record time.
    pub time: DateTime<Utc>,
    /// Action name.
    pub action: String,
    /// Actor display.
    pub actor: String,
    /// Environment slug.
    pub environment: Option<String>,
    /// Secret path.
    pub path: Option<String>,
    /// Outcome.
    pub success: bool,
    /// Failure reason.
    pub error: Option<String>,
}

impl From<&AuditRecord> for AuditLine {
    fn from(record: &AuditRecord) -> Self {
        Self {
            time: record.created_at,
            action: record.action.as_str().to_string(),
            actor: record.actor.to_string(),
            environment: record.environment.clone(),
            path: record.resource_path.clone(),
            success: record.success,
            error: record.error.clone(),
        }
    }
}

/// Outcome of the demo command.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    /// Demo project name.
    pub project: String,
    /// Scenario steps in order.
    pub steps: Vec<DemoStep>,
    /// Audit trail, newest first.
    pub audit: Vec<AuditLine>,
}

impl TableDisplay for DemoReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Demo: {}", self.project)?;
        writeln!(writer, "══════════════════════════════════")?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(writer, "{:>2}. {:<44} {}", i + 1, step.step, step.outcome)?;
        }
        writeln!(writer)?;
        writeln!(writer, "Audit Trail ({} records)", self.audit.len())?;
        writeln!(
            writer,
            "{:<20} {:<18} {:<8} {:<12} {:<16} {}",
            "TIME", "ACTION", "RESULT", "ENV", "PATH", "ACTOR"
        )?;
        for line in &self.audit {
            writeln!(
                writer,
                "{:<20} {:<18} {:<8} {:<12} {:<16} {}",
                line.time.format("%Y-%m-%d %H:%M:%S"),
                line.action,
                if line.success { "ok" } else { "denied" },
                line.environment.as_deref().unwrap_or("-"),
                line.path.as_deref().unwrap_or("-"),
                line.actor
            )?;
        }
        Ok(())
    }
}
