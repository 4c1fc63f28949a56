//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use coffer_core::{ExportFormat, OtpAlgorithm, OtpKind};

/// Coffer - multi-tenant secrets vault tooling.
#[derive(Parser, Debug, Clone)]
#[command(name = "coffer")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Vault configuration file (JSON or YAML).
    #[arg(short, long, env = "COFFER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table, global = true)]
    pub format: Format,

    /// Log output format on stderr.
    #[arg(long, value_enum, env = "COFFER_LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// OTP hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AlgorithmArg {
    /// HMAC-SHA1.
    #[default]
    Sha1,
    /// HMAC-SHA256.
    Sha256,
    /// HMAC-SHA512.
    Sha512,
}

impl From<AlgorithmArg> for OtpAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Sha1 => Self::Sha1,
            AlgorithmArg::Sha256 => Self::Sha256,
            AlgorithmArg::Sha512 => Self::Sha512,
        }
    }
}

/// OTP generator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum KindArg {
    /// Time-based.
    #[default]
    Totp,
    /// Counter-based.
    Hotp,
}

impl From<KindArg> for OtpKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Totp => Self::Totp,
            KindArg::Hotp => Self::Hotp,
        }
    }
}

/// Snapshot encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// `KEY=value` lines.
    Dotenv,
    /// `export KEY='value'` lines.
    Shell,
    /// Flat JSON object.
    Json,
    /// Flat YAML map.
    Yaml,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Dotenv => Self::Dotenv,
            FormatArg::Shell => Self::Shell,
            FormatArg::Json => Self::Json,
            FormatArg::Yaml => Self::Yaml,
        }
    }
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// One-time password tooling.
    Otp {
        /// OTP subcommand to execute.
        #[command(subcommand)]
        command: OtpCommands,
    },

    /// Access token tooling.
    Token {
        /// Token subcommand to execute.
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Convert a `KEY=value` snapshot between export formats.
    Export(ExportArgs),

    /// Run an end-to-end vault scenario in memory and print its audit trail.
    Demo(DemoArgs),
}

/// Seed and code shape shared by OTP subcommands.
#[derive(Args, Debug, Clone)]
pub struct SeedArgs {
    /// Base32 seed.
    #[arg(long, env = "COFFER_OTP_SEED", hide_env_values = true)]
    pub seed: String,

    /// HMAC algorithm.
    #[arg(long, value_enum, default_value_t = AlgorithmArg::Sha1)]
    pub algorithm: AlgorithmArg,

    /// Code length (6-8).
    #[arg(long, default_value_t = 6)]
    pub digits: u32,
}

/// OTP subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum OtpCommands {
    /// Generate a TOTP code.
    Totp {
        /// Seed options.
        #[command(flatten)]
        seed: SeedArgs,

        /// Time step in seconds.
        #[arg(long, default_value_t = 30)]
        period: u64,

        /// Unix time to generate for; now when omitted.
        #[arg(long)]
        time: Option<i64>,
    },

    /// Generate an HOTP code.
    Hotp {
        /// Seed options.
        #[command(flatten)]
        seed: SeedArgs,

        /// Counter value.
        #[arg(long)]
        counter: u64,
    },

    /// Verify a TOTP or HOTP code.
    Verify {
        /// Seed options.
        #[command(flatten)]
        seed: SeedArgs,

        /// Code to verify.
        #[arg(long)]
        code: String,

        /// Generator kind.
        #[arg(long, value_enum, default_value_t = KindArg::Totp)]
        kind: KindArg,

        /// TOTP time step in seconds.
        #[arg(long, default_value_t = 30)]
        period: u64,

        /// HOTP counter to start from.
        #[arg(long, default_value_t = 0)]
        counter: u64,

        /// Unix time to verify at; now when omitted.
        #[arg(long)]
        time: Option<i64>,
    },

    /// Print an `otpauth://` enrollment URI.
    Uri {
        /// Seed options.
        #[command(flatten)]
        seed: SeedArgs,

        /// Account label.
        #[arg(long)]
        account: String,

        /// Issuer label.
        #[arg(long)]
        issuer: Option<String>,

        /// Generator kind.
        #[arg(long, value_enum, default_value_t = KindArg::Totp)]
        kind: KindArg,

        /// TOTP time step in seconds.
        #[arg(long, default_value_t = 30)]
        period: u64,

        /// HOTP initial counter.
        #[arg(long, default_value_t = 0)]
        counter: u64,
    },

    /// Generate a random base32 seed.
    Seed {
        /// Algorithm the seed is sized for.
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Sha1)]
        algorithm: AlgorithmArg,
    },
}

/// Token subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum TokenCommands {
    /// Generate a token plaintext and the values stored for it.
    Generate {
        /// Token prefix; the configured prefix when omitted.
        #[arg(long)]
        prefix: Option<String>,

        /// Token display name.
        #[arg(long, default_value = "cli")]
        name: String,
    },
}

/// Arguments for the export command.
#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Input file; stdin when omitted.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Input format.
    #[arg(long, value_enum, default_value_t = FormatArg::Dotenv)]
    pub from: FormatArg,

    /// Output format.
    #[arg(long, value_enum, default_value_t = FormatArg::Shell)]
    pub to: FormatArg,
}

/// Arguments for the demo command.
#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Master passphrase for the demo vault.
    #[arg(long, env = "COFFER_MASTER_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_totp_command() {
        let cli = Cli::try_parse_from([
            "coffer", "otp", "totp", "--seed", "JBSWY3DPEHPK3PXP", "--digits", "8", "--time", "59",
        ])
        .expect("parse");
        match cli.command {
            Commands::Otp {
                command: OtpCommands::Totp { seed, period, time },
            } => {
                assert_eq!(seed.digits, 8);
                assert_eq!(seed.algorithm, AlgorithmArg::Sha1);
                assert_eq!(period, 30);
                assert_eq!(time, Some(59));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_export_defaults() {
        let cli = Cli::try_parse_from(["coffer", "--format", "json", "export"]).expect("parse");
        assert_eq!(cli.format, Format::Json);
        match cli.command {
            Commands::Export(args) => {
                assert_eq!(args.from, FormatArg::Dotenv);
                assert_eq!(args.to, FormatArg::Shell);
                assert!(args.input.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
