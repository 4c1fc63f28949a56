//! # coffer-cli
//!
//! Coffer command-line interface.
//!
//! Provides commands for:
//! - Generating and verifying TOTP/HOTP codes from a seed
//! - Generating access token plaintexts
//! - Converting secret snapshots between dotenv, shell, JSON and YAML
//! - Running an in-memory vault walkthrough with its audit trail
//!
//! Commands run synchronously against `coffer-core`; nothing leaves the
//! process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, Format, LogFormat, OtpCommands, TokenCommands};
pub use error::CliError;
pub use output::OutputFormat;
