//! Coffer CLI binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use coffer_core::VaultConfig;
use tracing_subscriber::EnvFilter;

use coffer_cli::cli::{Cli, Commands, LogFormat};
use coffer_cli::commands::{DemoCommand, ExportCommand, OtpCommand, TokenCommand};
use coffer_cli::output::OutputFormat;
use coffer_cli::CliError;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match cli.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<VaultConfig, CliError> {
    match &cli.config {
        Some(path) => VaultConfig::load(path).map_err(|e| CliError::Config(e.to_string())),
        None => Ok(VaultConfig::default()),
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match &cli.command {
        Commands::Otp { command } => {
            let cmd = OtpCommand::new(&config);
            cmd.execute(&mut stdout, &format, command)?;
        }
        Commands::Token { command } => {
            let cmd = TokenCommand::new(&config);
            cmd.execute(&mut stdout, &format, command)?;
        }
        Commands::Export(args) => {
            let cmd = ExportCommand::new();
            cmd.execute(&mut stdout, args)?;
        }
        Commands::Demo(args) => {
            let cmd = DemoCommand::new(&config);
            cmd.execute(&mut stdout, &format, args)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_cli::cli::Format;

    #[test]
    fn cli_parses_otp_seed() {
        let cli = Cli::parse_from(["coffer", "otp", "seed"]);
        assert!(matches!(cli.command, Commands::Otp { .. }));
    }

    #[test]
    fn cli_respects_format_flag() {
        let cli = Cli::parse_from(["coffer", "--format", "json", "token", "generate"]);
        assert_eq!(cli.format, Format::Json);
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let cli = Cli::parse_from(["coffer", "--config", "/nonexistent/coffer.yaml", "otp", "seed"]);
        assert!(matches!(run(cli), Err(CliError::Config(_))));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coffer.json");
        std::fs::write(&path, r#"{"rotation_batch_size": 0}"#).expect("write");
        let cli = Cli::parse_from([
            "coffer",
            "--config",
            path.to_str().expect("utf8 path"),
            "otp",
            "seed",
        ]);
        assert!(matches!(load_config(&cli), Err(CliError::Config(_))));
    }
}
