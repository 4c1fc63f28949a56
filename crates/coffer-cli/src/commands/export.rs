//! Snapshot conversion command implementation.
//!
//! Reads a flat `KEY=value` snapshot in one export format and writes it in
//! another. The rendered snapshot is the output; `--format` does not apply.

use std::io::{Read, Write};

use coffer_core::ExportFormat;
use coffer_core::formats::{parse, render};
use tracing::debug;

use crate::cli::ExportArgs;
use crate::error::CliError;

/// Handler for the export command.
#[derive(Debug, Default)]
pub struct ExportCommand;

impl ExportCommand {
    /// Creates a new export command handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Executes the export command, reading stdin when no input file is set.
    ///
    /// # Errors
    ///
    /// Returns error if the input cannot be read or parsed.
    pub fn execute<W: Write>(&self, out: &mut W, args: &ExportArgs) -> Result<(), CliError> {
        let input = match &args.input {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                CliError::InvalidArgument(format!("cannot read {}: {e}", path.display()))
            })?,
            None => {
                let mut buf = String::new();
                std::io::stdin().lock().read_to_string(&mut buf)?;
                buf
            }
        };
        self.convert(out, &input, args.from.into(), args.to.into())
    }

    /// Converts `input` from one format to another.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::Format`] if `input` is malformed.
    pub fn convert<W: Write>(
        &self,
        out: &mut W,
        input: &str,
        from: ExportFormat,
        to: ExportFormat,
    ) -> Result<(), CliError> {
        let entries =
            parse(from, input).map_err(|e| CliError::Format(format!("cannot parse {from}: {e}")))?;
        let rendered = render(to, &entries)?;
        debug!(from = %from, to = %to, entries = entries.len(), "converted snapshot");
        out.write_all(rendered.as_bytes())?;
        Ok(())
    }
}
