//! Export and import codecs for environment snapshots.
//!
//! Entries are `(KEY, value)` pairs as produced by
//! [`SecretStore::export_environment`](crate::store::SecretStore::export_environment).
//! Rendered output holds plaintext and is returned in a [`Zeroizing`] buffer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::types::SecretValue;

/// Snapshot encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// `KEY=value` lines, double-quoted when needed.
    #[default]
    Dotenv,
    /// `export KEY='value'` lines.
    Shell,
    /// A flat JSON object.
    Json,
    /// A flat YAML map.
    Yaml,
}

impl ExportFormat {
    /// Returns the format name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dotenv => "dotenv",
            Self::Shell => "shell",
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dotenv" | "env" => Ok(Self::Dotenv),
            "shell" | "sh" => Ok(Self::Shell),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(Error::validation(format!("unknown export format '{other}'"))),
        }
    }
}

fn utf8<'a>(key: &str, value: &'a SecretValue) -> Result<&'a str> {
    value
        .as_str()
        .map_err(|_| Error::validation(format!("value of {key} is not valid UTF-8")))
}

/// Renders entries in the given format.
///
/// # Errors
///
/// Returns [`Error::Validation`] if a value is not UTF-8, or
/// [`Error::Serialization`] if the encoder fails.
pub fn render(format: ExportFormat, entries: &[(String, SecretValue)]) -> Result<Zeroizing<String>> {
    match format {
        ExportFormat::Dotenv => render_lines(entries, |key, value| {
            format!("{key}={}", dotenv_quote(value))
        }),
        ExportFormat::Shell => render_lines(entries, |key, value| {
            format!("export {key}={}", shell_quote(value))
        }),
        ExportFormat::Json => {
            let map = flat_map(entries)?;
            let mut out = serde_json::to_string_pretty(&map)?;
            out.push('\n');
            Ok(Zeroizing::new(out))
        }
        ExportFormat::Yaml => {
            let map = flat_map(entries)?;
            Ok(Zeroizing::new(serde_yaml::to_string(&map)?))
        }
    }
}

fn render_lines(
    entries: &[(String, SecretValue)],
    line: impl Fn(&str, &str) -> String,
) -> Result<Zeroizing<String>> {
    let mut out = Zeroizing::new(String::new());
    for (key, value) in entries {
        out.push_str(&line(key, utf8(key, value)?));
        out.push('\n');
    }
    Ok(out)
}

fn flat_map(entries: &[(String, SecretValue)]) -> Result<BTreeMap<&str, &str>> {
    entries
        .iter()
        .map(|(key, value)| Ok((key.as_str(), utf8(key, value)?)))
        .collect()
}

fn needs_quotes(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '#' | '$' | '\\' | '`'))
}

fn dotenv_quote(value: &str) -> String {
    if !needs_quotes(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Single-quotes `value`, switching to `$'...'` when it spans lines so every
/// entry stays on one line.
fn shell_quote(value: &str) -> String {
    if !value.contains(['\n', '\r']) {
        return format!("'{}'", value.replace('\'', "'\\''"));
    }
    let mut out = String::with_capacity(value.len() + 3);
    out.push_str("$'");
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Parses entries from the given format.
///
/// Dotenv and shell input skip blank lines and `#` comments and accept an
/// optional `export ` prefix. JSON and YAML input must be a flat map;
/// numbers and booleans are taken as their text.
///
/// # Errors
///
/// Returns [`Error::Validation`] with the offending line for malformed input.
pub fn parse(format: ExportFormat, input: &str) -> Result<Vec<(String, SecretValue)>> {
    match format {
        ExportFormat::Dotenv | ExportFormat::Shell => parse_lines(input),
        ExportFormat::Json => {
            let map: BTreeMap<String, serde_json::Value> = serde_json::from_str(input)?;
            map.into_iter()
                .map(|(key, value)| {
                    let text = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        serde_json::Value::Null
                        | serde_json::Value::Array(_)
                        | serde_json::Value::Object(_) => {
                            return Err(Error::validation(format!(
                                "value of {key} must be a string"
                            )));
                        }
                    };
                    Ok((key, SecretValue::from(text)))
                })
                .collect()
        }
        ExportFormat::Yaml => {
            let map: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(input)?;
            map.into_iter()
                .map(|(key, value)| {
                    let text = match value {
                        serde_yaml::Value::String(s) => s,
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        _ => {
                            return Err(Error::validation(format!(
                                "value of {key} must be a string"
                            )));
                        }
                    };
                    Ok((key, SecretValue::from(text)))
                })
                .collect()
        }
    }
}

fn parse_lines(input: &str) -> Result<Vec<(String, SecretValue)>> {
    let mut entries = Vec::new();
    let mut lines = input.lines().enumerate();
    while let Some((index, raw)) = lines.next() {
        let line = raw.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::validation(format!(
                "line {}: expected KEY=value",
                index + 1
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::validation(format!("line {}: empty key", index + 1)));
        }

        // A quoted value may run over several lines.
        let mut buf = Zeroizing::new(value.trim_start().to_string());
        let value = loop {
            match unquote(buf.trim_end()) {
                Ok(value) => break value,
                Err(reason) => {
                    let Some((_, next)) = lines.next() else {
                        return Err(Error::validation(format!("line {}: {reason}", index + 1)));
                    };
                    buf.push('\n');
                    buf.push_str(next);
                }
            }
        };
        entries.push((key.to_string(), SecretValue::from(value)));
    }
    Ok(entries)
}

/// Decodes a dotenv or shell value: `"..."` with backslash escapes,
/// `'...'` literal runs with `\'` joins, `$'...'` with C escapes, or bare
/// text. Fails only when a quote is left open.
fn unquote(value: &str) -> std::result::Result<String, &'static str> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'\'') => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => out.push('\n'),
                            Some('r') => out.push('\r'),
                            Some('t') => out.push('\t'),
                            Some(e @ ('\\' | '\'' | '"')) => out.push(e),
                            Some(other) => {
                                out.push('\\');
                                out.push(other);
                            }
                            None => return Err("unterminated single quote"),
                        },
                        Some(other) => out.push(other),
                        None => return Err("unterminated single quote"),
                    }
                }
            }
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => out.push('\n'),
                        Some('r') => out.push('\r'),
                        Some('t') => out.push('\t'),
                        Some(e @ ('"' | '\\' | '$' | '`')) => out.push(e),
                        Some(other) => {
                            out.push('\\');
                            out.push(other);
                        }
                        None => return Err("unterminated double quote"),
                    },
                    Some(other) => out.push(other),
                    None => return Err("unterminated double quote"),
                }
            },
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(other) => out.push(other),
                    None => return Err("unterminated single quote"),
                }
            },
            '\\' => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    Ok(out)
}
