//! Subcommand implementations.

pub mod console;
pub mod patients;
pub mod sql;
pub mod watch;

use anyhow::Result;
use eddy::ResultSet;
use serde_json::Value;

use crate::OutputFormat;

/// Interpret command-line parameters: JSON literals as-is, anything else as
/// a string.
pub fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|p| serde_json::from_str(p).unwrap_or_else(|_| Value::String(p.clone())))
        .collect()
}

/// Print a result set in the requested format.
pub fn print_result(result: &ResultSet, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{result}"),
        OutputFormat::Json => println!("{}", serde_json::to_string(result)?),
    }
    Ok(())
}
