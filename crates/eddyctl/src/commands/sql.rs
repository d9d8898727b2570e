//! One-shot query and exec commands.

use anyhow::{Context, Result};
use eddy::Connection;
use serde_json::json;

use super::{parse_params, print_result};
use crate::OutputFormat;

pub async fn query(conn: &Connection, sql: &str, params: &[String], format: OutputFormat) -> Result<()> {
    let result = conn
        .query(sql, &parse_params(params))
        .await
        .context("query failed")?;
    print_result(&result, format)
}

pub async fn exec(conn: &Connection, sql: &str, format: OutputFormat) -> Result<()> {
    conn.exec(sql).await.context("exec failed")?;
    match format {
        OutputFormat::Text => println!("OK"),
        OutputFormat::Json => println!("{}", json!({ "ok": true })),
    }
    Ok(())
}
