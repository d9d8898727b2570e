//! Result sets, rows and parameter binding.
//!
//! Rows are JSON objects keyed by column name. Parameters are JSON values
//! bound positionally, so `$1`, `?1` and `?` placeholders all work.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Statement};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Ordered rows produced by a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Column names in projection order.
    pub columns: Vec<String>,
    /// Rows in the order the engine produced them.
    pub rows: Vec<Row>,
    /// Rows changed by a statement without a projection.
    pub affected_rows: usize,
}

impl ResultSet {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in the first row, if any.
    pub fn first_value(&self, column: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(column))
    }
}

/// Convert a JSON parameter to an engine value.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Convert an engine value to JSON.
///
/// Blobs render as `\x`-prefixed hex text.
pub fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(Number::from(i)),
        ValueRef::Real(f) => match Number::from_f64(f) {
            Some(n) => Value::Number(n),
            None => Value::String(format!("{f}")),
        },
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
            Value::String(format!("\\x{hex}"))
        }
    }
}

/// Prepare and run a single statement.
///
/// Statements with a projection (including `RETURNING`) yield rows; others
/// report the number of rows they changed. Not cached: footprints are
/// captured while the statement compiles.
pub fn run_statement(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<ResultSet> {
    let mut stmt = conn.prepare(sql)?;
    run_prepared(&mut stmt, params)
}

/// Run an already prepared statement.
pub fn run_prepared(stmt: &mut Statement<'_>, params: &[Value]) -> rusqlite::Result<ResultSet> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let bound = params.iter().map(to_sql_value);

    if columns.is_empty() {
        let affected_rows = stmt.execute(params_from_iter(bound))?;
        return Ok(ResultSet {
            columns,
            rows: Vec::new(),
            affected_rows,
        });
    }

    let readonly = stmt.readonly();
    let mut rows = Vec::new();
    let mut cursor = stmt.query(params_from_iter(bound))?;
    while let Some(row) = cursor.next()? {
        let mut out = Row::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            out.insert(name.clone(), from_sql_value(row.get_ref(index)?));
        }
        rows.push(out);
    }

    let affected_rows = if readonly { 0 } else { rows.len() };
    Ok(ResultSet {
        columns,
        rows,
        affected_rows,
    })
}

/// Render a JSON cell for display.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            return write!(f, "({} row(s) affected)", self.affected_rows);
        }

        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .map(|c| row.get(c).map(cell).unwrap_or_default())
                    .collect()
            })
            .collect();

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                cells
                    .iter()
                    .map(|r| r[i].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |f: &mut fmt::Formatter<'_>, values: &[String]| -> fmt::Result {
            let padded: Vec<String> = values
                .iter()
                .zip(&widths)
                .map(|(v, &w)| format!("{v:<w$}"))
                .collect();
            writeln!(f, "{}", padded.join(" | ").trim_end())
        };

        line(f, &self.columns)?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(f, "{}", rule.join("-+-"))?;
        for row in &cells {
            line(f, row)?;
        }
        write!(f, "({} row(s))", self.rows.len())
    }
}
