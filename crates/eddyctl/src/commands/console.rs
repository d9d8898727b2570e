//! Line-oriented SQL console.
//!
//! Statements may span lines and run once a line ends with `;`. Lines
//! starting with `\` are console commands.

use anyhow::Result;
use eddy::Connection;
use std::io::Write;
use tokio::io::{self, AsyncBufReadExt, BufReader};

use super::print_result;
use crate::OutputFormat;

const HELP: &str = "\
\\q          quit
\\leader     show leadership status
\\examples   list example queries
\\e N        run example N
\\help       this text
Statements run when a line ends with ';'.";

/// Starter queries against the patient registry.
const EXAMPLES: &[(&str, &str)] = &[
    ("List 10 patients", "SELECT * FROM patients LIMIT 10"),
    (
        "Female patients by age",
        "SELECT * FROM patients WHERE gender = 'Female' ORDER BY date_of_birth DESC",
    ),
    (
        "Patient count by gender",
        "SELECT COUNT(*) AS total, gender FROM patients GROUP BY gender",
    ),
];

pub async fn run(conn: &Connection, format: OutputFormat) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut buffer = String::new();

    if format == OutputFormat::Text {
        eprintln!("eddy console on '{}' (\\help for help)", conn.store().name());
    }

    loop {
        prompt(buffer.is_empty());
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let trimmed = line.trim();

        if buffer.is_empty() && trimmed.starts_with('\\') {
            match trimmed.split_whitespace().collect::<Vec<_>>().as_slice() {
                ["\\q" | "\\quit"] => break,
                ["\\leader"] => println!("{:?} (delegate {})", conn.leader_status(), conn.delegate_id()),
                ["\\examples"] => {
                    for (index, (name, sql)) in EXAMPLES.iter().enumerate() {
                        println!("{}. {name}\n   {sql};", index + 1);
                    }
                }
                ["\\e", n] => match example(n) {
                    Some(sql) => run_statement(conn, sql, format).await?,
                    None => eprintln!("no example {n} (see \\examples)"),
                },
                _ => println!("{HELP}"),
            }
            continue;
        }

        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(&line);
        if !trimmed.ends_with(';') {
            continue;
        }

        let sql = std::mem::take(&mut buffer);
        run_statement(conn, sql.trim(), format).await?;
    }

    Ok(())
}

async fn run_statement(conn: &Connection, sql: &str, format: OutputFormat) -> Result<()> {
    match conn.query(sql, &[]).await {
        Ok(result) => print_result(&result, format)?,
        // Errors surface inline; the console keeps going.
        Err(e) => eprintln!("error: {e}"),
    }
    Ok(())
}

/// Example query by its 1-based number.
fn example(number: &str) -> Option<&'static str> {
    let index = number.parse::<usize>().ok()?.checked_sub(1)?;
    EXAMPLES.get(index).map(|(_, sql)| *sql)
}

fn prompt(fresh: bool) {
    eprint!("{}", if fresh { "eddy> " } else { "  ... " });
    let _ = std::io::stderr().flush();
}
