//! Watch command implementation.

use anyhow::{Context, Result};
use eddy::{Connection, ResultSet};
use tokio::signal;
use tokio::sync::mpsc;

use super::{parse_params, print_result};
use crate::OutputFormat;

pub async fn run(
    conn: &Connection,
    sql: &str,
    params: &[String],
    count: u64,
    format: OutputFormat,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<eddy::Result<ResultSet>>();
    let live = conn
        .subscribe(sql, &parse_params(params), move |update| {
            let _ = tx.send(update);
        })
        .await
        .context("failed to subscribe")?;

    if format == OutputFormat::Text {
        eprintln!("Watching (delegate {}, {:?})", conn.delegate_id(), conn.leader_status());
        eprintln!("Press Ctrl+C to stop...\n");
    }
    print_result(&live.initial, format)?;

    let mut received: u64 = 0;
    let outcome = loop {
        tokio::select! {
            _ = signal::ctrl_c() => break Ok(()),
            update = rx.recv() => match update {
                Some(Ok(result)) => {
                    received += 1;
                    if format == OutputFormat::Text {
                        println!();
                    }
                    print_result(&result, format)?;
                    if count > 0 && received >= count {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(e).context("live query ended"),
                None => break Ok(()),
            },
        }
    };

    live.subscription.cancel().await;
    if format == OutputFormat::Text {
        eprintln!("\nReceived {received} update(s)");
    }
    outcome
}
